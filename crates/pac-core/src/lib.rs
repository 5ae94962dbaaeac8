//! Pipelines-as-Code core library
//!
//! Event normalization, repository binding, `.tekton` discovery, templating,
//! matching and status formatting shared by the controller.

pub mod ai;
pub mod candidate;
pub mod cel;
pub mod crypto;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod keys;
pub mod matcher;
pub mod models;
pub mod opscomment;
pub mod providers;
pub mod redact;
pub mod resolver;
pub mod retry;
pub mod status;
pub mod template;
pub mod webhook;

pub use error::{PacError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
