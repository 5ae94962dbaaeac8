//! Domain models for the controller.

pub mod event;
pub mod pipeline_run;
pub mod provider;
pub mod repository;

pub use event::*;
pub use pipeline_run::*;
pub use provider::*;
pub use repository::*;
