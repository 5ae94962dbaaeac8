//! Git provider types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PacError;

/// Supported source forges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "gitlab")]
    GitLab,
    Gitea,
    BitbucketCloud,
    BitbucketDatacenter,
    #[serde(rename = "azuredevops")]
    AzureDevOps,
}

impl ProviderKind {
    /// Returns the provider as the string used in Repository records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Gitea => "gitea",
            ProviderKind::BitbucketCloud => "bitbucket-cloud",
            ProviderKind::BitbucketDatacenter => "bitbucket-datacenter",
            ProviderKind::AzureDevOps => "azuredevops",
        }
    }

    /// Default API endpoint when the Repository does not set `git_provider.url`.
    pub fn default_api_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::GitHub => Some("https://api.github.com"),
            ProviderKind::GitLab => Some("https://gitlab.com"),
            ProviderKind::BitbucketCloud => Some("https://api.bitbucket.org/2.0"),
            ProviderKind::AzureDevOps => Some("https://dev.azure.com"),
            ProviderKind::Gitea | ProviderKind::BitbucketDatacenter => None,
        }
    }

    /// Whether the forge can update a previously posted comment in place.
    pub fn supports_comment_update(&self) -> bool {
        matches!(
            self,
            ProviderKind::GitHub | ProviderKind::GitLab | ProviderKind::Gitea
        )
    }

    /// Whether the forge contents API lets us list nested directories.
    pub fn supports_nested_listing(&self) -> bool {
        !matches!(self, ProviderKind::AzureDevOps)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(ProviderKind::GitHub),
            "gitlab" => Ok(ProviderKind::GitLab),
            "gitea" | "forgejo" => Ok(ProviderKind::Gitea),
            "bitbucket-cloud" | "bitbucketcloud" => Ok(ProviderKind::BitbucketCloud),
            "bitbucket-datacenter" | "bitbucket-server" | "bitbucketdatacenter" => {
                Ok(ProviderKind::BitbucketDatacenter)
            }
            "azuredevops" | "azure-devops" => Ok(ProviderKind::AzureDevOps),
            _ => Err(PacError::Configuration(format!("Unknown provider type: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_round_trip_names() {
        for kind in [
            ProviderKind::GitHub,
            ProviderKind::GitLab,
            ProviderKind::Gitea,
            ProviderKind::BitbucketCloud,
            ProviderKind::BitbucketDatacenter,
            ProviderKind::AzureDevOps,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_unknown_provider() {
        assert!("sourcehut".parse::<ProviderKind>().is_err());
    }
}
