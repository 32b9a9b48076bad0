//! Error types for policy loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a policy document.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("IO error reading policy '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in policy document: {0}")]
    Parse(String),

    #[error("Duplicate rule id '{id}'")]
    DuplicateRuleId { id: String },

    #[error("Rule at index {index} has an empty id")]
    EmptyRuleId { index: usize },

    #[error("Invalid name pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown policy class '{0}'")]
    UnknownPolicyClass(String),

    #[error("Unknown approval scope '{0}'")]
    UnknownScope(String),
}

impl From<serde_yaml::Error> for PolicyError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
