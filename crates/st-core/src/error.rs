//! Core error types for sqltunnel

use serde_json::error::Category;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors raised while decoding a control command
///
/// Decode failures keep only the serde error category (and position for
/// syntax errors). serde_json quotes the offending value in its messages,
/// and that value may be a password or key.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The payload is not a JSON object
    #[error("Malformed command: {category:?} error at line {line} column {column}")]
    Malformed {
        category: Category,
        line: usize,
        column: usize,
    },

    /// The object has no `method` string
    #[error("Command has no method")]
    MissingMethod,

    /// The `method` names something the daemon does not implement
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The method is known but its fields do not match
    #[error("Invalid {method} command: {category:?} error in its fields")]
    InvalidFields { method: String, category: Category },

    /// Neither a password nor a private key was supplied
    #[error("No valid authentication method supplied")]
    NoValidAuthMethod,
}

impl CommandError {
    pub(crate) fn malformed(e: &serde_json::Error) -> Self {
        Self::Malformed {
            category: e.classify(),
            line: e.line(),
            column: e.column(),
        }
    }

    pub(crate) fn invalid_fields(method: &str, e: &serde_json::Error) -> Self {
        Self::InvalidFields {
            method: method.to_owned(),
            category: e.classify(),
        }
    }
}
