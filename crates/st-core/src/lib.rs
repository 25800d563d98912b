//! st-core: Core configuration and control-message types for sqltunnel
//!
//! This crate holds the pieces shared between the daemon and anything that
//! talks to it: the configuration file model, the JSON control protocol and
//! the log redaction applied to inbound commands.

pub mod config;
pub mod control;
pub mod error;
pub mod redact;

pub use control::{ControlCommand, ControlResponse, Credential, ResultCode};
pub use error::{CommandError, ConfigError};
