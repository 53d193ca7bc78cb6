// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for imgserv-provision
//!
//! Leaf components return these as typed results. Only the orchestrator turns
//! an [`ErrorKind`] into a fatal or degraded outcome and an exit code.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Which side of SSH authentication was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSide {
    /// Password session (sshpass)
    Password,
    /// Public key session
    Key,
}

impl fmt::Display for AuthSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthSide::Password => write!(f, "password"),
            AuthSide::Key => write!(f, "key"),
        }
    }
}

/// Coarse classification used for fatal-vs-degraded decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Bad input; fatal before any mutation, never retried
    Validation,
    /// Transient network failure; bounded retries, then degraded
    Connectivity,
    /// Credential rejected by the remote side
    Authentication(AuthSide),
    /// A dependent step was requested before its precondition held
    Precondition,
    /// External quota (certificate authority) exhausted for this run
    ExternalRateLimit,
    /// Local filesystem failure
    Io,
    /// Anything else (tool crashed, unexpected output)
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Connectivity => write!(f, "connectivity"),
            ErrorKind::Authentication(side) => write!(f, "authentication ({})", side),
            ErrorKind::Precondition => write!(f, "precondition"),
            ErrorKind::ExternalRateLimit => write!(f, "external-rate-limit"),
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Process exit codes
pub mod exit {
    pub const SUCCESS: i32 = 0;
    /// Bad input or local failure; nothing was changed or the primary is unusable
    pub const VALIDATION: i32 = 1;
    /// Edge host unusable; the primary keeps running without sync
    pub const DEGRADED: i32 = 2;
    /// DNS or certificate step failed
    pub const TLS: i32 = 3;
    pub const INTERRUPTED: i32 = 130;
}

/// Errors that can occur during provisioning
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Operator input or configuration is invalid
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Settings file could not be used
    #[error("Invalid settings: {message}")]
    InvalidSettings { message: String },

    /// Remote host could not be reached
    #[error("Cannot reach {host}: {message}")]
    Connectivity { host: String, message: String },

    /// Remote host rejected the credential
    #[error("{side} authentication rejected by {host}: {message}")]
    Authentication {
        side: AuthSide,
        host: String,
        message: String,
    },

    /// A required earlier step has not converged
    #[error("Precondition not met: {message} (try: {remediation})")]
    Precondition { message: String, remediation: String },

    /// Certificate authority quota exhausted
    #[error("Rate limited by certificate authority: {message}")]
    RateLimited { message: String },

    /// A bounded operation ran out of time
    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },

    /// A local or remote command exited unsuccessfully
    #[error("Command '{command}' failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// A required executable is not installed
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },

    /// Keypair could not be generated or encoded
    #[error("Key error at {path}: {message}")]
    Key { path: String, message: String },

    /// Another live run holds the lock
    #[error("Another provisioning run (pid {pid}) has held the lock for {age_secs} seconds")]
    AlreadyRunning { pid: u32, age_secs: u64 },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        ProvisionError::Validation {
            message: message.into(),
        }
    }

    /// Classify this error for the orchestrator
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Validation { .. }
            | ProvisionError::InvalidSettings { .. }
            | ProvisionError::AlreadyRunning { .. }
            | ProvisionError::Toml(_) => ErrorKind::Validation,
            ProvisionError::Connectivity { .. } | ProvisionError::Timeout { .. } => {
                ErrorKind::Connectivity
            }
            ProvisionError::Authentication { side, .. } => ErrorKind::Authentication(*side),
            ProvisionError::Precondition { .. } => ErrorKind::Precondition,
            ProvisionError::RateLimited { .. } => ErrorKind::ExternalRateLimit,
            ProvisionError::Io(_) => ErrorKind::Io,
            ProvisionError::CommandFailed { .. }
            | ProvisionError::CommandNotFound { .. }
            | ProvisionError::Key { .. }
            | ProvisionError::Json(_) => ErrorKind::Internal,
        }
    }
}
