/// Unified error handling for repsnap
///
/// Every failure of a backup run is one of the kinds below. Library code
/// returns them as values; only the binary turns a terminal error into a
/// process exit code.

use std::fmt;
use std::io;
use thiserror::Error;

/// The syntax every connection string must follow, repeated in format errors
pub const CONNECTION_STRING_SYNTAX: &str = "mongodb://<username>:<password>@<host1>[:<port1>][,<hostN>[:<portN>]]*/<defaultDatabase>[?<key1>=<value1>[&<keyN>=<valueN>]*]";

/// Main error type for backup runs
#[derive(Debug, Error)]
pub enum BackupError {
    /// Connection string failed syntax validation
    #[error("Invalid connection string: {message}")]
    Format { message: String },

    /// No primary could be discovered
    #[error("Topology error: {message}")]
    Topology { message: String },

    /// No member can be used as a backup target
    #[error("Availability error: {message}")]
    Availability { message: String },

    /// The fsync lock could not be acquired on the target
    #[error("Lock error on {target}: {message}")]
    Lock { target: String, message: String },

    /// The external snapshot collaborator reported failure
    #[error("Snapshot of {target} failed (exit code {exit_code:?})")]
    Snapshot {
        target: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Transport or driver fault
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The unlock step failed; the target may still be locked
    #[error("Unlock error on {target}: {message}. The node may still be fsync-locked")]
    Unlock { target: String, message: String },

    /// Another run already holds the guard for this target
    #[error("Another backup run is already targeting {target}")]
    Busy { target: String },

    /// A shutdown signal arrived while the snapshot was running
    #[error("Interrupted while {phase}")]
    Interrupted { phase: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local I/O errors (run guard, snapshot process spawning)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for backup operations
pub type BackupResult<T> = Result<T, BackupError>;

impl From<mongodb::error::Error> for BackupError {
    fn from(err: mongodb::error::Error) -> Self {
        BackupError::Connection {
            message: err.to_string(),
        }
    }
}

/// Convenience methods for creating specific error types
impl BackupError {
    /// Create a format error; the message always ends with the expected syntax
    pub fn format<S: Into<String>>(message: S) -> Self {
        BackupError::Format {
            message: format!(
                "{}. Expected syntax: {}",
                message.into(),
                CONNECTION_STRING_SYNTAX
            ),
        }
    }

    pub fn topology<S: Into<String>>(message: S) -> Self {
        BackupError::Topology {
            message: message.into(),
        }
    }

    pub fn availability<S: Into<String>>(message: S) -> Self {
        BackupError::Availability {
            message: message.into(),
        }
    }

    pub fn lock<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        BackupError::Lock {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        BackupError::Connection {
            message: message.into(),
        }
    }

    pub fn unlock<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        BackupError::Unlock {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn interrupted<S: Into<String>>(phase: S) -> Self {
        BackupError::Interrupted {
            phase: phase.into(),
        }
    }

    /// Process exit code reported by the binary for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Format { .. } => 3,
            BackupError::Topology { .. } => 4,
            BackupError::Availability { .. } => 5,
            BackupError::Lock { .. } => 6,
            BackupError::Snapshot { .. } => 7,
            BackupError::Connection { .. } => 8,
            BackupError::Unlock { .. } => 9,
            BackupError::Busy { .. } => 10,
            BackupError::Interrupted { .. } => 11,
            BackupError::Config(_) => 12,
            BackupError::Io(_) => 13,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // a lock may have been left behind
            BackupError::Unlock { .. } => ErrorSeverity::Critical,
            BackupError::Busy { .. } => ErrorSeverity::Warning,
            BackupError::Interrupted { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Operator action required (the target node may still be locked)
    Critical,
    /// The run failed
    Error,
    /// The run did not happen or was cut short on request
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}
