//! Error types for deployctl.
//!
//! A single error enum covers the whole engine. Errors never escape a host
//! worker; they are converted into task terminal states and published as
//! events. The only error that aborts a run before any remote I/O is
//! `Config`.

use thiserror::Error;

/// Result type alias for deployctl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for deployctl.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid or malformed configuration. Fatal before the run starts.
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Remote Execution Errors
    // ========================================================================
    /// Host could not be reached (connect or auth failure).
    #[error("Host '{host}' unreachable: {message}")]
    Unreachable {
        /// Target host name
        host: String,
        /// Error message
        message: String,
    },

    /// A pre-install probe could not be executed.
    #[error("Check '{check}' failed to execute on '{host}': {message}")]
    Check {
        /// Check name
        check: String,
        /// Target host name
        host: String,
        /// Error message
        message: String,
    },

    /// An installer reported failure.
    #[error("Install of '{software}' failed on '{host}': {message}")]
    Install {
        /// Software name
        software: String,
        /// Target host name
        host: String,
        /// Error message (stderr tail when available)
        message: String,
    },

    /// The underlying automation runner failed outside any task.
    #[error("Runner error: {0}")]
    Runner(String),

    /// A remote operation exceeded its time budget.
    #[error("'{what}' timed out after {seconds} seconds")]
    Timeout {
        /// Description of the timed-out operation
        what: String,
        /// Configured timeout in seconds
        seconds: u64,
    },

    /// Cooperative cancellation was observed mid-operation.
    #[error("cancelled")]
    Cancelled,

    // ========================================================================
    // Engine Errors
    // ========================================================================
    /// No installer is registered for a software name.
    #[error("No installer registered for '{0}'")]
    UnknownInstaller(String),

    /// Unexpected programming error caught at the worker boundary.
    #[error("internal error: {0}")]
    Internal(String),

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Creates a configuration error from a list of validation messages.
    pub fn config_errors(errors: &[String]) -> Self {
        Self::Config(errors.join("; "))
    }

    /// Creates a new unreachable-host error.
    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new install error.
    pub fn install(
        software: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Install {
            software: software.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            seconds,
        }
    }

    /// Returns true if this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if this error means the host could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Unreachable { .. })
    }
}
