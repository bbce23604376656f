//! # Error Taxonomy
//!
//! Purpose: Separate transport failures from pool and template failures so
//! callers can tell a retryable lease problem from a failed command.
//!
//! ## Design Principles
//! 1. **Layered Errors**: `SessionError` never knows about pooling;
//!    `TemplateError` wraps it where a lease or command is involved.
//! 2. **Cause Preservation**: Wrapped failures keep the original error as
//!    their `source`.
//! 3. **Release Is Silent**: Release-path failures are logged by the pool and
//!    have no variant here.

use std::path::PathBuf;
use std::string::FromUtf8Error;
use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by a unit of work passed to the template.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for session-level calls.
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type for factory and template calls.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Failures raised by a single transport session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Store returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply type did not match the command.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Reply payload was not valid UTF-8.
    #[error("reply is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    /// Endpoint could not be resolved to a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Failures surfaced by the connection factory and the execution template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Caller violated an operation contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No session became available within the lease wait timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },
    /// The factory has not been started or was stopped.
    #[error("connection pool is not running")]
    PoolClosed,
    /// Opening a new session failed.
    #[error("connection setup failed: {source}")]
    ConnectionSetupFailed {
        #[source]
        source: SessionError,
    },
    /// The unit of work failed; `message` is the underlying failure's message.
    #[error("{message}")]
    CommandFailed {
        message: String,
        #[source]
        source: BoxError,
    },
    /// Closing pooled sessions at shutdown failed.
    #[error("pool teardown failed for {failed} session(s): {first}")]
    Teardown {
        failed: usize,
        #[source]
        first: std::io::Error,
    },
}

impl TemplateError {
    pub(crate) fn command_failed(source: BoxError) -> Self {
        TemplateError::CommandFailed {
            message: source.to_string(),
            source,
        }
    }

    /// Returns the session error behind a failed command, if there is one.
    pub fn session_error(&self) -> Option<&SessionError> {
        match self {
            TemplateError::CommandFailed { source, .. } => source.downcast_ref::<SessionError>(),
            TemplateError::ConnectionSetupFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
