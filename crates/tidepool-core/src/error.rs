//! Error types for driver and pool operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the transport driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Failed to establish the underlying connection.
    #[error("connection failed: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// The server rejected the protocol handshake.
    #[error("handshake failed: {message}")]
    Handshake {
        /// Error message.
        message: String,
    },

    /// The endpoint URI could not be parsed or is unusable.
    #[error("invalid endpoint: {message}")]
    InvalidEndpoint {
        /// Description of the problem.
        message: String,
    },

    /// The server rejected the supplied credentials.
    #[error("authentication rejected: {message}")]
    AuthenticationRejected {
        /// Server-reported reason.
        message: String,
    },

    /// The server answered an RPC with an application-level error.
    ///
    /// The session itself remains usable.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Numeric error code from the server.
        code: i64,
        /// Server-reported message.
        message: String,
    },

    /// The session was closed mid-operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session is not connected.
    #[error("not connected")]
    NotConnected,

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long the operation waited.
        duration: Duration,
    },

    /// Frame serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a handshake error.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create an invalid-endpoint error.
    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether the underlying session is unusable after this error.
    ///
    /// Application-level failures (`Rpc`, rejected credentials, frame
    /// encoding) leave the session healthy; transport failures do not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Rpc { .. }
                | Self::AuthenticationRejected { .. }
                | Self::InvalidEndpoint { .. }
                | Self::Json(_)
        )
    }
}

/// Errors surfaced by pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The configuration failed validation. Raised at construction only.
    #[error("invalid configuration: {message}")]
    ConfigurationInvalid {
        /// Description of the offending option.
        message: String,
    },

    /// The transport failed to produce a connection after retries.
    #[error("failed to create connection: {message}")]
    ConnectionCreateFailed {
        /// Underlying failure.
        message: String,
    },

    /// The server rejected the configured credentials. Never retried.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Server-reported reason.
        message: String,
    },

    /// No connection became available before the acquirer's deadline.
    #[error("acquire timed out after {waited:?}")]
    AcquireTimeout {
        /// How long the acquirer waited.
        waited: Duration,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// A pool is already registered under this name.
    #[error("pool {name:?} is already registered")]
    PoolExists {
        /// The contested name.
        name: String,
    },

    /// No pool is registered under this name.
    #[error("no pool registered under {name:?}")]
    UnknownPool {
        /// The name that was looked up.
        name: String,
    },
}

impl PoolError {
    /// Create a configuration error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            message: message.into(),
        }
    }

    /// Create a connection-creation error.
    pub fn create_failed(message: impl Into<String>) -> Self {
        Self::ConnectionCreateFailed {
            message: message.into(),
        }
    }
}

/// Establishment-context mapping: rejected credentials become
/// [`PoolError::AuthenticationFailed`], everything else becomes
/// [`PoolError::ConnectionCreateFailed`].
impl From<DriverError> for PoolError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::AuthenticationRejected { message } => {
                Self::AuthenticationFailed { message }
            }
            other => Self::ConnectionCreateFailed {
                message: other.to_string(),
            },
        }
    }
}
