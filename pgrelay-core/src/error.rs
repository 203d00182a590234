//! Structured error types for pgrelay-core.
//!
//! Uses `thiserror` so the server crate can map each family onto an RPC
//! status code, while the `pgrelay` binary wraps them in `anyhow`.
use std::time::Duration;

use thiserror::Error;

/// Malformed or missing input, detected before any connection is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field is empty when it shouldn't be
    #[error("{field} must be a non-empty string")]
    Empty { field: &'static str },

    /// Field doesn't match its required grammar
    #[error("invalid {field} format: '{value}'")]
    InvalidFormat { field: &'static str, value: String },
}

/// Pool exhaustion, connection failure or query failure.
#[derive(Error, Debug)]
pub enum DbError {
    /// Every slot was checked out for the whole acquire wait bound
    #[error("connection pool exhausted: no connection became available")]
    PoolExhausted,

    /// The pool has been closed; no further connections are handed out
    #[error("connection pool is closed")]
    PoolClosed,

    /// The gateway is shutting down and refuses new subscriptions
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// A dedicated connection dropped while a subscription was live
    #[error("connection lost")]
    ConnectionLost,

    /// Closing the pool did not finish within the shutdown bound
    #[error("closing the connection pool timed out after {0:?}")]
    CloseTimedOut(Duration),

    /// Error reported by the database server; `message` is passed through verbatim
    #[error("{message}")]
    Query {
        message: String,
        code: Option<String>,
    },

    /// Transport-level failure (I/O, TLS, protocol)
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other driver failure
    #[error("database driver error: {0}")]
    Driver(String),
}

impl DbError {
    /// Whether the connection that produced this error should be destroyed
    /// rather than returned to the pool.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectionLost)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Database(db) => Self::Query {
                message: db.message().to_owned(),
                code: db.code().map(|code| code.into_owned()),
            },
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Driver(other.to_string()),
        }
    }
}

/// Failure of one Draining step. Logged and swallowed, never surfaced.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("UNLISTEN {channel} failed: {source}")]
    Unlisten {
        channel: String,
        #[source]
        source: DbError,
    },

    #[error("notification pump for {listener_id} did not stop cleanly: {reason}")]
    Detach { listener_id: String, reason: String },

    #[error("releasing dedicated connection for {listener_id} failed: {source}")]
    Release {
        listener_id: String,
        #[source]
        source: DbError,
    },
}

/// Invalid or missing process configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} environment variable is required")]
    Missing { var: &'static str },

    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Umbrella error for the two gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for database-level operations
pub type DbResult<T> = std::result::Result<T, DbError>;
