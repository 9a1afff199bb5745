//! Unified error handling for ipintel.
//!
//! Failures inside the whois/proxy clients never reach `resolve()` callers;
//! they are caught at the resolver boundary and converted to placeholder
//! data. `IntelError` exists for the seams where propagation is correct:
//! store access, configuration loading, and the bus.

use thiserror::Error;

/// Errors that can occur inside the resolver subsystem.
#[derive(Debug, Error)]
pub enum IntelError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("config error: {0}")]
    Config(String),

    #[error("bus request timed out")]
    BusTimeout,

    #[error("no handler registered for bus request type: {0}")]
    BusNoHandler(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for resolver operations.
pub type IntelResult<T> = Result<T, IntelError>;

impl From<std::io::Error> for IntelError {
    fn from(err: std::io::Error) -> Self {
        IntelError::Internal(err.to_string())
    }
}
