//! Error types for tenant connection management.

use std::fmt::Display;

use thiserror::Error;

/// Result type alias for tenancy operations.
pub type TenancyResult<T> = Result<T, TenancyError>;

/// Errors surfaced by the connection manager and its collaborators.
///
/// `Clone` so that every caller joined on a single in-flight pool creation
/// receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TenancyError {
    #[error("connection error for database {database}: {message}")]
    Connection { database: String, message: String },

    #[error("tenant pool capacity exhausted ({capacity} pools)")]
    Capacity { capacity: usize },

    #[error("connection manager not initialized")]
    NotInitialized,

    #[error("connection manager is closed")]
    ManagerClosed,

    #[error("failed to provision database {database}: {message}")]
    Provisioning { database: String, message: String },

    #[error("invalid database name: {0:?}")]
    InvalidDatabaseName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("host header missing")]
    MissingHost,

    #[error("tenant not found for domain: {0}")]
    TenantNotFound(String),

    #[error("tenant registry error: {0}")]
    Registry(String),
}

impl TenancyError {
    pub(crate) fn connection(database: &str, err: impl Display) -> Self {
        Self::Connection {
            database: database.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn provisioning(database: &str, err: impl Display) -> Self {
        Self::Provisioning {
            database: database.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether the caller may retry the operation later.
    ///
    /// The manager itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Capacity { .. })
    }

    /// Whether a request failing with this error should be answered with a
    /// service-unavailable class response.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Capacity { .. }
                | Self::ManagerClosed
                | Self::Registry(_)
        )
    }
}
