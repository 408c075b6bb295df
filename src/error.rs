//! Error types for the ember store

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ember store
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tenant partition could not be opened or migrated.
    ///
    /// Fatal for that tenant only; other partitions are unaffected.
    #[error("tenant partition error for '{tenant}': {reason}")]
    TenantResolution {
        /// Tenant whose partition failed
        tenant: String,
        /// What went wrong
        reason: String,
    },

    /// Embedding provider call failed
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Database error (pool, connection, or engine level)
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error is a `SQLite` unique-constraint violation.
    ///
    /// Shared knowledge items are expected to collide across tenants, so
    /// insert paths use this to decide whether to swallow the failure.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
