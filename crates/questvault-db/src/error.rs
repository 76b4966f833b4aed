//! Error types for the persistence layer.
//!
//! Every backend, the cache tier and the batch coordinator report
//! failures through [`StoreError`]. The variants follow the contract's
//! error taxonomy; driver errors from [`sqlx`] and [`fred`] are
//! classified on conversion so callers never match on driver types.

use questvault_types::ErrorCode;

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity class name.
        entity: &'static str,
        /// Missing key.
        key: String,
    },

    /// A uniqueness or state rule would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The input is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend could not be reached or refused the operation.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded into its entity.
    #[error("stored row is unreadable: {0}")]
    Decode(String),

    /// The operation did not finish before its deadline.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// A configuration value is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A filesystem operation (backup, snapshot) failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, key: impl core::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }

    /// Whether this is a [`StoreError::NotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Failure class for the result envelope.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            Self::Serialization(_) | Self::Decode(_) => ErrorCode::SerializationError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Config(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                key: String::new(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_owned())
            }
            sqlx::Error::Database(db) if db.is_check_violation() => {
                Self::Validation(db.message().to_owned())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Decode(err.to_string()),
            sqlx::Error::Configuration(_) => Self::Config(err.to_string()),
            _ => Self::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::BackendUnavailable(format!("migration failed: {err}"))
    }
}

impl From<fred::error::Error> for StoreError {
    fn from(err: fred::error::Error) -> Self {
        Self::BackendUnavailable(format!("cache store: {err}"))
    }
}

impl From<validator::ValidationErrors> for StoreError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout(50).is_transient());
        assert!(StoreError::BackendUnavailable(String::from("down")).is_transient());
        assert!(!StoreError::Conflict(String::from("dup")).is_transient());
        assert!(!StoreError::not_found("user", "u-1").is_transient());
    }

    #[test]
    fn envelope_codes() {
        assert_eq!(StoreError::not_found("player", "p").code(), ErrorCode::NotFound);
        assert_eq!(StoreError::Validation(String::new()).code(), ErrorCode::ValidationError);
        assert_eq!(StoreError::Timeout(1).code(), ErrorCode::Timeout);
    }

    #[test]
    fn not_found_message_names_entity_and_key() {
        let err = StoreError::not_found("team", "t-9");
        assert_eq!(err.to_string(), "team not found: t-9");
        assert!(err.is_not_found());
    }

    #[test]
    fn undecodable_rows_are_data_errors_not_outages() {
        let err = StoreError::from(sqlx::Error::ColumnDecode {
            index: String::from("level"),
            source: "expected INTEGER, found TEXT".into(),
        });
        assert!(matches!(err, StoreError::Decode(_)));
        assert!(!err.is_transient());
        assert_eq!(err.code(), ErrorCode::SerializationError);
    }

    #[test]
    fn pool_timeouts_are_unavailable() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::BackendUnavailable(_)));
    }
}
