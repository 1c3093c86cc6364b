//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// No live record exists for the natural key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live record already holds the natural key.
    #[error("already exists: {0}")]
    Conflict(String),

    /// The input was rejected before reaching the store.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The backing database could not complete the request.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// Stored data violated an invariant the store relies on.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        MetadataError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn image_not_found(name: &str) -> Self {
        MetadataError::NotFound(format!("image {name}"))
    }

    pub(crate) fn tag_not_found(image: &str, tag: &str) -> Self {
        MetadataError::NotFound(format!("tag {image}:{tag}"))
    }

    pub(crate) fn user_not_found(username: &str) -> Self {
        MetadataError::NotFound(format!("user {username}"))
    }

    /// True for [MetadataError::NotFound].
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

impl From<sqlx::Error> for MetadataError {
    fn from(err: sqlx::Error) -> Self {
        // Partial unique indexes enforce natural-key uniqueness among live rows,
        // so a violation here means a concurrent writer won the key.
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return MetadataError::Conflict(db.message().to_string());
            }
        }
        MetadataError::Unavailable(err)
    }
}

impl From<secret::PasswordError> for MetadataError {
    fn from(err: secret::PasswordError) -> Self {
        MetadataError::Internal(err.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_names_field() {
        let err = MetadataError::invalid("username", "must not be empty");
        assert_eq!(err.to_string(), "invalid username: must not be empty");
    }

    #[test]
    fn row_not_found_is_unavailable_not_not_found() {
        // Lookups use fetch_optional, so a RowNotFound escaping is a store fault.
        let err = MetadataError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, MetadataError::Unavailable(_)));
        assert!(!err.is_not_found());
    }
}
