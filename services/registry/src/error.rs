//! Error types for the registry API

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use counters::CounterError;
use metadata::MetadataError;

use crate::credentials::CredentialError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No live record for the requested key
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A live record already holds the key
    #[error("already exists: {0}")]
    Conflict(String),

    /// Missing, malformed, forged or expired credentials
    #[error("unauthorized")]
    Unauthorized,

    /// The access policy refused the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed input
    #[error("invalid request: {0}")]
    Validation(String),

    /// The metadata store or counter cache could not be reached
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Anything else that is not the caller's fault
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Forbidden(_) => StatusCode::FORBIDDEN,
            RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
            RegistryError::StoreUnavailable(_) | RegistryError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::Conflict(_) => "ALREADY_EXISTS",
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::Forbidden(_) => "DENIED",
            RegistryError::Validation(_) => "INVALID_REQUEST",
            RegistryError::StoreUnavailable(_) | RegistryError::Internal(_) => "UNKNOWN",
        }
    }

    /// The message shown to clients. Server-side causes stay in the logs.
    fn public_message(&self) -> String {
        match self {
            RegistryError::StoreUnavailable(_) | RegistryError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<MetadataError> for RegistryError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => RegistryError::NotFound(what),
            MetadataError::Conflict(what) => RegistryError::Conflict(what),
            err @ MetadataError::Validation { .. } => RegistryError::Validation(err.to_string()),
            MetadataError::Unavailable(err) => RegistryError::StoreUnavailable(err.to_string()),
            MetadataError::Internal(msg) => RegistryError::Internal(msg),
        }
    }
}

impl From<CredentialError> for RegistryError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::InvalidToken | CredentialError::UnknownUser(_) => {
                RegistryError::Unauthorized
            }
            CredentialError::Signing(msg) => RegistryError::Internal(msg),
            CredentialError::Store(err) => err.into(),
        }
    }
}

impl From<CounterError> for RegistryError {
    fn from(err: CounterError) -> Self {
        RegistryError::StoreUnavailable(err.to_string())
    }
}

impl From<JsonRejection> for RegistryError {
    fn from(rejection: JsonRejection) -> Self {
        RegistryError::Validation(rejection.body_text())
    }
}

/// Error response body
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.public_message(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_errors_map_to_taxonomy() {
        let err: RegistryError = MetadataError::NotFound("image app/web".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: RegistryError = MetadataError::Conflict("user alice".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: RegistryError = MetadataError::Internal("bad row".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn credential_failures_are_unauthorized() {
        let err: RegistryError = CredentialError::InvalidToken.into();
        assert!(matches!(err, RegistryError::Unauthorized));
        let err: RegistryError = CredentialError::UnknownUser("bob".into()).into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn internal_causes_are_not_exposed() {
        let err = RegistryError::StoreUnavailable("connection refused to 10.0.0.5".into());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.error_code(), "UNKNOWN");
    }
}
