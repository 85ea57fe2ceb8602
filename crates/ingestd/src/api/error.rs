//! Defines the `ApiError` type returned from API handlers: an HTTP status
//! code wrapping an `anyhow::Error`. Everything inside the request pipeline
//! is an explicit result-or-error value; the HTTP error shape exists only
//! here at the boundary.

use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::ingest::IngestError;
use crate::resolver::ResolveError;
use crate::sessions::SessionError;
use crate::tokens::AuthError;

#[derive(Debug, thiserror::Error)]
#[error("status: {status}, error: {error}")]
pub struct ApiError {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The error message chain.
    #[source]
    pub error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: anyhow::Error) -> ApiError {
        ApiError { status, error }
    }

    pub fn unauthorized(reason: impl std::fmt::Display) -> ApiError {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            anyhow::anyhow!("unauthorized: {reason}"),
        )
    }

    pub fn forbidden(reason: impl std::fmt::Display) -> ApiError {
        ApiError::new(StatusCode::FORBIDDEN, anyhow::anyhow!("{reason}"))
    }

    pub fn not_found(what: impl std::fmt::Display) -> ApiError {
        ApiError::new(StatusCode::NOT_FOUND, anyhow::anyhow!("{what} not found"))
    }

    pub fn bad_request(reason: impl std::fmt::Display) -> ApiError {
        ApiError::new(StatusCode::BAD_REQUEST, anyhow::anyhow!("{reason}"))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        let status = match error.downcast_ref::<ApiError>() {
            Some(api_error) => api_error.status,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError { status, error }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> ApiError {
        tracing::error!(?error, "API responding with a storage error");
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: anyhow::anyhow!("storage is unavailable, please retry the request"),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> ApiError {
        match error {
            AuthError::Storage(err) => err.into(),
            other => ApiError::unauthorized(other),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> ApiError {
        match error {
            ResolveError::NotFound => ApiError::not_found("dataset"),
            ResolveError::Ambiguous => ApiError::bad_request(error),
            ResolveError::Storage(err) => err.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> ApiError {
        let status = match &error {
            SessionError::NotFound => StatusCode::NOT_FOUND,
            SessionError::WrongState { .. } => StatusCode::CONFLICT,
            SessionError::ChunkHashMismatch { .. } | SessionError::OverallHashMismatch => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SessionError::ChunkOutOfRange { .. }
            | SessionError::ChunkSizeMismatch { .. }
            | SessionError::MissingChunks { .. }
            | SessionError::EmptyFile
            | SessionError::FileTooLarge { .. } => StatusCode::BAD_REQUEST,
            SessionError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, error.into())
    }
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> ApiError {
        match error {
            IngestError::NotFound => ApiError::not_found("dataset"),
            IngestError::Ambiguous => ApiError::bad_request(error),
            IngestError::Forbidden => ApiError::forbidden(error),
            IngestError::NameTaken { .. }
            | IngestError::EmptyFile
            | IngestError::UseChunked { .. }
            | IngestError::TooLarge { .. }
            | IngestError::Validation(_) => ApiError::bad_request(error),
            IngestError::Session(err) => err.into(),
            IngestError::Storage(err) => err.into(),
            IngestError::Io(err) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "status": self.status.as_u16(),
            // Alternate rendering includes nested causes.
            "error": format!("{:#}", self.error),
        });
        (self.status, axum::Json(body)).into_response()
    }
}
