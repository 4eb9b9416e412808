//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use superplane::service::is_duplicate_name;
use superplane::{Error, ErrorKind};

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

/// Errors returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid session token.
    Unauthenticated,
    /// Missing or invalid webhook signature.
    InvalidSignature(&'static str),
    /// Request could not be parsed.
    BadRequest(String),
    /// Failure from the core.
    Core(Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated | ApiError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err.kind() {
                ErrorKind::Config | ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound | ErrorKind::PermissionDenied => StatusCode::NOT_FOUND,
                ErrorKind::Conflict if is_duplicate_name(err) => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(self) -> ErrorResponse {
        match self {
            ApiError::Unauthenticated => ErrorResponse {
                code: "unauthenticated",
                message: "authentication required".into(),
            },
            ApiError::InvalidSignature(reason) => ErrorResponse {
                code: "invalid_signature",
                message: reason.into(),
            },
            ApiError::BadRequest(message) => ErrorResponse {
                code: ErrorKind::Validation.as_str(),
                message,
            },
            ApiError::Core(err) => {
                let err = err.into_public();
                if err.is_fatal() {
                    error!(error = %err, "request failed");
                    return ErrorResponse {
                        code: err.kind().as_str(),
                        message: "internal error".into(),
                    };
                }
                ErrorResponse {
                    code: err.kind().as_str(),
                    message: err.message().to_string(),
                }
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use superplane::service::duplicate_name;

    #[test]
    fn status_codes() {
        let cases = [
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ApiError::InvalidSignature("missing signature"), StatusCode::UNAUTHORIZED),
            (Error::Validation("bad".into()).into(), StatusCode::BAD_REQUEST),
            (Error::not_found("canvas").into(), StatusCode::NOT_FOUND),
            (Error::PermissionDenied("no".into()).into(), StatusCode::NOT_FOUND),
            (duplicate_name("stage").into(), StatusCode::BAD_REQUEST),
            (Error::Conflict("already approved".into()).into(), StatusCode::CONFLICT),
            (Error::Transient("db down".into()).into(), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Fatal("boom".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err:?}");
        }
    }

    #[test]
    fn denial_reads_as_not_found() {
        let body = ApiError::from(Error::PermissionDenied("user u cannot read canvas".into())).body();
        assert_eq!(body.code, "not_found");
        assert_eq!(body.message, "not found");
    }

    #[test]
    fn fatal_message_is_hidden() {
        let body = ApiError::from(Error::Fatal("row decode failed: column x".into())).body();
        assert_eq!(body.message, "internal error");
    }
}
