//! `ApiError` pairs an HTTP status with a machine-readable code and an
//! `anyhow::Error`, so handlers can `?` their way through and still produce
//! the `{error, code}` JSON shape clients rely on.

use crate::admit::AdmitError;
use axum::http::StatusCode;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, error: anyhow::Error) -> Self {
        Self { status, code, error }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "BadRequest",
            anyhow::anyhow!(message.into()),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            anyhow::anyhow!(message.into()),
        )
    }
}

impl From<AdmitError> for ApiError {
    fn from(err: AdmitError) -> Self {
        let status = match &err {
            AdmitError::InvalidSignature
            | AdmitError::MalformedItem(_)
            | AdmitError::SizeMismatch => StatusCode::BAD_REQUEST,
            AdmitError::SizeExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            AdmitError::InsufficientCredit => StatusCode::PAYMENT_REQUIRED,
            AdmitError::DurabilityUnavailable | AdmitError::TransientUpstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let code = err.code();
        Self::new(status, code, anyhow::Error::from(err))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        tracing::error!(?error, "API responding with database error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            anyhow::anyhow!("database error, please retry the request"),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", error)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": format!("{:#}", self.error),
            "code": self.code,
        });
        (self.status, axum::Json(body)).into_response()
    }
}
