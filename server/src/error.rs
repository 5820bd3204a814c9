use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Classified failure of a deal operation. Each kind maps onto one HTTP
/// status; the API layer performs that translation and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum DealError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),
    #[error("bridge unavailable: {0}")]
    BridgeUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DealError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DealError::InvalidArgument(_)
            | DealError::InvalidTransition(_)
            | DealError::Conflict(_) => StatusCode::BAD_REQUEST,
            DealError::Forbidden(_) => StatusCode::FORBIDDEN,
            DealError::NotFound(_) => StatusCode::NOT_FOUND,
            DealError::ChainUnavailable(_)
            | DealError::BridgeUnavailable(_)
            | DealError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Axum-facing error: a status code plus the message rendered as
/// `{"error": "<message>"}`.
#[derive(Debug)]
pub struct AppError(pub StatusCode, pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError(StatusCode::BAD_REQUEST, anyhow::anyhow!(msg.into()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0 == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {:#}", self.1);
            return (
                self.0,
                Json(json!({ "error": "Internal server error. Please try again later." })),
            )
                .into_response();
        }
        (self.0, Json(json!({ "error": self.1.to_string() }))).into_response()
    }
}

impl From<DealError> for AppError {
    fn from(err: DealError) -> Self {
        let status = err.status_code();
        AppError(status, err.into())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            DealError::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DealError::InvalidTransition("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DealError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            DealError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DealError::Conflict("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DealError::ChainUnavailable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
