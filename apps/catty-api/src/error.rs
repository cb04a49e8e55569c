//! Error kinds for the control-plane API and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use catty_store::StoreError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Unauthenticated(&'static str),
    /// Also covers rows owned by someone else: a caller must not be able to
    /// distinguish "not yours" from "does not exist".
    #[error("session not found")]
    NotFound,
    #[error("{0}")]
    Conflict(&'static str),
    #[error("free tier quota exceeded")]
    QuotaExceeded { upgrade_url: String },
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upgrade_url: Option<String>,
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::Upstream(_) => "upstream_unavailable",
            ApiError::Timeout(_) => "timeout",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::QuotaExceeded { .. } => {
                "Free tier quota exceeded (1M tokens/month). Upgrade to Pro for unlimited usage."
                    .to_string()
            }
            other => other.to_string(),
        };
        let upgrade_url = match &self {
            ApiError::QuotaExceeded { upgrade_url } => Some(upgrade_url.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind(),
            message,
            upgrade_url,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict => ApiError::Conflict("row already exists"),
            StoreError::Database(err) => ApiError::Internal(format!("database error: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_documented_statuses() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                ApiError::InvalidRequest("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Unauthenticated("no token"),
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError::NotFound, StatusCode::NOT_FOUND),
            (ApiError::Conflict("dup"), StatusCode::CONFLICT),
            (
                ApiError::QuotaExceeded {
                    upgrade_url: "https://example.test".into(),
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (ApiError::Upstream("fly".into()), StatusCode::BAD_GATEWAY),
            (
                ApiError::Timeout("machine start"),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ApiError::Internal("oops".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err.kind());
        }
    }

    #[test]
    fn foreign_rows_collapse_into_not_found() {
        assert_eq!(ApiError::from(StoreError::NotFound).kind(), "not_found");
    }
}
