//! Device-flow endpoints and the bearer extractor used by every
//! authenticated route.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::identity::{DeviceAuthorization, DeviceTokenPoll, IdentityError, IdentityUser};
use crate::state::AppState;

/// The authenticated identity-provider user behind a bearer token.
/// Validation hits the 24 h cache first and falls back to the provider.
pub struct AuthUser(pub IdentityUser);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated("missing authorization header"))?
            .to_string();

        if let Some(user) = state.token_cache.get(&token).await {
            return Ok(AuthUser(user));
        }

        let user = state
            .identity
            .user_for_token(&token)
            .await
            .map_err(|err| match err {
                IdentityError::InvalidToken => ApiError::Unauthenticated("invalid token"),
                other => ApiError::Upstream(other.to_string()),
            })?;
        debug!(user = %user.id, "validated token against identity provider");
        state.token_cache.insert(token, user.clone()).await;
        Ok(AuthUser(user))
    }
}

pub async fn start_device_auth(State(state): State<AppState>) -> ApiResult<DeviceAuthorization> {
    let authorization = state
        .identity
        .start_device_authorization()
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    Ok(Json(authorization))
}

#[derive(Debug, Deserialize)]
pub struct DeviceTokenRequest {
    pub device_code: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceTokenResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<IdentityUser>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

pub async fn poll_device_token(
    State(state): State<AppState>,
    Json(request): Json<DeviceTokenRequest>,
) -> ApiResult<DeviceTokenResponse> {
    if request.device_code.is_empty() {
        return Err(ApiError::InvalidRequest("device_code is required".into()));
    }

    match state.identity.poll_device_token(&request.device_code).await {
        Ok(DeviceTokenPoll::Ready { access_token, user }) => {
            // Seed the validation cache so the first authenticated call
            // after login does not round-trip to the provider.
            state
                .token_cache
                .insert(access_token.clone(), user.clone())
                .await;
            Ok(Json(DeviceTokenResponse {
                access_token: Some(access_token),
                token_type: Some("Bearer"),
                user: Some(user),
                pending: false,
            }))
        }
        Ok(DeviceTokenPoll::Pending) => Ok(Json(DeviceTokenResponse {
            access_token: None,
            token_type: None,
            user: None,
            pending: true,
        })),
        Err(err) => Err(ApiError::Upstream(err.to_string())),
    }
}
