//! WorkOS-backed identity: the RFC 8628 device authorization flow plus
//! bearer validation with a 24-hour in-memory cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const WORKOS_BASE_URL: &str = "https://api.workos.com";
const DEVICE_AUTH_PATH: &str = "/user_management/authorize/device";
const TOKEN_PATH: &str = "/user_management/authenticate";
const ME_PATH: &str = "/user_management/users/me";

pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity provider error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Pass-through of the provider's device authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug)]
pub enum DeviceTokenPoll {
    Ready {
        access_token: String,
        user: IdentityUser,
    },
    /// The user has not finished the browser step yet.
    Pending,
}

#[derive(Clone)]
pub struct IdentityClient {
    client_id: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(client_id: String, api_key: String) -> Self {
        Self {
            client_id,
            api_key,
            base_url: WORKOS_BASE_URL.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("build identity http client"),
        }
    }

    pub async fn start_device_authorization(&self) -> Result<DeviceAuthorization, IdentityError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, DEVICE_AUTH_PATH))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "client_id": self.client_id }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Api { status, body });
        }
        Ok(response.json().await?)
    }

    pub async fn poll_device_token(
        &self,
        device_code: &str,
    ) -> Result<DeviceTokenPoll, IdentityError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            user: IdentityUser,
        }
        #[derive(Deserialize)]
        struct ErrorResponse {
            #[serde(default)]
            error: String,
        }

        let response = self
            .http
            .post(format!("{}{}", self.base_url, TOKEN_PATH))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "device_code": device_code,
                "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or(ErrorResponse {
                error: String::new(),
            });
            if parsed.error == "authorization_pending" {
                return Ok(DeviceTokenPoll::Pending);
            }
            return Err(IdentityError::Api { status, body });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Api { status, body });
        }

        let token: TokenResponse = response.json().await?;
        Ok(DeviceTokenPoll::Ready {
            access_token: token.access_token,
            user: token.user,
        })
    }

    /// Validate an access token by asking the provider who it belongs to.
    pub async fn user_for_token(&self, access_token: &str) -> Result<IdentityUser, IdentityError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, ME_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IdentityError::InvalidToken);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Api { status, body });
        }
        Ok(response.json().await?)
    }
}

/// Read-mostly map of validated bearer tokens, keyed by the raw token
/// string. One of the two pieces of process-wide mutable state the control
/// plane is allowed to hold.
pub struct TokenCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

struct CacheEntry {
    user: IdentityUser,
    expires_at: Instant,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, token: &str) -> Option<IdentityUser> {
        let entries = self.entries.read().await;
        entries
            .get(token)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.user.clone())
    }

    pub async fn insert(&self, token: String, user: IdentityUser) {
        let mut entries = self.entries.write().await;
        // Expired entries are dropped opportunistically on write.
        entries.retain(|_, entry| entry.expires_at > Instant::now());
        entries.insert(
            token,
            CacheEntry {
                user,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> IdentityUser {
        IdentityUser {
            id: id.into(),
            email: format!("{id}@example.test"),
            first_name: None,
            last_name: None,
        }
    }

    #[tokio::test]
    async fn cache_hits_within_ttl() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.insert("tok".into(), user("u1")).await;
        assert_eq!(cache.get("tok").await.unwrap().id, "u1");
        assert!(cache.get("other").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = TokenCache::new(Duration::from_millis(10));
        cache.insert("tok".into(), user("u1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("tok").await.is_none());
    }
}
