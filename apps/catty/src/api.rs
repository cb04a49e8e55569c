//! HTTP client for the control plane.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::credentials;

pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:4815";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Api {
        status: StatusCode,
        error: String,
        message: String,
        upgrade_url: Option<String>,
    },
}

impl ApiError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            ApiError::Api { status, error, .. }
                if *status == StatusCode::PAYMENT_REQUIRED && error == "quota_exceeded"
        )
    }
}

#[derive(Debug, Serialize)]
pub struct CreateSessionRequest {
    pub agent: String,
    pub cmd: Vec<String>,
    pub region: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub ttl_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub label: String,
    pub machine_id: String,
    pub connect_url: String,
    pub connect_token: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub label: String,
    pub machine_id: String,
    pub connect_url: String,
    #[serde(default)]
    pub connect_token: Option<String>,
    pub region: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub machine_state: Option<String>,
}

pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_ADDR.into()),
            token: credentials::access_token(),
            http: reqwest::Client::builder()
                // Session creation waits for a machine to boot.
                .timeout(Duration::from_secs(120))
                .build()
                .expect("build http client"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(read_error(status, response).await)
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError> {
        let response = self
            .request(reqwest::Method::POST, "/v1/sessions")
            .json(request)
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/v1/sessions")
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn get_session(
        &self,
        id_or_label: &str,
        live: bool,
    ) -> Result<SessionInfo, ApiError> {
        let mut path = format!("/v1/sessions/{id_or_label}");
        if live {
            path.push_str("?live=true");
        }
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        Self::parse(response).await
    }

    pub async fn stop_session(&self, id_or_label: &str, delete: bool) -> Result<(), ApiError> {
        let mut path = format!("/v1/sessions/{id_or_label}/stop");
        if delete {
            path.push_str("?delete=true");
        }
        let response = self.request(reqwest::Method::POST, &path).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(read_error(status, response).await)
    }

    pub async fn checkout_url(&self) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct CheckoutResponse {
            checkout_url: String,
        }
        let response = self
            .request(reqwest::Method::POST, "/v1/billing/checkout")
            .send()
            .await?;
        let checkout: CheckoutResponse = Self::parse(response).await?;
        Ok(checkout.checkout_url)
    }
}

async fn read_error(status: StatusCode, response: reqwest::Response) -> ApiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        upgrade_url: Option<String>,
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) if !parsed.error.is_empty() => ApiError::Api {
            status,
            message: if parsed.message.is_empty() {
                format!("API error {status}: {}", parsed.error)
            } else {
                parsed.message
            },
            error: parsed.error,
            upgrade_url: parsed.upgrade_url,
        },
        _ => ApiError::Api {
            status,
            error: String::new(),
            message: format!("API error {status}: {body}"),
            upgrade_url: None,
        },
    }
}
