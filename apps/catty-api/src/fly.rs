//! Client for the Fly.io Machines API, the compute provisioner behind every
//! session. Create/wait/stop/delete of one machine per session, plus image
//! discovery so new machines track the current executor deployment.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.machines.dev";

#[derive(Debug, thiserror::Error)]
pub enum FlyError {
    #[error("machines api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("machines api error {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no machines found with an image config")]
    NoImage,
}

impl FlyError {
    pub fn is_timeout(&self) -> bool {
        match self {
            FlyError::Http(err) => err.is_timeout(),
            FlyError::Api { status, .. } => *status == reqwest::StatusCode::REQUEST_TIMEOUT,
            FlyError::NoImage => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<MachineService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineService {
    pub protocol: String,
    pub internal_port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub memory_mb: u32,
    pub cpu_kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMachineRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub config: Option<MachineConfig>,
}

#[derive(Clone)]
pub struct FlyClient {
    base_url: String,
    app_name: String,
    token: String,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: String, app_name: String, base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            app_name,
            token,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("build machines http client"),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, FlyError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "machines api call");
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlyError::Api { status, body });
        }
        Ok(response.json().await?)
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<(), FlyError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "machines api call");
        let response = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlyError::Api { status, body });
        }
        Ok(())
    }

    pub async fn create_machine(&self, req: &CreateMachineRequest) -> Result<Machine, FlyError> {
        let path = format!("/v1/apps/{}/machines", self.app_name);
        self.request(reqwest::Method::POST, &path, Some(req)).await
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Machine, FlyError> {
        let path = format!("/v1/apps/{}/machines/{}", self.app_name, machine_id);
        self.request::<Machine>(reqwest::Method::GET, &path, None::<&()>)
            .await
    }

    /// Block until the machine reaches `state`, bounded by `timeout`.
    pub async fn wait_machine(
        &self,
        machine_id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<(), FlyError> {
        let path = format!(
            "/v1/apps/{}/machines/{}/wait?state={}&timeout={}",
            self.app_name,
            machine_id,
            state,
            timeout.as_secs()
        );
        self.execute(reqwest::Method::GET, &path).await
    }

    pub async fn stop_machine(&self, machine_id: &str) -> Result<(), FlyError> {
        let path = format!("/v1/apps/{}/machines/{}/stop", self.app_name, machine_id);
        self.execute(reqwest::Method::POST, &path).await
    }

    pub async fn delete_machine(&self, machine_id: &str, force: bool) -> Result<(), FlyError> {
        let mut path = format!("/v1/apps/{}/machines/{}", self.app_name, machine_id);
        if force {
            path.push_str("?force=true");
        }
        self.execute(reqwest::Method::DELETE, &path).await
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>, FlyError> {
        let path = format!("/v1/apps/{}/machines", self.app_name);
        self.request(reqwest::Method::GET, &path, None::<&()>).await
    }

    /// Image reference for new executor machines, taken from an existing
    /// machine in the app. Machines deployed by `fly deploy` (process group
    /// "app") are preferred so session machines track the current release.
    pub async fn current_image(&self) -> Result<String, FlyError> {
        let machines = self.list_machines().await?;

        for machine in &machines {
            if let Some(config) = &machine.config {
                if config.metadata.get("fly_process_group").map(String::as_str) == Some("app")
                    && !config.image.is_empty()
                {
                    return Ok(config.image.clone());
                }
            }
        }
        for machine in &machines {
            if let Some(config) = &machine.config {
                if !config.image.is_empty() {
                    return Ok(config.image.clone());
                }
            }
        }
        Err(FlyError::NoImage)
    }
}
