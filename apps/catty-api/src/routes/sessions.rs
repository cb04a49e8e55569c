//! Session CRUD: provision a machine, persist the row, stop and release.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use catty_store::{generate_label, NewSession, QuotaDecision, Session, StoreError};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::fly::{CreateMachineRequest, GuestConfig, MachineConfig, MachineService, ServicePort};
use crate::routes::auth::AuthUser;
use crate::state::AppState;

/// Routing header that pins follow-up traffic to the session's machine.
pub const INSTANCE_PIN_HEADER: &str = "fly-force-instance-id";

const MACHINE_START_TIMEOUT: Duration = Duration::from_secs(60);
const LABEL_ATTEMPTS: usize = 8;
const CONNECT_TOKEN_BYTES: usize = 32;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub ttl_sec: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub label: String,
    pub machine_id: String,
    pub connect_url: String,
    pub connect_token: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub label: String,
    pub machine_id: String,
    pub connect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_token: Option<String>,
    pub region: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_state: Option<String>,
}

impl SessionInfo {
    fn summary(session: &Session) -> Self {
        Self {
            session_id: session.id,
            label: session.label.clone(),
            machine_id: session.machine_id.clone(),
            connect_url: session.connect_url.clone(),
            connect_token: None,
            region: session.region.clone(),
            status: session.status.clone(),
            created_at: session.created_at,
            machine_state: None,
        }
    }

    fn detail(session: &Session) -> Self {
        Self {
            connect_token: Some(session.connect_token.clone()),
            ..Self::summary(session)
        }
    }
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let user = state
        .store
        .get_or_create_user(&identity.id, &identity.email)
        .await?;

    // The quota gate runs before anything is provisioned: a denied user
    // costs nothing.
    match state.store.check_quota(user.id).await? {
        QuotaDecision::Allowed { .. } => {}
        QuotaDecision::Denied => {
            return Err(ApiError::QuotaExceeded {
                upgrade_url: state.upgrade_url(),
            });
        }
    }

    let connect_token = generate_connect_token();
    let label = pick_unused_label(&state).await?;

    let region = match request.region.as_deref() {
        None | Some("") | Some("auto") => "iad".to_string(),
        Some(region) => region.to_string(),
    };
    let cpus = request.cpus.unwrap_or(1).max(1);
    let memory_mb = request.memory_mb.unwrap_or(1024).max(256);
    let command = request
        .cmd
        .filter(|cmd| !cmd.is_empty())
        .unwrap_or_else(|| vec!["/bin/sh".to_string()]);

    let image = state
        .fly
        .current_image()
        .await
        .map_err(|err| ApiError::Upstream(format!("failed to resolve executor image: {err}")))?;

    let mut env = HashMap::from([
        ("CONNECT_TOKEN".to_string(), connect_token.clone()),
        ("CATTY_CMD".to_string(), command.join(" ")),
    ]);
    if let Some(key) = &state.anthropic_key {
        env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        // Every model-provider call from the machine routes through the
        // metering proxy; the label in the path attributes it.
        env.insert(
            "ANTHROPIC_BASE_URL".to_string(),
            format!("https://{}/s/{}", state.proxy_host, label),
        );
    }

    let machine_request = CreateMachineRequest {
        name: None,
        region: Some(region),
        config: MachineConfig {
            image,
            env,
            services: vec![MachineService {
                protocol: "tcp".into(),
                internal_port: 8080,
                ports: vec![
                    ServicePort {
                        port: 443,
                        handlers: vec!["tls".into(), "http".into()],
                    },
                    ServicePort {
                        port: 80,
                        handlers: vec!["http".into()],
                    },
                ],
            }],
            guest: Some(GuestConfig {
                cpus,
                memory_mb,
                cpu_kind: "shared".into(),
            }),
            metadata: HashMap::from([
                ("project".to_string(), "catty".to_string()),
                ("label".to_string(), label.clone()),
                ("owner".to_string(), user.email.clone()),
                (
                    "agent".to_string(),
                    request.agent.unwrap_or_else(|| "custom".into()),
                ),
                (
                    "ttl_sec".to_string(),
                    request.ttl_sec.unwrap_or(7200).to_string(),
                ),
            ]),
        },
    };

    let machine = state
        .fly
        .create_machine(&machine_request)
        .await
        .map_err(|err| ApiError::Upstream(format!("failed to create machine: {err}")))?;

    if let Err(err) = state
        .fly
        .wait_machine(&machine.id, "started", MACHINE_START_TIMEOUT)
        .await
    {
        warn!(machine = %machine.id, error = %err, "machine failed to start, reclaiming");
        if let Err(cleanup) = state.fly.delete_machine(&machine.id, true).await {
            warn!(machine = %machine.id, error = %cleanup, "cleanup delete failed");
        }
        return Err(if err.is_timeout() {
            ApiError::Timeout("machine failed to reach started state")
        } else {
            ApiError::Upstream(format!("machine failed to start: {err}"))
        });
    }

    let connect_url = format!("wss://{}/connect", state.exec_host);

    // The machine is live from here on; a persistence failure is logged and
    // the connection info is still returned. The user's time beats strict
    // consistency.
    let new_session = NewSession {
        user_id: user.id,
        machine_id: machine.id.clone(),
        label: label.clone(),
        connect_token: connect_token.clone(),
        connect_url: connect_url.clone(),
        region: machine.region.clone(),
    };
    let session_id = match state.store.create_session(&new_session).await {
        Ok(session) => {
            info!(session = %session.id, label = %session.label, machine = %machine.id, "session created");
            session.id.to_string()
        }
        Err(err) => {
            warn!(error = %err, label = %label, "failed to persist session row");
            String::new()
        }
    };

    Ok(Json(CreateSessionResponse {
        session_id,
        label,
        machine_id: machine.id.clone(),
        connect_url,
        connect_token,
        headers: HashMap::from([(INSTANCE_PIN_HEADER.to_string(), machine.id)]),
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetSessionQuery {
    #[serde(default)]
    pub live: bool,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<Vec<SessionInfo>> {
    let user = state
        .store
        .get_or_create_user(&identity.id, &identity.email)
        .await?;
    let sessions = state.store.list_sessions(user.id).await?;
    Ok(Json(sessions.iter().map(SessionInfo::summary).collect()))
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id_or_label): Path<String>,
    Query(query): Query<GetSessionQuery>,
) -> ApiResult<SessionInfo> {
    let user = state
        .store
        .get_or_create_user(&identity.id, &identity.email)
        .await?;
    let session = resolve_session(&state, user.id, &id_or_label).await?;

    let mut info = SessionInfo::detail(&session);
    if query.live {
        match state.fly.get_machine(&session.machine_id).await {
            Ok(machine) => info.machine_state = Some(machine.state),
            Err(err) => warn!(machine = %session.machine_id, error = %err, "live state fetch failed"),
        }
    }
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct StopSessionQuery {
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub status: &'static str,
}

pub async fn stop_session(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id_or_label): Path<String>,
    Query(query): Query<StopSessionQuery>,
) -> ApiResult<StopSessionResponse> {
    let user = state
        .store
        .get_or_create_user(&identity.id, &identity.email)
        .await?;
    let session = resolve_session(&state, user.id, &id_or_label).await?;

    state
        .fly
        .stop_machine(&session.machine_id)
        .await
        .map_err(|err| ApiError::Upstream(format!("failed to stop machine: {err}")))?;

    if query.delete {
        state
            .fly
            .delete_machine(&session.machine_id, false)
            .await
            .map_err(|err| ApiError::Upstream(format!("failed to delete machine: {err}")))?;
        if let Err(err) = state.store.delete_session(session.id).await {
            warn!(session = %session.id, error = %err, "failed to delete session row");
        }
    } else if let Err(err) = state.store.mark_session_stopped(session.id).await {
        warn!(session = %session.id, error = %err, "failed to mark session stopped");
    }

    info!(session = %session.id, label = %session.label, delete = query.delete, "session stopped");
    Ok(Json(StopSessionResponse { status: "stopped" }))
}

/// Look up by id first, then by label within the caller's sessions. A row
/// owned by someone else reports not-found, never forbidden, so the label
/// namespace leaks nothing.
async fn resolve_session(
    state: &AppState,
    user_id: Uuid,
    id_or_label: &str,
) -> Result<Session, ApiError> {
    if let Ok(id) = Uuid::parse_str(id_or_label) {
        match state.store.session_by_id(id).await {
            Ok(session) if session.user_id == user_id => return Ok(session),
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
    }
    match state.store.session_by_label(user_id, id_or_label).await {
        Ok(session) => Ok(session),
        Err(StoreError::NotFound) => Err(ApiError::NotFound),
        Err(err) => Err(err.into()),
    }
}

fn generate_connect_token() -> String {
    let mut bytes = [0u8; CONNECT_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a label no live session is using; collisions retry with fresh
/// randomness, bounded so a pathological namespace cannot loop forever.
async fn pick_unused_label(state: &AppState) -> Result<String, ApiError> {
    for _ in 0..LABEL_ATTEMPTS {
        let candidate = generate_label();
        match state.store.live_session_by_label(&candidate).await {
            Err(StoreError::NotFound) => return Ok(candidate),
            Ok(_) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(ApiError::Internal(
        "could not generate an unused session label".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_tokens_are_long_enough_and_url_safe() {
        let token = generate_connect_token();
        let decoded = URL_SAFE_NO_PAD.decode(&token).expect("base64url");
        assert_eq!(decoded.len(), CONNECT_TOKEN_BYTES);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn connect_tokens_do_not_repeat() {
        let a = generate_connect_token();
        let b = generate_connect_token();
        assert_ne!(a, b);
    }
}
