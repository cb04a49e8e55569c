//! Executor HTTP surface: `/healthz`, one-shot `/upload`, and the `/connect`
//! WebSocket upgrade. Upload and connect both require the capability token.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{ExecConfig, MAX_UPLOAD_BYTES};
use crate::pty::PtySession;
use crate::{relay, workspace};

#[derive(Clone)]
pub struct ExecState {
    config: Arc<ExecConfig>,
    shared: Arc<Mutex<Shared>>,
}

/// The only process-wide mutable state: the memoized pty and the
/// workspace-ready flag. The mutex is released before any blocking I/O.
#[derive(Default)]
struct Shared {
    pty: Option<Arc<PtySession>>,
    workspace_ready: bool,
}

impl ExecState {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Constant-time bearer check. With no token configured (local testing)
    /// every caller is accepted.
    fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.config.connect_token.as_deref() else {
            return true;
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token);
        match presented {
            Some(token) => token.as_bytes().ct_eq(expected.as_bytes()).into(),
            None => false,
        }
    }

    async fn get_or_spawn_pty(&self) -> anyhow::Result<Arc<PtySession>> {
        let mut shared = self.shared.lock().await;
        if let Some(pty) = &shared.pty {
            return Ok(pty.clone());
        }
        let cwd: PathBuf = if shared.workspace_ready {
            self.config.workspace_dir.clone()
        } else {
            PathBuf::from("/")
        };
        info!(command = ?self.config.command, cwd = %cwd.display(), "spawning pty child");
        let pty = PtySession::spawn(&self.config.command, &cwd)?;
        shared.pty = Some(pty.clone());
        Ok(pty)
    }
}

fn bearer_token(value: &str) -> Option<String> {
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.to_string())
    } else {
        None
    }
}

pub fn router(state: ExecState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload", post(handle_upload))
        .route("/connect", get(handle_connect))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn handle_upload(
    State(state): State<ExecState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if !state.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    {
        let shared = state.shared.lock().await;
        if shared.workspace_ready {
            return (StatusCode::CONFLICT, "workspace already uploaded").into_response();
        }
    }

    // Spool the archive to disk first; extraction wants random access and
    // the size cap must trip before any entry is written.
    let spool = match tokio::task::spawn_blocking(tempfile::NamedTempFile::new).await {
        Ok(Ok(file)) => file,
        _ => return (StatusCode::INTERNAL_SERVER_ERROR, "spool failed").into_response(),
    };
    let spool_path = spool.path().to_path_buf();
    let mut out = match tokio::fs::File::create(&spool_path).await {
        Ok(file) => file,
        Err(err) => {
            error!(error = %err, "open spool file");
            return (StatusCode::INTERNAL_SERVER_ERROR, "spool failed").into_response();
        }
    };

    let mut received: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(error = %err, "upload body aborted");
                return (StatusCode::BAD_REQUEST, "upload aborted").into_response();
            }
        };
        received += chunk.len() as u64;
        if received > MAX_UPLOAD_BYTES {
            return (StatusCode::PAYLOAD_TOO_LARGE, "archive exceeds 100 MiB").into_response();
        }
        if let Err(err) = out.write_all(&chunk).await {
            error!(error = %err, "write spool file");
            return (StatusCode::INTERNAL_SERVER_ERROR, "spool failed").into_response();
        }
    }
    if let Err(err) = out.flush().await {
        error!(error = %err, "flush spool file");
        return (StatusCode::INTERNAL_SERVER_ERROR, "spool failed").into_response();
    }

    info!(bytes = received, "received workspace upload");

    let root = state.config.workspace_dir.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        let result = workspace::extract_archive(&spool_path, &root);
        drop(spool);
        result
    })
    .await;

    match extracted {
        Ok(Ok(())) => {
            let mut shared = state.shared.lock().await;
            shared.workspace_ready = true;
            info!(dir = %state.config.workspace_dir.display(), "workspace extracted");
            (StatusCode::OK, "ok").into_response()
        }
        Ok(Err(err)) => {
            error!(error = %err, "workspace extraction failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to extract workspace: {err}"),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "extraction task panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "extraction failed").into_response()
        }
    }
}

async fn handle_connect(
    State(state): State<ExecState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let pty = match state.get_or_spawn_pty().await {
        Ok(pty) => pty,
        Err(err) => {
            error!(error = %err, "pty spawn failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create pty").into_response();
        }
    };

    info!("client connected, starting relay");
    ws.on_upgrade(move |socket| relay::run(socket, pty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;

    fn state_with_token(token: Option<&str>) -> ExecState {
        ExecState::new(ExecConfig {
            listen_addr: "127.0.0.1:0".into(),
            connect_token: token.map(str::to_string),
            command: vec!["/bin/sh".into()],
            workspace_dir: "/workspace".into(),
        })
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn bearer_extraction_is_scheme_insensitive() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc".into()));
        assert_eq!(bearer_token("bearer abc"), Some("abc".into()));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn matching_token_is_accepted() {
        let state = state_with_token(Some("sekrit"));
        assert!(state.authorize(&headers_with_auth("Bearer sekrit")));
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let state = state_with_token(Some("sekrit"));
        assert!(!state.authorize(&headers_with_auth("Bearer wrong")));
        assert!(!state.authorize(&headers_with_auth("Bearer sekri")));
        assert!(!state.authorize(&HeaderMap::new()));
    }

    #[test]
    fn unset_token_accepts_everyone() {
        let state = state_with_token(None);
        assert!(state.authorize(&HeaderMap::new()));
    }
}
