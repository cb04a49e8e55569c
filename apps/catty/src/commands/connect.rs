use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use crate::api::ApiClient;
use crate::credentials;
use crate::relay::{self, ConnectInfo};

pub const INSTANCE_PIN_HEADER: &str = "fly-force-instance-id";

/// Reconnect to a running session by label (or id). The executor keeps the
/// pty alive, so this resumes the live child with no replay.
pub async fn connect(api: Option<String>, label: &str) -> Result<()> {
    if !credentials::is_logged_in() {
        bail!("not logged in. Please run 'catty login' first.");
    }

    let client = ApiClient::new(api);

    eprintln!("Looking up session {label}...");
    let session = client
        .get_session(label, true)
        .await
        .context("failed to get session")?;

    if session.status == "stopped" {
        bail!("session {} is stopped", session.label);
    }
    if let Some(state) = &session.machine_state {
        if state != "started" {
            bail!("machine is not running (state: {state})");
        }
    }
    let Some(connect_token) = session.connect_token else {
        bail!("session {} has no connect token", session.label);
    };

    eprintln!("Reconnecting to {}...", session.label);
    relay::run(&ConnectInfo {
        connect_url: session.connect_url,
        connect_token,
        headers: HashMap::from([(
            INSTANCE_PIN_HEADER.to_string(),
            session.machine_id.clone(),
        )]),
    })
    .await
}
