use anyhow::{bail, Context, Result};

use crate::api::ApiClient;

pub async fn stop(api: Option<String>, target: &str, delete: bool) -> Result<()> {
    let client = ApiClient::new(api);
    client
        .stop_session(target, delete)
        .await
        .context("failed to stop session")?;

    if delete {
        println!("Session {target} stopped and deleted");
    } else {
        println!("Session {target} stopped");
    }
    Ok(())
}

/// Hidden escape hatch: stop and delete every session the caller owns.
pub async fn stop_all(api: Option<String>, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("must pass --yes-i-mean-it to confirm");
    }

    let client = ApiClient::new(api);
    let sessions = client
        .list_sessions()
        .await
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions to stop");
        return Ok(());
    }

    println!("Stopping {} sessions...", sessions.len());
    for session in sessions {
        print!("  Stopping {}... ", session.label);
        match client.stop_session(&session.session_id, true).await {
            Ok(()) => println!("done"),
            Err(err) => println!("ERROR: {err}"),
        }
    }
    Ok(())
}
