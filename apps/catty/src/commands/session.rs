//! The create → upload → connect flow shared by `catty new` and `catty run`.

use anyhow::{bail, Context, Result};

use crate::api::{ApiClient, ApiError, CreateSessionRequest};
use crate::credentials;
use crate::relay::{self, ConnectInfo};
use crate::workspace;

pub struct RunOptions {
    pub agent: String,
    pub cmd: Vec<String>,
    pub region: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub ttl_sec: u64,
    pub upload_workspace: bool,
}

pub async fn run(api: Option<String>, opts: RunOptions) -> Result<()> {
    if !credentials::is_logged_in() {
        bail!("not logged in. Please run 'catty login' first.");
    }

    let client = ApiClient::new(api);

    eprintln!("Creating session...");
    let session = match client
        .create_session(&CreateSessionRequest {
            agent: opts.agent,
            cmd: opts.cmd,
            region: opts.region,
            cpus: opts.cpus,
            memory_mb: opts.memory_mb,
            ttl_sec: opts.ttl_sec,
        })
        .await
    {
        Ok(session) => session,
        Err(err) if err.is_quota_exceeded() => return handle_quota_exceeded(&client).await,
        Err(err) => return Err(err).context("failed to create session"),
    };

    eprintln!("Session created: {}", session.label);
    eprintln!("  Reconnect with: catty connect {}", session.label);

    if opts.upload_workspace {
        eprintln!("Uploading workspace...");
        let archive = workspace::archive_current_dir().context("archive workspace")?;
        workspace::upload(
            &workspace::upload_url(&session.connect_url),
            &session.connect_token,
            &session.headers,
            archive,
        )
        .await
        .context("failed to upload workspace")?;
        eprintln!("Workspace uploaded.");
    }

    eprintln!("Connecting to {}...", session.connect_url);
    relay::run(&ConnectInfo {
        connect_url: session.connect_url,
        connect_token: session.connect_token,
        headers: session.headers,
    })
    .await
}

/// Print the upgrade banner, open checkout in the browser, and fail the
/// command without touching the executor.
async fn handle_quota_exceeded(client: &ApiClient) -> Result<()> {
    eprintln!();
    eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    eprintln!("  Free tier quota exceeded (1M tokens/month)");
    eprintln!("  Upgrade to Pro for unlimited usage.");
    eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    eprintln!();

    match client.checkout_url().await {
        Ok(url) => {
            eprintln!("Opening upgrade page in your browser...");
            if webbrowser::open(&url).is_err() {
                eprintln!("Please open this URL to upgrade:");
                eprintln!("  {url}");
            }
        }
        Err(ApiError::Api { message, .. }) => {
            eprintln!("Failed to create checkout session: {message}");
            eprintln!("Please visit https://catty.dev to upgrade.");
        }
        Err(err) => {
            eprintln!("Failed to create checkout session: {err}");
            eprintln!("Please visit https://catty.dev to upgrade.");
        }
    }

    bail!("quota exceeded")
}
