//! Device-flow login and logout.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::api::DEFAULT_API_ADDR;
use crate::credentials::{self, Credentials};

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_uri_complete: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<TokenUser>,
    #[serde(default)]
    pending: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    email: String,
}

pub async fn login(api: Option<String>) -> Result<()> {
    if credentials::is_logged_in() {
        if let Ok(Some(creds)) = credentials::load() {
            println!("Already logged in as {}", creds.email);
        }
        println!("Run 'catty logout' to log out first");
        return Ok(());
    }

    let base_url = api.unwrap_or_else(|| DEFAULT_API_ADDR.into());
    let http = reqwest::Client::new();

    println!("Starting login...");
    let response = http
        .post(format!("{base_url}/v1/auth/device"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .context("start device authorization")?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("auth failed: {body}");
    }
    let auth: DeviceAuthResponse = response.json().await.context("parse auth response")?;

    println!();
    println!("Your confirmation code:");
    println!();
    println!("    {}", auth.user_code);
    println!();
    println!("Opening {}", auth.verification_uri_complete);
    println!();
    if webbrowser::open(&auth.verification_uri_complete).is_err() {
        println!("Please open this URL in your browser:");
        println!("  {}", auth.verification_uri_complete);
    }
    println!("Waiting for authentication...");

    let interval = Duration::from_secs(auth.interval.max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(auth.expires_in);

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(interval).await;

        let response = http
            .post(format!("{base_url}/v1/auth/device/token"))
            .json(&serde_json::json!({ "device_code": auth.device_code }))
            .send()
            .await
            .context("poll device token")?;
        let token: DeviceTokenResponse = response.json().await.context("parse token response")?;

        if token.pending {
            continue;
        }
        if let Some(error) = token.error {
            bail!("authentication failed: {error}");
        }
        if let Some(access_token) = token.access_token {
            let mut creds = Credentials {
                access_token,
                user_id: String::new(),
                email: String::new(),
                expires_at: None,
            };
            if let Some(user) = token.user {
                creds.user_id = user.id;
                creds.email = user.email;
            }
            credentials::save(&creds).context("save credentials")?;

            println!();
            println!("Logged in as {}", creds.email);
            println!("You can now run 'catty new' to start a session");
            return Ok(());
        }
    }

    bail!("authentication timed out")
}

pub fn logout() -> Result<()> {
    if !credentials::is_logged_in() {
        println!("Not logged in");
        return Ok(());
    }

    let email = credentials::load()
        .ok()
        .flatten()
        .map(|creds| creds.email)
        .unwrap_or_default();

    credentials::delete().context("remove credentials")?;

    if email.is_empty() {
        println!("Logged out");
    } else {
        println!("Logged out from {email}");
    }
    Ok(())
}
