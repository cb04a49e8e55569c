use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_addr: String,
    pub database_url: String,
    /// Fly Machines API token.
    pub fly_api_token: String,
    pub fly_api_base: Option<String>,
    /// Fly app that executor machines are created in.
    pub exec_app: String,
    /// Hostname clients connect to; defaults to `{exec_app}.fly.dev`.
    pub exec_host: String,
    /// Hostname of the metering proxy, baked into each machine's
    /// `ANTHROPIC_BASE_URL` as `https://{proxy_host}/s/{label}`.
    pub proxy_host: String,
    /// Upstream key handed to each machine; calls route through the proxy.
    pub anthropic_key: Option<String>,
    pub workos_client_id: String,
    pub workos_api_key: String,
    /// Billing is optional: absent Stripe config disables the checkout and
    /// webhook routes, everything else keeps working on the free tier.
    pub stripe: Option<StripeConfig>,
    /// Public hostname of this API, used for billing redirect pages and the
    /// upgrade hint in quota errors.
    pub api_host: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_id: String,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let exec_app = env::var("CATTY_EXEC_APP").context("CATTY_EXEC_APP is required")?;
        let exec_host =
            env::var("CATTY_EXEC_HOST").unwrap_or_else(|_| format!("{exec_app}.fly.dev"));

        let stripe = match env::var("STRIPE_SECRET_KEY") {
            Ok(secret_key) if !secret_key.is_empty() => Some(StripeConfig {
                secret_key,
                webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                    .context("STRIPE_WEBHOOK_SECRET is required when Stripe is configured")?,
                price_id: env::var("STRIPE_PRICE_ID")
                    .context("STRIPE_PRICE_ID is required when Stripe is configured")?,
            }),
            _ => None,
        };

        Ok(Self {
            listen_addr: env::var("CATTY_API_ADDR").unwrap_or_else(|_| "127.0.0.1:4815".into()),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            fly_api_token: env::var("FLY_API_TOKEN").context("FLY_API_TOKEN is required")?,
            fly_api_base: env::var("FLY_MACHINES_API_BASE").ok(),
            exec_app,
            exec_host,
            proxy_host: env::var("CATTY_PROXY_HOST")
                .unwrap_or_else(|_| "proxy.catty.dev".into()),
            anthropic_key: env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()),
            workos_client_id: env::var("WORKOS_CLIENT_ID")
                .context("WORKOS_CLIENT_ID is required")?,
            workos_api_key: env::var("WORKOS_API_KEY").context("WORKOS_API_KEY is required")?,
            stripe,
            api_host: env::var("CATTY_API_HOST").unwrap_or_else(|_| "api.catty.dev".into()),
        })
    }
}
