use std::env;

use anyhow::{Context, Result};

const DEFAULT_UPSTREAM: &str = "https://api.anthropic.com";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub anthropic_key: String,
    pub upstream_base: String,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let anthropic_key =
            env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is required")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let upstream_base = env::var("ANTHROPIC_API_BASE")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM.into())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            listen_addr: env::var("CATTY_PROXY_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".into()),
            database_url,
            anthropic_key,
            upstream_base,
        })
    }
}
