use std::sync::Arc;

use catty_store::Store;

use crate::billing::StripeClient;
use crate::config::ApiConfig;
use crate::fly::FlyClient;
use crate::identity::{IdentityClient, TokenCache, TOKEN_CACHE_TTL};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub fly: FlyClient,
    pub identity: IdentityClient,
    pub token_cache: Arc<TokenCache>,
    pub billing: Option<Arc<BillingContext>>,
    /// Hostname clients dial for `/connect` and `/upload`.
    pub exec_host: String,
    /// Hostname baked into each machine's per-session Anthropic base URL.
    pub proxy_host: String,
    pub anthropic_key: Option<String>,
    pub api_host: String,
}

pub struct BillingContext {
    pub stripe: StripeClient,
    pub webhook_secret: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl AppState {
    pub fn new(config: &ApiConfig, store: Store) -> Self {
        let billing = config.stripe.as_ref().map(|stripe| {
            Arc::new(BillingContext {
                stripe: StripeClient::new(stripe.secret_key.clone()),
                webhook_secret: stripe.webhook_secret.clone(),
                price_id: stripe.price_id.clone(),
                success_url: format!("https://{}/billing/success", config.api_host),
                cancel_url: format!("https://{}/billing/cancel", config.api_host),
            })
        });

        Self {
            store,
            fly: FlyClient::new(
                config.fly_api_token.clone(),
                config.exec_app.clone(),
                config.fly_api_base.clone(),
            ),
            identity: IdentityClient::new(
                config.workos_client_id.clone(),
                config.workos_api_key.clone(),
            ),
            token_cache: Arc::new(TokenCache::new(TOKEN_CACHE_TTL)),
            billing,
            exec_host: config.exec_host.clone(),
            proxy_host: config.proxy_host.clone(),
            anthropic_key: config.anthropic_key.clone(),
            api_host: config.api_host.clone(),
        }
    }

    /// Where the CLI sends users who hit the free-tier ceiling.
    pub fn upgrade_url(&self) -> String {
        format!("https://{}/v1/billing/checkout", self.api_host)
    }
}
