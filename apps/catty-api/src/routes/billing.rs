//! Checkout and the Stripe webhook. Signature verification happens before
//! the event body is parsed; handlers are idempotent because Stripe retries
//! and replays.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use catty_store::Plan;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::billing::{
    verify_webhook_signature, CheckoutCompleted, SubscriptionObject, WebhookEvent,
};
use crate::error::ApiError;
use crate::routes::auth::AuthUser;
use crate::state::{AppState, BillingContext};

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

/// `POST` returns the checkout URL as JSON; `GET` 302-redirects straight to
/// it so the quota banner can point a browser here.
pub async fn checkout(
    State(state): State<AppState>,
    method: Method,
    AuthUser(identity): AuthUser,
) -> Result<Response, ApiError> {
    let billing = require_billing(&state)?;
    let user = state
        .store
        .get_or_create_user(&identity.id, &identity.email)
        .await?;

    let subscription = state.store.get_or_create_subscription(user.id).await?;
    let customer_id = match subscription.stripe_customer_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            let customer = billing
                .stripe
                .create_customer(&user.email, &user.id.to_string())
                .await
                .map_err(|err| ApiError::Upstream(format!("failed to create customer: {err}")))?;
            state
                .store
                .set_stripe_customer(user.id, &customer.id)
                .await?;
            info!(user = %user.id, customer = %customer.id, "created stripe customer");
            customer.id
        }
    };

    let session = billing
        .stripe
        .create_checkout_session(
            &customer_id,
            &billing.price_id,
            &user.id.to_string(),
            &billing.success_url,
            &billing.cancel_url,
        )
        .await
        .map_err(|err| ApiError::Upstream(format!("failed to create checkout session: {err}")))?;
    info!(user = %user.id, checkout = %session.id, "created checkout session");

    if method == Method::GET {
        return Ok(Redirect::to(&session.url).into_response());
    }
    Ok(Json(CheckoutResponse {
        checkout_url: session.url,
    })
    .into_response())
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let billing = require_billing(&state)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthenticated("missing stripe-signature header"))?;

    // Verify first, parse second. Anything else would let an attacker feed
    // the parser unauthenticated input.
    verify_webhook_signature(&body, signature, &billing.webhook_secret, Utc::now())
        .map_err(|err| ApiError::InvalidRequest(format!("invalid signature: {err}")))?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|err| ApiError::InvalidRequest(format!("malformed event: {err}")))?;
    info!(kind = %event.kind, "verified webhook event");

    match event.kind.as_str() {
        "checkout.session.completed" => {
            let object: CheckoutCompleted = serde_json::from_value(event.data.object)
                .map_err(|err| ApiError::InvalidRequest(format!("malformed event: {err}")))?;
            handle_checkout_completed(&state, object).await;
        }
        "customer.subscription.created" => {
            let object: SubscriptionObject = serde_json::from_value(event.data.object)
                .map_err(|err| ApiError::InvalidRequest(format!("malformed event: {err}")))?;
            handle_subscription_activated(&state, object).await;
        }
        "customer.subscription.updated" => {
            let object: SubscriptionObject = serde_json::from_value(event.data.object)
                .map_err(|err| ApiError::InvalidRequest(format!("malformed event: {err}")))?;
            handle_subscription_updated(&state, object).await;
        }
        "customer.subscription.deleted" => {
            let object: SubscriptionObject = serde_json::from_value(event.data.object)
                .map_err(|err| ApiError::InvalidRequest(format!("malformed event: {err}")))?;
            handle_subscription_deleted(&state, object).await;
        }
        // Unknown event types are acknowledged without side effects; Stripe
        // keeps retrying anything else.
        other => info!(kind = %other, "ignoring webhook event"),
    }

    Ok(StatusCode::OK)
}

/// Handler side effects are best-effort: a lookup or write failure is logged
/// and the event still acknowledged, because Stripe's retry would replay the
/// same idempotent update anyway.
async fn handle_checkout_completed(state: &AppState, object: CheckoutCompleted) {
    let (Some(customer), Some(subscription)) = (object.customer, object.subscription) else {
        warn!("checkout completed without customer or subscription id");
        return;
    };
    let user_id = match state.store.user_by_stripe_customer(&customer).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(%customer, error = %err, "no user for stripe customer");
            return;
        }
    };
    let period_start = Utc::now();
    let period_end = period_start + chrono::Duration::days(30);
    match state
        .store
        .activate_subscription(user_id, &customer, &subscription, period_start, period_end)
        .await
    {
        Ok(()) => info!(user = %user_id, "upgraded to pro via checkout"),
        Err(err) => warn!(user = %user_id, error = %err, "failed to upgrade subscription"),
    }
}

async fn handle_subscription_activated(state: &AppState, object: SubscriptionObject) {
    let Some(customer) = object.customer.clone() else {
        warn!("subscription event without customer id");
        return;
    };
    let user_id = match state.store.user_by_stripe_customer(&customer).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(%customer, error = %err, "no user for stripe customer");
            return;
        }
    };
    match state
        .store
        .activate_subscription(
            user_id,
            &customer,
            &object.id,
            object.period_start(),
            object.period_end(),
        )
        .await
    {
        Ok(()) => info!(user = %user_id, "upgraded to pro via subscription created"),
        Err(err) => warn!(user = %user_id, error = %err, "failed to upgrade subscription"),
    }
}

async fn handle_subscription_updated(state: &AppState, object: SubscriptionObject) {
    let Some(customer) = object.customer.clone() else {
        return;
    };
    let Ok(user_id) = state.store.user_by_stripe_customer(&customer).await else {
        return;
    };
    if let Err(err) = state
        .store
        .set_subscription_period(user_id, object.period_start(), object.period_end())
        .await
    {
        warn!(user = %user_id, error = %err, "failed to update subscription period");
    }
}

async fn handle_subscription_deleted(state: &AppState, object: SubscriptionObject) {
    let Some(customer) = object.customer.clone() else {
        return;
    };
    let user_id = match state.store.user_by_stripe_customer(&customer).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(%customer, error = %err, "no user for stripe customer");
            return;
        }
    };
    // Stripe ids stay on the row so a later re-subscription reuses the
    // same customer.
    match state.store.set_plan(user_id, Plan::Free).await {
        Ok(()) => info!(user = %user_id, "downgraded to free"),
        Err(err) => warn!(user = %user_id, error = %err, "failed to downgrade subscription"),
    }
}

fn require_billing(state: &AppState) -> Result<&BillingContext, ApiError> {
    state
        .billing
        .as_deref()
        .ok_or_else(|| ApiError::Upstream("billing is not configured".into()))
}

pub async fn success_page() -> Html<&'static str> {
    Html(SUCCESS_HTML)
}

pub async fn cancel_page() -> Html<&'static str> {
    Html(CANCEL_HTML)
}

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Payment Successful - Catty</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               display: flex; justify-content: center; align-items: center;
               min-height: 100vh; margin: 0; background: #f5f5f5; }
        .container { text-align: center; padding: 2rem; background: white;
                     border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); max-width: 400px; }
        h1 { color: #22c55e; margin-bottom: 1rem; }
        code { background: #f1f5f9; padding: 0.25rem 0.5rem; border-radius: 4px; font-size: 1rem; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#10003; Payment Successful!</h1>
        <p>You're now subscribed to Catty Pro.</p>
        <p>Return to your terminal and run <code>catty new</code> to start a session.</p>
    </div>
</body>
</html>"#;

const CANCEL_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Payment Cancelled - Catty</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               display: flex; justify-content: center; align-items: center;
               min-height: 100vh; margin: 0; background: #f5f5f5; }
        .container { text-align: center; padding: 2rem; background: white;
                     border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); max-width: 400px; }
        h1 { color: #64748b; margin-bottom: 1rem; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Payment Cancelled</h1>
        <p>No charges were made.</p>
        <p>Return to your terminal to continue with the free tier.</p>
    </div>
</body>
</html>"#;
