mod auth;
mod billing;
mod sessions;

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/auth/device", post(auth::start_device_auth))
        .route("/auth/device/token", post(auth::poll_device_token))
        .route(
            "/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route("/sessions/:id_or_label", get(sessions::get_session))
        .route("/sessions/:id_or_label/stop", post(sessions::stop_session))
        .route(
            "/billing/checkout",
            get(billing::checkout).post(billing::checkout),
        )
        .route("/billing/webhook", post(billing::webhook));

    Router::new()
        .nest("/v1", v1)
        .route("/billing/success", get(billing::success_page))
        .route("/billing/cancel", get(billing::cancel_page))
        .route("/healthz", get(healthz))
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
