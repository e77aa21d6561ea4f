//! Application setup and router wiring.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::deps::EngineDeps;
use crate::scheduler::PollingScheduler;
use crate::server::routes::{
    health_handler, queue_stats_handler, sync_trigger_handler, watch_start_handler,
    watch_status_handler, watch_stop_handler, webhook_handler, webhook_probe,
};
use crate::server::verify::NotificationVerifier;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<EngineDeps>,
    pub scheduler: Arc<PollingScheduler>,
    pub verifier: Arc<NotificationVerifier>,
    /// Present when backed by Postgres; the health probe pings it.
    pub db_pool: Option<PgPool>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/mail", post(webhook_handler).get(webhook_probe))
        .route("/queues/:name/stats", get(queue_stats_handler))
        .route("/sync/trigger", post(sync_trigger_handler))
        .route("/watch/:user_id/status", get(watch_status_handler))
        .route("/watch/:user_id/start", post(watch_start_handler))
        .route("/watch/:user_id/stop", post(watch_stop_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
