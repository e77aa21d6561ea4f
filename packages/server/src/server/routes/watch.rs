use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::ApiError;
use crate::domains::watch::{WatchManager, WatchStatusReport, WatchSubscription};
use crate::server::app::AppState;

fn manager(state: &AppState) -> WatchManager {
    WatchManager::new(
        state.deps.store.clone(),
        state.deps.mailbox.clone(),
        state.deps.retry,
        state.deps.settings.push_topic.clone(),
    )
}

pub async fn watch_status_handler(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<WatchStatusReport>, ApiError> {
    let report = manager(&state)
        .status(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no watch for user"))?;
    Ok(Json(report))
}

pub async fn watch_start_handler(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<WatchSubscription>, ApiError> {
    let watch = manager(&state).start(user_id).await?;
    Ok(Json(watch))
}

pub async fn watch_stop_handler(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    manager(&state).stop(user_id).await?;
    Ok(Json(json!({ "success": true })))
}
