//! Push notification endpoint.
//!
//! The broker delivers `{message: {data: base64(JSON)}}` where the inner JSON
//! names the mailbox that changed. The notification itself is only a nudge;
//! the queued sync job reads the real changes from the cursor.

use axum::extract::Extension;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::ApiError;
use crate::domains::sync::SyncDispatcher;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailNotification {
    email_address: String,
}

pub async fn webhook_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.verifier.verify(authorization).await {
        return Err(ApiError::unauthorized("notification rejected"));
    }

    let envelope: PushEnvelope = serde_json::from_value(body.0)
        .map_err(|_| ApiError::bad_request("malformed push envelope"))?;
    let decoded = STANDARD
        .decode(&envelope.message.data)
        .map_err(|_| ApiError::bad_request("notification data is not base64"))?;
    let notification: MailNotification = serde_json::from_slice(&decoded)
        .map_err(|_| ApiError::bad_request("notification data is not valid JSON"))?;

    let user = state
        .deps
        .store
        .find_user_by_email(&notification.email_address)
        .await?
        .ok_or_else(|| ApiError::not_found("no mailbox for notified address"))?;

    let receipt = SyncDispatcher::new(state.deps.queue.clone())
        .dispatch(user.id, false)
        .await?;
    state.deps.store.touch_watch_notification(user.id).await?;

    tracing::info!(
        user_id = %user.id,
        job_id = %receipt.job_id,
        duplicate = receipt.duplicate,
        "push notification dispatched"
    );

    Ok(Json(json!({
        "success": true,
        "job_id": receipt.job_id,
        "duplicate": receipt.duplicate,
        "mode": receipt.mode,
    })))
}

/// Liveness probe for the push endpoint registration.
pub async fn webhook_probe() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
