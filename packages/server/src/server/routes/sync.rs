use axum::extract::Extension;
use axum::Json;

use crate::common::ApiError;
use crate::scheduler::SweepReport;
use crate::server::app::AppState;

/// Run one scheduler sweep on demand.
pub async fn sync_trigger_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state.scheduler.trigger_check().await?;
    Ok(Json(report))
}
