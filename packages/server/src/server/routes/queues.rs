use axum::extract::{Extension, Path};
use axum::Json;

use crate::common::ApiError;
use crate::kernel::jobs::{QueueCounts, QueueName};
use crate::server::app::AppState;

pub async fn queue_stats_handler(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueCounts>, ApiError> {
    let queue = QueueName::parse(&name)
        .ok_or_else(|| ApiError::not_found(format!("unknown queue: {name}")))?;
    let counts = state.deps.queue.stats(queue).await?;
    Ok(Json(counts))
}
