use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;

use crate::AppState;

/// Operational snapshot of the nightly pipeline.
pub async fn pipeline_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let internal = |e: anyhow::Error| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let now_epoch = Utc::now().timestamp();

    let queue_depth = state.queue.depth().map_err(internal)?;
    let dead_letters = state.queue.dead_letter_count().map_err(internal)?;
    let active_cities = state.routes.active_cities().map_err(internal)?.len();
    let live_schedules = state.routes.count_live_schedules(now_epoch).map_err(internal)?;

    Ok(Json(serde_json::json!({
        "queueDepth": queue_depth,
        "deadLetters": dead_letters,
        "activeCities": active_cities,
        "liveSchedules": live_schedules,
    })))
}
