use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;

use crate::AppState;
use crate::models::route::ConfirmUserRequest;
use crate::timemath::iso_utc;

/// Identity-provider post-confirmation hook. Idempotent: a duplicate hook
/// for an existing profile is logged and ignored, never overwritten.
pub async fn confirm_user(
    State(state): State<AppState>,
    Json(req): Json<ConfirmUserRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.user_id.trim().is_empty() || req.email.trim().is_empty() {
        // An empty identity must block confirmation upstream.
        return Err((
            StatusCode::BAD_REQUEST,
            "userId and email are required".to_string(),
        ));
    }

    let created = state
        .routes
        .create_profile(&req.user_id, &req.email, &iso_utc(Utc::now()))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if created {
        tracing::info!("profile created for {}", req.user_id);
    } else {
        tracing::warn!("duplicate post-confirmation hook for {}, ignored", req.user_id);
    }

    Ok(Json(serde_json::json!({ "userId": req.user_id })))
}
