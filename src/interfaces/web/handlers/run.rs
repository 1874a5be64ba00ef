use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use super::super::AppState;
use crate::core::job::RunRequest;
use crate::core::runner::RunOutcome;

/// Execute one page of a script. The caller drives the page loop: while the
/// reply carries `nextPage`, invoke again with that page and the returned
/// `data`/`exportFile`, replaying the original `input`.
pub async fn run_script_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> impl IntoResponse {
    if let Err(e) = payload.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": format!("{e}") })),
        )
            .into_response();
    }

    match state.engine.run_page(payload).await {
        Ok(RunOutcome::UnknownScript) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "unknown script" })),
        )
            .into_response(),
        Ok(RunOutcome::Failed(raw)) => (StatusCode::BAD_REQUEST, Json(raw)).into_response(),
        Ok(RunOutcome::Completed(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": format!("engine error: {e:#}") })),
        )
            .into_response(),
    }
}
