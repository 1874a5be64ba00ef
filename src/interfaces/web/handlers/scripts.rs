use axum::{Json, extract::State};

use super::super::AppState;

/// List the runnable scripts with their declared input fields.
pub async fn get_scripts_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let scripts: Vec<serde_json::Value> = state
        .registry
        .list()
        .map(|descriptor| {
            serde_json::json!({
                "id": descriptor.id,
                "title": descriptor.title,
                "input": descriptor.input,
            })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "scripts": scripts
    }))
}
