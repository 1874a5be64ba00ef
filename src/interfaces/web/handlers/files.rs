use axum::{
    Json,
    extract::{Path, Query, State},
};

use super::super::AppState;

const DEFAULT_LIMIT: usize = 10;

#[derive(serde_derive::Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// Most recent log files for a script.
pub async fn get_logs_endpoint(
    Path(script): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    list_section(&state, "logs", &script, query.limit).await
}

/// Most recent export files for a script.
pub async fn get_exports_endpoint(
    Path(script): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    list_section(&state, "exports", &script, query.limit).await
}

async fn list_section(
    state: &AppState,
    section: &str,
    script: &str,
    limit: Option<usize>,
) -> Json<serde_json::Value> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    match state.storage.list_recent(section, script, limit).await {
        Ok(entries) => {
            let files: Vec<serde_json::Value> = entries
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "name": entry.name,
                        "url": entry.url,
                    })
                })
                .collect();
            Json(serde_json::json!({ "success": true, "files": files }))
        }
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to list {section}: {e:#}")
        })),
    }
}
