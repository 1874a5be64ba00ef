use axum::{
    Json,
    extract::{Path, State},
};

use super::super::AppState;
use crate::core::schedule::ScheduleAction;

/// Current persisted schedule for a script, plus how many runner fires are
/// armed right now (at most one, by design).
pub async fn get_schedule_endpoint(
    Path(script): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    if state.registry.get(&script).is_none() {
        return Json(serde_json::json!({
            "success": false,
            "error": "Script not found"
        }));
    }

    let settings = match state.schedule.settings(&script).await {
        Ok(settings) => settings,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "error": format!("Failed to read schedule: {e:#}")
            }));
        }
    };
    let pending = state.schedule.pending_runner_count(&script).await;

    match settings {
        Some(settings) => Json(serde_json::json!({
            "success": true,
            "schedule": {
                "next": settings.next,
                "interval": settings.interval,
                "running": settings.arguments.is_some(),
            },
            "pending_runners": pending,
        })),
        None => Json(serde_json::json!({
            "success": true,
            "schedule": serde_json::Value::Null,
            "pending_runners": pending,
        })),
    }
}

#[derive(serde_derive::Deserialize)]
pub struct ScheduleControlRequest {
    action: String,
}

/// Apply a schedule control action. Unrecognized actions are a deliberate
/// no-op rather than an error.
pub async fn set_schedule_endpoint(
    Path(script): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ScheduleControlRequest>,
) -> Json<serde_json::Value> {
    let Some(action) = ScheduleAction::parse(payload.action.trim()) else {
        return Json(serde_json::json!({
            "success": true,
            "message": format!("Ignored unknown action '{}'", payload.action)
        }));
    };

    match state.schedule.apply(&script, action).await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": match action {
                ScheduleAction::Unschedule => "Schedule removed".to_string(),
                _ => format!("Scheduled {}", payload.action.trim()),
            }
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("{e:#}")
        })),
    }
}
