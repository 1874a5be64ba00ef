use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

/// Bearer-token gate for the API. With no token configured, open access is
/// allowed only on loopback binds; exposing the service elsewhere requires
/// a configured token.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token else {
        let is_loopback = state.api_host == "127.0.0.1"
            || state.api_host == "::1"
            || state.api_host == "localhost";
        if is_loopback {
            return next.run(req).await;
        }
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "No API token configured. Set api_token before exposing on a non-loopback address."
            })),
        )
            .into_response();
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid API token" })),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Missing or invalid Authorization header. Use: Bearer <token>" })),
        )
            .into_response(),
    }
}
