pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::core::runner::RunEngine;
use crate::core::schedule::ScheduleEngine;
use crate::core::script::ScriptRegistry;
use crate::core::storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: Arc<ScriptRegistry>,
    pub(crate) engine: Arc<RunEngine>,
    pub(crate) schedule: Arc<ScheduleEngine>,
    pub(crate) storage: Arc<Storage>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: Option<String>,
}

pub struct ApiServerConfig {
    pub registry: Arc<ScriptRegistry>,
    pub engine: Arc<RunEngine>,
    pub schedule: Arc<ScheduleEngine>,
    pub storage: Arc<Storage>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub api_token: Option<String>,
}

/// Bind the API listener and serve until the process exits.
pub async fn serve(config: ApiServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let state = AppState {
        registry: config.registry,
        engine: config.engine,
        schedule: config.schedule,
        storage: config.storage,
        log_tx: config.log_tx,
        api_host: config.api_host,
        api_port: config.api_port,
        api_token: config.api_token,
    };
    let app = router::build_api_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API Server running at http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)),
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream)
}
