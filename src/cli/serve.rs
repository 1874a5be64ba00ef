use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::core::runner::RunEngine;
use crate::core::schedule::ScheduleEngine;
use crate::core::storage::Storage;
use crate::interfaces::web::{self, ApiServerConfig};
use crate::logging;
use crate::scripts::builtin_registry;

/// Boot the full service: storage, registry, both engines, persisted
/// schedule restore, timer backend, and the API listener.
pub async fn run(args: &[String]) -> Result<()> {
    let (_, _, config_path) = super::parse_serve_flags(args, 2, String::new(), 0);
    let config = Config::load(config_path.as_deref().map(Path::new))?;
    let (api_host, api_port, _) =
        super::parse_serve_flags(args, 2, config.api_host.clone(), config.api_port);

    let (log_tx, _) = tokio::sync::broadcast::channel(256);
    logging::init(log_tx.clone());

    let storage = Arc::new(Storage::new(&config.data_dir, config.public_url.clone()));
    let registry = Arc::new(builtin_registry(storage.clone()));
    info!("Loaded {} scripts", registry.len());

    let engine = Arc::new(RunEngine::new(
        registry.clone(),
        storage.clone(),
        Some(log_tx.clone()),
    ));
    let schedule = ScheduleEngine::new(engine.clone()).await?;
    schedule.restore().await?;
    schedule.start().await?;

    web::serve(ApiServerConfig {
        registry,
        engine,
        schedule,
        storage,
        log_tx,
        api_host,
        api_port,
        api_token: config.api_token.clone(),
    })
    .await
}
