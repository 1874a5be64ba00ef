use anyhow::Result;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::core::job::RunRequest;
use crate::core::runner::{RunEngine, RunOutcome};
use crate::core::storage::Storage;
use crate::scripts::builtin_registry;

/// Drive one script from the terminal to completion, page by page, the same
/// client-driven loop the web UI runs.
pub async fn run(args: &[String]) -> Result<()> {
    let parsed = super::parse_run_command_args(args, 2);
    if parsed.script.is_empty() {
        anyhow::bail!("--script is required");
    }

    let config = Config::load(parsed.config.as_deref().map(Path::new))?;
    let storage = Arc::new(Storage::new(&config.data_dir, config.public_url.clone()));
    let registry = Arc::new(builtin_registry(storage.clone()));
    let engine = RunEngine::new(registry, storage, None);

    let input: Map<String, Value> = parsed
        .input
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();

    let mut request = RunRequest {
        script: parsed.script.clone(),
        page: 1,
        data: None,
        input: (!input.is_empty()).then(|| Value::Object(input.clone())),
        export_file: None,
        clear: true,
    };

    loop {
        match engine.run_page(request.clone()).await? {
            RunOutcome::UnknownScript => {
                anyhow::bail!("unknown script: {}", parsed.script);
            }
            RunOutcome::Failed(raw) => {
                if let Some(output) = raw.get("output").and_then(Value::as_str) {
                    print!("{output}");
                }
                anyhow::bail!(
                    "script {} failed on page {}: {}",
                    parsed.script,
                    request.page,
                    raw.get("status").and_then(Value::as_str).unwrap_or("?")
                );
            }
            RunOutcome::Completed(reply) => {
                if !reply.output.is_empty() {
                    println!("{}", reply.output);
                }
                for (key, value) in &reply.returns {
                    println!("{key}: {value}");
                }
                let Some(next_page) = reply.next_page else {
                    if let Some(file) = reply.export_file {
                        let extension = reply.export_format.as_deref().unwrap_or("json");
                        println!("export written: {file}.{extension}");
                    }
                    return Ok(());
                };
                request = RunRequest {
                    script: parsed.script.clone(),
                    page: next_page,
                    data: reply.data.map(Value::Object),
                    input: request.input,
                    export_file: reply.export_file,
                    clear: false,
                };
            }
        }
    }
}

/// Print the registered scripts and their input fields.
pub async fn list(args: &[String]) -> Result<()> {
    let parsed = super::parse_run_command_args(args, 2);
    let config = Config::load(parsed.config.as_deref().map(Path::new))?;
    let storage = Arc::new(Storage::new(&config.data_dir, None));
    let registry = builtin_registry(storage);

    for descriptor in registry.list() {
        println!("{}  {}", descriptor.id, descriptor.title);
        for field in &descriptor.input {
            println!("    --input {}=<{}>  {}", field.name, field.kind, field.title);
        }
    }
    Ok(())
}
