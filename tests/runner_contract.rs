use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crank::core::job::{JobArguments, RunRequest};
use crank::core::runner::{RunEngine, RunOutcome};
use crank::core::script::{Console, ScriptCallback, ScriptDescriptor, ScriptRegistry};
use crank::core::storage::{FileFormat, Storage};

/// Emits one export row per page across a fixed number of pages.
struct Exporter {
    pages: u32,
}

#[async_trait]
impl ScriptCallback for Exporter {
    async fn run(&self, args: &mut JobArguments, console: &Console) -> Result<()> {
        let row = match args.page {
            1 => json!(["a", "b"]),
            2 => json!(["c", "d"]),
            n => json!([format!("row-{n}")]),
        };
        args.export.add_row(row);
        console.line(format!("exported page {}", args.page));
        if args.page < self.pages {
            args.set_next_page(0);
        }
        Ok(())
    }
}

/// Same shape, but commits the export as pipe-delimited CSV on the last page.
struct CsvExporter;

#[async_trait]
impl ScriptCallback for CsvExporter {
    async fn run(&self, args: &mut JobArguments, _console: &Console) -> Result<()> {
        args.export.add_row(json!(["a", "b"]));
        args.export.add_row(json!(["c", "d"]));
        args.export.set_format(FileFormat::Csv).await?;
        Ok(())
    }
}

/// Counts down a budget carried in `data`; terminates when it hits zero.
struct Countdown;

#[async_trait]
impl ScriptCallback for Countdown {
    async fn run(&self, args: &mut JobArguments, _console: &Console) -> Result<()> {
        let left = args
            .data
            .get("left")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        if left > 1 {
            args.data.insert("left".to_string(), json!(left - 1));
            args.set_next_page(0);
        } else {
            args.data.clear();
            args.returns.insert("done".to_string(), json!(true));
        }
        Ok(())
    }
}

fn engine_with(scripts: Vec<(&str, Arc<dyn ScriptCallback>)>) -> (tempfile::TempDir, RunEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Arc::new(Storage::new(dir.path(), None));
    let mut registry = ScriptRegistry::new();
    for (id, callback) in scripts {
        registry.register(ScriptDescriptor {
            id: id.to_string(),
            title: id.to_string(),
            input: Vec::new(),
            callback,
        });
    }
    let engine = RunEngine::new(Arc::new(registry), storage, None);
    (dir, engine)
}

/// Drive the client-side page loop exactly the way a caller would: replay
/// `input`, feed back `data` and `exportFile`, stop when `nextPage` is gone.
async fn drive_to_completion(
    engine: &RunEngine,
    script: &str,
    input: Option<Value>,
) -> (u32, crank::core::job::RunReply) {
    let mut request = RunRequest {
        script: script.to_string(),
        page: 1,
        data: None,
        input: input.clone(),
        export_file: None,
        clear: true,
    };
    let mut pages = 0;
    loop {
        pages += 1;
        assert!(pages <= 100, "page loop failed to terminate");
        let outcome = engine.run_page(request.clone()).await.expect("run page");
        let RunOutcome::Completed(reply) = outcome else {
            panic!("page {} did not complete", request.page);
        };
        let Some(next_page) = reply.next_page else {
            return (pages, reply);
        };
        request = RunRequest {
            script: script.to_string(),
            page: next_page,
            data: reply.data.clone().map(Value::Object),
            input: input.clone(),
            export_file: reply.export_file.clone(),
            clear: false,
        };
    }
}

#[tokio::test]
async fn export_rows_accumulate_across_pages_in_call_order() {
    let (_dir, engine) = engine_with(vec![("exporter", Arc::new(Exporter { pages: 2 }))]);
    let (pages, reply) = drive_to_completion(&engine, "exporter", None).await;
    assert_eq!(pages, 2);

    let export_file = reply.export_file.expect("export file");
    let stored = engine
        .storage()
        .read("exports", &export_file, FileFormat::Json)
        .await
        .expect("read")
        .expect("file exists");
    assert_eq!(stored, json!([["a", "b"], ["c", "d"]]));
}

#[tokio::test]
async fn csv_export_is_pipe_delimited() {
    let (dir, engine) = engine_with(vec![("csv", Arc::new(CsvExporter))]);
    let (_, reply) = drive_to_completion(&engine, "csv", None).await;

    let export_file = reply.export_file.expect("export file");
    assert_eq!(reply.export_format.as_deref(), Some("csv"));
    let path = dir
        .path()
        .join("exports")
        .join(format!("{export_file}.csv"));
    let text = std::fs::read_to_string(path).expect("csv file");
    assert_eq!(text, "a|b\nc|d\n");
}

#[tokio::test]
async fn page_loop_terminates_in_finite_steps() {
    let (_dir, engine) = engine_with(vec![("countdown", Arc::new(Countdown))]);
    let (pages, reply) = drive_to_completion(&engine, "countdown", None).await;
    assert_eq!(pages, 10);
    assert_eq!(reply.returns["done"], true);
    assert!(reply.data.is_none());
}

#[tokio::test]
async fn input_is_replayed_unchanged_on_every_page() {
    struct InputEcho;

    #[async_trait]
    impl ScriptCallback for InputEcho {
        async fn run(&self, args: &mut JobArguments, _console: &Console) -> Result<()> {
            if args.input.get("who").and_then(Value::as_str) != Some("ops") {
                args.status = "lost input".to_string();
                return Ok(());
            }
            if args.page < 3 {
                args.set_next_page(0);
            }
            Ok(())
        }
    }

    let (_dir, engine) = engine_with(vec![("echo", Arc::new(InputEcho))]);
    let (pages, reply) = drive_to_completion(&engine, "echo", Some(json!({"who": "ops"}))).await;
    assert_eq!(pages, 3);
    assert_eq!(reply.status, "ok");
}
