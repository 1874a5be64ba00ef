use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::core::job::{JobArguments, RunReply, RunRequest};
use crate::core::script::{Console, ScriptRegistry};
use crate::core::storage::Storage;

const LOG_SECTION: &str = "logs";
const LOG_EXTENSION: &str = "log";

/// Outcome of driving one page of a script.
#[derive(Debug)]
pub enum RunOutcome {
    /// The script id is not in the registry. No side effects occurred.
    UnknownScript,
    /// The callback failed or reported a non-ok status; the payload carries
    /// the raw state for diagnosis.
    Failed(Value),
    /// The page ran to completion; the reply may ask for another page.
    Completed(RunReply),
}

/// Executes exactly one page of a script per call. The page loop lives in
/// the caller: re-invoke with `page = reply.next_page` and the returned
/// `data` until `next_page` is absent. The engine itself never retries.
pub struct RunEngine {
    registry: Arc<ScriptRegistry>,
    storage: Arc<Storage>,
    log_tx: Option<tokio::sync::broadcast::Sender<String>>,
}

impl RunEngine {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        storage: Arc<Storage>,
        log_tx: Option<tokio::sync::broadcast::Sender<String>>,
    ) -> Self {
        Self {
            registry,
            storage,
            log_tx,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Run one page against the per-day interactive log.
    pub async fn run_page(&self, request: RunRequest) -> Result<RunOutcome> {
        let log_name = format!("{}-{}", Utc::now().format("%Y-%m-%d"), request.script);
        self.run_page_logged(request, &log_name).await
    }

    /// Run one page, appending captured output to the named log file. The
    /// scheduled engine uses this with its own cron log naming.
    pub async fn run_page_logged(
        &self,
        request: RunRequest,
        log_name: &str,
    ) -> Result<RunOutcome> {
        let Some(descriptor) = self.registry.get(&request.script) else {
            return Ok(RunOutcome::UnknownScript);
        };

        // A fresh top-level run gets a separator; continuations append
        // straight after the previous page's output.
        if request.clear {
            self.storage
                .append(LOG_SECTION, log_name, LOG_EXTENSION, &run_separator())
                .await?;
        }

        let mut args = JobArguments::from_request(self.storage.clone(), &request).await?;
        let console = Console::new();
        let result = descriptor.callback.run(&mut args, &console).await;
        let output = console.take();

        // Captured output lands in the log whether the page succeeded or not.
        if !output.is_empty() {
            self.storage
                .append(LOG_SECTION, log_name, LOG_EXTENSION, &output)
                .await?;
            if let Some(tx) = &self.log_tx {
                let _ = tx.send(output.clone());
            }
        }

        match result {
            Err(e) => {
                warn!("Script {} page {} errored: {:#}", request.script, request.page, e);
                args.status = format!("{e:#}");
                Ok(RunOutcome::Failed(args.failure_payload(&output)))
            }
            Ok(()) if !args.check_status() => {
                warn!(
                    "Script {} page {} reported status {}",
                    request.script, request.page, args.status
                );
                Ok(RunOutcome::Failed(args.failure_payload(&output)))
            }
            Ok(()) => Ok(RunOutcome::Completed(args.finalize(&output).await?)),
        }
    }
}

fn run_separator() -> String {
    format!("=== {} ===\n", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::{ScriptCallback, ScriptDescriptor};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct Bar;

    #[async_trait]
    impl ScriptCallback for Bar {
        async fn run(&self, args: &mut JobArguments, _console: &Console) -> Result<()> {
            let count = args.data.get("count").and_then(Value::as_i64).unwrap_or(0);
            if args.page == 1 {
                args.data.insert("count".to_string(), json!(count + 1));
                args.set_next_page(0);
            } else {
                args.data.clear();
                args.returns.insert("count".to_string(), json!(count + 1));
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ScriptCallback for Failing {
        async fn run(&self, args: &mut JobArguments, console: &Console) -> Result<()> {
            console.line("about to fail");
            args.status = "upstream unavailable".to_string();
            Ok(())
        }
    }

    struct Crashing;

    #[async_trait]
    impl ScriptCallback for Crashing {
        async fn run(&self, _args: &mut JobArguments, console: &Console) -> Result<()> {
            console.line("partial work");
            anyhow::bail!("connection reset")
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

    fn request(script: &str, page: u32) -> RunRequest {
        RunRequest {
            script: script.to_string(),
            page,
            data: None,
            input: None,
            export_file: None,
            clear: false,
        }
    }

    #[tokio::test]
    async fn unknown_script_has_no_side_effects() {
        let (dir, engine) = engine_with(vec![]);
        let mut req = request("missing", 1);
        req.clear = true;
        let outcome = engine.run_page(req).await.expect("run");
        assert!(matches!(outcome, RunOutcome::UnknownScript));
        // Not even the logs directory was created.
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn two_page_run_carries_data_then_terminates() {
        let (_dir, engine) = engine_with(vec![("foo", Arc::new(Bar))]);

        let outcome = engine.run_page(request("foo", 1)).await.expect("run");
        let RunOutcome::Completed(reply) = outcome else {
            panic!("page 1 should complete");
        };
        assert_eq!(reply.status, "ok");
        assert_eq!(reply.next_page, Some(2));
        assert_eq!(reply.data.as_ref().expect("data")["count"], 1);

        let mut second = request("foo", reply.next_page.expect("next page"));
        second.data = reply.data.map(Value::Object);
        let outcome = engine.run_page(second).await.expect("run");
        let RunOutcome::Completed(reply) = outcome else {
            panic!("page 2 should complete");
        };
        assert!(reply.next_page.is_none());
        assert!(reply.data.is_none());
        assert_eq!(reply.returns["count"], 2);
    }

    #[tokio::test]
    async fn reported_failure_carries_raw_state_and_still_logs() {
        let (_dir, engine) = engine_with(vec![("flaky", Arc::new(Failing))]);
        let outcome = engine.run_page(request("flaky", 1)).await.expect("run");
        let RunOutcome::Failed(payload) = outcome else {
            panic!("should fail");
        };
        assert_eq!(payload["status"], "upstream unavailable");
        assert_eq!(payload["output"], "about to fail");

        let logs = engine
            .storage()
            .list_recent("logs", "flaky", 5)
            .await
            .expect("list");
        assert_eq!(logs.len(), 1);
        let text = std::fs::read_to_string(&logs[0].path).expect("log file");
        assert!(text.contains("about to fail"));
    }

    #[tokio::test]
    async fn callback_error_is_treated_as_failure() {
        let (_dir, engine) = engine_with(vec![("crashy", Arc::new(Crashing))]);
        let outcome = engine.run_page(request("crashy", 1)).await.expect("run");
        let RunOutcome::Failed(payload) = outcome else {
            panic!("should fail");
        };
        assert!(
            payload["status"]
                .as_str()
                .expect("status string")
                .contains("connection reset")
        );
    }

    #[tokio::test]
    async fn clear_writes_run_separator_once() {
        let (_dir, engine) = engine_with(vec![("foo", Arc::new(Bar))]);
        let mut first = request("foo", 1);
        first.clear = true;
        engine.run_page(first).await.expect("run");
        engine.run_page(request("foo", 2)).await.expect("run");

        let logs = engine
            .storage()
            .list_recent("logs", "foo", 5)
            .await
            .expect("list");
        let text = std::fs::read_to_string(&logs[0].path).expect("log file");
        assert_eq!(text.matches("===").count(), 2, "one separator line");
    }
}
