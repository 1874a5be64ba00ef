use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::job::JobArguments;
use crate::core::script::{Console, InputField, ScriptCallback, ScriptDescriptor, ScriptRegistry};
use crate::core::storage::Storage;

/// Log files deleted per page, keeping each page a bounded unit of work.
const PRUNE_BATCH: usize = 25;

/// Registry with the scripts the service ships out of the box.
pub fn builtin_registry(storage: Arc<Storage>) -> ScriptRegistry {
    let mut registry = ScriptRegistry::new();
    registry.register(ScriptDescriptor {
        id: "prune-logs".to_string(),
        title: "Prune old log files".to_string(),
        input: vec![InputField {
            name: "days".to_string(),
            kind: "number".to_string(),
            title: "Keep days".to_string(),
            default: "30".to_string(),
        }],
        callback: Arc::new(PruneLogs { storage }),
    });
    registry
}

/// Deletes run logs older than the configured retention, a batch per page.
/// Deleted filenames accumulate in the job export as an audit record.
pub struct PruneLogs {
    storage: Arc<Storage>,
}

#[async_trait]
impl ScriptCallback for PruneLogs {
    async fn run(&self, args: &mut JobArguments, console: &Console) -> Result<()> {
        let days = args
            .input
            .get("days")
            .and_then(parse_days)
            .unwrap_or(30);
        let cutoff = Utc::now().date_naive() - Duration::days(days);

        let entries = self.storage.list_recent("logs", "", usize::MAX).await?;
        let stale: Vec<String> = entries
            .into_iter()
            .filter_map(|entry| {
                let date = entry.name.get(..10).and_then(|prefix| {
                    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
                })?;
                (date < cutoff).then(|| entry.name)
            })
            .collect();

        let mut deleted = args
            .data
            .get("deleted")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        for name in stale.iter().take(PRUNE_BATCH) {
            let filename = name.strip_suffix(".log").unwrap_or(name.as_str());
            self.storage.remove("logs", filename, "log").await?;
            args.export.add_row(json!([name]));
            console.line(format!("deleted {}", name));
            deleted += 1;
        }

        if stale.len() > PRUNE_BATCH {
            args.data.insert("deleted".to_string(), json!(deleted));
            args.set_next_page(0);
        } else {
            args.data.clear();
        }
        args.returns.insert("deleted".to_string(), json!(deleted));
        Ok(())
    }
}

fn parse_days(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
