use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::core::storage::{FileFormat, Storage};

const SECTION: &str = "exports";

/// Collects rows produced by a script across pages and commits them to a
/// downloadable file. One instance is attached to each job invocation; the
/// file it writes is the durable artifact outliving the process.
pub struct Export {
    id: String,
    filename: String,
    format: FileFormat,
    rows: Vec<Value>,
    storage: Arc<Storage>,
}

impl Export {
    /// Open an export for `id`. An empty `filename` starts a fresh export
    /// named `{id}-{UTC timestamp}`; a non-empty one continues an existing
    /// export, reading any rows already on disk so multi-page jobs keep
    /// appending to the same logical file across process invocations.
    pub async fn open(
        storage: Arc<Storage>,
        id: &str,
        filename: &str,
        format: FileFormat,
    ) -> Result<Self> {
        let filename = if filename.is_empty() {
            format!("{}-{}", id, Utc::now().format("%Y%m%d%H%M%S"))
        } else {
            filename.to_string()
        };
        let rows = match storage.read(SECTION, &filename, format).await? {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        };
        Ok(Self {
            id: id.to_string(),
            filename,
            format,
            rows,
            storage,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Append a row to the dataset.
    pub fn add_row(&mut self, row: Value) {
        self.rows.push(row);
    }

    /// Insert a row at an arbitrary position, for rows discovered out of
    /// order (a header row found only after data rows, say). Indexes past
    /// the end append.
    pub fn insert_row(&mut self, index: usize, row: Value) {
        let index = index.min(self.rows.len());
        self.rows.insert(index, row);
    }

    /// True iff at least one row is present. Gates writing: an export file
    /// is never created empty.
    pub fn has_data(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Serialize all rows to the export file, fully overwriting.
    pub async fn write(&self) -> Result<()> {
        self.storage
            .write(
                SECTION,
                &self.filename,
                self.format,
                &Value::Array(self.rows.clone()),
            )
            .await
    }

    /// Switch the output format and serialize immediately under the new
    /// extension.
    pub async fn set_format(&mut self, format: FileFormat) -> Result<()> {
        self.format = format;
        self.write().await
    }
}
