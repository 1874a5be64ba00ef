use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// On-disk representation of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Csv,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Csv => "csv",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(FileFormat::Json),
            "csv" => Some(FileFormat::Csv),
            _ => None,
        }
    }
}

/// Field delimiter for CSV output. Array-valued cells are comma-joined into a
/// single field, so the field separator must not collide with commas.
const CSV_DELIMITER: char = '|';

/// Metadata for one stored file, as surfaced in listings.
#[derive(Debug, Clone, serde_derive::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A typed settings key: `scope` is the owning script id, `name` the setting.
/// Resolved to a filename by the storage layer so callers never concatenate
/// namespaced strings themselves.
#[derive(Debug, Clone, Copy)]
pub struct SettingKey<'a> {
    pub scope: &'a str,
    pub name: &'a str,
}

impl SettingKey<'_> {
    fn filename(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }
}

const SETTINGS_SECTION: &str = "settings";

/// File persistence under a single root directory, namespaced by section.
///
/// Absent files are never an error: `read` returns `None` and callers supply
/// their own default. `write` always fully overwrites, `append` never reads.
pub struct Storage {
    root: PathBuf,
    public_url: Option<String>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, public_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn section_dir(&self, section: &str) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        if !section.is_empty() {
            dir.push(section);
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn file_path(&self, section: &str, filename: &str, extension: &str) -> Result<PathBuf> {
        let dir = self.section_dir(section)?;
        Ok(dir.join(format!("{}.{}", filename, extension)))
    }

    /// Public download URL for a stored file, when a base URL is configured.
    pub fn public_url_for(&self, section: &str, name: &str) -> Option<String> {
        self.public_url
            .as_ref()
            .map(|base| format!("{}/{}/{}", base.trim_end_matches('/'), section, name))
    }

    /// Read a stored document. A missing file yields `Ok(None)`.
    pub async fn read(
        &self,
        section: &str,
        filename: &str,
        format: FileFormat,
    ) -> Result<Option<Value>> {
        let path = self.file_path(section, filename, format.extension())?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = match format {
            FileFormat::Json => serde_json::from_str(&text)?,
            FileFormat::Csv => decode_csv(&text),
        };
        Ok(Some(value))
    }

    /// Read a stored document, falling back to the caller's default when the
    /// file does not exist.
    pub async fn read_or(
        &self,
        section: &str,
        filename: &str,
        format: FileFormat,
        default: Value,
    ) -> Result<Value> {
        Ok(self.read(section, filename, format).await?.unwrap_or(default))
    }

    /// Serialize and write a document, fully overwriting any previous content.
    pub async fn write(
        &self,
        section: &str,
        filename: &str,
        format: FileFormat,
        value: &Value,
    ) -> Result<()> {
        let path = self.file_path(section, filename, format.extension())?;
        let text = match format {
            FileFormat::Json => serde_json::to_string(value)?,
            FileFormat::Csv => encode_csv(value),
        };
        tokio::fs::write(&path, text).await?;
        Ok(())
    }

    /// Append raw text to a file, creating it if absent. No read happens.
    pub async fn append(
        &self,
        section: &str,
        filename: &str,
        extension: &str,
        text: &str,
    ) -> Result<()> {
        let path = self.file_path(section, filename, extension)?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Delete a stored file. Deleting a missing file is not an error.
    pub async fn remove(&self, section: &str, filename: &str, extension: &str) -> Result<()> {
        let path = self.file_path(section, filename, extension)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List up to `limit` files in a section whose name contains `filter`,
    /// most recent first. Filenames embed a timestamp or counter, so a
    /// reverse lexicographic sort is the recency order.
    pub async fn list_recent(
        &self,
        section: &str,
        filter: &str,
        limit: usize,
    ) -> Result<Vec<FileEntry>> {
        let dir = self.section_dir(section)?;
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(filter) {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        names.truncate(limit);
        Ok(names
            .into_iter()
            .map(|name| FileEntry {
                path: dir.join(&name),
                url: self.public_url_for(section, &name),
                name,
            })
            .collect())
    }

    /// Read a per-script setting document.
    pub async fn read_setting(&self, key: SettingKey<'_>) -> Result<Option<Value>> {
        self.read(SETTINGS_SECTION, &key.filename(), FileFormat::Json)
            .await
    }

    /// Write a per-script setting document, overwriting any previous value.
    pub async fn write_setting(&self, key: SettingKey<'_>, value: &Value) -> Result<()> {
        self.write(SETTINGS_SECTION, &key.filename(), FileFormat::Json, value)
            .await
    }

    /// Delete a per-script setting document.
    pub async fn clear_setting(&self, key: SettingKey<'_>) -> Result<()> {
        self.remove(SETTINGS_SECTION, &key.filename(), "json").await
    }

    /// List setting documents whose name part matches `name`, returning the
    /// scope part of each key.
    pub async fn list_setting_scopes(&self, name: &str) -> Result<Vec<String>> {
        let suffix = format!(".{}.json", name);
        let entries = self
            .list_recent(SETTINGS_SECTION, &suffix, usize::MAX)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.name.strip_suffix(&suffix).map(str::to_string))
            .collect())
    }
}

/// Serialize an array of rows as pipe-delimited CSV. Array-valued cells are
/// merged one level deep and comma-joined into a single field, which is why
/// the field delimiter is a pipe rather than a comma.
fn encode_csv(value: &Value) -> String {
    let rows = match value {
        Value::Array(rows) => rows.as_slice(),
        _ => return String::new(),
    };
    let mut out = String::new();
    for row in rows {
        let fields: Vec<String> = match row {
            Value::Array(cells) => cells.iter().map(flatten_cell).collect(),
            other => vec![flatten_cell(other)],
        };
        out.push_str(&fields.join(&CSV_DELIMITER.to_string()));
        out.push('\n');
    }
    out
}

fn flatten_cell(cell: &Value) -> String {
    match cell {
        Value::Array(items) => {
            let mut flat = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => flat.extend(inner.iter().map(scalar_to_string)),
                    other => flat.push(scalar_to_string(other)),
                }
            }
            flat.join(",")
        }
        other => scalar_to_string(other),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse pipe-delimited CSV back into an array of string rows. Flattened
/// cells stay in their comma-joined string form; the lossiness is documented
/// and deliberate.
fn decode_csv(text: &str) -> Value {
    let rows: Vec<Value> = text
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            Value::Array(
                line.split(CSV_DELIMITER)
                    .map(|field| Value::String(field.to_string()))
                    .collect(),
            )
        })
        .collect();
    Value::Array(rows)
}
