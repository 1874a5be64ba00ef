use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::core::export::Export;
use crate::core::storage::{FileFormat, Storage};

/// A job invocation request, validated at the boundary before any job state
/// is constructed.
#[derive(Debug, Clone, serde_derive::Deserialize)]
pub struct RunRequest {
    pub script: String,
    pub page: u32,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default, rename = "exportFile")]
    pub export_file: Option<String>,
    #[serde(default)]
    pub clear: bool,
}

impl RunRequest {
    pub fn validate(&self) -> Result<()> {
        if self.script.is_empty() {
            anyhow::bail!("script id is required");
        }
        if self.page < 1 {
            anyhow::bail!("page must be 1 or greater");
        }
        Ok(())
    }
}

/// The working state of one script step: passed into the callback, mutated
/// by it, and inspected by the engine afterwards.
pub struct JobArguments {
    /// `"ok"` means success; any other string is an error code or message.
    pub status: String,
    pub script: String,
    /// Page being run, from 1 upwards.
    pub page: u32,
    /// Page to run next; 0 means the job is complete.
    pub next_page: u32,
    /// Continuation state the script hands forward to its own next page.
    pub data: Map<String, Value>,
    /// User-entered parameters, captured at page 1 and replayed unchanged.
    pub input: Map<String, Value>,
    /// Key/value results surfaced to the caller, overwritten each page.
    pub returns: Map<String, Value>,
    pub export: Export,
}

impl JobArguments {
    /// Build job state from a request, opening the attached export with the
    /// carried filename (or a fresh one). `data` and `input` that are not
    /// JSON objects are silently ignored.
    pub async fn from_request(storage: Arc<Storage>, request: &RunRequest) -> Result<Self> {
        let export = Export::open(
            storage,
            &request.script,
            request.export_file.as_deref().unwrap_or(""),
            FileFormat::Json,
        )
        .await?;
        Ok(Self {
            status: "ok".to_string(),
            script: request.script.clone(),
            page: request.page,
            next_page: 0,
            data: as_object(request.data.as_ref()),
            input: as_object(request.input.as_ref()),
            returns: Map::new(),
            export,
        })
    }

    /// Request another page. The 0 sentinel means `page + 1`; any other
    /// value is used verbatim. This is the only sanctioned way a script
    /// asks for continuation.
    pub fn set_next_page(&mut self, nr: u32) {
        self.next_page = if nr == 0 { self.page + 1 } else { nr };
    }

    pub fn check_status(&self) -> bool {
        self.status == "ok"
    }

    /// Raw state snapshot returned to callers on failure, for diagnosis.
    pub fn failure_payload(&self, output: &str) -> Value {
        serde_json::json!({
            "status": self.status,
            "output": strip_markup(output),
            "return": Value::Object(self.returns.clone()),
            "data": Value::Object(self.data.clone()),
        })
    }

    /// Produce the success payload. Keys are conditional by design: callers
    /// must tolerate absent `nextPage`, `data` and `exportFile` rather than
    /// assume a fixed schema. Writes the export iff it holds rows.
    pub async fn finalize(mut self, output: &str) -> Result<RunReply> {
        let export_file = if self.export.has_data() {
            self.export.write().await?;
            Some(self.export.filename().to_string())
        } else {
            None
        };
        Ok(RunReply {
            status: std::mem::take(&mut self.status),
            output: strip_markup(output),
            returns: std::mem::take(&mut self.returns),
            next_page: (self.next_page != 0).then_some(self.next_page),
            data: (!self.data.is_empty()).then(|| std::mem::take(&mut self.data)),
            export_format: export_file
                .as_ref()
                .map(|_| self.export.format().extension().to_string()),
            export_file,
        })
    }
}

fn as_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) if !map.is_empty() => map.clone(),
        _ => Map::new(),
    }
}

/// The response payload for one completed page.
#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct RunReply {
    pub status: String,
    pub output: String,
    #[serde(rename = "return", default)]
    pub returns: Map<String, Value>,
    #[serde(rename = "nextPage", default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(rename = "exportFile", default, skip_serializing_if = "Option::is_none")]
    pub export_file: Option<String>,
    #[serde(
        rename = "exportFileExtension",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub export_format: Option<String>,
}

/// Strip HTML-style markup from captured output, leaving plain text for the
/// caller's log pane.
pub fn strip_markup(text: &str) -> String {
    let blocks = regex::Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap();
    let tags = regex::Regex::new(r"<[^>]+>").unwrap();
    let without_blocks = blocks.replace_all(text, "");
    tags.replace_all(&without_blocks, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path(), None));
        (dir, storage)
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
    async fn non_object_data_and_input_are_silently_ignored() {
        let (_dir, storage) = test_storage();
        let mut req = request("foo", 1);
        req.data = Some(json!([1, 2]));
        req.input = Some(json!("text"));
        let args = JobArguments::from_request(storage, &req).await.expect("build");
        assert!(args.data.is_empty());
        assert!(args.input.is_empty());
        assert_eq!(args.status, "ok");
        assert_eq!(args.next_page, 0);
    }

    #[tokio::test]
    async fn set_next_page_sentinel_computes_increment() {
        let (_dir, storage) = test_storage();
        let mut args = JobArguments::from_request(storage, &request("foo", 3))
            .await
            .expect("build");
        args.set_next_page(0);
        assert_eq!(args.next_page, 4);
        args.set_next_page(2);
        assert_eq!(args.next_page, 2);
    }

    #[tokio::test]
    async fn finalize_omits_empty_keys() {
        let (_dir, storage) = test_storage();
        let args = JobArguments::from_request(storage, &request("foo", 2))
            .await
            .expect("build");
        let reply = args.finalize("").await.expect("finalize");
        assert_eq!(reply.status, "ok");
        assert!(reply.next_page.is_none());
        assert!(reply.data.is_none());
        assert!(reply.export_file.is_none());

        let encoded = serde_json::to_value(&reply).expect("serialize");
        assert!(encoded.get("nextPage").is_none());
        assert!(encoded.get("data").is_none());
        assert!(encoded.get("exportFile").is_none());
        assert_eq!(encoded["status"], "ok");
        assert_eq!(encoded["return"], json!({}));
    }

    #[tokio::test]
    async fn finalize_carries_continuation_and_export() {
        let (_dir, storage) = test_storage();
        let mut req = request("foo", 1);
        req.data = Some(json!({"count": 1}));
        let mut args = JobArguments::from_request(storage.clone(), &req)
            .await
            .expect("build");
        args.set_next_page(0);
        args.export.add_row(json!(["a", "b"]));
        let reply = args.finalize("working<br>").await.expect("finalize");

        assert_eq!(reply.next_page, Some(2));
        assert_eq!(reply.data.as_ref().expect("data")["count"], 1);
        assert_eq!(reply.output, "working");
        let export_file = reply.export_file.expect("export written");
        assert_eq!(reply.export_format.as_deref(), Some("json"));
        let stored = storage
            .read("exports", &export_file, FileFormat::Json)
            .await
            .expect("read")
            .expect("file exists");
        assert_eq!(stored, json!([["a", "b"]]));
    }

    #[test]
    fn strip_markup_removes_tags_and_script_blocks() {
        let text = "<p>hello <b>bold</b></p><script>alert(1)</script> done";
        assert_eq!(strip_markup(text), "hello bold done");
    }

    #[test]
    fn validate_rejects_malformed_requests() {
        assert!(request("", 1).validate().is_err());
        assert!(request("foo", 0).validate().is_err());
        assert!(request("foo", 1).validate().is_ok());
    }
}
