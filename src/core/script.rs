use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::job::JobArguments;

/// One user-facing input field a script declares. The engine carries the
/// entered values verbatim; rendering is the caller's concern.
#[derive(Debug, Clone, serde_derive::Serialize)]
pub struct InputField {
    pub name: String,
    pub kind: String,
    pub title: String,
    pub default: String,
}

/// Captured console output for one script invocation. The engine owns the
/// sink and reads the accumulated text after the callback returns; nothing
/// goes to the real stdout.
#[derive(Default)]
pub struct Console {
    buf: std::sync::Mutex<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a line of output.
    pub fn line(&self, text: impl AsRef<str>) {
        if let Ok(mut buf) = self.buf.lock() {
            buf.push_str(text.as_ref());
            buf.push('\n');
        }
    }

    /// Drain the accumulated output.
    pub fn take(&self) -> String {
        self.buf.lock().map(|mut buf| std::mem::take(&mut *buf)).unwrap_or_default()
    }
}

/// The behavior behind a registered script. Implementations run one bounded
/// page of work per call: mutate `args` (continuation state, return values,
/// export rows, `set_next_page`) and write progress to `console`.
///
/// Returning `Err` is treated exactly like reporting a non-ok status; the
/// engine does not distinguish "crashed" from "signaled failure".
#[async_trait]
pub trait ScriptCallback: Send + Sync {
    async fn run(&self, args: &mut JobArguments, console: &Console) -> Result<()>;
}

/// Registry entry for one runnable script.
#[derive(Clone)]
pub struct ScriptDescriptor {
    pub id: String,
    pub title: String,
    pub input: Vec<InputField>,
    pub callback: Arc<dyn ScriptCallback>,
}

/// The set of runnable scripts, injected into the engines at construction.
/// The engines only ever look scripts up; they never mutate the registry.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, ScriptDescriptor>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ScriptDescriptor) {
        tracing::info!("Registering script: {}", descriptor.id);
        self.scripts.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Option<&ScriptDescriptor> {
        self.scripts.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ScriptDescriptor> {
        self.scripts.values()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}
