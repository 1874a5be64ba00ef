use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::job::RunRequest;
use crate::core::runner::{RunEngine, RunOutcome};
use crate::core::storage::SettingKey;

const SETTING_NAME: &str = "schedule";
const LOG_SECTION: &str = "logs";
const LOG_EXTENSION: &str = "log";

/// Operator-facing schedule control actions. Anything that does not parse
/// into one of these is a no-op at the control boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    EveryMinute,
    Hourly,
    Daily,
    Weekly,
    Unschedule,
}

impl ScheduleAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "every-minute" => Some(Self::EveryMinute),
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "unschedule" => Some(Self::Unschedule),
            _ => None,
        }
    }

    pub fn interval_secs(&self) -> Option<u64> {
        match self {
            Self::EveryMinute => Some(60),
            Self::Hourly => Some(3_600),
            Self::Daily => Some(86_400),
            Self::Weekly => Some(604_800),
            Self::Unschedule => None,
        }
    }
}

/// Continuation payload persisted between runner fires. Each fire is a
/// fresh, stateless invocation; this record is the only state that
/// survives between pages of a scheduled job.
#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct PendingArguments {
    pub script: String,
    pub page: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    #[serde(default, rename = "exportFile", skip_serializing_if = "Option::is_none")]
    pub export_file: Option<String>,
}

impl PendingArguments {
    fn fresh(script: &str) -> Self {
        Self {
            script: script.to_string(),
            page: 1,
            data: Map::new(),
            input: Map::new(),
            export_file: None,
        }
    }

    fn to_request(&self) -> RunRequest {
        RunRequest {
            script: self.script.clone(),
            page: self.page,
            data: (!self.data.is_empty()).then(|| Value::Object(self.data.clone())),
            input: (!self.input.is_empty()).then(|| Value::Object(self.input.clone())),
            export_file: self.export_file.clone(),
            clear: self.page == 1,
        }
    }
}

/// Per-script schedule record. Mutated on every trigger firing; the
/// `arguments` member is cleared when a job completes or fails.
#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct ScheduleSettings {
    /// Unix seconds of the next manager fire.
    pub next: i64,
    /// Manager cadence in seconds.
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<PendingArguments>,
}

/// Drives scheduled jobs through the same per-page execution model as the
/// synchronous engine, using two cooperating triggers per script:
///
/// - the **manager** fires on the slow operator-chosen cadence and starts a
///   fresh top-level run, stomping any stuck one;
/// - the **runner** fires once per page, re-arming itself while the script
///   keeps asking for another page.
///
/// A single recurring trigger cannot express "fire rapidly until this job
/// finishes, then wait for the next interval", hence the split. Persisted
/// settings are the only state between fires, so an interrupted job resumes
/// after a process restart.
pub struct ScheduleEngine {
    engine: Arc<RunEngine>,
    scheduler: Mutex<JobScheduler>,
    manager_jobs: Mutex<HashMap<String, Uuid>>,
    pending_runners: Mutex<HashMap<String, Vec<Uuid>>>,
    // Handed to trigger closures so the scheduler never keeps the engine
    // alive on its own.
    self_ref: Weak<ScheduleEngine>,
}

impl ScheduleEngine {
    pub async fn new(engine: Arc<RunEngine>) -> Result<Arc<Self>> {
        let scheduler = JobScheduler::new().await?;
        Ok(Arc::new_cyclic(|weak| Self {
            engine,
            scheduler: Mutex::new(scheduler),
            manager_jobs: Mutex::new(HashMap::new()),
            pending_runners: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        }))
    }

    /// Start the timer backend. Call once after `restore`.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// Apply a schedule control action for one script. Unknown scripts are
    /// rejected; `Unschedule` tears everything down including any pending
    /// continuation.
    pub async fn apply(&self, script: &str, action: ScheduleAction) -> Result<()> {
        let Some(interval) = action.interval_secs() else {
            return self.unschedule(script).await;
        };
        if self.engine.registry().get(script).is_none() {
            anyhow::bail!("unknown script: {}", script);
        }

        let settings = ScheduleSettings {
            next: Utc::now().timestamp() + interval as i64,
            interval,
            arguments: None,
        };
        self.store_settings(script, &settings).await?;
        self.arm_manager(script, interval).await?;
        info!("Scheduled {} every {}s", script, interval);
        Ok(())
    }

    /// Current persisted schedule for a script, if any.
    pub async fn settings(&self, script: &str) -> Result<Option<ScheduleSettings>> {
        let key = SettingKey { scope: script, name: SETTING_NAME };
        let Some(value) = self.engine.storage().read_setting(key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Number of armed runner fires for a script. The invariant is that
    /// this never exceeds one at any inspected instant.
    pub async fn pending_runner_count(&self, script: &str) -> usize {
        self.pending_runners
            .lock()
            .await
            .get(script)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Re-arm schedules from persisted settings after a restart. A record
    /// with pending arguments also re-arms one runner so the interrupted
    /// job continues.
    pub async fn restore(&self) -> Result<()> {
        let scripts = self
            .engine
            .storage()
            .list_setting_scopes(SETTING_NAME)
            .await?;
        for script in scripts {
            if self.engine.registry().get(&script).is_none() {
                warn!("Skipping persisted schedule for unknown script {}", script);
                continue;
            }
            let Some(settings) = self.settings(&script).await? else {
                continue;
            };
            self.arm_manager(&script, settings.interval).await?;
            if settings.arguments.is_some() {
                info!("Resuming interrupted job for {}", script);
                self.arm_runner(&script).await?;
            }
        }
        Ok(())
    }

    /// Manager trigger body. Starts a fresh top-level run: persists
    /// `{script, page: 1}` over any prior state, clears pending runner
    /// fires and arms exactly one.
    pub async fn manager_fire(&self, script: &str) {
        if self.engine.registry().get(script).is_none() {
            return;
        }
        let Ok(Some(mut settings)) = self.settings(script).await else {
            // Unscheduled between fires; nothing to do.
            return;
        };
        settings.next = Utc::now().timestamp() + settings.interval as i64;
        settings.arguments = Some(PendingArguments::fresh(script));
        if let Err(e) = self.store_settings(script, &settings).await {
            warn!("Failed to persist manager state for {}: {:#}", script, e);
            return;
        }
        if let Err(e) = self.arm_runner(script).await {
            warn!("Failed to arm runner for {}: {:#}", script, e);
        }
    }

    /// Runner trigger body. Runs exactly one page from persisted state; a
    /// fire that finds no pending arguments is a stale duplicate and
    /// aborts with no side effects.
    pub fn runner_fire<'a>(&'a self, script: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        if self.engine.registry().get(script).is_none() {
            return;
        }
        // The timer backend has at-least-once semantics; make sure no other
        // fire is still armed for this script before doing any work.
        self.cancel_pending_runners(script).await;

        let Ok(Some(mut settings)) = self.settings(script).await else {
            return;
        };
        let Some(pending) = settings.arguments.take() else {
            return;
        };

        let log_name = format!("{}-cron-{}", Utc::now().format("%Y-%m-%d"), script);
        let outcome = self
            .engine
            .run_page_logged(pending.to_request(), &log_name)
            .await;

        match outcome {
            Ok(RunOutcome::Completed(reply)) => {
                if let Some(next_page) = reply.next_page {
                    settings.arguments = Some(PendingArguments {
                        script: script.to_string(),
                        page: next_page,
                        data: reply.data.unwrap_or_default(),
                        input: pending.input,
                        export_file: reply.export_file,
                    });
                    if self.store_settings(script, &settings).await.is_ok() {
                        if let Err(e) = self.arm_runner(script).await {
                            warn!("Failed to arm next page for {}: {:#}", script, e);
                        }
                    }
                } else {
                    // Job complete; settings keep the cadence, lose the job.
                    let _ = self.store_settings(script, &settings).await;
                    info!("Scheduled job {} completed", script);
                }
            }
            Ok(RunOutcome::Failed(_)) | Ok(RunOutcome::UnknownScript) => {
                let _ = self
                    .engine
                    .storage()
                    .append(LOG_SECTION, &log_name, LOG_EXTENSION, "Script failed\n")
                    .await;
                let _ = self.store_settings(script, &settings).await;
                warn!("Scheduled job {} failed, continuation dropped", script);
            }
            Err(e) => {
                let _ = self
                    .engine
                    .storage()
                    .append(LOG_SECTION, &log_name, LOG_EXTENSION, "Script failed\n")
                    .await;
                let _ = self.store_settings(script, &settings).await;
                warn!("Scheduled job {} errored: {:#}", script, e);
            }
        }
        })
    }

    async fn unschedule(&self, script: &str) -> Result<()> {
        if let Some(id) = self.manager_jobs.lock().await.remove(script) {
            let _ = self.scheduler.lock().await.remove(&id).await;
        }
        self.cancel_pending_runners(script).await;
        let key = SettingKey { scope: script, name: SETTING_NAME };
        self.engine.storage().clear_setting(key).await?;
        info!("Unscheduled {}", script);
        Ok(())
    }

    async fn store_settings(&self, script: &str, settings: &ScheduleSettings) -> Result<()> {
        let key = SettingKey { scope: script, name: SETTING_NAME };
        self.engine
            .storage()
            .write_setting(key, &serde_json::to_value(settings)?)
            .await
    }

    /// Replace any existing manager trigger for a script with one on the
    /// given cadence.
    async fn arm_manager(&self, script: &str, interval: u64) -> Result<()> {
        let weak = self.self_ref.clone();
        let name = script.to_string();
        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, mut _l| {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    engine.manager_fire(&name).await;
                }
            })
        })?;
        let id = self.scheduler.lock().await.add(job).await?;
        if let Some(old) = self.manager_jobs.lock().await.insert(script.to_string(), id) {
            let _ = self.scheduler.lock().await.remove(&old).await;
        }
        Ok(())
    }

    /// Arm exactly one runner fire. Clearing pending fires first keeps the
    /// at-most-one-pending invariant even when the backend double-fires or
    /// an operator re-enters manually.
    async fn arm_runner(&self, script: &str) -> Result<()> {
        self.cancel_pending_runners(script).await;
        let weak = self.self_ref.clone();
        let name = script.to_string();
        let job = Job::new_one_shot_async(Duration::from_secs(0), move |_uuid, mut _l| {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    engine.runner_fire(&name).await;
                }
            })
        })?;
        let id = self.scheduler.lock().await.add(job).await?;
        self.pending_runners
            .lock()
            .await
            .entry(script.to_string())
            .or_default()
            .push(id);
        Ok(())
    }

    /// Idempotent cleanup of every armed runner fire for a script. Fires
    /// already consumed by the backend are gone anyway; removal errors are
    /// ignored.
    async fn cancel_pending_runners(&self, script: &str) {
        let ids = self
            .pending_runners
            .lock()
            .await
            .remove(script)
            .unwrap_or_default();
        if ids.is_empty() {
            return;
        }
        let scheduler = self.scheduler.lock().await;
        for id in ids {
            let _ = scheduler.remove(&id).await;
        }
    }
}
