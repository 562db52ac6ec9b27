//! The harvest worker - a recurring background poll over `processing` targets.
//!
//! Each cycle, every active target independently rolls one action:
//!
//! | roll band | action                                         |
//! |-----------|------------------------------------------------|
//! | log       | append an `INFO` line from the message set     |
//! | data      | persist a synthesized record + `SUCCESS` line  |
//! | idle      | nothing                                        |
//!
//! and then, independently, a small completion roll that moves the target
//! to `completed`.

use crate::model::{LogLevel, NewRecord, Target, TargetStatus, FALLBACK_KEYWORD};
use crate::store::{HarvestStore, StoreError};
use chimera_env::ChimeraContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_INFO_MESSAGES: [&str; 6] = [
    "Scanning ports...",
    "Bypassing CAPTCHA...",
    "Following redirect...",
    "Parsing HTML structure...",
    "Tor circuit rotated...",
    "Analyzing page content...",
];

/// Tags attached to every synthesized record.
const RECORD_TAGS: [&str; 2] = ["sensitive", "leaked"];

/// Configuration for the harvest worker.
///
/// The action weights are relative; they need not sum to 1.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Delay between cycles (default: 3s)
    pub poll_interval: Duration,

    /// Weight of the log-only action (default: 0.4)
    pub log_weight: f64,

    /// Weight of the data-found action (default: 0.2)
    pub data_weight: f64,

    /// Weight of doing nothing (default: 0.4)
    pub idle_weight: f64,

    /// Per-target, per-cycle chance of completing (default: 0.02)
    pub completion_probability: f64,

    /// Messages for the log-only action
    pub info_messages: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            log_weight: 0.4,
            data_weight: 0.2,
            idle_weight: 0.4,
            completion_probability: 0.02,
            info_messages: DEFAULT_INFO_MESSAGES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// The per-target action chosen each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestAction {
    Log,
    Data,
    Idle,
}

impl HarvestAction {
    /// Maps a uniform roll in `[0, 1)` onto the configured weight bands.
    pub fn choose(roll: f64, config: &HarvestConfig) -> Self {
        let log = config.log_weight.max(0.0);
        let data = config.data_weight.max(0.0);
        let total = log + data + config.idle_weight.max(0.0);
        if total <= 0.0 {
            return HarvestAction::Idle;
        }

        let point = roll * total;
        if point < log {
            HarvestAction::Log
        } else if point < log + data {
            HarvestAction::Data
        } else {
            HarvestAction::Idle
        }
    }
}

/// A per-target failure caught during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleFailure {
    /// `None` when the target scan itself failed
    pub target_id: Option<u64>,
    pub reason: String,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub targets_scanned: usize,
    pub logs_written: usize,
    pub records_found: usize,
    pub targets_completed: usize,
    pub failures: Vec<CycleFailure>,
}

impl CycleReport {
    fn fail(&mut self, target_id: Option<u64>, error: &StoreError) {
        warn!(target_id = ?target_id, error = %error, "Harvest step failed");
        self.failures.push(CycleFailure {
            target_id,
            reason: error.to_string(),
        });
    }
}

/// The harvest worker.
///
/// Two-phase lifecycle: `new()` has no side effects, and
/// `start_background_tasks()` spawns the polling loop once. Tests can skip
/// the loop entirely and drive `run_cycle()` by hand.
pub struct HarvestWorker<Ctx: ChimeraContext, S: HarvestStore> {
    context: Arc<Ctx>,
    store: Arc<S>,
    config: HarvestConfig,
    shutdown: CancellationToken,
    started: AtomicBool,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl<Ctx: ChimeraContext, S: HarvestStore> HarvestWorker<Ctx, S> {
    pub fn new(context: Arc<Ctx>, store: Arc<S>, config: HarvestConfig) -> Self {
        Self {
            context,
            store,
            config,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            done: Mutex::new(None),
        }
    }

    /// Spawns the polling loop. Returns false if it was already started.
    pub fn start_background_tasks(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (done_tx, done_rx) = oneshot::channel();
        *self.done.lock().expect("worker lock poisoned") = Some(done_rx);

        let worker = Arc::clone(self);
        self.context.spawn("harvest-worker", async move {
            worker.run_loop().await;
            let _ = done_tx.send(());
        });
        true
    }

    /// True while the polling loop is live.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Cancels the polling loop and waits for it to exit.
    ///
    /// For orderly process shutdown; the worker cannot be restarted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let done = self.done.lock().expect("worker lock poisoned").take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Harvest worker started"
        );
        while !self.shutdown.is_cancelled() {
            // Store calls block; keep them off the async workers.
            let worker = Arc::clone(&self);
            let report = match tokio::task::spawn_blocking(move || worker.run_cycle()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Harvest cycle panicked");
                    CycleReport::default()
                }
            };
            if report.targets_scanned > 0 {
                debug!(
                    scanned = report.targets_scanned,
                    logs = report.logs_written,
                    records = report.records_found,
                    completed = report.targets_completed,
                    failures = report.failures.len(),
                    "Harvest cycle"
                );
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.context.sleep(self.config.poll_interval) => {}
            }
        }
        info!("Harvest worker stopped");
    }

    /// Runs exactly one cycle over the currently `processing` targets.
    ///
    /// Never fails: store errors are logged, recorded in the report, and
    /// the remaining targets are still processed.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let targets = match self.store.list_targets_by_status(TargetStatus::Processing) {
            Ok(targets) => targets,
            Err(e) => {
                report.fail(None, &e);
                return report;
            }
        };

        for target in &targets {
            report.targets_scanned += 1;
            if let Err(e) = self.apply_action(target, &mut report) {
                report.fail(Some(target.id), &e);
            }
            if let Err(e) = self.roll_completion(target, &mut report) {
                report.fail(Some(target.id), &e);
            }
        }
        report
    }

    fn apply_action(&self, target: &Target, report: &mut CycleReport) -> Result<(), StoreError> {
        match HarvestAction::choose(self.context.random_unit(), &self.config) {
            HarvestAction::Log => {
                if let Some(message) = self.pick_message() {
                    let now = self.context.wall_clock();
                    self.store.append_log(target.id, LogLevel::Info, message, now)?;
                    report.logs_written += 1;
                }
            }
            HarvestAction::Data => {
                let record = self.synthesize_record(target);
                let keyword = record.matched_keywords.clone();
                let record = self.store.insert_record(record)?;
                report.records_found += 1;
                debug!(target_id = target.id, record_id = record.id, %keyword, "Record found");

                let now = self.context.wall_clock();
                let message = format!("Data captured: {}", keyword);
                self.store.append_log(target.id, LogLevel::Success, &message, now)?;
                report.logs_written += 1;
            }
            HarvestAction::Idle => {}
        }
        Ok(())
    }

    fn roll_completion(&self, target: &Target, report: &mut CycleReport) -> Result<(), StoreError> {
        if self.context.random_unit() >= self.config.completion_probability {
            return Ok(());
        }
        let now = self.context.wall_clock();
        self.store
            .update_target_status(target.id, TargetStatus::Completed, Some(now))?;
        report.targets_completed += 1;
        info!(target_id = target.id, "Target completed");

        self.store
            .append_log(target.id, LogLevel::Success, "Task completed successfully.", now)?;
        report.logs_written += 1;
        Ok(())
    }

    fn pick_message(&self) -> Option<&str> {
        let count = self.config.info_messages.len();
        if count == 0 {
            return None;
        }
        let index = self.context.random_range(0..=(count as u32 - 1)) as usize;
        self.config.info_messages.get(index).map(String::as_str)
    }

    /// Builds a fake discovery for `target`.
    fn synthesize_record(&self, target: &Target) -> NewRecord {
        let keywords = target.keyword_list();
        let keyword = if keywords.is_empty() {
            FALLBACK_KEYWORD.to_string()
        } else {
            let index = self.context.random_range(0..=(keywords.len() as u32 - 1)) as usize;
            keywords[index].clone()
        };

        let token = self.context.random_range(100_000..=999_999);
        let url = match target.seed_url() {
            Some(url) => url.to_string(),
            None => format!(
                "http://dark{}.onion/post/{}",
                self.context.random_range(100..=999),
                self.context.random_range(1..=500)
            ),
        };

        NewRecord {
            target_id: target.id,
            url,
            content_snippet: format!(
                "Found sensitive data related to {}. Context snippet: {}...",
                keyword, token
            ),
            matched_keywords: keyword,
            timestamp: self.context.wall_clock(),
            video_url: None,
            video_title: None,
            tags: RECORD_TAGS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }
}
