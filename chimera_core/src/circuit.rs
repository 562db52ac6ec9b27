//! The anonymity-circuit simulator.
//!
//! A single logical circuit with an explicit lifecycle:
//!
//! ```text
//! STOPPED ──start()──► STARTING ──(3 stages)──► SYNCHRONIZING ──► RUNNING
//!    ▲                     │                          │              │
//!    │                     └──────────stop()──────────┴──────────────┤
//!    │                                                               ▼
//!    └─────────────────────────(task joined)───────────────────── STOPPING
//! ```
//!
//! The bootstrap task owns every forward transition. `stop()` owns
//! `STOPPING` and `STOPPED`, and joins the task before finalizing.

use chimera_env::ChimeraContext;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const BOOTSTRAP_STAGES: [&str; 4] = [
    "Bootstrapped 0%: Starting",
    "Bootstrapped 10%: Finishing handshake with directory server",
    "Bootstrapped 50%: Loading relay descriptors",
    "Bootstrapped 80%: Connecting to the overlay network",
];

/// Stage index at which the circuit reports `SYNCHRONIZING`.
const SYNC_STAGE: usize = 3;

/// Configuration for the circuit simulator.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Platform label reported in status snapshots
    pub platform: String,

    /// Simulated delay after each bootstrap stage (default: 1s, 1.5s, 2s, 2s)
    pub stage_delays: [Duration; 4],

    /// Wait between heartbeat rolls once running (default: 5s)
    pub heartbeat_interval: Duration,

    /// Chance of a "healthy" log line per heartbeat (default: 0.1)
    pub heartbeat_probability: f64,

    /// Log lines retained in memory (default: 50)
    pub log_capacity: usize,

    /// Log lines exposed in status snapshots (default: 10)
    pub exposed_logs: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            platform: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            stage_delays: [
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(2000),
                Duration::from_millis(2000),
            ],
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_probability: 0.1,
            log_capacity: 50,
            exposed_logs: 10,
        }
    }
}

impl CircuitConfig {
    /// Total simulated time from `start()` to `RUNNING`.
    pub fn bootstrap_duration(&self) -> Duration {
        self.stage_delays.iter().sum()
    }
}

/// Lifecycle state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    Stopped,
    Starting,
    Synchronizing,
    Running,
    Stopping,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Stopped => "STOPPED",
            CircuitState::Starting => "STARTING",
            CircuitState::Synchronizing => "SYNCHRONIZING",
            CircuitState::Running => "RUNNING",
            CircuitState::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgment returned by `start()` / `stop()`. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitAck {
    InitializationStarted,
    AlreadyRunning,
    StoppedSuccessfully,
    AlreadyStopped,
}

impl CircuitAck {
    pub fn message(&self) -> &'static str {
        match self {
            CircuitAck::InitializationStarted => "Circuit initialization started.",
            CircuitAck::AlreadyRunning => "Circuit is already running.",
            CircuitAck::StoppedSuccessfully => "Circuit stopped successfully.",
            CircuitAck::AlreadyStopped => "Circuit is already stopped.",
        }
    }
}

impl std::fmt::Display for CircuitAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Point-in-time view of the circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub status: CircuitState,
    pub platform: String,
    pub ip: Option<Ipv4Addr>,
    /// Most recent lines, oldest first
    pub logs: Vec<String>,
}

/// Bounded FIFO of log lines. The oldest line is evicted first.
#[derive(Debug, Clone)]
pub struct CircuitLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl CircuitLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }

    /// Returns up to `n` of the newest lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State guarded as one unit so readers never see a half-updated state/IP pair.
struct CircuitInner {
    state: CircuitState,
    ip: Option<Ipv4Addr>,
    log: CircuitLog,
}

/// Handle to the live bootstrap/heartbeat task.
struct BootstrapHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

/// The circuit simulator.
///
/// Construction has no side effects; the background task only exists
/// between a successful `start()` and the matching `stop()`.
pub struct Circuit<Ctx: ChimeraContext> {
    context: Arc<Ctx>,
    config: Arc<CircuitConfig>,
    inner: Arc<Mutex<CircuitInner>>,

    /// Serializes `start()` against `stop()`
    control: tokio::sync::Mutex<Option<BootstrapHandle>>,
}

impl<Ctx: ChimeraContext> Circuit<Ctx> {
    pub fn new(context: Arc<Ctx>, config: CircuitConfig) -> Self {
        let log = CircuitLog::new(config.log_capacity);
        Self {
            context,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Stopped,
                ip: None,
                log,
            })),
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// Begins bootstrapping and returns without waiting for it.
    pub async fn start(&self) -> CircuitAck {
        let mut control = self.control.lock().await;
        {
            let mut inner = lock(&self.inner);
            if inner.state != CircuitState::Stopped {
                return CircuitAck::AlreadyRunning;
            }
            inner.state = CircuitState::Starting;
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let task = BootstrapTask {
            context: Arc::clone(&self.context),
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            cancel: cancel.clone(),
        };
        self.context.spawn("circuit-bootstrap", async move {
            task.run().await;
            let _ = done_tx.send(());
        });
        *control = Some(BootstrapHandle {
            cancel,
            done: done_rx,
        });

        info!("Circuit initialization started");
        CircuitAck::InitializationStarted
    }

    /// Cancels the background task and waits for it to exit.
    ///
    /// Returns only once the circuit is fully quiesced: state `STOPPED`,
    /// no virtual IP.
    pub async fn stop(&self) -> CircuitAck {
        let mut control = self.control.lock().await;
        let handle = {
            let mut inner = lock(&self.inner);
            if inner.state == CircuitState::Stopped {
                return CircuitAck::AlreadyStopped;
            }
            inner.state = CircuitState::Stopping;
            let handle = control.take();
            // Cancel under the state lock: the task re-checks the token
            // under the same lock before every commit.
            if let Some(handle) = &handle {
                handle.cancel.cancel();
            }
            handle
        };

        if let Some(handle) = handle {
            let _ = handle.done.await;
        }

        let line = stamp(self.context.as_ref(), "Circuit service stopped.");
        let mut inner = lock(&self.inner);
        inner.state = CircuitState::Stopped;
        inner.ip = None;
        inner.log.push(line);
        info!("Circuit stopped");
        CircuitAck::StoppedSuccessfully
    }

    /// Non-blocking snapshot of the circuit.
    pub fn status(&self) -> CircuitStatus {
        let inner = lock(&self.inner);
        CircuitStatus {
            status: inner.state,
            platform: self.config.platform.clone(),
            ip: inner.ip,
            logs: inner.log.recent(self.config.exposed_logs),
        }
    }

    /// Number of log lines currently retained in memory.
    pub fn retained_logs(&self) -> usize {
        lock(&self.inner).log.len()
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }
}

fn lock(inner: &Mutex<CircuitInner>) -> MutexGuard<'_, CircuitInner> {
    inner.lock().expect("circuit state lock poisoned")
}

fn stamp<Ctx: ChimeraContext>(context: &Ctx, message: &str) -> String {
    format!("[{}] {}", context.wall_clock().strftime("%H:%M:%S"), message)
}

/// Everything the bootstrap/heartbeat task needs, moved into the task.
struct BootstrapTask<Ctx: ChimeraContext> {
    context: Arc<Ctx>,
    config: Arc<CircuitConfig>,
    inner: Arc<Mutex<CircuitInner>>,
    cancel: CancellationToken,
}

impl<Ctx: ChimeraContext> BootstrapTask<Ctx> {
    async fn run(self) {
        for (stage, message) in BOOTSTRAP_STAGES.iter().enumerate() {
            let line = stamp(self.context.as_ref(), message);
            let committed = self.commit(|inner| {
                if stage == SYNC_STAGE {
                    inner.state = CircuitState::Synchronizing;
                }
                inner.log.push(line);
            });
            if !committed || !self.pause(self.config.stage_delays[stage]).await {
                debug!(stage, "Bootstrap cancelled");
                return;
            }
        }

        let ip = Ipv4Addr::new(
            10,
            2,
            self.context.random_range(10..=99) as u8,
            self.context.random_range(10..=255) as u8,
        );
        let done_line = stamp(self.context.as_ref(), "Bootstrapped 100%: Done");
        let established = stamp(
            self.context.as_ref(),
            &format!("Circuit established. Virtual IP: {}", ip),
        );
        let committed = self.commit(|inner| {
            inner.log.push(done_line);
            inner.state = CircuitState::Running;
            inner.ip = Some(ip);
            inner.log.push(established);
        });
        if !committed {
            return;
        }
        info!(%ip, "Circuit established");

        while self.pause(self.config.heartbeat_interval).await {
            if self.context.random_unit() < self.config.heartbeat_probability {
                let line = stamp(self.context.as_ref(), "Heartbeat: Circuit is healthy");
                if !self.commit(|inner| inner.log.push(line)) {
                    break;
                }
            }
        }
        debug!("Heartbeat loop exited");
    }

    /// Applies `update` unless cancellation has been requested.
    fn commit(&self, update: impl FnOnce(&mut CircuitInner)) -> bool {
        let mut inner = lock(&self.inner);
        if self.cancel.is_cancelled() {
            return false;
        }
        update(&mut inner);
        true
    }

    /// Sleeps for `duration`. Returns false if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.context.sleep(duration) => !self.cancel.is_cancelled(),
        }
    }
}
