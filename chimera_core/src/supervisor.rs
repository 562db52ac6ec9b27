//! Supervisor - the explicit application context.
//!
//! Owns the circuit simulator, the harvest worker and the store, and is
//! the only thing an outer API layer needs to hold.
//!
//! # Usage
//!
//! ```ignore
//! use chimera_core::{Chimera, ChimeraConfig, SledHarvestStore};
//! use chimera_env::TokioContext;
//!
//! let store = Arc::new(SledHarvestStore::open("chimera.db")?);
//! let app = Chimera::new(TokioContext::shared(), store, ChimeraConfig::default());
//! app.start_background_tasks();
//!
//! app.deploy_circuit().await;
//! let status = app.status();
//! ```

use crate::circuit::{Circuit, CircuitAck, CircuitConfig, CircuitStatus};
use crate::harvester::{HarvestConfig, HarvestWorker};
use crate::model::{HarvestedRecord, LogEntry, LogLevel, NewTarget, Target, TargetStatus};
use crate::store::{HarvestStore, StoreError};
use chimera_env::ChimeraContext;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Configuration for the whole process.
#[derive(Debug, Clone, Default)]
pub struct ChimeraConfig {
    pub circuit: CircuitConfig,
    pub harvest: HarvestConfig,
}

/// Snapshot served to status readers.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub circuit: CircuitStatus,
    pub harvester_running: bool,
}

/// The application context.
pub struct Chimera<Ctx: ChimeraContext, S: HarvestStore> {
    context: Arc<Ctx>,
    store: Arc<S>,
    circuit: Arc<Circuit<Ctx>>,
    harvester: Arc<HarvestWorker<Ctx, S>>,
}

impl<Ctx: ChimeraContext, S: HarvestStore> Chimera<Ctx, S> {
    /// Wires up the services. Spawns nothing.
    pub fn new(context: Arc<Ctx>, store: Arc<S>, config: ChimeraConfig) -> Self {
        let circuit = Arc::new(Circuit::new(Arc::clone(&context), config.circuit));
        let harvester = Arc::new(HarvestWorker::new(
            Arc::clone(&context),
            Arc::clone(&store),
            config.harvest,
        ));
        Self {
            context,
            store,
            circuit,
            harvester,
        }
    }

    /// Starts the harvest loop. The circuit waits for `deploy_circuit()`.
    pub fn start_background_tasks(&self) -> bool {
        let started = self.harvester.start_background_tasks();
        if started {
            info!(seed = self.context.seed(), "Background tasks started");
        }
        started
    }

    pub async fn deploy_circuit(&self) -> CircuitAck {
        self.circuit.start().await
    }

    pub async fn stop_circuit(&self) -> CircuitAck {
        self.circuit.stop().await
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            circuit: self.circuit.status(),
            harvester_running: self.harvester.is_running(),
        }
    }

    pub fn add_target(&self, target: NewTarget) -> Result<Target, StoreError> {
        let target = self.store.create_target(target)?;
        info!(target_id = target.id, "Target added");
        Ok(target)
    }

    /// Moves a target into `processing` so the worker picks it up.
    ///
    /// Starting a target that is already running re-stamps `last_run` and
    /// logs the command again.
    pub fn start_harvest(&self, target_id: u64) -> Result<Target, StoreError> {
        let now = self.context.wall_clock();
        let target = self
            .store
            .update_target_status(target_id, TargetStatus::Processing, Some(now))?
            .target;
        let message = format!(
            "[COMMAND] Initializing harvest protocol for {}...",
            target.label()
        );
        self.store.append_log(target_id, LogLevel::Info, &message, now)?;
        info!(target_id, "Harvest started");
        Ok(target)
    }

    /// Forces a target to `stopped`. Stopping a stopped target is a no-op.
    pub fn stop_harvest(&self, target_id: u64) -> Result<Target, StoreError> {
        let change = self
            .store
            .update_target_status(target_id, TargetStatus::Stopped, None)?;
        if !change.changed() {
            return Ok(change.target);
        }
        let now = self.context.wall_clock();
        self.store.append_log(
            target_id,
            LogLevel::Warning,
            "[COMMAND] Process halted by user.",
            now,
        )?;
        info!(target_id, "Harvest stopped");
        Ok(change.target)
    }

    pub fn remove_target(&self, target_id: u64) -> Result<(), StoreError> {
        self.store.delete_target(target_id)
    }

    pub fn targets(&self) -> Result<Vec<Target>, StoreError> {
        self.store.list_targets()
    }

    pub fn target_logs(&self, target_id: u64) -> Result<Vec<LogEntry>, StoreError> {
        self.store.logs_for_target(target_id)
    }

    pub fn harvested_records(&self) -> Result<Vec<HarvestedRecord>, StoreError> {
        self.store.list_records()
    }

    /// Stops the circuit, then the worker, then flushes the store.
    pub async fn shutdown(&self) {
        self.circuit.stop().await;
        self.harvester.shutdown().await;
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "Store flush failed during shutdown");
        }
        info!("Shutdown complete");
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn circuit(&self) -> &Arc<Circuit<Ctx>> {
        &self.circuit
    }

    pub fn harvester(&self) -> &Arc<HarvestWorker<Ctx, S>> {
        &self.harvester
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::store::SledHarvestStore;
    use crate::testing::ScriptedContext;
    use std::time::Duration;

    fn app() -> Chimera<ScriptedContext, SledHarvestStore> {
        let store = Arc::new(SledHarvestStore::open_temp().unwrap());
        Chimera::new(ScriptedContext::shared(21), store, ChimeraConfig::default())
    }

    #[tokio::test]
    async fn test_construction_has_no_side_effects() {
        let app = app();
        let status = app.status();
        assert_eq!(status.circuit.status, CircuitState::Stopped);
        assert!(!status.harvester_running);
        assert!(app.targets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_harvest_write_command_logs() {
        let app = app();
        let target = app
            .add_target(NewTarget::targeted("http://darkmarket.onion", "dumps"))
            .unwrap();
        assert_eq!(target.status, TargetStatus::Pending);

        let started = app.start_harvest(target.id).unwrap();
        assert_eq!(started.status, TargetStatus::Processing);
        assert!(started.last_run.is_some());

        let stopped = app.stop_harvest(target.id).unwrap();
        assert_eq!(stopped.status, TargetStatus::Stopped);
        assert_eq!(stopped.last_run, started.last_run);
        assert_eq!(app.stop_harvest(target.id).unwrap(), stopped);

        let logs = app.target_logs(target.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(
            logs[0].message,
            "[COMMAND] Initializing harvest protocol for http://darkmarket.onion..."
        );
        assert_eq!(logs[1].level, LogLevel::Warning);
        assert_eq!(logs[1].message, "[COMMAND] Process halted by user.");
    }

    #[test]
    fn test_start_harvest_twice_restamps() {
        let app = app();
        let target = app.add_target(NewTarget::global("leaks")).unwrap();
        let first = app.start_harvest(target.id).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let second = app.start_harvest(target.id).unwrap();
        assert_eq!(second.status, TargetStatus::Processing);
        assert!(second.last_run > first.last_run);

        let logs = app.target_logs(target.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.message.starts_with("[COMMAND] Initializing")));
        assert!(matches!(app.start_harvest(404), Err(StoreError::TargetNotFound(404))));
    }

    #[test]
    fn test_concurrent_stops_log_once() {
        let app = Arc::new(app());
        let target = app.add_target(NewTarget::global("leaks")).unwrap();
        app.start_harvest(target.id).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let app = Arc::clone(&app);
                std::thread::spawn(move || app.stop_harvest(target.id).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().status, TargetStatus::Stopped);
        }

        let warnings = app
            .target_logs(target.id)
            .unwrap()
            .into_iter()
            .filter(|l| l.level == LogLevel::Warning)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle() {
        let app = app();
        let target = app.add_target(NewTarget::global("credentials")).unwrap();
        app.start_harvest(target.id).unwrap();

        assert!(app.start_background_tasks());
        assert!(!app.start_background_tasks());
        assert_eq!(app.deploy_circuit().await, CircuitAck::InitializationStarted);

        tokio::time::sleep(Duration::from_secs(8)).await;
        let status = app.status();
        assert_eq!(status.circuit.status, CircuitState::Running);
        assert!(status.harvester_running);

        app.shutdown().await;
        let status = app.status();
        assert_eq!(status.circuit.status, CircuitState::Stopped);
        assert_eq!(status.circuit.ip, None);
        assert!(!status.harvester_running);

        app.remove_target(target.id).unwrap();
        assert!(app.targets().unwrap().is_empty());
    }
}
