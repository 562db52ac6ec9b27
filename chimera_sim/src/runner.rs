//! Scenario runner - executes simulation scenarios against the real services.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;

use chimera_core::{
    Chimera, ChimeraConfig, CircuitAck, CircuitConfig, CircuitState, CircuitStatus,
    HarvestStore, NewTarget, SledHarvestStore, StoreError, Target, TargetStatus,
};
use chimera_core::model::{parse_keywords, FALLBACK_KEYWORD};
use chimera_env::ChimeraContext;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

type SimApp = Chimera<SimContext, SledHarvestStore>;

/// Rolls that land in each default weight band.
const ROLL_DATA: f64 = 0.5;
const ROLL_STAY: f64 = 0.99;

const BOOTSTRAP_MARKERS: [&str; 5] = [
    "Bootstrapped 0%",
    "Bootstrapped 10%",
    "Bootstrapped 50%",
    "Bootstrapped 80%",
    "Bootstrapped 100%",
];

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Virtual time elapsed in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Harvest cycles executed
    pub cycles: u64,

    /// Log lines written by the worker
    pub logs_written: u64,

    /// Records synthesized
    pub records_found: u64,

    /// Targets moved to completed
    pub targets_completed: u64,

    /// Distinct circuit states observed, in order
    pub circuit_states: Vec<CircuitState>,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Harvest cycles for sweep scenarios
    harvest_cycles: usize,

    /// Scheduler turns allowed while waiting on the circuit
    max_turns: usize,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            harvest_cycles: 200,
            max_turns: 10_000,
        }
    }

    /// Sets the number of harvest cycles.
    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.harvest_cycles = cycles;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let context = SimContext::shared(self.seed);
        let outcome = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ScenarioError::Runtime(e.to_string()))
            .and_then(|rt| rt.block_on(self.execute(scenario, Arc::clone(&context))));

        let (passed, failure_reason, metrics) = match outcome {
            Ok(metrics) => (true, None, metrics),
            Err(e) => (false, Some(e.to_string()), ScenarioMetrics::default()),
        };
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            final_time_secs: context.now().as_secs_f64(),
            failure_reason,
            metrics,
        }
    }

    async fn execute(
        &self,
        scenario: ScenarioId,
        context: Arc<SimContext>,
    ) -> Result<ScenarioMetrics, ScenarioError> {
        let config = match scenario {
            ScenarioId::LogRetention => ChimeraConfig {
                circuit: CircuitConfig {
                    heartbeat_probability: 1.0,
                    ..CircuitConfig::default()
                },
                ..ChimeraConfig::default()
            },
            _ => ChimeraConfig::default(),
        };
        let store = Arc::new(SledHarvestStore::open_temp()?);
        let app = Chimera::new(context, store, config);

        match scenario {
            ScenarioId::Bootstrap => self.run_bootstrap(&app).await,
            ScenarioId::StopMidBootstrap => self.run_stop_mid_bootstrap(&app).await,
            ScenarioId::DoubleStart => self.run_double_start(&app).await,
            ScenarioId::HarvestSweep => self.run_harvest_sweep(&app),
            ScenarioId::DataFallback => self.run_data_fallback(&app),
            ScenarioId::StoppedTargetUntouched => self.run_stopped_target_untouched(&app),
            ScenarioId::LogRetention => self.run_log_retention(&app).await,
        }
    }

    /// DST-001: Bootstrap walks every state and lands on a 10.2.x.y address.
    async fn run_bootstrap(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        let started_at = app.circuit().status().status;
        ensure(started_at == CircuitState::Stopped, || {
            format!("fresh circuit in {}", started_at)
        })?;

        ensure(app.deploy_circuit().await == CircuitAck::InitializationStarted, || {
            "first start() not acknowledged".into()
        })?;
        let running = self
            .wait_for(app, &mut metrics, |s| s.status == CircuitState::Running)
            .await?;

        check_state_order(&metrics.circuit_states)?;
        check_bootstrap_log(&running)?;
        let ip = running
            .ip
            .ok_or_else(|| ScenarioError::Assertion("RUNNING without IP".into()))?;
        let [a, b, x, y] = ip.octets();
        ensure(a == 10 && b == 2 && (10..=99).contains(&x) && y >= 10, || {
            format!("virtual IP {} outside 10.2.[10-99].[10-255]", ip)
        })?;
        let elapsed = app.circuit().config().bootstrap_duration();
        ensure(app.context().now() >= elapsed, || {
            format!("RUNNING before {:?} of virtual time", elapsed)
        })?;

        self.stop_and_verify(app).await?;
        Ok(metrics)
    }

    /// DST-002: stop() issued a seed-dependent number of turns into bootstrap.
    async fn run_stop_mid_bootstrap(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        app.deploy_circuit().await;

        let turns = app.context().random_range(0..=6);
        debug!(turns, "Stopping mid-bootstrap");
        for _ in 0..turns {
            record_state(&mut metrics, &app.circuit().status());
            tokio::task::yield_now().await;
        }
        self.stop_and_verify(app).await?;

        // A leaked task would keep advancing the state machine.
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
        let status = app.circuit().status();
        ensure(status.status == CircuitState::Stopped && status.ip.is_none(), || {
            format!("circuit moved to {} after stop()", status.status)
        })?;
        check_state_order(&metrics.circuit_states)?;
        Ok(metrics)
    }

    /// DST-003: Duplicate control calls are acknowledged without side effects.
    async fn run_double_start(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        ensure(app.deploy_circuit().await == CircuitAck::InitializationStarted, || {
            "first start() not acknowledged".into()
        })?;
        ensure(app.deploy_circuit().await == CircuitAck::AlreadyRunning, || {
            "second start() spawned a new bootstrap".into()
        })?;

        let running = self
            .wait_for(app, &mut metrics, |s| s.status == CircuitState::Running)
            .await?;
        ensure(app.deploy_circuit().await == CircuitAck::AlreadyRunning, || {
            "start() while RUNNING not a no-op".into()
        })?;
        let starts = running
            .logs
            .iter()
            .filter(|l| l.contains(BOOTSTRAP_MARKERS[0]))
            .count();
        ensure(starts == 1, || format!("{} bootstrap tasks ran", starts))?;

        self.stop_and_verify(app).await?;
        let before = app.circuit().status();
        ensure(app.stop_circuit().await == CircuitAck::AlreadyStopped, || {
            "second stop() not idempotent".into()
        })?;
        ensure(app.circuit().status() == before, || {
            "second stop() mutated the circuit".into()
        })?;
        Ok(metrics)
    }

    /// DST-004: Random cycles over a mix of active and inactive targets.
    fn run_harvest_sweep(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        app.store().seed_defaults()?;
        let seeded = app.targets()?;
        let first = seeded
            .iter()
            .find(|t| t.status == TargetStatus::Pending)
            .ok_or_else(|| ScenarioError::Assertion("no pending seed target".into()))?;
        app.start_harvest(first.id)?;
        let blank = app.add_target(NewTarget::global(""))?;
        app.start_harvest(blank.id)?;
        app.add_target(NewTarget::targeted("http://idle.onion", "never"))?;

        let active: HashMap<u64, Target> = app
            .store()
            .list_targets_by_status(TargetStatus::Processing)?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        let inactive: Vec<Target> = app
            .targets()?
            .into_iter()
            .filter(|t| !active.contains_key(&t.id))
            .collect();

        let interval = app.harvester().config().poll_interval;
        let mut completed: Vec<u64> = Vec::new();
        for _ in 0..self.harvest_cycles {
            let report = app.harvester().run_cycle();
            app.context().advance_time(interval);
            ensure(report.failures.is_empty(), || {
                format!("cycle failures: {:?}", report.failures)
            })?;
            metrics.cycles += 1;
            metrics.logs_written += report.logs_written as u64;
            metrics.records_found += report.records_found as u64;
            metrics.targets_completed += report.targets_completed as u64;

            for id in &completed {
                let status = app.store().get_target(*id)?.status;
                ensure(status == TargetStatus::Completed, || {
                    format!("target {} regressed to {}", id, status)
                })?;
            }
            for target in app.store().list_targets_by_status(TargetStatus::Completed)? {
                if !completed.contains(&target.id) {
                    completed.push(target.id);
                }
            }
        }

        check_inactive_untouched(app, &inactive)?;
        for record in app.harvested_records()? {
            let owner = active.get(&record.target_id).ok_or_else(|| {
                ScenarioError::Assertion(format!("record {} has no active owner", record.id))
            })?;
            check_keyword(owner, &record.matched_keywords)?;
        }
        info!(
            "✓ HarvestSweep: {} cycles, {} records, {} completed",
            metrics.cycles, metrics.records_found, metrics.targets_completed
        );
        Ok(metrics)
    }

    /// DST-005: `{keywords="credit cards, dumps", url=""}` with the data action forced.
    fn run_data_fallback(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        let target = app.add_target(NewTarget::targeted("", "credit cards, dumps"))?;
        app.start_harvest(target.id)?;

        app.context().force_units(&[ROLL_DATA, ROLL_STAY]);
        let report = app.harvester().run_cycle();
        metrics.cycles = 1;
        metrics.records_found = report.records_found as u64;
        metrics.logs_written = report.logs_written as u64;

        let records = app.store().records_for_target(target.id)?;
        let record = match records.as_slice() {
            [record] => record,
            other => {
                return Err(ScenarioError::Assertion(format!(
                    "expected one record, found {}",
                    other.len()
                )))
            }
        };
        ensure(
            ["credit cards", "dumps"].contains(&record.matched_keywords.as_str()),
            || format!("keyword {:?} not in target list", record.matched_keywords),
        )?;
        ensure(is_onion_fallback(&record.url), || {
            format!("url {:?} is not an onion fallback", record.url)
        })?;
        Ok(metrics)
    }

    /// DST-006: Pending and stopped targets are never touched by a cycle.
    fn run_stopped_target_untouched(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        app.store().seed_defaults()?;
        let inactive = app.targets()?;
        let active = app.add_target(NewTarget::global("database"))?;
        app.start_harvest(active.id)?;

        for _ in 0..20 {
            app.context().force_units(&[ROLL_DATA, ROLL_STAY]);
            let report = app.harvester().run_cycle();
            metrics.cycles += 1;
            metrics.records_found += report.records_found as u64;
        }

        check_inactive_untouched(app, &inactive)?;
        let found = app.store().records_for_target(active.id)?.len() as u64;
        ensure(found == metrics.cycles, || {
            format!("{} records for {} forced cycles", found, metrics.cycles)
        })?;
        Ok(metrics)
    }

    /// DST-007: Every heartbeat logs; the ring must stay bounded.
    async fn run_log_retention(&self, app: &SimApp) -> Result<ScenarioMetrics, ScenarioError> {
        let mut metrics = ScenarioMetrics::default();
        app.deploy_circuit().await;
        self.wait_for(app, &mut metrics, |s| s.status == CircuitState::Running)
            .await?;

        let capacity = app.circuit().config().log_capacity;
        let exposed = app.circuit().config().exposed_logs;
        for _ in 0..(capacity * 4) {
            tokio::task::yield_now().await;
            let status = app.circuit().status();
            ensure(status.logs.len() <= exposed, || {
                format!("{} lines exposed", status.logs.len())
            })?;
            ensure(app.circuit().retained_logs() <= capacity, || {
                format!("{} lines retained", app.circuit().retained_logs())
            })?;
        }

        ensure(app.circuit().retained_logs() == capacity, || {
            "heartbeat flood did not fill the ring".into()
        })?;
        let status = app.circuit().status();
        ensure(
            status.logs.iter().all(|l| l.contains("Heartbeat")),
            || "oldest lines were not evicted first".into(),
        )?;

        self.stop_and_verify(app).await?;
        Ok(metrics)
    }

    /// Yields until `done` holds, recording every distinct state seen.
    async fn wait_for(
        &self,
        app: &SimApp,
        metrics: &mut ScenarioMetrics,
        done: impl Fn(&CircuitStatus) -> bool,
    ) -> Result<CircuitStatus, ScenarioError> {
        for _ in 0..self.max_turns {
            let status = app.circuit().status();
            record_state(metrics, &status);
            if done(&status) {
                return Ok(status);
            }
            tokio::task::yield_now().await;
        }
        Err(ScenarioError::Assertion(format!(
            "circuit stuck in {} after {} turns",
            app.circuit().status().status,
            self.max_turns
        )))
    }

    async fn stop_and_verify(&self, app: &SimApp) -> Result<(), ScenarioError> {
        let ack = app.stop_circuit().await;
        ensure(ack == CircuitAck::StoppedSuccessfully, || {
            format!("stop() returned {:?}", ack)
        })?;
        let status = app.circuit().status();
        ensure(status.status == CircuitState::Stopped && status.ip.is_none(), || {
            format!("stop() returned with state {} ip {:?}", status.status, status.ip)
        })
    }
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioError::Assertion(message()))
    }
}

fn record_state(metrics: &mut ScenarioMetrics, status: &CircuitStatus) {
    if metrics.circuit_states.last() != Some(&status.status) {
        metrics.circuit_states.push(status.status);
    }
}

/// Observed states must follow the forward bootstrap order.
fn check_state_order(states: &[CircuitState]) -> Result<(), ScenarioError> {
    const ORDER: [CircuitState; 4] = [
        CircuitState::Stopped,
        CircuitState::Starting,
        CircuitState::Synchronizing,
        CircuitState::Running,
    ];
    let rank = |s: &CircuitState| ORDER.iter().position(|o| o == s);
    let mut last = 0;
    for state in states {
        let r = rank(state).ok_or_else(|| {
            ScenarioError::Assertion(format!("unexpected {} during bootstrap", state))
        })?;
        ensure(r >= last, || format!("state went backwards: {:?}", states))?;
        last = r;
    }
    Ok(())
}

/// Every bootstrap stage must have been logged, in order.
fn check_bootstrap_log(status: &CircuitStatus) -> Result<(), ScenarioError> {
    let mut remaining = BOOTSTRAP_MARKERS.iter().peekable();
    for line in &status.logs {
        if let Some(marker) = remaining.peek() {
            if line.contains(*marker) {
                remaining.next();
            }
        }
    }
    match remaining.next() {
        None => Ok(()),
        Some(missing) => Err(ScenarioError::Assertion(format!(
            "bootstrap skipped stage {:?}",
            missing
        ))),
    }
}

fn check_inactive_untouched(app: &SimApp, inactive: &[Target]) -> Result<(), ScenarioError> {
    for before in inactive {
        let after = app.store().get_target(before.id)?;
        ensure(&after == before, || format!("inactive target {} mutated", before.id))?;
        let records = app.store().records_for_target(before.id)?.len();
        ensure(records == 0, || {
            format!("inactive target {} gained {} records", before.id, records)
        })?;
    }
    Ok(())
}

fn check_keyword(owner: &Target, keyword: &str) -> Result<(), ScenarioError> {
    let allowed = parse_keywords(&owner.keywords);
    let ok = if allowed.is_empty() {
        keyword == FALLBACK_KEYWORD
    } else {
        allowed.iter().any(|k| k == keyword)
    };
    ensure(ok, || {
        format!("keyword {:?} not from {:?}", keyword, owner.keywords)
    })
}

/// Matches `http://dark<100-999>.onion/post/<1-500>`.
fn is_onion_fallback(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("http://dark") else {
        return false;
    };
    let Some((host, post)) = rest.split_once(".onion/post/") else {
        return false;
    };
    let host_ok = matches!(host.parse::<u32>(), Ok(100..=999)) && host.len() == 3;
    let post_ok = matches!(post.parse::<u32>(), Ok(1..=500));
    host_ok && post_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_all_scenarios_pass() {
        for scenario in ScenarioId::all() {
            let result = ScenarioRunner::new(42).with_cycles(50).run(scenario);
            assert!(
                result.passed,
                "{} failed: {:?}",
                scenario,
                result.failure_reason
            );
        }
    }

    #[test]
    fn test_bootstrap_reports_states_and_time() {
        let result = ScenarioRunner::new(7).run(ScenarioId::Bootstrap);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.circuit_states.first(), Some(&CircuitState::Stopped));
        assert_eq!(result.metrics.circuit_states.last(), Some(&CircuitState::Running));
        assert!(result.final_time_secs >= 6.5);
    }

    #[test]
    fn test_data_fallback_counts() {
        let result = ScenarioRunner::new(1).run(ScenarioId::DataFallback);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.records_found, 1);
        assert_eq!(result.metrics.logs_written, 1);
    }

    #[test]
    fn test_state_order_check() {
        use CircuitState::*;
        assert!(check_state_order(&[Stopped, Starting, Synchronizing, Running]).is_ok());
        assert!(check_state_order(&[Starting, Running]).is_ok());
        assert!(check_state_order(&[Starting, Running, Synchronizing]).is_err());
        assert!(check_state_order(&[Starting, Stopping]).is_err());
    }

    #[test]
    fn test_onion_fallback_pattern() {
        assert!(is_onion_fallback("http://dark123.onion/post/1"));
        assert!(is_onion_fallback("http://dark999.onion/post/500"));
        assert!(!is_onion_fallback("http://dark99.onion/post/1"));
        assert!(!is_onion_fallback("http://dark123.onion/post/501"));
        assert!(!is_onion_fallback("http://darkmarket.onion"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_circuit_scenarios_hold_for_any_seed(seed in any::<u64>()) {
            for scenario in ScenarioId::all().into_iter().filter(|s| s.is_circuit()) {
                let result = ScenarioRunner::new(seed).run(scenario);
                prop_assert!(result.passed, "{} seed={} {:?}", scenario, seed, result.failure_reason);
            }
        }

        #[test]
        fn prop_harvest_sweep_holds_for_any_seed(seed in any::<u64>()) {
            let result = ScenarioRunner::new(seed).with_cycles(40).run(ScenarioId::HarvestSweep);
            prop_assert!(result.passed, "seed={} {:?}", seed, result.failure_reason);
        }
    }
}
