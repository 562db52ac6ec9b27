//! Simulation context implementing ChimeraContext for deterministic testing.

use async_trait::async_trait;
use chimera_env::ChimeraContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Instrument;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `ChimeraContext` using:
/// - A virtual clock that can be advanced manually
/// - A seeded ChaCha8 RNG for every random decision
/// - A queue of forced `random_unit` draws, consumed before the RNG
/// - Simulated sleep that advances virtual time and yields once
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for decisions
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Scripted draws for `random_unit`
    forced_units: Arc<Mutex<VecDeque<f64>>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            forced_units: Arc::new(Mutex::new(VecDeque::new())),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap()
    }

    /// Queues values to be returned by the next `random_unit` calls.
    pub fn force_units(&self, units: &[f64]) {
        self.forced_units.lock().unwrap().extend(units.iter().copied());
    }

    /// Number of forced draws not yet consumed.
    pub fn pending_forced(&self) -> usize {
        self.forced_units.lock().unwrap().len()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            forced_units: Arc::clone(&self.forced_units),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl ChimeraContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
        // Give every other task one turn before the sleeper resumes.
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name, seed = self.seed);
        tokio::spawn(future.instrument(span));
    }

    fn random_unit(&self) -> f64 {
        let forced = self.forced_units.lock().unwrap().pop_front();
        match forced {
            Some(unit) => unit,
            None => self.rng.lock().unwrap().gen::<f64>(),
        }
    }

    fn random_range(&self, range: RangeInclusive<u32>) -> u32 {
        self.rng.lock().unwrap().gen_range(range)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.time_ns(), 1_500_000_000);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_clock() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_secs(5)).await;
        assert_eq!(ctx.now(), Duration::from_secs(5));
        assert_eq!(
            ctx.system_time(),
            UNIX_EPOCH + Duration::from_secs(1704067200 + 5)
        );
    }

    #[test]
    fn test_sim_context_deterministic_draws() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);

        for _ in 0..32 {
            assert_eq!(ctx1.random_unit(), ctx2.random_unit());
            assert_eq!(ctx1.random_range(10..=255), ctx2.random_range(10..=255));
        }
    }

    #[test]
    fn test_forced_units_consumed_first() {
        let ctx = SimContext::new(3);
        let reference = SimContext::new(3);
        ctx.force_units(&[0.25, 0.75]);
        assert_eq!(ctx.pending_forced(), 2);

        assert_eq!(ctx.random_unit(), 0.25);
        assert_eq!(ctx.random_unit(), 0.75);
        assert_eq!(ctx.pending_forced(), 0);
        // Forced draws do not consume the generator.
        assert_eq!(ctx.random_unit(), reference.random_unit());
    }

    #[test]
    fn test_sim_context_clone_shares_state() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        ctx1.force_units(&[0.5]);

        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(ctx2.random_unit(), 0.5);
    }
}
