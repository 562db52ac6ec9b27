//! Production implementation of ChimeraContext using Tokio.

use crate::ChimeraContext;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::Instrument;

/// Production context backed by Tokio.
///
/// Time comes from the system clock. Randomness comes from a `StdRng`
/// that is either seeded explicitly or drawn from OS entropy.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Random decision source
    rng: Mutex<StdRng>,

    /// Seed used for `rng`, 0 when drawn from entropy
    seed: u64,
}

impl TokioContext {
    /// Creates a new TokioContext seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            rng: Mutex::new(StdRng::from_entropy()),
            seed: 0,
        }
    }

    /// Creates a TokioContext with a reproducible random source.
    pub fn seeded(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChimeraContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn random_unit(&self) -> f64 {
        self.rng.lock().expect("rng lock poisoned").gen::<f64>()
    }

    fn random_range(&self, range: RangeInclusive<u32>) -> u32 {
        self.rng.lock().expect("rng lock poisoned").gen_range(range)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_seeded_contexts_agree() {
        let a = TokioContext::seeded(7);
        let b = TokioContext::seeded(7);

        for _ in 0..16 {
            assert_eq!(a.random_unit(), b.random_unit());
            assert_eq!(a.random_range(10..=99), b.random_range(10..=99));
        }
    }

    #[test]
    fn test_random_draws_in_range() {
        let ctx = TokioContext::new();
        for _ in 0..256 {
            let u = ctx.random_unit();
            assert!((0.0..1.0).contains(&u));
            let n = ctx.random_range(100..=999);
            assert!((100..=999).contains(&n));
        }
    }

    #[test]
    fn test_tokio_context_seed() {
        assert_eq!(TokioContext::new().seed(), 0);
        assert_eq!(TokioContext::seeded(12345).seed(), 12345);
    }

    #[tokio::test]
    async fn test_spawn_runs_future() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("probe", async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
