//! Test context with scripted random draws.

use async_trait::async_trait;
use chimera_env::{ChimeraContext, TokioContext};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// A seeded `TokioContext` whose `random_unit` draws can be forced.
///
/// Forced values are consumed first, in order; once exhausted, draws fall
/// back to the seeded generator. `random_range` is never scripted.
pub(crate) struct ScriptedContext {
    inner: TokioContext,
    units: Mutex<VecDeque<f64>>,
}

impl ScriptedContext {
    pub(crate) fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: TokioContext::seeded(seed),
            units: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn force_units(&self, units: &[f64]) {
        self.units.lock().unwrap().extend(units.iter().copied());
    }
}

#[async_trait]
impl ChimeraContext for ScriptedContext {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn system_time(&self) -> SystemTime {
        self.inner.system_time()
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn(name, future);
    }

    fn random_unit(&self) -> f64 {
        let forced = self.units.lock().unwrap().pop_front();
        forced.unwrap_or_else(|| self.inner.random_unit())
    }

    fn random_range(&self, range: RangeInclusive<u32>) -> u32 {
        self.inner.random_range(range)
    }

    fn seed(&self) -> u64 {
        self.inner.seed()
    }
}
