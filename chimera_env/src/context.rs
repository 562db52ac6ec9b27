//! Core environment context trait for Chimera services.

use async_trait::async_trait;
use jiff::Timestamp;
use std::future::Future;
use std::ops::RangeInclusive;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the circuit simulator and
/// the harvest worker can run in both production (tokio) and simulation
/// (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `StdRng`
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Every source of non-determinism the services touch (time, randomness)
/// goes through this trait, so a seeded implementation replays the same
/// decisions run after run.
#[async_trait]
pub trait ChimeraContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for log and record timestamps.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Returns the wall-clock time as a `jiff` timestamp.
    fn wall_clock(&self) -> Timestamp {
        Timestamp::try_from(self.system_time()).unwrap_or(Timestamp::UNIX_EPOCH)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    ///
    /// The name is attached to a tracing span wrapping the task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Draws a uniform value in `[0, 1)`.
    ///
    /// All probabilistic branching (heartbeat logs, harvest actions,
    /// task completion) is decided by comparing against this draw.
    fn random_unit(&self) -> f64;

    /// Draws a uniform integer from an inclusive range.
    fn random_range(&self, range: RangeInclusive<u32>) -> u32;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// Returns 0 when the context draws from OS entropy.
    fn seed(&self) -> u64;
}
