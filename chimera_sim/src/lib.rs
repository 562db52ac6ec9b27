//! Chimera Deterministic Simulation Testing (DST) Harness
//!
//! Runs the real circuit simulator and harvest worker on a virtual clock
//! with every random draw taken from a single seed, then checks the
//! properties each service promises.
//!
//! # Core Principle
//!
//! All sources of non-determinism go through `ChimeraContext`:
//! - **Time**: `sleep()` advances a virtual clock and yields one turn
//! - **Randomness**: ChaCha8 seeded from the run seed, with optional
//!   forced draws to pin a specific branch
//! - **Storage**: a fresh temporary sled database per scenario
//!
//! # Usage
//!
//! ```ignore
//! use chimera_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Bootstrap);
//! assert!(result.passed);
//! ```

mod context;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use runner::{ScenarioError, ScenarioMetrics, ScenarioResult, ScenarioRunner};
