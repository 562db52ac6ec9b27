//! Chimera Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the circuit
//! simulator and harvest worker to run in both **Production** (tokio) and
//! **Simulation** (virtual clock) environments.
//!
//! # Core Concept
//!
//! Background services never call `tokio::time` or `rand` directly. They
//! go through a context instead:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Randomness (`random_unit()`, `random_range()`)
//!
//! By deriving all entropy from a single 64-bit seed, any simulation run
//! becomes reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use chimera_env::ChimeraContext;
//!
//! async fn poll_loop<Ctx: ChimeraContext>(ctx: &Ctx) {
//!     loop {
//!         if ctx.random_unit() < 0.4 {
//!             emit_log();
//!         }
//!         ctx.sleep(Duration::from_secs(3)).await;
//!     }
//! }
//! ```

mod context;
mod tokio_impl;

pub use context::ChimeraContext;
pub use tokio_impl::TokioContext;
