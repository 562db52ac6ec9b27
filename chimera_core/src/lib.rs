//! Chimera Core - background harvest simulation engine
//!
//! Two independent background services mutate state on timers:
//! 1. **Circuit Simulator**: bootstraps and maintains a simulated
//!    anonymity circuit through an explicit state machine
//! 2. **Harvest Worker**: polls `processing` targets and stochastically
//!    writes log lines, discovers records and completes targets
//!
//! Both are owned by the `Chimera` supervisor, which is the surface an
//! outer API layer calls into.

pub mod circuit;
pub mod harvester;
pub mod model;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use circuit::{Circuit, CircuitAck, CircuitConfig, CircuitState, CircuitStatus};
pub use harvester::{CycleReport, HarvestAction, HarvestConfig, HarvestWorker};
pub use model::{HarvestedRecord, LogEntry, LogLevel, NewTarget, Target, TargetStatus};
pub use store::{HarvestStore, SledHarvestStore, StatusChange, StoreError};
pub use supervisor::{Chimera, ChimeraConfig, SystemStatus};
