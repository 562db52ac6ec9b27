//! Simulation scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Full bootstrap to RUNNING, then stop
    Bootstrap,

    /// DST-002: Stop issued before bootstrap completes
    StopMidBootstrap,

    /// DST-003: Back-to-back start and stop calls
    DoubleStart,

    /// DST-004: Many harvest cycles over the seeded targets
    HarvestSweep,

    /// DST-005: Forced data action on a target with no URL
    DataFallback,

    /// DST-006: Inactive targets across forced cycles
    StoppedTargetUntouched,

    /// DST-007: Heartbeat flood against the log ring caps
    LogRetention,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Bootstrap,
            ScenarioId::StopMidBootstrap,
            ScenarioId::DoubleStart,
            ScenarioId::HarvestSweep,
            ScenarioId::DataFallback,
            ScenarioId::StoppedTargetUntouched,
            ScenarioId::LogRetention,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Bootstrap => "bootstrap",
            ScenarioId::StopMidBootstrap => "stop_mid_bootstrap",
            ScenarioId::DoubleStart => "double_start",
            ScenarioId::HarvestSweep => "harvest_sweep",
            ScenarioId::DataFallback => "data_fallback",
            ScenarioId::StoppedTargetUntouched => "stopped_target_untouched",
            ScenarioId::LogRetention => "log_retention",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Bootstrap => "STOPPED → STARTING → SYNCHRONIZING → RUNNING, virtual IP in 10.2.x.y",
            ScenarioId::StopMidBootstrap => "stop() joins the bootstrap task and leaves STOPPED with no IP",
            ScenarioId::DoubleStart => "Second start() is a no-op, second stop() changes nothing",
            ScenarioId::HarvestSweep => "Random cycles never regress status or touch inactive targets",
            ScenarioId::DataFallback => "Record keyword from the target list, onion-style fallback URL",
            ScenarioId::StoppedTargetUntouched => "Pending and stopped targets gain no logs or records",
            ScenarioId::LogRetention => "Exposed log ≤ 10, retained log ≤ 50, FIFO eviction",
        }
    }

    /// Returns true if the scenario exercises the circuit simulator.
    pub fn is_circuit(&self) -> bool {
        matches!(
            self,
            ScenarioId::Bootstrap
                | ScenarioId::StopMidBootstrap
                | ScenarioId::DoubleStart
                | ScenarioId::LogRetention
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bootstrap" | "dst-001" => Ok(ScenarioId::Bootstrap),
            "stop_mid_bootstrap" | "stopmidbootstrap" | "dst-002" => Ok(ScenarioId::StopMidBootstrap),
            "double_start" | "doublestart" | "dst-003" => Ok(ScenarioId::DoubleStart),
            "harvest_sweep" | "harvestsweep" | "dst-004" => Ok(ScenarioId::HarvestSweep),
            "data_fallback" | "datafallback" | "dst-005" => Ok(ScenarioId::DataFallback),
            "stopped_target_untouched" | "dst-006" => Ok(ScenarioId::StoppedTargetUntouched),
            "log_retention" | "logretention" | "dst-007" => Ok(ScenarioId::LogRetention),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
            assert_eq!(id.to_string(), id.name());
        }
        assert_eq!("DST-005".parse::<ScenarioId>().unwrap(), ScenarioId::DataFallback);
        assert!("warp".parse::<ScenarioId>().is_err());
    }
}
