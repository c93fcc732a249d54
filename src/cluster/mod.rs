//! Cluster reconciliation
//!
//! [`ClusterContext`] owns the declared topology, the collaborators and the
//! per-run state (sequences, live inventory, discovery drivers) and drives a
//! deploy from consul bootstrap to the last business level.

pub mod consul;
pub mod containers;
pub mod context;
pub mod inventory;
pub mod machines;
pub mod plan;
pub mod services;

pub use context::ClusterContext;
pub use inventory::Inventory;
pub use plan::DeployPlan;
pub use services::ServiceCoordinator;

/// Default share of a group's running containers cycled at once
pub const DEFAULT_STEP_PERCENT: u32 = 25;

/// Switches of one deploy run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    /// Destroy machines above a group's maximum
    pub machine_scale_in: bool,
    /// Start or create machines up to a group's minimum
    pub machine_scale_out: bool,
    /// Stop containers above a group's count
    pub container_scale_in: bool,
    /// Run containers up to a group's count
    pub container_scale_out: bool,
    /// Remove stopped containers after a group is deployed
    pub remove_stopped: bool,
    /// Share of running containers cycled at once during a rolling update
    pub step_percent: u32,
    /// Container filters as `(key, value)` pairs
    pub filters: Vec<(String, String)>,
    /// Continue when a machine group stays below its minimum
    pub allow_degraded: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            machine_scale_in: false,
            machine_scale_out: false,
            container_scale_in: false,
            container_scale_out: false,
            remove_stopped: true,
            step_percent: DEFAULT_STEP_PERCENT,
            filters: Vec::new(),
            allow_degraded: false,
        }
    }
}

impl DeployOptions {
    /// How many of `running` containers may be cycled at once, at least one
    pub fn rolling_limit(&self, running: usize) -> usize {
        let limit = (running * self.step_percent as usize).div_ceil(100);
        limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_limit() {
        let options = DeployOptions::default();
        assert_eq!(options.rolling_limit(10), 3);
        assert_eq!(options.rolling_limit(4), 1);
        assert_eq!(options.rolling_limit(1), 1);
        assert_eq!(options.rolling_limit(0), 1);

        let options = DeployOptions {
            step_percent: 100,
            ..DeployOptions::default()
        };
        assert_eq!(options.rolling_limit(7), 7);
    }
}
