//! Simulated cluster configuration.

use std::path::PathBuf;
use std::time::Duration;

use rollout_core::Version;
use rollout_harness::{ClusterConfig, ConfigError};

/// Behaviour knobs of the simulated cluster.
///
/// Delays model how long the real cluster takes to notice a change; they
/// must stay below the harness's polling budgets for scenarios to pass.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of nodes.
    pub size: u32,
    /// Replication factor reported in the topology.
    pub replication_factor: u32,
    /// Time until a stopped node disappears from the topology.
    pub failure_detection: Duration,
    /// Time until a started node appears in the topology.
    pub join_delay: Duration,
    /// Time until a deployment is known to the partition leader.
    pub deployment_distribution: Duration,
    /// Time a graceful shutdown takes.
    pub shutdown_delay: Duration,
    /// Interval of the leader's snapshot attempts.
    pub snapshot_period: Duration,
    /// Records that must be written since the last snapshot to take a new one.
    pub snapshot_min_records: u64,
    /// Snapshot directory inside a node's data directory.
    pub snapshot_subpath: PathBuf,
    /// Time after which an activated, uncompleted job is handed out again.
    pub job_timeout: Duration,
    /// Probability in `[0, 1]` that a topology or activation request fails.
    pub query_failure_rate: f64,
    /// Seed of the fault injection RNG.
    pub seed: u64,
    /// Versions whose nodes never rejoin the topology.
    pub refuse_join_versions: Vec<Version>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::from_cluster(&ClusterConfig::default())
    }
}

impl SimConfig {
    /// Simulation matching `cluster`'s size, snapshot period and layout.
    #[must_use]
    pub fn from_cluster(cluster: &ClusterConfig) -> Self {
        let shape = cluster.shape();
        Self {
            size: shape.size,
            replication_factor: shape.replication_factor,
            failure_detection: Duration::from_secs(1),
            join_delay: Duration::from_millis(500),
            deployment_distribution: Duration::from_millis(200),
            shutdown_delay: Duration::from_millis(100),
            snapshot_period: cluster.snapshot_period,
            snapshot_min_records: 10,
            snapshot_subpath: cluster.snapshot_subpath.clone(),
            job_timeout: Duration::from_secs(5),
            query_failure_rate: 0.0,
            seed: 42,
            refuse_join_versions: Vec::new(),
        }
    }

    /// Sets the fault injection seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the query failure rate.
    #[must_use]
    pub fn with_query_failure_rate(mut self, rate: f64) -> Self {
        self.query_failure_rate = rate;
        self
    }

    /// Sets the graceful shutdown duration.
    #[must_use]
    pub const fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Sets the failure detection delay.
    #[must_use]
    pub const fn with_failure_detection(mut self, delay: Duration) -> Self {
        self.failure_detection = delay;
        self
    }

    /// Nodes on `version` never rejoin.
    #[must_use]
    pub fn refusing_join(mut self, version: impl Into<Version>) -> Self {
        self.refuse_join_versions.push(version.into());
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error for an empty cluster, a zero snapshot period, or a
    /// failure rate outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 || self.replication_factor == 0 {
            return Err(ConfigError::InvalidCluster {
                message: "size and replication factor must be positive".to_string(),
            });
        }
        if self.snapshot_period.is_zero() {
            return Err(ConfigError::InvalidTiming {
                message: "snapshot_period must be non-zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.query_failure_rate) {
            return Err(ConfigError::InvalidCluster {
                message: format!(
                    "query_failure_rate {} is outside [0, 1]",
                    self.query_failure_rate
                ),
            });
        }
        Ok(())
    }
}
