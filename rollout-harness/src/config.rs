//! Harness configuration.
//!
//! Cluster-wide values handed to every node at start, the polling budgets of
//! each wait the harness performs, and the versions under test.

use std::path::PathBuf;
use std::time::Duration;

use rollout_core::{ClusterShape, Version};

use crate::error::ConfigError;
use crate::poll::PollPolicy;

/// Environment variable that relocates the shared data root.
///
/// Some CI hosts run the harness in a sibling container where bind mounts
/// below `/tmp` do not persist, so the data root must be movable.
pub const SHARED_DATA_ENV: &str = "ROLLOUT_SHARED_DATA";

/// Cluster-wide configuration shared by every node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes; also the replication factor.
    pub size: u32,
    /// Cluster name passed to every node.
    pub cluster_name: String,
    /// Prefix of each node's advertised host (`broker-0`, `broker-1`, ...).
    pub host_prefix: String,
    /// Port of the internal (membership/replication) API.
    pub internal_port: u16,
    /// Port of the client gateway.
    pub gateway_port: u16,
    /// Prefix of the environment variables passed to nodes.
    pub env_prefix: String,
    /// Whether membership updates are broadcast.
    pub broadcast_updates: bool,
    /// Membership sync interval.
    pub membership_sync_interval: Duration,
    /// Interval between state snapshots.
    pub snapshot_period: Duration,
    /// Maximum message size, passed through verbatim (e.g. `128KB`).
    pub max_message_size: String,
    /// Node log level, passed through verbatim.
    pub node_log_level: String,
    /// Snapshot directory relative to a node's data directory.
    pub snapshot_subpath: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: 3,
            cluster_name: "rollout-cluster".to_string(),
            host_prefix: "broker-".to_string(),
            internal_port: 26502,
            gateway_port: 26500,
            env_prefix: "NODE_".to_string(),
            broadcast_updates: true,
            membership_sync_interval: Duration::from_millis(250),
            snapshot_period: Duration::from_secs(60),
            max_message_size: "128KB".to_string(),
            node_log_level: "debug".to_string(),
            snapshot_subpath: PathBuf::from("raft-partition/partitions/1/snapshots"),
        }
    }
}

impl ClusterConfig {
    /// Size and replication factor the cluster must keep reporting.
    #[must_use]
    pub const fn shape(&self) -> ClusterShape {
        ClusterShape::new(self.size, self.size)
    }

    /// Sets the cluster size.
    #[must_use]
    pub const fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Sets the snapshot period.
    #[must_use]
    pub const fn with_snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period = period;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Tolerating one absent node needs a majority of the rest.
        if self.size < 3 {
            return Err(ConfigError::InvalidCluster {
                message: format!("size must be at least 3, got {}", self.size),
            });
        }
        if self.host_prefix.is_empty() {
            return Err(ConfigError::InvalidCluster {
                message: "host_prefix must not be empty".to_string(),
            });
        }
        if self.internal_port == self.gateway_port {
            return Err(ConfigError::InvalidCluster {
                message: "internal_port and gateway_port must differ".to_string(),
            });
        }
        if self.snapshot_subpath.is_absolute() {
            return Err(ConfigError::InvalidCluster {
                message: "snapshot_subpath must be relative to the data directory".to_string(),
            });
        }
        Ok(())
    }
}

/// Polling budgets and lifecycle bounds.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Bound on a graceful shutdown before the node is force-stopped.
    pub grace_period: Duration,
    /// Waiting for a stopped node to leave the topology.
    pub removal: PollPolicy,
    /// Waiting for a restarted node to rejoin on the new version.
    pub readmission: PollPolicy,
    /// Bound on a deployment acknowledgement.
    pub deploy_timeout: Duration,
    /// Retrying instance creation while the deployment propagates.
    pub instance_creation: PollPolicy,
    /// Waiting for a snapshot to appear on disk.
    pub snapshot: PollPolicy,
    /// Waiting for all jobs of the tracked instances to complete.
    pub job_completion: PollPolicy,
    /// Interval between job activation requests of a worker.
    pub worker_poll_interval: Duration,
    /// Maximum jobs activated per request.
    pub worker_max_jobs: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            removal: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(20)),
            readmission: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
            deploy_timeout: Duration::from_secs(10),
            instance_creation: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            snapshot: PollPolicy::new(Duration::from_millis(500), Duration::from_secs(120)),
            job_completion: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            worker_poll_interval: Duration::from_millis(100),
            worker_max_jobs: 32,
        }
    }
}

impl TimingConfig {
    /// Creates timing config suitable for testing (shorter waits).
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            removal: PollPolicy::new(Duration::from_millis(50), Duration::from_secs(5)),
            readmission: PollPolicy::new(Duration::from_millis(50), Duration::from_secs(5)),
            deploy_timeout: Duration::from_secs(2),
            instance_creation: PollPolicy::new(Duration::from_millis(50), Duration::from_secs(2)),
            snapshot: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
            job_completion: PollPolicy::new(Duration::from_millis(50), Duration::from_secs(5)),
            worker_poll_interval: Duration::from_millis(20),
            worker_max_jobs: 32,
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if any policy is invalid or a bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in [
            ("removal", &self.removal),
            ("readmission", &self.readmission),
            ("instance_creation", &self.instance_creation),
            ("snapshot", &self.snapshot),
            ("job_completion", &self.job_completion),
        ] {
            policy.validate().map_err(|message| ConfigError::InvalidTiming {
                message: format!("{name}: {message}"),
            })?;
        }
        if self.grace_period.is_zero() || self.deploy_timeout.is_zero() {
            return Err(ConfigError::InvalidTiming {
                message: "grace_period and deploy_timeout must be non-zero".to_string(),
            });
        }
        if self.worker_poll_interval.is_zero() || self.worker_max_jobs == 0 {
            return Err(ConfigError::InvalidTiming {
                message: "worker_poll_interval and worker_max_jobs must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Complete configuration of one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Cluster-wide node configuration.
    pub cluster: ClusterConfig,
    /// Polling budgets.
    pub timing: TimingConfig,
    /// Version every node starts on.
    pub old_version: Version,
    /// Version nodes are upgraded to.
    pub new_version: Version,
    /// Instances created while a node is absent, to force snapshots.
    pub write_pressure: u32,
    /// Directory under which per-run temporary data roots are created.
    pub shared_data_root: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            timing: TimingConfig::default(),
            old_version: Version::from("0.24.0"),
            new_version: Version::from("0.24.1"),
            write_pressure: 100,
            shared_data_root: std::env::temp_dir().join("shared"),
        }
    }
}

impl HarnessConfig {
    /// Default configuration with the data root taken from
    /// [`SHARED_DATA_ENV`] when it is set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(SHARED_DATA_ENV).filter(|v| !v.is_empty()) {
            config.shared_data_root = PathBuf::from(root);
        }
        config
    }

    /// Sets the old and new versions.
    #[must_use]
    pub fn with_versions(mut self, old: impl Into<Version>, new: impl Into<Version>) -> Self {
        self.old_version = old.into();
        self.new_version = new.into();
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the cluster configuration.
    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Sets the shared data root.
    #[must_use]
    pub fn with_shared_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.shared_data_root = root.into();
        self
    }

    /// Sets the write pressure.
    #[must_use]
    pub const fn with_write_pressure(mut self, instances: u32) -> Self {
        self.write_pressure = instances;
        self
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    /// Returns the first invalid section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        self.timing.validate()?;
        if self.old_version == self.new_version {
            return Err(ConfigError::InvalidCluster {
                message: format!("old and new version are both {}", self.new_version),
            });
        }
        Ok(())
    }
}

/// Renders a duration the way node configuration expects it (`250ms`, `30s`, `1m`).
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 && millis > 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}
