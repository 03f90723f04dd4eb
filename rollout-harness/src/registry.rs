//! Cluster registry.
//!
//! The registry is an arena of `size` slots indexed by stable node id. A
//! slot's contents change on [`ClusterRegistry::replace`]; its id, data
//! directory and network identity never do. Handles are only lent out, so a
//! caller cannot hold on to a handle across a replace.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use rollout_core::{ClusterShape, NodeId, Version};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::{format_duration, ClusterConfig};
use crate::error::NodeError;
use crate::node::{LaunchSpec, MemberNode, NodeHandle, NodePort, NodeRuntime};

/// Ordered collection of member handles plus cluster-wide configuration.
pub struct ClusterRegistry {
    config: ClusterConfig,
    runtime: Arc<dyn NodeRuntime>,
    contact_points: String,
    data: TempDir,
    slots: Vec<NodeHandle>,
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("size", &self.config.size)
            .field("data", &self.data.path())
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl ClusterRegistry {
    /// Provisions `config.size` stopped nodes on `initial_version`.
    ///
    /// Node data directories are created in a fresh temporary directory under
    /// `shared_data_root`, removed again when the registry is dropped.
    ///
    /// # Errors
    /// Returns an error if directories cannot be created or the runtime
    /// cannot provision a node.
    pub fn new(
        config: ClusterConfig,
        initial_version: &Version,
        runtime: Arc<dyn NodeRuntime>,
        shared_data_root: &Path,
    ) -> Result<Self, NodeError> {
        std::fs::create_dir_all(shared_data_root).map_err(|source| NodeError::Io {
            operation: "create shared data root",
            source,
        })?;
        let data = tempfile::Builder::new()
            .prefix("rollout-")
            .tempdir_in(shared_data_root)
            .map_err(|source| NodeError::Io {
                operation: "create cluster data directory",
                source,
            })?;

        let contact_points = (0..config.size)
            .map(|id| runtime.address(NodeId::new(id), NodePort::Internal))
            .collect::<Vec<_>>()
            .join(",");

        let mut registry = Self {
            config,
            runtime,
            contact_points,
            data,
            slots: Vec::new(),
        };

        for id in (0..registry.config.size).map(NodeId::new) {
            let data_path = registry
                .data
                .path()
                .join(format!("{}{}", registry.config.host_prefix, id.get()));
            std::fs::create_dir_all(&data_path).map_err(|source| NodeError::Io {
                operation: "create node data directory",
                source,
            })?;

            let member = MemberNode::new(id, initial_version.clone(), data_path);
            let instance = registry.runtime.provision(registry.launch_spec(&member, initial_version))?;
            registry.slots.push(NodeHandle::new(member, instance));
        }

        info!(
            size = registry.config.size,
            version = %initial_version,
            data = %registry.data.path().display(),
            "cluster provisioned"
        );
        Ok(registry)
    }

    /// Cluster configuration.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Number of nodes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.config.size
    }

    /// Size and replication factor the cluster must keep reporting.
    #[must_use]
    pub const fn shape(&self) -> ClusterShape {
        self.config.shape()
    }

    /// Comma-separated internal addresses of every node.
    #[must_use]
    pub fn contact_points(&self) -> &str {
        &self.contact_points
    }

    /// Root of the per-node data directories.
    #[must_use]
    pub fn data_root(&self) -> &Path {
        self.data.path()
    }

    /// Returns the handle of `id`.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownNode`] if `id` is outside the cluster.
    pub fn get(&self, id: NodeId) -> Result<&NodeHandle, NodeError> {
        self.slots.get(id.index()).ok_or(NodeError::UnknownNode {
            node: id,
            size: self.config.size,
        })
    }

    /// Returns the handle of `id` for lifecycle changes.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownNode`] if `id` is outside the cluster.
    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeHandle, NodeError> {
        let size = self.config.size;
        self.slots
            .get_mut(id.index())
            .ok_or(NodeError::UnknownNode { node: id, size })
    }

    /// All handles in id order.
    pub fn all(&self) -> impl Iterator<Item = &NodeHandle> {
        self.slots.iter()
    }

    /// Ids of the nodes currently running.
    #[must_use]
    pub fn running(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .filter(|h| h.is_running())
            .map(NodeHandle::id)
            .collect()
    }

    /// Provisioned version of every node.
    #[must_use]
    pub fn versions(&self) -> BTreeMap<NodeId, Version> {
        self.slots
            .iter()
            .map(|h| (h.id(), h.member().version().clone()))
            .collect()
    }

    /// Gateway address of `id`.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownNode`] if `id` is outside the cluster.
    pub fn gateway_address(&self, id: NodeId) -> Result<String, NodeError> {
        Ok(self.get(id)?.external_address(NodePort::Gateway))
    }

    /// Re-provisions node `id` on `version`, keeping its id, data directory
    /// and network identity. The node is left stopped.
    ///
    /// # Errors
    /// Returns [`NodeError::StillRunning`] if the node has not been shut
    /// down, or the runtime's provisioning error.
    pub fn replace(&mut self, id: NodeId, version: &Version) -> Result<&mut NodeHandle, NodeError> {
        let handle = self.get(id)?;
        if handle.is_running() {
            return Err(NodeError::StillRunning { node: id });
        }

        let launch = self.launch_spec(handle.member(), version);
        let instance = self.runtime.provision(launch)?;

        let handle = self.get_mut(id)?;
        let previous = handle.member().version().clone();
        handle.reprovision(version.clone(), instance);
        info!(node = %id, from = %previous, to = %version, "node replaced");
        Ok(handle)
    }

    /// Starts every node concurrently.
    ///
    /// # Errors
    /// Returns the first start failure.
    pub async fn start_all(&mut self) -> Result<(), NodeError> {
        try_join_all(self.slots.iter_mut().map(|handle| handle.start())).await?;
        info!(size = self.config.size, "all nodes started");
        Ok(())
    }

    /// Stops every node concurrently. Never fails.
    pub async fn teardown(&mut self) {
        join_all(self.slots.iter_mut().map(|handle| handle.stop())).await;
        debug!(size = self.config.size, "cluster torn down");
    }

    fn launch_spec(&self, member: &MemberNode, version: &Version) -> LaunchSpec {
        let host = self.runtime.advertised_host(member.id());
        LaunchSpec {
            node: member.id(),
            version: version.clone(),
            env: self.environment(member.id(), &host),
            host,
            data_dir: member.data_path().to_path_buf(),
        }
    }

    fn environment(&self, node: NodeId, host: &str) -> Vec<(String, String)> {
        let config = &self.config;
        let size = config.size.to_string();
        [
            ("NETWORK_HOST", "0.0.0.0".to_string()),
            ("NETWORK_ADVERTISED_HOST", host.to_string()),
            ("NETWORK_MAX_MESSAGE_SIZE", config.max_message_size.clone()),
            ("CLUSTER_NAME", config.cluster_name.clone()),
            ("CLUSTER_NODE_ID", node.get().to_string()),
            ("CLUSTER_SIZE", size.clone()),
            ("CLUSTER_REPLICATION_FACTOR", size),
            ("CLUSTER_INITIAL_CONTACT_POINTS", self.contact_points.clone()),
            (
                "CLUSTER_MEMBERSHIP_BROADCAST_UPDATES",
                config.broadcast_updates.to_string(),
            ),
            (
                "CLUSTER_MEMBERSHIP_SYNC_INTERVAL",
                format_duration(config.membership_sync_interval),
            ),
            ("DATA_SNAPSHOT_PERIOD", format_duration(config.snapshot_period)),
            ("LOG_LEVEL", config.node_log_level.clone()),
        ]
        .into_iter()
        .map(|(key, value)| (format!("{}{key}", config.env_prefix), value))
        .collect()
    }
}
