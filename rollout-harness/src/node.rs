//! Member node handles.
//!
//! A [`NodeHandle`] pairs the harness's record of one member ([`MemberNode`])
//! with the runtime instance that actually runs it. The runtime side is a
//! collaborator behind [`NodeRuntime`] and [`NodeInstance`]: a process
//! spawner, a container engine, or the in-process simulator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rollout_core::{NodeId, Version};
use tracing::{info, warn};

use crate::error::NodeError;

/// Ports a node exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePort {
    /// Client gateway.
    Gateway,
    /// Internal membership/replication API.
    Internal,
}

/// Everything a runtime needs to start one node.
///
/// The environment is opaque to the harness: it is built once per node and
/// passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Node id.
    pub node: NodeId,
    /// Version to run.
    pub version: Version,
    /// Advertised network identity.
    pub host: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Host directory mounted as the node's data volume.
    pub data_dir: PathBuf,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The node exited within the grace period.
    Graceful,
    /// The node had to be killed.
    Forced,
}

/// One provisioned node in a runtime.
#[async_trait]
pub trait NodeInstance: Send + Sync {
    /// Starts the node.
    async fn start(&mut self) -> Result<(), NodeError>;

    /// Asks the node to exit and waits up to `timeout` for it.
    ///
    /// Returns [`StopOutcome::Forced`] if the instance had to kill the node
    /// itself.
    async fn graceful_stop(&mut self, timeout: Duration) -> Result<StopOutcome, NodeError>;

    /// Kills the node immediately.
    async fn force_stop(&mut self) -> Result<(), NodeError>;

    /// Externally reachable address of `port`.
    fn external_address(&self, port: NodePort) -> String;
}

/// Provisions node instances.
pub trait NodeRuntime: Send + Sync {
    /// Address other nodes and clients use to reach `node` on `port`.
    fn address(&self, node: NodeId, port: NodePort) -> String;

    /// Advertised host of `node`.
    fn advertised_host(&self, node: NodeId) -> String;

    /// Creates a stopped instance for `launch`.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot run `launch.version`.
    fn provision(&self, launch: LaunchSpec) -> Result<Box<dyn NodeInstance>, NodeError>;
}

/// The harness's record of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberNode {
    id: NodeId,
    version: Version,
    data_path: PathBuf,
    running: bool,
}

impl MemberNode {
    /// Creates a stopped member record.
    #[must_use]
    pub const fn new(id: NodeId, version: Version, data_path: PathBuf) -> Self {
        Self {
            id,
            version,
            data_path,
            running: false,
        }
    }

    /// Stable node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Version currently provisioned.
    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.version
    }

    /// Data directory; stable across upgrades.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Whether the harness started the node and has not stopped it.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }
}

/// Lifecycle controls of one member.
pub struct NodeHandle {
    member: MemberNode,
    instance: Box<dyn NodeInstance>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("member", &self.member)
            .finish_non_exhaustive()
    }
}

impl NodeHandle {
    /// Wraps a provisioned instance.
    #[must_use]
    pub fn new(member: MemberNode, instance: Box<dyn NodeInstance>) -> Self {
        Self { member, instance }
    }

    /// The member record.
    #[must_use]
    pub const fn member(&self) -> &MemberNode {
        &self.member
    }

    /// Node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.member.id
    }

    /// Whether the node is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.member.running
    }

    /// Externally reachable address of `port`.
    #[must_use]
    pub fn external_address(&self, port: NodePort) -> String {
        self.instance.external_address(port)
    }

    /// Starts the node with its current version.
    ///
    /// # Errors
    /// Returns [`NodeError::AlreadyRunning`] if the node was already started,
    /// or the runtime's error.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.member.running {
            return Err(NodeError::AlreadyRunning { node: self.id() });
        }
        self.instance.start().await?;
        self.member.running = true;
        info!(node = %self.id(), version = %self.member.version, "node started");
        Ok(())
    }

    /// Shuts the node down, killing it if it outlives `timeout`.
    ///
    /// A forced stop counts as a successful shutdown: whether the node left
    /// the cluster is decided by the topology, not by how it exited.
    ///
    /// # Errors
    /// Returns [`NodeError::NotRunning`] if the node was not started.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<StopOutcome, NodeError> {
        if !self.member.running {
            return Err(NodeError::NotRunning { node: self.id() });
        }

        let stopped = tokio::time::timeout(timeout, self.instance.graceful_stop(timeout)).await;
        let outcome = match stopped {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => {
                warn!(node = %self.id(), %error, "graceful stop failed, forcing");
                self.force_quietly().await;
                StopOutcome::Forced
            }
            Err(_) => {
                warn!(node = %self.id(), ?timeout, "graceful stop timed out, forcing");
                self.force_quietly().await;
                StopOutcome::Forced
            }
        };

        self.member.running = false;
        info!(node = %self.id(), ?outcome, "node shut down");
        Ok(outcome)
    }

    /// Stops the node immediately, ignoring errors. Used at teardown.
    pub async fn stop(&mut self) {
        self.force_quietly().await;
        self.member.running = false;
    }

    /// Swaps in a freshly provisioned instance on `version`.
    ///
    /// Only the registry calls this, after checking the node is stopped.
    pub(crate) fn reprovision(&mut self, version: Version, instance: Box<dyn NodeInstance>) {
        self.member.version = version;
        self.member.running = false;
        self.instance = instance;
    }

    async fn force_quietly(&mut self) {
        if let Err(error) = self.instance.force_stop().await {
            warn!(node = %self.id(), %error, "force stop failed, ignoring");
        }
    }
}
