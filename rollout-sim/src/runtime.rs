//! Node runtime backed by the simulated cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_core::NodeId;
use rollout_harness::{LaunchSpec, NodeError, NodeInstance, NodePort, NodeRuntime, StopOutcome};
use tracing::{debug, warn};

use crate::cluster::SimCluster;

/// Provisions simulated nodes.
#[derive(Debug, Clone)]
pub struct SimRuntime {
    cluster: Arc<SimCluster>,
    provisions: Arc<AtomicU64>,
}

impl SimRuntime {
    /// Creates a runtime for `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self {
            cluster,
            provisions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The simulated cluster.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<SimCluster> {
        &self.cluster
    }

    /// Number of nodes provisioned so far.
    #[must_use]
    pub fn provisions(&self) -> u64 {
        self.provisions.load(Ordering::Relaxed)
    }
}

impl NodeRuntime for SimRuntime {
    fn address(&self, node: NodeId, port: NodePort) -> String {
        match port {
            NodePort::Gateway => SimCluster::gateway_address(node),
            NodePort::Internal => SimCluster::internal_address(node),
        }
    }

    fn advertised_host(&self, node: NodeId) -> String {
        format!("sim-node-{}", node.get())
    }

    fn provision(&self, launch: LaunchSpec) -> Result<Box<dyn NodeInstance>, NodeError> {
        let size = self.cluster.config().size;
        if launch.node.get() >= size {
            return Err(NodeError::UnknownNode {
                node: launch.node,
                size,
            });
        }
        self.provisions.fetch_add(1, Ordering::Relaxed);
        debug!(node = %launch.node, version = %launch.version, "sim node provisioned");
        Ok(Box::new(SimInstance {
            cluster: Arc::clone(&self.cluster),
            launch,
            running: false,
        }))
    }
}

struct SimInstance {
    cluster: Arc<SimCluster>,
    launch: LaunchSpec,
    running: bool,
}

#[async_trait]
impl NodeInstance for SimInstance {
    async fn start(&mut self) -> Result<(), NodeError> {
        if self.running {
            return Err(NodeError::AlreadyRunning {
                node: self.launch.node,
            });
        }
        self.cluster.node_started(
            self.launch.node,
            self.launch.version.clone(),
            self.launch.data_dir.clone(),
        );
        self.running = true;
        Ok(())
    }

    async fn graceful_stop(&mut self, timeout: Duration) -> Result<StopOutcome, NodeError> {
        if !self.running {
            return Ok(StopOutcome::Graceful);
        }
        let delay = self.cluster.config().shutdown_delay;
        let outcome = if delay > timeout {
            tokio::time::sleep(timeout).await;
            warn!(node = %self.launch.node, ?timeout, "sim node ignored shutdown, killing");
            StopOutcome::Forced
        } else {
            tokio::time::sleep(delay).await;
            StopOutcome::Graceful
        };
        self.cluster.node_stopped(self.launch.node);
        self.running = false;
        Ok(outcome)
    }

    async fn force_stop(&mut self) -> Result<(), NodeError> {
        if self.running {
            self.cluster.node_stopped(self.launch.node);
            self.running = false;
        }
        Ok(())
    }

    fn external_address(&self, port: NodePort) -> String {
        match port {
            NodePort::Gateway => SimCluster::gateway_address(self.launch.node),
            NodePort::Internal => SimCluster::internal_address(self.launch.node),
        }
    }
}
