//! Cluster client talking to the simulated cluster.
//!
//! A client is bound to one gateway address. Requests are served only while
//! the node behind that address runs, like a TCP connection to a real node.

use std::sync::Arc;

use async_trait::async_trait;
use rollout_core::{InstanceKey, JobKey, JobType, NodeId, TopologySnapshot};
use rollout_harness::{
    ActivatedJob, ClientConnector, ClientError, ClusterClient, DefinitionVersion, DeploymentAck,
    ProcessDefinition, Variables,
};
use tracing::trace;

use crate::cluster::SimCluster;

/// Opens [`SimClient`]s.
#[derive(Debug, Clone)]
pub struct SimConnector {
    cluster: Arc<SimCluster>,
}

impl SimConnector {
    /// Creates a connector for `cluster`.
    #[must_use]
    pub const fn new(cluster: Arc<SimCluster>) -> Self {
        Self { cluster }
    }
}

impl ClientConnector for SimConnector {
    fn connect(&self, address: &str) -> Arc<dyn ClusterClient> {
        Arc::new(SimClient {
            node: self.cluster.node_for_address(address),
            address: address.to_string(),
            cluster: Arc::clone(&self.cluster),
        })
    }
}

/// Client bound to one simulated node.
#[derive(Debug)]
pub struct SimClient {
    cluster: Arc<SimCluster>,
    address: String,
    node: Option<NodeId>,
}

#[async_trait]
impl ClusterClient for SimClient {
    fn target(&self) -> &str {
        &self.address
    }

    async fn topology(&self) -> Result<TopologySnapshot, ClientError> {
        self.cluster.topology(self.node)
    }

    async fn deploy(&self, definition: &ProcessDefinition) -> Result<DeploymentAck, ClientError> {
        let ack = self.cluster.deploy(self.node, definition)?;
        trace!(target = %self.address, key = ack.key, "deployed");
        Ok(ack)
    }

    async fn create_instance(
        &self,
        process_id: &str,
        version: DefinitionVersion,
        _variables: &Variables,
    ) -> Result<InstanceKey, ClientError> {
        self.cluster.create_instance(self.node, process_id, version)
    }

    async fn activate_jobs(
        &self,
        job_type: &JobType,
        max_jobs: u32,
    ) -> Result<Vec<ActivatedJob>, ClientError> {
        self.cluster.activate_jobs(self.node, job_type, max_jobs)
    }

    async fn complete_job(&self, key: JobKey) -> Result<(), ClientError> {
        self.cluster.complete_job(self.node, key)
    }
}
