//! Cluster client collaborator.
//!
//! The harness never speaks the cluster's wire protocol itself. It consumes
//! a [`ClusterClient`] obtained from a [`ClientConnector`] for the gateway
//! address of a running node, and only relies on the request and response
//! shapes defined here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rollout_core::{InstanceKey, JobKey, JobType, TopologySnapshot};

use crate::error::ClientError;

/// Variables attached to a new process instance.
pub type Variables = BTreeMap<String, String>;

/// Job type of the first step of the verification process.
pub const FIRST_TASK: &str = "firstTask";

/// Job type of the second step of the verification process.
pub const SECOND_TASK: &str = "secondTask";

/// A process definition: an ordered sequence of job types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDefinition {
    /// Process id instances are created for.
    pub process_id: String,
    /// Resource name used for the deployment.
    pub resource_name: String,
    /// Job types, in execution order.
    pub job_types: Vec<JobType>,
}

impl ProcessDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(
        process_id: impl Into<String>,
        resource_name: impl Into<String>,
        job_types: Vec<JobType>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            resource_name: resource_name.into(),
            job_types,
        }
    }

    /// The two-step process used to verify ordering: `firstTask` then `secondTask`.
    #[must_use]
    pub fn two_step() -> Self {
        Self::new(
            "process",
            "process.bpmn",
            vec![JobType::from(FIRST_TASK), JobType::from(SECOND_TASK)],
        )
    }
}

/// Acknowledgement of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentAck {
    /// Deployment key.
    pub key: i64,
    /// Deployed process id.
    pub process_id: String,
    /// Version assigned to this deployment of the process.
    pub version: u32,
}

/// Which deployed version of a process to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefinitionVersion {
    /// The most recent deployment.
    #[default]
    Latest,
    /// A specific version.
    Exact(u32),
}

/// A job activated for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedJob {
    /// Job key, used to complete it.
    pub key: JobKey,
    /// Instance the job belongs to.
    pub instance_key: InstanceKey,
    /// Job type.
    pub job_type: JobType,
}

/// Requests the harness sends to the cluster through one node's gateway.
///
/// Implementations must be `Send + Sync`; one client is shared between the
/// sequencing task and every worker task.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Address this client talks to.
    fn target(&self) -> &str;

    /// Reads the cluster's membership view.
    async fn topology(&self) -> Result<TopologySnapshot, ClientError>;

    /// Deploys a process definition.
    async fn deploy(&self, definition: &ProcessDefinition) -> Result<DeploymentAck, ClientError>;

    /// Creates a process instance.
    async fn create_instance(
        &self,
        process_id: &str,
        version: DefinitionVersion,
        variables: &Variables,
    ) -> Result<InstanceKey, ClientError>;

    /// Activates up to `max_jobs` jobs of `job_type`.
    async fn activate_jobs(
        &self,
        job_type: &JobType,
        max_jobs: u32,
    ) -> Result<Vec<ActivatedJob>, ClientError>;

    /// Completes an activated job.
    async fn complete_job(&self, key: JobKey) -> Result<(), ClientError>;
}

/// Opens clients against node gateway addresses.
pub trait ClientConnector: Send + Sync {
    /// Returns a client for `address`. Connection failures surface on use.
    fn connect(&self, address: &str) -> Arc<dyn ClusterClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_step_definition() {
        let definition = ProcessDefinition::two_step();
        assert_eq!(definition.process_id, "process");
        assert_eq!(definition.resource_name, "process.bpmn");
        assert_eq!(
            definition.job_types,
            vec![JobType::from("firstTask"), JobType::from("secondTask")]
        );
    }

    #[test]
    fn test_default_version_is_latest() {
        assert_eq!(DefinitionVersion::default(), DefinitionVersion::Latest);
    }
}
