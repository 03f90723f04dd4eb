//! Test doubles for the collaborator traits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rollout_core::{InstanceKey, JobKey, JobType, NodeId, TopologySnapshot};

use crate::client::{
    ActivatedJob, ClientConnector, ClusterClient, DefinitionVersion, DeploymentAck,
    ProcessDefinition, Variables,
};
use crate::error::{ClientError, NodeError};
use crate::node::{LaunchSpec, NodeInstance, NodePort, NodeRuntime, StopOutcome};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared counters and knobs of one fake node.
#[derive(Debug, Clone, Default)]
pub struct InstanceProbe {
    starts: Arc<AtomicU32>,
    forced_stops: Arc<AtomicU32>,
    fail_force: Arc<AtomicBool>,
    stop_delay_ms: Arc<AtomicU64>,
    force_delay_ms: Arc<AtomicU64>,
}

impl InstanceProbe {
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn forced_stops(&self) -> u32 {
        self.forced_stops.load(Ordering::SeqCst)
    }

    pub fn fail_force_stop(&self) {
        self.fail_force.store(true, Ordering::SeqCst);
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.stop_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }

    pub fn set_force_delay(&self, delay: Duration) {
        self.force_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

pub struct FakeInstance {
    node: NodeId,
    probe: InstanceProbe,
}

impl FakeInstance {
    pub const fn new(node: NodeId, probe: InstanceProbe) -> Self {
        Self { node, probe }
    }
}

#[async_trait]
impl NodeInstance for FakeInstance {
    async fn start(&mut self) -> Result<(), NodeError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn graceful_stop(&mut self, _timeout: Duration) -> Result<StopOutcome, NodeError> {
        let delay = self.probe.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(StopOutcome::Graceful)
    }

    async fn force_stop(&mut self) -> Result<(), NodeError> {
        self.probe.forced_stops.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe.force_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.probe.fail_force.load(Ordering::SeqCst) {
            return Err(NodeError::StopFailed {
                node: self.node,
                message: "injected".to_string(),
            });
        }
        Ok(())
    }

    fn external_address(&self, port: NodePort) -> String {
        fake_address(self.node, port)
    }
}

fn fake_address(node: NodeId, port: NodePort) -> String {
    let port = match port {
        NodePort::Gateway => 26500,
        NodePort::Internal => 26502,
    };
    format!("broker-{}:{port}", node.get())
}

/// Records every provisioned launch; one probe per node id.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    provisioned: Mutex<Vec<LaunchSpec>>,
    probes: Mutex<BTreeMap<NodeId, InstanceProbe>>,
}

impl FakeRuntime {
    pub fn provisioned(&self) -> Vec<LaunchSpec> {
        lock(&self.provisioned).clone()
    }

    pub fn probe(&self, node: NodeId) -> InstanceProbe {
        lock(&self.probes).entry(node).or_default().clone()
    }
}

impl NodeRuntime for FakeRuntime {
    fn address(&self, node: NodeId, port: NodePort) -> String {
        fake_address(node, port)
    }

    fn advertised_host(&self, node: NodeId) -> String {
        format!("broker-{}", node.get())
    }

    fn provision(&self, launch: LaunchSpec) -> Result<Box<dyn NodeInstance>, NodeError> {
        let node = launch.node;
        lock(&self.provisioned).push(launch);
        Ok(Box::new(FakeInstance::new(node, self.probe(node))))
    }
}

/// Client answering from scripted responses.
#[derive(Default)]
pub struct ScriptedClient {
    topologies: Mutex<VecDeque<Result<TopologySnapshot, ClientError>>>,
    deploy_delay: Mutex<Option<Duration>>,
    create_failures: AtomicU32,
    next_instance: AtomicU64,
    jobs: Mutex<BTreeMap<JobType, VecDeque<ActivatedJob>>>,
    in_flight: Mutex<BTreeMap<JobKey, ActivatedJob>>,
    complete_failures: AtomicU32,
    completed: Mutex<Vec<JobKey>>,
}

impl ScriptedClient {
    /// Queues topology answers; the last one repeats forever.
    pub fn push_topology(&self, answer: Result<TopologySnapshot, ClientError>) {
        lock(&self.topologies).push_back(answer);
    }

    pub fn delay_deploy(&self, delay: Duration) {
        *lock(&self.deploy_delay) = Some(delay);
    }

    pub fn fail_creations(&self, times: u32) {
        self.create_failures.store(times, Ordering::SeqCst);
    }

    pub fn push_job(&self, job: ActivatedJob) {
        lock(&self.jobs)
            .entry(job.job_type.clone())
            .or_default()
            .push_back(job);
    }

    /// Rejects the next `times` completions; each rejected job is handed
    /// out again by a later activation.
    pub fn fail_completions(&self, times: u32) {
        self.complete_failures.store(times, Ordering::SeqCst);
    }

    pub fn completed(&self) -> Vec<JobKey> {
        lock(&self.completed).clone()
    }
}

#[async_trait]
impl ClusterClient for ScriptedClient {
    fn target(&self) -> &str {
        "scripted:26500"
    }

    async fn topology(&self) -> Result<TopologySnapshot, ClientError> {
        let mut topologies = lock(&self.topologies);
        if topologies.len() > 1 {
            return topologies.pop_front().unwrap();
        }
        topologies
            .front()
            .cloned()
            .unwrap_or_else(|| Err(ClientError::Unavailable("no topology scripted".to_string())))
    }

    async fn deploy(&self, definition: &ProcessDefinition) -> Result<DeploymentAck, ClientError> {
        let delay = *lock(&self.deploy_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(DeploymentAck {
            key: 1,
            process_id: definition.process_id.clone(),
            version: 1,
        })
    }

    async fn create_instance(
        &self,
        process_id: &str,
        _version: DefinitionVersion,
        _variables: &Variables,
    ) -> Result<InstanceKey, ClientError> {
        let remaining = self.create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.create_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Rejected(format!(
                "process {process_id} not found"
            )));
        }
        let key = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InstanceKey::new(i64::try_from(key).unwrap()))
    }

    async fn activate_jobs(
        &self,
        job_type: &JobType,
        max_jobs: u32,
    ) -> Result<Vec<ActivatedJob>, ClientError> {
        let mut jobs = lock(&self.jobs);
        let queue = jobs.entry(job_type.clone()).or_default();
        let take = queue.len().min(max_jobs as usize);
        let activated: Vec<ActivatedJob> = queue.drain(..take).collect();
        let mut in_flight = lock(&self.in_flight);
        for job in &activated {
            in_flight.insert(job.key, job.clone());
        }
        Ok(activated)
    }

    async fn complete_job(&self, key: JobKey) -> Result<(), ClientError> {
        let job = lock(&self.in_flight).remove(&key);
        let remaining = self.complete_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.complete_failures.store(remaining - 1, Ordering::SeqCst);
            if let Some(job) = job {
                self.push_job(job);
            }
            return Err(ClientError::Unavailable(format!("{key} completion lost")));
        }
        lock(&self.completed).push(key);
        Ok(())
    }
}

/// Hands out the same client for every address.
pub struct SharedConnector {
    client: Arc<ScriptedClient>,
}

impl SharedConnector {
    pub const fn new(client: Arc<ScriptedClient>) -> Self {
        Self { client }
    }
}

impl ClientConnector for SharedConnector {
    fn connect(&self, _address: &str) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.client) as Arc<dyn ClusterClient>
    }
}
