//! In-process simulated cluster.
//!
//! One shared state models what the harness can observe of a real cluster:
//!
//! - **Membership**: a started node shows up after the join delay, a stopped
//!   node disappears after the failure detection delay
//! - **Availability**: requests need the contacted node to run and a quorum
//!   of visible members
//! - **Work**: deployments propagate after a delay; every instance runs its
//!   job types in order, one job at a time
//! - **Snapshots**: the leader (lowest visible node) periodically writes a
//!   snapshot directory once enough records were written, and replicates it
//!   to every visible follower, including rejoined ones
//!
//! All time is `tokio::time`, so tests run on a paused clock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rollout_core::{InstanceKey, JobKey, JobType, MemberInfo, NodeId, TopologySnapshot, Version};
use rollout_harness::{
    ActivatedJob, ClientError, ConfigError, DefinitionVersion, DeploymentAck, ProcessDefinition,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SimConfig;

/// First key handed out, mirroring the partition-prefixed keys of the real
/// cluster.
const KEY_BASE: i64 = 1 << 51;

#[derive(Debug)]
struct SimNode {
    version: Version,
    data_dir: PathBuf,
    running: bool,
    changed_at: Instant,
    snapshot: Option<u64>,
}

#[derive(Debug)]
struct Deployment {
    process_id: String,
    version: u32,
    job_types: Vec<JobType>,
    visible_at: Instant,
}

#[derive(Debug)]
struct SimInstance {
    job_types: Vec<JobType>,
    next_step: usize,
}

#[derive(Debug)]
struct SimJob {
    instance: InstanceKey,
    job_type: JobType,
    activated_until: Option<Instant>,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<NodeId, SimNode>,
    deployments: Vec<Deployment>,
    instances: BTreeMap<InstanceKey, SimInstance>,
    jobs: BTreeMap<JobKey, SimJob>,
    next_key: i64,
    records: u64,
    snapshot_position: u64,
    rng: ChaCha8Rng,
    lifecycle_ops: u64,
    completed_instances: u64,
}

/// Simulated cluster shared by the runtime and the clients.
#[derive(Debug)]
pub struct SimCluster {
    config: SimConfig,
    state: Mutex<State>,
}

impl SimCluster {
    /// Creates a cluster with every node stopped and starts its snapshot
    /// ticker. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid.
    pub fn start(config: SimConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let state = State {
            nodes: BTreeMap::new(),
            deployments: Vec::new(),
            instances: BTreeMap::new(),
            jobs: BTreeMap::new(),
            next_key: KEY_BASE,
            records: 0,
            snapshot_position: 0,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            lifecycle_ops: 0,
            completed_instances: 0,
        };
        let cluster = Arc::new(Self {
            config,
            state: Mutex::new(state),
        });

        tokio::spawn(snapshot_ticker(Arc::downgrade(&cluster)));
        info!(
            size = cluster.config.size,
            seed = cluster.config.seed,
            "simulated cluster started"
        );
        Ok(cluster)
    }

    /// Simulation settings.
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gateway address of `node`.
    #[must_use]
    pub fn gateway_address(node: NodeId) -> String {
        format!("sim-node-{}:26500", node.get())
    }

    /// Internal address of `node`.
    #[must_use]
    pub fn internal_address(node: NodeId) -> String {
        format!("sim-node-{}:26502", node.get())
    }

    /// Node serving `address`, if it is one of ours.
    #[must_use]
    pub fn node_for_address(&self, address: &str) -> Option<NodeId> {
        (0..self.config.size)
            .map(NodeId::new)
            .find(|node| Self::gateway_address(*node) == address)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Marks `node` as started on `version` with data in `data_dir`.
    pub(crate) fn node_started(&self, node: NodeId, version: Version, data_dir: PathBuf) {
        let now = Instant::now();
        let mut state = self.state();
        state.lifecycle_ops += 1;
        let reused = state.nodes.get(&node).is_some_and(|n| n.data_dir == data_dir);
        if !reused && state.nodes.values().all(|n| !n.running) {
            Self::reset(&mut state);
        }
        let snapshot = state
            .nodes
            .get(&node)
            .filter(|_| reused)
            .and_then(|n| n.snapshot);
        state.nodes.insert(
            node,
            SimNode {
                version: version.clone(),
                data_dir,
                running: true,
                changed_at: now,
                snapshot,
            },
        );
        drop(state);
        debug!(%node, %version, "sim node started");
    }

    /// Forgets all work. Cluster state lives on the data volumes, so a
    /// cluster started on fresh volumes starts empty.
    fn reset(state: &mut State) {
        state.deployments.clear();
        state.instances.clear();
        state.jobs.clear();
        state.records = 0;
        state.snapshot_position = 0;
        for node in state.nodes.values_mut() {
            node.snapshot = None;
        }
        debug!("sim cluster state reset");
    }

    /// Marks `node` as stopped. A node that is already down stays as it is.
    pub(crate) fn node_stopped(&self, node: NodeId) {
        let now = Instant::now();
        let mut state = self.state();
        state.lifecycle_ops += 1;
        if let Some(sim_node) = state.nodes.get_mut(&node) {
            if sim_node.running {
                sim_node.running = false;
                sim_node.changed_at = now;
                debug!(%node, "sim node stopped");
            }
        }
    }

    /// Number of start and stop calls received.
    #[must_use]
    pub fn lifecycle_ops(&self) -> u64 {
        self.state().lifecycle_ops
    }

    /// Instances whose every job was completed.
    #[must_use]
    pub fn completed_instances(&self) -> u64 {
        self.state().completed_instances
    }

    /// Position of the latest snapshot, if any was taken.
    #[must_use]
    pub fn snapshot_position(&self) -> Option<u64> {
        let position = self.state().snapshot_position;
        (position > 0).then_some(position)
    }

    // -- membership --------------------------------------------------------

    fn is_visible(&self, node: &SimNode, now: Instant) -> bool {
        if node.running {
            now >= node.changed_at + self.config.join_delay
                && !self.config.refuse_join_versions.contains(&node.version)
        } else {
            now < node.changed_at + self.config.failure_detection
        }
    }

    fn visible_members(&self, state: &State, now: Instant) -> Vec<MemberInfo> {
        state
            .nodes
            .iter()
            .filter(|(_, node)| self.is_visible(node, now))
            .map(|(id, node)| MemberInfo::new(*id, node.version.clone()))
            .collect()
    }

    fn has_quorum(&self, state: &State, now: Instant) -> bool {
        let serving = state
            .nodes
            .values()
            .filter(|node| node.running && self.is_visible(node, now))
            .count();
        serving > (self.config.replication_factor / 2) as usize
    }

    fn check_available(&self, state: &State, target: Option<NodeId>, now: Instant) -> Result<(), ClientError> {
        let Some(node) = target else {
            return Err(ClientError::Unavailable("unknown address".to_string()));
        };
        if !state.nodes.get(&node).is_some_and(|n| n.running) {
            return Err(ClientError::Unavailable(format!(
                "connection refused by {node}"
            )));
        }
        if !self.has_quorum(state, now) {
            return Err(ClientError::Unavailable("no quorum".to_string()));
        }
        Ok(())
    }

    fn inject_failure(&self, state: &mut State) -> bool {
        self.config.query_failure_rate > 0.0 && state.rng.gen_bool(self.config.query_failure_rate)
    }

    // -- requests ----------------------------------------------------------

    pub(crate) fn topology(&self, target: Option<NodeId>) -> Result<TopologySnapshot, ClientError> {
        let now = Instant::now();
        let mut state = self.state();
        let Some(node) = target.filter(|n| state.nodes.get(n).is_some_and(|s| s.running)) else {
            return Err(ClientError::Unavailable("connection refused".to_string()));
        };
        if self.inject_failure(&mut state) {
            trace!(%node, "injected topology failure");
            return Err(ClientError::Unavailable("injected failure".to_string()));
        }
        Ok(TopologySnapshot {
            members: self.visible_members(&state, now),
            cluster_size: self.config.size,
            replication_factor: self.config.replication_factor,
        })
    }

    pub(crate) fn deploy(
        &self,
        target: Option<NodeId>,
        definition: &ProcessDefinition,
    ) -> Result<DeploymentAck, ClientError> {
        let now = Instant::now();
        let mut state = self.state();
        self.check_available(&state, target, now)?;

        let version = state
            .deployments
            .iter()
            .filter(|d| d.process_id == definition.process_id)
            .count();
        let version = u32::try_from(version).unwrap_or(u32::MAX).saturating_add(1);
        state.deployments.push(Deployment {
            process_id: definition.process_id.clone(),
            version,
            job_types: definition.job_types.clone(),
            visible_at: now + self.config.deployment_distribution,
        });
        let key = state.next_key;
        state.next_key += 1;
        state.records += 1;

        Ok(DeploymentAck {
            key,
            process_id: definition.process_id.clone(),
            version,
        })
    }

    pub(crate) fn create_instance(
        &self,
        target: Option<NodeId>,
        process_id: &str,
        version: DefinitionVersion,
    ) -> Result<InstanceKey, ClientError> {
        let now = Instant::now();
        let mut state = self.state();
        self.check_available(&state, target, now)?;

        let deployment = state
            .deployments
            .iter()
            .filter(|d| d.process_id == process_id && d.visible_at <= now)
            .filter(|d| match version {
                DefinitionVersion::Latest => true,
                DefinitionVersion::Exact(v) => d.version == v,
            })
            .max_by_key(|d| d.version)
            .ok_or_else(|| {
                ClientError::Rejected(format!(
                    "expected to find process definition with process ID '{process_id}', but none found"
                ))
            })?;
        let job_types = deployment.job_types.clone();

        let instance = InstanceKey::new(state.next_key);
        state.next_key += 1;
        state.records += 1;
        state.instances.insert(
            instance,
            SimInstance {
                job_types,
                next_step: 0,
            },
        );
        Self::advance(&mut state, instance);
        Ok(instance)
    }

    /// Creates the next job of `instance`, or marks it complete.
    fn advance(state: &mut State, instance: InstanceKey) {
        let Some(sim_instance) = state.instances.get_mut(&instance) else {
            return;
        };
        match sim_instance.job_types.get(sim_instance.next_step).cloned() {
            Some(job_type) => {
                sim_instance.next_step += 1;
                let key = JobKey::new(state.next_key);
                state.next_key += 1;
                state.jobs.insert(
                    key,
                    SimJob {
                        instance,
                        job_type,
                        activated_until: None,
                    },
                );
            }
            None => {
                state.completed_instances += 1;
                trace!(%instance, "instance completed");
            }
        }
    }

    pub(crate) fn activate_jobs(
        &self,
        target: Option<NodeId>,
        job_type: &JobType,
        max_jobs: u32,
    ) -> Result<Vec<ActivatedJob>, ClientError> {
        let now = Instant::now();
        let mut state = self.state();
        self.check_available(&state, target, now)?;
        if self.inject_failure(&mut state) {
            return Err(ClientError::Unavailable("injected failure".to_string()));
        }

        let deadline = now + self.config.job_timeout;
        let activated: Vec<ActivatedJob> = state
            .jobs
            .iter_mut()
            .filter(|(_, job)| &job.job_type == job_type)
            .filter(|(_, job)| job.activated_until.map_or(true, |until| until <= now))
            .take(max_jobs as usize)
            .map(|(key, job)| {
                job.activated_until = Some(deadline);
                ActivatedJob {
                    key: *key,
                    instance_key: job.instance,
                    job_type: job.job_type.clone(),
                }
            })
            .collect();
        Ok(activated)
    }

    pub(crate) fn complete_job(&self, target: Option<NodeId>, key: JobKey) -> Result<(), ClientError> {
        let now = Instant::now();
        let mut state = self.state();
        self.check_available(&state, target, now)?;

        let Some(job) = state.jobs.remove(&key) else {
            return Err(ClientError::Rejected(format!("{key} does not exist")));
        };
        state.records += 1;
        Self::advance(&mut state, job.instance);
        Ok(())
    }

    // -- snapshots ---------------------------------------------------------

    /// One snapshot round: take a new snapshot on the leader if enough was
    /// written, then bring every visible follower up to the latest one.
    fn snapshot_round(&self) {
        let now = Instant::now();
        let mut state = self.state();

        let leader = state
            .nodes
            .iter()
            .find(|(_, node)| node.running && self.is_visible(node, now))
            .map(|(id, _)| *id);
        let Some(leader) = leader else {
            return;
        };

        if state.records >= state.snapshot_position + self.config.snapshot_min_records {
            state.snapshot_position = state.records;
            info!(%leader, position = state.snapshot_position, "snapshot taken");
        }
        let position = state.snapshot_position;
        if position == 0 {
            return;
        }

        let subpath = self.config.snapshot_subpath.clone();
        for (id, node) in &mut state.nodes {
            if !node.running || !self.is_visible(node, now) || node.snapshot == Some(position) {
                continue;
            }
            let dir = node.data_dir.join(&subpath).join(format!("{position}-1"));
            match std::fs::create_dir_all(&dir) {
                Ok(()) => {
                    node.snapshot = Some(position);
                    debug!(node = %id, position, "snapshot replicated");
                }
                Err(error) => warn!(node = %id, %error, "cannot write snapshot"),
            }
        }
    }
}

async fn snapshot_ticker(cluster: Weak<SimCluster>) {
    let Some(period) = cluster.upgrade().map(|live| live.config.snapshot_period) else {
        return;
    };
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        ticks.tick().await;
        let Some(live) = cluster.upgrade() else {
            debug!("snapshot ticker stopped");
            return;
        };
        live.snapshot_round();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> SimConfig {
        SimConfig {
            snapshot_period: Duration::from_secs(1),
            snapshot_subpath: PathBuf::from("snapshots"),
            ..SimConfig::default()
        }
    }

    fn start_all(cluster: &SimCluster, root: &std::path::Path) {
        for id in 0..3 {
            cluster.node_started(
                NodeId::new(id),
                Version::from("A"),
                root.join(format!("node-{id}")),
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_follows_delays() {
        let root = tempfile::tempdir().unwrap();
        let cluster = SimCluster::start(config()).unwrap();
        start_all(&cluster, root.path());
        let target = Some(NodeId::new(0));

        assert_eq!(cluster.topology(target).unwrap().member_count(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(cluster.topology(target).unwrap().member_count(), 3);

        cluster.node_stopped(NodeId::new(2));
        assert_eq!(cluster.topology(target).unwrap().member_count(), 3);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let view = cluster.topology(target).unwrap();
        assert_eq!(view.member_count(), 2);
        assert!(!view.contains(NodeId::new(2)));

        assert!(cluster.topology(Some(NodeId::new(2))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_in_definition_order() {
        let root = tempfile::tempdir().unwrap();
        let cluster = SimCluster::start(config()).unwrap();
        start_all(&cluster, root.path());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let target = Some(NodeId::new(1));

        let definition = ProcessDefinition::two_step();
        cluster.deploy(target, &definition).unwrap();
        assert!(matches!(
            cluster.create_instance(target, "process", DefinitionVersion::Latest),
            Err(ClientError::Rejected(_))
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let instance = cluster
            .create_instance(target, "process", DefinitionVersion::Latest)
            .unwrap();

        let second = JobType::from("secondTask");
        assert!(cluster.activate_jobs(target, &second, 10).unwrap().is_empty());

        let first = cluster
            .activate_jobs(target, &JobType::from("firstTask"), 10)
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].instance_key, instance);
        cluster.complete_job(target, first[0].key).unwrap();
        assert!(cluster.complete_job(target, first[0].key).is_err());

        let jobs = cluster.activate_jobs(target, &second, 10).unwrap();
        assert_eq!(jobs.len(), 1);
        cluster.complete_job(target, jobs[0].key).unwrap();
        assert_eq!(cluster.completed_instances(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_quorum_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let cluster = SimCluster::start(config()).unwrap();
        start_all(&cluster, root.path());
        tokio::time::sleep(Duration::from_millis(600)).await;

        cluster.node_stopped(NodeId::new(1));
        cluster.node_stopped(NodeId::new(2));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let err = cluster
            .deploy(Some(NodeId::new(0)), &ProcessDefinition::two_step())
            .unwrap_err();
        assert_eq!(err, ClientError::Unavailable("no quorum".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_written_and_replicated() {
        let root = tempfile::tempdir().unwrap();
        let cluster = SimCluster::start(config()).unwrap();
        start_all(&cluster, root.path());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let target = Some(NodeId::new(0));

        cluster.deploy(target, &ProcessDefinition::two_step()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        for _ in 0..10 {
            cluster
                .create_instance(target, "process", DefinitionVersion::Latest)
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(cluster.snapshot_position(), Some(11));
        for id in 0..3 {
            let dir = root.path().join(format!("node-{id}")).join("snapshots");
            assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1, "node {id}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_failures_are_deterministic() {
        let root = tempfile::tempdir().unwrap();
        let outcomes = |seed: u64| {
            let cluster = SimCluster::start(
                SimConfig {
                    join_delay: Duration::ZERO,
                    ..config()
                }
                .with_seed(seed)
                .with_query_failure_rate(0.5),
            )
            .unwrap();
            start_all(&cluster, root.path());
            (0..32)
                .map(|_| cluster.topology(Some(NodeId::new(0))).is_ok())
                .collect::<Vec<_>>()
        };

        let first = outcomes(7);
        assert_eq!(first, outcomes(7));
        assert!(first.iter().any(|ok| *ok));
        assert!(first.iter().any(|ok| !*ok));
    }
}
