//! Upgrade sequencer.
//!
//! The sequencer moves one node at a time through
//!
//! ```text
//! Idle -> Stopping(n) -> AwaitingRemoval(n) -> Upgrading(n) -> AwaitingReadmission(n) -> Idle
//! ```
//!
//! and ends in `Done` after the last node, or `Failed` at the first step
//! whose deadline expires. There is no rollback: a failed run leaves the
//! cluster as it was at the failing step, and teardown is the caller's job.
//! A call the current state does not allow returns
//! [`ScenarioError::IllegalTransition`] and changes nothing.
//!
//! Every convergence query goes to a node other than the one being upgraded,
//! preferring the node most recently confirmed on the new version.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rollout_core::{NodeId, TopologySnapshot, Version};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClientConnector, ClusterClient};
use crate::config::TimingConfig;
use crate::error::ScenarioError;
use crate::node::StopOutcome;
use crate::poll::{poll_until, Attempt};
use crate::registry::ClusterRegistry;
use crate::topology::TopologyObserver;

/// Order in which nodes are upgraded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Traversal {
    /// Only the given node.
    Single(NodeId),
    /// `N-1` down to `0`.
    #[default]
    ReverseSweep,
    /// `0` up to `N-1`.
    AscendingSweep,
    /// An explicit order.
    Explicit(Vec<NodeId>),
}

impl Traversal {
    /// Node order for a cluster of `size`.
    #[must_use]
    pub fn order(&self, size: u32) -> Vec<NodeId> {
        match self {
            Self::Single(node) => vec![*node],
            Self::ReverseSweep => (0..size).rev().map(NodeId::new).collect(),
            Self::AscendingSweep => (0..size).map(NodeId::new).collect(),
            Self::Explicit(order) => order.clone(),
        }
    }

    /// Returns true if the order visits every node of the cluster exactly once.
    #[must_use]
    pub fn covers_all(&self, size: u32) -> bool {
        let mut order = self.order(size);
        order.sort();
        order == (0..size).map(NodeId::new).collect::<Vec<_>>()
    }
}

impl std::fmt::Display for Traversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(node) => write!(f, "single({node})"),
            Self::ReverseSweep => f.write_str("reverse-sweep"),
            Self::AscendingSweep => f.write_str("ascending-sweep"),
            Self::Explicit(order) => {
                let ids: Vec<String> = order.iter().map(|n| n.get().to_string()).collect();
                write!(f, "explicit[{}]", ids.join(","))
            }
        }
    }
}

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Between nodes.
    Idle,
    /// Shutting the node down.
    Stopping(NodeId),
    /// Waiting for the topology to drop the node.
    AwaitingRemoval(NodeId),
    /// Re-provisioning and starting the node on the new version.
    Upgrading(NodeId),
    /// Waiting for the topology to report the node on the new version.
    AwaitingReadmission(NodeId),
    /// All nodes upgraded.
    Done,
    /// A step failed.
    Failed,
}

impl UpgradeState {
    /// Returns true if moving from `self` to `next` is a legal step.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Done | Self::Failed, _) => false,
            (_, Self::Failed)
            | (Self::Idle, Self::Stopping(_) | Self::Done)
            | (Self::AwaitingReadmission(_), Self::Idle) => true,
            (Self::Stopping(a), Self::AwaitingRemoval(b))
            | (Self::AwaitingRemoval(a), Self::Upgrading(b))
            | (Self::Upgrading(a), Self::AwaitingReadmission(b)) => a == b,
            _ => false,
        }
    }

    /// Node the state is about, if any.
    #[must_use]
    pub const fn node(self) -> Option<NodeId> {
        match self {
            Self::Stopping(node)
            | Self::AwaitingRemoval(node)
            | Self::Upgrading(node)
            | Self::AwaitingReadmission(node) => Some(node),
            Self::Idle | Self::Done | Self::Failed => None,
        }
    }
}

/// A state entered at a point of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State entered.
    pub state: UpgradeState,
    /// Time since the sequencer was created.
    pub at: Duration,
}

/// Result of taking one node out of the cluster.
#[derive(Debug, Clone)]
pub struct NodeRemoval {
    /// The node.
    pub node: NodeId,
    /// Version it ran.
    pub from: Version,
    /// How the shutdown ended.
    pub stop: StopOutcome,
    /// Time until the topology dropped it.
    pub removal: Duration,
    /// The topology that confirmed the removal.
    pub topology: TopologySnapshot,
}

/// Result of one node's full upgrade.
#[derive(Debug, Clone)]
pub struct NodeUpgrade {
    /// The node.
    pub node: NodeId,
    /// Version before.
    pub from: Version,
    /// Version after.
    pub to: Version,
    /// How the shutdown ended.
    pub stop: StopOutcome,
    /// Time until the topology dropped the node.
    pub removal: Duration,
    /// Time until the topology reported the node on the new version.
    pub readmission: Duration,
}

/// Result of a sequencer run.
#[derive(Debug, Clone)]
pub struct UpgradeReport {
    /// Per-node results in upgrade order.
    pub upgrades: Vec<NodeUpgrade>,
    /// Topology verified after a full sweep.
    pub final_topology: Option<TopologySnapshot>,
    /// Total run time.
    pub elapsed: Duration,
}

/// Drives nodes through the upgrade state machine.
pub struct UpgradeSequencer<'a> {
    registry: &'a mut ClusterRegistry,
    connector: Arc<dyn ClientConnector>,
    timing: TimingConfig,
    target_version: Version,
    state: UpgradeState,
    transitions: Vec<Transition>,
    last_confirmed: Option<NodeId>,
    started: Instant,
}

impl std::fmt::Debug for UpgradeSequencer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeSequencer")
            .field("target_version", &self.target_version)
            .field("state", &self.state)
            .field("last_confirmed", &self.last_confirmed)
            .finish_non_exhaustive()
    }
}

impl<'a> UpgradeSequencer<'a> {
    /// Creates an idle sequencer upgrading nodes of `registry` to `target_version`.
    #[must_use]
    pub fn new(
        registry: &'a mut ClusterRegistry,
        connector: Arc<dyn ClientConnector>,
        timing: TimingConfig,
        target_version: Version,
    ) -> Self {
        Self {
            registry,
            connector,
            timing,
            target_version,
            state: UpgradeState::Idle,
            transitions: vec![Transition {
                state: UpgradeState::Idle,
                at: Duration::ZERO,
            }],
            last_confirmed: None,
            started: Instant::now(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> UpgradeState {
        self.state
    }

    /// Every state entered so far.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Node most recently confirmed on the new version.
    #[must_use]
    pub const fn last_confirmed(&self) -> Option<NodeId> {
        self.last_confirmed
    }

    /// The registry being upgraded.
    #[must_use]
    pub fn registry(&self) -> &ClusterRegistry {
        &*self.registry
    }

    /// Node to send requests to while `excluding` is out.
    ///
    /// # Errors
    /// Returns [`ScenarioError::NoAvailableNode`] if no other node runs.
    pub fn query_target(&self, excluding: Option<NodeId>) -> Result<NodeId, ScenarioError> {
        let usable = |node: NodeId| {
            Some(node) != excluding
                && self
                    .registry
                    .get(node)
                    .is_ok_and(crate::node::NodeHandle::is_running)
        };

        if let Some(node) = self.last_confirmed.filter(|node| usable(*node)) {
            return Ok(node);
        }
        self.registry
            .running()
            .into_iter()
            .find(|node| usable(*node))
            .ok_or(ScenarioError::NoAvailableNode { excluding })
    }

    /// Client for the current query target.
    ///
    /// # Errors
    /// Returns an error if no node other than `excluding` is running.
    pub fn client(&self, excluding: Option<NodeId>) -> Result<Arc<dyn ClusterClient>, ScenarioError> {
        let target = self.query_target(excluding)?;
        let address = self.registry.gateway_address(target)?;
        Ok(self.connector.connect(&address))
    }

    fn observer(&self, excluding: NodeId) -> Result<TopologyObserver, ScenarioError> {
        Ok(TopologyObserver::new(
            self.client(Some(excluding))?,
            self.registry.shape(),
        ))
    }

    fn ensure(&self, next: UpgradeState) -> Result<(), ScenarioError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(ScenarioError::IllegalTransition {
                from: self.state,
                to: next,
            })
        }
    }

    fn enter(&mut self, next: UpgradeState) -> Result<(), ScenarioError> {
        self.ensure(next)?;
        info!(from = ?self.state, to = ?next, "sequencer transition");
        self.state = next;
        self.transitions.push(Transition {
            state: next,
            at: self.started.elapsed(),
        });
        Ok(())
    }

    fn fail(&mut self, error: ScenarioError) -> ScenarioError {
        if matches!(error, ScenarioError::IllegalTransition { .. }) {
            return error;
        }
        warn!(state = ?self.state, %error, "upgrade step failed");
        if let Err(illegal) = self.enter(UpgradeState::Failed) {
            debug!(%illegal, "sequencer already ended");
        }
        error
    }

    /// Shuts `node` down and waits until the topology no longer lists it.
    ///
    /// Leaves the sequencer in `AwaitingRemoval(node)`; the caller may drive
    /// work against the degraded cluster before calling
    /// [`bring_up`](Self::bring_up).
    ///
    /// # Errors
    /// Returns the first failing step; the sequencer is then `Failed`.
    pub async fn take_down(&mut self, node: NodeId) -> Result<NodeRemoval, ScenarioError> {
        match self.take_down_inner(node).await {
            Ok(removal) => Ok(removal),
            Err(error) => Err(self.fail(error)),
        }
    }

    async fn take_down_inner(&mut self, node: NodeId) -> Result<NodeRemoval, ScenarioError> {
        self.ensure(UpgradeState::Stopping(node))?;
        let from = self.registry.get(node)?.member().version().clone();

        self.enter(UpgradeState::Stopping(node))?;
        let grace_period = self.timing.grace_period;
        let stop = self.registry.get_mut(node)?.shutdown(grace_period).await?;

        self.enter(UpgradeState::AwaitingRemoval(node))?;
        let observer = self.observer(node)?;
        let waited = Instant::now();
        let topology = observer.excludes(node, self.timing.removal).await?;

        Ok(NodeRemoval {
            node,
            from,
            stop,
            removal: waited.elapsed(),
            topology,
        })
    }

    /// Re-provisions `node` on the target version, starts it and waits until
    /// the topology reports it on that version.
    ///
    /// Once readmitted, every other member must still report the version the
    /// registry holds for it.
    ///
    /// # Errors
    /// Returns the first failing step; the sequencer is then `Failed`.
    pub async fn bring_up(&mut self, node: NodeId) -> Result<Duration, ScenarioError> {
        match self.bring_up_inner(node).await {
            Ok(readmission) => Ok(readmission),
            Err(error) => Err(self.fail(error)),
        }
    }

    async fn bring_up_inner(&mut self, node: NodeId) -> Result<Duration, ScenarioError> {
        self.enter(UpgradeState::Upgrading(node))?;
        let target_version = self.target_version.clone();
        self.registry.replace(node, &target_version)?.start().await?;

        self.enter(UpgradeState::AwaitingReadmission(node))?;
        let observer = self.observer(node)?;
        let waited = Instant::now();
        let topology = observer
            .includes_upgraded(node, &target_version, self.timing.readmission)
            .await?;
        let readmission = waited.elapsed();

        if let Some(drift) = topology
            .version_drift(&self.registry.versions(), node)
            .into_iter()
            .next()
        {
            return Err(ScenarioError::VersionDrift {
                upgraded: node,
                node: drift.node,
                expected: drift.expected,
                observed: drift.observed,
            });
        }

        self.last_confirmed = Some(node);
        self.enter(UpgradeState::Idle)?;
        info!(%node, version = %target_version, ?readmission, "node upgraded");
        Ok(readmission)
    }

    /// Takes `node` down and brings it back on the target version.
    ///
    /// # Errors
    /// Returns the first failing step; the sequencer is then `Failed`.
    pub async fn upgrade_node(&mut self, node: NodeId) -> Result<NodeUpgrade, ScenarioError> {
        let removal = self.take_down(node).await?;
        let readmission = self.bring_up(node).await?;
        Ok(NodeUpgrade {
            node,
            from: removal.from,
            to: self.target_version.clone(),
            stop: removal.stop,
            removal: removal.removal,
            readmission,
        })
    }

    /// Resolves `traversal` against the registry.
    ///
    /// Checked before any node is touched, so a bad order never leaves the
    /// cluster half upgraded.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownNode`](crate::error::NodeError::UnknownNode)
    /// for an id outside the cluster and [`ScenarioError::RepeatedNode`] for
    /// an id listed twice.
    pub fn plan(&self, traversal: &Traversal) -> Result<Vec<NodeId>, ScenarioError> {
        let order = traversal.order(self.registry.size());
        let mut seen = BTreeSet::new();
        for node in &order {
            self.registry.get(*node)?;
            if !seen.insert(*node) {
                return Err(ScenarioError::RepeatedNode { node: *node });
            }
        }
        Ok(order)
    }

    /// Upgrades every node of `traversal`, one at a time.
    ///
    /// # Errors
    /// Returns an error without touching any node if the order is invalid
    /// (see [`plan`](Self::plan)). Otherwise returns the first failing step;
    /// the sequencer is then `Failed`.
    pub async fn run(&mut self, traversal: &Traversal) -> Result<UpgradeReport, ScenarioError> {
        let order = self.plan(traversal)?;
        info!(%traversal, ?order, version = %self.target_version, "rolling upgrade started");

        let mut upgrades = Vec::with_capacity(order.len());
        for node in order {
            upgrades.push(self.upgrade_node(node).await?);
        }
        self.finish(traversal, upgrades).await
    }

    /// Ends a run whose nodes were upgraded step by step.
    ///
    /// After a traversal covering every node, the topology must report all
    /// members on the target version with the configured size and
    /// replication factor.
    ///
    /// # Errors
    /// Returns [`ScenarioError::UnexpectedTopology`] if the final check
    /// fails; the sequencer is then `Failed`.
    pub async fn finish(
        &mut self,
        traversal: &Traversal,
        upgrades: Vec<NodeUpgrade>,
    ) -> Result<UpgradeReport, ScenarioError> {
        self.ensure(UpgradeState::Done)?;
        let final_topology = if traversal.covers_all(self.registry.size()) {
            let target_version = self.target_version.clone();
            match self.await_complete(&target_version).await {
                Ok(topology) => Some(topology),
                Err(error) => return Err(self.fail(error)),
            }
        } else {
            None
        };

        self.enter(UpgradeState::Done)?;
        let elapsed = self.started.elapsed();
        info!(nodes = upgrades.len(), ?elapsed, "rolling upgrade finished");
        Ok(UpgradeReport {
            upgrades,
            final_topology,
            elapsed,
        })
    }

    /// Waits until the topology lists every member on `version` with the
    /// configured size and replication factor.
    ///
    /// Bounded by the readmission policy.
    ///
    /// # Errors
    /// Returns [`ScenarioError::UnexpectedTopology`] with the last
    /// observation when the wait expires.
    pub async fn await_complete(&self, version: &Version) -> Result<TopologySnapshot, ScenarioError> {
        let shape = self.registry.shape();
        let observer = TopologyObserver::new(self.client(None)?, shape);

        let snapshot = poll_until("complete topology", self.timing.readmission, || async {
            match observer.query().await {
                Ok(snapshot)
                    if snapshot.member_count() == shape.size as usize
                        && snapshot.cluster_size == shape.size
                        && snapshot.replication_factor == shape.replication_factor
                        && snapshot.all_on(version) =>
                {
                    Attempt::Ready(snapshot)
                }
                Ok(snapshot) => Attempt::NotYet(snapshot.to_string()),
                Err(error) => Attempt::NotYet(error.to_string()),
            }
        })
        .await
        .map_err(|expired| ScenarioError::UnexpectedTopology {
            observed: expired.last_observation,
        })?;

        info!(topology = %snapshot, "topology complete");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use rollout_core::MemberInfo;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::error::{ClientError, NodeError};
    use crate::testing::{FakeRuntime, ScriptedClient, SharedConnector};

    fn view(members: &[(u32, &str)]) -> TopologySnapshot {
        TopologySnapshot {
            members: members
                .iter()
                .map(|(id, v)| MemberInfo::new(NodeId::new(*id), *v))
                .collect(),
            cluster_size: 3,
            replication_factor: 3,
        }
    }

    async fn started_registry(root: &std::path::Path) -> ClusterRegistry {
        let mut registry = ClusterRegistry::new(
            ClusterConfig::default(),
            &Version::from("A"),
            Arc::new(FakeRuntime::default()),
            root,
        )
        .unwrap();
        registry.start_all().await.unwrap();
        registry
    }

    #[test]
    fn test_traversal_orders() {
        assert_eq!(
            Traversal::ReverseSweep.order(3),
            vec![NodeId::new(2), NodeId::new(1), NodeId::new(0)]
        );
        assert_eq!(
            Traversal::AscendingSweep.order(3),
            vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)]
        );
        assert_eq!(Traversal::Single(NodeId::new(1)).order(3), vec![NodeId::new(1)]);
        assert!(Traversal::ReverseSweep.covers_all(3));
        assert!(!Traversal::Single(NodeId::new(1)).covers_all(3));
        assert!(!Traversal::Explicit(vec![NodeId::new(0), NodeId::new(0), NodeId::new(1)])
            .covers_all(3));
        assert_eq!(Traversal::default(), Traversal::ReverseSweep);
    }

    #[test]
    fn test_state_transitions() {
        let n = NodeId::new(1);
        let m = NodeId::new(2);
        assert!(UpgradeState::Idle.can_transition_to(UpgradeState::Stopping(n)));
        assert!(UpgradeState::Stopping(n).can_transition_to(UpgradeState::AwaitingRemoval(n)));
        assert!(!UpgradeState::Stopping(n).can_transition_to(UpgradeState::AwaitingRemoval(m)));
        assert!(!UpgradeState::Stopping(n).can_transition_to(UpgradeState::Upgrading(n)));
        assert!(UpgradeState::AwaitingReadmission(n).can_transition_to(UpgradeState::Idle));
        assert!(UpgradeState::Upgrading(n).can_transition_to(UpgradeState::Failed));
        assert!(!UpgradeState::Failed.can_transition_to(UpgradeState::Idle));
        assert!(!UpgradeState::Done.can_transition_to(UpgradeState::Failed));
        assert_eq!(UpgradeState::Upgrading(n).node(), Some(n));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_upgrade() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = started_registry(root.path()).await;

        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "A"), (1, "A"), (2, "A")])));
        client.push_topology(Ok(view(&[(1, "A"), (2, "A")])));
        client.push_topology(Ok(view(&[(0, "B"), (1, "A"), (2, "A")])));

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );
        let report = sequencer
            .run(&Traversal::Single(NodeId::new(0)))
            .await
            .unwrap();

        assert_eq!(sequencer.state(), UpgradeState::Done);
        assert_eq!(sequencer.last_confirmed(), Some(NodeId::new(0)));
        let states: Vec<UpgradeState> = sequencer.transitions().iter().map(|t| t.state).collect();
        let node = NodeId::new(0);
        assert_eq!(
            states,
            vec![
                UpgradeState::Idle,
                UpgradeState::Stopping(node),
                UpgradeState::AwaitingRemoval(node),
                UpgradeState::Upgrading(node),
                UpgradeState::AwaitingReadmission(node),
                UpgradeState::Idle,
                UpgradeState::Done,
            ]
        );
        assert_eq!(report.upgrades.len(), 1);
        assert_eq!(report.upgrades[0].from, Version::from("A"));
        assert!(report.final_topology.is_none());

        assert_eq!(registry.get(node).unwrap().member().version(), &Version::from("B"));
        assert!(registry.get(node).unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_timeout_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = started_registry(root.path()).await;

        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "A"), (1, "A"), (2, "A")])));

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );
        let err = sequencer.run(&Traversal::ReverseSweep).await.unwrap_err();

        assert!(matches!(err, ScenarioError::Convergence(_)), "{err}");
        assert_eq!(err.node(), Some(NodeId::new(2)));
        assert_eq!(sequencer.state(), UpgradeState::Failed);
        // Never re-provisioned.
        assert_eq!(
            registry.get(NodeId::new(2)).unwrap().member().version(),
            &Version::from("A")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_drift_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = started_registry(root.path()).await;

        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "A"), (1, "A")])));
        client.push_topology(Ok(view(&[(0, "A"), (1, "B"), (2, "B")])));

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );
        let err = sequencer.upgrade_node(NodeId::new(2)).await.unwrap_err();

        match err {
            ScenarioError::VersionDrift { upgraded, node, .. } => {
                assert_eq!(upgraded, NodeId::new(2));
                assert_eq!(node, NodeId::new(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sequencer.state(), UpgradeState::Failed);
    }

    #[tokio::test]
    async fn test_query_target_prefers_last_confirmed() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = started_registry(root.path()).await;

        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Err(ClientError::Unavailable("unused".to_string())));
        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );

        assert_eq!(sequencer.query_target(None).unwrap(), NodeId::new(0));
        assert_eq!(
            sequencer.query_target(Some(NodeId::new(0))).unwrap(),
            NodeId::new(1)
        );

        sequencer.last_confirmed = Some(NodeId::new(2));
        assert_eq!(sequencer.query_target(None).unwrap(), NodeId::new(2));
        assert_eq!(
            sequencer.query_target(Some(NodeId::new(2))).unwrap(),
            NodeId::new(0)
        );
    }

    #[tokio::test]
    async fn test_query_target_without_running_nodes() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = ClusterRegistry::new(
            ClusterConfig::default(),
            &Version::from("A"),
            Arc::new(FakeRuntime::default()),
            root.path(),
        )
        .unwrap();
        let client = Arc::new(ScriptedClient::default());
        let sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );

        assert!(matches!(
            sequencer.query_target(Some(NodeId::new(1))),
            Err(ScenarioError::NoAvailableNode {
                excluding: Some(node)
            }) if node == NodeId::new(1)
        ));
        let err = sequencer.query_target(None).unwrap_err();
        assert_eq!(err.node(), None, "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_while_idle_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let mut registry = ClusterRegistry::new(
            ClusterConfig::default(),
            &Version::from("A"),
            Arc::clone(&runtime) as Arc<dyn crate::node::NodeRuntime>,
            root.path(),
        )
        .unwrap();
        registry.start_all().await.unwrap();

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(Arc::new(ScriptedClient::default()))),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );
        let err = sequencer.bring_up(NodeId::new(0)).await.unwrap_err();

        match err {
            ScenarioError::IllegalTransition { from, to } => {
                assert_eq!(from, UpgradeState::Idle);
                assert_eq!(to, UpgradeState::Upgrading(NodeId::new(0)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sequencer.state(), UpgradeState::Idle);
        assert_eq!(sequencer.transitions().len(), 1);
        // Running node untouched: no replacement was provisioned.
        assert_eq!(runtime.provisioned().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_after_failure_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut registry = started_registry(root.path()).await;

        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "A"), (1, "A"), (2, "A")])));

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(client)),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );
        sequencer.run(&Traversal::ReverseSweep).await.unwrap_err();
        assert_eq!(sequencer.state(), UpgradeState::Failed);
        let recorded = sequencer.transitions().len();

        let err = sequencer.run(&Traversal::ReverseSweep).await.unwrap_err();
        assert!(
            matches!(
                err,
                ScenarioError::IllegalTransition {
                    from: UpgradeState::Failed,
                    to: UpgradeState::Stopping(_),
                }
            ),
            "{err}"
        );
        assert_eq!(sequencer.state(), UpgradeState::Failed);
        assert_eq!(sequencer.transitions().len(), recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_explicit_order_touches_nothing() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let mut registry = ClusterRegistry::new(
            ClusterConfig::default(),
            &Version::from("A"),
            Arc::clone(&runtime) as Arc<dyn crate::node::NodeRuntime>,
            root.path(),
        )
        .unwrap();
        registry.start_all().await.unwrap();

        let mut sequencer = UpgradeSequencer::new(
            &mut registry,
            Arc::new(SharedConnector::new(Arc::new(ScriptedClient::default()))),
            TimingConfig::fast_for_testing(),
            Version::from("B"),
        );

        let unknown = Traversal::Explicit(vec![NodeId::new(0), NodeId::new(9)]);
        let err = sequencer.run(&unknown).await.unwrap_err();
        assert!(
            matches!(err, ScenarioError::Node(NodeError::UnknownNode { node, size: 3 }) if node == NodeId::new(9)),
            "{err}"
        );

        let repeated = Traversal::Explicit(vec![NodeId::new(1), NodeId::new(0), NodeId::new(1)]);
        let err = sequencer.run(&repeated).await.unwrap_err();
        assert!(
            matches!(err, ScenarioError::RepeatedNode { node } if node == NodeId::new(1)),
            "{err}"
        );

        assert_eq!(sequencer.state(), UpgradeState::Idle);
        assert_eq!(runtime.provisioned().len(), 3);
        let node = registry.get(NodeId::new(0)).unwrap();
        assert!(node.is_running());
        assert_eq!(node.member().version(), &Version::from("A"));
    }
}
