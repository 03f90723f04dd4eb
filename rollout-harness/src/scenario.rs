//! Upgrade scenarios.
//!
//! A scenario provisions a fresh cluster on the old version, starts every
//! node, drives the sequencer and the work driver, and always tears the
//! cluster down again. Incompatible version pairs are skipped before the
//! cluster is provisioned.

use std::sync::Arc;
use std::time::Duration;

use rollout_core::{InstanceKey, NodeId};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::client::{ClientConnector, ProcessDefinition};
use crate::compat::CompatibilityPolicy;
use crate::config::HarnessConfig;
use crate::error::{IncompatibleVersion, ScenarioError};
use crate::journal::{expected_entries, JobJournal};
use crate::node::NodeRuntime;
use crate::registry::ClusterRegistry;
use crate::sequencer::{NodeUpgrade, Transition, Traversal, UpgradeSequencer};
use crate::snapshot::SnapshotVerifier;
use crate::work::WorkDriver;

/// A scripted upgrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Restart one node on the new version and wait until it rejoins.
    RestartWithNewVersion {
        /// Node to upgrade.
        node: NodeId,
    },
    /// Write while one node is away, then check that a snapshot taken on the
    /// old version reaches the node after it rejoins on the new one.
    SnapshotAcrossVersions {
        /// Node to upgrade.
        node: NodeId,
    },
    /// Upgrade every node and check that work created before and after the
    /// upgrade is processed exactly once, in order.
    RollingUpgrade {
        /// Upgrade order.
        traversal: Traversal,
        /// Also create one instance while each node is away.
        probe_during_absence: bool,
    },
}

impl Scenario {
    /// Stable name used in reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RestartWithNewVersion { .. } => "restart-with-new-version",
            Self::SnapshotAcrossVersions { .. } => "snapshot-across-versions",
            Self::RollingUpgrade { .. } => "rolling-upgrade",
        }
    }

    /// The three canonical scenarios with their default parameters.
    #[must_use]
    pub fn all() -> Vec<Self> {
        vec![
            Self::RestartWithNewVersion {
                node: NodeId::new(0),
            },
            Self::SnapshotAcrossVersions {
                node: NodeId::new(1),
            },
            Self::RollingUpgrade {
                traversal: Traversal::ReverseSweep,
                probe_during_absence: false,
            },
        ]
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartWithNewVersion { node } | Self::SnapshotAcrossVersions { node } => {
                write!(f, "{}({node})", self.name())
            }
            Self::RollingUpgrade { traversal, .. } => write!(f, "{}({traversal})", self.name()),
        }
    }
}

/// How a scenario ended.
#[derive(Debug)]
pub enum ScenarioOutcome {
    /// Every check held.
    Passed,
    /// A step failed.
    Failed(ScenarioError),
    /// The version pair cannot be rolled; nothing was touched.
    Skipped(IncompatibleVersion),
}

impl ScenarioOutcome {
    /// Returns true for [`ScenarioOutcome::Passed`].
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Returns true for [`ScenarioOutcome::Skipped`].
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Returns true for [`ScenarioOutcome::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Report of one scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    /// Scenario name.
    pub name: &'static str,
    /// Outcome.
    pub outcome: ScenarioOutcome,
    /// Time until the scenario passed or failed. Teardown is not included.
    pub elapsed: Duration,
    /// Sequencer states entered.
    pub transitions: Vec<Transition>,
    /// Nodes upgraded.
    pub upgrades: Vec<NodeUpgrade>,
    /// Instances created and verified.
    pub instances: Vec<InstanceKey>,
}

impl std::fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            ScenarioOutcome::Passed => {
                write!(f, "PASS {} in {:?}", self.name, self.elapsed)
            }
            ScenarioOutcome::Skipped(reason) => write!(f, "SKIP {}: {reason}", self.name),
            ScenarioOutcome::Failed(error) => match error.node() {
                Some(node) => write!(
                    f,
                    "FAIL {} at {node} after {:?}: {error}",
                    self.name, self.elapsed
                ),
                None => write!(f, "FAIL {} after {:?}: {error}", self.name, self.elapsed),
            },
        }
    }
}

#[derive(Debug, Default)]
struct RunDetails {
    upgrades: Vec<NodeUpgrade>,
    instances: Vec<InstanceKey>,
}

/// What a provisioned run produced, measured before teardown.
#[derive(Debug)]
struct Execution {
    result: Result<RunDetails, ScenarioError>,
    transitions: Vec<Transition>,
    elapsed: Duration,
}

/// Runs scenarios against fresh clusters.
pub struct ScenarioRunner {
    config: HarnessConfig,
    runtime: Arc<dyn NodeRuntime>,
    connector: Arc<dyn ClientConnector>,
    compatibility: CompatibilityPolicy,
    definition: ProcessDefinition,
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("config", &self.config)
            .field("compatibility", &self.compatibility)
            .finish_non_exhaustive()
    }
}

impl ScenarioRunner {
    /// Creates a runner provisioning nodes through `runtime` and talking to
    /// them through `connector`.
    #[must_use]
    pub fn new(
        config: HarnessConfig,
        runtime: Arc<dyn NodeRuntime>,
        connector: Arc<dyn ClientConnector>,
    ) -> Self {
        Self {
            config,
            runtime,
            connector,
            compatibility: CompatibilityPolicy::default(),
            definition: ProcessDefinition::two_step(),
        }
    }

    /// Replaces the compatibility policy.
    #[must_use]
    pub fn with_compatibility(mut self, compatibility: CompatibilityPolicy) -> Self {
        self.compatibility = compatibility;
        self
    }

    /// The configuration runs use.
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs `scenario` on a fresh cluster.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        let mut report = ScenarioReport {
            name: scenario.name(),
            outcome: ScenarioOutcome::Passed,
            elapsed: Duration::ZERO,
            transitions: Vec::new(),
            upgrades: Vec::new(),
            instances: Vec::new(),
        };

        if let Err(incompatible) = self
            .compatibility
            .check(&self.config.old_version, &self.config.new_version)
        {
            warn!(%scenario, reason = %incompatible, "scenario skipped");
            report.outcome = ScenarioOutcome::Skipped(incompatible);
            return report;
        }

        info!(
            %scenario,
            from = %self.config.old_version,
            to = %self.config.new_version,
            size = self.config.cluster.size,
            "scenario started"
        );

        let Execution {
            result,
            transitions,
            elapsed,
        } = self.provision_and_execute(scenario, started).await;
        report.transitions = transitions;
        report.elapsed = elapsed;
        match result {
            Ok(details) => {
                report.upgrades = details.upgrades;
                report.instances = details.instances;
                info!(%scenario, elapsed = ?report.elapsed, "scenario passed");
            }
            Err(failure) => {
                error!(%scenario, node = ?failure.node(), elapsed = ?report.elapsed, %failure, "scenario failed");
                report.outcome = ScenarioOutcome::Failed(failure);
            }
        }
        report
    }

    /// Runs every scenario in turn.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(scenario).await);
        }
        reports
    }

    async fn provision_and_execute(&self, scenario: &Scenario, started: Instant) -> Execution {
        let aborted = |failure: ScenarioError| Execution {
            result: Err(failure),
            transitions: Vec::new(),
            elapsed: started.elapsed(),
        };

        if let Err(invalid) = self.config.validate() {
            return aborted(invalid.into());
        }

        let mut registry = match ClusterRegistry::new(
            self.config.cluster.clone(),
            &self.config.old_version,
            Arc::clone(&self.runtime),
            &self.config.shared_data_root,
        ) {
            Ok(registry) => registry,
            Err(failure) => return aborted(failure.into()),
        };

        let (result, transitions) = self.execute(&mut registry, scenario).await;
        let elapsed = started.elapsed();
        registry.teardown().await;
        Execution {
            result,
            transitions,
            elapsed,
        }
    }

    async fn execute(
        &self,
        registry: &mut ClusterRegistry,
        scenario: &Scenario,
    ) -> (Result<RunDetails, ScenarioError>, Vec<Transition>) {
        if let Err(failure) = registry.start_all().await {
            return (Err(failure.into()), Vec::new());
        }

        let mut sequencer = UpgradeSequencer::new(
            registry,
            Arc::clone(&self.connector),
            self.config.timing.clone(),
            self.config.new_version.clone(),
        );

        let result = match sequencer.await_complete(&self.config.old_version).await {
            Err(failure) => Err(failure),
            Ok(_) => match scenario {
                Scenario::RestartWithNewVersion { node } => {
                    self.restart_with_new_version(&mut sequencer, *node).await
                }
                Scenario::SnapshotAcrossVersions { node } => {
                    self.snapshot_across_versions(&mut sequencer, *node).await
                }
                Scenario::RollingUpgrade {
                    traversal,
                    probe_during_absence,
                } => {
                    self.rolling_upgrade(&mut sequencer, traversal, *probe_during_absence)
                        .await
                }
            },
        };

        (result, sequencer.transitions().to_vec())
    }

    fn driver(
        &self,
        sequencer: &UpgradeSequencer<'_>,
        excluding: Option<NodeId>,
    ) -> Result<WorkDriver, ScenarioError> {
        Ok(WorkDriver::new(
            sequencer.client(excluding)?,
            self.config.timing.clone(),
        ))
    }

    async fn restart_with_new_version(
        &self,
        sequencer: &mut UpgradeSequencer<'_>,
        node: NodeId,
    ) -> Result<RunDetails, ScenarioError> {
        let report = sequencer.run(&Traversal::Single(node)).await?;
        Ok(RunDetails {
            upgrades: report.upgrades,
            instances: Vec::new(),
        })
    }

    async fn snapshot_across_versions(
        &self,
        sequencer: &mut UpgradeSequencer<'_>,
        node: NodeId,
    ) -> Result<RunDetails, ScenarioError> {
        let driver = self.driver(sequencer, None)?;
        driver.deploy(&self.definition).await?;
        let mut instances = vec![driver.create_instance(&self.definition.process_id).await?];

        let removal = sequencer.take_down(node).await?;

        let driver = self.driver(sequencer, Some(node))?;
        instances.extend(
            driver
                .create_instances(&self.definition.process_id, self.config.write_pressure)
                .await?,
        );

        let verifier = SnapshotVerifier::new(&self.config.cluster.snapshot_subpath);
        let peer = sequencer.query_target(Some(node))?;
        verifier
            .await_snapshot(sequencer.registry(), peer, self.config.timing.snapshot)
            .await?;

        let readmission = sequencer.bring_up(node).await?;
        verifier
            .await_snapshot(sequencer.registry(), node, self.config.timing.snapshot)
            .await?;

        let upgrade = NodeUpgrade {
            node,
            from: removal.from,
            to: self.config.new_version.clone(),
            stop: removal.stop,
            removal: removal.removal,
            readmission,
        };
        let report = sequencer
            .finish(&Traversal::Single(node), vec![upgrade])
            .await?;
        Ok(RunDetails {
            upgrades: report.upgrades,
            instances,
        })
    }

    async fn rolling_upgrade(
        &self,
        sequencer: &mut UpgradeSequencer<'_>,
        traversal: &Traversal,
        probe_during_absence: bool,
    ) -> Result<RunDetails, ScenarioError> {
        let process_id = &self.definition.process_id;
        let driver = self.driver(sequencer, None)?;
        driver.deploy(&self.definition).await?;
        let mut instances = vec![driver.create_instance(process_id).await?];

        let report = if probe_during_absence {
            let mut upgrades = Vec::new();
            for node in sequencer.plan(traversal)? {
                let removal = sequencer.take_down(node).await?;
                let probe = self.driver(sequencer, Some(node))?;
                instances.push(probe.create_instance(process_id).await?);
                let readmission = sequencer.bring_up(node).await?;
                upgrades.push(NodeUpgrade {
                    node,
                    from: removal.from,
                    to: self.config.new_version.clone(),
                    stop: removal.stop,
                    removal: removal.removal,
                    readmission,
                });
            }
            sequencer.finish(traversal, upgrades).await?
        } else {
            sequencer.run(traversal).await?
        };

        let driver = self.driver(sequencer, None)?;
        instances.push(driver.create_instance(process_id).await?);

        let journal = JobJournal::new();
        let workers = driver.run_workers(&self.definition, &journal);
        let expected = expected_entries(&instances, &self.definition.job_types);
        let verified = driver.await_journal(&journal, &expected).await;
        for worker in workers {
            worker.shutdown().await;
        }
        verified?;

        Ok(RunDetails {
            upgrades: report.upgrades,
            instances,
        })
    }
}

#[cfg(test)]
mod tests {
    use rollout_core::{MemberInfo, TopologySnapshot};

    use super::*;
    use crate::config::TimingConfig;
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

    fn config(root: &std::path::Path, new_version: &str) -> HarnessConfig {
        HarnessConfig::default()
            .with_versions("0.24.0", new_version)
            .with_timing(TimingConfig::fast_for_testing())
            .with_shared_data_root(root)
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_version_is_skipped_untouched() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let client = Arc::new(ScriptedClient::default());
        let runner = ScenarioRunner::new(
            config(root.path(), "0.25.0"),
            Arc::clone(&runtime) as Arc<dyn NodeRuntime>,
            Arc::new(SharedConnector::new(client)),
        );

        for scenario in Scenario::all() {
            let report = runner.run(&scenario).await;
            assert!(report.outcome.is_skipped(), "{report}");
            assert!(report.transitions.is_empty());
        }
        assert!(runtime.provisioned().is_empty());
        assert_eq!(runtime.probe(NodeId::new(0)).starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_with_new_version_passes_and_tears_down() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "0.24.0"), (1, "0.24.0"), (2, "0.24.0")])));
        client.push_topology(Ok(view(&[(1, "0.24.0"), (2, "0.24.0")])));
        client.push_topology(Ok(view(&[(0, "0.24.1"), (1, "0.24.0"), (2, "0.24.0")])));

        let runner = ScenarioRunner::new(
            config(root.path(), "0.24.1"),
            Arc::clone(&runtime) as Arc<dyn NodeRuntime>,
            Arc::new(SharedConnector::new(client)),
        );
        let report = runner
            .run(&Scenario::RestartWithNewVersion {
                node: NodeId::new(0),
            })
            .await;

        assert!(report.outcome.is_passed(), "{report}");
        assert_eq!(report.upgrades.len(), 1);
        // Three initial launches plus the replacement.
        assert_eq!(runtime.provisioned().len(), 4);
        // Teardown force-stops every node.
        for id in 0..3 {
            assert_eq!(runtime.probe(NodeId::new(id)).forced_stops(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reports_node_and_still_tears_down() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "0.24.0"), (1, "0.24.0"), (2, "0.24.0")])));

        let runner = ScenarioRunner::new(
            config(root.path(), "0.24.1"),
            Arc::clone(&runtime) as Arc<dyn NodeRuntime>,
            Arc::new(SharedConnector::new(client)),
        );
        let report = runner
            .run(&Scenario::RestartWithNewVersion {
                node: NodeId::new(0),
            })
            .await;

        match &report.outcome {
            ScenarioOutcome::Failed(failure) => assert_eq!(failure.node(), Some(NodeId::new(0))),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(report.to_string().starts_with("FAIL restart-with-new-version at node-0"));
        for id in 1..3 {
            assert_eq!(runtime.probe(NodeId::new(id)).forced_stops(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_excludes_teardown() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        for id in 0..3 {
            runtime
                .probe(NodeId::new(id))
                .set_force_delay(Duration::from_secs(60));
        }
        let client = Arc::new(ScriptedClient::default());
        client.push_topology(Ok(view(&[(0, "0.24.0"), (1, "0.24.0"), (2, "0.24.0")])));

        let runner = ScenarioRunner::new(
            config(root.path(), "0.24.1"),
            Arc::clone(&runtime) as Arc<dyn NodeRuntime>,
            Arc::new(SharedConnector::new(client)),
        );
        let started = Instant::now();
        let report = runner
            .run(&Scenario::RestartWithNewVersion {
                node: NodeId::new(0),
            })
            .await;

        assert!(report.outcome.is_failed(), "{report}");
        // Teardown waited for the slow kills; the report stops at the failure.
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(report.elapsed < Duration::from_secs(60), "{:?}", report.elapsed);
    }

    #[test]
    fn test_scenario_names() {
        let names: Vec<&str> = Scenario::all().iter().map(Scenario::name).collect();
        assert_eq!(
            names,
            vec!["restart-with-new-version", "snapshot-across-versions", "rolling-upgrade"]
        );
    }
}
