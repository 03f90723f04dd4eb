//! Scenario tests against the simulated cluster.
//!
//! Every test runs on a paused clock: the simulation's delays and the
//! harness's polling budgets advance together, so failures caused by slow
//! convergence show up deterministically.

use std::sync::Arc;
use std::time::Duration;

use rollout_core::{JobType, MemberInfo, NodeId, Version};
use rollout_harness::{
    expected_entries, ClusterConfig, ClusterRegistry, HarnessConfig, JobJournal, NodeRuntime,
    ProcessDefinition, Scenario, ScenarioError, ScenarioOutcome, StopOutcome, TimingConfig,
    Traversal, UpgradeSequencer, UpgradeState, WorkDriver,
};

use crate::{simulated_runner, SimCluster, SimConfig, SimConnector, SimRuntime};

fn harness(root: &std::path::Path) -> HarnessConfig {
    HarnessConfig::default()
        .with_versions("0.24.0", "0.24.1")
        .with_cluster(ClusterConfig::default().with_snapshot_period(Duration::from_secs(1)))
        .with_timing(TimingConfig::fast_for_testing())
        .with_shared_data_root(root)
}

fn rolling(traversal: Traversal) -> Scenario {
    Scenario::RollingUpgrade {
        traversal,
        probe_during_absence: false,
    }
}

// ----------------------------------------------------------------------------
// Passing scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_all_scenarios_pass() {
    let root = tempfile::tempdir().unwrap();
    let (runner, runtime) = simulated_runner(harness(root.path()), SimConfig::default()).unwrap();

    let reports = runner.run_all(&Scenario::all()).await;

    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert!(report.outcome.is_passed(), "{report}");
    }
    // 3 launches each, plus 1 + 1 + 3 replacements.
    assert_eq!(runtime.provisions(), 14);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_reverse_sweep_of_three_nodes() {
    let root = tempfile::tempdir().unwrap();
    let config = harness(root.path()).with_versions("A", "B");
    let cluster = SimCluster::start(SimConfig::from_cluster(&config.cluster)).unwrap();
    let runtime: Arc<dyn NodeRuntime> = Arc::new(SimRuntime::new(Arc::clone(&cluster)));
    let mut registry = ClusterRegistry::new(
        config.cluster.clone(),
        &config.old_version,
        runtime,
        root.path(),
    )
    .unwrap();
    registry.start_all().await.unwrap();

    let mut sequencer = UpgradeSequencer::new(
        &mut registry,
        Arc::new(SimConnector::new(Arc::clone(&cluster))),
        config.timing.clone(),
        config.new_version.clone(),
    );
    sequencer.await_complete(&config.old_version).await.unwrap();
    let report = sequencer.run(&Traversal::ReverseSweep).await.unwrap();

    let order: Vec<NodeId> = report.upgrades.iter().map(|u| u.node).collect();
    assert_eq!(order, vec![NodeId::new(2), NodeId::new(1), NodeId::new(0)]);
    assert_eq!(sequencer.state(), UpgradeState::Done);
    assert_eq!(sequencer.last_confirmed(), Some(NodeId::new(0)));

    let topology = report.final_topology.unwrap();
    assert_eq!(topology.cluster_size, 3);
    assert_eq!(topology.replication_factor, 3);
    assert_eq!(
        topology.members,
        (0..3)
            .map(|id| MemberInfo::new(NodeId::new(id), "B"))
            .collect::<Vec<_>>()
    );

    registry.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_processes_both_instances_in_order() {
    let root = tempfile::tempdir().unwrap();
    let (runner, runtime) = simulated_runner(
        harness(root.path()).with_versions("A", "B"),
        SimConfig::default(),
    )
    .unwrap();

    let report = runner.run(&rolling(Traversal::ReverseSweep)).await;

    assert!(report.outcome.is_passed(), "{report}");
    assert_eq!(report.instances.len(), 2);
    assert!(report.instances[0] < report.instances[1]);
    assert_eq!(report.upgrades.len(), 3);
    assert!(report.upgrades.iter().all(|u| u.to == Version::from("B")));
    assert_eq!(runtime.cluster().completed_instances(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_probes_each_absence() {
    let root = tempfile::tempdir().unwrap();
    let (runner, runtime) = simulated_runner(harness(root.path()), SimConfig::default()).unwrap();

    let report = runner
        .run(&Scenario::RollingUpgrade {
            traversal: Traversal::AscendingSweep,
            probe_during_absence: true,
        })
        .await;

    assert!(report.outcome.is_passed(), "{report}");
    // Before, one per absent node, after.
    assert_eq!(report.instances.len(), 5);
    assert_eq!(runtime.cluster().completed_instances(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reaches_upgraded_node() {
    let root = tempfile::tempdir().unwrap();
    let (runner, runtime) =
        simulated_runner(harness(root.path()).with_write_pressure(20), SimConfig::default())
            .unwrap();

    let report = runner
        .run(&Scenario::SnapshotAcrossVersions {
            node: NodeId::new(1),
        })
        .await;

    assert!(report.outcome.is_passed(), "{report}");
    assert_eq!(report.instances.len(), 21);
    assert!(runtime.cluster().snapshot_position().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_restart_survives_slow_shutdown() {
    let root = tempfile::tempdir().unwrap();
    let sim = SimConfig::default().with_shutdown_delay(Duration::from_secs(30));
    let (runner, _runtime) = simulated_runner(harness(root.path()), sim).unwrap();

    let report = runner
        .run(&Scenario::RestartWithNewVersion {
            node: NodeId::new(0),
        })
        .await;

    assert!(report.outcome.is_passed(), "{report}");
    assert_eq!(report.upgrades[0].stop, StopOutcome::Forced);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_tolerates_transient_query_failures() {
    let root = tempfile::tempdir().unwrap();
    let sim = SimConfig::default().with_seed(7).with_query_failure_rate(0.3);
    let (runner, _runtime) = simulated_runner(harness(root.path()), sim).unwrap();

    let report = runner.run(&rolling(Traversal::ReverseSweep)).await;

    assert!(report.outcome.is_passed(), "{report}");
}

// ----------------------------------------------------------------------------
// Skipped and failing scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_incompatible_version_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    let (runner, runtime) = simulated_runner(
        harness(root.path()).with_versions("0.24.0", "0.25.0"),
        SimConfig::default(),
    )
    .unwrap();

    for report in runner.run_all(&Scenario::all()).await {
        match &report.outcome {
            ScenarioOutcome::Skipped(reason) => {
                assert_eq!(reason.to, Version::from("0.25.0"));
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }
    assert_eq!(runtime.provisions(), 0);
    assert_eq!(runtime.cluster().lifecycle_ops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_removal_timeout_names_node() {
    let root = tempfile::tempdir().unwrap();
    let sim = SimConfig::default().with_failure_detection(Duration::from_secs(60));
    let (runner, _runtime) = simulated_runner(harness(root.path()), sim).unwrap();

    let report = runner.run(&rolling(Traversal::ReverseSweep)).await;

    let ScenarioOutcome::Failed(error) = &report.outcome else {
        panic!("expected failure, got {report}");
    };
    assert!(matches!(error, ScenarioError::Convergence(_)), "{error}");
    assert_eq!(error.node(), Some(NodeId::new(2)));
    assert_eq!(
        report.transitions.last().map(|t| t.state),
        Some(UpgradeState::Failed)
    );
    assert!(report.to_string().starts_with("FAIL rolling-upgrade at node-2"));
}

#[tokio::test(start_paused = true)]
async fn test_readmission_timeout_names_node() {
    let root = tempfile::tempdir().unwrap();
    let sim = SimConfig::default().refusing_join("0.24.1");
    let (runner, runtime) = simulated_runner(harness(root.path()), sim).unwrap();

    let report = runner
        .run(&Scenario::RestartWithNewVersion {
            node: NodeId::new(0),
        })
        .await;

    let ScenarioOutcome::Failed(error) = &report.outcome else {
        panic!("expected failure, got {report}");
    };
    assert_eq!(error.node(), Some(NodeId::new(0)));
    assert!(report
        .transitions
        .iter()
        .any(|t| t.state == UpgradeState::AwaitingReadmission(NodeId::new(0))));
    // Torn down even though the scenario failed: 4 starts, 1 graceful stop,
    // 3 teardown stops.
    assert_eq!(runtime.cluster().lifecycle_ops(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_missing_worker_fails_journal_check() {
    let root = tempfile::tempdir().unwrap();
    let config = harness(root.path());
    let cluster = SimCluster::start(SimConfig::from_cluster(&config.cluster)).unwrap();
    let runtime = SimRuntime::new(Arc::clone(&cluster));
    let mut registry = ClusterRegistry::new(
        config.cluster.clone(),
        &config.old_version,
        Arc::new(runtime),
        root.path(),
    )
    .unwrap();
    registry.start_all().await.unwrap();

    let sequencer = UpgradeSequencer::new(
        &mut registry,
        Arc::new(SimConnector::new(Arc::clone(&cluster))),
        config.timing.clone(),
        config.new_version.clone(),
    );
    sequencer.await_complete(&config.old_version).await.unwrap();

    let driver = WorkDriver::new(sequencer.client(None).unwrap(), config.timing);
    let definition = ProcessDefinition::two_step();
    driver.deploy(&definition).await.unwrap();
    let instance = driver.create_instance(&definition.process_id).await.unwrap();

    // Only the first job type gets a worker: the second job never runs.
    let journal = JobJournal::new();
    let worker = driver.run_worker(JobType::from("firstTask"), Arc::new(journal.recorder()));
    let expected = expected_entries(&[instance], &definition.job_types);
    let result = driver.await_journal(&journal, &expected).await;
    worker.shutdown().await;

    let Err(ScenarioError::JournalMismatch { violations, .. }) = result else {
        panic!("expected journal mismatch, got {result:?}");
    };
    assert_eq!(violations.len(), 1);
    assert!(violations[0].to_string().contains("secondTask"), "{}", violations[0]);
    assert_eq!(journal.snapshot().get(&instance).map(Vec::len), Some(1));

    registry.teardown().await;
}
