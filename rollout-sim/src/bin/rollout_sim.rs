//! Runs upgrade scenarios against the simulated cluster.
//!
//! ```bash
//! # All three scenarios with default budgets
//! rollout-sim
//!
//! # Rolling upgrade only, short budgets, flaky queries
//! rollout-sim --scenario rolling-upgrade --fast --query-failure-rate 0.2 --seed 7
//! ```
//!
//! Exits with status 1 if any scenario failed. Skipped scenarios do not
//! count as failures.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rollout_core::NodeId;
use rollout_harness::{HarnessConfig, Scenario, TimingConfig, Traversal};
use rollout_sim::{simulated_runner, SimConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Scenario selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ScenarioChoice {
    /// Every scenario in turn.
    #[default]
    All,
    /// Restart one node on the new version.
    RestartWithNewVersion,
    /// Snapshot taken on the old version reaches the upgraded node.
    SnapshotAcrossVersions,
    /// Upgrade every node while work is processed.
    RollingUpgrade,
}

/// Upgrade order of the rolling upgrade.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Order {
    /// Highest node id first.
    #[default]
    Reverse,
    /// Lowest node id first.
    Ascending,
}

/// Rolling-upgrade scenarios against a simulated cluster.
#[derive(Parser, Debug)]
#[command(name = "rollout-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario to run.
    #[arg(long, value_enum, default_value = "all")]
    scenario: ScenarioChoice,

    /// Version every node starts on.
    #[arg(long, default_value = "0.24.0")]
    old_version: String,

    /// Version nodes are upgraded to.
    #[arg(long, default_value = "0.24.1")]
    new_version: String,

    /// Number of nodes.
    #[arg(long, default_value = "3")]
    size: u32,

    /// Node restarted by the single-node scenarios.
    #[arg(long)]
    node: Option<u32>,

    /// Upgrade order of the rolling upgrade.
    #[arg(long, value_enum, default_value = "reverse")]
    order: Order,

    /// Create one instance while each node is away during the rolling upgrade.
    #[arg(long)]
    probe_during_absence: bool,

    /// Instances created while a node is away in the snapshot scenario.
    #[arg(long, default_value = "100")]
    write_pressure: u32,

    /// Use short polling budgets and a one-second snapshot period.
    #[arg(long)]
    fast: bool,

    /// Probability that a topology or activation request fails.
    #[arg(long, default_value = "0.0")]
    query_failure_rate: f64,

    /// Seed of the fault injection RNG.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Directory for node data (defaults to `$ROLLOUT_SHARED_DATA` or the
    /// system temp directory).
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn harness_config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::from_env()
            .with_versions(self.old_version.as_str(), self.new_version.as_str())
            .with_write_pressure(self.write_pressure);
        config.cluster = config.cluster.with_size(self.size);
        if self.fast {
            config.cluster = config.cluster.with_snapshot_period(Duration::from_secs(1));
            config = config.with_timing(TimingConfig::fast_for_testing());
        }
        if let Some(root) = &self.data_root {
            config = config.with_shared_data_root(root);
        }
        config
    }

    fn scenarios(&self) -> Vec<Scenario> {
        let traversal = match self.order {
            Order::Reverse => Traversal::ReverseSweep,
            Order::Ascending => Traversal::AscendingSweep,
        };
        let rolling = Scenario::RollingUpgrade {
            traversal,
            probe_during_absence: self.probe_during_absence,
        };
        let node = |default: u32| NodeId::new(self.node.unwrap_or(default));

        match self.scenario {
            ScenarioChoice::All => vec![
                Scenario::RestartWithNewVersion { node: node(0) },
                Scenario::SnapshotAcrossVersions { node: node(1) },
                rolling,
            ],
            ScenarioChoice::RestartWithNewVersion => {
                vec![Scenario::RestartWithNewVersion { node: node(0) }]
            }
            ScenarioChoice::SnapshotAcrossVersions => {
                vec![Scenario::SnapshotAcrossVersions { node: node(1) }]
            }
            ScenarioChoice::RollingUpgrade => vec![rolling],
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.harness_config();
    config.validate()?;
    let sim = SimConfig::from_cluster(&config.cluster)
        .with_seed(args.seed)
        .with_query_failure_rate(args.query_failure_rate);

    info!(
        from = %config.old_version,
        to = %config.new_version,
        size = config.cluster.size,
        seed = args.seed,
        fast = args.fast,
        "starting simulated rollout"
    );

    let (runner, _runtime) = simulated_runner(config, sim)?;
    let reports = runner.run_all(&args.scenarios()).await;

    let mut failed = 0;
    for report in &reports {
        println!("{report}");
        if report.outcome.is_failed() {
            failed += 1;
        }
    }

    if failed > 0 {
        eprintln!("{failed} of {} scenarios failed", reports.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
