//! Rollout Sim - simulated cluster for the rolling-upgrade harness.
//!
//! This crate implements the harness's collaborator traits against an
//! in-process cluster, so every scenario runs deterministically on a paused
//! tokio clock. It also holds the scenario test-suite and the `rollout-sim`
//! binary.
//!
//! ## Organization
//!
//! **Simulation**:
//! - `cluster`: membership, quorum, work and snapshot behaviour with seeded
//!   fault injection
//! - `runtime`: `NodeRuntime` provisioning simulated nodes
//! - `client`: `ClusterClient` bound to one simulated node
//! - `config`: delays, snapshot thresholds, fault rates
//!
//! **Tests** (`*_tests.rs`):
//! - `scenario_tests`: full scenarios, passing and failing, end to end
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_<scenario>_<behaviour>`
//! - Unit tests: inline in each module under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod runtime;

#[cfg(test)]
mod scenario_tests;

use std::sync::Arc;

use rollout_harness::{ConfigError, HarnessConfig, ScenarioRunner};

pub use client::{SimClient, SimConnector};
pub use cluster::SimCluster;
pub use config::SimConfig;
pub use runtime::SimRuntime;

/// Starts a simulated cluster and a scenario runner wired to it.
///
/// The simulation's size and snapshot layout are taken from
/// `config.cluster`; the remaining knobs come from `sim`.
///
/// # Errors
/// Returns an error if `sim` is invalid.
pub fn simulated_runner(
    config: HarnessConfig,
    sim: SimConfig,
) -> Result<(ScenarioRunner, SimRuntime), ConfigError> {
    let sim = SimConfig {
        size: config.cluster.size,
        replication_factor: config.cluster.shape().replication_factor,
        snapshot_period: config.cluster.snapshot_period,
        snapshot_subpath: config.cluster.snapshot_subpath.clone(),
        ..sim
    };
    let cluster = SimCluster::start(sim)?;
    let runtime = SimRuntime::new(Arc::clone(&cluster));
    let runner = ScenarioRunner::new(
        config,
        Arc::new(runtime.clone()),
        Arc::new(SimConnector::new(cluster)),
    );
    Ok((runner, runtime))
}
