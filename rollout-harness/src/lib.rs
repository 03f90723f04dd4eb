//! Rollout Harness: rolling-upgrade orchestration and verification
//!
//! Drives a fixed-size replicated cluster through a one-node-at-a-time
//! version upgrade while it keeps serving work, and checks three things
//! across the transition:
//!
//! 1. **Membership** - the self-reported topology drops each stopped node and
//!    readmits it on the new version, with size and replication factor intact
//! 2. **Persistence** - snapshots taken on the old version reach nodes that
//!    rejoin on the new one
//! 3. **Work** - every process instance runs its jobs exactly once, in order
//!
//! # Architecture
//!
//! The cluster itself is a collaborator: nodes are provisioned through a
//! [`NodeRuntime`] and requests go through a [`ClusterClient`]. The same
//! scenarios run against local server processes ([`ProcessRuntime`]) or an
//! in-process simulation.
//!
//! # Example
//!
//! ```ignore
//! use rollout_harness::{HarnessConfig, Scenario, ScenarioRunner};
//!
//! let config = HarnessConfig::from_env().with_versions("0.24.0", "0.24.1");
//! let runner = ScenarioRunner::new(config, runtime, connector);
//!
//! for report in runner.run_all(&Scenario::all()).await {
//!     println!("{report}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod compat;
mod error;
mod journal;
mod poll;
mod snapshot;
mod topology;
mod work;

pub mod client;
pub mod config;
pub mod node;
pub mod process;
pub mod registry;
pub mod scenario;
pub mod sequencer;

#[cfg(test)]
mod testing;

pub use client::{
    ActivatedJob, ClientConnector, ClusterClient, DefinitionVersion, DeploymentAck,
    ProcessDefinition, Variables, FIRST_TASK, SECOND_TASK,
};
pub use compat::{CompatibilityPolicy, DEFAULT_INCOMPATIBLE_PREFIXES};
pub use config::{format_duration, ClusterConfig, HarnessConfig, TimingConfig, SHARED_DATA_ENV};
pub use error::{
    ClientError, ConfigError, ConvergenceTimeout, IncompatibleVersion, NodeError, QueryError,
    ScenarioError, WorkError,
};
pub use journal::{expected_entries, JobJournal, JournalEntries, JournalVerification, Violation};
pub use node::{LaunchSpec, MemberNode, NodeHandle, NodeInstance, NodePort, NodeRuntime, StopOutcome};
pub use poll::{poll_until, Attempt, PollExpired, PollPolicy};
pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use registry::ClusterRegistry;
pub use scenario::{Scenario, ScenarioOutcome, ScenarioReport, ScenarioRunner};
pub use sequencer::{
    NodeRemoval, NodeUpgrade, Transition, Traversal, UpgradeReport, UpgradeSequencer, UpgradeState,
};
pub use snapshot::SnapshotVerifier;
pub use topology::TopologyObserver;
pub use work::{default_variables, JobHandler, WorkDriver, WorkerHandle, WorkerStats};
