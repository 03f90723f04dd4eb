//! Harness error types.
//!
//! Errors are split by who raises them. Transient errors ([`QueryError`],
//! [`ClientError`]) are swallowed by polling loops; everything reaching a
//! [`ScenarioError`] is fatal to the running scenario.

use std::time::Duration;

use rollout_core::{Convergence, NodeId, Version};
use thiserror::Error;

use crate::journal::Violation;
use crate::sequencer::UpgradeState;

/// Errors raised by node lifecycle control.
#[derive(Debug, Error)]
pub enum NodeError {
    /// `start` was called on a node that is already running.
    #[error("{node} is already running")]
    AlreadyRunning {
        /// The node.
        node: NodeId,
    },

    /// The operation needs a running node.
    #[error("{node} is not running")]
    NotRunning {
        /// The node.
        node: NodeId,
    },

    /// `replace` was called on a node that has not been shut down.
    #[error("{node} must be stopped before it is replaced")]
    StillRunning {
        /// The node.
        node: NodeId,
    },

    /// The node id is outside the cluster.
    #[error("{node} does not exist in a cluster of {size}")]
    UnknownNode {
        /// The requested node.
        node: NodeId,
        /// Cluster size.
        size: u32,
    },

    /// The runtime has no image or binary for the version.
    #[error("no runtime artifact configured for version {version}")]
    UnknownVersion {
        /// The requested version.
        version: Version,
    },

    /// The runtime failed to start the node.
    #[error("failed to start {node}: {message}")]
    StartFailed {
        /// The node.
        node: NodeId,
        /// Runtime error message.
        message: String,
    },

    /// The runtime failed to stop the node.
    #[error("failed to stop {node}: {message}")]
    StopFailed {
        /// The node.
        node: NodeId,
        /// Runtime error message.
        message: String,
    },

    /// Filesystem error while provisioning node data.
    #[error("I/O error: {operation}: {source}")]
    Io {
        /// What was being done.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the cluster client collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The contacted node cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The cluster answered but refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A topology read failed. Always transient from the harness's view.
#[derive(Debug, Clone, Error)]
#[error("topology query via {target} failed: {source}")]
pub struct QueryError {
    /// Address of the queried node.
    pub target: String,
    /// Client error.
    #[source]
    pub source: ClientError,
}

/// A convergence predicate did not hold before its deadline.
#[derive(Debug, Clone, Error)]
#[error(
    "{predicate} did not converge within {elapsed:?} ({attempts} attempts, last: {last_observation})"
)]
pub struct ConvergenceTimeout {
    /// The predicate that was polled.
    pub predicate: Convergence,
    /// Time spent polling.
    pub elapsed: Duration,
    /// Number of queries issued.
    pub attempts: u32,
    /// Last snapshot or query error seen.
    pub last_observation: String,
}

impl ConvergenceTimeout {
    /// The node the failed predicate was about.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.predicate.node()
    }
}

/// Errors raised while driving work through the cluster.
#[derive(Debug, Error)]
pub enum WorkError {
    /// Deployment was refused.
    #[error("deployment of {resource} failed: {source}")]
    Deploy {
        /// Resource name.
        resource: String,
        /// Client error.
        #[source]
        source: ClientError,
    },

    /// Deployment was not acknowledged in time.
    #[error("deployment of {resource} not acknowledged within {timeout:?}")]
    DeployTimeout {
        /// Resource name.
        resource: String,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// Instance creation kept failing until its deadline.
    #[error(
        "instance creation for {process_id} failed for {elapsed:?} ({attempts} attempts, last: {last_error})"
    )]
    InstanceCreation {
        /// Process id.
        process_id: String,
        /// Time spent retrying.
        elapsed: Duration,
        /// Number of attempts.
        attempts: u32,
        /// Last error.
        last_error: String,
    },
}

/// The new version cannot be rolled onto the running one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{to} is not rolling-upgrade compatible with {from}: {reason}")]
pub struct IncompatibleVersion {
    /// Running version.
    pub from: Version,
    /// Target version.
    pub to: Version,
    /// Why the pair is rejected.
    pub reason: String,
}

/// Invalid harness configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid cluster configuration.
    #[error("invalid cluster config: {message}")]
    InvalidCluster {
        /// Error description.
        message: String,
    },
    /// Invalid timing configuration.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// Error description.
        message: String,
    },
}

/// Fatal scenario errors.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Node lifecycle failure.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Membership did not converge.
    #[error(transparent)]
    Convergence(#[from] ConvergenceTimeout),

    /// Work could not be driven.
    #[error(transparent)]
    Work(#[from] WorkError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No running node is left to query.
    #[error("no running node available{}", besides(.excluding))]
    NoAvailableNode {
        /// The node that was excluded, if any.
        excluding: Option<NodeId>,
    },

    /// The sequencer was asked for a step its current state does not allow.
    #[error("illegal sequencer transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the sequencer was in.
        from: UpgradeState,
        /// State the call would have entered.
        to: UpgradeState,
    },

    /// An upgrade order lists the same node twice.
    #[error("{node} appears more than once in the upgrade order")]
    RepeatedNode {
        /// The repeated node.
        node: NodeId,
    },

    /// A node other than the upgraded one changed version.
    #[error("{node} reports {observed} but was provisioned with {expected} (after upgrading {upgraded})")]
    VersionDrift {
        /// The upgraded node.
        upgraded: NodeId,
        /// The drifting node.
        node: NodeId,
        /// Provisioned version.
        expected: Version,
        /// Reported version.
        observed: Version,
    },

    /// Final topology after a sweep is not the expected one.
    #[error("unexpected final topology: {observed}")]
    UnexpectedTopology {
        /// Rendered snapshot.
        observed: String,
    },

    /// No snapshot appeared in time.
    #[error("{node} has no snapshot after {elapsed:?}")]
    MissingSnapshot {
        /// The node.
        node: NodeId,
        /// Time waited.
        elapsed: Duration,
    },

    /// The job journal did not match the expected per-instance order in time.
    #[error("job journal mismatch after {elapsed:?}: {}", format_violations(.violations))]
    JournalMismatch {
        /// Time waited.
        elapsed: Duration,
        /// Violations at the deadline.
        violations: Vec<Violation>,
    },
}

impl ScenarioError {
    /// The node at which the scenario failed, when there is one.
    #[must_use]
    pub const fn node(&self) -> Option<NodeId> {
        match self {
            Self::Convergence(timeout) => Some(timeout.node()),
            Self::VersionDrift { node, .. }
            | Self::MissingSnapshot { node, .. }
            | Self::RepeatedNode { node } => Some(*node),
            Self::NoAvailableNode { excluding } => *excluding,
            Self::IllegalTransition { to, .. } => to.node(),
            Self::Node(
                NodeError::AlreadyRunning { node }
                | NodeError::NotRunning { node }
                | NodeError::StillRunning { node }
                | NodeError::UnknownNode { node, .. }
                | NodeError::StartFailed { node, .. }
                | NodeError::StopFailed { node, .. },
            ) => Some(*node),
            _ => None,
        }
    }
}

fn besides(excluding: &Option<NodeId>) -> String {
    excluding.map_or_else(String::new, |node| format!(" besides {node}"))
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
