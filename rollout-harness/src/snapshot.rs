//! Snapshot evidence on disk.
//!
//! A node has produced (or received) a snapshot when its snapshot directory
//! exists and is non-empty. The contents are never interpreted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rollout_core::NodeId;
use tracing::{debug, info};

use crate::error::{NodeError, ScenarioError};
use crate::poll::{poll_until, Attempt, PollPolicy};
use crate::registry::ClusterRegistry;

/// Inspects node data directories for snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotVerifier {
    subpath: PathBuf,
}

impl SnapshotVerifier {
    /// Creates a verifier looking under `subpath` of each data directory.
    #[must_use]
    pub fn new(subpath: impl Into<PathBuf>) -> Self {
        Self {
            subpath: subpath.into(),
        }
    }

    /// Snapshot directory inside `data_path`.
    #[must_use]
    pub fn snapshot_dir(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.subpath)
    }

    /// Returns true if `data_path` holds at least one snapshot entry.
    ///
    /// A missing directory means no snapshot yet.
    ///
    /// # Errors
    /// Returns [`NodeError::Io`] for filesystem errors other than not-found.
    pub fn has_snapshot_at(&self, data_path: &Path) -> Result<bool, NodeError> {
        let dir = self.snapshot_dir(data_path);
        match std::fs::read_dir(&dir) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(NodeError::Io {
                operation: "read snapshot directory",
                source,
            }),
        }
    }

    /// Returns true if `node` holds at least one snapshot entry.
    ///
    /// # Errors
    /// Returns an error for unknown nodes or unreadable directories.
    pub fn has_snapshot(&self, registry: &ClusterRegistry, node: NodeId) -> Result<bool, NodeError> {
        let data_path = registry.get(node)?.member().data_path();
        let found = self.has_snapshot_at(data_path)?;
        debug!(%node, found, "snapshot check");
        Ok(found)
    }

    /// Polls until `node` holds a snapshot.
    ///
    /// Read errors count as "not yet".
    ///
    /// # Errors
    /// Returns [`ScenarioError::MissingSnapshot`] when `policy` expires, or
    /// [`NodeError::UnknownNode`] for a node outside the cluster.
    pub async fn await_snapshot(
        &self,
        registry: &ClusterRegistry,
        node: NodeId,
        policy: PollPolicy,
    ) -> Result<(), ScenarioError> {
        let data_path = registry.get(node)?.member().data_path().to_path_buf();
        let what = format!("snapshot on {node}");

        poll_until(&what, policy, || async {
            match self.has_snapshot_at(&data_path) {
                Ok(true) => Attempt::Ready(()),
                Ok(false) => Attempt::NotYet("snapshot directory empty".to_string()),
                Err(error) => Attempt::NotYet(error.to_string()),
            }
        })
        .await
        .map_err(|expired| ScenarioError::MissingSnapshot {
            node,
            elapsed: expired.elapsed,
        })?;

        info!(%node, "snapshot present");
        Ok(())
    }
}
