//! Topology observation.
//!
//! The cluster only offers an eventually-consistent view of its own
//! membership. The observer turns that into bounded waits: it re-queries
//! until a [`Convergence`] predicate holds, counting failed queries as "not
//! yet", and fails only when the deadline passes.

use std::sync::Arc;

use rollout_core::{ClusterShape, Convergence, NodeId, TopologySnapshot, Version};
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::error::{ConvergenceTimeout, QueryError};
use crate::poll::{poll_until, Attempt, PollPolicy};

/// Queries one node for the cluster's membership view.
#[derive(Clone)]
pub struct TopologyObserver {
    client: Arc<dyn ClusterClient>,
    shape: ClusterShape,
}

impl std::fmt::Debug for TopologyObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyObserver")
            .field("target", &self.client.target())
            .field("shape", &self.shape)
            .finish()
    }
}

impl TopologyObserver {
    /// Creates an observer querying through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, shape: ClusterShape) -> Self {
        Self { client, shape }
    }

    /// Address of the queried node.
    #[must_use]
    pub fn target(&self) -> &str {
        self.client.target()
    }

    /// Expected cluster shape.
    #[must_use]
    pub const fn shape(&self) -> ClusterShape {
        self.shape
    }

    /// Reads the membership view once.
    ///
    /// # Errors
    /// Returns [`QueryError`] if the node cannot answer. Callers retry.
    pub async fn query(&self) -> Result<TopologySnapshot, QueryError> {
        self.client.topology().await.map_err(|source| QueryError {
            target: self.client.target().to_string(),
            source,
        })
    }

    /// Polls until `predicate` holds and returns the satisfying snapshot.
    ///
    /// # Errors
    /// Returns [`ConvergenceTimeout`] when `policy.timeout` elapses first.
    pub async fn await_convergence(
        &self,
        predicate: &Convergence,
        policy: PollPolicy,
    ) -> Result<TopologySnapshot, ConvergenceTimeout> {
        let what = predicate.to_string();
        debug!(predicate = %what, target = self.target(), ?policy, "awaiting convergence");

        let result = poll_until(&what, policy, || async {
            match self.query().await {
                Ok(snapshot) if predicate.is_satisfied(&snapshot, &self.shape) => {
                    Attempt::Ready(snapshot)
                }
                Ok(snapshot) => Attempt::NotYet(snapshot.to_string()),
                Err(error) => Attempt::NotYet(error.to_string()),
            }
        })
        .await;

        match result {
            Ok(snapshot) => {
                info!(predicate = %what, topology = %snapshot, "converged");
                Ok(snapshot)
            }
            Err(expired) => Err(ConvergenceTimeout {
                predicate: predicate.clone(),
                elapsed: expired.elapsed,
                attempts: expired.attempts,
                last_observation: expired.last_observation,
            }),
        }
    }

    /// Waits until `node` has left the view and the view shrank by one.
    ///
    /// # Errors
    /// Returns [`ConvergenceTimeout`] when the wait exceeds `policy`.
    pub async fn excludes(
        &self,
        node: NodeId,
        policy: PollPolicy,
    ) -> Result<TopologySnapshot, ConvergenceTimeout> {
        self.await_convergence(&Convergence::Excludes(node), policy)
            .await
    }

    /// Waits until `node` is back on `version` and the view is complete.
    ///
    /// # Errors
    /// Returns [`ConvergenceTimeout`] when the wait exceeds `policy`.
    pub async fn includes_upgraded(
        &self,
        node: NodeId,
        version: &Version,
        policy: PollPolicy,
    ) -> Result<TopologySnapshot, ConvergenceTimeout> {
        let predicate = Convergence::IncludesUpgraded {
            node,
            version: version.clone(),
        };
        self.await_convergence(&predicate, policy).await
    }
}
