//! Cluster membership views and the convergence predicates evaluated on them.
//!
//! A [`TopologySnapshot`] is one answer to a topology request. It is never
//! cached: every poll produces a fresh snapshot, and a [`Convergence`]
//! predicate is evaluated against it together with the [`ClusterShape`] the
//! harness configured.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{NodeId, Version};

/// One member entry as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Reported node id.
    pub node_id: NodeId,
    /// Version the node reports for itself.
    pub version: Version,
}

impl MemberInfo {
    /// Creates a member entry.
    #[must_use]
    pub fn new(node_id: NodeId, version: impl Into<Version>) -> Self {
        Self {
            node_id,
            version: version.into(),
        }
    }
}

/// Point-in-time read of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Members currently visible to the queried node.
    pub members: Vec<MemberInfo>,
    /// Configured cluster size reported by the cluster.
    pub cluster_size: u32,
    /// Replication factor reported by the cluster.
    pub replication_factor: u32,
}

impl TopologySnapshot {
    /// Number of member entries.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Returns every entry reported for `node`.
    pub fn entries_for(&self, node: NodeId) -> impl Iterator<Item = &MemberInfo> {
        self.members.iter().filter(move |m| m.node_id == node)
    }

    /// Returns true if any entry is reported for `node`.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.entries_for(node).next().is_some()
    }

    /// Returns the version of `node` if it is reported exactly once.
    #[must_use]
    pub fn version_of(&self, node: NodeId) -> Option<&Version> {
        let mut entries = self.entries_for(node);
        let first = entries.next()?;
        if entries.next().is_some() {
            return None;
        }
        Some(&first.version)
    }

    /// Returns true if every member reports `version`.
    #[must_use]
    pub fn all_on(&self, version: &Version) -> bool {
        self.members.iter().all(|m| &m.version == version)
    }

    /// Compares reported versions against `expected`, skipping `except`.
    ///
    /// Nodes missing from the snapshot are not reported; membership is the
    /// job of the convergence predicates.
    #[must_use]
    pub fn version_drift(
        &self,
        expected: &BTreeMap<NodeId, Version>,
        except: NodeId,
    ) -> Vec<VersionDrift> {
        self.members
            .iter()
            .filter(|m| m.node_id != except)
            .filter_map(|m| {
                let want = expected.get(&m.node_id)?;
                (want != &m.version).then(|| VersionDrift {
                    node: m.node_id,
                    expected: want.clone(),
                    observed: m.version.clone(),
                })
            })
            .collect()
    }
}

impl fmt::Display for TopologySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} rf={} members=[",
            self.cluster_size, self.replication_factor
        )?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}@{}", member.node_id.get(), member.version)?;
        }
        f.write_str("]")
    }
}

/// A member whose reported version differs from the one the harness expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDrift {
    /// The drifting node.
    pub node: NodeId,
    /// Version the harness provisioned.
    pub expected: Version,
    /// Version the cluster reported.
    pub observed: Version,
}

/// Configured size and replication factor the cluster must keep reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterShape {
    /// Number of members in a complete cluster.
    pub size: u32,
    /// Replication factor.
    pub replication_factor: u32,
}

impl ClusterShape {
    /// Creates a shape.
    #[must_use]
    pub const fn new(size: u32, replication_factor: u32) -> Self {
        Self {
            size,
            replication_factor,
        }
    }

    fn unchanged_in(&self, snapshot: &TopologySnapshot) -> bool {
        snapshot.cluster_size == self.size && snapshot.replication_factor == self.replication_factor
    }
}

/// Membership predicate polled until it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// The node has left the membership view and the view shrank by one.
    Excludes(NodeId),
    /// The node is back exactly once, on the expected version, and the view
    /// is complete again.
    IncludesUpgraded {
        /// The re-admitted node.
        node: NodeId,
        /// Version it must report.
        version: Version,
    },
}

impl Convergence {
    /// The node this predicate is about.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        match self {
            Self::Excludes(node) | Self::IncludesUpgraded { node, .. } => *node,
        }
    }

    /// Evaluates the predicate against one snapshot.
    ///
    /// Removal and the count shrinking must be seen together; either alone
    /// may be a stale partial view.
    #[must_use]
    pub fn is_satisfied(&self, snapshot: &TopologySnapshot, shape: &ClusterShape) -> bool {
        if !shape.unchanged_in(snapshot) {
            return false;
        }
        let members = snapshot.member_count();
        match self {
            Self::Excludes(node) => {
                !snapshot.contains(*node) && members + 1 == shape.size as usize
            }
            Self::IncludesUpgraded { node, version } => {
                snapshot.version_of(*node) == Some(version) && members == shape.size as usize
            }
        }
    }
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excludes(node) => write!(f, "excludes({node})"),
            Self::IncludesUpgraded { node, version } => {
                write!(f, "includes_upgraded({node}, {version})")
            }
        }
    }
}
