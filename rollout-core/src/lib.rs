//! Rollout Core - Strongly-typed identifiers and topology predicates.
//!
//! This crate holds the vocabulary shared by the harness and the simulated
//! cluster. It knows nothing about processes, clients or time.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `NodeId` cannot be mixed up with an `InstanceKey`
//! - **Fresh views**: topology snapshots are values, evaluated once and dropped
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod topology;
mod types;

pub use topology::{ClusterShape, Convergence, MemberInfo, TopologySnapshot, VersionDrift};
pub use types::{InstanceKey, JobKey, JobType, NodeId, Version};
