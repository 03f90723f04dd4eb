//! Job journal and exactly-once/ordering verification.
//!
//! Workers append every job to a shared [`JobJournal`] once the cluster has
//! acknowledged its completion. Once the work has drained, the journal is compared with
//! the expected map: every created instance must show the definition's job
//! types exactly once each and in definition order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use rollout_core::{InstanceKey, JobType};

use crate::client::ActivatedJob;

/// Per-instance ordered job types.
pub type JournalEntries = BTreeMap<InstanceKey, Vec<JobType>>;

/// Concurrency-safe, append-only log of activated jobs keyed by instance.
///
/// Clones share the same log; hand one to each worker.
#[derive(Debug, Clone, Default)]
pub struct JobJournal {
    entries: Arc<Mutex<JournalEntries>>,
}

impl JobJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `job_type` to the sequence of `instance`.
    pub fn record(&self, instance: InstanceKey, job_type: JobType) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance)
            .or_default()
            .push(job_type);
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> JournalEntries {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded jobs across all instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A job handler that records every job it sees in this journal.
    #[must_use]
    pub fn recorder(&self) -> impl Fn(&ActivatedJob) + Send + Sync + 'static {
        let journal = self.clone();
        move |job: &ActivatedJob| journal.record(job.instance_key, job.job_type.clone())
    }
}

/// Builds the expected journal: every instance runs `job_types` in order.
#[must_use]
pub fn expected_entries(instances: &[InstanceKey], job_types: &[JobType]) -> JournalEntries {
    instances
        .iter()
        .map(|instance| (*instance, job_types.to_vec()))
        .collect()
}

/// A deviation of the observed journal from the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A created instance never had any job processed.
    MissingInstance {
        /// The instance.
        instance: InstanceKey,
    },

    /// Jobs were processed for an instance the harness never created.
    UnexpectedInstance {
        /// The instance.
        instance: InstanceKey,
        /// What was recorded for it.
        observed: Vec<JobType>,
    },

    /// Some job types of the definition were never processed.
    Incomplete {
        /// The instance.
        instance: InstanceKey,
        /// Job types not seen.
        missing: Vec<JobType>,
    },

    /// A job type outside the definition was processed.
    UnexpectedJobType {
        /// The instance.
        instance: InstanceKey,
        /// The undefined job type.
        job_type: JobType,
    },

    /// Job types were processed in a different order than defined.
    OutOfOrder {
        /// The instance.
        instance: InstanceKey,
        /// Definition order.
        expected: Vec<JobType>,
        /// Observed order.
        observed: Vec<JobType>,
    },

    /// A job type was processed more than once.
    Duplicate {
        /// The instance.
        instance: InstanceKey,
        /// The repeated job type.
        job_type: JobType,
        /// How many times it was seen.
        count: usize,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInstance { instance } => {
                write!(f, "Missing instance: {instance} had no jobs processed")
            }
            Self::UnexpectedInstance { instance, observed } => {
                write!(
                    f,
                    "Unexpected instance: {instance} was never created but processed {}",
                    render(observed)
                )
            }
            Self::Incomplete { instance, missing } => {
                write!(f, "Incomplete: {instance} never processed {}", render(missing))
            }
            Self::UnexpectedJobType { instance, job_type } => {
                write!(f, "Unexpected job type: {instance} processed undefined {job_type}")
            }
            Self::OutOfOrder {
                instance,
                expected,
                observed,
            } => {
                write!(
                    f,
                    "Out of order: {instance} processed {}, expected {}",
                    render(observed),
                    render(expected)
                )
            }
            Self::Duplicate {
                instance,
                job_type,
                count,
            } => {
                write!(f, "Duplicate: {instance} processed {job_type} {count} times")
            }
        }
    }
}

fn render(job_types: &[JobType]) -> String {
    let names: Vec<&str> = job_types.iter().map(JobType::as_str).collect();
    format!("[{}]", names.join(", "))
}

/// Compares an observed journal with the expected one.
pub struct JournalVerification;

impl JournalVerification {
    /// Returns every violation; empty means the journal matches exactly.
    #[must_use]
    pub fn verify(observed: &JournalEntries, expected: &JournalEntries) -> Vec<Violation> {
        let mut violations = Vec::new();

        for (instance, expected_jobs) in expected {
            match observed.get(instance) {
                None => violations.push(Violation::MissingInstance {
                    instance: *instance,
                }),
                Some(observed_jobs) => {
                    violations.extend(Self::check_instance(*instance, expected_jobs, observed_jobs));
                }
            }
        }

        for (instance, observed_jobs) in observed {
            if !expected.contains_key(instance) {
                violations.push(Violation::UnexpectedInstance {
                    instance: *instance,
                    observed: observed_jobs.clone(),
                });
            }
        }

        violations
    }

    /// Checks one instance's sequence against the definition order.
    #[must_use]
    pub fn check_instance(
        instance: InstanceKey,
        expected: &[JobType],
        observed: &[JobType],
    ) -> Vec<Violation> {
        if observed == expected {
            return Vec::new();
        }

        let mut counts: BTreeMap<&JobType, usize> = BTreeMap::new();
        for job_type in observed {
            *counts.entry(job_type).or_default() += 1;
        }

        let mut violations: Vec<Violation> = counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(job_type, count)| Violation::Duplicate {
                instance,
                job_type: (*job_type).clone(),
                count: *count,
            })
            .collect();

        let missing: Vec<JobType> = expected
            .iter()
            .filter(|job_type| !counts.contains_key(job_type))
            .cloned()
            .collect();
        if !missing.is_empty() {
            violations.push(Violation::Incomplete { instance, missing });
        }

        violations.extend(
            counts
                .keys()
                .filter(|job_type| !expected.contains(job_type))
                .map(|job_type| Violation::UnexpectedJobType {
                    instance,
                    job_type: (*job_type).clone(),
                }),
        );

        // Order of first occurrences of defined types must follow the definition.
        let mut first_seen: Vec<&JobType> = Vec::new();
        for job_type in observed.iter().filter(|job_type| expected.contains(job_type)) {
            if !first_seen.contains(&job_type) {
                first_seen.push(job_type);
            }
        }
        let defined: Vec<&JobType> = expected
            .iter()
            .filter(|job_type| first_seen.contains(job_type))
            .collect();
        if first_seen != defined {
            violations.push(Violation::OutOfOrder {
                instance,
                expected: expected.to_vec(),
                observed: observed.to_vec(),
            });
        }

        violations
    }
}
