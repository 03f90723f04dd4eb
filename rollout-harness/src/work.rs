//! Work driver: deployments, instance creation and job workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rollout_core::{InstanceKey, JobType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{
    ActivatedJob, ClusterClient, DefinitionVersion, DeploymentAck, ProcessDefinition, Variables,
};
use crate::config::TimingConfig;
use crate::error::{ScenarioError, WorkError};
use crate::journal::{JobJournal, JournalEntries, JournalVerification};
use crate::poll::{poll_until, Attempt};

/// Handler invoked once per job the cluster acknowledged as completed.
///
/// A job whose completion fails is not handed to the handler; the cluster
/// redelivers it and the handler sees it once it is acknowledged.
pub type JobHandler = Arc<dyn Fn(&ActivatedJob) + Send + Sync>;

/// Variables every verification instance is created with.
#[must_use]
pub fn default_variables() -> Variables {
    Variables::from([("foo".to_string(), "bar".to_string())])
}

/// Submits work through one client.
#[derive(Clone)]
pub struct WorkDriver {
    client: Arc<dyn ClusterClient>,
    timing: TimingConfig,
    variables: Variables,
}

impl std::fmt::Debug for WorkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDriver")
            .field("target", &self.client.target())
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl WorkDriver {
    /// Creates a driver sending through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, timing: TimingConfig) -> Self {
        Self {
            client,
            timing,
            variables: default_variables(),
        }
    }

    /// Replaces the instance variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Address of the node receiving the work.
    #[must_use]
    pub fn target(&self) -> &str {
        self.client.target()
    }

    /// Deploys `definition`, waiting at most the configured deploy timeout.
    ///
    /// # Errors
    /// Returns [`WorkError::DeployTimeout`] if the cluster does not answer in
    /// time, or [`WorkError::Deploy`] if it refuses.
    pub async fn deploy(&self, definition: &ProcessDefinition) -> Result<DeploymentAck, WorkError> {
        let timeout = self.timing.deploy_timeout;
        let ack = tokio::time::timeout(timeout, self.client.deploy(definition))
            .await
            .map_err(|_| WorkError::DeployTimeout {
                resource: definition.resource_name.clone(),
                timeout,
            })?
            .map_err(|source| WorkError::Deploy {
                resource: definition.resource_name.clone(),
                source,
            })?;

        info!(
            resource = %definition.resource_name,
            process_id = %ack.process_id,
            version = ack.version,
            "process deployed"
        );
        Ok(ack)
    }

    /// Creates an instance of the latest version of `process_id`.
    ///
    /// Retried at the configured interval: right after a deployment or a
    /// membership change the process may not be known to the partition
    /// leader yet.
    ///
    /// # Errors
    /// Returns [`WorkError::InstanceCreation`] when every attempt failed.
    pub async fn create_instance(&self, process_id: &str) -> Result<InstanceKey, WorkError> {
        let policy = self.timing.instance_creation;
        let what = format!("create instance of {process_id}");

        let key = poll_until(&what, policy, || async {
            match self
                .client
                .create_instance(process_id, DefinitionVersion::Latest, &self.variables)
                .await
            {
                Ok(key) => Attempt::Ready(key),
                Err(error) => Attempt::NotYet(error.to_string()),
            }
        })
        .await
        .map_err(|expired| WorkError::InstanceCreation {
            process_id: process_id.to_string(),
            elapsed: expired.elapsed,
            attempts: expired.attempts,
            last_error: expired.last_observation,
        })?;

        debug!(process_id, instance = %key, target = self.target(), "instance created");
        Ok(key)
    }

    /// Creates `count` instances one after the other.
    ///
    /// # Errors
    /// Stops at the first instance that cannot be created.
    pub async fn create_instances(
        &self,
        process_id: &str,
        count: u32,
    ) -> Result<Vec<InstanceKey>, WorkError> {
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push(self.create_instance(process_id).await?);
        }
        info!(process_id, count, "instances created");
        Ok(keys)
    }

    /// Starts a worker for `job_type` calling `on_job` for every completed job.
    #[must_use]
    pub fn run_worker(&self, job_type: JobType, on_job: JobHandler) -> WorkerHandle {
        WorkerHandle::spawn(
            Arc::clone(&self.client),
            job_type,
            on_job,
            self.timing.worker_poll_interval,
            self.timing.worker_max_jobs,
        )
    }

    /// Starts one journaling worker per job type of `definition`.
    #[must_use]
    pub fn run_workers(&self, definition: &ProcessDefinition, journal: &JobJournal) -> Vec<WorkerHandle> {
        definition
            .job_types
            .iter()
            .map(|job_type| self.run_worker(job_type.clone(), Arc::new(journal.recorder())))
            .collect()
    }

    /// Waits until `journal` matches `expected` exactly.
    ///
    /// # Errors
    /// Returns [`ScenarioError::JournalMismatch`] with the violations seen at
    /// the deadline.
    pub async fn await_journal(
        &self,
        journal: &JobJournal,
        expected: &JournalEntries,
    ) -> Result<(), ScenarioError> {
        let policy = self.timing.job_completion;
        let outcome = poll_until("job journal", policy, || async {
            let violations = JournalVerification::verify(&journal.snapshot(), expected);
            if violations.is_empty() {
                Attempt::Ready(())
            } else {
                Attempt::NotYet(format!("{} violations", violations.len()))
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                info!(instances = expected.len(), "job journal verified");
                Ok(())
            }
            Err(expired) => Err(ScenarioError::JournalMismatch {
                elapsed: expired.elapsed,
                violations: JournalVerification::verify(&journal.snapshot(), expected),
            }),
        }
    }
}

/// Counters of one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    activated: AtomicU64,
    completed: AtomicU64,
    failed_completions: AtomicU64,
}

impl WorkerStats {
    /// Jobs handed to the handler.
    #[must_use]
    pub fn activated(&self) -> u64 {
        self.activated.load(Ordering::Relaxed)
    }

    /// Jobs acknowledged as completed.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Completions the cluster did not acknowledge.
    #[must_use]
    pub fn failed_completions(&self) -> u64 {
        self.failed_completions.load(Ordering::Relaxed)
    }
}

/// A running worker. Dropping the handle stops the worker.
pub struct WorkerHandle {
    job_type: JobType,
    shutdown_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("job_type", &self.job_type)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    fn spawn(
        client: Arc<dyn ClusterClient>,
        job_type: JobType,
        on_job: JobHandler,
        poll_interval: Duration,
        max_jobs: u32,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let stats = Arc::new(WorkerStats::default());
        let task = tokio::spawn(worker_loop(
            client,
            job_type.clone(),
            on_job,
            poll_interval,
            max_jobs,
            Arc::clone(&stats),
            shutdown_rx,
        ));
        info!(%job_type, "worker started");

        Self {
            job_type,
            shutdown_tx,
            task: Some(task),
            stats,
        }
    }

    /// Job type served.
    #[must_use]
    pub const fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stops the worker and waits for its task to end.
    pub async fn shutdown(mut self) -> Arc<WorkerStats> {
        let _ = self.shutdown_tx.try_send(());
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(job_type = %self.job_type, %error, "worker task ended abnormally");
            }
        }
        Arc::clone(&self.stats)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

async fn worker_loop(
    client: Arc<dyn ClusterClient>,
    job_type: JobType,
    on_job: JobHandler,
    poll_interval: Duration,
    max_jobs: u32,
    stats: Arc<WorkerStats>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(%job_type, "worker shutting down");
                break;
            }
            _ = poll.tick() => {
                let jobs = match client.activate_jobs(&job_type, max_jobs).await {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        debug!(%job_type, %error, "job activation failed, retrying");
                        continue;
                    }
                };

                for job in jobs {
                    stats.activated.fetch_add(1, Ordering::Relaxed);
                    match client.complete_job(job.key).await {
                        Ok(()) => {
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                            on_job(&job);
                        }
                        Err(error) => {
                            stats.failed_completions.fetch_add(1, Ordering::Relaxed);
                            warn!(%job_type, job = %job.key, %error, "job completion failed");
                        }
                    }
                }
            }
        }
    }
}
