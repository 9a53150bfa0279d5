//! The scheduler loop: claim, dispatch, retry policy, continuation.

use std::time::Duration;

use reportflow_shared::{Job, Result, Stage};
use reportflow_storage::Storage;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::agent::{AgentContext, AgentRegistry};
use crate::queue::{FailureOutcome, JobQueue};
use crate::stage_graph::StageGraph;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Create a linked stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), StopSignal(rx))
}

/// Requests a cooperative stop of every worker holding the paired signal.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Checked by a worker between jobs, never during one.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested. Never resolves if the handle is
    /// dropped without stopping.
    async fn stopped(&mut self) {
        if self.0.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done {
        job_id: String,
        stage: Stage,
        /// Follow-up jobs actually inserted.
        enqueued: usize,
        run_completed: bool,
    },
    Requeued {
        job_id: String,
        retries: u32,
    },
    Failed {
        job_id: String,
        retries: u32,
    },
}

/// One scheduler instance. Processes a single job at a time; scale out by
/// running several workers against the same database.
pub struct Worker {
    storage: Storage,
    registry: AgentRegistry,
    queue: JobQueue,
    graph: StageGraph,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        storage: Storage,
        registry: AgentRegistry,
        queue: JobQueue,
        graph: StageGraph,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            registry,
            queue,
            graph,
            poll_interval,
        }
    }

    /// Poll until `stop` is signalled.
    ///
    /// Store errors at the loop level are logged and retried after the poll
    /// interval.
    pub async fn run(&self, mut stop: StopSignal) {
        info!(
            stages = ?self.registry.stages(),
            poll_secs = self.poll_interval.as_secs_f64(),
            "worker started"
        );

        while !stop.is_stopped() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "worker loop error"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.stopped() => {}
            }
        }

        info!("worker stopped");
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self.storage.claim_next().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process jobs until none is claimable.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Run one claimed job and record its outcome.
    ///
    /// If recording a failure itself hits a store error, the error is
    /// returned and the job stays `running`; there is no lease to reclaim it.
    #[instrument(skip_all, fields(job_id = %job.job_id, run_id = %job.run_id, stage = %job.stage))]
    async fn process(&self, job: Job) -> Result<JobOutcome> {
        info!(node_id = ?job.node_id, retries = job.retries, "job claimed");

        let storage = match self.storage.reconnect().await {
            Ok(storage) => storage,
            Err(e) => return self.fail(&self.storage, job, &e.to_string()).await,
        };

        match self.complete(&storage, &job).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail(&storage, job, &e.to_string()).await,
        }
    }

    async fn fail(&self, storage: &Storage, job: Job, error: &str) -> Result<JobOutcome> {
        let outcome = match self.queue.record_failure(storage, &job, error).await? {
            FailureOutcome::Requeued { retries } => JobOutcome::Requeued {
                job_id: job.job_id,
                retries,
            },
            FailureOutcome::Failed { retries } => JobOutcome::Failed {
                job_id: job.job_id,
                retries,
            },
        };
        Ok(outcome)
    }

    /// Execute, validate, advance the node, and commit the continuation.
    async fn complete(&self, storage: &Storage, job: &Job) -> Result<JobOutcome> {
        let agent = self.registry.get(job.stage)?;
        let ctx = AgentContext { storage, job };
        let output = agent.execute(&ctx, &job.payload).await?;
        agent.validate(&output)?;

        if let (Some(status), Some(node_id)) = (job.stage.completion_status(), job.node_id.as_deref()) {
            storage.advance_node_status(&job.run_id, node_id, status).await?;
        }

        let continuation = self.graph.plan(storage, job).await?;
        let inserted = storage
            .complete_job(
                &job.job_id,
                &continuation.follow_ups,
                continuation.complete_run.as_ref(),
            )
            .await?;

        let run_completed = continuation.complete_run.is_some();
        if run_completed {
            info!(run_id = %job.run_id, "run completed");
        }
        info!(enqueued = inserted.len(), "job done");

        Ok(JobOutcome::Done {
            job_id: job.job_id.clone(),
            stage: job.stage,
            enqueued: inserted.len(),
            run_completed,
        })
    }
}
