//! Retry policy applied when a job's agent fails.

use std::time::Duration;

use chrono::Utc;
use reportflow_shared::{Job, Result, WorkerConfig};
use reportflow_storage::Storage;
use tracing::{error, warn};

/// What happened to a job after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue with this many retries used.
    Requeued { retries: u32 },
    /// Retries exhausted; the job and its run are failed.
    Failed { retries: u32 },
}

/// Retry budget shared by every worker of a process.
#[derive(Debug, Clone, Copy)]
pub struct JobQueue {
    max_retries: u32,
    retry_backoff: Duration,
}

impl JobQueue {
    pub fn new(max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            max_retries,
            retry_backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a failed attempt of a running job.
    ///
    /// The job is requeued while its incremented retry count stays below the
    /// maximum. A requeued job becomes claimable again after
    /// `retry_backoff × retries`.
    pub async fn record_failure(
        &self,
        storage: &Storage,
        job: &Job,
        error: &str,
    ) -> Result<FailureOutcome> {
        let next = job.retries + 1;

        if next >= self.max_retries {
            let retries = storage.mark_failed(&job.job_id, error).await?;
            error!(
                job_id = %job.job_id,
                run_id = %job.run_id,
                stage = %job.stage,
                retries,
                error,
                "job failed permanently, run failed"
            );
            return Ok(FailureOutcome::Failed { retries });
        }

        let delay = self.retry_backoff * next;
        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let retries = storage.mark_requeued(&job.job_id, error, not_before).await?;
        warn!(
            job_id = %job.job_id,
            stage = %job.stage,
            retries,
            max = self.max_retries,
            delay_secs = delay.as_secs(),
            error,
            "job failed, requeued"
        );
        Ok(FailureOutcome::Requeued { retries })
    }
}

impl From<&WorkerConfig> for JobQueue {
    fn from(config: &WorkerConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.retry_backoff_secs),
        )
    }
}
