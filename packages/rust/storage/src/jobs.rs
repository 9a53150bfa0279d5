//! Job queue persistence: enqueue, atomic claim, and guarded status writes.

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, TransactionBehavior, params};
use reportflow_shared::{Job, JobStatus, ReportflowError, Result, RunId, Stage};
use uuid::Uuid;

use crate::{Storage, int, parse_run_id, parse_timestamp, storage_err, text, timestamp};

const JOB_COLUMNS: &str = "job_id, run_id, node_id, stage, status, payload, retries, last_error, \
                           created_at, updated_at, available_at";

/// A job to insert. New jobs always start `queued` with zero retries.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub run_id: RunId,
    pub node_id: Option<String>,
    pub stage: Stage,
    pub payload: serde_json::Value,
    /// Skip the insert if the run already has a job for this stage.
    pub exclusive: bool,
}

impl NewJob {
    pub fn new(run_id: RunId, node_id: Option<String>, stage: Stage, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            node_id,
            stage,
            payload,
            exclusive: false,
        }
    }

    /// Mark the job as at-most-one per (run, stage).
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Job totals for one run, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.failed
    }

    /// Share of jobs that finished successfully, 0 to 100.
    pub fn progress_percent(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.done as f64 * 100.0 / total as f64,
        }
    }
}

impl Storage {
    /// Insert a queued job. Returns `None` when an exclusive job was skipped
    /// because one already exists for its run and stage.
    pub async fn enqueue(&self, job: &NewJob) -> Result<Option<Job>> {
        insert_job(&self.conn, job, Utc::now()).await
    }

    /// Atomically claim the oldest claimable queued job and mark it running.
    ///
    /// The select and the update are one statement, so two concurrent
    /// callers never receive the same job.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let now = timestamp(&Utc::now());
        let sql = format!(
            "UPDATE jobs SET status = 'running', updated_at = ?1
             WHERE job_id = (
                 SELECT job_id FROM jobs
                 WHERE status = 'queued' AND available_at <= ?1
                 ORDER BY created_at, rowid
                 LIMIT 1
             ) AND status = 'queued'
             RETURNING {JOB_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(&sql, params![now])
            .await
            .map_err(storage_err)?;

        let job = match rows.next().await.map_err(storage_err)? {
            Some(row) => Some(row_to_job(&row)?),
            None => None,
        };
        drain(&mut rows).await?;
        Ok(job)
    }

    /// Mark a running job done.
    pub async fn mark_done(&self, job_id: &str) -> Result<()> {
        self.complete_job(job_id, &[], None).await.map(|_| ())
    }

    /// Mark a running job done, insert its follow-up jobs, and optionally
    /// complete its run (and every node of it), all in one transaction.
    ///
    /// Returns the follow-up jobs actually inserted.
    pub async fn complete_job(
        &self,
        job_id: &str,
        follow_ups: &[NewJob],
        complete_run: Option<&RunId>,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let affected = tx
            .execute(
                "UPDATE jobs SET status = 'done', updated_at = ?2
                 WHERE job_id = ?1 AND status = 'running'",
                params![job_id, timestamp(&now)],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(not_running(job_id));
        }

        let mut inserted = Vec::with_capacity(follow_ups.len());
        for follow_up in follow_ups {
            if let Some(job) = insert_job(&tx, follow_up, now).await? {
                inserted.push(job);
            }
        }

        if let Some(run_id) = complete_run {
            let completed = tx
                .execute(
                    "UPDATE runs SET status = 'completed' WHERE run_id = ?1 AND status = 'running'",
                    params![run_id.to_string()],
                )
                .await
                .map_err(storage_err)?;
            if completed > 0 {
                tx.execute(
                    "UPDATE outline_nodes SET status = 'completed' WHERE run_id = ?1",
                    params![run_id.to_string()],
                )
                .await
                .map_err(storage_err)?;
            }
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    /// Put a running job back in the queue after a failure.
    ///
    /// Increments the retry counter, records `error`, and keeps the job
    /// unclaimable until `not_before`. Returns the new retry count.
    pub async fn mark_requeued(
        &self,
        job_id: &str,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<u32> {
        let mut rows = self
            .conn
            .query(
                "UPDATE jobs
                 SET status = 'queued', retries = retries + 1, last_error = ?2,
                     updated_at = ?3, available_at = ?4
                 WHERE job_id = ?1 AND status = 'running'
                 RETURNING retries",
                params![job_id, error, timestamp(&Utc::now()), timestamp(&not_before)],
            )
            .await
            .map_err(storage_err)?;

        let retries = match rows.next().await.map_err(storage_err)? {
            Some(row) => int(&row, 0)? as u32,
            None => return Err(not_running(job_id)),
        };
        drain(&mut rows).await?;
        Ok(retries)
    }

    /// Fail a running job for good and fail its run in the same transaction.
    /// Returns the final retry count.
    pub async fn mark_failed(&self, job_id: &str, error: &str) -> Result<u32> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let mut rows = tx
            .query(
                "UPDATE jobs
                 SET status = 'failed', retries = retries + 1, last_error = ?2, updated_at = ?3
                 WHERE job_id = ?1 AND status = 'running'
                 RETURNING run_id, retries",
                params![job_id, error, timestamp(&Utc::now())],
            )
            .await
            .map_err(storage_err)?;

        let (run_id, retries) = match rows.next().await.map_err(storage_err)? {
            Some(row) => (text(&row, 0)?, int(&row, 1)? as u32),
            None => return Err(not_running(job_id)),
        };
        drain(&mut rows).await?;
        drop(rows);

        tx.execute(
            "UPDATE runs SET status = 'failed'
             WHERE run_id = ?1 AND status IN ('initializing', 'running')",
            params![run_id],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(retries)
    }

    /// Move a run to `running` and enqueue its first job.
    ///
    /// Returns `None` if the run was not in `initializing`.
    pub async fn start_run(&self, job: &NewJob) -> Result<Option<Job>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let affected = tx
            .execute(
                "UPDATE runs SET status = 'running' WHERE run_id = ?1 AND status = 'initializing'",
                params![job.run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Ok(None);
        }

        let inserted = insert_job(&tx, job, Utc::now()).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    /// Enqueue a fresh copy of a failed job. The failed job stays failed.
    pub async fn retry_failed(&self, job_id: &str) -> Result<Job> {
        let failed = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| ReportflowError::not_found(format!("job {job_id}")))?;
        if failed.status != JobStatus::Failed {
            return Err(ReportflowError::validation(format!(
                "job {job_id} is {}, only failed jobs can be retried",
                failed.status
            )));
        }

        let copy = NewJob::new(failed.run_id, failed.node_id, failed.stage, failed.payload);
        insert_job(&self.conn, &copy, Utc::now())
            .await?
            .ok_or_else(|| ReportflowError::Storage(format!("retry of job {job_id} was not inserted")))
    }

    /// Get a job by ID.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![job_id])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List a run's jobs in creation order.
    pub async fn list_jobs(&self, run_id: &RunId) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = ?1 ORDER BY created_at, rowid"
        );
        let mut rows = self
            .conn
            .query(&sql, params![run_id.to_string()])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Count a run's jobs by status.
    pub async fn job_counts(&self, run_id: &RunId) -> Result<JobCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM jobs WHERE run_id = ?1 GROUP BY status",
                params![run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let n = int(&row, 1)? as usize;
            match text(&row, 0)?.parse::<JobStatus>()? {
                JobStatus::Queued => counts.queued = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Done => counts.done = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

async fn insert_job(conn: &Connection, job: &NewJob, now: DateTime<Utc>) -> Result<Option<Job>> {
    let created = Job {
        job_id: Uuid::now_v7().to_string(),
        run_id: job.run_id,
        node_id: job.node_id.clone(),
        stage: job.stage,
        status: JobStatus::Queued,
        payload: job.payload.clone(),
        retries: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
        available_at: now,
    };
    let ts = timestamp(&now);
    let values = params![
        created.job_id.as_str(),
        created.run_id.to_string(),
        created.node_id.as_deref(),
        created.stage.as_str(),
        created.payload.to_string(),
        ts.as_str()
    ];

    let sql = if job.exclusive {
        "INSERT INTO jobs (job_id, run_id, node_id, stage, status, payload, retries,
                           created_at, updated_at, available_at)
         SELECT ?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6, ?6, ?6
         WHERE NOT EXISTS (SELECT 1 FROM jobs WHERE run_id = ?2 AND stage = ?4)"
    } else {
        "INSERT INTO jobs (job_id, run_id, node_id, stage, status, payload, retries,
                           created_at, updated_at, available_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6, ?6, ?6)"
    };

    let affected = conn.execute(sql, values).await.map_err(storage_err)?;
    if affected == 0 {
        tracing::debug!(run_id = %job.run_id, stage = %job.stage, "exclusive job already exists");
        return Ok(None);
    }
    Ok(Some(created))
}

/// Step a statement to completion so its writes are finished.
async fn drain(rows: &mut libsql::Rows) -> Result<()> {
    while rows.next().await.map_err(storage_err)?.is_some() {}
    Ok(())
}

fn not_running(job_id: &str) -> ReportflowError {
    ReportflowError::Storage(format!("job {job_id} is not running"))
}

/// Convert a database row to a [`Job`].
fn row_to_job(row: &Row) -> Result<Job> {
    let payload_raw = text(row, 5)?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|e| ReportflowError::Storage(format!("invalid job payload: {e}")))?;

    Ok(Job {
        job_id: text(row, 0)?,
        run_id: parse_run_id(&text(row, 1)?)?,
        node_id: row.get::<String>(2).ok(),
        stage: text(row, 3)?.parse()?,
        status: text(row, 4)?.parse()?,
        payload,
        retries: int(row, 6)? as u32,
        last_error: row.get::<String>(7).ok(),
        created_at: parse_timestamp(&text(row, 8)?)?,
        updated_at: parse_timestamp(&text(row, 9)?)?,
        available_at: parse_timestamp(&text(row, 10)?)?,
    })
}
