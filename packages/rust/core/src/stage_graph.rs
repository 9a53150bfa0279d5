//! Continuation rules: what a completed job enqueues next.
//!
//! ```text
//! outline ──► retrieval (per pending node) ──► evidence ─┬─► claim ──► draft ─┐
//!                                                       └─► global_memory    │
//!                         all nodes drafted (barrier) ◄──────────────────────┘
//!                                    │
//!                                    ▼
//!                                assembler ──► run completed
//! ```

use reportflow_shared::{Job, NodeStatus, ReportflowError, Result, RunId, Stage};
use reportflow_storage::{NewJob, Storage};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

/// Effects of one completed job, applied atomically by `complete_job`.
#[derive(Debug, Default)]
pub struct Continuation {
    pub follow_ups: Vec<NewJob>,
    /// Set when the run is finished.
    pub complete_run: Option<RunId>,
}

/// Options for the fan-in step.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageGraph {
    /// Guard the assembler insert so a run gets at most one assembler job.
    pub exclusive_assembler: bool,
}

impl StageGraph {
    pub fn new(exclusive_assembler: bool) -> Self {
        Self {
            exclusive_assembler,
        }
    }

    /// Compute the continuation of a job that just succeeded.
    ///
    /// Reads the store but writes nothing.
    #[instrument(skip_all, fields(job_id = %job.job_id, stage = %job.stage))]
    pub async fn plan(&self, storage: &Storage, job: &Job) -> Result<Continuation> {
        let run_id = job.run_id;

        let mut continuation = Continuation::default();
        match job.stage {
            Stage::Outline => {
                let pending = storage
                    .list_outline_nodes(&run_id, Some(NodeStatus::Pending))
                    .await?;
                if pending.is_empty() {
                    warn!(%run_id, "outline produced no pending nodes, nothing to retrieve");
                }
                continuation.follow_ups = pending
                    .iter()
                    .map(|node| node_job(run_id, &node.node_id, Stage::Retrieval, None))
                    .collect();
            }
            Stage::Retrieval => {
                continuation
                    .follow_ups
                    .push(node_job(run_id, required_node(job)?, Stage::Evidence, None));
            }
            Stage::Evidence => {
                let node_id = required_node(job)?;
                continuation.follow_ups.extend([
                    node_job(run_id, node_id, Stage::Claim, None),
                    node_job(run_id, node_id, Stage::GlobalMemory, None),
                ]);
            }
            Stage::Claim => {
                let node_id = required_node(job)?;
                let node = storage
                    .get_outline_node(&run_id, node_id)
                    .await?
                    .ok_or_else(|| {
                        ReportflowError::not_found(format!("node {node_id} of run {run_id}"))
                    })?;
                continuation.follow_ups.push(node_job(
                    run_id,
                    node_id,
                    Stage::Draft,
                    Some(("node_title", Value::String(node.title))),
                ));
            }
            Stage::GlobalMemory => {
                required_node(job)?;
            }
            Stage::Draft => {
                required_node(job)?;
                let total = storage.count_outline_nodes(&run_id, None).await?;
                let drafted = storage
                    .count_outline_nodes(&run_id, Some(NodeStatus::Drafted))
                    .await?;
                debug!(%run_id, drafted, total, "barrier check");

                if total > 0 && drafted == total {
                    let mut assembler =
                        NewJob::new(run_id, None, Stage::Assembler, json!({ "run_id": run_id }));
                    if self.exclusive_assembler {
                        assembler = assembler.exclusive();
                    }
                    info!(%run_id, total, "all nodes drafted, enqueueing assembler");
                    continuation.follow_ups.push(assembler);
                }
            }
            Stage::Assembler => {
                continuation.complete_run = Some(run_id);
            }
        }

        Ok(continuation)
    }
}

fn required_node(job: &Job) -> Result<&str> {
    job.node_id.as_deref().ok_or_else(|| {
        ReportflowError::validation(format!("{} job {} has no node_id", job.stage, job.job_id))
    })
}

fn node_job(run_id: RunId, node_id: &str, stage: Stage, extra: Option<(&str, Value)>) -> NewJob {
    let mut payload = json!({ "run_id": run_id, "node_id": node_id });
    if let (Some((key, value)), Some(map)) = (extra, payload.as_object_mut()) {
        map.insert(key.to_string(), value);
    }
    NewJob::new(run_id, Some(node_id.to_string()), stage, payload)
}
