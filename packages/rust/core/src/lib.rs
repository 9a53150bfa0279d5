//! Pipeline orchestration for reportflow.
//!
//! A [`Worker`] claims jobs from the store, dispatches each to the [`Agent`]
//! registered for its stage, applies the [`JobQueue`] retry policy on
//! failure, and commits the [`StageGraph`] continuation on success.

pub mod agent;
pub mod agents;
pub mod queue;
pub mod stage_graph;
pub mod worker;

pub use agent::{Agent, AgentContext, AgentRegistry, payload_node_id, payload_run_id};
pub use agents::{BridgeAgent, RetrievalAgent, node_query};
pub use queue::{FailureOutcome, JobQueue};
pub use stage_graph::{Continuation, StageGraph};
pub use worker::{JobOutcome, StopHandle, StopSignal, Worker, stop_signal};

#[cfg(test)]
pub(crate) mod test_support {
    use reportflow_shared::{Job, NodeStatus, OutlineNode, RunId, RunStatus, Stage};
    use reportflow_storage::{NewJob, Storage};
    use serde_json::json;
    use uuid::Uuid;

    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rf_core_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub(crate) fn node(run_id: RunId, node_id: &str) -> OutlineNode {
        OutlineNode {
            run_id,
            node_id: node_id.into(),
            parent_id: None,
            title: format!("Section {node_id}"),
            goal: None,
            allowed_topics: vec![],
            excluded_topics: vec![],
            retrieval_queries: vec![],
            status: NodeStatus::Pending,
        }
    }

    /// A running run with one claimed job of `stage`. When `node_id` is
    /// given, the node exists too.
    pub(crate) async fn claimed_job(storage: &Storage, stage: Stage, node_id: Option<&str>) -> Job {
        let run = storage.insert_run("graph algorithms", None).await.unwrap();
        storage
            .set_run_status(&run.run_id, RunStatus::Running)
            .await
            .unwrap();

        let mut payload = json!({ "run_id": run.run_id });
        if let Some(id) = node_id {
            storage.insert_outline_node(&node(run.run_id, id)).await.unwrap();
            payload["node_id"] = json!(id);
        }

        let job = NewJob::new(run.run_id, node_id.map(String::from), stage, payload);
        storage.enqueue(&job).await.unwrap();
        storage.claim_next().await.unwrap().expect("claimable job")
    }
}
