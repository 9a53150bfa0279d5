//! Retrieval stage: hybrid ranking for one outline node, no language model.

use std::sync::Arc;

use async_trait::async_trait;
use reportflow_ranking::{HybridRanker, RetrievalRequest};
use reportflow_shared::{OutlineNode, ReportflowError, Result, Stage};
use serde_json::{Value, json};

use crate::agent::{Agent, AgentContext, payload_node_id, payload_run_id};

/// Ranks the corpus for a node and stores the results.
pub struct RetrievalAgent {
    ranker: Arc<HybridRanker>,
    top_k: usize,
}

impl RetrievalAgent {
    pub fn new(ranker: Arc<HybridRanker>, top_k: usize) -> Self {
        Self { ranker, top_k }
    }
}

/// Query text: retrieval queries, then allowed topics, then the title.
pub fn node_query(node: &OutlineNode) -> String {
    node.retrieval_queries
        .iter()
        .chain(&node.allowed_topics)
        .map(String::as_str)
        .chain(std::iter::once(node.title.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Agent for RetrievalAgent {
    fn stage(&self) -> Stage {
        Stage::Retrieval
    }

    async fn execute(&self, ctx: &AgentContext<'_>, payload: &Value) -> Result<Value> {
        let run_id = payload_run_id(payload)?;
        let node_id = payload_node_id(payload)?;

        let node = ctx
            .storage
            .get_outline_node(&run_id, node_id)
            .await?
            .ok_or_else(|| ReportflowError::not_found(format!("node {node_id} of run {run_id}")))?;

        let query = node_query(&node);
        let request = RetrievalRequest {
            query: &query,
            negative_terms: &node.excluded_topics,
            top_k: self.top_k,
            run_id,
            node_id,
        };
        let chunk_count = self.ranker.retrieve(ctx.storage, &request).await?;

        Ok(json!({ "chunk_count": chunk_count }))
    }

    fn validate(&self, output: &Value) -> Result<()> {
        match output.get("chunk_count").and_then(Value::as_u64) {
            Some(_) => Ok(()),
            None => Err(ReportflowError::validation("retrieval output lacks chunk_count")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{claimed_job, node, test_storage};
    use reportflow_ranking::{EmbeddingProvider, RankingParams};
    use reportflow_shared::{NodeStatus, RunId};
    use reportflow_storage::{NewChunk, NewDocument};

    /// Every text embeds to the same unit vector.
    struct Constant;

    #[async_trait]
    impl EmbeddingProvider for Constant {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn agent() -> RetrievalAgent {
        let params = RankingParams {
            fts_shortlist_size: 200,
            vector_rerank_size: 50,
            mmr_lambda: 0.7,
            max_chunks_per_doc: 3,
        };
        RetrievalAgent::new(Arc::new(HybridRanker::new(Arc::new(Constant), params)), 10)
    }

    #[test]
    fn query_combines_node_fields_in_order() {
        let node = OutlineNode {
            run_id: RunId::new(),
            node_id: "1".into(),
            parent_id: None,
            title: "Shortest paths".into(),
            goal: None,
            allowed_topics: vec!["graphs".into()],
            excluded_topics: vec!["sql".into()],
            retrieval_queries: vec!["dijkstra".into(), "bellman ford".into()],
            status: NodeStatus::Pending,
        };
        assert_eq!(node_query(&node), "dijkstra bellman ford graphs Shortest paths");
    }

    #[tokio::test]
    async fn ranks_node_query_and_excludes_topics() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Retrieval, Some("1")).await;

        let mut target = node(job.run_id, "2");
        target.retrieval_queries = vec!["shortest paths".into()];
        target.excluded_topics = vec!["sql".into()];
        storage.insert_outline_node(&target).await.unwrap();

        let doc = NewDocument {
            title: "Graphs".into(),
            author: None,
            year: None,
            content: "graphs".into(),
        };
        let chunks = [
            "dijkstra finds shortest paths",
            "shortest paths stored in sql tables",
            "bellman ford handles negative paths",
            "unrelated prose",
        ]
        .iter()
        .map(|text| NewChunk {
            text: text.to_string(),
            embedding: Some(vec![1.0, 0.0]),
        })
        .collect::<Vec<_>>();
        storage.store_document(&doc, &chunks).await.unwrap();

        let agent = agent();
        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let payload = serde_json::json!({"run_id": job.run_id, "node_id": "2"});
        let output = agent.execute(&ctx, &payload).await.unwrap();
        agent.validate(&output).unwrap();
        assert_eq!(output["chunk_count"], 2);

        let results = storage.list_retrieval_results(&job.run_id, "2").await.unwrap();
        let ranks: Vec<u32> = results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![0, 1]);

        // status advancement belongs to the scheduler
        let stored = storage.get_outline_node(&job.run_id, "2").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn missing_node_is_an_error() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Retrieval, Some("1")).await;
        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let payload = serde_json::json!({"run_id": job.run_id, "node_id": "9"});
        let err = agent().execute(&ctx, &payload).await.unwrap_err();
        assert!(matches!(err, ReportflowError::NotFound(_)));
    }

    #[test]
    fn output_requires_chunk_count() {
        assert!(agent().validate(&serde_json::json!({"chunk_count": 0})).is_ok());
        assert!(agent().validate(&serde_json::json!({})).is_err());
    }
}
