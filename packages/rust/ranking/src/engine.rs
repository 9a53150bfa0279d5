//! The hybrid ranking pipeline: full-text shortlist, vector rerank, score
//! fusion, MMR diversification, per-document cap, persistence.

use std::sync::Arc;

use reportflow_shared::{ReportflowError, Result, RetrievalConfig, RetrievalResult, RunId};
use reportflow_storage::Storage;
use tracing::{debug, info, instrument};

use crate::diversity::{RankedChunk, cap_per_document, mmr_select};
use crate::embedding::EmbeddingProvider;
use crate::query::match_expression;
use crate::scoring::{fuse_scores, rerank_by_vector};

/// Tunables for one ranking pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingParams {
    pub fts_shortlist_size: usize,
    pub vector_rerank_size: usize,
    pub mmr_lambda: f64,
    pub max_chunks_per_doc: usize,
}

impl From<&RetrievalConfig> for RankingParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            fts_shortlist_size: config.fts_shortlist_size,
            vector_rerank_size: config.vector_rerank_size,
            mmr_lambda: config.mmr_lambda,
            max_chunks_per_doc: config.max_chunks_per_doc,
        }
    }
}

/// One persisted retrieval for an outline node.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub negative_terms: &'a [String],
    pub top_k: usize,
    pub run_id: RunId,
    pub node_id: &'a str,
}

/// Ranks chunks for a query against the stored corpus.
pub struct HybridRanker {
    embedder: Arc<dyn EmbeddingProvider>,
    params: RankingParams,
}

impl HybridRanker {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, params: RankingParams) -> Self {
        Self { embedder, params }
    }

    pub fn params(&self) -> &RankingParams {
        &self.params
    }

    /// Rank without persisting. An empty shortlist yields an empty list.
    #[instrument(skip_all, fields(top_k))]
    pub async fn rank(
        &self,
        storage: &Storage,
        query: &str,
        negative_terms: &[String],
        top_k: usize,
    ) -> Result<Vec<RankedChunk>> {
        let Some(expr) = match_expression(query, negative_terms) else {
            debug!("query has no searchable terms");
            return Ok(Vec::new());
        };

        let hits = storage.fts_shortlist(&expr, self.params.fts_shortlist_size).await?;
        debug!(count = hits.len(), "fts shortlist");
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_query(query).await?;
        let mut pool = rerank_by_vector(hits, &query_vector, self.params.vector_rerank_size);
        debug!(count = pool.len(), "vector rerank");

        fuse_scores(&mut pool);
        let selected = mmr_select(pool, top_k, self.params.mmr_lambda);
        debug!(count = selected.len(), "mmr selection");

        let ranked = cap_per_document(selected, self.params.max_chunks_per_doc);
        debug!(count = ranked.len(), "after per-document cap");
        Ok(ranked)
    }

    /// Rank and replace the node's stored results. Returns the result count.
    #[instrument(skip_all, fields(run_id = %request.run_id, node_id = request.node_id))]
    pub async fn retrieve(&self, storage: &Storage, request: &RetrievalRequest<'_>) -> Result<usize> {
        let ranked = self
            .rank(storage, request.query, request.negative_terms, request.top_k)
            .await?;

        let rows: Vec<RetrievalResult> = ranked
            .iter()
            .map(|r| RetrievalResult {
                run_id: request.run_id,
                node_id: request.node_id.to_string(),
                chunk_pk: r.chunk_pk,
                fts_score: r.fts_score,
                vec_score: r.vec_score,
                fused_score: r.fused_score,
                rank: r.rank,
            })
            .collect();

        storage
            .replace_retrieval_results(&request.run_id, request.node_id, &rows)
            .await?;
        info!(count = rows.len(), "retrieval complete");
        Ok(rows.len())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ReportflowError::Embedding("no vector returned for query".into()))?;

        if vector.len() != self.embedder.dimension() {
            return Err(ReportflowError::Embedding(format!(
                "query embedding dimension mismatch: expected {}, got {}",
                self.embedder.dimension(),
                vector.len()
            )));
        }
        Ok(vector)
    }
}
