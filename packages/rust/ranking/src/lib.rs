//! Hybrid full-text + vector ranking for reportflow.
//!
//! A query flows through five stages, see [`HybridRanker::rank`]:
//! 1. FTS5 shortlist (`bm25`, negative terms as `NOT` filters)
//! 2. Cosine rerank against stored chunk vectors
//! 3. Min-max normalization and 50/50 score fusion
//! 4. MMR diversification
//! 5. Per-document cap
//!
//! The module also owns document ingestion, since chunk vectors come from
//! the same [`EmbeddingProvider`] that embeds queries.

mod diversity;
mod embedding;
mod engine;
mod ingest;
mod query;
mod scoring;

pub use diversity::{RankedChunk, cap_per_document, mmr_select};
pub use embedding::{EmbeddingProvider, OllamaEmbedder};
pub use engine::{HybridRanker, RankingParams, RetrievalRequest};
pub use ingest::{IngestOutcome, chunk_text, ingest_document};
pub use query::{match_expression, terms};
pub use scoring::{
    COSINE_EPSILON, Candidate, cosine_similarity, fuse_scores, min_max_normalize, rerank_by_vector,
};
