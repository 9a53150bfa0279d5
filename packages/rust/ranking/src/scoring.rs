//! Vector similarity, score normalization, and fusion.

use reportflow_storage::ShortlistHit;
use tracing::warn;

/// Guards cosine similarity against zero-length vectors.
pub const COSINE_EPSILON: f64 = 1e-10;

/// Weight of the normalized full-text score in the fused score.
pub const FTS_WEIGHT: f64 = 0.5;

/// Weight of the normalized vector score in the fused score.
pub const VECTOR_WEIGHT: f64 = 0.5;

/// A chunk moving through the ranking stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_pk: i64,
    pub doc_id: String,
    pub text: String,
    pub fts_score: f64,
    pub vec_score: f64,
    /// Set by [`fuse_scores`]; zero before.
    pub fused_score: f64,
    pub embedding: Vec<f32>,
}

/// `dot(a, b) / (|a|·|b| + ε)`, computed in f64.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON)
}

/// Min-max scale `scores` into [0, 1].
///
/// A constant array has its range treated as 1, so every value maps to 0.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = scores.iter().copied().fold(min, f64::max);
    let range = if max > min { max - min } else { 1.0 };
    scores.iter().map(|s| (s - min) / range).collect()
}

/// Score every shortlisted chunk against the query vector and keep the best
/// `limit` by similarity. Chunks without a usable stored vector are skipped.
pub fn rerank_by_vector(hits: Vec<ShortlistHit>, query: &[f32], limit: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = hits
        .into_iter()
        .filter_map(|hit| {
            let Some(embedding) = hit.embedding else {
                warn!(chunk_pk = hit.chunk_pk, "chunk has no embedding, skipping");
                return None;
            };
            if embedding.len() != query.len() {
                warn!(
                    chunk_pk = hit.chunk_pk,
                    expected = query.len(),
                    got = embedding.len(),
                    "chunk embedding has wrong dimension, skipping"
                );
                return None;
            }
            Some(Candidate {
                vec_score: cosine_similarity(query, &embedding),
                chunk_pk: hit.chunk_pk,
                doc_id: hit.doc_id,
                text: hit.text,
                fts_score: hit.fts_score,
                fused_score: 0.0,
                embedding,
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.vec_score.total_cmp(&a.vec_score));
    candidates.truncate(limit);
    candidates
}

/// Normalize both score dimensions over `candidates` and set each fused score.
pub fn fuse_scores(candidates: &mut [Candidate]) {
    let fts: Vec<f64> = candidates.iter().map(|c| c.fts_score).collect();
    let vec: Vec<f64> = candidates.iter().map(|c| c.vec_score).collect();
    let fts_norm = min_max_normalize(&fts);
    let vec_norm = min_max_normalize(&vec);

    for ((candidate, f), v) in candidates.iter_mut().zip(fts_norm).zip(vec_norm) {
        candidate.fused_score = FTS_WEIGHT * f + VECTOR_WEIGHT * v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_pk: i64, fts_score: f64, embedding: Option<Vec<f32>>) -> ShortlistHit {
        ShortlistHit {
            chunk_pk,
            doc_id: "d".into(),
            text: String::new(),
            fts_score,
            embedding,
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalization_maps_extremes() {
        let n = min_max_normalize(&[0.9, 0.7, 0.5, 0.3, 0.1]);
        assert!((n[0] - 1.0).abs() < 1e-12);
        assert!((n[4] - 0.0).abs() < 1e-12);
        assert!((n[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn constant_scores_normalize_to_zero() {
        assert_eq!(min_max_normalize(&[0.4, 0.4, 0.4]), vec![0.0, 0.0, 0.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn rerank_skips_missing_vectors_and_truncates() {
        let hits = vec![
            hit(1, 3.0, Some(vec![0.0, 1.0])),
            hit(2, 2.0, None),
            hit(3, 1.0, Some(vec![1.0, 0.0])),
            hit(4, 0.5, Some(vec![1.0, 0.1])),
            hit(5, 0.5, Some(vec![1.0, 0.0, 0.0])),
        ];
        let ranked = rerank_by_vector(hits, &[1.0, 0.0], 2);
        let pks: Vec<i64> = ranked.iter().map(|c| c.chunk_pk).collect();
        assert_eq!(pks, vec![3, 4]);
        assert!(ranked[0].vec_score >= ranked[1].vec_score);
    }

    #[test]
    fn fusion_weights_both_dimensions_equally() {
        let mut candidates: Vec<Candidate> = [(0.9, 0.2), (0.7, 0.9), (0.5, 0.4), (0.3, 0.8), (0.1, 0.1)]
            .iter()
            .enumerate()
            .map(|(i, (f, v))| Candidate {
                chunk_pk: i as i64,
                doc_id: "d".into(),
                text: String::new(),
                fts_score: *f,
                vec_score: *v,
                fused_score: 0.0,
                embedding: vec![],
            })
            .collect();
        fuse_scores(&mut candidates);

        let fused: Vec<f64> = candidates.iter().map(|c| c.fused_score).collect();
        let expected = [0.5625, 0.875, 0.4375, 0.5625, 0.0];
        for (got, want) in fused.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }
}
