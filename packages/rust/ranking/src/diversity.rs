//! Maximal marginal relevance selection and the per-document cap.

use std::collections::HashMap;

use serde::Serialize;

use crate::scoring::{Candidate, cosine_similarity};

/// A final ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub chunk_pk: i64,
    pub doc_id: String,
    pub text: String,
    pub fts_score: f64,
    pub vec_score: f64,
    pub fused_score: f64,
    /// 0-based, gapless.
    pub rank: u32,
}

/// Greedily pick up to `k` candidates, trading fused relevance against
/// similarity to what is already picked.
///
/// Each step takes the candidate maximizing
/// `λ·fused − (1−λ)·max_cosine_to_selected`. Ties go to the candidate with the
/// higher fused score (earlier in the fused ordering).
pub fn mmr_select(mut pool: Vec<Candidate>, k: usize, lambda: f64) -> Vec<Candidate> {
    pool.sort_by(|a, b| b.fused_score.total_cmp(&a.fused_score));

    let mut selected: Vec<Candidate> = Vec::with_capacity(k.min(pool.len()));
    while selected.len() < k && !pool.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, candidate) in pool.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.embedding, &s.embedding))
                .reduce(f64::max)
                .unwrap_or(0.0);
            let score = lambda * candidate.fused_score - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        selected.push(pool.remove(best_idx));
    }
    selected
}

/// Keep at most `cap` chunks per source document, scanning in rank order,
/// and renumber the survivors from 0.
pub fn cap_per_document(selected: Vec<Candidate>, cap: usize) -> Vec<RankedChunk> {
    let mut per_doc: HashMap<String, usize> = HashMap::new();
    let mut ranked = Vec::new();

    for candidate in selected {
        let count = per_doc.entry(candidate.doc_id.clone()).or_insert(0);
        if *count >= cap {
            continue;
        }
        *count += 1;
        ranked.push(RankedChunk {
            rank: ranked.len() as u32,
            chunk_pk: candidate.chunk_pk,
            doc_id: candidate.doc_id,
            text: candidate.text,
            fts_score: candidate.fts_score,
            vec_score: candidate.vec_score,
            fused_score: candidate.fused_score,
        });
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::fuse_scores;

    fn candidate(chunk_pk: i64, doc: &str, fused: f64, embedding: Vec<f32>) -> Candidate {
        Candidate {
            chunk_pk,
            doc_id: doc.into(),
            text: String::new(),
            fts_score: 0.0,
            vec_score: 0.0,
            fused_score: fused,
            embedding,
        }
    }

    #[test]
    fn first_pick_is_most_relevant() {
        let pool = vec![
            candidate(1, "a", 0.2, vec![1.0, 0.0]),
            candidate(2, "a", 0.9, vec![0.0, 1.0]),
        ];
        let picked = mmr_select(pool, 1, 0.7);
        assert_eq!(picked[0].chunk_pk, 2);
    }

    #[test]
    fn redundant_candidates_are_demoted() {
        // 2 is nearly a copy of 1; 3 is less relevant but orthogonal.
        let pool = vec![
            candidate(1, "a", 1.0, vec![1.0, 0.0]),
            candidate(2, "a", 0.95, vec![1.0, 0.01]),
            candidate(3, "b", 0.6, vec![0.0, 1.0]),
        ];
        let picked: Vec<i64> = mmr_select(pool, 2, 0.5).iter().map(|c| c.chunk_pk).collect();
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn lambda_one_is_pure_relevance() {
        let pool = vec![
            candidate(1, "a", 0.5, vec![1.0, 0.0]),
            candidate(2, "a", 0.9, vec![1.0, 0.0]),
            candidate(3, "a", 0.7, vec![1.0, 0.0]),
        ];
        let picked: Vec<i64> = mmr_select(pool, 3, 1.0).iter().map(|c| c.chunk_pk).collect();
        assert_eq!(picked, vec![2, 3, 1]);
    }

    #[test]
    fn ties_follow_fused_order() {
        let pool = vec![
            candidate(7, "a", 0.3, vec![1.0, 0.0]),
            candidate(8, "a", 0.3, vec![0.0, 1.0]),
        ];
        let picked = mmr_select(pool, 1, 1.0);
        assert_eq!(picked[0].chunk_pk, 7);
    }

    #[test]
    fn never_duplicates_and_respects_bounds() {
        let pool: Vec<Candidate> = (0..5)
            .map(|i| candidate(i, "a", i as f64 / 10.0, vec![1.0, i as f32]))
            .collect();

        let picked = mmr_select(pool.clone(), 10, 0.7);
        assert_eq!(picked.len(), 5);
        let mut pks: Vec<i64> = picked.iter().map(|c| c.chunk_pk).collect();
        pks.sort();
        pks.dedup();
        assert_eq!(pks.len(), 5);

        assert_eq!(mmr_select(pool.clone(), 3, 0.7).len(), 3);
        assert!(mmr_select(pool, 0, 0.7).is_empty());
        assert!(mmr_select(vec![], 3, 0.7).is_empty());
    }

    #[test]
    fn cap_drops_and_renumbers() {
        let selected = vec![
            candidate(1, "a", 0.9, vec![]),
            candidate(2, "a", 0.8, vec![]),
            candidate(3, "b", 0.7, vec![]),
            candidate(4, "a", 0.6, vec![]),
        ];
        let ranked = cap_per_document(selected, 1);
        let view: Vec<(i64, u32)> = ranked.iter().map(|r| (r.chunk_pk, r.rank)).collect();
        assert_eq!(view, vec![(1, 0), (3, 1)]);
    }

    #[test]
    fn graph_algorithms_scenario() {
        // Five shortlisted chunks from two documents.
        let raw = [
            (1, "d1", 0.9, 0.2, vec![1.0_f32, 0.0, 0.0]),
            (2, "d1", 0.7, 0.9, vec![0.0, 1.0, 0.0]),
            (3, "d2", 0.5, 0.4, vec![0.0, 0.0, 1.0]),
            (4, "d2", 0.3, 0.8, vec![0.7, 0.7, 0.0]),
            (5, "d1", 0.1, 0.1, vec![0.5, 0.5, 0.5]),
        ];
        let mut pool: Vec<Candidate> = raw
            .iter()
            .map(|(pk, doc, f, v, e)| Candidate {
                chunk_pk: *pk,
                doc_id: (*doc).into(),
                text: String::new(),
                fts_score: *f,
                vec_score: *v,
                fused_score: 0.0,
                embedding: e.clone(),
            })
            .collect();
        fuse_scores(&mut pool);

        let picked = mmr_select(pool, 3, 0.7);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0].chunk_pk, 2);

        let ranked = cap_per_document(picked, 1);
        assert!(ranked.len() <= 2);
        let mut docs: Vec<&str> = ranked.iter().map(|r| r.doc_id.as_str()).collect();
        docs.dedup();
        assert_eq!(docs.len(), ranked.len());
        for (i, r) in ranked.iter().enumerate() {
            assert_eq!(r.rank, i as u32);
        }
    }
}
