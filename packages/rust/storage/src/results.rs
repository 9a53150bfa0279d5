//! Persisted ranking outcomes per outline node.

use libsql::{TransactionBehavior, params};
use reportflow_shared::{Result, RetrievalResult, RunId};

use crate::{Storage, int, parse_run_id, real, storage_err, text};

impl Storage {
    /// Replace every result row for `(run_id, node_id)` with `results`.
    ///
    /// Delete and insert share one transaction, so readers never see a
    /// half-written ranking.
    pub async fn replace_retrieval_results(
        &self,
        run_id: &RunId,
        node_id: &str,
        results: &[RetrievalResult],
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        tx.execute(
            "DELETE FROM retrieval_results WHERE run_id = ?1 AND node_id = ?2",
            params![run_id.to_string(), node_id],
        )
        .await
        .map_err(storage_err)?;

        for result in results {
            tx.execute(
                "INSERT INTO retrieval_results
                   (run_id, node_id, chunk_pk, fts_score, vec_score, fused_score, rank)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    node_id,
                    result.chunk_pk,
                    result.fts_score,
                    result.vec_score,
                    result.fused_score,
                    result.rank as i64
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        tracing::debug!(%run_id, node_id, count = results.len(), "stored retrieval results");
        Ok(())
    }

    /// List a node's results, best rank first.
    pub async fn list_retrieval_results(
        &self,
        run_id: &RunId,
        node_id: &str,
    ) -> Result<Vec<RetrievalResult>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, node_id, chunk_pk, fts_score, vec_score, fused_score, rank
                 FROM retrieval_results
                 WHERE run_id = ?1 AND node_id = ?2
                 ORDER BY rank",
                params![run_id.to_string(), node_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(RetrievalResult {
                run_id: parse_run_id(&text(&row, 0)?)?,
                node_id: text(&row, 1)?,
                chunk_pk: int(&row, 2)?,
                fts_score: real(&row, 3)?,
                vec_score: real(&row, 4)?,
                fused_score: real(&row, 5)?,
                rank: int(&row, 6)? as u32,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewDocument;
    use crate::test_support::test_storage;

    fn result(run_id: RunId, chunk_pk: i64, rank: u32, fused: f64) -> RetrievalResult {
        RetrievalResult {
            run_id,
            node_id: "1".into(),
            chunk_pk,
            fts_score: 1.0,
            vec_score: 0.5,
            fused_score: fused,
            rank,
        }
    }

    #[tokio::test]
    async fn replace_discards_prior_rows() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();
        let doc_id = storage
            .insert_document(&NewDocument {
                title: "D".into(),
                author: None,
                year: None,
                content: "x".into(),
            })
            .await
            .unwrap();
        let a = storage.insert_chunk(&doc_id, 0, "alpha", None).await.unwrap();
        let b = storage.insert_chunk(&doc_id, 1, "beta", None).await.unwrap();

        storage
            .replace_retrieval_results(
                &run.run_id,
                "1",
                &[result(run.run_id, a, 0, 0.9), result(run.run_id, b, 1, 0.4)],
            )
            .await
            .unwrap();
        assert_eq!(storage.list_retrieval_results(&run.run_id, "1").await.unwrap().len(), 2);

        storage
            .replace_retrieval_results(&run.run_id, "1", &[result(run.run_id, b, 0, 0.8)])
            .await
            .unwrap();
        let stored = storage.list_retrieval_results(&run.run_id, "1").await.unwrap();
        assert_eq!(stored, vec![result(run.run_id, b, 0, 0.8)]);

        storage.replace_retrieval_results(&run.run_id, "1", &[]).await.unwrap();
        assert!(storage.list_retrieval_results(&run.run_id, "1").await.unwrap().is_empty());
    }
}
