//! Source documents, chunks with stored vectors, and the full-text shortlist.

use chrono::Utc;
use libsql::{Connection, Row, TransactionBehavior, params};
use reportflow_shared::{ReportflowError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Storage, int, parse_timestamp, real, storage_err, text, timestamp};

/// A stored source document.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    pub author: Option<String>,
    pub year: Option<i64>,
    pub content_hash: String,
    pub created_at: chrono::DateTime<Utc>,
    pub chunk_count: usize,
}

/// Document metadata for insertion.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub author: Option<String>,
    pub year: Option<i64>,
    /// Full text; only its hash is stored.
    pub content: String,
}

/// One chunk to store alongside a new document.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// A stored chunk, without its vector.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub chunk_pk: i64,
    pub doc_id: String,
    pub chunk_index: i64,
    pub text: String,
}

/// One full-text match with its stored vector.
#[derive(Debug, Clone)]
pub struct ShortlistHit {
    pub chunk_pk: i64,
    pub doc_id: String,
    pub text: String,
    /// Higher is better.
    pub fts_score: f64,
    pub embedding: Option<Vec<f32>>,
}

/// SHA-256 of document content, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encode a vector as little-endian f32 bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes. Fails on a length that is not a multiple of 4.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(ReportflowError::Storage(format!(
            "vector blob has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

const DOCUMENT_SELECT: &str = "SELECT d.doc_id, d.title, d.author, d.year, d.content_hash, d.created_at,
            (SELECT COUNT(*) FROM chunks c WHERE c.doc_id = d.doc_id)
     FROM documents d";

impl Storage {
    /// Insert a document row. A duplicate content hash is a storage error.
    pub async fn insert_document(&self, doc: &NewDocument) -> Result<String> {
        insert_document_row(&self.conn, doc).await
    }

    /// Insert a document and all of its chunks in one transaction.
    pub async fn store_document(&self, doc: &NewDocument, chunks: &[NewChunk]) -> Result<String> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let doc_id = insert_document_row(&tx, doc).await?;
        for (idx, chunk) in chunks.iter().enumerate() {
            insert_chunk_row(&tx, &doc_id, idx as i64, &chunk.text, chunk.embedding.as_deref())
                .await?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(doc_id)
    }

    /// Insert one chunk. Returns its primary key.
    pub async fn insert_chunk(
        &self,
        doc_id: &str,
        chunk_index: i64,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> Result<i64> {
        insert_chunk_row(&self.conn, doc_id, chunk_index, text, embedding).await
    }

    /// Find a document by content hash.
    pub async fn find_document_by_hash(&self, hash: &str) -> Result<Option<Document>> {
        let sql = format!("{DOCUMENT_SELECT} WHERE d.content_hash = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![hash])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_document(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List documents, newest first.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let sql = format!("{DOCUMENT_SELECT} ORDER BY d.created_at DESC");
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_document(&row)?);
        }
        Ok(results)
    }

    /// Delete a document and its chunks. Returns `false` if it did not exist.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Get one chunk by primary key.
    pub async fn get_chunk(&self, chunk_pk: i64) -> Result<Option<Chunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk_pk, doc_id, chunk_index, text FROM chunks WHERE chunk_pk = ?1",
                params![chunk_pk],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Chunk {
                chunk_pk: int(&row, 0)?,
                doc_id: text(&row, 1)?,
                chunk_index: int(&row, 2)?,
                text: text(&row, 3)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Run an FTS5 match expression and return the best `limit` chunks by
    /// text relevance, highest score first.
    pub async fn fts_shortlist(&self, match_expr: &str, limit: usize) -> Result<Vec<ShortlistHit>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.chunk_pk, c.doc_id, c.text, -bm25(chunks_fts) AS score, c.embedding
                 FROM chunks_fts
                 JOIN chunks c ON c.chunk_pk = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                 ORDER BY score DESC, c.chunk_pk
                 LIMIT ?2",
                params![match_expr, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let embedding = match row.get::<Vec<u8>>(4).ok() {
                Some(bytes) => Some(decode_vector(&bytes)?),
                None => None,
            };
            results.push(ShortlistHit {
                chunk_pk: int(&row, 0)?,
                doc_id: text(&row, 1)?,
                text: text(&row, 2)?,
                fts_score: real(&row, 3)?,
                embedding,
            });
        }
        Ok(results)
    }
}

async fn insert_document_row(conn: &Connection, doc: &NewDocument) -> Result<String> {
    let doc_id = Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO documents (doc_id, title, author, year, content_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            doc_id.as_str(),
            doc.title.as_str(),
            doc.author.as_deref(),
            doc.year,
            content_hash(&doc.content),
            timestamp(&Utc::now())
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(doc_id)
}

async fn insert_chunk_row(
    conn: &Connection,
    doc_id: &str,
    chunk_index: i64,
    text: &str,
    embedding: Option<&[f32]>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO chunks (doc_id, chunk_index, text, embedding) VALUES (?1, ?2, ?3, ?4)",
        params![doc_id, chunk_index, text, embedding.map(encode_vector)],
    )
    .await
    .map_err(storage_err)?;
    Ok(conn.last_insert_rowid())
}

fn row_to_document(row: &Row) -> Result<Document> {
    Ok(Document {
        doc_id: text(row, 0)?,
        title: text(row, 1)?,
        author: row.get::<String>(2).ok(),
        year: row.get::<i64>(3).ok(),
        content_hash: text(row, 4)?,
        created_at: parse_timestamp(&text(row, 5)?)?,
        chunk_count: int(row, 6)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    fn doc(title: &str, content: &str) -> NewDocument {
        NewDocument {
            title: title.into(),
            author: None,
            year: Some(2024),
            content: content.into(),
        }
    }

    #[test]
    fn vector_blob_roundtrip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        let bytes = encode_vector(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_vector(&bytes).unwrap(), v);
        assert!(decode_vector(&bytes[..5]).is_err());
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        let hash = content_hash("graph algorithms");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash("graph algorithms"));
    }

    #[tokio::test]
    async fn duplicate_content_is_rejected() {
        let storage = test_storage().await;
        storage.insert_document(&doc("A", "same text")).await.unwrap();
        assert!(storage.insert_document(&doc("B", "same text")).await.is_err());

        let found = storage
            .find_document_by_hash(&content_hash("same text"))
            .await
            .unwrap()
            .expect("document exists");
        assert_eq!(found.title, "A");
        assert_eq!(found.year, Some(2024));
    }

    #[tokio::test]
    async fn store_document_with_chunks() {
        let storage = test_storage().await;
        let chunks = vec![
            NewChunk {
                text: "Dijkstra finds shortest paths in graphs".into(),
                embedding: Some(vec![1.0, 0.0]),
            },
            NewChunk {
                text: "Sorting algorithms compared".into(),
                embedding: None,
            },
        ];
        let doc_id = storage
            .store_document(&doc("Graphs", "full text"), &chunks)
            .await
            .unwrap();

        let docs = storage.list_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, doc_id);
        assert_eq!(docs[0].chunk_count, 2);

        let hits = storage.fts_shortlist("\"graphs\"", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].embedding, Some(vec![1.0, 0.0]));
        assert!(hits[0].fts_score > 0.0);

        let chunk = storage.get_chunk(hits[0].chunk_pk).await.unwrap().unwrap();
        assert_eq!(chunk.chunk_index, 0);
    }

    #[tokio::test]
    async fn shortlist_orders_by_relevance_and_honors_not() {
        let storage = test_storage().await;
        let doc_id = storage.insert_document(&doc("D", "x")).await.unwrap();
        storage
            .insert_chunk(&doc_id, 0, "graph graph graph algorithms", None)
            .await
            .unwrap();
        storage
            .insert_chunk(&doc_id, 1, "a long passage that mentions graph once among many other words", None)
            .await
            .unwrap();
        storage
            .insert_chunk(&doc_id, 2, "graph databases and sql", None)
            .await
            .unwrap();

        let hits = storage.fts_shortlist("(\"graph\") NOT \"sql\"", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].fts_score >= hits[1].fts_score);
        assert!(hits[0].text.starts_with("graph graph"));
        assert!(hits.iter().all(|h| !h.text.contains("sql")));

        let limited = storage.fts_shortlist("\"graph\"", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn deleting_document_removes_chunks_from_index() {
        let storage = test_storage().await;
        let doc_id = storage.insert_document(&doc("D", "x")).await.unwrap();
        storage.insert_chunk(&doc_id, 0, "graph theory", None).await.unwrap();

        assert!(storage.delete_document(&doc_id).await.unwrap());
        assert!(storage.fts_shortlist("\"graph\"", 10).await.unwrap().is_empty());
        assert!(!storage.delete_document(&doc_id).await.unwrap());
    }
}
