//! Document ingestion: paragraph-aware chunking, embedding, storage.

use reportflow_shared::{IngestConfig, ReportflowError, Result};
use reportflow_storage::{NewChunk, NewDocument, Storage, content_hash};
use serde::Serialize;
use tracing::{info, instrument};

use crate::embedding::EmbeddingProvider;

/// Texts sent per embedding request.
const EMBED_BATCH_SIZE: usize = 32;

/// Result of [`ingest_document`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub chunk_count: usize,
    /// The content was already stored; nothing was written.
    pub existed: bool,
}

/// Split `text` into chunks of roughly `target_size` characters.
///
/// Paragraphs (separated by blank lines) are never split. When a chunk is
/// closed, its last `overlap_percent` characters open the next one.
pub fn chunk_text(text: &str, target_size: usize, overlap_percent: f64) -> Vec<String> {
    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for paragraph in paragraphs {
        let para_len = paragraph.chars().count();
        if current_len + para_len > target_size && !current.is_empty() {
            let chunk = current.join("\n\n");
            let overlap_size = (chunk.chars().count() as f64 * overlap_percent) as usize;
            let overlap = tail_chars(&chunk, overlap_size).to_string();
            chunks.push(chunk);

            current.clear();
            current_len = overlap.chars().count();
            if !overlap.is_empty() {
                current.push(overlap);
            }
        }
        current.push(paragraph.to_string());
        current_len += para_len + 2;
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }
    chunks
}

fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Store a document with embedded chunks, unless identical content is
/// already stored.
#[instrument(skip_all, fields(title = %doc.title))]
pub async fn ingest_document(
    storage: &Storage,
    embedder: &dyn EmbeddingProvider,
    doc: &NewDocument,
    config: &IngestConfig,
) -> Result<IngestOutcome> {
    if let Some(existing) = storage.find_document_by_hash(&content_hash(&doc.content)).await? {
        info!(doc_id = %existing.doc_id, "document already exists");
        return Ok(IngestOutcome {
            doc_id: existing.doc_id,
            chunk_count: existing.chunk_count,
            existed: true,
        });
    }

    let texts = chunk_text(&doc.content, config.chunk_target_size, config.chunk_overlap_percent);
    if texts.is_empty() {
        return Err(ReportflowError::validation("document contains no text"));
    }

    let mut embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH_SIZE) {
        embeddings.extend(embedder.embed(batch).await?);
    }

    let chunks: Vec<NewChunk> = texts
        .into_iter()
        .zip(embeddings)
        .map(|(text, embedding)| NewChunk {
            text,
            embedding: Some(embedding),
        })
        .collect();

    let doc_id = storage.store_document(doc, &chunks).await?;
    info!(%doc_id, chunks = chunks.len(), "ingested document");
    Ok(IngestOutcome {
        doc_id,
        chunk_count: chunks.len(),
        existed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedEmbedder, test_storage};

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("First paragraph.\n\nSecond paragraph.\n\nThird paragraph.", 8000, 0.12);
        assert_eq!(chunks, vec!["First paragraph.\n\nSecond paragraph.\n\nThird paragraph."]);
    }

    #[test]
    fn paragraphs_split_at_target_without_overlap() {
        let text = "0123456789\n\nabcdefghij\n\nABCDEFGHIJ";
        assert_eq!(
            chunk_text(text, 15, 0.0),
            vec!["0123456789", "abcdefghij", "ABCDEFGHIJ"]
        );
    }

    #[test]
    fn closed_chunk_tail_opens_the_next() {
        let text = "0123456789\n\nabcdefghij\n\nABCDEFGHIJ";
        let chunks = chunk_text(text, 15, 0.5);
        assert_eq!(chunks[0], "0123456789");
        assert_eq!(chunks[1], "56789\n\nabcdefghij");
        assert_eq!(chunks[2], "cdefghij\n\nABCDEFGHIJ");
    }

    #[test]
    fn blank_text_has_no_chunks() {
        assert!(chunk_text("\n\n  \n\n", 100, 0.1).is_empty());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("ab", 5), "ab");
    }

    #[tokio::test]
    async fn ingest_is_idempotent_by_content() {
        let storage = test_storage().await;
        let embedder = FixedEmbedder::new(&[("graph", vec![1.0, 0.0])]);
        let doc = NewDocument {
            title: "Graphs".into(),
            author: Some("Ada".into()),
            year: None,
            content: "graph theory basics\n\nmore graph text".into(),
        };
        let config = IngestConfig::default();

        let first = ingest_document(&storage, &embedder, &doc, &config).await.unwrap();
        assert!(!first.existed);
        assert_eq!(first.chunk_count, 1);

        let again = ingest_document(&storage, &embedder, &doc, &config).await.unwrap();
        assert!(again.existed);
        assert_eq!(again.doc_id, first.doc_id);
        assert_eq!(storage.list_documents().await.unwrap().len(), 1);

        let hits = storage.fts_shortlist("\"graph\"", 10).await.unwrap();
        assert_eq!(hits[0].embedding, Some(vec![1.0, 0.0]));
    }
}
