//! SQL migration definitions for the reportflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: runs, outline_nodes, documents, chunks, FTS5, jobs, retrieval_results",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Report-generation workflows
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    topic       TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    config_json TEXT
);

-- Report sections
CREATE TABLE IF NOT EXISTS outline_nodes (
    run_id            TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id           TEXT NOT NULL,
    parent_id         TEXT,
    title             TEXT NOT NULL,
    goal              TEXT,
    allowed_topics    TEXT NOT NULL DEFAULT '[]',
    excluded_topics   TEXT NOT NULL DEFAULT '[]',
    retrieval_queries TEXT NOT NULL DEFAULT '[]',
    status            TEXT NOT NULL,
    UNIQUE(run_id, node_id)
);

CREATE INDEX IF NOT EXISTS idx_outline_nodes_run ON outline_nodes(run_id, status);

-- Source documents
CREATE TABLE IF NOT EXISTS documents (
    doc_id       TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    author       TEXT,
    year         INTEGER,
    content_hash TEXT NOT NULL UNIQUE,
    created_at   TEXT NOT NULL
);

-- Document chunks with stored vectors (little-endian f32)
CREATE TABLE IF NOT EXISTS chunks (
    chunk_pk    INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id      TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    text        TEXT NOT NULL,
    embedding   BLOB,
    UNIQUE(doc_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id);

-- Full-text search on chunk text
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content=chunks,
    content_rowid=chunk_pk
);

-- Triggers to keep FTS in sync with chunks table
CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.chunk_pk, new.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.chunk_pk, old.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_fts_update AFTER UPDATE OF text ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.chunk_pk, old.text);
    INSERT INTO chunks_fts(rowid, text) VALUES (new.chunk_pk, new.text);
END;

-- Orchestrator work queue
CREATE TABLE IF NOT EXISTS jobs (
    job_id       TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id      TEXT,
    stage        TEXT NOT NULL,
    status       TEXT NOT NULL,
    payload      TEXT NOT NULL DEFAULT '{}',
    retries      INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    available_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs(run_id);

-- Ranking outcomes per outline node
CREATE TABLE IF NOT EXISTS retrieval_results (
    result_pk   INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id     TEXT NOT NULL,
    chunk_pk    INTEGER NOT NULL REFERENCES chunks(chunk_pk) ON DELETE CASCADE,
    fts_score   REAL NOT NULL,
    vec_score   REAL NOT NULL,
    fused_score REAL NOT NULL,
    rank        INTEGER NOT NULL,
    UNIQUE(run_id, node_id, rank)
);

CREATE INDEX IF NOT EXISTS idx_retrieval_run_node ON retrieval_results(run_id, node_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
