//! libSQL storage layer for reportflow.
//!
//! The [`Storage`] struct wraps a libSQL database holding runs, outline nodes,
//! the chunk corpus (with FTS5 index and stored vectors), the job queue, and
//! per-node retrieval results.
//!
//! **Concurrency rules:**
//! - The `jobs` table is the only coordination point between workers.
//! - Every job status write is a single guarded statement (or one transaction).
//! - Each worker takes its own connection via [`Storage::reconnect`].

mod corpus;
mod jobs;
mod migrations;
mod results;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, params};
use reportflow_shared::{
    NodeStatus, OutlineNode, ReportflowError, Result, Run, RunId, RunStatus,
};

pub use corpus::{
    Chunk, Document, NewChunk, NewDocument, ShortlistHit, content_hash, decode_vector,
    encode_vector,
};
pub use jobs::{JobCounts, NewJob};

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database connection.
pub struct Storage {
    db: Arc<Database>,
    conn: Connection,
    path: PathBuf,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ReportflowError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;
        configure_connection(&conn).await?;

        let storage = Self {
            db: Arc::new(db),
            conn,
            path: path.to_path_buf(),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a fresh connection to the same database.
    ///
    /// The scheduler takes one per job so connection lifetime is scoped to
    /// a single job execution.
    pub async fn reconnect(&self) -> Result<Self> {
        let conn = self.db.connect().map_err(storage_err)?;
        configure_connection(&conn).await?;
        Ok(Self {
            db: Arc::clone(&self.db),
            conn,
            path: self.path.clone(),
        })
    }

    /// Filesystem location of the database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ReportflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Insert a new run in `initializing` status.
    pub async fn insert_run(&self, topic: &str, config: Option<&serde_json::Value>) -> Result<Run> {
        let run = Run {
            run_id: RunId::new(),
            topic: topic.to_string(),
            status: RunStatus::Initializing,
            created_at: Utc::now(),
            config: config.cloned(),
        };
        let config_json = config.map(serde_json::Value::to_string);

        self.conn
            .execute(
                "INSERT INTO runs (run_id, topic, status, created_at, config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.run_id.to_string(),
                    run.topic.as_str(),
                    run.status.as_str(),
                    timestamp(&run.created_at),
                    config_json
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(run)
    }

    /// Get a run by ID.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, topic, status, created_at, config_json FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List all runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, topic, status, created_at, config_json
                 FROM runs ORDER BY created_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Delete a run together with its nodes, jobs, and results.
    /// Returns `false` if the run did not exist.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.to_string()])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Move a run to `status` if its current status allows it.
    ///
    /// Returns `false` (and changes nothing) when the transition is not
    /// allowed, e.g. completing a run that already failed.
    pub async fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<bool> {
        let allowed = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>();
        if allowed.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2 AND status IN ({})",
            allowed.join(", ")
        );
        let affected = self
            .conn
            .execute(&sql, params![status.as_str(), run_id.to_string()])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Outline node operations
    // -----------------------------------------------------------------------

    /// Insert an outline node. `(run_id, node_id)` must be unique.
    pub async fn insert_outline_node(&self, node: &OutlineNode) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO outline_nodes
                   (run_id, node_id, parent_id, title, goal, allowed_topics, excluded_topics,
                    retrieval_queries, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    node.run_id.to_string(),
                    node.node_id.as_str(),
                    node.parent_id.as_deref(),
                    node.title.as_str(),
                    node.goal.as_deref(),
                    to_json(&node.allowed_topics)?,
                    to_json(&node.excluded_topics)?,
                    to_json(&node.retrieval_queries)?,
                    node.status.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Insert a batch of outline nodes in one transaction, skipping any
    /// `(run_id, node_id)` that already exists. Returns how many were new.
    pub async fn insert_outline_nodes(&self, nodes: &[OutlineNode]) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(libsql::TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let mut inserted = 0;
        for node in nodes {
            inserted += tx
                .execute(
                    "INSERT INTO outline_nodes
                       (run_id, node_id, parent_id, title, goal, allowed_topics, excluded_topics,
                        retrieval_queries, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (run_id, node_id) DO NOTHING",
                    params![
                        node.run_id.to_string(),
                        node.node_id.as_str(),
                        node.parent_id.as_deref(),
                        node.title.as_str(),
                        node.goal.as_deref(),
                        to_json(&node.allowed_topics)?,
                        to_json(&node.excluded_topics)?,
                        to_json(&node.retrieval_queries)?,
                        node.status.as_str(),
                    ],
                )
                .await
                .map_err(storage_err)? as usize;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    /// Get one outline node.
    pub async fn get_outline_node(&self, run_id: &RunId, node_id: &str) -> Result<Option<OutlineNode>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, node_id, parent_id, title, goal, allowed_topics, excluded_topics,
                        retrieval_queries, status
                 FROM outline_nodes WHERE run_id = ?1 AND node_id = ?2",
                params![run_id.to_string(), node_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_node(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List a run's outline nodes, optionally filtered by status.
    pub async fn list_outline_nodes(
        &self,
        run_id: &RunId,
        status: Option<NodeStatus>,
    ) -> Result<Vec<OutlineNode>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, node_id, parent_id, title, goal, allowed_topics, excluded_topics,
                        retrieval_queries, status
                 FROM outline_nodes
                 WHERE run_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY rowid",
                params![run_id.to_string(), status.map(|s| s.as_str())],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_node(&row)?);
        }
        Ok(results)
    }

    /// Advance a node to `status`. Never moves a node backwards.
    ///
    /// Returns `false` if the node is missing or already at/after `status`.
    pub async fn advance_node_status(
        &self,
        run_id: &RunId,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<bool> {
        let before = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>();
        if before.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE outline_nodes SET status = ?1
             WHERE run_id = ?2 AND node_id = ?3 AND status IN ({})",
            before.join(", ")
        );
        let affected = self
            .conn
            .execute(&sql, params![status.as_str(), run_id.to_string(), node_id])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Count a run's nodes, optionally only those in `status`.
    pub async fn count_outline_nodes(
        &self,
        run_id: &RunId,
        status: Option<NodeStatus>,
    ) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM outline_nodes
                 WHERE run_id = ?1 AND (?2 IS NULL OR status = ?2)",
                params![run_id.to_string(), status.map(|s| s.as_str())],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(int(&row, 0)? as usize),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

/// Per-connection pragmas: cascades, WAL, and a busy timeout so concurrent
/// writers wait instead of failing immediately.
async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", params![])
        .await
        .map_err(storage_err)?;
    pragma(conn, "PRAGMA journal_mode = WAL").await?;
    pragma(conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
    Ok(())
}

/// Run a pragma that reports its new value as a row.
async fn pragma(conn: &Connection, sql: &str) -> Result<()> {
    let mut rows = conn.query(sql, params![]).await.map_err(storage_err)?;
    rows.next().await.map_err(storage_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn storage_err(e: libsql::Error) -> ReportflowError {
    ReportflowError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so lexical order equals chronological order.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReportflowError::Storage(format!("invalid date {s:?}: {e}")))
}

pub(crate) fn parse_run_id(s: &str) -> Result<RunId> {
    s.parse()
        .map_err(|e| ReportflowError::Storage(format!("invalid run id {s:?}: {e}")))
}

pub(crate) fn text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

pub(crate) fn int(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(storage_err)
}

pub(crate) fn real(row: &Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx).map_err(storage_err)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ReportflowError::Storage(e.to_string()))
}

fn string_list(row: &Row, idx: i32) -> Result<Vec<String>> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| ReportflowError::Storage(format!("invalid JSON list in column {idx}: {e}")))
}

/// Convert a database row to a [`Run`].
fn row_to_run(row: &Row) -> Result<Run> {
    let config = match row.get::<String>(4).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| ReportflowError::Storage(format!("invalid run config: {e}")))?,
        ),
        None => None,
    };
    Ok(Run {
        run_id: parse_run_id(&text(row, 0)?)?,
        topic: text(row, 1)?,
        status: text(row, 2)?.parse()?,
        created_at: parse_timestamp(&text(row, 3)?)?,
        config,
    })
}

/// Convert a database row to an [`OutlineNode`].
fn row_to_node(row: &Row) -> Result<OutlineNode> {
    Ok(OutlineNode {
        run_id: parse_run_id(&text(row, 0)?)?,
        node_id: text(row, 1)?,
        parent_id: row.get::<String>(2).ok(),
        title: text(row, 3)?,
        goal: row.get::<String>(4).ok(),
        allowed_topics: string_list(row, 5)?,
        excluded_topics: string_list(row, 6)?,
        retrieval_queries: string_list(row, 7)?,
        status: text(row, 8)?.parse()?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub(crate) fn node(run_id: RunId, node_id: &str, title: &str) -> OutlineNode {
        OutlineNode {
            run_id,
            node_id: node_id.into(),
            parent_id: None,
            title: title.into(),
            goal: None,
            allowed_topics: vec![],
            excluded_topics: vec![],
            retrieval_queries: vec![],
            status: NodeStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{node, test_storage};
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("rf_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn run_crud() {
        let storage = test_storage().await;
        let config = serde_json::json!({"draft_model": "llama"});
        let run = storage
            .insert_run("graph algorithms", Some(&config))
            .await
            .expect("insert run");
        assert_eq!(run.status, RunStatus::Initializing);

        let found = storage.get_run(&run.run_id).await.unwrap().expect("run exists");
        assert_eq!(found.topic, "graph algorithms");
        assert_eq!(found.config, Some(config));

        assert_eq!(storage.list_runs().await.unwrap().len(), 1);
        assert!(storage.delete_run(&run.run_id).await.unwrap());
        assert!(storage.get_run(&run.run_id).await.unwrap().is_none());
        assert!(!storage.delete_run(&run.run_id).await.unwrap());
    }

    #[tokio::test]
    async fn run_status_is_guarded() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();

        assert!(!storage.set_run_status(&run.run_id, RunStatus::Completed).await.unwrap());
        assert!(storage.set_run_status(&run.run_id, RunStatus::Running).await.unwrap());
        assert!(storage.set_run_status(&run.run_id, RunStatus::Failed).await.unwrap());
        // Terminal: neither completed nor running again.
        assert!(!storage.set_run_status(&run.run_id, RunStatus::Completed).await.unwrap());
        assert!(!storage.set_run_status(&run.run_id, RunStatus::Running).await.unwrap());

        let found = storage.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(found.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn outline_nodes_are_unique_per_run() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();

        let mut n = node(run.run_id, "1", "Intro");
        n.retrieval_queries = vec!["shortest paths".into()];
        storage.insert_outline_node(&n).await.expect("insert node");
        assert!(storage.insert_outline_node(&n).await.is_err());

        let found = storage
            .get_outline_node(&run.run_id, "1")
            .await
            .unwrap()
            .expect("node exists");
        assert_eq!(found.retrieval_queries, vec!["shortest paths".to_string()]);
        assert_eq!(found.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn batch_insert_skips_existing_nodes() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();
        let batch = vec![node(run.run_id, "1", "A"), node(run.run_id, "2", "B")];

        assert_eq!(storage.insert_outline_nodes(&batch).await.unwrap(), 2);
        assert_eq!(storage.insert_outline_nodes(&batch).await.unwrap(), 0);
        assert_eq!(storage.count_outline_nodes(&run.run_id, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn node_status_only_advances() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();
        storage.insert_outline_node(&node(run.run_id, "1", "A")).await.unwrap();
        storage.insert_outline_node(&node(run.run_id, "2", "B")).await.unwrap();

        let id = &run.run_id;
        assert!(storage.advance_node_status(id, "1", NodeStatus::Retrieved).await.unwrap());
        assert!(storage.advance_node_status(id, "1", NodeStatus::Drafted).await.unwrap());
        assert!(!storage.advance_node_status(id, "1", NodeStatus::Retrieved).await.unwrap());
        assert!(!storage.advance_node_status(id, "missing", NodeStatus::Drafted).await.unwrap());

        assert_eq!(storage.count_outline_nodes(id, None).await.unwrap(), 2);
        assert_eq!(
            storage.count_outline_nodes(id, Some(NodeStatus::Drafted)).await.unwrap(),
            1
        );
        let pending = storage
            .list_outline_nodes(id, Some(NodeStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].node_id, "2");
    }

    #[tokio::test]
    async fn deleting_run_cascades_to_nodes() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();
        storage.insert_outline_node(&node(run.run_id, "1", "A")).await.unwrap();

        storage.delete_run(&run.run_id).await.unwrap();
        assert_eq!(storage.count_outline_nodes(&run.run_id, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconnect_shares_database() {
        let storage = test_storage().await;
        let run = storage.insert_run("t", None).await.unwrap();

        let other = storage.reconnect().await.expect("reconnect");
        assert_eq!(other.path(), storage.path());
        assert!(other.get_run(&run.run_id).await.unwrap().is_some());
    }
}
