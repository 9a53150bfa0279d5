//! Application configuration for reportflow.
//!
//! User config lives at `~/.reportflow/reportflow.toml`.
//! Environment variables override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReportflowError, Result};
use crate::types::Stage;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "reportflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".reportflow";

// ---------------------------------------------------------------------------
// Config structs (matching reportflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Scheduler / worker loop settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Hybrid ranking parameters.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Embedding provider settings.
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    /// Document chunking settings.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Subprocess bridge agents keyed by stage name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentCommandConfig>,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/reportflow.db".into()
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds to sleep after an empty claim attempt.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Failures allowed per job before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Not-before delay per accumulated retry. Zero requeues immediately.
    #[serde(default)]
    pub retry_backoff_secs: u64,

    /// Guard the draft barrier so a run never gets two assembler jobs.
    #[serde(default)]
    pub exclusive_assembler: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_retries: default_max_retries(),
            retry_backoff_secs: 0,
            exclusive_assembler: false,
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates kept after the full-text stage.
    #[serde(default = "default_shortlist")]
    pub fts_shortlist_size: usize,

    /// Candidates kept after the vector rerank.
    #[serde(default = "default_rerank")]
    pub vector_rerank_size: usize,

    /// Relevance/diversity trade-off for MMR, in [0, 1].
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,

    /// Maximum results drawn from one source document.
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,

    /// Results requested per outline node.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fts_shortlist_size: default_shortlist(),
            vector_rerank_size: default_rerank(),
            mmr_lambda: default_mmr_lambda(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            top_k: default_top_k(),
        }
    }
}

fn default_shortlist() -> usize {
    200
}
fn default_rerank() -> usize {
    50
}
fn default_mmr_lambda() -> f64 {
    0.7
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_top_k() -> usize {
    50
}

/// `[embeddings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// Ollama server base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "default_embed_model")]
    pub model: String,

    /// Expected vector length.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Attempts per embedding call before giving up on transient errors.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_embed_model(),
            dimension: default_dimension(),
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_embed_model() -> String {
    "nomic-embed-text".into()
}
fn default_dimension() -> usize {
    768
}
fn default_timeout() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Target characters per chunk.
    #[serde(default = "default_chunk_target")]
    pub chunk_target_size: usize,

    /// Fraction of a finished chunk carried into the next one.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_percent: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_target_size: default_chunk_target(),
            chunk_overlap_percent: default_chunk_overlap(),
        }
    }
}

fn default_chunk_target() -> usize {
    8000
}
fn default_chunk_overlap() -> f64 {
    0.12
}

/// `[agents.<stage>]` entry: an external program that executes one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    /// Executable to spawn (e.g., "bun").
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the subprocess.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Seconds to wait for each reply line before giving up on the job.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Overrides and validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (environment-style names).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database.path = v;
        }
        override_parsed(&lookup, "WORKER_POLL_INTERVAL", &mut self.worker.poll_interval_secs)?;
        override_parsed(&lookup, "MAX_JOB_RETRIES", &mut self.worker.max_retries)?;
        override_parsed(&lookup, "RETRY_BACKOFF_SECS", &mut self.worker.retry_backoff_secs)?;
        override_parsed(&lookup, "FTS_SHORTLIST_SIZE", &mut self.retrieval.fts_shortlist_size)?;
        override_parsed(&lookup, "VECTOR_RERANK_SIZE", &mut self.retrieval.vector_rerank_size)?;
        override_parsed(&lookup, "MMR_LAMBDA", &mut self.retrieval.mmr_lambda)?;
        override_parsed(&lookup, "MAX_CHUNKS_PER_DOC", &mut self.retrieval.max_chunks_per_doc)?;
        override_parsed(&lookup, "RETRIEVAL_TOP_K", &mut self.retrieval.top_k)?;
        if let Some(v) = lookup("OLLAMA_BASE_URL") {
            self.embeddings.base_url = v;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.embeddings.model = v;
        }
        override_parsed(&lookup, "EMBED_DIM", &mut self.embeddings.dimension)?;
        override_parsed(&lookup, "CHUNK_TARGET_SIZE", &mut self.ingest.chunk_target_size)?;
        override_parsed(&lookup, "CHUNK_OVERLAP_PERCENT", &mut self.ingest.chunk_overlap_percent)?;
        Ok(())
    }

    /// Reject values the scheduler or ranker cannot work with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.mmr_lambda) {
            return Err(ReportflowError::config(format!(
                "mmr_lambda must be within [0, 1], got {}",
                r.mmr_lambda
            )));
        }
        if !(0.0..1.0).contains(&self.ingest.chunk_overlap_percent) {
            return Err(ReportflowError::config(format!(
                "chunk_overlap_percent must be within [0, 1), got {}",
                self.ingest.chunk_overlap_percent
            )));
        }
        for (name, value) in [
            ("fts_shortlist_size", r.fts_shortlist_size),
            ("vector_rerank_size", r.vector_rerank_size),
            ("max_chunks_per_doc", r.max_chunks_per_doc),
            ("top_k", r.top_k),
            ("embeddings.dimension", self.embeddings.dimension),
            ("chunk_target_size", self.ingest.chunk_target_size),
        ] {
            if value == 0 {
                return Err(ReportflowError::config(format!("{name} must be positive")));
            }
        }
        if self.worker.max_retries == 0 {
            return Err(ReportflowError::config("max_retries must be positive"));
        }
        for stage in self.agents.keys() {
            Stage::from_str(stage)
                .map_err(|e| ReportflowError::config(format!("[agents.{stage}]: {e}")))?;
        }
        Ok(())
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| ReportflowError::config(format!("invalid {key}={raw:?}: {e}")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.reportflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReportflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.reportflow/reportflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk, then apply environment overrides.
/// Returns defaults (plus overrides) if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ReportflowError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ReportflowError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ReportflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ReportflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ReportflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("poll_interval_secs"));
        assert!(toml_str.contains("nomic-embed-text"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.retrieval.fts_shortlist_size, 200);
        assert_eq!(config.retrieval.vector_rerank_size, 50);
        assert!((config.retrieval.mmr_lambda - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.retrieval.max_chunks_per_doc, 3);
        assert!(!config.worker.exclusive_assembler);
        assert_eq!(config.ingest.chunk_target_size, 8000);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn config_with_agents() {
        let toml_str = r#"
[worker]
max_retries = 5

[agents.outline]
command = "bun"
args = ["run", "agents/outline.ts"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.worker.max_retries, 5);
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.agents["outline"].command, "bun");
        assert_eq!(config.agents["outline"].timeout_secs, 600);
        config.validate().expect("valid");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("WORKER_POLL_INTERVAL", "1"),
                ("MMR_LAMBDA", "0.5"),
                ("MAX_CHUNKS_PER_DOC", "2"),
                ("OLLAMA_MODEL", "mxbai-embed-large"),
            ]))
            .expect("overrides");
        assert_eq!(config.worker.poll_interval_secs, 1);
        assert!((config.retrieval.mmr_lambda - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.retrieval.max_chunks_per_doc, 2);
        assert_eq!(config.embeddings.model, "mxbai-embed-large");
    }

    #[test]
    fn unparseable_override_is_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides_from(lookup(&[("MAX_JOB_RETRIES", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_JOB_RETRIES"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.retrieval.mmr_lambda = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retrieval.max_chunks_per_doc = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_chunks_per_doc"));

        let mut config = AppConfig::default();
        config.agents.insert(
            "summarize".into(),
            AgentCommandConfig {
                command: "bun".into(),
                args: vec![],
                working_dir: None,
                timeout_secs: 600,
            },
        );
        assert!(config.validate().is_err());
    }
}
