//! Shared types, error model, and configuration for reportflow.
//!
//! This crate is the foundation depended on by all other reportflow crates.
//! It provides:
//! - [`ReportflowError`], the unified error type
//! - Domain types ([`Run`], [`OutlineNode`], [`Job`], [`Stage`], [`RetrievalResult`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentCommandConfig, AppConfig, DatabaseConfig, EmbeddingsConfig, IngestConfig, RetrievalConfig,
    WorkerConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{ReportflowError, Result};
pub use types::{
    Job, JobStatus, NodeStatus, OutlineNode, RetrievalResult, Run, RunId, RunStatus, Stage,
};
