//! Core domain types for reportflow runs, outline nodes, and jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReportflowError;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Generates `as_str`, `Display`, and `FromStr` for a string-backed enum.
macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Stable name stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ReportflowError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(ReportflowError::validation(format!(
                        concat!("unknown ", $what, " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Initializing => "initializing",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    /// Completed and failed runs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses a run may be in when moving to `self`.
    pub fn predecessors(&self) -> &'static [RunStatus] {
        match self {
            Self::Initializing => &[],
            Self::Running => &[Self::Initializing],
            Self::Completed => &[Self::Running],
            Self::Failed => &[Self::Initializing, Self::Running],
        }
    }
}

/// Progress of an [`OutlineNode`]. Ordered: a node only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Retrieved,
    Drafted,
    Completed,
}

string_enum!(NodeStatus, "node status", {
    Pending => "pending",
    Retrieved => "retrieved",
    Drafted => "drafted",
    Completed => "completed",
});

impl NodeStatus {
    const ALL: [NodeStatus; 4] = [
        Self::Pending,
        Self::Retrieved,
        Self::Drafted,
        Self::Completed,
    ];

    /// Statuses strictly before `self`.
    pub fn predecessors(&self) -> Vec<NodeStatus> {
        Self::ALL.into_iter().filter(|s| s < self).collect()
    }
}

/// Lifecycle of a [`Job`]: queued → running → {done | queued | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Queued => "queued",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

impl JobStatus {
    /// Done and failed are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A named step in the fixed report pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Outline,
    Retrieval,
    Evidence,
    Claim,
    GlobalMemory,
    Draft,
    Assembler,
}

string_enum!(Stage, "stage", {
    Outline => "outline",
    Retrieval => "retrieval",
    Evidence => "evidence",
    Claim => "claim",
    GlobalMemory => "global_memory",
    Draft => "draft",
    Assembler => "assembler",
});

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 7] = [
        Self::Outline,
        Self::Retrieval,
        Self::Evidence,
        Self::Claim,
        Self::GlobalMemory,
        Self::Draft,
        Self::Assembler,
    ];

    /// Whether jobs of this stage belong to a single outline node.
    pub fn is_node_scoped(&self) -> bool {
        !matches!(self, Self::Outline | Self::Assembler)
    }

    /// Status a node reaches once a job of this stage is done.
    pub fn completion_status(&self) -> Option<NodeStatus> {
        match self {
            Self::Retrieval => Some(NodeStatus::Retrieved),
            Self::Draft => Some(NodeStatus::Drafted),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One report-generation workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub topic: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    /// Model routing overrides and retrieval parameters supplied at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// One section of a run's report outline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineNode {
    pub run_id: RunId,
    /// Hierarchical dotted identifier, e.g. `1.2`.
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub allowed_topics: Vec<String>,
    #[serde(default)]
    pub excluded_topics: Vec<String>,
    #[serde(default)]
    pub retrieval_queries: Vec<String>,
    pub status: NodeStatus,
}

/// One queued unit of orchestrator work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub run_id: RunId,
    /// Absent for run-level stages (outline, assembler).
    pub node_id: Option<String>,
    pub stage: Stage,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The job is not claimable before this instant.
    pub available_at: DateTime<Utc>,
}

/// One persisted ranking outcome for an outline node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub run_id: RunId,
    pub node_id: String,
    pub chunk_pk: i64,
    pub fts_score: f64,
    pub vec_score: f64,
    pub fused_score: f64,
    /// 0-based, gapless, best first.
    pub rank: u32,
}
