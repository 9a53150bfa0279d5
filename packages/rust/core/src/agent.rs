//! Stage agent trait and the stage → agent registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reportflow_shared::{Job, ReportflowError, Result, RunId, Stage};
use reportflow_storage::Storage;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// What an agent sees while executing one job.
pub struct AgentContext<'a> {
    /// Connection scoped to this job.
    pub storage: &'a Storage,
    pub job: &'a Job,
}

/// Executes the domain logic of one pipeline stage.
///
/// Any error returned from [`execute`](Agent::execute) or
/// [`validate`](Agent::validate) consumes one retry of the job.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The stage this agent handles.
    fn stage(&self) -> Stage;

    /// Run the stage for one job payload and return its structured result.
    async fn execute(&self, ctx: &AgentContext<'_>, payload: &Value) -> Result<Value>;

    /// Check a result before the job is marked done.
    fn validate(&self, _output: &Value) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Static mapping from stage to agent, built once at worker startup.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<Stage, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` for its stage, replacing any earlier registration.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> &mut Self {
        let stage = agent.stage();
        if self.agents.insert(stage, agent).is_some() {
            tracing::debug!(%stage, "replaced agent registration");
        }
        self
    }

    /// Look up the agent for `stage`.
    pub fn get(&self, stage: Stage) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(&stage)
            .cloned()
            .ok_or_else(|| ReportflowError::agent(format!("no agent registered for stage '{stage}'")))
    }

    /// Registered stages, in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.agents.contains_key(s))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Read the required `run_id` key.
pub fn payload_run_id(payload: &Value) -> Result<RunId> {
    let raw = payload
        .get("run_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ReportflowError::validation("payload is missing run_id"))?;
    raw.parse()
        .map_err(|e| ReportflowError::validation(format!("payload run_id {raw:?} is invalid: {e}")))
}

/// Read the `node_id` key required by node-scoped stages.
pub fn payload_node_id(payload: &Value) -> Result<&str> {
    payload
        .get("node_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ReportflowError::validation("payload is missing node_id"))
}
