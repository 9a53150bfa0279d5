//! Subprocess bridge agent.
//!
//! Runs one stage in an external program (typically the language-model
//! side of the pipeline) over a JSON-lines stdin/stdout protocol:
//!
//! 1. child → `{"type":"ready"}`
//! 2. parent → `{"type":"execute","stage":…,"payload":{…},"id":…}`
//! 3. child → `{"type":"result","id":…,"result":{…},"node_status"?,"outline_nodes"?}`
//!    or `{"type":"error","id":…,"error":"…"}`
//! 4. parent → `{"type":"shutdown"}`
//!
//! One process is spawned per job.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use reportflow_shared::{
    AgentCommandConfig, NodeStatus, OutlineNode, ReportflowError, Result, Stage,
};

use crate::agent::{Agent, AgentContext, payload_node_id, payload_run_id};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Request message sent to the child.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Execute {
        stage: Stage,
        payload: &'a Value,
        id: &'a str,
    },
    Shutdown,
}

/// Response message received from the child.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        result: Value,
        #[serde(default)]
        node_status: Option<NodeStatus>,
        #[serde(default)]
        outline_nodes: Vec<NodeSpec>,
    },
    Error {
        #[allow(dead_code)]
        id: Option<String>,
        error: String,
    },
}

/// An outline node declared by the child, usually from the outline stage.
#[derive(Debug, Clone, Deserialize)]
struct NodeSpec {
    node_id: String,
    #[serde(default)]
    parent_id: Option<String>,
    title: String,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    allowed_topics: Vec<String>,
    #[serde(default)]
    excluded_topics: Vec<String>,
    #[serde(default)]
    retrieval_queries: Vec<String>,
}

/// A successful reply, before side effects are applied.
#[derive(Debug)]
struct StageReply {
    result: Value,
    node_status: Option<NodeStatus>,
    outline_nodes: Vec<NodeSpec>,
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to one spawned bridge process.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    timeout: Duration,
}

impl BridgeHandle {
    /// Spawn the child and wait for its ready message.
    async fn spawn(agent: &BridgeAgent) -> Result<Self> {
        debug!(stage = %agent.stage, cmd = %agent.command, "spawning bridge");

        let mut command = Command::new(&agent.command);
        command
            .args(&agent.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true);
        if let Some(dir) = &agent.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ReportflowError::agent(format!(
                "failed to spawn bridge for stage '{}': {e}. Is `{}` installed?",
                agent.stage, agent.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReportflowError::agent("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReportflowError::agent("failed to capture bridge stdout"))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            timeout: agent.timeout,
        };

        match handle.read_message().await? {
            ResponseMessage::Ready => Ok(handle),
            other => Err(ReportflowError::agent(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    async fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| {
                ReportflowError::agent(format!("bridge did not reply within {:?}", self.timeout))
            })?
            .map_err(|e| ReportflowError::agent(format!("bridge read error: {e}")))?;

        if read == 0 {
            return Err(ReportflowError::agent("bridge closed stdout unexpectedly"));
        }

        serde_json::from_str(line.trim()).map_err(|e| {
            ReportflowError::agent(format!(
                "invalid bridge message: {e} (got: {})",
                line.trim().chars().take(200).collect::<String>()
            ))
        })
    }

    async fn send(&mut self, message: &RequestMessage<'_>) -> Result<()> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| ReportflowError::agent(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ReportflowError::agent(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ReportflowError::agent(format!("failed to flush bridge stdin: {e}")))
    }

    /// Send one execute request and wait for its reply.
    async fn execute(&mut self, stage: Stage, payload: &Value, id: &str) -> Result<StageReply> {
        self.send(&RequestMessage::Execute { stage, payload, id }).await?;

        match self.read_message().await? {
            ResponseMessage::Result {
                id: reply_id,
                result,
                node_status,
                outline_nodes,
            } => {
                if reply_id != id {
                    return Err(ReportflowError::agent(format!(
                        "bridge replied to request {reply_id}, expected {id}"
                    )));
                }
                Ok(StageReply {
                    result,
                    node_status,
                    outline_nodes,
                })
            }
            ResponseMessage::Error { error, .. } => Err(ReportflowError::agent(error)),
            ResponseMessage::Ready => Err(ReportflowError::agent(
                "unexpected ready message during execution",
            )),
        }
    }

    /// Send shutdown and wait for the child to exit.
    async fn shutdown(mut self) {
        if let Err(e) = self.send(&RequestMessage::Shutdown).await {
            debug!(error = %e, "bridge already gone at shutdown");
        }
        drop(self.stdin);

        match tokio::time::timeout(self.timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit after shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Executes a stage through an external program.
pub struct BridgeAgent {
    stage: Stage,
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl BridgeAgent {
    pub fn new(stage: Stage, config: &AgentCommandConfig) -> Self {
        Self {
            stage,
            command: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn apply_reply(&self, ctx: &AgentContext<'_>, payload: &Value, reply: &StageReply) -> Result<()> {
        let run_id = payload_run_id(payload)?;

        if !reply.outline_nodes.is_empty() {
            let nodes: Vec<OutlineNode> = reply
                .outline_nodes
                .iter()
                .cloned()
                .map(|spec| OutlineNode {
                    run_id,
                    node_id: spec.node_id,
                    parent_id: spec.parent_id,
                    title: spec.title,
                    goal: spec.goal,
                    allowed_topics: spec.allowed_topics,
                    excluded_topics: spec.excluded_topics,
                    retrieval_queries: spec.retrieval_queries,
                    status: NodeStatus::Pending,
                })
                .collect();
            let inserted = ctx.storage.insert_outline_nodes(&nodes).await?;
            info!(%run_id, declared = nodes.len(), inserted, "stored outline nodes");
        }

        if let Some(status) = reply.node_status {
            let node_id = payload_node_id(payload)?;
            if !ctx.storage.advance_node_status(&run_id, node_id, status).await? {
                debug!(%run_id, node_id, %status, "node status not advanced");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for BridgeAgent {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: &AgentContext<'_>, payload: &Value) -> Result<Value> {
        let mut bridge = BridgeHandle::spawn(self).await?;
        let reply = bridge.execute(self.stage, payload, &ctx.job.job_id).await;
        bridge.shutdown().await;
        let reply = reply?;

        self.validate(&reply.result)?;
        self.apply_reply(ctx, payload, &reply).await?;
        Ok(reply.result)
    }

    fn validate(&self, output: &Value) -> Result<()> {
        if output.is_object() {
            Ok(())
        } else {
            Err(ReportflowError::validation(format!(
                "{} result must be a JSON object, got {output}",
                self.stage
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{claimed_job, test_storage};
    use serde_json::json;

    /// A bridge that answers every execute request with `reply_body`.
    /// The request id is echoed back with sed.
    fn sh_bridge(reply_body: &str) -> AgentCommandConfig {
        let script = format!(
            r#"echo '{{"type":"ready"}}'
read -r line
id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
printf '{{"type":{reply_body}}}\n' "$id"
read -r line
"#
        );
        AgentCommandConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            working_dir: None,
            timeout_secs: 10,
        }
    }

    #[test]
    fn request_serializes_with_tag() {
        let payload = json!({"run_id": "r"});
        let msg = RequestMessage::Execute {
            stage: Stage::GlobalMemory,
            payload: &payload,
            id: "job-1",
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"execute","stage":"global_memory","payload":{"run_id":"r"},"id":"job-1"}"#
        );
        assert_eq!(
            serde_json::to_string(&RequestMessage::Shutdown).unwrap(),
            r#"{"type":"shutdown"}"#
        );
    }

    #[test]
    fn response_deserializes_optional_fields() {
        let msg: ResponseMessage =
            serde_json::from_str(r#"{"type":"result","id":"x","result":{"claims":[]}}"#).unwrap();
        match msg {
            ResponseMessage::Result {
                node_status,
                outline_nodes,
                ..
            } => {
                assert!(node_status.is_none());
                assert!(outline_nodes.is_empty());
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn outline_reply_inserts_pending_nodes() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Outline, None).await;
        let config = sh_bridge(
            r#""result","id":"%s","result":{"sections":2},"outline_nodes":[{"node_id":"1","title":"Intro","retrieval_queries":["graphs"]},{"node_id":"2","title":"Paths"}]"#,
        );
        let agent = BridgeAgent::new(Stage::Outline, &config);

        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let output = agent.execute(&ctx, &job.payload).await.unwrap();
        assert_eq!(output, json!({"sections": 2}));

        let nodes = storage.list_outline_nodes(&job.run_id, None).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Pending));
        assert_eq!(nodes[0].retrieval_queries, vec!["graphs".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn declared_node_status_is_applied() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Evidence, Some("1")).await;
        let config = sh_bridge(r#""result","id":"%s","result":{},"node_status":"retrieved""#);
        let agent = BridgeAgent::new(Stage::Evidence, &config);

        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        agent.execute(&ctx, &job.payload).await.unwrap();

        let node = storage.get_outline_node(&job.run_id, "1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Retrieved);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_reply_is_an_agent_error() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Claim, Some("1")).await;
        let config = sh_bridge(r#""error","id":"%s","error":"rate limited""#);
        let agent = BridgeAgent::new(Stage::Claim, &config);

        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let err = agent.execute(&ctx, &job.payload).await.unwrap_err();
        assert!(matches!(err, ReportflowError::Agent(_)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_object_result_fails_validation() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Claim, Some("1")).await;
        let config = sh_bridge(r#""result","id":"%s","result":[1,2]"#);
        let agent = BridgeAgent::new(Stage::Claim, &config);

        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let err = agent.execute(&ctx, &job.payload).await.unwrap_err();
        assert!(matches!(err, ReportflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_an_agent_error() {
        let storage = test_storage().await;
        let job = claimed_job(&storage, Stage::Draft, Some("1")).await;
        let config = AgentCommandConfig {
            command: "reportflow-no-such-bridge".into(),
            args: vec![],
            working_dir: None,
            timeout_secs: 1,
        };
        let agent = BridgeAgent::new(Stage::Draft, &config);

        let ctx = AgentContext {
            storage: &storage,
            job: &job,
        };
        let err = agent.execute(&ctx, &job.payload).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn bridge"));
    }
}
