//! Orchestrator transport: tasks run as jobs submitted to an HTTP job API
//!
//! There is no session. Each action is one job scoped to the target's host:
//! submit, poll until the job leaves the running states, then read the node
//! result. Commands are wrapped in the `tether_shim::command` task that the
//! orchestrator's agents ship with.

use crate::error::TransportError;
use crate::models::{Action, ActionKind, CommandOutput};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::{
    effective_config, opt, unsupported, Connection, OptionSpec, OptionType, RunOptions, Transport,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

type TResult<T> = std::result::Result<T, TransportError>;

pub const OPTIONS: &[OptionSpec] = &[
    opt("host", OptionType::String, false),
    opt("service-url", OptionType::String, true),
    opt("token", OptionType::String, true),
    opt("token-file", OptionType::String, true),
    opt("environment", OptionType::String, false),
    opt("job-poll-interval", OptionType::Integer, false),
    opt("job-poll-timeout", OptionType::Integer, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("environment", "production");
    config.insert("job-poll-interval", 1);
    config.insert("job-poll-timeout", 300);
    config
}

/// Task that runs an arbitrary shell command on the agent side
pub const COMMAND_TASK: &str = "tether_shim::command";

pub struct OrchestratorTransport {
    defaults: TransportConfig,
    project_root: PathBuf,
    client: reqwest::Client,
}

impl OrchestratorTransport {
    pub fn new(options: TransportConfig, project_root: &Path) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self {
            defaults,
            project_root: project_root.to_path_buf(),
            client: reqwest::Client::new(),
        }
    }

    fn read_token(&self, config: &TransportConfig, target: &Target) -> TResult<String> {
        if let Some(token) = config.get_str("token") {
            return Ok(token.to_string());
        }
        let path = match config.get_str("token-file") {
            Some(file) => self.project_root.join(file),
            None => {
                let home = std::env::var("HOME").unwrap_or_default();
                PathBuf::from(home).join(".tether").join("token")
            }
        };
        std::fs::read_to_string(&path)
            .map(|t| t.trim().to_string())
            .map_err(|e| TransportError::Authentication {
                target: target.name.clone(),
                message: format!("Cannot read token file {}: {}", path.display(), e),
            })
    }
}

#[async_trait]
impl Transport for OrchestratorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Orchestrator
    }

    fn supports(&self, action: ActionKind) -> bool {
        matches!(action, ActionKind::Command | ActionKind::Task)
    }

    async fn connect(&self, target: &Target) -> TResult<Box<dyn Connection>> {
        let config = effective_config(&self.defaults, target);
        let service_url = config
            .get_str("service-url")
            .ok_or_else(|| TransportError::Connection {
                target: target.name.clone(),
                message: "Orchestrator service-url is not configured".to_string(),
            })?
            .trim_end_matches('/')
            .to_string();
        let token = self.read_token(&config, target)?;
        let node = config
            .get_str("host")
            .unwrap_or(target.name.as_str())
            .to_string();

        Ok(Box::new(OrchestratorConnection {
            target: target.clone(),
            client: self.client.clone(),
            service_url,
            token,
            node,
            environment: config
                .get_str("environment")
                .unwrap_or("production")
                .to_string(),
            poll_interval: Duration::from_secs(config.get_u64("job-poll-interval").unwrap_or(1)),
            poll_timeout: Duration::from_secs(config.get_u64("job-poll-timeout").unwrap_or(300)),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct JobRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job: JobRef,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    state: String,
}

#[derive(Debug, Deserialize)]
struct NodeResult {
    name: String,
    state: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    items: Vec<NodeResult>,
}

pub struct OrchestratorConnection {
    target: Target,
    client: reqwest::Client,
    service_url: String,
    token: String,
    node: String,
    environment: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl OrchestratorConnection {
    fn lost(&self, message: String) -> TransportError {
        TransportError::ConnectionLost {
            target: self.target.name.clone(),
            message,
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> TResult<T> {
        let response = request
            .header("X-Authentication", self.token.as_str())
            .send()
            .await
            .map_err(|e| TransportError::Connection {
                target: self.target.name.clone(),
                message: format!("Orchestrator request failed: {}", e),
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Authentication {
                target: self.target.name.clone(),
                message: format!("Orchestrator rejected the token ({})", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Execution(format!(
                "Orchestrator returned {}: {}",
                status, body
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| self.lost(format!("Malformed orchestrator response: {}", e)))
    }

    /// Submit a task job for this node and wait for its result
    async fn run_task(&self, task: &str, params: &Map<String, Value>, noop: bool) -> TResult<NodeResult> {
        let body = json!({
            "environment": self.environment,
            "task": task,
            "params": params,
            "noop": noop,
            "scope": { "nodes": [self.node] },
        });
        let submitted: SubmitResponse = self
            .request(
                self.client
                    .post(format!("{}/orchestrator/v1/command/task", self.service_url))
                    .json(&body),
            )
            .await?;
        info!("Submitted job {} for {}", submitted.job.name, self.target);

        let job_url = format!("{}/orchestrator/v1/jobs/{}", self.service_url, submitted.job.name);
        let started = Instant::now();
        loop {
            let status: JobStatus = self.request(self.client.get(job_url.as_str())).await?;
            debug!("Job {} is {}", submitted.job.id, status.state);
            if matches!(status.state.as_str(), "finished" | "failed" | "stopped") {
                break;
            }
            if started.elapsed() >= self.poll_timeout {
                return Err(TransportError::Timeout {
                    seconds: self.poll_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let nodes: NodeList = self
            .request(self.client.get(format!("{}/nodes", job_url)))
            .await?;
        nodes
            .items
            .into_iter()
            .find(|n| n.name == self.node)
            .ok_or_else(|| {
                TransportError::Execution(format!(
                    "Job {} has no result for node {}",
                    submitted.job.name, self.node
                ))
            })
    }
}

/// Task payload for one node; a failed node gets a non-zero exit code
fn task_payload(node: NodeResult) -> Payload {
    let failed = node.state != "finished";
    let message = node
        .result
        .pointer("/_error/msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Payload::Task {
        value: node.result,
        output: CommandOutput {
            exit_code: if failed { 1 } else { 0 },
            stderr: message,
            ..Default::default()
        },
    }
}

fn command_payload(node: NodeResult) -> Payload {
    let field = |key: &str| {
        node.result
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let exit_code = node
        .result
        .get("exit_code")
        .and_then(Value::as_i64)
        .map(|c| c as i32)
        .unwrap_or(if node.state == "finished" { 0 } else { 1 });
    Payload::Command(CommandOutput {
        stdout: field("stdout"),
        stderr: field("stderr"),
        exit_code,
        ..Default::default()
    })
}

#[async_trait]
impl Connection for OrchestratorConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run(&mut self, action: &Action, options: &RunOptions) -> TResult<Payload> {
        match action {
            Action::Task { task, params } => {
                let node = self.run_task(&task.name, params, options.noop).await?;
                Ok(task_payload(node))
            }
            Action::Command { command, env } => {
                let mut params = Map::new();
                params.insert("command".to_string(), Value::from(command.clone()));
                if !env.is_empty() {
                    params.insert("env".to_string(), json!(env));
                }
                let node = self.run_task(COMMAND_TASK, &params, false).await?;
                Ok(command_payload(node))
            }
            other => Err(unsupported(TransportKind::Orchestrator, other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(state: &str, result: Value) -> NodeResult {
        NodeResult {
            name: "web1".to_string(),
            state: state.to_string(),
            result,
        }
    }

    #[test]
    fn test_failed_node_becomes_failed_task() {
        let payload = task_payload(node("failed", json!({"_error": {"msg": "no such package"}})));
        let Payload::Task { output, .. } = payload else {
            panic!("expected task payload");
        };
        assert_eq!(output.exit_code, 1);
        assert_eq!(output.stderr, "no such package");
    }

    #[test]
    fn test_command_result_fields() {
        let payload = command_payload(node(
            "finished",
            json!({"stdout": "up 3 days", "stderr": "", "exit_code": 0}),
        ));
        assert!(matches!(payload, Payload::Command(o) if o.stdout == "up 3 days" && o.success()));
    }

    #[test]
    fn test_supported_actions() {
        let transport = OrchestratorTransport::new(TransportConfig::new(), Path::new("."));
        assert!(transport.supports(ActionKind::Task));
        assert!(transport.supports(ActionKind::Command));
        assert!(!transport.supports(ActionKind::Upload));
        assert!(!transport.supports(ActionKind::Script));
    }

    #[tokio::test]
    async fn test_missing_service_url_is_connection_error() {
        let transport = OrchestratorTransport::new(TransportConfig::new(), Path::new("."));
        let target = Target::parse("pcp://web1", TransportKind::Orchestrator).unwrap();
        let result = transport.connect(&target).await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
    }
}
