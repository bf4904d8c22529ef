//! Remote proxy transport
//!
//! A remote target is an API endpoint that cannot run anything itself. Tasks
//! addressed to it run on the `run-on` proxy target instead, and receive the
//! remote target's options as the `_target` parameter.

use crate::error::TransportError;
use crate::models::{Action, ActionKind};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::local::LocalTransport;
use crate::transports::ssh::SshTransport;
use crate::transports::{
    effective_config, opt, unsupported, Connection, OptionSpec, OptionType, RunOptions, Transport,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

type TResult<T> = std::result::Result<T, TransportError>;

pub const OPTIONS: &[OptionSpec] = &[
    opt("run-on", OptionType::String, true),
    opt("host", OptionType::String, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("run-on", "localhost");
    config
}

pub struct RemoteTransport {
    defaults: TransportConfig,
    local: Arc<LocalTransport>,
    ssh: Arc<SshTransport>,
}

impl RemoteTransport {
    pub fn new(options: TransportConfig, local: Arc<LocalTransport>, ssh: Arc<SshTransport>) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self {
            defaults,
            local,
            ssh,
        }
    }

    fn proxy_for(&self, kind: TransportKind) -> Option<&dyn Transport> {
        match kind {
            TransportKind::Local => Some(self.local.as_ref()),
            TransportKind::Ssh => Some(self.ssh.as_ref()),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::Task
    }

    async fn connect(&self, target: &Target) -> TResult<Box<dyn Connection>> {
        let config = effective_config(&self.defaults, target);
        let run_on = config.get_str("run-on").unwrap_or("localhost").to_string();
        let proxy = Target::parse(&run_on, TransportKind::Ssh).map_err(|e| {
            TransportError::Connection {
                target: target.name.clone(),
                message: format!("Invalid run-on target {}: {}", run_on, e),
            }
        })?;
        let transport = self
            .proxy_for(proxy.transport)
            .ok_or_else(|| TransportError::Connection {
                target: target.name.clone(),
                message: format!("Cannot proxy through a {} target", proxy.transport),
            })?;

        debug!("Proxying {} through {}", target, proxy);
        let inner = transport.connect(&proxy).await?;

        let mut remote = config.as_map().clone();
        remote.remove("run-on");
        remote.insert("name".to_string(), Value::from(target.name.clone()));

        Ok(Box::new(RemoteConnection {
            target: target.clone(),
            inner,
            remote: Value::Object(remote),
        }))
    }
}

pub struct RemoteConnection {
    target: Target,
    inner: Box<dyn Connection>,
    remote: Value,
}

#[async_trait]
impl Connection for RemoteConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn run(&mut self, action: &Action, options: &RunOptions) -> TResult<Payload> {
        let Action::Task { task, params } = action else {
            return Err(unsupported(TransportKind::Remote, action.kind()));
        };
        let mut params = params.clone();
        params.insert("_target".to_string(), self.remote.clone());
        let proxied = Action::Task {
            task: task.clone(),
            params,
        };
        self.inner.run(&proxied, options).await
    }

    async fn ping(&mut self) -> TResult<()> {
        self.inner.ping().await
    }

    async fn close(self: Box<Self>) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskMetadata, TaskSpec};
    use serde_json::Map;
    use std::path::Path;
    use tempfile::TempDir;

    fn transport(dir: &TempDir) -> RemoteTransport {
        RemoteTransport::new(
            TransportConfig::new(),
            Arc::new(LocalTransport::new(TransportConfig::new(), dir.path())),
            Arc::new(SshTransport::new(TransportConfig::new(), Path::new("."))),
        )
    }

    #[tokio::test]
    async fn test_task_runs_on_proxy_with_target_param() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("api.sh");
        std::fs::write(&script, "#!/bin/sh\ncat\n").unwrap();

        let mut target = Target::parse("remote://api.example.com", TransportKind::Ssh).unwrap();
        target.config.insert("api-token", "s3cret");

        let transport = transport(&dir);
        let mut conn = transport.connect(&target).await.unwrap();
        let action = Action::Task {
            task: TaskSpec {
                name: "api".to_string(),
                executable: script,
                metadata: TaskMetadata::default(),
            },
            params: Map::new(),
        };
        let payload = transport
            .run(conn.as_mut(), &action, &RunOptions::default())
            .await
            .unwrap();
        let Payload::Task { value, .. } = payload else {
            panic!("expected task payload");
        };
        assert_eq!(value["_target"]["api-token"], "s3cret");
        assert_eq!(value["_target"]["host"], "api.example.com");
        assert_eq!(value["_target"]["name"], "remote://api.example.com");
    }

    #[tokio::test]
    async fn test_commands_are_unsupported() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir);
        let target = Target::parse("remote://api", TransportKind::Ssh).unwrap();
        let mut conn = transport.connect(&target).await.unwrap();
        let result = transport
            .run(conn.as_mut(), &Action::command("ls"), &RunOptions::default())
            .await;
        assert!(matches!(result, Err(TransportError::Unsupported { .. })));
    }
}
