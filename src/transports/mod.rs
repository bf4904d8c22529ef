//! Transports: one implementation per wire protocol

pub mod docker;
pub mod exec;
pub mod local;
pub mod orchestrator;
pub mod remote;
pub mod ssh;
pub mod winrm;

use crate::config::ProjectConfig;
use crate::error::{Result, TetherError, TransportError};
use crate::models::{Action, ActionKind, MAX_OUTPUT_SIZE};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Per-run flags passed from the dispatcher to a connection
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub noop: bool,
}

/// A live session bound to exactly one target
#[async_trait]
pub trait Connection: Send {
    fn target(&self) -> &Target;

    /// False once the session is known to be unusable
    fn is_alive(&self) -> bool {
        true
    }

    async fn run(&mut self, action: &Action, options: &RunOptions)
        -> std::result::Result<Payload, TransportError>;

    /// Cheap liveness check before a pooled connection is reused
    async fn ping(&mut self) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    /// Must not wait on work abandoned by a timed-out or cancelled run
    async fn close(self: Box<Self>) {}
}

/// Protocol implementation: connect / run / disconnect
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether this transport can run the given action kind
    fn supports(&self, action: ActionKind) -> bool;

    async fn connect(&self, target: &Target)
        -> std::result::Result<Box<dyn Connection>, TransportError>;

    async fn run(
        &self,
        connection: &mut dyn Connection,
        action: &Action,
        options: &RunOptions,
    ) -> std::result::Result<Payload, TransportError> {
        if !self.supports(action.kind()) {
            return Err(unsupported(self.kind(), action.kind()));
        }
        connection.run(action, options).await
    }

    async fn disconnect(&self, connection: Box<dyn Connection>) {
        connection.close().await;
    }
}

pub(crate) fn unsupported(kind: TransportKind, action: ActionKind) -> TransportError {
    TransportError::Unsupported {
        transport: kind.to_string(),
        action: action.to_string(),
    }
}

/// Value type accepted by a transport option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Integer,
    Boolean,
    Array,
    Hash,
}

impl OptionType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            OptionType::String => value.is_string(),
            OptionType::Integer => value.is_u64(),
            OptionType::Boolean => value.is_boolean(),
            OptionType::Array => value.is_array(),
            OptionType::Hash => value.is_object(),
        }
    }
}

/// One entry of a transport's option schema
///
/// `external` options must be known when the connection is opened; the rest
/// are informational and only read while running actions.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub ty: OptionType,
    pub external: bool,
}

pub(crate) const fn opt(name: &'static str, ty: OptionType, external: bool) -> OptionSpec {
    OptionSpec { name, ty, external }
}

/// Option schema for a transport kind
pub fn schema(kind: TransportKind) -> &'static [OptionSpec] {
    match kind {
        TransportKind::Ssh => ssh::OPTIONS,
        TransportKind::Winrm => winrm::OPTIONS,
        TransportKind::Local => local::OPTIONS,
        TransportKind::Docker => docker::OPTIONS,
        TransportKind::Remote => remote::OPTIONS,
        TransportKind::Orchestrator => orchestrator::OPTIONS,
    }
}

/// Built-in defaults layered under every explicit value
pub fn default_options(kind: TransportKind) -> TransportConfig {
    match kind {
        TransportKind::Ssh => ssh::defaults(),
        TransportKind::Winrm => winrm::defaults(),
        TransportKind::Local => local::defaults(),
        TransportKind::Docker => docker::defaults(),
        TransportKind::Remote => remote::defaults(),
        TransportKind::Orchestrator => orchestrator::defaults(),
    }
}

/// Check a resolved option set against the transport's schema
///
/// The remote transport forwards unknown options to the proxied task, so it
/// is the only one that accepts keys outside its schema.
pub fn validate_options(kind: TransportKind, config: &TransportConfig) -> Result<()> {
    let specs = schema(kind);
    for (key, value) in config.iter() {
        match specs.iter().find(|spec| spec.name == key) {
            Some(spec) if !spec.ty.accepts(value) => {
                return Err(TetherError::InvalidOption {
                    transport: kind.to_string(),
                    option: key.clone(),
                    reason: format!("expected {:?}, got {}", spec.ty, value),
                });
            }
            Some(_) => {}
            None if kind == TransportKind::Remote => {}
            None => {
                return Err(TetherError::InvalidOption {
                    transport: kind.to_string(),
                    option: key.clone(),
                    reason: "unknown option".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Defaults for `kind` overlaid with the target's own options
pub(crate) fn effective_config(defaults: &TransportConfig, target: &Target) -> TransportConfig {
    let mut config = defaults.clone();
    config.merge(&target.config);
    config
}

/// Fixed table of transport implementations, one per kind
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Build every transport from the project configuration
    pub fn new(config: &ProjectConfig, project_root: &Path) -> Self {
        let local: Arc<local::LocalTransport> = Arc::new(local::LocalTransport::new(
            config.transport_options(TransportKind::Local),
            project_root,
        ));
        let ssh: Arc<ssh::SshTransport> = Arc::new(ssh::SshTransport::new(
            config.transport_options(TransportKind::Ssh),
            project_root,
        ));

        let mut registry = Self::empty();
        registry.register(local.clone());
        registry.register(ssh.clone());
        registry.register(Arc::new(winrm::WinrmTransport::new(
            config.transport_options(TransportKind::Winrm),
            project_root,
        )));
        registry.register(Arc::new(docker::DockerTransport::new(
            config.transport_options(TransportKind::Docker),
            project_root,
        )));
        registry.register(Arc::new(remote::RemoteTransport::new(
            config.transport_options(TransportKind::Remote),
            local,
            ssh,
        )));
        registry.register(Arc::new(orchestrator::OrchestratorTransport::new(
            config.transport_options(TransportKind::Orchestrator),
            project_root,
        )));
        registry
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Install (or replace) the implementation for the transport's kind
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(&kind)
            .cloned()
            .ok_or_else(|| TetherError::UnknownTransport(kind.to_string()))
    }
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}
