//! Targets and their resolved transport options

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// The fixed set of transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
    Winrm,
    Local,
    Docker,
    Remote,
    #[serde(rename = "pcp")]
    Orchestrator,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Ssh,
        TransportKind::Winrm,
        TransportKind::Local,
        TransportKind::Docker,
        TransportKind::Remote,
        TransportKind::Orchestrator,
    ];

    /// URI scheme and config table name
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Winrm => "winrm",
            TransportKind::Local => "local",
            TransportKind::Docker => "docker",
            TransportKind::Remote => "remote",
            TransportKind::Orchestrator => "pcp",
        }
    }

    /// Look up a transport by its URI scheme
    pub fn from_scheme(scheme: &str) -> Result<Self> {
        TransportKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == scheme.to_lowercase())
            .ok_or_else(|| TetherError::UnknownTransport(scheme.to_string()))
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved option name -> value map for one transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportConfig(Map<String, Value>);

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Overlay `other` on top of `self`; explicit values win over defaults
    pub fn merge(&mut self, other: &TransportConfig) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// One addressable endpoint
///
/// Targets are value objects. The transport never mutates them; facts and
/// features are updated only by the inventory on behalf of the plan layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub name: String,
    pub uri: String,
    pub transport: TransportKind,
    #[serde(skip_serializing)]
    pub config: TransportConfig,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub features: BTreeSet<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub facts: Map<String, Value>,
}

impl Target {
    /// Parse a target URI such as `ssh://deploy@web1:2222` or `web1`
    ///
    /// Scheme-less names use `default_transport`, except `localhost` which
    /// always runs locally.
    pub fn parse(uri: &str, default_transport: TransportKind) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(TetherError::Validation(
                "Target name cannot be empty".to_string(),
            ));
        }

        let (transport, full) = match uri.split_once("://") {
            Some((scheme, _)) => (TransportKind::from_scheme(scheme)?, uri.to_string()),
            None if uri == "localhost" => (TransportKind::Local, format!("local://{}", uri)),
            None => (default_transport, format!("{}://{}", default_transport, uri)),
        };

        let parsed = url::Url::parse(&full)
            .map_err(|e| TetherError::Validation(format!("Invalid target '{}': {}", uri, e)))?;

        let mut config = TransportConfig::new();
        let host = parsed.host_str().unwrap_or_default();
        if !host.is_empty() {
            config.insert("host", host);
        } else if transport != TransportKind::Local {
            return Err(TetherError::Validation(format!(
                "Target '{}' has no host",
                uri
            )));
        }
        if let Some(port) = parsed.port() {
            config.insert("port", port);
        }
        if !parsed.username().is_empty() {
            config.insert("user", parsed.username());
        }
        if let Some(password) = parsed.password() {
            config.insert("password", password);
        }

        Ok(Self {
            name: uri.to_string(),
            uri: full,
            transport,
            config,
            features: BTreeSet::new(),
            facts: Map::new(),
        })
    }

    pub fn host(&self) -> Option<&str> {
        self.config.get_str("host")
    }

    pub fn port(&self) -> Option<u16> {
        self.config.get_u64("port").and_then(|p| u16::try_from(p).ok())
    }

    pub fn user(&self) -> Option<&str> {
        self.config.get_str("user")
    }

    pub fn password(&self) -> Option<&str> {
        self.config.get_str("password")
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Structured view used by plan expressions and task metadata
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::from(self.name.clone()));
        map.insert("uri".to_string(), Value::from(self.uri.clone()));
        map.insert("transport".to_string(), Value::from(self.transport.as_str()));
        for key in ["host", "port", "user"] {
            if let Some(value) = self.config.get(key) {
                map.insert(key.to_string(), value.clone());
            }
        }
        map.insert("facts".to_string(), Value::Object(self.facts.clone()));
        map.insert(
            "features".to_string(),
            Value::Array(self.features.iter().cloned().map(Value::from).collect()),
        );
        Value::Object(map)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
