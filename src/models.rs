//! Core data models for Tether actions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// Input validation limits
pub const MAX_PLAN_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_STEP_COUNT: usize = 1_000;
pub const MAX_STEP_NAME_LEN: usize = 64;
pub const MAX_COMMAND_LEN: usize = 131_072; // 128 KB
pub const MAX_ARG_COUNT: usize = 256;
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB
pub const MAX_CONCURRENCY: usize = 100;
pub const MIN_CONCURRENCY: usize = 1;

/// One unit of work, independent of the target it runs on
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command {
        command: String,
        env: BTreeMap<String, String>,
    },
    Script {
        path: PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Task {
        task: TaskSpec,
        params: Map<String, Value>,
    },
    Upload {
        source: PathBuf,
        destination: String,
    },
    Download {
        source: String,
        destination: PathBuf,
    },
    Apply {
        catalog: Vec<Value>,
    },
}

impl Action {
    pub fn command(command: impl Into<String>) -> Self {
        Action::Command {
            command: command.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Command { .. } => ActionKind::Command,
            Action::Script { .. } => ActionKind::Script,
            Action::Task { .. } => ActionKind::Task,
            Action::Upload { .. } => ActionKind::Upload,
            Action::Download { .. } => ActionKind::Download,
            Action::Apply { .. } => ActionKind::Apply,
        }
    }

    /// Short human description used for log spans and no-op reports
    pub fn describe(&self) -> String {
        match self {
            Action::Command { command, .. } => format!("command '{}'", command),
            Action::Script { path, args, .. } => {
                format!("script {} {}", path.display(), args.join(" "))
                    .trim_end()
                    .to_string()
            }
            Action::Task { task, .. } => format!("task {}", task.name),
            Action::Upload {
                source,
                destination,
            } => format!("upload {} to {}", source.display(), destination),
            Action::Download {
                source,
                destination,
            } => format!("download {} to {}", source, destination.display()),
            Action::Apply { catalog } => format!("apply {} resources", catalog.len()),
        }
    }
}

/// Action discriminant, used for capability checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Script,
    Task,
    Upload,
    Download,
    Apply,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Command => "command",
            ActionKind::Script => "script",
            ActionKind::Task => "task",
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::Apply => "apply",
        };
        f.write_str(s)
    }
}

/// How a task receives its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    Stdin,
    Environment,
    #[default]
    Both,
}

/// Task metadata from the optional `<task>.json` sidecar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_method: InputMethod,
    #[serde(default)]
    pub supports_noop: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// A task located on disk, ready to be shipped to targets
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub executable: PathBuf,
    pub metadata: TaskMetadata,
}

impl TaskSpec {
    /// File name of the executable as it lands in the remote temp dir
    pub fn file_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "task".to_string())
    }
}

/// Captured output of a command, script or task run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One file moved by an upload or download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferredFile {
    pub source: String,
    pub destination: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_display() {
        assert_eq!(ActionKind::Command.to_string(), "command");
        assert_eq!(ActionKind::Download.to_string(), "download");
        assert_eq!(Action::command("uptime").kind(), ActionKind::Command);
    }

    #[test]
    fn test_describe_script_without_args() {
        let action = Action::Script {
            path: PathBuf::from("scripts/check.sh"),
            args: vec![],
            env: BTreeMap::new(),
        };
        assert_eq!(action.describe(), "script scripts/check.sh");
    }

    #[test]
    fn test_task_metadata_defaults() {
        let metadata: TaskMetadata = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(metadata.input_method, InputMethod::Both);
        assert!(!metadata.supports_noop);
    }

    #[test]
    fn test_input_method_serde() {
        let method: InputMethod = serde_json::from_str(r#""environment""#).unwrap();
        assert_eq!(method, InputMethod::Environment);
    }
}
