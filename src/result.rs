//! Per-target results and the ResultSet aggregate

use crate::error::{Result, TetherError, TransportError};
use crate::models::{ActionKind, CommandOutput, TransferredFile};
use crate::target::Target;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Failure taxonomy for a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Execution,
    Timeout,
    UnsupportedAction,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Connection => "connection",
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::UnsupportedAction => "unsupported_action",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Typed failure with whatever output was captured before it happened
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub partial: Option<CommandOutput>,
}

/// Success payload, shaped by the action that produced it
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandOutput),
    Task { value: Value, output: CommandOutput },
    Transfer(Vec<TransferredFile>),
    Value(Value),
    Noop { description: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Payload),
    Failure(Failure),
}

/// Outcome of one action on one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResult {
    pub target: Target,
    pub action: ActionKind,
    pub outcome: Outcome,
}

impl TargetResult {
    pub fn success(target: Target, action: ActionKind, payload: Payload) -> Self {
        Self {
            target,
            action,
            outcome: Outcome::Success(payload),
        }
    }

    pub fn failure(
        target: Target,
        action: ActionKind,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target,
            action,
            outcome: Outcome::Failure(Failure {
                kind,
                message: message.into(),
                partial: None,
            }),
        }
    }

    /// Classify what a transport returned; non-zero exits become failures
    pub fn from_payload(target: Target, action: ActionKind, payload: Payload) -> Self {
        let failed = match &payload {
            Payload::Command(output) if !output.success() => Some((
                format!(
                    "The command failed with exit code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
                output.clone(),
            )),
            Payload::Task { value, output } if !output.success() => {
                let message = value
                    .pointer("/_error/msg")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!(
                            "The task failed with exit code {}: {}",
                            output.exit_code,
                            output.stderr.trim()
                        )
                    });
                Some((message, output.clone()))
            }
            _ => None,
        };

        match failed {
            Some((message, partial)) => Self {
                target,
                action,
                outcome: Outcome::Failure(Failure {
                    kind: FailureKind::Execution,
                    message: message.trim_end_matches(": ").to_string(),
                    partial: Some(partial),
                }),
            },
            None => Self::success(target, action, payload),
        }
    }

    pub fn from_transport_error(target: Target, action: ActionKind, err: &TransportError) -> Self {
        let kind = match err {
            TransportError::Connection { .. }
            | TransportError::Authentication { .. }
            | TransportError::ConnectionLost { .. } => FailureKind::Connection,
            TransportError::Execution(_) | TransportError::Io(_) => FailureKind::Execution,
            TransportError::Timeout { .. } => FailureKind::Timeout,
            TransportError::Unsupported { .. } => FailureKind::UnsupportedAction,
        };
        Self::failure(target, action, kind, err.to_string())
    }

    pub fn ok(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn failure_detail(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Failure(failure) => Some(failure),
            Outcome::Success(_) => None,
        }
    }

    /// Error message, when the result is a failure
    pub fn message(&self) -> Option<&str> {
        self.failure_detail().map(|f| f.message.as_str())
    }

    /// Structured value of the result, as plans and JSON output see it
    pub fn value(&self) -> Value {
        match &self.outcome {
            Outcome::Success(Payload::Command(output)) => output_value(output),
            Outcome::Success(Payload::Task { value, .. }) => value.clone(),
            Outcome::Success(Payload::Transfer(files)) => json!({ "files": files }),
            Outcome::Success(Payload::Value(value)) => value.clone(),
            Outcome::Success(Payload::Noop { description }) => {
                json!({ "_noop": true, "_output": description })
            }
            Outcome::Failure(failure) => {
                let mut error = Map::new();
                error.insert("kind".to_string(), json!(failure.kind));
                error.insert("msg".to_string(), json!(failure.message));
                if let Some(partial) = &failure.partial {
                    error.insert("details".to_string(), output_value(partial));
                }
                json!({ "_error": error })
            }
        }
    }
}

fn output_value(output: &CommandOutput) -> Value {
    json!({
        "stdout": output.stdout,
        "stderr": output.stderr,
        "exit_code": output.exit_code,
    })
}

impl Serialize for TargetResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TargetResult", 4)?;
        state.serialize_field("target", &self.target.name)?;
        state.serialize_field("action", &self.action)?;
        state.serialize_field("status", if self.ok() { "success" } else { "failure" })?;
        state.serialize_field("value", &self.value())?;
        state.end()
    }
}

/// The three target views every ResultSet exposes, in dispatch order
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub success: Vec<Target>,
    pub failure: Vec<Target>,
    pub all: Vec<Target>,
}

/// Ordered results of one action across a target list
///
/// Holds exactly one result per target, in the order targets were given.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultSet {
    results: Vec<TargetResult>,
}

impl ResultSet {
    pub fn new(results: Vec<TargetResult>) -> Result<Self> {
        let mut set = Self::default();
        for result in results {
            set.push(result)?;
        }
        Ok(set)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a result; a second result for the same target is an error
    pub fn push(&mut self, result: TargetResult) -> Result<()> {
        if self.get(&result.target.name).is_some() {
            return Err(TetherError::DuplicateTarget(result.target.name));
        }
        self.results.push(result);
        Ok(())
    }

    /// Join two sets from one logical dispatch
    pub fn concat(mut self, other: ResultSet) -> Result<Self> {
        let names: HashSet<&str> = self.results.iter().map(|r| r.target.name.as_str()).collect();
        if let Some(dup) = other
            .results
            .iter()
            .find(|r| names.contains(r.target.name.as_str()))
        {
            return Err(TetherError::DuplicateTarget(dup.target.name.clone()));
        }
        self.results.extend(other.results);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetResult> {
        self.results.iter()
    }

    pub fn get(&self, name: &str) -> Option<&TargetResult> {
        self.results.iter().find(|r| r.target.name == name)
    }

    pub fn first(&self) -> Option<&TargetResult> {
        self.results.first()
    }

    /// True when no target failed
    pub fn ok(&self) -> bool {
        self.results.iter().all(TargetResult::ok)
    }

    pub fn ok_set(&self) -> ResultSet {
        Self {
            results: self.results.iter().filter(|r| r.ok()).cloned().collect(),
        }
    }

    pub fn error_set(&self) -> ResultSet {
        Self {
            results: self.results.iter().filter(|r| !r.ok()).cloned().collect(),
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        self.results.iter().map(|r| r.target.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.results.iter().map(|r| r.target.name.clone()).collect()
    }

    pub fn partition(&self) -> Partition {
        let mut success = Vec::new();
        let mut failure = Vec::new();
        for result in &self.results {
            if result.ok() {
                success.push(result.target.clone());
            } else {
                failure.push(result.target.clone());
            }
        }
        Partition {
            success,
            failure,
            all: self.targets(),
        }
    }
}

impl IntoIterator for ResultSet {
    type Item = TargetResult;
    type IntoIter = std::vec::IntoIter<TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a TargetResult;
    type IntoIter = std::slice::Iter<'a, TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TransportKind;

    fn target(name: &str) -> Target {
        Target::parse(name, TransportKind::Ssh).unwrap()
    }

    fn command_result(name: &str, exit_code: i32) -> TargetResult {
        TargetResult::from_payload(
            target(name),
            ActionKind::Command,
            Payload::Command(CommandOutput {
                stdout: "out".to_string(),
                stderr: "boom".to_string(),
                exit_code,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_nonzero_exit_is_execution_failure() {
        let result = command_result("web1", 2);
        assert!(!result.ok());
        let failure = result.failure_detail().unwrap();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.contains("exit code 2"));
        assert_eq!(failure.partial.as_ref().unwrap().stdout, "out");
    }

    #[test]
    fn test_task_error_message_from_value() {
        let result = TargetResult::from_payload(
            target("web1"),
            ActionKind::Task,
            Payload::Task {
                value: json!({"_error": {"msg": "package not found"}}),
                output: CommandOutput {
                    exit_code: 1,
                    ..Default::default()
                },
            },
        );
        assert_eq!(result.message(), Some("package not found"));
    }

    #[test]
    fn test_partition_is_disjoint_and_ordered() {
        let set = ResultSet::new(vec![
            command_result("a", 0),
            command_result("b", 1),
            command_result("c", 0),
        ])
        .unwrap();
        let partition = set.partition();
        let names = |ts: &[Target]| ts.iter().map(|t| t.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&partition.success), vec!["a", "c"]);
        assert_eq!(names(&partition.failure), vec!["b"]);
        assert_eq!(names(&partition.all), vec!["a", "b", "c"]);
        assert!(!set.ok());
        assert_eq!(set.ok_set().len(), 2);
        assert_eq!(set.error_set().names(), vec!["b"]);
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let result = ResultSet::new(vec![command_result("a", 0), command_result("a", 0)]);
        assert!(matches!(result, Err(TetherError::DuplicateTarget(n)) if n == "a"));
    }

    #[test]
    fn test_concat_preserves_order_and_uniqueness() {
        let left = ResultSet::new(vec![command_result("a", 0)]).unwrap();
        let right = ResultSet::new(vec![command_result("b", 1)]).unwrap();
        let joined = left.clone().concat(right).unwrap();
        assert_eq!(joined.names(), vec!["a", "b"]);

        let dup = ResultSet::new(vec![command_result("a", 1)]).unwrap();
        assert!(matches!(
            left.concat(dup),
            Err(TetherError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn test_serialize_result() {
        let set = ResultSet::new(vec![command_result("a", 0)]).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json[0]["target"], "a");
        assert_eq!(json[0]["status"], "success");
        assert_eq!(json[0]["value"]["stdout"], "out");
    }

    #[test]
    fn test_transport_error_mapping() {
        let err = TransportError::Timeout { seconds: 5 };
        let result = TargetResult::from_transport_error(target("a"), ActionKind::Command, &err);
        assert_eq!(result.failure_detail().unwrap().kind, FailureKind::Timeout);
    }
}
