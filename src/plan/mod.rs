//! Plans: ordered steps run by a sequential interpreter
//!
//! A plan is loaded from YAML ([`parser`]), its parameters are bound into a
//! fresh [`Scope`](scope::Scope), and the [`interpreter`] walks the steps one
//! at a time, dispatching actions and evaluating expressions until the plan
//! returns or halts on a failed step.

pub mod apply;
pub mod expr;
pub mod interpreter;
pub mod parser;
pub mod scope;
pub mod value;

use crate::result::ResultSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use value::{ParamType, PlanValue};

/// One declared plan parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDecl {
    pub ty: ParamType,
    pub description: Option<String>,
    pub default: Option<Value>,
}

/// Parsed plan definition
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: BTreeMap<String, ParameterDecl>,
    pub steps: Vec<Step>,
    /// Raw return value; resolved against the final scope
    pub returns: Option<Value>,
}

/// A step with the fields shared by every kind
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Bind failures and continue instead of halting
    pub catch_errors: bool,
    pub kind: StepKind,
}

/// Step kinds; field values are raw and resolved against scope at run time
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Command {
        command: Value,
        targets: Value,
        env_vars: Option<Value>,
    },
    Script {
        script: Value,
        targets: Value,
        arguments: Option<Value>,
        env_vars: Option<Value>,
    },
    Task {
        task: Value,
        targets: Value,
        parameters: Option<Value>,
    },
    Upload {
        source: Value,
        destination: Value,
        targets: Value,
    },
    Download {
        source: Value,
        destination: Value,
        targets: Value,
    },
    Plan {
        plan: String,
        parameters: Option<Value>,
    },
    Eval {
        expression: Value,
    },
    Message {
        message: Value,
    },
    Resources {
        resources: Value,
        targets: Value,
    },
}

impl StepKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            StepKind::Command { .. } => "command",
            StepKind::Script { .. } => "script",
            StepKind::Task { .. } => "task",
            StepKind::Upload { .. } => "upload",
            StepKind::Download { .. } => "download",
            StepKind::Plan { .. } => "plan",
            StepKind::Eval { .. } => "eval",
            StepKind::Message { .. } => "message",
            StepKind::Resources { .. } => "resources",
        }
    }
}

impl Step {
    /// Label used in logs and failure reports
    pub fn label(&self, index: usize) -> String {
        match (&self.name, &self.description) {
            (Some(name), _) => name.clone(),
            (None, Some(description)) => description.clone(),
            (None, None) => format!("{} step {}", self.kind.keyword(), index + 1),
        }
    }
}

/// Why a plan stopped
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// A dispatching step produced failing targets
    Targets(ResultSet),
    /// A nested plan halted
    Nested(Box<PlanFailure>),
    /// The step could not run at all
    Error(String),
}

/// The halted state's payload: which step failed and the full detail
#[derive(Debug, Clone, PartialEq)]
pub struct PlanFailure {
    pub plan: String,
    pub step: String,
    pub cause: FailureCause,
}

impl PlanFailure {
    /// The ResultSet that halted the plan, looking through nested plans
    pub fn result_set(&self) -> Option<&ResultSet> {
        match &self.cause {
            FailureCause::Targets(set) => Some(set),
            FailureCause::Nested(inner) => inner.result_set(),
            FailureCause::Error(_) => None,
        }
    }

    /// Failure detail as a plan value, bound when a step catches errors
    pub fn to_value(&self) -> PlanValue {
        match &self.cause {
            FailureCause::Targets(set) => PlanValue::ResultSet(set.clone()),
            _ => PlanValue::Data(serde_json::json!({
                "_error": {
                    "kind": "plan_failure",
                    "msg": self.to_string(),
                }
            })),
        }
    }
}

impl fmt::Display for PlanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plan '{}' failed at step '{}': ", self.plan, self.step)?;
        match &self.cause {
            FailureCause::Targets(set) => {
                let failed = set.error_set();
                write!(f, "{} of {} targets failed", failed.len(), set.len())?;
                for result in &failed {
                    write!(
                        f,
                        "\n  {}: {}",
                        result.target,
                        result.message().unwrap_or("failed")
                    )?;
                }
                Ok(())
            }
            FailureCause::Nested(inner) => write!(f, "{}", inner),
            FailureCause::Error(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for PlanFailure {}

/// Terminal state of a plan run
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Returned(PlanValue),
    Halted(PlanFailure),
}

impl PlanOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, PlanOutcome::Returned(_))
    }
}

/// Summary of a plan for `plan show`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: BTreeMap<String, ParameterInfo>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterInfo {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PlanDefinition {
    pub fn info(&self) -> PlanInfo {
        PlanInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self
                .parameters
                .iter()
                .map(|(name, decl)| {
                    (
                        name.clone(),
                        ParameterInfo {
                            ty: decl.ty.to_string(),
                            description: decl.description.clone(),
                            default: decl.default.clone(),
                        },
                    )
                })
                .collect(),
            steps: self
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| format!("{}: {}", step.kind.keyword(), step.label(i)))
                .collect(),
        }
    }
}
