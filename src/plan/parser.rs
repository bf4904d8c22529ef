//! YAML parser with validation for plan definitions

use super::value::ParamType;
use super::{ParameterDecl, PlanDefinition, Step, StepKind};
use crate::error::{Result, TetherError};
use crate::models::{MAX_PLAN_SIZE, MAX_STEP_COUNT, MAX_STEP_NAME_LEN};
use crate::tasks::is_valid_content_name;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, RawParameter>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default, rename = "return")]
    returns: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParameter {
    #[serde(default, rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    catch_errors: bool,
    targets: Option<Value>,

    command: Option<Value>,
    script: Option<Value>,
    task: Option<Value>,
    upload: Option<Value>,
    download: Option<Value>,
    plan: Option<String>,
    eval: Option<Value>,
    message: Option<Value>,
    resources: Option<Value>,

    env_vars: Option<Value>,
    arguments: Option<Value>,
    parameters: Option<Value>,
    destination: Option<Value>,
}

/// Locates plan files inside a project directory
#[derive(Debug, Clone)]
pub struct PlanLoader {
    project_root: PathBuf,
}

impl PlanLoader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// `name` maps to `plans/<name>.yaml`; `mod::plan` maps to
    /// `modules/mod/plans/plan.yaml`
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_content_name(name) {
            return Err(TetherError::Validation(format!(
                "Invalid plan name '{}'",
                name
            )));
        }
        let mut segments = name.split("::");
        let first = segments.next().unwrap_or(name);
        let rest: Vec<&str> = segments.collect();

        let path = match rest.split_last() {
            None => self.project_root.join("plans").join(format!("{}.yaml", first)),
            Some((last, middle)) => {
                let mut dir = self.project_root.join("modules").join(first).join("plans");
                for segment in middle {
                    dir = dir.join(segment);
                }
                dir.join(format!("{}.yaml", last))
            }
        };
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<PlanDefinition> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(TetherError::PlanNotFound(name.to_string()));
        }
        parse_plan_file(name, &path)
    }
}

/// Parse a plan definition from a YAML file.
///
/// Enforces the plan limits before the content is parsed:
/// - file size must be <= 1MB
/// - step count must be <= 1,000
/// - step names must be identifiers and unique within the plan
///
/// # Arguments
///
/// * `name` - Plan name used in errors and failure reports
/// * `path` - Path to the YAML plan file
///
/// # Returns
///
/// * `Result<PlanDefinition>` - Parsed and validated plan
///
/// # Errors
///
/// * `TetherError::Io` - If the file cannot be read
/// * `TetherError::PlanSizeExceeded` - If the file exceeds 1MB
/// * `TetherError::StepCountExceeded` - If the plan has > 1,000 steps
/// * `TetherError::InvalidPlan` - If a step or parameter is malformed
///
/// # Example
///
/// ```no_run
/// use tether::plan::parser::parse_plan_file;
///
/// let plan = parse_plan_file("deploy", "plans/deploy.yaml")?;
/// println!("{} has {} steps", plan.name, plan.steps.len());
/// # Ok::<(), tether::error::TetherError>(())
/// ```
pub fn parse_plan_file<P: AsRef<Path>>(name: &str, path: P) -> Result<PlanDefinition> {
    let size = fs::metadata(path.as_ref())?.len();
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if size > MAX_PLAN_SIZE {
        return Err(TetherError::PlanSizeExceeded(size));
    }
    let content = fs::read_to_string(path)?;
    parse_plan_yaml(name, &content)
}

/// Parse a plan definition from a YAML string.
///
/// # Errors
///
/// See [`parse_plan_file`] for error conditions.
///
/// # Example
///
/// ```
/// use tether::plan::parser::parse_plan_yaml;
///
/// let yaml = r#"
/// parameters:
///   targets:
///     type: TargetSpec
/// steps:
///   - name: uptime
///     command: uptime
///     targets: $targets
/// return: $uptime
/// "#;
///
/// let plan = parse_plan_yaml("check", yaml)?;
/// assert_eq!(plan.steps.len(), 1);
/// # Ok::<(), tether::error::TetherError>(())
/// ```
pub fn parse_plan_yaml(name: &str, content: &str) -> Result<PlanDefinition> {
    if content.len() > MAX_PLAN_SIZE {
        return Err(TetherError::PlanSizeExceeded(content.len()));
    }

    let raw: RawPlan = serde_yaml::from_str(content).map_err(|e| invalid(name, e.to_string()))?;

    if raw.steps.len() > MAX_STEP_COUNT {
        return Err(TetherError::StepCountExceeded {
            count: raw.steps.len(),
            limit: MAX_STEP_COUNT,
        });
    }

    let mut parameters = BTreeMap::new();
    for (param, decl) in raw.parameters {
        if !is_identifier(&param) {
            return Err(invalid(name, format!("invalid parameter name '{}'", param)));
        }
        let ty = match decl.ty.as_deref() {
            Some(text) => ParamType::parse(text).map_err(|e| invalid(name, e.to_string()))?,
            None => ParamType::Any,
        };
        if let Some(default) = &decl.default {
            if !ty.matches(default) {
                return Err(invalid(
                    name,
                    format!("default for '{}' is not a {}", param, ty),
                ));
            }
        }
        parameters.insert(
            param,
            ParameterDecl {
                ty,
                description: decl.description,
                default: decl.default,
            },
        );
    }

    let mut seen_names = HashSet::with_capacity(raw.steps.len());
    let mut steps = Vec::with_capacity(raw.steps.len());
    for (index, raw_step) in raw.steps.into_iter().enumerate() {
        if let Some(step_name) = &raw_step.name {
            validate_step_name(name, step_name)?;
            if !seen_names.insert(step_name.clone()) {
                return Err(invalid(name, format!("duplicate step name '{}'", step_name)));
            }
        }
        steps.push(build_step(name, index, raw_step)?);
    }

    Ok(PlanDefinition {
        name: name.to_string(),
        description: raw.description,
        parameters,
        steps,
        returns: raw.returns,
    })
}

fn invalid(plan: &str, reason: impl Into<String>) -> TetherError {
    TetherError::InvalidPlan {
        plan: plan.to_string(),
        reason: reason.into(),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate step name format and length
fn validate_step_name(plan: &str, name: &str) -> Result<()> {
    if name.len() > MAX_STEP_NAME_LEN {
        return Err(invalid(
            plan,
            format!("step name '{}' exceeds {} characters", name, MAX_STEP_NAME_LEN),
        ));
    }
    if !is_identifier(name) {
        return Err(invalid(plan, format!("invalid step name '{}'", name)));
    }
    Ok(())
}

/// Turn a raw step into its kind, checking exactly one action key is present
/// and that the fields belong to that kind
fn build_step(plan: &str, index: usize, raw: RawStep) -> Result<Step> {
    let keys: Vec<&str> = [
        ("command", raw.command.is_some()),
        ("script", raw.script.is_some()),
        ("task", raw.task.is_some()),
        ("upload", raw.upload.is_some()),
        ("download", raw.download.is_some()),
        ("plan", raw.plan.is_some()),
        ("eval", raw.eval.is_some()),
        ("message", raw.message.is_some()),
        ("resources", raw.resources.is_some()),
    ]
    .into_iter()
    .filter_map(|(key, present)| present.then_some(key))
    .collect();

    let location = format!("step {}", index + 1);
    let keyword = match keys.as_slice() {
        [one] => *one,
        [] => return Err(invalid(plan, format!("{} has no action key", location))),
        many => {
            return Err(invalid(
                plan,
                format!("{} has several action keys: {}", location, many.join(", ")),
            ))
        }
    };

    let allowed: &[&str] = match keyword {
        "command" => &["targets", "env_vars"],
        "script" => &["targets", "arguments", "env_vars"],
        "task" => &["targets", "parameters"],
        "upload" | "download" => &["targets", "destination"],
        "plan" => &["parameters"],
        "resources" => &["targets"],
        _ => &[],
    };
    for (field, present) in [
        ("targets", raw.targets.is_some()),
        ("env_vars", raw.env_vars.is_some()),
        ("arguments", raw.arguments.is_some()),
        ("parameters", raw.parameters.is_some()),
        ("destination", raw.destination.is_some()),
    ] {
        if present && !allowed.contains(&field) {
            return Err(invalid(
                plan,
                format!("{} ({}) does not accept '{}'", location, keyword, field),
            ));
        }
    }

    let targets = |targets: Option<Value>| {
        targets.ok_or_else(|| invalid(plan, format!("{} ({}) needs 'targets'", location, keyword)))
    };
    let destination = |destination: Option<Value>| {
        destination
            .ok_or_else(|| invalid(plan, format!("{} ({}) needs 'destination'", location, keyword)))
    };

    let kind = match keyword {
        "command" => StepKind::Command {
            command: raw.command.unwrap_or_default(),
            targets: targets(raw.targets)?,
            env_vars: raw.env_vars,
        },
        "script" => StepKind::Script {
            script: raw.script.unwrap_or_default(),
            targets: targets(raw.targets)?,
            arguments: raw.arguments,
            env_vars: raw.env_vars,
        },
        "task" => StepKind::Task {
            task: raw.task.unwrap_or_default(),
            targets: targets(raw.targets)?,
            parameters: raw.parameters,
        },
        "upload" => StepKind::Upload {
            source: raw.upload.unwrap_or_default(),
            destination: destination(raw.destination)?,
            targets: targets(raw.targets)?,
        },
        "download" => StepKind::Download {
            source: raw.download.unwrap_or_default(),
            destination: destination(raw.destination)?,
            targets: targets(raw.targets)?,
        },
        "plan" => {
            let nested = raw.plan.unwrap_or_default();
            if !is_valid_content_name(&nested) {
                return Err(invalid(plan, format!("invalid plan name '{}'", nested)));
            }
            StepKind::Plan {
                plan: nested,
                parameters: raw.parameters,
            }
        }
        "eval" => StepKind::Eval {
            expression: raw.eval.unwrap_or_default(),
        },
        "message" => StepKind::Message {
            message: raw.message.unwrap_or_default(),
        },
        _ => StepKind::Resources {
            resources: raw.resources.unwrap_or_default(),
            targets: targets(raw.targets)?,
        },
    };

    Ok(Step {
        name: raw.name,
        description: raw.description,
        catch_errors: raw.catch_errors,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_plan() {
        let yaml = r#"
description: Deploy the app
parameters:
  targets:
    type: TargetSpec
  version:
    type: Optional[String]
    default: "1.0"
steps:
  - name: stop
    command: systemctl stop app
    targets: $targets
  - task: pkg::install
    targets: $targets
    parameters:
      version: $version
    catch_errors: true
  - upload: files/app.conf
    destination: /etc/app.conf
    targets: $targets
  - message: "done with ${$stop.count} targets"
return: $stop
"#;
        let plan = parse_plan_yaml("deploy", yaml).unwrap();
        assert_eq!(plan.description.as_deref(), Some("Deploy the app"));
        assert_eq!(plan.parameters["targets"].ty, ParamType::TargetSpec);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].name.as_deref(), Some("stop"));
        assert!(plan.steps[1].catch_errors);
        assert!(matches!(plan.steps[2].kind, StepKind::Upload { .. }));
        assert_eq!(plan.steps[3].kind.keyword(), "message");
        assert_eq!(plan.returns, Some(Value::from("$stop")));
    }

    #[test]
    fn test_plan_size_limit() {
        let large = "steps:\n".to_string() + &"  - message: x\n".repeat(80_000);
        assert!(matches!(
            parse_plan_yaml("big", &large),
            Err(TetherError::PlanSizeExceeded(_))
        ));
    }

    #[test]
    fn test_step_count_limit() {
        let yaml = "steps:\n".to_string() + &"  - message: x\n".repeat(MAX_STEP_COUNT + 1);
        assert!(matches!(
            parse_plan_yaml("many", &yaml),
            Err(TetherError::StepCountExceeded { .. })
        ));
    }

    #[test]
    fn test_step_name_rules() {
        let dup = "steps:\n  - name: a\n    eval: 1\n  - name: a\n    eval: 2\n";
        assert!(matches!(
            parse_plan_yaml("p", dup),
            Err(TetherError::InvalidPlan { .. })
        ));
        let bad = "steps:\n  - name: 1st\n    eval: 1\n";
        assert!(parse_plan_yaml("p", bad).is_err());
        let long = format!("steps:\n  - name: {}\n    eval: 1\n", "a".repeat(65));
        assert!(parse_plan_yaml("p", &long).is_err());
    }

    #[test]
    fn test_action_key_rules() {
        let none = "steps:\n  - name: a\n";
        assert!(parse_plan_yaml("p", none).is_err());
        let two = "steps:\n  - command: ls\n    eval: 1\n    targets: all\n";
        assert!(parse_plan_yaml("p", two).is_err());
        let missing_targets = "steps:\n  - command: ls\n";
        assert!(parse_plan_yaml("p", missing_targets).is_err());
        let stray = "steps:\n  - eval: 1\n    targets: all\n";
        assert!(parse_plan_yaml("p", stray).is_err());
        let unknown = "steps:\n  - command: ls\n    targets: all\n    retries: 3\n";
        assert!(parse_plan_yaml("p", unknown).is_err());
    }

    #[test]
    fn test_parameter_rules() {
        let bad_type = "parameters:\n  x:\n    type: Widget\n";
        assert!(parse_plan_yaml("p", bad_type).is_err());
        let bad_default = "parameters:\n  x:\n    type: Integer\n    default: nope\n";
        assert!(parse_plan_yaml("p", bad_default).is_err());
        let untyped = parse_plan_yaml("p", "parameters:\n  x: {}\n").unwrap();
        assert_eq!(untyped.parameters["x"].ty, ParamType::Any);
    }

    #[test]
    fn test_loader_paths() {
        let dir = TempDir::new().unwrap();
        let loader = PlanLoader::new(dir.path());
        assert_eq!(
            loader.path_for("deploy").unwrap(),
            dir.path().join("plans/deploy.yaml")
        );
        assert_eq!(
            loader.path_for("app::deploy").unwrap(),
            dir.path().join("modules/app/plans/deploy.yaml")
        );
        assert!(matches!(
            loader.load("missing"),
            Err(TetherError::PlanNotFound(_))
        ));

        std::fs::create_dir_all(dir.path().join("plans")).unwrap();
        std::fs::write(dir.path().join("plans/deploy.yaml"), "steps: []\n").unwrap();
        assert_eq!(loader.load("deploy").unwrap().name, "deploy");
    }
}
