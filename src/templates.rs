//! Starter plans written by `tether plan new`

use crate::error::{Result, TetherError};
use crate::plan::parser::PlanLoader;
use crate::tasks::is_valid_content_name;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "minimal",
            description: "One message step, no parameters",
        },
        TemplateInfo {
            name: "command",
            description: "Run a command on a TargetSpec parameter and return the results",
        },
        TemplateInfo {
            name: "full",
            description: "Typed parameters, named results, catch_errors, eval and a return value",
        },
    ]
}

/// Returns the YAML for a template type with `{plan}` filled in.
pub fn render_template(template_type: &str, plan_name: &str) -> Option<String> {
    let raw = match template_type {
        "minimal" => TEMPLATE_MINIMAL,
        "command" => TEMPLATE_COMMAND,
        "full" => TEMPLATE_FULL,
        _ => return None,
    };
    Some(raw.replace("{plan}", plan_name))
}

/// Write a new plan file into the project, refusing to overwrite one
pub fn create_plan(project_root: &Path, plan_name: &str, template_type: &str) -> Result<PathBuf> {
    if !is_valid_content_name(plan_name) {
        return Err(TetherError::Validation(format!(
            "Invalid plan name '{}': use lowercase segments like 'deploy' or 'mymod::deploy'",
            plan_name
        )));
    }
    let content = render_template(template_type, plan_name).ok_or_else(|| {
        TetherError::Validation(format!("Unknown plan template '{}'", template_type))
    })?;

    let path = PlanLoader::new(project_root).path_for(plan_name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TetherError::Validation(format!(
                    "A plan already exists at {}. Remove it first or choose a different name.",
                    path.display()
                ))
            } else {
                e.into()
            }
        })?;
    file.write_all(content.as_bytes())?;
    info!("Created plan {} at {}", plan_name, path.display());
    Ok(path)
}

const TEMPLATE_MINIMAL: &str = r#"# Plan {plan}
description: "{plan}: a minimal plan"

steps:
  - message: "Hello from {plan}"
"#;

const TEMPLATE_COMMAND: &str = r#"# Plan {plan}
# Run with: tether plan run {plan} targets=web01,web02
description: "{plan}: run a command on the given targets"

parameters:
  targets:
    type: TargetSpec
    description: "Targets to run on"
  command:
    type: String
    default: "uptime"

steps:
  - name: ran
    command: $command
    targets: $targets

return: $ran
"#;

const TEMPLATE_FULL: &str = r#"# Plan {plan}
# Shows typed parameters, named results, tolerated failures and expressions.
description: "{plan}: check, act, and report"

parameters:
  targets:
    type: TargetSpec
    description: "Targets to operate on"
  service:
    type: String
    default: "sshd"
  retries:
    type: Optional[Integer]

steps:
  - name: probe
    description: "Check the service on every target"
    command: "systemctl is-active $service"
    targets: $targets
    catch_errors: true

  - name: down
    eval: $probe.error_set.names

  - message: "Restarting $service on ${$down.length} targets"

  - name: restarted
    command: "systemctl restart $service"
    targets: $probe.error_set
    env_vars:
      SERVICE: $service

  - name: summary
    eval: '$probe.ok_set.names.map |$n| { $n + ": active" }'

return:
  active: $summary
  restarted: $restarted.names
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parser::parse_plan_yaml;
    use tempfile::TempDir;

    #[test]
    fn test_list_templates() {
        let names: Vec<&str> = list_templates().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["minimal", "command", "full"]);
    }

    #[test]
    fn test_unknown_template() {
        assert!(render_template("nonexistent", "x").is_none());
    }

    #[test]
    fn test_all_templates_parse_as_plans() {
        for info in list_templates() {
            let content = render_template(info.name, "demo").unwrap();
            assert!(content.contains("demo"));
            let result = parse_plan_yaml("demo", &content);
            assert!(
                result.is_ok(),
                "template '{}' failed to parse: {:?}",
                info.name,
                result.err()
            );
        }
    }

    #[test]
    fn test_create_plan_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = create_plan(dir.path(), "site::deploy", "command").unwrap();
        assert_eq!(path, dir.path().join("modules/site/plans/deploy.yaml"));
        assert!(path.exists());

        let err = create_plan(dir.path(), "site::deploy", "minimal").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_create_plan_rejects_bad_name() {
        let dir = TempDir::new().unwrap();
        assert!(create_plan(dir.path(), "Deploy", "minimal").is_err());
    }
}
