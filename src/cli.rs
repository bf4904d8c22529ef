//! CLI interface for tether

use crate::config::{OutputFormat, ProjectConfig};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::TetherError;
use crate::inventory::{Inventory, TargetResolver};
use crate::logging::{init_logging, LogConfig};
use crate::models::Action;
use crate::plan::apply::DispatchApplier;
use crate::plan::interpreter::{ConsoleSink, LogSink, MessageSink, PlanRunner};
use crate::plan::parser::PlanLoader;
use crate::plan::{PlanInfo, PlanOutcome};
use crate::rerun::{RerunMode, RerunStore};
use crate::result::{ResultSet, TargetResult};
use crate::target::Target;
use crate::tasks::TaskLoader;
use crate::templates;
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// tether - run commands, scripts, tasks and plans across many targets
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run commands, scripts, tasks and plans across remote targets", long_about = None)]
pub struct Cli {
    /// Project directory holding tether-project.yaml, inventory, tasks and plans
    #[arg(long, default_value = ".", global = true)]
    pub project: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a shell command on targets
    Command {
        #[command(subcommand)]
        command: CommandCommands,
    },

    /// Upload and run a local script on targets
    Script {
        #[command(subcommand)]
        command: ScriptCommands,
    },

    /// Run a task from the project on targets
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Copy files to or from targets
    File {
        #[command(subcommand)]
        command: FileCommands,
    },

    /// Run, inspect and create plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },

    /// Inspect the inventory
    Inventory {
        #[command(subcommand)]
        command: InventoryCommands,
    },
}

/// Flags shared by every command that dispatches
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Target expression: URIs, names, groups, globs, @file or - for stdin
    #[arg(short, long)]
    pub targets: Option<String>,

    /// Select targets from the previous invocation's outcome
    #[arg(long, value_enum)]
    pub rerun: Option<RerunMode>,

    /// Maximum number of targets worked on at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Report what would change without changing it
    #[arg(long)]
    pub noop: bool,

    /// Per-target timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Output format for results
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Do not record this run for --rerun
    #[arg(long)]
    pub no_save_rerun: bool,
}

#[derive(Subcommand, Debug)]
pub enum CommandCommands {
    Run {
        /// Command line, run through the target's shell
        command: String,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScriptCommands {
    Run {
        /// Local script file
        script: PathBuf,
        /// Arguments passed to the script
        args: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    Run {
        /// Task name, e.g. `package` or `mymod::install`
        task: String,
        /// Parameters as key=value; values are parsed as JSON when possible
        params: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum FileCommands {
    Upload {
        /// Local file or directory
        source: PathBuf,
        /// Path on each target
        destination: String,
        #[command(flatten)]
        run: RunArgs,
    },
    Download {
        /// Path on each target
        source: String,
        /// Local directory; each target gets its own subdirectory
        destination: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlanCommands {
    /// Run a plan; -t/--rerun fill the `targets` parameter
    Run {
        plan: String,
        /// Parameters as key=value; values are parsed as JSON when possible
        params: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show a plan's parameters and steps
    Show {
        plan: String,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Create a plan from a template
    New {
        plan: String,
        #[arg(long = "type", value_enum, default_value = "minimal")]
        template: TemplateType,
    },
}

#[derive(Subcommand, Debug)]
pub enum InventoryCommands {
    /// List the targets an expression resolves to
    Show {
        /// Target expression; all targets when omitted
        #[arg(short, long)]
        targets: Option<String>,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

/// Available template types for `plan new`.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TemplateType {
    /// One message step
    Minimal,
    /// A command over a TargetSpec parameter
    Command,
    /// Parameters, named results, catch_errors and a return value
    Full,
}

impl TemplateType {
    fn as_str(self) -> &'static str {
        match self {
            TemplateType::Minimal => "minimal",
            TemplateType::Command => "command",
            TemplateType::Full => "full",
        }
    }
}

/// Everything one dispatching invocation needs
struct Session {
    root: PathBuf,
    config: ProjectConfig,
    inventory: Arc<Inventory>,
    dispatcher: Arc<Dispatcher>,
    options: DispatchOptions,
    format: OutputFormat,
}

impl Session {
    fn open(root: &Path, run: &RunArgs) -> anyhow::Result<Self> {
        let config = ProjectConfig::load(root)
            .with_context(|| format!("Failed to load project at {}", root.display()))?;
        let inventory = Inventory::load(&config.inventory_path(root), config.clone())?;

        let registry = crate::transports::TransportRegistry::new(&config, root);
        let mut dispatcher =
            Dispatcher::new(registry).with_cancel_grace(Duration::from_secs(config.cancel_grace));
        if config.save_rerun && !run.no_save_rerun {
            dispatcher = dispatcher.with_rerun_store(RerunStore::new(config.rerun_path(root)));
        }

        let options = DispatchOptions {
            concurrency: run.concurrency.unwrap_or_else(|| config.concurrency()),
            noop: run.noop,
            timeout: run.timeout.or(config.timeout).map(Duration::from_secs),
            interpolate: false,
            save_rerun: false,
            description: None,
        };
        debug!(
            "Session for {}: concurrency {}, noop {}",
            root.display(),
            options.concurrency,
            options.noop
        );

        Ok(Self {
            root: root.to_path_buf(),
            format: run.format.unwrap_or(config.format),
            config,
            inventory: Arc::new(inventory),
            dispatcher: Arc::new(dispatcher),
            options,
        })
    }

    /// Targets named by `--targets`, or selected from rerun state
    fn resolve_targets(&self, run: &RunArgs) -> anyhow::Result<Vec<Target>> {
        match (&run.targets, run.rerun) {
            (Some(_), Some(_)) => bail!("Only one of --targets and --rerun may be given"),
            (Some(expression), None) => Ok(self.inventory.resolve(expression)?),
            (None, Some(mode)) => {
                let store = RerunStore::new(self.config.rerun_path(&self.root));
                let names = store.read(mode)?;
                if names.is_empty() {
                    warn!("Rerun state selects no targets for {:?}", mode);
                    return Ok(Vec::new());
                }
                Ok(self.inventory.resolve(&names.join(","))?)
            }
            (None, None) => bail!("One of --targets or --rerun is required"),
        }
    }

    /// Ctrl-C stops new connections; in-flight units get the grace period
    fn watch_interrupt(&self) -> JoinHandle<()> {
        let canceller = self.dispatcher.canceller();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; waiting for in-flight targets to finish");
                canceller.cancel();
            }
        })
    }
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig::new(&self.log_level, &self.log_format))
    }

    /// Execute the CLI command
    ///
    /// Returns a failing exit code when any target failed or a plan halted;
    /// errors are reserved for requests that could not start at all.
    pub async fn execute(&self) -> anyhow::Result<ExitCode> {
        match &self.command {
            Commands::Command {
                command: CommandCommands::Run { command, run },
            } => self.run_action(Action::command(command.clone()), run).await,
            Commands::Script {
                command: ScriptCommands::Run { script, args, run },
            } => {
                let action = Action::Script {
                    path: script.clone(),
                    args: args.clone(),
                    env: BTreeMap::new(),
                };
                self.run_action(action, run).await
            }
            Commands::Task {
                command: TaskCommands::Run { task, params, run },
            } => {
                let task = TaskLoader::new(&self.project).load(task)?;
                let action = Action::Task {
                    task,
                    params: parse_params(params)?,
                };
                self.run_action(action, run).await
            }
            Commands::File { command } => match command {
                FileCommands::Upload {
                    source,
                    destination,
                    run,
                } => {
                    let action = Action::Upload {
                        source: source.clone(),
                        destination: destination.clone(),
                    };
                    self.run_action(action, run).await
                }
                FileCommands::Download {
                    source,
                    destination,
                    run,
                } => {
                    let action = Action::Download {
                        source: source.clone(),
                        destination: destination.clone(),
                    };
                    self.run_action(action, run).await
                }
            },
            Commands::Plan { command } => match command {
                PlanCommands::Run { plan, params, run } => self.run_plan(plan, params, run).await,
                PlanCommands::Show { plan, format } => self.show_plan(plan, *format),
                PlanCommands::New { plan, template } => {
                    let path = templates::create_plan(&self.project, plan, template.as_str())?;
                    println!("Created plan '{}' at {}", plan, path.display());
                    Ok(ExitCode::SUCCESS)
                }
            },
            Commands::Inventory {
                command: InventoryCommands::Show { targets, format },
            } => self.show_inventory(targets.as_deref(), *format),
        }
    }

    /// Dispatch one action and report its ResultSet
    async fn run_action(&self, action: Action, run: &RunArgs) -> anyhow::Result<ExitCode> {
        let session = Session::open(&self.project, run)?;
        let targets = session.resolve_targets(run)?;
        if targets.is_empty() {
            warn!("No targets matched; nothing to run");
        }

        let options = DispatchOptions {
            interpolate: matches!(action, Action::Task { .. } | Action::Script { .. }),
            save_rerun: true,
            ..session.options.clone()
        };
        info!("Running {} on {} targets", action.describe(), targets.len());

        let interrupt = session.watch_interrupt();
        let started = Instant::now();
        let results = session
            .dispatcher
            .dispatch(&action, &targets, &options)
            .await;
        interrupt.abort();
        session.dispatcher.shutdown().await;

        let results = results?;
        report_results(&results, session.format, started.elapsed())?;
        Ok(exit_code(results.ok()))
    }

    async fn run_plan(
        &self,
        plan: &str,
        params: &[String],
        run: &RunArgs,
    ) -> anyhow::Result<ExitCode> {
        let session = Session::open(&self.project, run)?;
        let mut params = parse_params(params)?;
        if run.targets.is_some() || run.rerun.is_some() {
            let names: Vec<String> = session
                .resolve_targets(run)?
                .into_iter()
                .map(|t| t.name)
                .collect();
            params
                .entry("targets".to_string())
                .or_insert_with(|| json!(names.join(",")));
        }

        let dispatcher = session.dispatcher.clone();
        let applier = Arc::new(DispatchApplier::new(
            dispatcher.clone(),
            TaskLoader::new(&session.root),
            session.config.apply.install_task.clone(),
        ));
        let messages: Arc<dyn MessageSink> = match session.format {
            OutputFormat::Human => Arc::new(ConsoleSink),
            OutputFormat::Json => Arc::new(LogSink),
        };
        let runner = PlanRunner::new(
            dispatcher.clone(),
            session.inventory.clone(),
            applier,
            &session.root,
        )
        .with_messages(messages)
        .with_options(session.options.clone());

        let interrupt = session.watch_interrupt();
        let started = Instant::now();
        let outcome = runner.run_named(plan, params).await;
        interrupt.abort();
        dispatcher.shutdown().await;

        let outcome = outcome?;
        runner.record_rerun(&outcome);
        report_plan(plan, outcome, session.format, started.elapsed())
    }

    fn show_plan(&self, plan: &str, format: Option<OutputFormat>) -> anyhow::Result<ExitCode> {
        let config = ProjectConfig::load(&self.project)?;
        let info = PlanLoader::new(&self.project).load(plan)?.info();
        match format.unwrap_or(config.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            OutputFormat::Human => print_plan_info(&info),
        }
        Ok(ExitCode::SUCCESS)
    }

    fn show_inventory(
        &self,
        expression: Option<&str>,
        format: Option<OutputFormat>,
    ) -> anyhow::Result<ExitCode> {
        let config = ProjectConfig::load(&self.project)?;
        let inventory = Inventory::load(&config.inventory_path(&self.project), config.clone())?;
        let targets = inventory.resolve(expression.unwrap_or("all"))?;

        match format.unwrap_or(config.format) {
            OutputFormat::Json => {
                let listed: Vec<Value> = targets.iter().map(Target::to_value).collect();
                let output = json!({ "targets": listed, "count": targets.len() });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Human => {
                for target in &targets {
                    println!("{}", target.name);
                }
                println!();
                println!("{} targets", targets.len());
                if expression.is_none() {
                    let groups = inventory.group_names();
                    if !groups.is_empty() {
                        println!("Groups: {}", groups.join(", "));
                    }
                }
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

/// `key=value` pairs; values that parse as JSON keep their type
pub fn parse_params(params: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("Parameter '{}' must be written as key=value", param);
        };
        if key.is_empty() {
            bail!("Parameter '{}' has an empty name", param);
        }
        let value =
            serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn report_results(results: &ResultSet, format: OutputFormat, elapsed: Duration) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let output = json!({
                "items": results,
                "target_count": results.len(),
                "elapsed_time": elapsed.as_secs(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Human => {
            for result in results {
                print_result(result);
            }
            let partition = results.partition();
            if !partition.success.is_empty() {
                println!(
                    "Successful on {} targets: {}",
                    partition.success.len(),
                    joined_names(&partition.success)
                );
            }
            if !partition.failure.is_empty() {
                println!(
                    "Failed on {} targets: {}",
                    partition.failure.len(),
                    joined_names(&partition.failure)
                );
            }
            println!(
                "Ran on {} targets in {:.2} sec",
                results.len(),
                elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}

fn print_result(result: &TargetResult) {
    if let Some(message) = result.message() {
        println!("Failed on {}:", result.target.name);
        for line in message.lines() {
            println!("  {}", line);
        }
        return;
    }

    println!("Finished on {}:", result.target.name);
    let value = result.value();
    let text = match (
        value.get("stdout").and_then(Value::as_str),
        value.get("_output").and_then(Value::as_str),
    ) {
        (Some(stdout), _) => {
            let stderr = value.get("stderr").and_then(Value::as_str).unwrap_or("");
            format!("{}{}", stdout, stderr)
        }
        (None, Some(output)) => output.to_string(),
        (None, None) => serde_json::to_string_pretty(&value).unwrap_or_default(),
    };
    for line in text.lines() {
        println!("  {}", line);
    }
}

fn joined_names(targets: &[Target]) -> String {
    targets
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn report_plan(
    plan: &str,
    outcome: PlanOutcome,
    format: OutputFormat,
    elapsed: Duration,
) -> anyhow::Result<ExitCode> {
    match outcome {
        PlanOutcome::Returned(value) => {
            let value = value.to_json();
            match format {
                OutputFormat::Json => {
                    let output = json!({ "plan": plan, "status": "success", "value": value });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Human => {
                    if value.is_null() {
                        println!("Plan completed successfully with no result");
                    } else {
                        println!("{}", serde_json::to_string_pretty(&value)?);
                    }
                    println!("Wall time {:.2} sec", elapsed.as_secs_f64());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        PlanOutcome::Halted(failure) => {
            let detail = json!({
                "plan": failure.plan,
                "status": "failure",
                "step": failure.step,
                "result": failure.result_set(),
            });
            let err = TetherError::PlanHalted(Box::new(failure));
            match format {
                OutputFormat::Json => {
                    let mut output = detail;
                    output["msg"] = json!(err.to_string());
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Human => eprintln!("{}", err),
            }
            Ok(ExitCode::from(1))
        }
    }
}

fn print_plan_info(info: &PlanInfo) {
    println!("{}", info.name);
    if let Some(description) = &info.description {
        println!("  {}", description);
    }

    println!();
    println!("Parameters:");
    if info.parameters.is_empty() {
        println!("  (none)");
    }
    for (name, parameter) in &info.parameters {
        let default = parameter
            .default
            .as_ref()
            .map(|d| format!(" (default {})", d))
            .unwrap_or_default();
        println!("  {:<20} {}{}", name, parameter.ty, default);
        if let Some(description) = &parameter.description {
            println!("  {:<20} {}", "", description);
        }
    }

    println!();
    println!("Steps:");
    for step in &info.steps {
        println!("  {}", step);
    }

    let usage: Vec<String> = info
        .parameters
        .keys()
        .map(|name| format!("{}=<value>", name))
        .collect();
    println!();
    println!("Usage: tether plan run {} {}", info.name, usage.join(" "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_command_run() {
        let cli = Cli::try_parse_from([
            "tether",
            "command",
            "run",
            "uptime",
            "-t",
            "web01,web02",
            "--concurrency",
            "4",
            "--noop",
        ])
        .unwrap();
        match cli.command {
            Commands::Command {
                command: CommandCommands::Run { command, run },
            } => {
                assert_eq!(command, "uptime");
                assert_eq!(run.targets.as_deref(), Some("web01,web02"));
                assert_eq!(run.concurrency, Some(4));
                assert!(run.noop);
                assert!(!run.no_save_rerun);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_plan_run_with_rerun() {
        let cli = Cli::try_parse_from([
            "tether",
            "--project",
            "/srv/site",
            "plan",
            "run",
            "deploy",
            "version=2",
            "--rerun",
            "failure",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.project, PathBuf::from("/srv/site"));
        match cli.command {
            Commands::Plan {
                command: PlanCommands::Run { plan, params, run },
            } => {
                assert_eq!(plan, "deploy");
                assert_eq!(params, vec!["version=2"]);
                assert_eq!(run.rerun, Some(RerunMode::Failure));
                assert_eq!(run.format, Some(OutputFormat::Json));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params(&[
            "count=3".to_string(),
            "name=web".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "empty=".to_string(),
        ])
        .unwrap();
        assert_eq!(params["count"], json!(3));
        assert_eq!(params["name"], json!("web"));
        assert_eq!(params["tags"], json!(["a", "b"]));
        assert_eq!(params["empty"], json!(""));

        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_targets_and_rerun_are_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = RunArgs {
            targets: Some("local://a".to_string()),
            rerun: Some(RerunMode::All),
            ..Default::default()
        };
        let session = Session::open(dir.path(), &run).unwrap();
        assert!(session.resolve_targets(&run).is_err());
        assert!(session.resolve_targets(&RunArgs::default()).is_err());
    }

    #[test]
    fn test_rerun_selects_previous_failures() {
        use crate::models::ActionKind;
        use crate::result::FailureKind;
        use crate::target::TransportKind;

        let dir = tempfile::TempDir::new().unwrap();
        let config = ProjectConfig::default();
        let results = ResultSet::new(vec![
            TargetResult::success(
                Target::parse("local://a", TransportKind::Ssh).unwrap(),
                ActionKind::Command,
                crate::result::Payload::Value(Value::Null),
            ),
            TargetResult::failure(
                Target::parse("local://b", TransportKind::Ssh).unwrap(),
                ActionKind::Command,
                FailureKind::Execution,
                "exit 1",
            ),
        ])
        .unwrap();
        RerunStore::new(config.rerun_path(dir.path()))
            .write(&results)
            .unwrap();

        let run = RunArgs {
            rerun: Some(RerunMode::Failure),
            ..Default::default()
        };
        let session = Session::open(dir.path(), &run).unwrap();
        let targets = session.resolve_targets(&run).unwrap();
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["local://b"]);
    }
}
