//! Sequential plan interpreter
//!
//! `Ready -> Running(i) -> Running(i + 1) | Halted | Returned`. Parameters are
//! type-checked and bound before step 0; any mismatch is a validation error
//! and nothing runs. Each step resolves its fields against the current scope,
//! dispatches at most one action, and binds its result under the step's
//! name. A dispatching step with failed targets halts the plan unless it sets
//! `catch_errors`.

use super::expr;
use super::parser::PlanLoader;
use super::scope::Scope;
use super::value::PlanValue;
use super::{FailureCause, PlanDefinition, PlanFailure, PlanOutcome, Step, StepKind};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::{Result, TetherError};
use crate::inventory::TargetResolver;
use crate::models::Action;
use crate::result::ResultSet;
use crate::target::Target;
use crate::tasks::TaskLoader;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Nested plans deeper than this halt instead of recursing further
pub const MAX_PLAN_DEPTH: usize = 32;

/// Destination for `message` steps
pub trait MessageSink: Send + Sync {
    fn message(&self, text: &str);
}

/// Prints messages for the operator
pub struct ConsoleSink;

impl MessageSink for ConsoleSink {
    fn message(&self, text: &str) {
        println!("{}", text);
    }
}

/// Routes messages into the log, for machine-readable output modes
pub struct LogSink;

impl MessageSink for LogSink {
    fn message(&self, text: &str) {
        info!(target: "tether::plan::message", "{}", text);
    }
}

/// Applies a list of declarative resources to targets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn apply(
        &self,
        resources: &[Value],
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<ResultSet>;
}

/// Runs plans against a dispatcher and a target resolver
pub struct PlanRunner {
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<dyn TargetResolver>,
    applier: Arc<dyn ResourceApplier>,
    messages: Arc<dyn MessageSink>,
    tasks: TaskLoader,
    plans: PlanLoader,
    project_root: PathBuf,
    options: DispatchOptions,
}

impl PlanRunner {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<dyn TargetResolver>,
        applier: Arc<dyn ResourceApplier>,
        project_root: &Path,
    ) -> Self {
        Self {
            dispatcher,
            resolver,
            applier,
            messages: Arc::new(ConsoleSink),
            tasks: TaskLoader::new(project_root),
            plans: PlanLoader::new(project_root),
            project_root: project_root.to_path_buf(),
            options: DispatchOptions::default(),
        }
    }

    pub fn with_messages(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.messages = sink;
        self
    }

    /// Concurrency, noop and timeout used for every step's dispatch
    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Load a plan by name and run it
    pub async fn run_named(&self, name: &str, params: Map<String, Value>) -> Result<PlanOutcome> {
        let plan = self.plans.load(name)?;
        self.run(&plan, params).await
    }

    /// Run a plan to completion
    ///
    /// Returns an error only for invalid parameters; everything that goes
    /// wrong once steps start is reported through [`PlanOutcome::Halted`].
    pub async fn run(&self, plan: &PlanDefinition, params: Map<String, Value>) -> Result<PlanOutcome> {
        self.run_plan(plan, params, 0).await
    }

    /// Save the rerun partition of a finished plan: the halting step's
    /// results, or the returned ResultSet
    pub fn record_rerun(&self, outcome: &PlanOutcome) {
        let set = match outcome {
            PlanOutcome::Halted(failure) => failure.result_set(),
            PlanOutcome::Returned(PlanValue::ResultSet(set)) => Some(set),
            PlanOutcome::Returned(_) => None,
        };
        match set {
            Some(set) => self.dispatcher.record_rerun(set),
            None => debug!("Plan produced no ResultSet; rerun state left unchanged"),
        }
    }

    fn run_plan<'a>(
        &'a self,
        plan: &'a PlanDefinition,
        params: Map<String, Value>,
        depth: usize,
    ) -> BoxFuture<'a, Result<PlanOutcome>> {
        let span = info_span!("plan", name = %plan.name, depth);
        Box::pin(
            async move {
                let mut scope = bind_parameters(plan, params)?;
                info!("Starting plan {}", plan.name);

                for (index, step) in plan.steps.iter().enumerate() {
                    let label = step.label(index);
                    if self.dispatcher.canceller().is_cancelled() {
                        return Ok(PlanOutcome::Halted(PlanFailure {
                            plan: plan.name.clone(),
                            step: label,
                            cause: FailureCause::Error("cancelled by operator".to_string()),
                        }));
                    }

                    debug!("Running step {} ({})", label, step.kind.keyword());
                    let outcome = self.execute(step, &label, &scope, depth).await;
                    let value = match outcome {
                        Ok(value) => value,
                        Err(cause) => {
                            let failure = PlanFailure {
                                plan: plan.name.clone(),
                                step: label.clone(),
                                cause,
                            };
                            if !step.catch_errors {
                                warn!("{}", failure);
                                return Ok(PlanOutcome::Halted(failure));
                            }
                            warn!("Continuing past failed step {}: {}", label, failure);
                            failure.to_value()
                        }
                    };
                    if let Some(name) = &step.name {
                        scope = scope.with(name.clone(), value);
                    }
                }

                let returned = match &plan.returns {
                    Some(raw) => match expr::resolve(raw, &scope) {
                        Ok(value) => value,
                        Err(e) => {
                            return Ok(PlanOutcome::Halted(PlanFailure {
                                plan: plan.name.clone(),
                                step: "return".to_string(),
                                cause: FailureCause::Error(e.to_string()),
                            }))
                        }
                    },
                    None => PlanValue::null(),
                };
                info!("Finished plan {}", plan.name);
                Ok(PlanOutcome::Returned(returned))
            }
            .instrument(span),
        )
    }

    async fn execute(
        &self,
        step: &Step,
        label: &str,
        scope: &Scope,
        depth: usize,
    ) -> std::result::Result<PlanValue, FailureCause> {
        let error = |e: TetherError| FailureCause::Error(e.to_string());

        let (action, targets) = match &step.kind {
            StepKind::Eval { expression } => {
                return match expression {
                    Value::String(src) => expr::evaluate(src, scope),
                    other => expr::resolve(other, scope),
                }
                .map_err(error);
            }
            StepKind::Message { message } => {
                let text = expr::resolve(message, scope).map_err(error)?;
                self.messages.message(&text.to_string());
                return Ok(PlanValue::null());
            }
            StepKind::Plan { plan, parameters } => {
                return self.nested(plan, parameters.as_ref(), scope, depth).await;
            }
            StepKind::Resources { resources, targets } => {
                let targets = self.targets(targets, scope).map_err(error)?;
                let resources = match expr::resolve(resources, scope).map_err(error)?.to_json() {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                let options = self.step_options(label, false);
                let set = self
                    .applier
                    .apply(&resources, &targets, &options)
                    .await
                    .map_err(error)?;
                return checked(set);
            }
            StepKind::Command {
                command,
                targets,
                env_vars,
            } => (
                Action::Command {
                    command: resolve_string(command, scope).map_err(error)?,
                    env: resolve_env(env_vars.as_ref(), scope).map_err(error)?,
                },
                targets,
            ),
            StepKind::Script {
                script,
                targets,
                arguments,
                env_vars,
            } => (
                Action::Script {
                    path: self.project_path(&resolve_string(script, scope).map_err(error)?),
                    args: resolve_list(arguments.as_ref(), scope).map_err(error)?,
                    env: resolve_env(env_vars.as_ref(), scope).map_err(error)?,
                },
                targets,
            ),
            StepKind::Task {
                task,
                targets,
                parameters,
            } => {
                let name = resolve_string(task, scope).map_err(error)?;
                let spec = self.tasks.load(&name).map_err(error)?;
                let params = resolve_map(parameters.as_ref(), scope).map_err(error)?;
                (Action::Task { task: spec, params }, targets)
            }
            StepKind::Upload {
                source,
                destination,
                targets,
            } => (
                Action::Upload {
                    source: self.project_path(&resolve_string(source, scope).map_err(error)?),
                    destination: resolve_string(destination, scope).map_err(error)?,
                },
                targets,
            ),
            StepKind::Download {
                source,
                destination,
                targets,
            } => (
                Action::Download {
                    source: resolve_string(source, scope).map_err(error)?,
                    destination: self
                        .project_path(&resolve_string(destination, scope).map_err(error)?),
                },
                targets,
            ),
        };

        let targets = self.targets(targets, scope).map_err(error)?;
        let interpolate = matches!(action, Action::Task { .. } | Action::Script { .. });
        let options = self.step_options(label, interpolate);
        let set = self
            .dispatcher
            .dispatch(&action, &targets, &options)
            .await
            .map_err(error)?;

        if matches!(action, Action::Task { .. }) {
            self.store_facts(&set);
        }
        checked(set)
    }

    async fn nested(
        &self,
        name: &str,
        parameters: Option<&Value>,
        scope: &Scope,
        depth: usize,
    ) -> std::result::Result<PlanValue, FailureCause> {
        if depth + 1 >= MAX_PLAN_DEPTH {
            return Err(FailureCause::Error(format!(
                "plan nesting exceeds {} levels",
                MAX_PLAN_DEPTH
            )));
        }
        let error = |e: TetherError| FailureCause::Error(e.to_string());
        let plan = self.plans.load(name).map_err(error)?;
        let params = resolve_map(parameters, scope).map_err(error)?;

        // The child sees only its own parameters, never the caller's scope
        match self.run_plan(&plan, params, depth + 1).await.map_err(error)? {
            PlanOutcome::Returned(value) => Ok(value),
            PlanOutcome::Halted(failure) => Err(FailureCause::Nested(Box::new(failure))),
        }
    }

    fn step_options(&self, label: &str, interpolate: bool) -> DispatchOptions {
        DispatchOptions {
            interpolate,
            save_rerun: false,
            description: Some(label.to_string()),
            ..self.options.clone()
        }
    }

    fn project_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Resolve a step's `targets` field into a flat, de-duplicated list
    fn targets(&self, raw: &Value, scope: &Scope) -> Result<Vec<Target>> {
        let mut expressions = Vec::new();
        match expr::resolve(raw, scope)? {
            PlanValue::ResultSet(set) => expressions.extend(set.names()),
            PlanValue::Result(result) => expressions.push(result.target.name),
            PlanValue::Data(value) => collect_target_expressions(&value, &mut expressions)?,
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for expression in expressions {
            for target in self.resolver.resolve(&expression)? {
                if seen.insert(target.name.clone()) {
                    targets.push(target);
                }
            }
        }
        Ok(targets)
    }

    /// Merge `_facts` returned by tasks into the inventory's fact store
    fn store_facts(&self, set: &ResultSet) {
        for result in set.iter().filter(|r| r.ok()) {
            if let Some(Value::Object(facts)) = result.value().get("_facts") {
                if let Err(e) = self.resolver.add_facts(&result.target.name, facts) {
                    warn!("Could not store facts for {}: {}", result.target, e);
                }
            }
        }
    }
}

fn checked(set: ResultSet) -> std::result::Result<PlanValue, FailureCause> {
    if set.ok() {
        Ok(PlanValue::ResultSet(set))
    } else {
        Err(FailureCause::Targets(set))
    }
}

/// Bind provided parameters over declared defaults, type-checking each
fn bind_parameters(plan: &PlanDefinition, mut params: Map<String, Value>) -> Result<Scope> {
    if let Some(unknown) = params.keys().find(|k| !plan.parameters.contains_key(*k)) {
        return Err(TetherError::Validation(format!(
            "Plan '{}' does not accept a parameter named '{}'",
            plan.name, unknown
        )));
    }

    let mut bound = Vec::with_capacity(plan.parameters.len());
    for (name, decl) in &plan.parameters {
        let value = match params.remove(name) {
            Some(value) => value,
            None => match &decl.default {
                Some(default) => default.clone(),
                None if decl.ty.is_optional() => Value::Null,
                None => {
                    return Err(TetherError::Validation(format!(
                        "Plan '{}' requires parameter '{}' ({})",
                        plan.name, name, decl.ty
                    )))
                }
            },
        };
        if !decl.ty.matches(&value) {
            return Err(TetherError::Validation(format!(
                "Plan '{}' parameter '{}' expects {}, got {}",
                plan.name, name, decl.ty, value
            )));
        }
        bound.push((name.clone(), PlanValue::Data(value)));
    }
    Ok(Scope::from_params(bound))
}

fn collect_target_expressions(value: &Value, out: &mut Vec<String>) -> Result<()> {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_target_expressions(item, out)?;
            }
        }
        Value::Object(map) => match map
            .get("name")
            .or_else(|| map.get("target"))
            .and_then(Value::as_str)
        {
            Some(name) => out.push(name.to_string()),
            None => {
                return Err(TetherError::Validation(format!(
                    "cannot use {} as a target",
                    value
                )))
            }
        },
        Value::Null => {}
        other => {
            return Err(TetherError::Validation(format!(
                "cannot use {} as a target",
                other
            )))
        }
    }
    Ok(())
}

fn resolve_string(raw: &Value, scope: &Scope) -> Result<String> {
    Ok(expr::resolve(raw, scope)?.to_string())
}

fn resolve_list(raw: Option<&Value>, scope: &Scope) -> Result<Vec<String>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match expr::resolve(raw, scope)?.to_json() {
        Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| PlanValue::Data(item).to_string())
            .collect()),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![PlanValue::Data(single).to_string()]),
    }
}

fn resolve_map(raw: Option<&Value>, scope: &Scope) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match expr::resolve(raw, scope)?.to_json() {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(TetherError::Validation(format!(
            "expected a hash of parameters, got {}",
            other
        ))),
    }
}

fn resolve_env(raw: Option<&Value>, scope: &Scope) -> Result<BTreeMap<String, String>> {
    Ok(resolve_map(raw, scope)?
        .into_iter()
        .map(|(k, v)| (k, PlanValue::Data(v).to_string()))
        .collect())
}
