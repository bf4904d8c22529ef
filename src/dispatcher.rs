//! Concurrent fan-out of one action across a target list
//!
//! Every target gets its own spawned unit of work. A semaphore bounds how
//! many units talk to their transport at once, and the ResultSet is
//! assembled in input order only after every unit has resolved. Nothing a
//! transport raises for one target crosses this boundary as an error; it
//! becomes that target's failed result.

use crate::error::{Result, TetherError, TransportError};
use crate::models::{Action, MIN_CONCURRENCY};
use crate::pool::ConnectionPool;
use crate::rerun::RerunStore;
use crate::result::{FailureKind, Payload, ResultSet, TargetResult};
use crate::target::Target;
use crate::transports::{unsupported, RunOptions, Transport, TransportRegistry};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-dispatch knobs
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum units in flight at once
    pub concurrency: usize,
    /// Report what would happen instead of doing it
    pub noop: bool,
    /// Bound on connect + run for each target
    pub timeout: Option<Duration>,
    /// Render `{{ target.* }}` placeholders in task parameters and script arguments
    pub interpolate: bool,
    /// Persist the rerun record once the ResultSet is assembled
    pub save_rerun: bool,
    /// Label for the log span; defaults to the action's description
    pub description: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::config::default_concurrency(),
            noop: false,
            timeout: None,
            interpolate: false,
            save_rerun: false,
            description: None,
        }
    }
}

/// Stops new units from starting and bounds in-flight ones
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owns the transport registry and the invocation's connection pool
pub struct Dispatcher {
    registry: Arc<TransportRegistry>,
    pool: Arc<ConnectionPool>,
    rerun: Option<RerunStore>,
    cancel: Arc<watch::Sender<bool>>,
    grace: Duration,
}

impl Dispatcher {
    pub fn new(registry: TransportRegistry) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            registry: Arc::new(registry),
            pool: Arc::new(ConnectionPool::new()),
            rerun: None,
            cancel: Arc::new(tx),
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_rerun_store(mut self, store: RerunStore) -> Self {
        self.rerun = Some(store);
        self
    }

    /// How long in-flight units may keep running after cancellation
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            tx: self.cancel.clone(),
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `action` on every target and collect one result per target
    ///
    /// Returns an error only when the request itself is malformed: a zero
    /// concurrency, a target listed twice, or a target whose transport kind
    /// has no registered implementation.
    pub async fn dispatch(
        &self,
        action: &Action,
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<ResultSet> {
        if options.concurrency < MIN_CONCURRENCY {
            return Err(TetherError::Validation(format!(
                "concurrency must be at least {}, got {}",
                MIN_CONCURRENCY, options.concurrency
            )));
        }
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.name.as_str()) {
                return Err(TetherError::DuplicateTarget(target.name.clone()));
            }
            self.registry.get(target.transport)?;
        }

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| action.describe());
        let span = info_span!(
            "action",
            kind = %action.kind(),
            description = %description,
            targets = targets.len(),
            noop = options.noop,
        );

        let results = self
            .fan_out(action, targets, options)
            .instrument(span.clone())
            .await?;

        span.in_scope(|| {
            let failed = results.error_set().len();
            if failed == 0 {
                info!("Finished {} on {} targets", description, results.len());
            } else {
                warn!(
                    "Finished {} with {} failures on {} targets",
                    description,
                    failed,
                    results.len()
                );
            }
        });

        if options.save_rerun {
            self.record_rerun(&results);
        }
        Ok(results)
    }

    /// Write rerun state if a store is configured; failures are only logged
    pub fn record_rerun(&self, results: &ResultSet) {
        if let Some(store) = &self.rerun {
            if let Err(e) = store.write(results) {
                warn!("Could not save rerun state: {}", e);
            }
        }
    }

    /// Close every connection opened during this invocation
    pub async fn shutdown(&self) {
        self.pool.close_all(&self.registry).await;
    }

    async fn fan_out(
        &self,
        action: &Action,
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<ResultSet> {
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let action = if options.interpolate {
                interpolate_action(action, target)
            } else {
                action.clone()
            };
            let unit = Unit {
                target: target.clone(),
                action,
                noop: options.noop,
                timeout: options.timeout,
                concurrency: options.concurrency,
                grace: self.grace,
                registry: self.registry.clone(),
                pool: self.pool.clone(),
                cancel: self.cancel.subscribe(),
            };
            let semaphore = semaphore.clone();
            let span = info_span!("target", name = %target.name);
            handles.push(tokio::spawn(
                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return TargetResult::failure(
                                unit.target,
                                unit.action.kind(),
                                FailureKind::Cancelled,
                                "dispatch was shut down",
                            )
                        }
                    };
                    unit.run().await
                }
                .instrument(span),
            ));
        }

        let mut results = Vec::with_capacity(targets.len());
        for (handle, target) in handles.into_iter().zip(targets) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Unit for {} panicked: {}", target, e);
                    TargetResult::failure(
                        target.clone(),
                        action.kind(),
                        FailureKind::Execution,
                        format!("internal error while running on {}: {}", target, e),
                    )
                }
            };
            results.push(result);
        }
        ResultSet::new(results)
    }
}

/// One target's share of a dispatch
struct Unit {
    target: Target,
    action: Action,
    noop: bool,
    timeout: Option<Duration>,
    concurrency: usize,
    grace: Duration,
    registry: Arc<TransportRegistry>,
    pool: Arc<ConnectionPool>,
    cancel: watch::Receiver<bool>,
}

impl Unit {
    async fn run(self) -> TargetResult {
        let kind = self.action.kind();
        if *self.cancel.borrow() {
            return TargetResult::failure(
                self.target,
                kind,
                FailureKind::Cancelled,
                "cancelled before connecting",
            );
        }

        let transport = match self.registry.get(self.target.transport) {
            Ok(transport) => transport,
            Err(e) => {
                return TargetResult::failure(self.target, kind, FailureKind::Connection, e.to_string())
            }
        };
        if !transport.supports(kind) {
            let err = unsupported(transport.kind(), kind);
            return TargetResult::from_transport_error(self.target, kind, &err);
        }

        if self.noop {
            match &self.action {
                Action::Task { task, .. } if !task.metadata.supports_noop => {
                    return TargetResult::failure(
                        self.target,
                        kind,
                        FailureKind::UnsupportedAction,
                        format!("Task {} does not support noop", task.name),
                    );
                }
                Action::Task { .. } | Action::Apply { .. } => {}
                other => {
                    debug!("Skipping {} on {} in noop mode", other.describe(), self.target);
                    return TargetResult::success(
                        self.target,
                        kind,
                        Payload::Noop {
                            description: format!("Would run {}", other.describe()),
                        },
                    );
                }
            }
        }

        let work = run_on_target(
            &self.pool,
            transport.as_ref(),
            &self.target,
            &self.action,
            RunOptions { noop: self.noop },
            self.concurrency,
        );
        let bounded = async {
            match self.timeout {
                Some(limit) => {
                    // The abandoned run has released its slot once this resolves
                    let outcome = tokio::time::timeout(limit, work).await;
                    outcome.unwrap_or_else(|_| {
                        self.pool.discard(&self.target, transport.kind());
                        Err(TransportError::Timeout {
                            seconds: limit.as_secs(),
                        })
                    })
                }
                None => work.await,
            }
        };

        let grace = self.grace;
        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            loop {
                let requested = *cancel.borrow_and_update();
                if requested {
                    break;
                }
                if cancel.changed().await.is_err() {
                    // Sender gone: cancellation can no longer happen
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(grace).await;
        };

        let outcome = tokio::select! {
            outcome = bounded => Some(outcome),
            _ = cancelled => None,
        };

        match outcome {
            None => {
                warn!("Cancelled in-flight run on {}", self.target);
                self.pool.discard(&self.target, transport.kind());
                TargetResult::failure(
                    self.target,
                    kind,
                    FailureKind::Cancelled,
                    "cancelled by operator",
                )
            }
            Some(Ok(payload)) => TargetResult::from_payload(self.target, kind, payload),
            Some(Err(e)) => {
                debug!("Run on {} failed: {}", self.target, e);
                TargetResult::from_transport_error(self.target, kind, &e)
            }
        }
    }
}

/// Acquire the pooled connection and run the action once
///
/// A session lost mid-action may already have applied the action, so the
/// loss is reported for this run and the session is evicted; the pool opens
/// a fresh one on next use.
async fn run_on_target(
    pool: &ConnectionPool,
    transport: &dyn Transport,
    target: &Target,
    action: &Action,
    options: RunOptions,
    limit: usize,
) -> std::result::Result<Payload, TransportError> {
    let mut connection = pool.acquire(target, transport, limit).await?;
    let outcome = connection.run(transport, action, &options).await;
    if let Err(e) = &outcome {
        if e.is_connection_lost() {
            warn!("Connection to {} lost during {}: {}", target, action.describe(), e);
            connection.evict(transport).await;
        }
    }
    outcome
}

/// Render `{{ target.<field> }}` placeholders for one target
///
/// Only task parameters and script arguments are rendered; other actions are
/// returned unchanged.
pub fn interpolate_action(action: &Action, target: &Target) -> Action {
    let context = target.to_value();
    match action {
        Action::Task { task, params } => Action::Task {
            task: task.clone(),
            params: params
                .iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, &context)))
                .collect(),
        },
        Action::Script { path, args, env } => Action::Script {
            path: path.clone(),
            args: args.iter().map(|a| interpolate_str(a, &context)).collect(),
            env: env.clone(),
        },
        other => other.clone(),
    }
}

fn interpolate_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn interpolate_str(input: &str, context: &Value) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let expr = rest[start + 2..start + len].trim();
        let resolved = expr.strip_prefix("target.").and_then(|path| {
            let pointer = format!("/{}", path.replace('.', "/"));
            context.pointer(&pointer)
        });
        match resolved {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + len + 2]),
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    out
}
