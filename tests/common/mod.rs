//! Shared fixtures: an instrumented in-memory transport
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::dispatcher::Dispatcher;
use tether::error::TransportError;
use tether::models::{Action, ActionKind, CommandOutput};
use tether::result::Payload;
use tether::target::{Target, TransportKind};
use tether::transports::{Connection, RunOptions, Transport, TransportRegistry};

/// Counters observed across every connection the fake hands out
#[derive(Default)]
pub struct FakeState {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Mutations actually performed (noop runs are not counted)
    pub side_effects: AtomicUsize,
    /// (target, action description) for every performed run, in run order
    pub log: Mutex<Vec<(String, String)>>,
}

impl FakeState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn side_effects(&self) -> usize {
        self.side_effects.load(Ordering::SeqCst)
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.log
            .lock()
            .unwrap()
            .iter()
            .any(|(_, description)| description.contains(needle))
    }
}

/// Stands in for the ssh transport
#[derive(Default)]
pub struct FakeTransport {
    pub state: Arc<FakeState>,
    unreachable: HashSet<String>,
    /// target -> substring of the command that makes it exit 1
    failing: HashMap<String, String>,
    /// target -> substring of the command after which the session drops
    losing: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(mut self, names: &[&str]) -> Self {
        self.unreachable.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Commands containing `marker` exit 1 on `name`
    pub fn failing_on(mut self, name: &str, marker: &str) -> Self {
        self.failing.insert(name.to_string(), marker.to_string());
        self
    }

    /// Commands containing `marker` run on `name`, then the session dies
    pub fn losing_on(mut self, name: &str, marker: &str) -> Self {
        self.losing.insert(name.to_string(), marker.to_string());
        self
    }

    pub fn delay(mut self, name: &str, millis: u64) -> Self {
        self.delays
            .insert(name.to_string(), Duration::from_millis(millis));
        self
    }

    pub fn default_delay(mut self, millis: u64) -> Self {
        self.default_delay = Duration::from_millis(millis);
        self
    }
}

struct FakeConnection {
    target: Target,
    state: Arc<FakeState>,
    delay: Duration,
    fail_marker: Option<String>,
    lose_marker: Option<String>,
    alive: bool,
}

#[async_trait]
impl Connection for FakeConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn run(
        &mut self,
        action: &Action,
        options: &RunOptions,
    ) -> Result<Payload, TransportError> {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let description = action.describe();
        if options.noop {
            return Ok(Payload::Noop {
                description: format!("Would run {}", description),
            });
        }
        self.state.side_effects.fetch_add(1, Ordering::SeqCst);
        self.state
            .log
            .lock()
            .unwrap()
            .push((self.target.name.clone(), description.clone()));

        let matches = |marker: &Option<String>| match (marker, action) {
            (Some(marker), Action::Command { command, .. }) => command.contains(marker.as_str()),
            _ => false,
        };
        if matches(&self.lose_marker) {
            self.alive = false;
            return Err(TransportError::ConnectionLost {
                target: self.target.name.clone(),
                message: "connection reset by peer".to_string(),
            });
        }
        let failed = matches(&self.fail_marker);
        Ok(Payload::Command(CommandOutput {
            stdout: format!("{} on {}", description, self.target.name),
            stderr: if failed { "boom".to_string() } else { String::new() },
            exit_code: if failed { 1 } else { 0 },
            ..Default::default()
        }))
    }

    async fn close(self: Box<Self>) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn supports(&self, action: ActionKind) -> bool {
        action != ActionKind::Apply
    }

    async fn connect(&self, target: &Target) -> Result<Box<dyn Connection>, TransportError> {
        if self.unreachable.contains(&target.name) {
            return Err(TransportError::Connection {
                target: target.name.clone(),
                message: "no route to host".to_string(),
            });
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            target: target.clone(),
            state: self.state.clone(),
            delay: self
                .delays
                .get(&target.name)
                .copied()
                .unwrap_or(self.default_delay),
            fail_marker: self.failing.get(&target.name).cloned(),
            lose_marker: self.losing.get(&target.name).cloned(),
            alive: true,
        }))
    }
}

pub fn registry(transport: Arc<FakeTransport>) -> TransportRegistry {
    let mut registry = TransportRegistry::empty();
    registry.register(transport);
    registry
}

/// Dispatcher whose only transport is the fake, plus its shared counters
pub fn dispatcher(transport: FakeTransport) -> (Dispatcher, Arc<FakeState>) {
    let state = transport.state.clone();
    (Dispatcher::new(registry(Arc::new(transport))), state)
}

pub fn targets(names: &[&str]) -> Vec<Target> {
    names
        .iter()
        .map(|n| Target::parse(n, TransportKind::Ssh).unwrap())
        .collect()
}
