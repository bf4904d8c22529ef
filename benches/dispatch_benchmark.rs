use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::path::Path;
use tether::config::ProjectConfig;
use tether::dispatcher::{DispatchOptions, Dispatcher};
use tether::error::TransportError;
use tether::models::{Action, ActionKind, CommandOutput};
use tether::plan::expr;
use tether::plan::scope::Scope;
use tether::plan::value::PlanValue;
use tether::result::{FailureKind, Payload, ResultSet, TargetResult};
use tether::target::{Target, TransportKind};
use tether::transports::{Connection, RunOptions, Transport, TransportRegistry};
use tokio::runtime::Runtime;

/// Transport that answers immediately, so only dispatch overhead is measured
struct NullTransport;

struct NullConnection {
    target: Target,
}

#[async_trait]
impl Connection for NullConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run(
        &mut self,
        _action: &Action,
        _options: &RunOptions,
    ) -> Result<Payload, TransportError> {
        Ok(Payload::Command(CommandOutput {
            stdout: "ok".to_string(),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn supports(&self, _action: ActionKind) -> bool {
        true
    }

    async fn connect(&self, target: &Target) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(NullConnection {
            target: target.clone(),
        }))
    }
}

fn targets(count: usize) -> Vec<Target> {
    (0..count)
        .map(|i| Target::parse(&format!("node{}", i), TransportKind::Ssh).unwrap())
        .collect()
}

fn null_dispatcher() -> Dispatcher {
    let mut registry = TransportRegistry::empty();
    registry.register(std::sync::Arc::new(NullTransport));
    Dispatcher::new(registry)
}

/// Fan-out cost per target count with a warm connection pool
fn bench_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_fan_out");
    let action = Action::command("uptime");

    for count in [1usize, 10, 100, 500] {
        let dispatcher = null_dispatcher();
        let list = targets(count);
        let options = DispatchOptions {
            concurrency: 100,
            ..Default::default()
        };
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &list, |b, list| {
            b.iter(|| {
                rt.block_on(async {
                    let set = dispatcher
                        .dispatch(black_box(&action), list, &options)
                        .await
                        .unwrap();
                    assert_eq!(set.len(), list.len());
                })
            });
        });
    }

    group.finish();
}

/// Same target count, varying concurrency cap
fn bench_concurrency_cap(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_concurrency");
    let action = Action::command("uptime");
    let list = targets(200);

    for concurrency in [1usize, 8, 50, 200] {
        let dispatcher = null_dispatcher();
        let options = DispatchOptions {
            concurrency,
            ..Default::default()
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &options,
            |b, options| {
                b.iter(|| {
                    rt.block_on(async {
                        dispatcher
                            .dispatch(black_box(&action), &list, options)
                            .await
                            .unwrap()
                    })
                });
            },
        );
    }

    group.finish();
}

/// Real subprocesses through the local transport
fn bench_local_commands(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("local_transport");
    group.sample_size(20);

    let dispatcher = Dispatcher::new(TransportRegistry::new(
        &ProjectConfig::default(),
        Path::new("."),
    ));
    let list: Vec<Target> = (0..8)
        .map(|i| Target::parse(&format!("local://n{}", i), TransportKind::Local).unwrap())
        .collect();
    let options = DispatchOptions {
        concurrency: 8,
        ..Default::default()
    };

    group.bench_function("true_on_8_targets", |b| {
        b.iter(|| {
            rt.block_on(async {
                let set = dispatcher
                    .dispatch(black_box(&Action::command("true")), &list, &options)
                    .await
                    .unwrap();
                assert!(set.ok());
            })
        });
    });

    group.finish();
}

/// Partition and expression evaluation over a large ResultSet
fn bench_result_views(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_views");
    let results: Vec<TargetResult> = targets(1000)
        .into_iter()
        .enumerate()
        .map(|(i, target)| {
            if i % 10 == 0 {
                TargetResult::failure(target, ActionKind::Command, FailureKind::Execution, "exit 1")
            } else {
                TargetResult::success(target, ActionKind::Command, Payload::Value(json!({"i": i})))
            }
        })
        .collect();
    let set = ResultSet::new(results).unwrap();

    group.bench_function("partition_1000", |b| {
        b.iter(|| black_box(&set).partition())
    });

    let scope = Scope::new().with("r", PlanValue::ResultSet(set.clone()));
    group.bench_function("error_set_names_expression", |b| {
        b.iter(|| expr::evaluate(black_box("$r.error_set.names.length"), &scope).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fan_out,
    bench_concurrency_cap,
    bench_local_commands,
    bench_result_views
);
criterion_main!(benches);
