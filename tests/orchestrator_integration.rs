//! Orchestrator transport against a mock job API

use serde_json::json;
use std::path::PathBuf;
use tempfile::TempDir;
use tether::config::ProjectConfig;
use tether::dispatcher::{DispatchOptions, Dispatcher};
use tether::models::{Action, TaskMetadata, TaskSpec};
use tether::result::FailureKind;
use tether::target::{Target, TransportKind};
use tether::transports::TransportRegistry;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(server: &MockServer, dir: &TempDir) -> Dispatcher {
    let mut project = ProjectConfig::default();
    project.pcp.insert("service-url".to_string(), json!(server.uri()));
    project.pcp.insert("token".to_string(), json!("secret"));
    project.pcp.insert("job-poll-interval".to_string(), json!(0));
    Dispatcher::new(TransportRegistry::new(&project, dir.path()))
}

fn web1() -> Vec<Target> {
    vec![Target::parse("pcp://web1", TransportKind::Ssh).unwrap()]
}

async fn mount_job(server: &MockServer, state: &str, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/orchestrator/v1/command/task"))
        .and(header("X-Authentication", "secret"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "job": { "id": "https://orchestrator/jobs/42", "name": "42" }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orchestrator/v1/jobs/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": state })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orchestrator/v1/jobs/42/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "name": "web1", "state": state, "result": result }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_command_runs_as_shim_task() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/orchestrator/v1/command/task"))
        .and(body_partial_json(json!({
            "task": "tether_shim::command",
            "params": { "command": "uptime" },
            "scope": { "nodes": ["web1"] }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "job": { "id": "https://orchestrator/jobs/42", "name": "42" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_job(
        &server,
        "finished",
        json!({ "stdout": "up 3 days", "stderr": "", "exit_code": 0 }),
    )
    .await;

    let set = dispatcher(&server, &dir)
        .dispatch(&Action::command("uptime"), &web1(), &DispatchOptions::default())
        .await
        .unwrap();

    let result = set.get("pcp://web1").unwrap();
    assert!(result.ok());
    assert_eq!(result.value()["stdout"], json!("up 3 days"));
}

#[tokio::test]
async fn test_failed_node_is_a_failed_task() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_job(
        &server,
        "failed",
        json!({ "_error": { "kind": "package/missing", "msg": "no such package" } }),
    )
    .await;

    let task = TaskSpec {
        name: "package".to_string(),
        executable: PathBuf::from("tasks/package.sh"),
        metadata: TaskMetadata::default(),
    };
    let set = dispatcher(&server, &dir)
        .dispatch(
            &Action::Task {
                task,
                params: serde_json::Map::new(),
            },
            &web1(),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    let failure = set.get("pcp://web1").unwrap().failure_detail().unwrap();
    assert_eq!(failure.kind, FailureKind::Execution);
    assert_eq!(failure.message, "no such package");
}

#[tokio::test]
async fn test_rejected_token_is_a_connection_failure() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/orchestrator/v1/command/task"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let set = dispatcher(&server, &dir)
        .dispatch(&Action::command("uptime"), &web1(), &DispatchOptions::default())
        .await
        .unwrap();

    let failure = set.get("pcp://web1").unwrap().failure_detail().unwrap();
    assert_eq!(failure.kind, FailureKind::Connection);
}

#[tokio::test]
async fn test_upload_is_unsupported() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let set = dispatcher(&server, &dir)
        .dispatch(
            &Action::Upload {
                source: PathBuf::from("files/a"),
                destination: "/tmp/a".to_string(),
            },
            &web1(),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    let failure = set.get("pcp://web1").unwrap().failure_detail().unwrap();
    assert_eq!(failure.kind, FailureKind::UnsupportedAction);
}
