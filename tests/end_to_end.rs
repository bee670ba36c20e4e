use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use serde_json::{json, Value};

use weaver_core::event::EventBus;
use weaver_core::traits::WorkflowStore;
use weaver_core::types::{ExecutionStatus, NodeDef, WorkflowDef};
use weaver_engine::{Engine, ExecutorRegistry, RunnerConfig, WorkflowRunner};
use weaver_store::SqliteStore;
use weaver_test_utils::{diamond, test_config, write_workflow, MockExecutor};

fn weaver(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_weaver"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run weaver binary")
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("weaver.toml");
    let content = format!(
        "[retry]\nmax_retries = 0\n\n[store]\npath = \"{}\"\n",
        dir.join("weaver.db").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn write_json(dir: &Path, name: &str, value: Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

#[test]
fn test_cli_validate_prints_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let wf = write_workflow(dir.path(), &diamond("passthrough"));

    let out = weaver(&config, &["validate", wf.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("4 nodes"));
    assert!(stdout.contains("a -> b -> c -> d"));
}

#[test]
fn test_cli_plan_prints_first_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let wf = write_workflow(dir.path(), &diamond("passthrough"));

    let out = weaver(&config, &["plan", wf.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("d [passthrough] <- b, c"));
    assert!(stdout.lines().any(|l| l == "First batch: a"));

    let roots = write_json(
        dir.path(),
        "roots.json",
        json!({
            "id": "roots",
            "nodes": [
                {"id": "x", "type": "input"},
                {"id": "y", "type": "input"},
                {"id": "z", "type": "input"}
            ],
            "edges": [{"from": "x", "to": "z"}]
        }),
    );
    let out = weaver(&config, &["plan", roots.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.lines().any(|l| l == "First batch: x, y"));
}

#[test]
fn test_cli_validate_rejects_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let wf = write_json(
        dir.path(),
        "cycle.json",
        json!({
            "id": "cycle",
            "nodes": [{"id": "a", "type": "input"}, {"id": "b", "type": "input"}],
            "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
        }),
    );

    let out = weaver(&config, &["validate", wf.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Circular dependency"));
}

#[test]
fn test_cli_run_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let wf = write_json(
        dir.path(),
        "pipeline.json",
        json!({
            "id": "pipeline",
            "nodes": [
                {"id": "fetch", "type": "input", "data": {"url": "memory://"}},
                {"id": "wait", "type": "delay", "data": {"ms": 5}},
                {"id": "report", "type": "shell", "data": {"command": "echo done"}}
            ],
            "edges": [
                {"source": "fetch", "target": "wait"},
                {"source": "wait", "target": "report"}
            ]
        }),
    );

    let out = weaver(&config, &["run", wf.to_str().unwrap(), "--json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let summary: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["completed_nodes"], 3);
    assert_eq!(summary["outputs"]["report"]["stdout"], "done");
    assert_eq!(summary["results"]["wait"]["inputs"]["fetch"]["url"], "memory://");

    let out = weaver(&config, &["history", "pipeline"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains(summary["execution_id"].as_str().unwrap()));
    assert!(stdout.contains("completed"));
}

#[test]
fn test_cli_run_failure_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let wf = write_json(
        dir.path(),
        "broken.json",
        json!({
            "id": "broken",
            "nodes": [
                {"id": "a", "type": "input"},
                {"id": "b", "type": "fail", "data": {"message": "disk full"}},
                {"id": "c", "type": "input"}
            ],
            "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "c"}]
        }),
    );

    let out = weaver(&config, &["run", wf.to_str().unwrap()]);
    assert!(!out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("disk full"));
    assert!(stdout.contains("1 skipped"));
}

#[tokio::test]
async fn test_runner_persists_terminal_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("runs.db")).unwrap());

    let mock = MockExecutor::new().fail("c", "bad branch");
    let mut executors = ExecutorRegistry::new();
    executors.register("task", mock.clone());

    let engine = Arc::new(Engine::new(Arc::new(EventBus::default())));
    let runner = WorkflowRunner::new(
        engine.clone(),
        Arc::new(executors),
        RunnerConfig::from(&test_config()),
    )
    .with_store(store.clone());

    let ok = WorkflowDef::new("diamond").with_node(NodeDef::new("solo", "task"));
    let first = runner.run(&ok).await.unwrap();
    let second = runner.run(&diamond("task")).await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert_eq!(second.skipped_nodes, 1);

    let records = store.list_executions("diamond").await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .any(|r| r.execution_id == second.execution_id && r.status == ExecutionStatus::Failed));

    let loaded = store.load_workflow("diamond").await.unwrap().unwrap();
    assert_eq!(loaded.nodes.len(), 4);

    let stats = engine.statistics(Some("diamond"));
    assert_eq!(stats.total_executions, 2);
    assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);
}
