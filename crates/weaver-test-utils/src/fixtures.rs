use std::path::{Path, PathBuf};

use weaver_core::config::AppConfig;
use weaver_core::types::{NodeDef, WorkflowDef};

/// Linear workflow `a -> b -> c ...` of `len` nodes, all of `node_type`.
pub fn chain(node_type: &str, len: usize) -> WorkflowDef {
    let ids: Vec<String> = (0..len).map(node_name).collect();
    let mut wf = WorkflowDef::new(format!("chain-{len}"));
    for id in &ids {
        wf = wf.with_node(NodeDef::new(id.clone(), node_type));
    }
    for pair in ids.windows(2) {
        wf = wf.with_edge(pair[0].clone(), pair[1].clone());
    }
    wf
}

/// `a -> {b, c} -> d`.
pub fn diamond(node_type: &str) -> WorkflowDef {
    WorkflowDef::new("diamond")
        .with_node(NodeDef::new("a", node_type))
        .with_node(NodeDef::new("b", node_type))
        .with_node(NodeDef::new("c", node_type))
        .with_node(NodeDef::new("d", node_type))
        .with_edge("a", "b")
        .with_edge("a", "c")
        .with_edge("b", "d")
        .with_edge("c", "d")
}

/// Config with short timeouts and millisecond backoff.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.timeout_secs = 10;
    config.engine.node_timeout_secs = 5;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

/// Write a workflow as JSON into `dir` and return its path.
pub fn write_workflow(dir: &Path, workflow: &WorkflowDef) -> PathBuf {
    let path = dir.join(format!("{}.json", workflow.id));
    let json = serde_json::to_string_pretty(workflow).unwrap();
    std::fs::write(&path, json).unwrap();
    path
}

fn node_name(i: usize) -> String {
    // a..z, then n26, n27, ...
    if i < 26 {
        ((b'a' + i as u8) as char).to_string()
    } else {
        format!("n{i}")
    }
}
