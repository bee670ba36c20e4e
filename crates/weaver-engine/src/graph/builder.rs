use std::collections::{HashMap, HashSet};

use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::types::{EdgeDef, NodeDef, WorkflowDef};

use super::node::{ExecutionNode, NodeIndex};
use crate::execution::Execution;
use crate::scheduler;

/// Build a pending [`Execution`] from a workflow definition.
pub fn build_workflow(workflow: &WorkflowDef) -> Result<Execution> {
    build(&workflow.id, &workflow.nodes, &workflow.edges)
}

/// Build a pending [`Execution`] from a node list and an edge list.
///
/// Fails on duplicate node ids, edges naming unknown nodes, self-loops, and
/// cycles. Repeated edges between the same pair are collapsed into one.
pub fn build(workflow_id: &str, nodes: &[NodeDef], edges: &[EdgeDef]) -> Result<Execution> {
    let mut index: HashMap<String, NodeIndex> = HashMap::with_capacity(nodes.len());
    let mut arena: Vec<ExecutionNode> = Vec::with_capacity(nodes.len());

    for def in nodes {
        if index.insert(def.id.clone(), arena.len()).is_some() {
            return Err(WeaverError::DuplicateNode(def.id.clone()));
        }
        arena.push(ExecutionNode::from_def(def));
    }

    let mut seen: HashSet<(NodeIndex, NodeIndex)> = HashSet::with_capacity(edges.len());
    for edge in edges {
        let source = lookup(&index, &edge.source, edge)?;
        let target = lookup(&index, &edge.target, edge)?;
        if source == target {
            return Err(WeaverError::SelfLoop(edge.source.clone()));
        }
        if !seen.insert((source, target)) {
            debug!(edge = %edge, "Dropping duplicate edge");
            continue;
        }
        arena[source].dependents.push(target);
        arena[target].dependencies.push(source);
    }

    let order = scheduler::topological_order(&arena)?;
    let execution_order = order.into_iter().map(|i| arena[i].id.clone()).collect();

    Ok(Execution::new(workflow_id, arena, index, execution_order))
}

fn lookup(index: &HashMap<String, NodeIndex>, id: &str, edge: &EdgeDef) -> Result<NodeIndex> {
    index.get(id).copied().ok_or_else(|| WeaverError::UnknownNode {
        node: id.to_string(),
        edge: edge.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_core::types::{ExecutionStatus, NodeStatus};

    fn nodes(ids: &[&str]) -> Vec<NodeDef> {
        ids.iter().map(|id| NodeDef::new(*id, "test")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<EdgeDef> {
        pairs.iter().map(|(s, t)| EdgeDef::new(*s, *t)).collect()
    }

    #[test]
    fn test_build_chain() {
        let exec = build("wf", &nodes(&["a", "b", "c"]), &edges(&[("a", "b"), ("b", "c")])).unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Pending);
        assert_eq!(exec.workflow_id(), "wf");
        assert_eq!(exec.execution_order(), ["a", "b", "c"]);
        assert!(exec.current_batch().is_empty());

        let b = exec.node("b").unwrap();
        assert_eq!(b.status, NodeStatus::Pending);
        assert_eq!(exec.dependency_ids("b"), vec!["a"]);
        assert_eq!(exec.dependent_ids("b"), vec!["c"]);
    }

    #[test]
    fn test_relations_are_transposed() {
        let exec = build(
            "wf",
            &nodes(&["a", "b", "c", "d"]),
            &edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]),
        )
        .unwrap();
        for node in exec.nodes() {
            for dep in exec.dependency_ids(&node.id) {
                assert!(exec.dependent_ids(dep).contains(&node.id.as_str()));
            }
            for dep in exec.dependent_ids(&node.id) {
                assert!(exec.dependency_ids(dep).contains(&node.id.as_str()));
            }
        }
    }

    #[test]
    fn test_duplicate_edges_collapsed() {
        let exec = build("wf", &nodes(&["a", "b"]), &edges(&[("a", "b"), ("a", "b")])).unwrap();
        assert_eq!(exec.dependency_ids("b"), vec!["a"]);
        assert_eq!(exec.dependent_ids("a"), vec!["b"]);
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = build("wf", &nodes(&["a"]), &edges(&[("a", "a")])).unwrap_err();
        assert!(matches!(err, WeaverError::SelfLoop(ref n) if n == "a"));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let err = build("wf", &nodes(&["a"]), &edges(&[("a", "ghost")])).unwrap_err();
        match err {
            WeaverError::UnknownNode { node, edge } => {
                assert_eq!(node, "ghost");
                assert_eq!(edge, "a -> ghost");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = build("wf", &nodes(&["a"]), &edges(&[("ghost", "a")])).unwrap_err();
        assert!(matches!(err, WeaverError::UnknownNode { ref node, .. } if node == "ghost"));
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let err = build("wf", &nodes(&["a", "b"]), &edges(&[("a", "b"), ("b", "a")])).unwrap_err();
        match err {
            WeaverError::CycleDetected { path } => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = build("wf", &nodes(&["a", "a"]), &[]).unwrap_err();
        assert!(matches!(err, WeaverError::DuplicateNode(ref n) if n == "a"));
    }

    #[test]
    fn test_build_workflow_def() {
        let wf = WorkflowDef::new("wf-7")
            .with_node(NodeDef::new("in", "input"))
            .with_node(NodeDef::new("out", "output"))
            .with_edge("in", "out");
        let exec = build_workflow(&wf).unwrap();
        assert_eq!(exec.workflow_id(), "wf-7");
        assert_eq!(exec.node_count(), 2);
    }

    #[test]
    fn test_empty_graph() {
        let exec = build("wf", &[], &[]).unwrap();
        assert_eq!(exec.node_count(), 0);
        assert!(exec.execution_order().is_empty());
    }
}
