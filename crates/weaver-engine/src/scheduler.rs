//! Topological planner.
//!
//! Produces the static execution order (which doubles as cycle validation)
//! and the dynamic ready set. Both walk the arena in insertion order, so the
//! results are reproducible for the same graph.

use weaver_core::error::{Result, WeaverError};
use weaver_core::types::NodeStatus;

use crate::graph::{ExecutionNode, NodeIndex};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first post-order over `dependents`, reversed.
///
/// Iterative so deep chains cannot overflow the stack. Roots and children are
/// visited in reverse insertion order, which makes independent nodes come out
/// in insertion order. A back edge to a node still on the DFS stack fails with
/// the cycle's path.
pub fn topological_order(nodes: &[ExecutionNode]) -> Result<Vec<NodeIndex>> {
    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut post_order = Vec::with_capacity(nodes.len());
    // (node, number of dependents already explored)
    let mut stack: Vec<(NodeIndex, usize)> = Vec::new();

    for root in (0..nodes.len()).rev() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::OnStack;
        stack.push((root, 0));

        while let Some(&(node, explored)) = stack.last() {
            let dependents = &nodes[node].dependents;
            if explored == dependents.len() {
                marks[node] = Mark::Done;
                post_order.push(node);
                stack.pop();
                continue;
            }

            let top = stack.len() - 1;
            stack[top].1 += 1;
            let child = dependents[dependents.len() - 1 - explored];

            match marks[child] {
                Mark::Unvisited => {
                    marks[child] = Mark::OnStack;
                    stack.push((child, 0));
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|&(n, _)| n == child).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|&(n, _)| nodes[n].id.clone()).collect();
                    path.push(nodes[child].id.clone());
                    return Err(WeaverError::CycleDetected { path });
                }
                Mark::Done => {}
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}

/// Pending nodes whose dependencies have all completed, in insertion order.
///
/// Full rescan, O(V + E).
pub fn ready_set(nodes: &[ExecutionNode]) -> Vec<NodeIndex> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.status == NodeStatus::Pending)
        .filter(|(_, node)| {
            node.dependencies
                .iter()
                .all(|&dep| nodes[dep].status == NodeStatus::Completed)
        })
        .map(|(i, _)| i)
        .collect()
}
