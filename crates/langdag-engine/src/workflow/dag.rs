use std::collections::{BTreeSet, HashMap};

use langdag_core::error::{LangdagError, Result};
use langdag_core::workflow::Workflow;

/// Order the workflow's nodes so every edge points forward.
///
/// Kahn's algorithm; among ready nodes the one declared first goes first.
/// Edges naming undeclared ids are ignored here (the validator reports them).
/// Nodes left over after the queue drains sit on or behind a cycle and are
/// returned in `LangdagError::Cycle`.
pub fn topological_sort(workflow: &Workflow) -> Result<Vec<String>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in workflow.nodes.iter().enumerate() {
        index.entry(node.id.as_str()).or_insert(i);
    }

    let n = workflow.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in &workflow.edges {
        if let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
            successors[from].push(to);
            in_degree[to] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..n)
        .filter(|&i| in_degree[i] == 0 && index.get(workflow.nodes[i].id.as_str()) == Some(&i))
        .collect();
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];

    while let Some(current) = ready.pop_first() {
        placed[current] = true;
        order.push(workflow.nodes[current].id.clone());
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    let residual: Vec<String> = index
        .values()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|&i| !placed[i])
        .map(|i| workflow.nodes[i].id.clone())
        .collect();

    if residual.is_empty() {
        Ok(order)
    } else {
        Err(LangdagError::Cycle(residual))
    }
}
