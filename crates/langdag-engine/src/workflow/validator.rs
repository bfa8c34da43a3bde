use std::collections::HashSet;

use langdag_core::error::{LangdagError, Result};
use langdag_core::workflow::{ValidationError, Workflow, WorkflowNodeKind};

use super::dag::topological_sort;

/// State key holding the run input. Only the input node may use it as an id.
pub const INPUT_KEY: &str = "input";

/// Outcome of validating a workflow definition.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(field, message));
    }

    /// One line per error, `field: message`.
    pub fn format_errors(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(LangdagError::ValidationFailed(self.errors))
        }
    }
}

/// Check a workflow's structure, collecting every violation.
pub fn validate(workflow: &Workflow) -> ValidationResult {
    let mut result = ValidationResult::default();

    if workflow.name.trim().is_empty() {
        result.push("name", "name is required");
    }
    if workflow.nodes.is_empty() {
        result.push("nodes", "at least one node is required");
    }

    let declared_tools: HashSet<&str> = workflow.tools.iter().map(|t| t.name.as_str()).collect();
    let mut ids: HashSet<&str> = HashSet::new();
    let mut seen_input = false;
    let mut seen_output = false;

    for (i, node) in workflow.nodes.iter().enumerate() {
        if node.id.is_empty() {
            result.push(format!("nodes[{i}].id"), "node id is required");
            continue;
        }
        if !ids.insert(node.id.as_str()) {
            result.push(
                format!("nodes[{i}].id"),
                format!("duplicate node id: {}", node.id),
            );
        }
        if node.id == INPUT_KEY && node.kind != WorkflowNodeKind::Input {
            result.push(
                format!("nodes[{i}].id"),
                format!("node id '{INPUT_KEY}' is reserved for the input node"),
            );
        }

        match &node.kind {
            WorkflowNodeKind::Unknown(kind) => {
                result.push(
                    format!("nodes[{i}].type"),
                    format!("invalid node type: {kind}"),
                );
            }
            WorkflowNodeKind::Input => {
                if seen_input {
                    result.push(format!("nodes[{i}]"), "multiple input nodes are not allowed");
                }
                seen_input = true;
            }
            WorkflowNodeKind::Output => {
                if seen_output {
                    result.push(format!("nodes[{i}]"), "multiple output nodes are not allowed");
                }
                seen_output = true;
            }
            WorkflowNodeKind::Branch => {
                if node.condition.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    result.push(
                        format!("nodes[{i}].condition"),
                        "branch nodes require a condition",
                    );
                }
            }
            WorkflowNodeKind::Tool => {
                if node.handler.as_deref().map_or(true, |h| h.trim().is_empty()) {
                    result.push(format!("nodes[{i}].handler"), "tool nodes require a handler");
                }
            }
            WorkflowNodeKind::Llm | WorkflowNodeKind::Merge => {}
        }
    }

    for (i, node) in workflow.nodes.iter().enumerate() {
        for tool in &node.tools {
            if !declared_tools.contains(tool.as_str()) {
                result.push(format!("nodes[{i}].tools"), format!("unknown tool: {tool}"));
            }
        }
    }

    for (i, edge) in workflow.edges.iter().enumerate() {
        for (end, id) in [("from", &edge.from), ("to", &edge.to)] {
            if id.is_empty() {
                result.push(format!("edges[{i}].{end}"), format!("edge '{end}' is required"));
            } else if !ids.contains(id.as_str()) {
                result.push(format!("edges[{i}].{end}"), format!("unknown node: {id}"));
            }
        }
        if !edge.from.is_empty() && edge.from == edge.to {
            result.push(format!("edges[{i}]"), "self-loops are not allowed");
        }
    }

    // Self-loops already have their own error; only look for longer cycles.
    let mut without_self_loops = workflow.clone();
    without_self_loops.edges.retain(|e| e.from != e.to);
    if let Err(e) = topological_sort(&without_self_loops) {
        result.push("edges", e.to_string());
    }

    result.valid = result.errors.is_empty();
    result
}
