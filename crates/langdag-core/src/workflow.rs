use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ToolDefinition;

/// Kind of a workflow template node.
///
/// Parsed from a plain string so that definitions with an unknown kind still
/// load and the validator can report them alongside every other problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowNodeKind {
    Input,
    Output,
    Llm,
    Tool,
    Branch,
    Merge,
    Unknown(String),
}

impl WorkflowNodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for WorkflowNodeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "input" => Self::Input,
            "output" => Self::Output,
            "llm" => Self::Llm,
            "tool" => Self::Tool,
            "branch" => Self::Branch,
            "merge" => Self::Merge,
            _ => Self::Unknown(s),
        }
    }
}

impl From<WorkflowNodeKind> for String {
    fn from(kind: WorkflowNodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for WorkflowNodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node spec inside a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WorkflowNodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: WorkflowNodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            model: None,
            system: None,
            prompt: None,
            tools: vec![],
            handler: None,
            condition: None,
        }
    }

    pub fn input(id: impl Into<String>) -> Self {
        Self::new(id, WorkflowNodeKind::Input)
    }

    pub fn output(id: impl Into<String>) -> Self {
        Self::new(id, WorkflowNodeKind::Output)
    }

    pub fn llm(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::new(id, WorkflowNodeKind::Llm)
        }
    }

    pub fn merge(id: impl Into<String>) -> Self {
        Self::new(id, WorkflowNodeKind::Merge)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

/// An edge connecting two template nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            transform: None,
        }
    }
}

/// Default settings applied to llm nodes that do not override them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A versioned, named workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: WorkflowDefaults,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            version: 0,
            description: None,
            defaults: WorkflowDefaults::default(),
            tools: vec![],
            nodes: vec![],
            edges: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Look up a template node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn input_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == WorkflowNodeKind::Input)
    }

    pub fn output_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == WorkflowNodeKind::Output)
    }

    /// Ids of the sources of every edge pointing at `id`, in edge order.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Ids of the targets of every edge leaving `id`, in edge order.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// A single validation problem, located by field path (e.g. `nodes[2].id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
