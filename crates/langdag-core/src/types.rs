use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LangdagError;

/// Generate a fresh node id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Kind of a persisted tree node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    User,
    Assistant,
    System,
    ToolCall,
    ToolResult,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }

    /// Provider role used when this node is replayed as history.
    /// System and tool-call nodes are not replayed.
    pub fn history_role(&self) -> Option<Role> {
        match self {
            Self::User | Self::ToolResult => Some(Role::User),
            Self::Assistant => Some(Role::Assistant),
            Self::System | Self::ToolCall => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = LangdagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(LangdagError::Parse(format!("unknown node kind: {other}"))),
        }
    }
}

/// Execution status recorded on a node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = LangdagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(LangdagError::Parse(format!("unknown node status: {other}"))),
        }
    }
}

/// One persisted unit of the conversation/workflow tree.
///
/// Parent links are ids, never pointers. `title` and `system_prompt` are only
/// meaningful on roots and must be `None` everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub sequence: i64,
    pub kind: NodeKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// A new root node (sequence 0, no parent).
    pub fn root(kind: NodeKind, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            parent_id: None,
            sequence: 0,
            kind,
            content: content.into(),
            model: None,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
            status: None,
            title: None,
            system_prompt: None,
            created_at: Utc::now(),
        }
    }

    /// A new child of `parent`, one step further along the branch.
    pub fn child_of(parent: &Node, kind: NodeKind, content: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent.id.clone()),
            sequence: parent.sequence + 1,
            ..Self::root(kind, content)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Check the invariants that can be verified without the store.
    pub fn check_shape(&self) -> crate::error::Result<()> {
        if self.id.is_empty() {
            return Err(LangdagError::InvalidNode("node id is empty".into()));
        }
        if !self.is_root() && (self.title.is_some() || self.system_prompt.is_some()) {
            return Err(LangdagError::InvalidNode(format!(
                "non-root node {} carries root metadata",
                self.id
            )));
        }
        Ok(())
    }
}

/// Role in a provider conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A role-tagged message sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// A single content block of a provider response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Tool definition passed through to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// Request to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

/// Stop reason from the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_turn" => Some(Self::EndTurn),
            "tool_use" => Some(Self::ToolUse),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            _ => None,
        }
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A complete provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub usage: Usage,
}

impl CompletionResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// An event from a provider stream.
#[derive(Debug)]
pub enum ProviderEvent {
    /// The provider accepted the request.
    Start,
    /// A chunk of text content.
    Delta(String),
    /// A content block finished.
    ContentDone(ContentBlock),
    /// The response is complete.
    Done(CompletionResponse),
    /// The stream failed.
    Error(LangdagError),
}

/// Model advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_window: u32,
    pub max_output: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_sequence_follows_parent() {
        let root = Node::root(NodeKind::User, "hi").with_title("hi");
        let child = Node::child_of(&root, NodeKind::Assistant, "hello");
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.sequence, 1);
        assert!(child.title.is_none());
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn test_check_shape_rejects_root_metadata_on_child() {
        let root = Node::root(NodeKind::User, "hi");
        let mut child = Node::child_of(&root, NodeKind::User, "again");
        assert!(child.check_shape().is_ok());
        child.title = Some("nope".into());
        assert!(matches!(
            child.check_shape(),
            Err(LangdagError::InvalidNode(_))
        ));
    }

    #[test]
    fn test_history_roles() {
        assert_eq!(NodeKind::User.history_role(), Some(Role::User));
        assert_eq!(NodeKind::Assistant.history_role(), Some(Role::Assistant));
        assert_eq!(NodeKind::ToolResult.history_role(), Some(Role::User));
        assert_eq!(NodeKind::System.history_role(), None);
        assert_eq!(NodeKind::ToolCall.history_role(), None);
    }

    #[test]
    fn test_kind_and_status_parse() {
        for kind in [
            NodeKind::User,
            NodeKind::Assistant,
            NodeKind::System,
            NodeKind::ToolCall,
            NodeKind::ToolResult,
        ] {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), kind);
        }
        assert!("llm".parse::<NodeKind>().is_err());
        assert_eq!("failed".parse::<NodeStatus>().unwrap(), NodeStatus::Failed);
    }

    #[test]
    fn test_response_text_joins_text_blocks() {
        let resp = CompletionResponse {
            id: "msg_1".into(),
            model: "m".into(),
            content: vec![
                ContentBlock::Text { text: "Hel".into() },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::Text { text: "lo".into() },
            ],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
        };
        assert_eq!(resp.text(), "Hello");
        assert!(resp.has_tool_use());
    }
}
