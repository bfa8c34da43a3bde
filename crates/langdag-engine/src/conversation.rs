use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use langdag_core::config::EngineConfig;
use langdag_core::error::{LangdagError, Result};
use langdag_core::event::{self, ConversationEvent, EventSender, EventStream};
use langdag_core::traits::{NodeStore, Provider};
use langdag_core::types::*;

use crate::stream::stream_completion;

const TITLE_MAX_CHARS: usize = 50;

/// Builds conversation branches on top of the node tree.
///
/// Every prompt creates a user node synchronously, then hands the provider
/// call to a spawned worker that reports through a bounded [`EventStream`].
pub struct ConversationEngine {
    store: Arc<dyn NodeStore>,
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    cancel: CancellationToken,
}

/// Everything a worker needs to finish one turn.
struct Turn {
    store: Arc<dyn NodeStore>,
    provider: Arc<dyn Provider>,
    request: CompletionRequest,
    user_node: Node,
}

impl ConversationEngine {
    pub fn new(store: Arc<dyn NodeStore>, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            provider,
            config: EngineConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Cancel every in-flight turn started by this engine.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Start a new conversation.
    ///
    /// Creates a root user node (sequence 0) titled after the message, then
    /// streams the assistant reply. Store failures fail the call; provider
    /// failures arrive as the terminal event of the returned stream.
    pub async fn prompt(
        &self,
        message: &str,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<EventStream<ConversationEvent>> {
        let model = model.unwrap_or(self.config.default_model.as_str()).to_string();
        let root = Node::root(NodeKind::User, message)
            .with_title(auto_title(message))
            .with_system_prompt(system_prompt.map(str::to_string))
            .with_model(&model)
            .with_status(NodeStatus::Completed);
        self.store.create(&root).await?;

        info!(root_id = %root.id, model = %model, "Conversation started");

        let request = self.request(model, vec![Message::user(message)], root.system_prompt.clone());
        Ok(self.spawn_turn(request, root))
    }

    /// Continue from any existing node, creating a new branch.
    ///
    /// History is the root-to-parent path; calling this twice on the same
    /// parent forks the conversation.
    pub async fn prompt_from(
        &self,
        parent_id: &str,
        message: &str,
        model: Option<&str>,
    ) -> Result<EventStream<ConversationEvent>> {
        let path = self.store.ancestors(parent_id).await?;
        let (root, parent) = match (path.first(), path.last()) {
            (Some(root), Some(parent)) => (root, parent),
            _ => return Err(LangdagError::not_found("node", parent_id)),
        };

        let model = model
            .map(str::to_string)
            .or_else(|| root.model.clone())
            .unwrap_or_else(|| self.config.default_model.clone());
        let system = root.system_prompt.clone();

        let mut messages = history(&path);
        messages.push(Message::user(message));

        let user_node = Node::child_of(parent, NodeKind::User, message)
            .with_model(&model)
            .with_status(NodeStatus::Completed);
        self.store.create(&user_node).await?;

        debug!(
            parent_id = %parent.id,
            node_id = %user_node.id,
            history = messages.len(),
            "Continuing conversation"
        );

        let request = self.request(model, messages, system);
        Ok(self.spawn_turn(request, user_node))
    }

    /// Drain a prompt stream and return the saved assistant node.
    pub async fn complete(&self, mut events: EventStream<ConversationEvent>) -> Result<Node> {
        while let Some(event) = events.next().await {
            match event {
                ConversationEvent::NodeSaved { node_id } => return self.store.get(&node_id).await,
                ConversationEvent::Error { error } => return Err(LangdagError::Provider(error)),
                ConversationEvent::Start { .. } | ConversationEvent::Delta { .. } => {}
            }
        }
        Err(LangdagError::ProviderStream(
            "conversation stream closed without a terminal event".into(),
        ))
    }

    /// Replace the title of a root node.
    pub async fn update_title(&self, root_id: &str, title: &str) -> Result<()> {
        let mut root = self.store.get(root_id).await?;
        if !root.is_root() {
            return Err(LangdagError::not_found("root node", root_id));
        }
        root.title = Some(title.to_string());
        self.store.update(&root).await
    }

    /// Look a node up by full id or unique prefix.
    pub async fn resolve_node(&self, id_or_prefix: &str) -> Result<Node> {
        self.store.resolve(id_or_prefix).await
    }

    /// Every node under `root_id`, sequence ascending.
    pub async fn tree(&self, root_id: &str) -> Result<Vec<Node>> {
        self.store.subtree(root_id).await
    }

    fn request(
        &self,
        model: String,
        messages: Vec<Message>,
        system: Option<String>,
    ) -> CompletionRequest {
        CompletionRequest {
            model,
            messages,
            system,
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
        }
    }

    fn spawn_turn(&self, request: CompletionRequest, user_node: Node) -> EventStream<ConversationEvent> {
        let (tx, rx) = event::channel(self.config.event_buffer, self.cancel.child_token());
        let turn = Turn {
            store: self.store.clone(),
            provider: self.provider.clone(),
            request,
            user_node,
        };
        tokio::spawn(turn.run(tx));
        rx
    }
}

impl Turn {
    async fn run(self, tx: EventSender<ConversationEvent>) {
        let start = ConversationEvent::Start {
            user_node_id: self.user_node.id.clone(),
        };
        // Sent even when already cancelled so the stream always opens with Start.
        if !tx.send(start).await {
            debug!(node_id = %self.user_node.id, "Consumer gone before start");
            return;
        }

        let terminal = match self.reply(&tx).await {
            Ok(node_id) => ConversationEvent::NodeSaved { node_id },
            Err(e) => {
                if matches!(e, LangdagError::Cancelled) {
                    info!(node_id = %self.user_node.id, "Prompt cancelled");
                } else {
                    warn!(node_id = %self.user_node.id, error = %e, "Prompt failed");
                }
                ConversationEvent::Error {
                    error: e.to_string(),
                }
            }
        };
        // The consumer may already be gone; nothing left to do either way.
        let _ = tx.send(terminal).await;
    }

    async fn reply(&self, tx: &EventSender<ConversationEvent>) -> Result<String> {
        let started = Instant::now();
        let model = self.request.model.clone();

        let response = stream_completion(
            self.provider.as_ref(),
            self.request.clone(),
            tx,
            |text| ConversationEvent::Delta { text },
        )
        .await?;

        let content = if response.has_tool_use() {
            serde_json::to_string(&response.content)?
        } else {
            response.text()
        };

        let mut node = Node::child_of(&self.user_node, NodeKind::Assistant, content)
            .with_model(model)
            .with_status(NodeStatus::Completed);
        node.tokens_in = Some(response.usage.input_tokens);
        node.tokens_out = Some(response.usage.output_tokens);
        node.latency_ms = Some(started.elapsed().as_millis() as u64);

        if tx.is_cancelled() {
            return Err(LangdagError::Cancelled);
        }
        self.store.create(&node).await?;

        info!(
            node_id = %node.id,
            parent_id = %self.user_node.id,
            tokens_out = response.usage.output_tokens,
            elapsed_ms = node.latency_ms.unwrap_or_default(),
            "Assistant node saved"
        );
        Ok(node.id)
    }
}

/// Provider history for a root-to-node path. Kinds without a role are skipped.
fn history(path: &[Node]) -> Vec<Message> {
    path.iter()
        .filter_map(|node| {
            node.kind.history_role().map(|role| Message {
                role,
                content: node.content.clone(),
            })
        })
        .collect()
}

/// First 50 characters of the message, ellipsis-truncated when longer.
pub fn auto_title(message: &str) -> String {
    if message.chars().count() > TITLE_MAX_CHARS {
        let head: String = message.chars().take(TITLE_MAX_CHARS - 3).collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}
