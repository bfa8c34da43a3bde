//! Providers and fixtures shared by the LangDAG test suites.
//!
//! None of these touch the network. Each provider produces a well-formed
//! event sequence (`Start`, deltas, `Done`) unless it is built to fail.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use langdag_core::error::{LangdagError, Result};
use langdag_core::traits::Provider;
use langdag_core::types::*;
use langdag_core::workflow::{Workflow, WorkflowNode};

fn test_models() -> Vec<ModelInfo> {
    vec![ModelInfo {
        id: "test-model".into(),
        name: "Test Model".into(),
        context_window: 8_192,
        max_output: 1_024,
    }]
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Build a finished response for `request` carrying `text`.
pub fn response_for(request: &CompletionRequest, text: &str) -> CompletionResponse {
    let input_tokens = request.messages.iter().map(|m| word_count(&m.content)).sum();
    CompletionResponse {
        id: "msg_test".into(),
        model: request.model.clone(),
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage {
            input_tokens,
            output_tokens: word_count(text),
        },
    }
}

fn scripted_events(request: &CompletionRequest, chunks: &[String]) -> Vec<ProviderEvent> {
    let text = chunks.concat();
    let mut events = vec![ProviderEvent::Start];
    events.extend(chunks.iter().cloned().map(ProviderEvent::Delta));
    events.push(ProviderEvent::ContentDone(ContentBlock::Text { text: text.clone() }));
    events.push(ProviderEvent::Done(response_for(request, &text)));
    events
}

/// Replies with a fixed list of delta chunks, whatever the request.
pub struct ScriptedProvider {
    chunks: Vec<String>,
}

impl ScriptedProvider {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> Vec<ModelInfo> {
        test_models()
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move { Ok(response_for(&request, &self.chunks.concat())) })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move { Ok(stream::iter(scripted_events(&request, &self.chunks)).boxed()) })
    }
}

/// Replies with the content of the last user message and records every
/// request it receives.
#[derive(Default)]
pub struct EchoProvider {
    requests: Mutex<Vec<CompletionRequest>>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn reply(&self, request: &CompletionRequest) -> String {
        self.requests.lock().unwrap().push(request.clone());
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn models(&self) -> Vec<ModelInfo> {
        test_models()
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let text = self.reply(&request);
            Ok(response_for(&request, &text))
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move {
            let text = self.reply(&request);
            Ok(stream::iter(scripted_events(&request, &[text])).boxed())
        })
    }
}

/// Opens a stream that fails straight after `Start`; batch calls fail
/// outright.
pub struct FailingProvider {
    message: String,
}

impl FailingProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn models(&self) -> Vec<ModelInfo> {
        test_models()
    }

    fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move { Err(LangdagError::Provider(self.message.clone())) })
    }

    fn stream(
        &self,
        _request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move {
            let events = vec![
                ProviderEvent::Start,
                ProviderEvent::Error(LangdagError::Provider(self.message.clone())),
            ];
            Ok(stream::iter(events).boxed())
        })
    }
}

/// Like [`ScriptedProvider`], but waits `delay` before every delta.
pub struct SlowProvider {
    chunks: Vec<String>,
    delay: Duration,
}

impl SlowProvider {
    pub fn new<I, S>(chunks: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay,
        }
    }
}

impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn models(&self) -> Vec<ModelInfo> {
        test_models()
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay * self.chunks.len() as u32).await;
            Ok(response_for(&request, &self.chunks.concat()))
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move {
            let delay = self.delay;
            let events = stream::iter(scripted_events(&request, &self.chunks)).then(move |event| async move {
                if matches!(event, ProviderEvent::Delta(_)) {
                    tokio::time::sleep(delay).await;
                }
                event
            });
            Ok(events.boxed())
        })
    }
}

/// A root user node with a title, as the conversation engine creates it.
pub fn user_root(content: &str) -> Node {
    Node::root(NodeKind::User, content)
        .with_title(content)
        .with_status(NodeStatus::Completed)
}

pub fn assistant_reply(parent: &Node, content: &str) -> Node {
    Node::child_of(parent, NodeKind::Assistant, content)
        .with_model("test-model")
        .with_status(NodeStatus::Completed)
}

pub fn user_turn(parent: &Node, content: &str) -> Node {
    Node::child_of(parent, NodeKind::User, content).with_status(NodeStatus::Completed)
}

/// `input -> llm(prompt) -> output`.
pub fn linear_workflow(name: &str, prompt: &str) -> Workflow {
    Workflow::new(name)
        .with_node(WorkflowNode::input("input"))
        .with_node(WorkflowNode::llm("step", prompt))
        .with_node(WorkflowNode::output("output"))
        .with_edge("input", "step")
        .with_edge("step", "output")
}

/// `input -> {a, b} -> merge -> output`.
pub fn diamond_workflow(name: &str) -> Workflow {
    Workflow::new(name)
        .with_node(WorkflowNode::input("input"))
        .with_node(WorkflowNode::llm("a", "A: {{input}}"))
        .with_node(WorkflowNode::llm("b", "B: {{input}}"))
        .with_node(WorkflowNode::merge("join"))
        .with_node(WorkflowNode::output("output"))
        .with_edge("input", "a")
        .with_edge("input", "b")
        .with_edge("a", "join")
        .with_edge("b", "join")
        .with_edge("join", "output")
}
