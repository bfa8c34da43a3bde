use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use langdag_core::config::EngineConfig;
use langdag_core::error::{LangdagError, Result};
use langdag_core::event::{self, EventSender, EventStream, ExecutionEvent};
use langdag_core::traits::{NodeStore, Provider};
use langdag_core::types::*;
use langdag_core::workflow::{Workflow, WorkflowNode, WorkflowNodeKind};

use super::dag::topological_sort;
use super::template;
use super::validator::{validate, INPUT_KEY};
use crate::stream::{complete_or_cancel, send_or_cancel, stream_completion};

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Forward provider deltas from llm nodes as `NodeDelta` events.
    pub stream: bool,
}

/// Final result of a run drained with [`WorkflowExecutor::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub root_id: String,
    pub output: Value,
}

/// Runs validated workflows node by node in topological order.
pub struct WorkflowExecutor {
    store: Arc<dyn NodeStore>,
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl WorkflowExecutor {
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

    /// Cancel every run started by this executor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Start a run.
    ///
    /// Validation failures and store errors while creating the run root fail
    /// the call. Everything after that is reported on the returned stream,
    /// which always ends with `Done` or `Error`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: Value,
        options: RunOptions,
    ) -> Result<EventStream<ExecutionEvent>> {
        let report = validate(workflow);
        if !report.valid {
            warn!(
                workflow = %workflow.name,
                errors = report.errors.len(),
                "Workflow validation failed"
            );
            return Err(LangdagError::ValidationFailed(report.errors));
        }

        let order = topological_sort(workflow).map_err(|e| {
            LangdagError::InternalInvariant(format!("validated workflow has no complete order: {e}"))
        })?;

        let mut root = Node::root(NodeKind::System, serde_json::to_string(&input)?)
            .with_title(workflow.name.clone())
            .with_status(NodeStatus::Running);
        root.model = workflow.defaults.model.clone();
        self.store.create(&root).await?;

        info!(
            workflow = %workflow.name,
            root_id = %root.id,
            nodes = order.len(),
            stream = options.stream,
            "Workflow run started"
        );

        let run = Run {
            store: self.store.clone(),
            provider: self.provider.clone(),
            config: self.config.clone(),
            workflow: workflow.clone(),
            order,
            root,
            options,
            state: HashMap::from([(INPUT_KEY.to_string(), input)]),
            current: None,
        };

        let (tx, rx) = event::channel(self.config.event_buffer, self.cancel.child_token());
        tokio::spawn(run.drive(tx));
        Ok(rx)
    }

    /// Run to completion and return the final output.
    pub async fn run(&self, workflow: &Workflow, input: Value, options: RunOptions) -> Result<RunResult> {
        let mut events = self.execute(workflow, input, options).await?;
        while let Some(event) = events.next().await {
            match event {
                ExecutionEvent::Done { output, root_id } => return Ok(RunResult { root_id, output }),
                ExecutionEvent::Error { error, root_id, .. } => {
                    return Err(LangdagError::RunFailed { root_id, error })
                }
                _ => {}
            }
        }
        Err(LangdagError::InternalInvariant(
            "workflow run ended without a terminal event".into(),
        ))
    }
}

/// One in-flight run. Owned by its worker task.
struct Run {
    store: Arc<dyn NodeStore>,
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    workflow: Workflow,
    order: Vec<String>,
    root: Node,
    options: RunOptions,
    state: HashMap<String, Value>,
    current: Option<String>,
}

impl Run {
    async fn drive(mut self, tx: EventSender<ExecutionEvent>) {
        let started = Instant::now();
        let root_id = self.root.id.clone();

        let terminal = match self.execute_nodes(&tx).await {
            Ok(output) => match self.finish(&output).await {
                Ok(()) => {
                    info!(
                        root_id = %root_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Workflow run completed"
                    );
                    ExecutionEvent::Done { output, root_id }
                }
                Err(e) => {
                    error!(root_id = %root_id, error = %e, "Failed to record run completion");
                    self.root.status = Some(NodeStatus::Failed);
                    if let Err(update) = self.store.update(&self.root).await {
                        error!(root_id = %root_id, error = %update, "Failed to record run failure");
                    }
                    ExecutionEvent::Error {
                        node_id: None,
                        error: e.to_string(),
                        root_id,
                    }
                }
            },
            Err(e) => {
                let status = if matches!(e, LangdagError::Cancelled) || tx.is_cancelled() {
                    NodeStatus::Cancelled
                } else {
                    NodeStatus::Failed
                };
                warn!(
                    root_id = %root_id,
                    node_id = self.current.as_deref().unwrap_or("-"),
                    status = %status,
                    error = %e,
                    "Workflow run failed"
                );
                self.root.status = Some(status);
                if let Err(update) = self.store.update(&self.root).await {
                    error!(root_id = %root_id, error = %update, "Failed to record run failure");
                }
                ExecutionEvent::Error {
                    node_id: self.current.take(),
                    error: e.to_string(),
                    root_id,
                }
            }
        };
        let _ = tx.send(terminal).await;
    }

    async fn execute_nodes(&mut self, tx: &EventSender<ExecutionEvent>) -> Result<Value> {
        let order = std::mem::take(&mut self.order);
        for (index, id) in order.iter().enumerate() {
            let node = self
                .workflow
                .node(id)
                .cloned()
                .ok_or_else(|| LangdagError::InternalInvariant(format!("ordered node {id} is not declared")))?;
            self.current = Some(id.clone());

            send_or_cancel(
                tx,
                ExecutionEvent::NodeStarted {
                    node_id: id.clone(),
                    kind: node.kind.clone(),
                },
            )
            .await?;
            debug!(root_id = %self.root.id, node_id = %id, kind = %node.kind, "Node started");

            let output = self.dispatch(&node, index, tx).await?;
            self.state.insert(id.clone(), output.clone());

            send_or_cancel(
                tx,
                ExecutionEvent::NodeComplete {
                    node_id: id.clone(),
                    output,
                },
            )
            .await?;
        }
        self.current = None;

        let output = self
            .workflow
            .output_node()
            .and_then(|n| self.state.get(&n.id))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(output)
    }

    async fn dispatch(
        &self,
        node: &WorkflowNode,
        index: usize,
        tx: &EventSender<ExecutionEvent>,
    ) -> Result<Value> {
        match &node.kind {
            WorkflowNodeKind::Input => Ok(self.state.get(INPUT_KEY).cloned().unwrap_or(Value::Null)),
            WorkflowNodeKind::Output => Ok(self.output_of(node)),
            WorkflowNodeKind::Llm => self.run_llm(node, index, tx).await,
            WorkflowNodeKind::Merge => Ok(self.merge(node)),
            WorkflowNodeKind::Branch => {
                warn!(
                    node_id = %node.id,
                    condition = node.condition.as_deref().unwrap_or_default(),
                    "Branch conditions are not evaluated; passing through"
                );
                Ok(Value::Null)
            }
            WorkflowNodeKind::Tool => Err(LangdagError::Unsupported(format!(
                "tool node {} (handler {}): tool handlers are not executed",
                node.id,
                node.handler.as_deref().unwrap_or("-")
            ))),
            WorkflowNodeKind::Unknown(kind) => Err(LangdagError::Unsupported(format!(
                "node {} has unknown type {kind}",
                node.id
            ))),
        }
    }

    fn output_of(&self, node: &WorkflowNode) -> Value {
        let preds = self.workflow.predecessors(&node.id);
        if preds.len() > 1 {
            warn!(
                node_id = %node.id,
                predecessors = preds.len(),
                "Output node has several predecessors; using the first"
            );
        }
        preds
            .first()
            .and_then(|p| self.state.get(*p))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn merge(&self, node: &WorkflowNode) -> Value {
        let merged: Map<String, Value> = self
            .workflow
            .predecessors(&node.id)
            .into_iter()
            .map(|p| (p.to_string(), self.state.get(p).cloned().unwrap_or(Value::Null)))
            .collect();
        Value::Object(merged)
    }

    async fn run_llm(
        &self,
        node: &WorkflowNode,
        index: usize,
        tx: &EventSender<ExecutionEvent>,
    ) -> Result<Value> {
        let prompt = template::render(node.prompt.as_deref().unwrap_or_default(), &self.state);
        let defaults = &self.workflow.defaults;
        let model = node
            .model
            .clone()
            .or_else(|| defaults.model.clone())
            .unwrap_or_else(|| self.config.default_model.clone());

        let request = CompletionRequest {
            model: model.clone(),
            messages: vec![Message::user(prompt.clone())],
            system: node.system.clone(),
            max_tokens: defaults.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: defaults.temperature,
            tools: node
                .tools
                .iter()
                .filter_map(|name| self.workflow.tool(name).cloned())
                .collect(),
        };

        let started = Instant::now();
        let response = if self.options.stream {
            let node_id = node.id.clone();
            stream_completion(self.provider.as_ref(), request, tx, move |text| {
                ExecutionEvent::NodeDelta {
                    node_id: node_id.clone(),
                    text,
                }
            })
            .await?
        } else {
            complete_or_cancel(self.provider.as_ref(), request, tx).await?
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut step = Node::child_of(&self.root, NodeKind::Assistant, prompt)
            .with_model(model)
            .with_status(NodeStatus::Completed);
        step.sequence = index as i64 + 1;
        step.tokens_in = Some(response.usage.input_tokens);
        step.tokens_out = Some(response.usage.output_tokens);
        step.latency_ms = Some(latency_ms);
        if tx.is_cancelled() {
            return Err(LangdagError::Cancelled);
        }
        self.store.create(&step).await?;

        debug!(
            root_id = %self.root.id,
            node_id = %node.id,
            step_id = %step.id,
            tokens_out = response.usage.output_tokens,
            elapsed_ms = latency_ms,
            "LLM step saved"
        );
        Ok(Value::String(response.text()))
    }

    async fn finish(&mut self, output: &Value) -> Result<()> {
        self.root.status = Some(NodeStatus::Completed);
        self.root.content = serde_json::to_string(output)?;
        self.store.update(&self.root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use langdag_core::workflow::WorkflowNode;
    use langdag_store::SqliteStore;
    use futures::future::BoxFuture;
    use langdag_test_utils::{EchoProvider, FailingProvider, ScriptedProvider, SlowProvider};
    use serde_json::json;
    use std::time::Duration;

    /// Sqlite store that refuses to mark anything completed.
    struct NoCompletionStore(SqliteStore);

    impl NodeStore for NoCompletionStore {
        fn create(&self, node: &Node) -> BoxFuture<'_, Result<()>> {
            self.0.create(node)
        }
        fn get(&self, id: &str) -> BoxFuture<'_, Result<Node>> {
            self.0.get(id)
        }
        fn get_by_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Node>> {
            self.0.get_by_prefix(prefix)
        }
        fn ancestors(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
            self.0.ancestors(id)
        }
        fn subtree(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
            self.0.subtree(id)
        }
        fn children(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
            self.0.children(id)
        }
        fn list_roots(&self) -> BoxFuture<'_, Result<Vec<Node>>> {
            self.0.list_roots()
        }
        fn update(&self, node: &Node) -> BoxFuture<'_, Result<()>> {
            if node.status == Some(NodeStatus::Completed) {
                return Box::pin(async { Err(LangdagError::Database("disk full".into())) });
            }
            self.0.update(node)
        }
        fn delete(&self, id: &str) -> BoxFuture<'_, Result<usize>> {
            self.0.delete(id)
        }
    }

    fn executor(provider: Arc<dyn Provider>) -> (Arc<SqliteStore>, WorkflowExecutor) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = WorkflowExecutor::new(store.clone(), provider);
        (store, exec)
    }

    fn passthrough() -> Workflow {
        Workflow::new("passthrough")
            .with_node(WorkflowNode::input("in"))
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "out")
    }

    fn echo_chain() -> Workflow {
        Workflow::new("echo")
            .with_node(WorkflowNode::input("in"))
            .with_node(WorkflowNode::llm("say", "echo: {{input}}"))
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "say")
            .with_edge("say", "out")
    }

    #[tokio::test]
    async fn test_passthrough_returns_input() {
        let (store, exec) = executor(Arc::new(EchoProvider::new()));
        let input = json!({"x": [1, 2, 3]});
        let result = exec
            .run(&passthrough(), input.clone(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.output, input);

        let root = store.get(&result.root_id).await.unwrap();
        assert_eq!(root.kind, NodeKind::System);
        assert_eq!(root.status, Some(NodeStatus::Completed));
        assert_eq!(root.title.as_deref(), Some("passthrough"));
        assert_eq!(serde_json::from_str::<Value>(&root.content).unwrap(), input);
    }

    #[tokio::test]
    async fn test_llm_template_and_step_record() {
        let (store, exec) = executor(Arc::new(EchoProvider::new()));
        let result = exec
            .run(&echo_chain(), json!("X"), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.output, json!("echo: X"));

        let steps = store.children(&result.root_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].content, "echo: X");
        assert_eq!(steps[0].sequence, 2);
        assert!(steps[0].latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_event_order_with_streaming() {
        let (_, exec) = executor(Arc::new(ScriptedProvider::new(["al", "pha"])));
        let events = exec
            .execute(&echo_chain(), json!("X"), RunOptions { stream: true })
            .await
            .unwrap()
            .collect()
            .await;

        let kinds: Vec<String> = events
            .iter()
            .map(|e| match e {
                ExecutionEvent::NodeStarted { node_id, .. } => format!("start:{node_id}"),
                ExecutionEvent::NodeDelta { text, .. } => format!("delta:{text}"),
                ExecutionEvent::NodeComplete { node_id, .. } => format!("done:{node_id}"),
                ExecutionEvent::Error { .. } => "error".into(),
                ExecutionEvent::Done { .. } => "finished".into(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "start:in", "done:in", "start:say", "delta:al", "delta:pha", "done:say",
                "start:out", "done:out", "finished",
            ]
        );
        match events.last() {
            Some(ExecutionEvent::Done { output, .. }) => assert_eq!(output, &json!("alpha")),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merge_collects_predecessors() {
        let wf = Workflow::new("merge")
            .with_node(WorkflowNode::input("in"))
            .with_node(WorkflowNode::llm("a", "A {{in}}"))
            .with_node(WorkflowNode::llm("b", "B {{in.output}}"))
            .with_node(WorkflowNode::merge("m"))
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "a")
            .with_edge("in", "b")
            .with_edge("a", "m")
            .with_edge("b", "m")
            .with_edge("m", "out");
        let (_, exec) = executor(Arc::new(EchoProvider::new()));
        let result = exec.run(&wf, json!("q"), RunOptions::default()).await.unwrap();
        assert_eq!(result.output, json!({"a": "A q", "b": "B q"}));
    }

    #[tokio::test]
    async fn test_invalid_workflow_fails_call() {
        let (store, exec) = executor(Arc::new(EchoProvider::new()));
        let wf = Workflow::new("bad").with_node(WorkflowNode::llm("", "x"));
        let err = exec.execute(&wf, json!(null), RunOptions::default()).await.err().unwrap();
        assert!(matches!(err, LangdagError::ValidationFailed(_)));
        assert!(store.list_roots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_marks_root_failed() {
        let (store, exec) = executor(Arc::new(FailingProvider::new("boom")));
        let events = exec
            .execute(&echo_chain(), json!("X"), RunOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        let (node_id, root_id) = match events.last() {
            Some(ExecutionEvent::Error { node_id, root_id, error }) => {
                assert!(error.contains("boom"));
                (node_id.clone(), root_id.clone())
            }
            other => panic!("expected Error, got {other:?}"),
        };
        assert_eq!(node_id.as_deref(), Some("say"));
        let root = store.get(&root_id).await.unwrap();
        assert_eq!(root.status, Some(NodeStatus::Failed));
    }

    #[tokio::test]
    async fn test_tool_node_is_unsupported() {
        let mut tool = WorkflowNode::new("t", WorkflowNodeKind::Tool);
        tool.handler = Some("lookup".into());
        let wf = Workflow::new("tools")
            .with_node(WorkflowNode::input("in"))
            .with_node(tool)
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "t")
            .with_edge("t", "out");
        let (_, exec) = executor(Arc::new(EchoProvider::new()));
        let err = exec.run(&wf, json!(1), RunOptions::default()).await.unwrap_err();
        match err {
            LangdagError::RunFailed { error, .. } => assert!(error.contains("Unsupported")),
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_branch_passes_null() {
        let mut branch = WorkflowNode::new("br", WorkflowNodeKind::Branch);
        branch.condition = Some("input == 'yes'".into());
        let wf = Workflow::new("branchy")
            .with_node(WorkflowNode::input("in"))
            .with_node(branch)
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "br")
            .with_edge("br", "out");
        let (_, exec) = executor(Arc::new(EchoProvider::new()));
        let result = exec.run(&wf, json!("yes"), RunOptions::default()).await.unwrap();
        assert_eq!(result.output, Value::Null);
    }

    #[tokio::test]
    async fn test_node_overrides_and_defaults_reach_provider() {
        let provider = Arc::new(EchoProvider::new());
        let (_, exec) = executor(provider.clone());
        let mut wf = echo_chain();
        wf.defaults.model = Some("default-model".into());
        wf.defaults.max_tokens = Some(128);
        wf.nodes[1] = WorkflowNode::llm("say", "hi").with_system("be brief");
        exec.run(&wf, json!("X"), RunOptions::default()).await.unwrap();

        let req = provider.last_request().unwrap();
        assert_eq!(req.model, "default-model");
        assert_eq!(req.max_tokens, 128);
        assert_eq!(req.system.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn test_cancel_mid_llm_node_marks_root_cancelled() {
        let provider = Arc::new(SlowProvider::new(["a", "b", "c"], Duration::from_millis(50)));
        let (store, exec) = executor(provider);
        let mut events = exec
            .execute(&echo_chain(), json!("X"), RunOptions { stream: true })
            .await
            .unwrap();

        loop {
            match events.next().await {
                Some(ExecutionEvent::NodeDelta { node_id, .. }) => {
                    assert_eq!(node_id, "say");
                    break;
                }
                Some(event) => assert!(!event.is_terminal(), "run ended early: {event:?}"),
                None => panic!("stream closed before any delta"),
            }
        }
        events.cancel();
        let rest = events.collect().await;

        let root_id = match rest.last() {
            Some(ExecutionEvent::Error { node_id, root_id, .. }) => {
                assert_eq!(node_id.as_deref(), Some("say"));
                root_id.clone()
            }
            other => panic!("expected Error, got {other:?}"),
        };
        assert!(!rest.iter().any(|e| matches!(e, ExecutionEvent::Done { .. })));

        let root = store.get(&root_id).await.unwrap();
        assert_eq!(root.status, Some(NodeStatus::Cancelled));
        assert!(store.children(&root_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_completion_record_marks_root_failed() {
        let store = Arc::new(NoCompletionStore(SqliteStore::in_memory().unwrap()));
        let exec = WorkflowExecutor::new(store.clone(), Arc::new(EchoProvider::new()));
        let events = exec
            .execute(&passthrough(), json!("X"), RunOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        let root_id = match events.last() {
            Some(ExecutionEvent::Error { node_id, root_id, error }) => {
                assert!(node_id.is_none());
                assert!(error.contains("disk full"));
                root_id.clone()
            }
            other => panic!("expected Error, got {other:?}"),
        };
        let root = store.get(&root_id).await.unwrap();
        assert_eq!(root.status, Some(NodeStatus::Failed));
    }
}
