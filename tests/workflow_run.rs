use std::sync::Arc;

use serde_json::json;

use langdag_core::error::LangdagError;
use langdag_core::event::ExecutionEvent;
use langdag_core::traits::NodeStore;
use langdag_core::types::{NodeKind, NodeStatus};
use langdag_core::workflow::{WorkflowNode, WorkflowNodeKind};
use langdag_engine::{parse_yaml, validate, RunOptions, WorkflowExecutor, WorkflowManager};
use langdag_store::SqliteStore;
use langdag_test_utils::{diamond_workflow, linear_workflow, EchoProvider};

const ECHO_YAML: &str = r#"
name: echo-chain
description: Echo the input through one llm call
nodes:
  - id: input
    type: input
  - id: say
    type: llm
    prompt: "echo: {{input}}"
  - id: output
    type: output
edges:
  - from: input
    to: say
  - from: say
    to: output
"#;

fn setup() -> (Arc<SqliteStore>, WorkflowManager, WorkflowExecutor) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let manager = WorkflowManager::new(store.clone());
    let executor = WorkflowExecutor::new(store.clone(), Arc::new(EchoProvider::new()));
    (store, manager, executor)
}

#[tokio::test]
async fn test_stored_yaml_workflow_runs() {
    let (store, manager, executor) = setup();
    let created = manager.create(parse_yaml(ECHO_YAML).unwrap()).await.unwrap();

    let wf = manager.resolve("echo-chain").await.unwrap();
    assert_eq!(wf.id, created.id);

    let result = executor.run(&wf, json!("X"), RunOptions::default()).await.unwrap();
    assert_eq!(result.output, json!("echo: X"));

    let root = store.get(&result.root_id).await.unwrap();
    assert_eq!(root.kind, NodeKind::System);
    assert_eq!(root.status, Some(NodeStatus::Completed));
    assert_eq!(root.content, "\"echo: X\"");

    // Runs show up next to conversations.
    let roots = store.list_roots().await.unwrap();
    assert!(roots.iter().any(|r| r.id == result.root_id));
}

#[tokio::test]
async fn test_passthrough_keeps_payload() {
    let (_, _, executor) = setup();
    let wf = langdag_core::workflow::Workflow::new("passthrough")
        .with_node(WorkflowNode::input("input"))
        .with_node(WorkflowNode::output("output"))
        .with_edge("input", "output");
    let payload = json!({"nested": {"list": [1, "two", null]}});
    let result = executor.run(&wf, payload.clone(), RunOptions::default()).await.unwrap();
    assert_eq!(result.output, payload);
}

#[tokio::test]
async fn test_diamond_runs_in_topological_order() {
    let (store, _, executor) = setup();
    let events = executor
        .execute(&diamond_workflow("diamond"), json!("q"), RunOptions::default())
        .await
        .unwrap()
        .collect()
        .await;

    let started: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeStarted { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["input", "a", "b", "join", "output"]);

    let (output, root_id) = match events.last() {
        Some(ExecutionEvent::Done { output, root_id }) => (output.clone(), root_id.clone()),
        other => panic!("expected Done, got {other:?}"),
    };
    assert_eq!(output, json!({"a": "A: q", "b": "B: q"}));

    let steps = store.children(&root_id).await.unwrap();
    let prompts: Vec<&str> = steps.iter().map(|s| s.content.as_str()).collect();
    assert_eq!(prompts, vec!["A: q", "B: q"]);
}

#[tokio::test]
async fn test_invalid_definition_is_rejected_everywhere() {
    let (store, manager, executor) = setup();
    let mut wf = linear_workflow("cyclic", "{{input}}");
    wf = wf.with_edge("output", "step");

    let report = validate(&wf);
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.field == "edges"));

    assert!(matches!(
        manager.create(wf.clone()).await.unwrap_err(),
        LangdagError::ValidationFailed(_)
    ));
    assert!(matches!(
        executor.execute(&wf, json!(1), RunOptions::default()).await.err(),
        Some(LangdagError::ValidationFailed(_))
    ));
    assert!(store.list_roots().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tool_node_fails_run_but_keeps_earlier_steps() {
    let (store, _, executor) = setup();
    let mut tool = WorkflowNode::new("lookup", WorkflowNodeKind::Tool);
    tool.handler = Some("db.lookup".into());
    let wf = langdag_core::workflow::Workflow::new("tooling")
        .with_node(WorkflowNode::input("input"))
        .with_node(WorkflowNode::llm("first", "first {{input}}"))
        .with_node(tool)
        .with_node(WorkflowNode::output("output"))
        .with_edge("input", "first")
        .with_edge("first", "lookup")
        .with_edge("lookup", "output");

    let events = executor
        .execute(&wf, json!("x"), RunOptions::default())
        .await
        .unwrap()
        .collect()
        .await;

    let root_id = match events.last() {
        Some(ExecutionEvent::Error {
            node_id,
            error,
            root_id,
        }) => {
            assert_eq!(node_id.as_deref(), Some("lookup"));
            assert!(error.contains("Unsupported"));
            root_id.clone()
        }
        other => panic!("expected Error, got {other:?}"),
    };
    assert!(!events.iter().any(|e| matches!(e, ExecutionEvent::Done { .. })));

    let root = store.get(&root_id).await.unwrap();
    assert_eq!(root.status, Some(NodeStatus::Failed));
    assert_eq!(store.children(&root_id).await.unwrap().len(), 1);
}
