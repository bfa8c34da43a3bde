use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::*;
use crate::workflow::Workflow;

/// Durable tree persistence.
pub trait NodeStore: Send + Sync + 'static {
    /// Insert a node. Fails with `Conflict` if the id exists and `NotFound`
    /// if its parent does not.
    fn create(&self, node: &Node) -> BoxFuture<'_, Result<()>>;

    /// Exact-id lookup.
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Node>>;

    /// Unique-prefix lookup. An exact id match always wins.
    fn get_by_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Node>>;

    /// Root-to-node inclusive path, sequence ascending.
    fn ancestors(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>>;

    /// The node and all its descendants, sequence ascending.
    fn subtree(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>>;

    /// Direct children, sequence ascending.
    fn children(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>>;

    /// All parent-less nodes, most recent first.
    fn list_roots(&self) -> BoxFuture<'_, Result<Vec<Node>>>;

    /// Update mutable fields. Identity, parent and sequence are left untouched.
    fn update(&self, node: &Node) -> BoxFuture<'_, Result<()>>;

    /// Delete a node and its whole subtree atomically. Returns the number of
    /// removed nodes.
    fn delete(&self, id: &str) -> BoxFuture<'_, Result<usize>>;

    /// Exact lookup falling back to prefix lookup.
    fn resolve<'a>(&'a self, id_or_prefix: &'a str) -> BoxFuture<'a, Result<Node>> {
        Box::pin(async move {
            match self.get(id_or_prefix).await {
                Err(e) if e.is_not_found() => self.get_by_prefix(id_or_prefix).await,
                other => other,
            }
        })
    }
}

/// Persistence for workflow templates.
pub trait WorkflowStore: Send + Sync + 'static {
    fn create_workflow(&self, wf: &Workflow) -> BoxFuture<'_, Result<()>>;

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Workflow>>;

    fn get_workflow_by_name(&self, name: &str) -> BoxFuture<'_, Result<Workflow>>;

    /// All workflows, newest first.
    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>>;

    fn update_workflow(&self, wf: &Workflow) -> BoxFuture<'_, Result<()>>;

    fn delete_workflow(&self, id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Text completion capability.
pub trait Provider: Send + Sync + 'static {
    /// Provider name (e.g., "anthropic", "mock").
    fn name(&self) -> &str;

    /// Models this provider advertises.
    fn models(&self) -> Vec<ModelInfo>;

    /// Send a request and wait for the whole response.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>>;

    /// Send a request and receive a stream of events. Failures after the
    /// stream opens arrive as `ProviderEvent::Error`.
    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>>;
}
