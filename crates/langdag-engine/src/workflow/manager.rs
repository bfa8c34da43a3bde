use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use langdag_core::error::Result;
use langdag_core::traits::WorkflowStore;
use langdag_core::workflow::Workflow;

use super::validator::validate;

/// Validated CRUD over stored workflow templates.
pub struct WorkflowManager {
    store: Arc<dyn WorkflowStore>,
}

impl WorkflowManager {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Validate and store a new workflow. Assigns an id and version 1 when
    /// the definition carries none.
    pub async fn create(&self, mut workflow: Workflow) -> Result<Workflow> {
        validate(&workflow).into_result()?;

        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        if workflow.version == 0 {
            workflow.version = 1;
        }
        let now = Utc::now();
        workflow.created_at = now;
        workflow.updated_at = now;

        self.store.create_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow created");
        Ok(workflow)
    }

    /// Replace a stored workflow, bumping its version.
    pub async fn update(&self, mut workflow: Workflow) -> Result<Workflow> {
        validate(&workflow).into_result()?;

        let existing = self.store.get_workflow(&workflow.id).await?;
        workflow.version = existing.version + 1;
        workflow.created_at = existing.created_at;
        workflow.updated_at = Utc::now();

        self.store.update_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            version = workflow.version,
            "Workflow updated"
        );
        Ok(workflow)
    }

    pub async fn get(&self, id: &str) -> Result<Workflow> {
        self.store.get_workflow(id).await
    }

    /// Look a workflow up by id, then by name.
    pub async fn resolve(&self, id_or_name: &str) -> Result<Workflow> {
        match self.store.get_workflow(id_or_name).await {
            Err(e) if e.is_not_found() => self.store.get_workflow_by_name(id_or_name).await,
            other => other,
        }
    }

    pub async fn list(&self) -> Result<Vec<Workflow>> {
        self.store.list_workflows().await
    }

    pub async fn delete(&self, id_or_name: &str) -> Result<Workflow> {
        let workflow = self.resolve(id_or_name).await?;
        self.store.delete_workflow(&workflow.id).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow deleted");
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use langdag_core::error::LangdagError;
    use langdag_core::workflow::WorkflowNode;
    use langdag_store::SqliteStore;

    fn manager() -> WorkflowManager {
        WorkflowManager::new(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    fn simple(name: &str) -> Workflow {
        Workflow::new(name)
            .with_node(WorkflowNode::input("in"))
            .with_node(WorkflowNode::output("out"))
            .with_edge("in", "out")
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let mgr = manager();
        let wf = mgr.create(simple("one")).await.unwrap();
        assert!(!wf.id.is_empty());
        assert_eq!(wf.version, 1);

        let by_name = mgr.resolve("one").await.unwrap();
        assert_eq!(by_name.id, wf.id);
        let by_id = mgr.resolve(&wf.id).await.unwrap();
        assert_eq!(by_id.name, "one");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let mgr = manager();
        let err = mgr.create(Workflow::new("")).await.unwrap_err();
        assert!(matches!(err, LangdagError::ValidationFailed(_)));

        mgr.create(simple("dup")).await.unwrap();
        let err = mgr.create(simple("dup")).await.unwrap_err();
        assert!(matches!(err, LangdagError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let mgr = manager();
        let created = mgr.create(simple("versioned")).await.unwrap();

        let mut changed = created.clone();
        changed.description = Some("now with a description".into());
        let updated = mgr.update(changed).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(
            updated.created_at.timestamp_micros(),
            created.created_at.timestamp_micros()
        );

        let stored = mgr.get(&created.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.description.as_deref(), Some("now with a description"));
    }

    #[tokio::test]
    async fn test_delete_by_name() {
        let mgr = manager();
        mgr.create(simple("gone")).await.unwrap();
        mgr.delete("gone").await.unwrap();
        assert!(mgr.resolve("gone").await.unwrap_err().is_not_found());
        assert!(mgr.list().await.unwrap().is_empty());
    }
}
