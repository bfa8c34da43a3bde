use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use langdag_core::error::{LangdagError, Result};
use langdag_core::traits::WorkflowStore;
use langdag_core::workflow::Workflow;

use crate::store::{format_ts, SqliteStore};

impl SqliteStore {
    fn insert_workflow(&self, wf: &Workflow) -> Result<()> {
        let conn = self.lock()?;

        let exists = conn
            .query_row("SELECT 1 FROM workflows WHERE id = ?1", params![wf.id], |_| Ok(()))
            .optional()
            .map_err(|e| LangdagError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Err(LangdagError::Conflict(format!("workflow {} already exists", wf.id)));
        }
        ensure_name_free(&conn, &wf.name, &wf.id)?;

        let definition = serde_json::to_string(wf)?;
        conn.execute(
            "INSERT INTO workflows (id, name, version, description, definition, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                wf.id,
                wf.name,
                wf.version,
                wf.description,
                definition,
                format_ts(&wf.created_at),
                format_ts(&wf.updated_at),
            ],
        )
        .map_err(|e| LangdagError::Database(e.to_string()))?;

        debug!(workflow_id = %wf.id, name = %wf.name, "Workflow stored");
        Ok(())
    }

    fn find_workflow(&self, column: &str, value: &str) -> Result<Workflow> {
        let conn = self.lock()?;
        let definition: Option<String> = conn
            .query_row(
                &format!("SELECT definition FROM workflows WHERE {column} = ?1"),
                params![value],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LangdagError::Database(e.to_string()))?;
        let definition = definition.ok_or_else(|| LangdagError::not_found("workflow", value))?;
        Ok(serde_json::from_str(&definition)?)
    }

    fn all_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT definition FROM workflows ORDER BY created_at DESC, rowid DESC")
            .map_err(|e| LangdagError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        let mut workflows = Vec::new();
        for row in rows {
            let definition = row.map_err(|e| LangdagError::Database(e.to_string()))?;
            workflows.push(serde_json::from_str(&definition)?);
        }
        Ok(workflows)
    }

    fn replace_workflow(&self, wf: &Workflow) -> Result<()> {
        let conn = self.lock()?;
        ensure_name_free(&conn, &wf.name, &wf.id)?;

        let definition = serde_json::to_string(wf)?;
        let changed = conn
            .execute(
                "UPDATE workflows SET name = ?2, version = ?3, description = ?4,
                    definition = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    wf.id,
                    wf.name,
                    wf.version,
                    wf.description,
                    definition,
                    format_ts(&wf.updated_at),
                ],
            )
            .map_err(|e| LangdagError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(LangdagError::not_found("workflow", &wf.id));
        }
        Ok(())
    }

    fn remove_workflow(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .map_err(|e| LangdagError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(LangdagError::not_found("workflow", id));
        }
        Ok(())
    }
}

fn ensure_name_free(conn: &Connection, name: &str, id: &str) -> Result<()> {
    let taken = conn
        .query_row(
            "SELECT 1 FROM workflows WHERE name = ?1 AND id != ?2",
            params![name, id],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| LangdagError::Database(e.to_string()))?
        .is_some();
    if taken {
        return Err(LangdagError::Conflict(format!("workflow name '{name}' is taken")));
    }
    Ok(())
}

impl WorkflowStore for SqliteStore {
    fn create_workflow(&self, wf: &Workflow) -> BoxFuture<'_, Result<()>> {
        let wf = wf.clone();
        Box::pin(async move { self.insert_workflow(&wf) })
    }

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Workflow>> {
        let id = id.to_string();
        Box::pin(async move { self.find_workflow("id", &id) })
    }

    fn get_workflow_by_name(&self, name: &str) -> BoxFuture<'_, Result<Workflow>> {
        let name = name.to_string();
        Box::pin(async move { self.find_workflow("name", &name) })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        Box::pin(async move { self.all_workflows() })
    }

    fn update_workflow(&self, wf: &Workflow) -> BoxFuture<'_, Result<()>> {
        let wf = wf.clone();
        Box::pin(async move { self.replace_workflow(&wf) })
    }

    fn delete_workflow(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move { self.remove_workflow(&id) })
    }
}
