use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use langdag_core::error::{LangdagError, Result};
use langdag_core::traits::NodeStore;
use langdag_core::types::Node;

use crate::schema;

const NODE_COLUMNS: &str = "id, parent_id, sequence, node_type, content, model, tokens_in, \
     tokens_out, latency_ms, status, title, system_prompt, created_at";

/// SQLite-backed node tree and workflow store.
///
/// All access goes through one connection behind a mutex, so a child
/// insert and a cascading delete of its parent never interleave.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LangdagError::Database(format!("Failed to create db directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        schema::migrate(&conn)?;

        info!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        schema::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        schema::schema_version(&conn)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LangdagError::Database(e.to_string()))
    }

    fn insert_node(&self, node: &Node) -> Result<()> {
        node.check_shape()?;
        let conn = self.lock()?;

        let exists: bool = conn
            .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![node.id], |_| Ok(()))
            .optional()
            .map_err(|e| LangdagError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Err(LangdagError::Conflict(format!("node {} already exists", node.id)));
        }

        if let Some(parent_id) = &node.parent_id {
            let parent_seq: Option<i64> = conn
                .query_row(
                    "SELECT sequence FROM nodes WHERE id = ?1",
                    params![parent_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| LangdagError::Database(e.to_string()))?;
            let parent_seq =
                parent_seq.ok_or_else(|| LangdagError::not_found("parent node", parent_id))?;
            if node.sequence <= parent_seq {
                return Err(LangdagError::InvalidNode(format!(
                    "sequence {} must exceed parent sequence {}",
                    node.sequence, parent_seq
                )));
            }
        }

        conn.execute(
            &format!(
                "INSERT INTO nodes ({NODE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                node.id,
                node.parent_id,
                node.sequence,
                node.kind.as_str(),
                node.content,
                node.model,
                node.tokens_in.map(|v| v as i64),
                node.tokens_out.map(|v| v as i64),
                node.latency_ms.map(|v| v as i64),
                node.status.map(|s| s.as_str()),
                node.title,
                node.system_prompt,
                format_ts(&node.created_at),
            ],
        )
        .map_err(|e| LangdagError::Database(e.to_string()))?;

        debug!(node_id = %node.id, kind = %node.kind, sequence = node.sequence, "Node created");
        Ok(())
    }

    fn find_node(&self, id: &str) -> Result<Node> {
        let conn = self.lock()?;
        query_nodes(
            &conn,
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![id],
        )?
        .pop()
        .ok_or_else(|| LangdagError::not_found("node", id))
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Node> {
        if prefix.is_empty() {
            return Err(LangdagError::not_found("node with prefix", "''"));
        }
        let conn = self.lock()?;

        if let Some(exact) = query_nodes(
            &conn,
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![prefix],
        )?
        .pop()
        {
            return Ok(exact);
        }

        let mut matches = query_nodes(
            &conn,
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes
                 WHERE substr(id, 1, length(?1)) = ?1"
            ),
            params![prefix],
        )?;
        match matches.len() {
            0 => Err(LangdagError::not_found("node with prefix", prefix)),
            1 => Ok(matches.remove(0)),
            n => Err(LangdagError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                matches: n,
            }),
        }
    }

    fn find_ancestors(&self, id: &str) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        let path = query_nodes(
            &conn,
            &format!(
                "WITH RECURSIVE path(id, parent_id) AS (
                    SELECT id, parent_id FROM nodes WHERE id = ?1
                    UNION ALL
                    SELECT n.id, n.parent_id FROM nodes n
                    JOIN path p ON n.id = p.parent_id
                 )
                 SELECT {NODE_COLUMNS} FROM nodes
                 WHERE id IN (SELECT id FROM path)
                 ORDER BY sequence ASC"
            ),
            params![id],
        )?;
        if path.is_empty() {
            return Err(LangdagError::not_found("node", id));
        }
        Ok(path)
    }

    fn find_subtree(&self, id: &str) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        let nodes = query_nodes(
            &conn,
            &format!(
                "WITH RECURSIVE tree(id) AS (
                    SELECT id FROM nodes WHERE id = ?1
                    UNION ALL
                    SELECT n.id FROM nodes n
                    JOIN tree t ON n.parent_id = t.id
                 )
                 SELECT {NODE_COLUMNS} FROM nodes
                 WHERE id IN (SELECT id FROM tree)
                 ORDER BY sequence ASC, created_at ASC, rowid ASC"
            ),
            params![id],
        )?;
        if nodes.is_empty() {
            return Err(LangdagError::not_found("node", id));
        }
        Ok(nodes)
    }

    fn find_children(&self, id: &str) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        query_nodes(
            &conn,
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes
                 WHERE parent_id = ?1
                 ORDER BY sequence ASC, created_at ASC, rowid ASC"
            ),
            params![id],
        )
    }

    fn find_roots(&self) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        query_nodes(
            &conn,
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes
                 WHERE parent_id IS NULL
                 ORDER BY created_at DESC, rowid DESC"
            ),
            params![],
        )
    }

    fn update_node(&self, node: &Node) -> Result<()> {
        node.check_shape()?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE nodes SET
                    content = ?2,
                    status = ?3,
                    model = ?4,
                    tokens_in = ?5,
                    tokens_out = ?6,
                    latency_ms = ?7,
                    title = CASE WHEN parent_id IS NULL THEN ?8 ELSE NULL END,
                    system_prompt = CASE WHEN parent_id IS NULL THEN ?9 ELSE NULL END
                 WHERE id = ?1",
                params![
                    node.id,
                    node.content,
                    node.status.map(|s| s.as_str()),
                    node.model,
                    node.tokens_in.map(|v| v as i64),
                    node.tokens_out.map(|v| v as i64),
                    node.latency_ms.map(|v| v as i64),
                    node.title,
                    node.system_prompt,
                ],
            )
            .map_err(|e| LangdagError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(LangdagError::not_found("node", &node.id));
        }
        Ok(())
    }

    fn delete_subtree(&self, id: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "WITH RECURSIVE tree(id) AS (
                        SELECT id FROM nodes WHERE id = ?1
                        UNION ALL
                        SELECT n.id FROM nodes n
                        JOIN tree t ON n.parent_id = t.id
                     )
                     SELECT id FROM tree",
                )
                .map_err(|e| LangdagError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![id], |row| row.get(0))
                .map_err(|e| LangdagError::Database(e.to_string()))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(|e| LangdagError::Database(e.to_string()))?
        };
        if ids.is_empty() {
            return Err(LangdagError::not_found("node", id));
        }

        // Deepest first so no row is ever left pointing at a removed parent
        for node_id in ids.iter().rev() {
            tx.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])
                .map_err(|e| LangdagError::Database(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| LangdagError::Database(e.to_string()))?;

        info!(node_id = %id, removed = ids.len(), "Subtree deleted");
        Ok(ids.len())
    }
}

impl NodeStore for SqliteStore {
    fn create(&self, node: &Node) -> BoxFuture<'_, Result<()>> {
        let node = node.clone();
        Box::pin(async move { self.insert_node(&node) })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Node>> {
        let id = id.to_string();
        Box::pin(async move { self.find_node(&id) })
    }

    fn get_by_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Node>> {
        let prefix = prefix.to_string();
        Box::pin(async move { self.find_by_prefix(&prefix) })
    }

    fn ancestors(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
        let id = id.to_string();
        Box::pin(async move { self.find_ancestors(&id) })
    }

    fn subtree(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
        let id = id.to_string();
        Box::pin(async move { self.find_subtree(&id) })
    }

    fn children(&self, id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
        let id = id.to_string();
        Box::pin(async move { self.find_children(&id) })
    }

    fn list_roots(&self) -> BoxFuture<'_, Result<Vec<Node>>> {
        Box::pin(async move { self.find_roots() })
    }

    fn update(&self, node: &Node) -> BoxFuture<'_, Result<()>> {
        let node = node.clone();
        Box::pin(async move { self.update_node(&node) })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<usize>> {
        let id = id.to_string();
        Box::pin(async move { self.delete_subtree(&id) })
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LangdagError::Database(format!("bad timestamp '{s}': {e}")))
}

/// Raw column values of one `nodes` row.
struct NodeRow {
    id: String,
    parent_id: Option<String>,
    sequence: i64,
    kind: String,
    content: String,
    model: Option<String>,
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    latency_ms: Option<i64>,
    status: Option<String>,
    title: Option<String>,
    system_prompt: Option<String>,
    created_at: String,
}

impl NodeRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            sequence: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            model: row.get(5)?,
            tokens_in: row.get(6)?,
            tokens_out: row.get(7)?,
            latency_ms: row.get(8)?,
            status: row.get(9)?,
            title: row.get(10)?,
            system_prompt: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_node(self) -> Result<Node> {
        Ok(Node {
            id: self.id,
            parent_id: self.parent_id,
            sequence: self.sequence,
            kind: self.kind.parse()?,
            content: self.content,
            model: self.model,
            tokens_in: self.tokens_in.map(|v| v as u64),
            tokens_out: self.tokens_out.map(|v| v as u64),
            latency_ms: self.latency_ms.map(|v| v as u64),
            status: self.status.map(|s| s.parse()).transpose()?,
            title: self.title,
            system_prompt: self.system_prompt,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn query_nodes<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Node>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| LangdagError::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params, NodeRow::read)
        .map_err(|e| LangdagError::Database(e.to_string()))?;

    let mut nodes = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| LangdagError::Database(e.to_string()))?;
        nodes.push(raw.into_node()?);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use langdag_core::types::{NodeKind, NodeStatus};

    async fn chain(store: &SqliteStore) -> (Node, Node, Node) {
        let root = Node::root(NodeKind::User, "Hello").with_title("Hello");
        let a = Node::child_of(&root, NodeKind::Assistant, "Hi").with_model("m1");
        let b = Node::child_of(&a, NodeKind::User, "How are you?");
        for n in [&root, &a, &b] {
            store.create(n).await.unwrap();
        }
        (root, a, b)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteStore::in_memory().unwrap();
        let root = Node::root(NodeKind::User, "Hello")
            .with_title("Hello")
            .with_system_prompt(Some("be brief".into()))
            .with_status(NodeStatus::Completed);
        store.create(&root).await.unwrap();

        let got = store.get(&root.id).await.unwrap();
        assert_eq!(got.content, "Hello");
        assert_eq!(got.kind, NodeKind::User);
        assert_eq!(got.status, Some(NodeStatus::Completed));
        assert_eq!(got.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(got.created_at, root.created_at);
    }

    #[tokio::test]
    async fn test_create_duplicate_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let root = Node::root(NodeKind::User, "x");
        store.create(&root).await.unwrap();
        let err = store.create(&root).await.unwrap_err();
        assert!(matches!(err, LangdagError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = SqliteStore::in_memory().unwrap();
        let phantom = Node::root(NodeKind::User, "never stored");
        let orphan = Node::child_of(&phantom, NodeKind::Assistant, "orphan");
        let err = store.create(&orphan).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_rejects_non_increasing_sequence() {
        let store = SqliteStore::in_memory().unwrap();
        let root = Node::root(NodeKind::User, "x");
        store.create(&root).await.unwrap();
        let mut child = Node::child_of(&root, NodeKind::Assistant, "y");
        child.sequence = 0;
        let err = store.create(&child).await.unwrap_err();
        assert!(matches!(err, LangdagError::InvalidNode(_)));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_by_prefix() {
        let store = SqliteStore::in_memory().unwrap();
        let mut a = Node::root(NodeKind::User, "a");
        a.id = "abc-111".into();
        let mut b = Node::root(NodeKind::User, "b");
        b.id = "abd-222".into();
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        assert_eq!(store.get_by_prefix("abc").await.unwrap().id, "abc-111");
        assert_eq!(store.get_by_prefix("abd-222").await.unwrap().id, "abd-222");
        assert!(store.get_by_prefix("zzz").await.unwrap_err().is_not_found());
        match store.get_by_prefix("ab").await.unwrap_err() {
            LangdagError::AmbiguousPrefix { matches, .. } => assert_eq!(matches, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.resolve("abc").await.unwrap().id, "abc-111");
    }

    #[tokio::test]
    async fn test_ancestors_root_to_node() {
        let store = SqliteStore::in_memory().unwrap();
        let (root, a, b) = chain(&store).await;

        let path = store.ancestors(&b.id).await.unwrap();
        let ids: Vec<_> = path.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![root.id.as_str(), a.id.as_str(), b.id.as_str()]);
        assert!(path[0].parent_id.is_none());

        let path = store.ancestors(&root.id).await.unwrap();
        assert_eq!(path.len(), 1);

        assert!(store.ancestors("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_subtree_and_children() {
        let store = SqliteStore::in_memory().unwrap();
        let (root, a, b) = chain(&store).await;
        let fork = Node::child_of(&a, NodeKind::User, "Another branch");
        store.create(&fork).await.unwrap();

        let subtree = store.subtree(&root.id).await.unwrap();
        assert_eq!(subtree.len(), 4);
        assert_eq!(subtree[0].id, root.id);
        assert!(subtree.windows(2).all(|w| w[0].sequence <= w[1].sequence));

        let under_a = store.subtree(&a.id).await.unwrap();
        assert_eq!(under_a.len(), 3);

        let kids = store.children(&a.id).await.unwrap();
        let ids: Vec<_> = kids.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![b.id.clone(), fork.id.clone()]);

        assert!(store.children(&b.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_roots_most_recent_first() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Node::root(NodeKind::User, "first");
        store.create(&first).await.unwrap();
        let second = Node::root(NodeKind::User, "second");
        store.create(&second).await.unwrap();
        let child = Node::child_of(&second, NodeKind::Assistant, "reply");
        store.create(&child).await.unwrap();

        let roots = store.list_roots().await.unwrap();
        let contents: Vec<_> = roots.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_update_mutable_fields_only() {
        let store = SqliteStore::in_memory().unwrap();
        let (root, a, _) = chain(&store).await;

        let mut edited = a.clone();
        edited.content = "Hi there".into();
        edited.status = Some(NodeStatus::Completed);
        edited.tokens_out = Some(42);
        edited.sequence = 99;
        store.update(&edited).await.unwrap();

        let got = store.get(&a.id).await.unwrap();
        assert_eq!(got.content, "Hi there");
        assert_eq!(got.tokens_out, Some(42));
        assert_eq!(got.sequence, 1);
        assert_eq!(got.parent_id.as_deref(), Some(root.id.as_str()));

        let mut retitled = root.clone();
        retitled.title = Some("Greeting".into());
        store.update(&retitled).await.unwrap();
        assert_eq!(
            store.get(&root.id).await.unwrap().title.as_deref(),
            Some("Greeting")
        );

        let ghost = Node::root(NodeKind::User, "ghost");
        assert!(store.update(&ghost).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_subtree_only() {
        let store = SqliteStore::in_memory().unwrap();
        let (root, a, b) = chain(&store).await;
        let sibling = Node::child_of(&root, NodeKind::Assistant, "sibling");
        store.create(&sibling).await.unwrap();

        let removed = store.delete(&a.id).await.unwrap();
        assert_eq!(removed, 2);

        assert!(store.get(&a.id).await.unwrap_err().is_not_found());
        assert!(store.get(&b.id).await.unwrap_err().is_not_found());
        assert!(store.get(&root.id).await.is_ok());
        assert!(store.get(&sibling.id).await.is_ok());

        assert!(store.delete(&a.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_root_clears_conversation() {
        let store = SqliteStore::in_memory().unwrap();
        let (root, _, _) = chain(&store).await;
        assert_eq!(store.delete(&root.id).await.unwrap(), 3);
        assert!(store.list_roots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("langdag.db");
        let root = Node::root(NodeKind::User, "persisted");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(&root).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&root.id).await.unwrap().content, "persisted");
        assert_eq!(store.schema_version().unwrap(), schema::latest_version());
    }
}
