//! State Store
//!
//! Persistent storage for the pool, address assignments, nodes and meshes,
//! backed by SQLite. Records are stored as JSON documents keyed by their
//! identifiers; the assignment table additionally indexes the address so
//! the database enforces address uniqueness alongside the allocator.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::allocator::{AddressAssignment, AddressPool};
use crate::error::Result;
use crate::mesh::Mesh;
use crate::node::Node;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pool (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS assignments (
    node_id TEXT PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS meshes (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Persistent state store backed by SQLite
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open the state database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ============ Pool ============

    /// Load the pool record, if one exists
    pub async fn load_pool(&self) -> Result<Option<AddressPool>> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row("SELECT data FROM pool LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Replace the pool record
    pub async fn save_pool(&self, pool: &AddressPool) -> Result<()> {
        let data = serde_json::to_string(pool)?;
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM pool WHERE id != ?1", params![pool.id.to_string()])?;
        conn.execute(
            r#"
            INSERT INTO pool (id, data) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET data = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![pool.id.to_string(), data],
        )?;
        Ok(())
    }

    /// Remove the pool record
    pub async fn delete_pool(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM pool", [])?;
        Ok(())
    }

    // ============ Assignments ============

    /// Load all assignments
    pub async fn load_assignments(&self) -> Result<Vec<AddressAssignment>> {
        self.load_all("assignments").await
    }

    /// Insert or replace a node's assignment
    pub async fn save_assignment(&self, assignment: &AddressAssignment) -> Result<()> {
        let data = serde_json::to_string(assignment)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO assignments (node_id, address, data) VALUES (?1, ?2, ?3)
            ON CONFLICT(node_id) DO UPDATE SET
                address = ?2,
                data = ?3,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![assignment.node_id, assignment.address.to_string(), data],
        )?;
        Ok(())
    }

    /// Delete a node's assignment
    pub async fn delete_assignment(&self, node_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM assignments WHERE node_id = ?1",
            params![node_id],
        )?;
        Ok(deleted > 0)
    }

    // ============ Nodes ============

    pub async fn load_nodes(&self) -> Result<Vec<Node>> {
        self.load_all("nodes").await
    }

    pub async fn save_node(&self, node: &Node) -> Result<()> {
        self.put("nodes", &node.id, node).await
    }

    pub async fn delete_node(&self, id: &str) -> Result<bool> {
        self.delete("nodes", id).await
    }

    // ============ Meshes ============

    pub async fn load_meshes(&self) -> Result<Vec<Mesh>> {
        self.load_all("meshes").await
    }

    pub async fn save_mesh(&self, mesh: &Mesh) -> Result<()> {
        self.put("meshes", &mesh.id.to_string(), mesh).await
    }

    pub async fn delete_mesh(&self, id: Uuid) -> Result<bool> {
        self.delete("meshes", &id.to_string()).await
    }

    // ============ Helpers ============

    async fn load_all<T: DeserializeOwned>(&self, table: &'static str) -> Result<Vec<T>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT data FROM {} ORDER BY rowid", table))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    async fn put<T: Serialize>(&self, table: &'static str, id: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (id, data) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET data = ?2, updated_at = CURRENT_TIMESTAMP
                "#,
                table
            ),
            params![id, data],
        )?;
        Ok(())
    }

    async fn delete(&self, table: &'static str, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![id])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::parse_pool_cidr;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pool_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("wolfmesh.db");

        let pool = AddressPool::new(parse_pool_cidr("10.88.0.0/24").unwrap(), "lab".into());
        {
            let store = Store::open(&path).unwrap();
            assert!(store.load_pool().await.unwrap().is_none());
            store.save_pool(&pool).await.unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.load_pool().await.unwrap(), Some(pool));

        store.delete_pool().await.unwrap();
        assert!(store.load_pool().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_pool_replaces_previous() {
        let store = Store::in_memory().unwrap();
        let first = AddressPool::new(parse_pool_cidr("10.88.0.0/24").unwrap(), String::new());
        let second = AddressPool::new(parse_pool_cidr("10.99.0.0/24").unwrap(), String::new());

        store.save_pool(&first).await.unwrap();
        store.save_pool(&second).await.unwrap();
        assert_eq!(store.load_pool().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_assignment_address_is_unique() {
        let store = Store::in_memory().unwrap();
        let address = Ipv4Addr::new(10, 88, 0, 1);

        store
            .save_assignment(&AddressAssignment::new("a".into(), address, "wolfmesh0".into()))
            .await
            .unwrap();
        let clash = AddressAssignment::new("b".into(), address, "wolfmesh0".into());
        assert!(store.save_assignment(&clash).await.is_err());

        assert!(store.delete_assignment("a").await.unwrap());
        assert!(!store.delete_assignment("a").await.unwrap());
        store.save_assignment(&clash).await.unwrap();
        assert_eq!(store.load_assignments().await.unwrap(), vec![clash]);
    }
}
