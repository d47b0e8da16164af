//! Node Directory
//!
//! Registry of the machines that can join meshes. Nodes are owned by this
//! directory; meshes only hold their IDs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::Store;

/// Role of a node in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// May host rendezvous listeners
    Server,
    /// Only originates connections
    #[default]
    Client,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Server => write!(f, "SERVER"),
            NodeRole::Client => write!(f, "CLIENT"),
        }
    }
}

/// A registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    /// Publicly reachable host for rendezvous listeners
    pub public_host: Option<String>,
    /// Base URL of the node's agent API
    pub agent_url: String,
    /// Identity fingerprint used for mutual authentication
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Node registration request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeRegistration {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub public_host: Option<String>,
    pub agent_url: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Node update request
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<NodeRole>,
    #[serde(default)]
    pub public_host: Option<String>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl Node {
    /// Whether a change affects the interface specs generated for peers
    pub fn changes_endpoint(&self, other: &Node) -> bool {
        self.role != other.role || self.public_host != other.public_host
    }
}

impl NodeRegistration {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidArgument("node id cannot be empty".into()));
        }
        if self.id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::InvalidArgument(format!(
                "node id '{}' may not contain whitespace or '/'",
                self.id
            )));
        }
        if !(self.agent_url.starts_with("http://") || self.agent_url.starts_with("https://")) {
            return Err(Error::InvalidArgument(format!(
                "agent_url must be an http(s) URL, got '{}'",
                self.agent_url
            )));
        }
        if self.role == NodeRole::Server && self.public_host.is_none() {
            tracing::warn!(
                "Server node {} has no public_host, peers cannot dial it",
                self.id
            );
        }
        Ok(())
    }
}

/// Directory of registered nodes
pub struct NodeDirectory {
    store: Arc<Store>,
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl NodeDirectory {
    /// Restore the directory from persisted state
    pub async fn load(store: Arc<Store>) -> Result<Self> {
        let nodes = store
            .load_nodes()
            .await?
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();

        Ok(Self {
            store,
            nodes: RwLock::new(nodes),
        })
    }

    /// Register a new node
    pub async fn register(&self, req: NodeRegistration) -> Result<Node> {
        req.validate()?;
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&req.id) {
            return Err(Error::NodeExists(req.id));
        }

        let now = Utc::now();
        let node = Node {
            name: req.name.unwrap_or_else(|| req.id.clone()),
            id: req.id,
            role: req.role,
            public_host: req.public_host,
            agent_url: req.agent_url.trim_end_matches('/').to_string(),
            fingerprint: req.fingerprint,
            created_at: now,
            updated_at: now,
        };

        self.store.save_node(&node).await?;
        nodes.insert(node.id.clone(), node.clone());
        tracing::info!("Registered node {} ({})", node.id, node.role);
        Ok(node)
    }

    /// Change a node's mutable attributes; unset fields keep their value
    pub async fn update(&self, id: &str, update: NodeUpdate) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        let existing = nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;

        let merged = NodeRegistration {
            id: existing.id.clone(),
            name: Some(update.name.unwrap_or_else(|| existing.name.clone())),
            role: update.role.unwrap_or(existing.role),
            public_host: update.public_host.or_else(|| existing.public_host.clone()),
            agent_url: update.agent_url.unwrap_or_else(|| existing.agent_url.clone()),
            fingerprint: update.fingerprint.or_else(|| existing.fingerprint.clone()),
        };
        merged.validate()?;

        let node = Node {
            name: merged.name.unwrap_or_else(|| existing.name.clone()),
            role: merged.role,
            public_host: merged.public_host,
            agent_url: merged.agent_url.trim_end_matches('/').to_string(),
            fingerprint: merged.fingerprint,
            updated_at: Utc::now(),
            ..existing.clone()
        };

        self.store.save_node(&node).await?;
        nodes.insert(node.id.clone(), node.clone());
        tracing::info!("Updated node {}", node.id);
        Ok(node)
    }

    /// Look up a node
    pub async fn get(&self, id: &str) -> Result<Node> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Look up several nodes at once, failing on the first unknown ID
    pub async fn get_many(&self, ids: &[String]) -> Result<BTreeMap<String, Node>> {
        let nodes = self.nodes.read().await;
        ids.iter()
            .map(|id| {
                nodes
                    .get(id)
                    .cloned()
                    .map(|node| (id.clone(), node))
                    .ok_or_else(|| Error::NodeNotFound(id.clone()))
            })
            .collect()
    }

    /// All nodes ordered by ID
    pub async fn list(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Remove a node record. Callers detach it from meshes and the pool.
    pub async fn remove(&self, id: &str) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        self.store.delete_node(id).await?;
        nodes
            .remove(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }
}
