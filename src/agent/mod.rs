//! Node Agent Contract
//!
//! The interface the orchestrator calls on each remote node. Agents
//! materialize interface specs into real interfaces and routes; the control
//! plane only sees success, failure and reported status.

mod http;

pub use http::HttpNodeAgent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::mesh::InterfaceSpec;
use crate::node::Node;

/// Status of one peer as reported by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPeerStatus {
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub last_handshake: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connected: Option<bool>,
}

/// Interface status reported by an agent for one mesh
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    pub active: bool,
    #[serde(default)]
    pub peers: Vec<AgentPeerStatus>,
}

impl AgentStatus {
    /// Peers the agent considers connected
    pub fn connected_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.connected.unwrap_or(false))
            .count()
    }
}

/// Operations the control plane invokes on a node's agent.
///
/// Failures are reported as `Error::AgentUnreachable` when the agent could
/// not be reached and `Error::AgentRejected` when it refused the request.
#[async_trait::async_trait]
pub trait NodeAgent: Send + Sync {
    /// Create or update the mesh interface. Must be idempotent.
    async fn apply(&self, node: &Node, mesh_id: Uuid, spec: &InterfaceSpec) -> Result<()>;

    /// Tear down the mesh interface and its routes
    async fn remove(&self, node: &Node, mesh_id: Uuid) -> Result<()>;

    /// Report the mesh interface status
    async fn status(&self, node: &Node, mesh_id: Uuid) -> Result<AgentStatus>;
}
