//! Mesh Module
//!
//! Mesh records and the pure parts of mesh construction: topology planning,
//! key management and per-node interface generation.

pub mod generator;
pub mod keys;
pub mod topology;

pub use generator::{Endpoint, InterfaceSpec, MemberInfo, PeerEntry, PERSISTENT_KEEPALIVE_SECS};
pub use keys::{KeyManager, KeyPair, NodeKey};
pub use topology::{Adjacency, Topology};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tunnel transport carrying the overlay traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    #[default]
    Udp,
    Both,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Both => write!(f, "both"),
        }
    }
}

/// Mesh lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshStatus {
    /// Configuration changed since the last successful apply
    Pending,
    /// Every member accepted the current configuration
    Active,
    /// The last apply failed on at least one member
    Error,
    /// Torn down; terminal
    Deleted,
}

impl std::fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshStatus::Pending => write!(f, "PENDING"),
            MeshStatus::Active => write!(f, "ACTIVE"),
            MeshStatus::Error => write!(f, "ERROR"),
            MeshStatus::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Result of one agent call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum NodeOutcome {
    Success,
    Failed { reason: String },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success)
    }
}

/// A named set of nodes joined by encrypted links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub id: Uuid,
    pub name: String,
    pub topology: Topology,
    pub overlay_subnet: Ipv4Net,
    pub mtu: u16,
    pub transport: Transport,
    /// Base rendezvous port
    pub port: u16,
    /// Members in caller order; the first is the hub in hub-spoke meshes
    pub node_ids: Vec<String>,
    /// Optional LAN subnet advertised by each member
    #[serde(default)]
    pub lan_subnets: BTreeMap<String, Ipv4Net>,
    /// Keypair per member
    #[serde(default)]
    pub keys: BTreeMap<String, NodeKey>,
    pub status: MeshStatus,
    /// Bumped on every change that invalidates the applied configuration
    pub revision: u64,
    /// Per-node outcome of the last apply
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl Mesh {
    /// Check whether a node is a member
    pub fn has_member(&self, node_id: &str) -> bool {
        self.node_ids.iter().any(|id| id == node_id)
    }

    /// Invalidate the applied configuration and require a fresh apply
    pub fn mark_pending(&mut self) {
        self.status = MeshStatus::Pending;
        self.revision += 1;
        self.node_results.clear();
        self.updated_at = Utc::now();
    }

    /// Public view without private key material
    pub fn view(&self) -> MeshView {
        MeshView {
            id: self.id,
            name: self.name.clone(),
            topology: self.topology,
            overlay_subnet: self.overlay_subnet,
            mtu: self.mtu,
            transport: self.transport,
            port: self.port,
            node_ids: self.node_ids.clone(),
            lan_subnets: self.lan_subnets.clone(),
            public_keys: self
                .keys
                .iter()
                .map(|(id, key)| (id.clone(), key.public_key.clone()))
                .collect(),
            status: self.status,
            revision: self.revision,
            node_results: self.node_results.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_applied_at: self.last_applied_at,
        }
    }
}

/// Mesh as shown to API callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshView {
    pub id: Uuid,
    pub name: String,
    pub topology: Topology,
    pub overlay_subnet: Ipv4Net,
    pub mtu: u16,
    pub transport: Transport,
    pub port: u16,
    pub node_ids: Vec<String>,
    pub lan_subnets: BTreeMap<String, Ipv4Net>,
    pub public_keys: BTreeMap<String, String>,
    pub status: MeshStatus,
    pub revision: u64,
    pub node_results: BTreeMap<String, NodeOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Transport::Both).unwrap(), "\"both\"");
        assert_eq!(serde_json::to_string(&MeshStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(
            serde_json::to_value(NodeOutcome::Failed { reason: "x".into() }).unwrap(),
            serde_json::json!({"result": "failed", "reason": "x"})
        );
    }
}
