//! WolfMesh - Overlay Mesh Control Plane
//!
//! Builds encrypted site-to-site overlay networks across a fleet of
//! independently operated nodes. The control plane hands out overlay
//! addresses from a single pool, plans mesh topologies, generates per-node
//! peer configurations and pushes them to the agent running on each node.
//!
//! # Architecture
//!
//! Configuration flows one way: allocator, topology planner, config
//! generator, orchestrator, agents. Status flows back from the agents
//! through the orchestrator to the caller.
//!
//! # Features
//!
//! - Stable, conflict-free overlay address allocation
//! - Full-mesh and hub-spoke topologies
//! - Deterministic per-node interface specs with pair-derived rendezvous ports
//! - X25519 key generation and rotation
//! - Concurrent apply/status/remove fan-out with per-node timeouts
//! - SQLite-backed state and an HTTP API

pub mod agent;
pub mod allocator;
pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod mesh;
pub mod node;
pub mod orchestrator;
pub mod store;

pub use config::WolfMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{AgentStatus, HttpNodeAgent, NodeAgent};
    pub use crate::allocator::{AddressAllocator, AddressAssignment, AddressPool, PoolStatus};
    pub use crate::config::WolfMeshConfig;
    pub use crate::control::ControlPlane;
    pub use crate::error::{Error, Result};
    pub use crate::mesh::{InterfaceSpec, Mesh, MeshStatus, Topology, Transport};
    pub use crate::node::{Node, NodeRegistration, NodeRole};
    pub use crate::orchestrator::{ApplyReport, CreateMeshRequest, MeshOrchestrator};
}
