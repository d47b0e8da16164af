//! WolfMesh Error Types

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Pool errors
    #[error("No address pool configured")]
    PoolNotFound,

    #[error("Pool {existing} already exists with {assigned} assignments, cannot switch to {requested}")]
    PoolConflict {
        existing: String,
        requested: String,
        assigned: usize,
    },

    #[error("Pool {0} has no free addresses left")]
    PoolExhausted(String),

    #[error("Pool still holds {0} assignments")]
    PoolInUse(usize),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    // Assignment errors
    #[error("Address {address} is outside the host range of {cidr}")]
    AddressOutOfRange { address: Ipv4Addr, cidr: String },

    #[error("Address {address} is already assigned to node {node_id}")]
    AddressInUse { address: Ipv4Addr, node_id: String },

    // Node errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    NodeExists(String),

    // Mesh errors
    #[error("Mesh not found: {0}")]
    MeshNotFound(Uuid),

    #[error("A mesh needs at least 2 members, got {0}")]
    InsufficientMembers(usize),

    #[error("Overlay subnet {requested} does not match pool {pool}")]
    SubnetMismatch { requested: String, pool: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Agent errors
    #[error("Agent on node {node_id} unreachable: {reason}")]
    AgentUnreachable { node_id: String, reason: String },

    #[error("Agent on node {node_id} rejected request: {reason}")]
    AgentRejected { node_id: String, reason: String },

    #[error("Apply failed on {} of the mesh members", failures.len())]
    PartialApplyFailure { failures: BTreeMap<String, String> },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error came from a single node's agent
    pub fn is_agent_failure(&self) -> bool {
        matches!(
            self,
            Error::AgentUnreachable { .. } | Error::AgentRejected { .. }
        )
    }

    /// Check if the caller can fix this error by changing its input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCidr(_)
                | Error::AddressOutOfRange { .. }
                | Error::InsufficientMembers(_)
                | Error::SubnetMismatch { .. }
                | Error::InvalidArgument(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::PoolNotFound => "POOL_NOT_FOUND",
            Error::PoolConflict { .. } => "POOL_CONFLICT",
            Error::PoolExhausted(_) => "POOL_EXHAUSTED",
            Error::PoolInUse(_) => "POOL_IN_USE",
            Error::InvalidCidr(_) => "INVALID_CIDR",
            Error::AddressOutOfRange { .. } => "ADDRESS_OUT_OF_RANGE",
            Error::AddressInUse { .. } => "ADDRESS_IN_USE",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::NodeExists(_) => "NODE_EXISTS",
            Error::MeshNotFound(_) => "MESH_NOT_FOUND",
            Error::InsufficientMembers(_) => "INSUFFICIENT_MEMBERS",
            Error::SubnetMismatch { .. } => "SUBNET_MISMATCH",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::AgentUnreachable { .. } => "AGENT_UNREACHABLE",
            Error::AgentRejected { .. } => "AGENT_REJECTED",
            Error::PartialApplyFailure { .. } => "PARTIAL_APPLY_FAILURE",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}
