//! WolfMesh Configuration
//!
//! This module provides configuration structures for the WolfMesh
//! control plane.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::allocator::parse_pool_cidr;
use crate::mesh::Transport;

/// Main WolfMesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMeshConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Bootstrap address pool (optional)
    #[serde(default)]
    pub pool: Option<PoolConfig>,

    /// Mesh defaults
    #[serde(default)]
    pub mesh: MeshDefaults,

    /// Node agent client configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Data directory for the state database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Address pool created at startup if none exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool CIDR, e.g. 10.88.0.0/16
    pub cidr: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// Defaults applied to new meshes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDefaults {
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub default_mtu: u16,

    /// Base rendezvous port
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Tunnel transport
    #[serde(default)]
    pub default_transport: Transport,

    /// Overlay interface name given to new assignments
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
}

/// Node agent client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Per-node call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Path prefix of the agent API
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmesh")
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_mtu() -> u16 {
    1420
}

fn default_port() -> u16 {
    51820
}

fn default_interface_name() -> String {
    "wolfmesh0".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_api_prefix() -> String {
    "/v1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for MeshDefaults {
    fn default() -> Self {
        Self {
            default_mtu: default_mtu(),
            default_port: default_port(),
            default_transport: Transport::default(),
            interface_name: default_interface_name(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            api_prefix: default_api_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for WolfMeshConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            pool: None,
            mesh: MeshDefaults::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Allowed MTU range for overlay interfaces
pub const MTU_RANGE: std::ops::RangeInclusive<u16> = 1280..=9000;

impl WolfMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `wolfmesh init`)
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if let Some(pool) = &self.pool {
            parse_pool_cidr(&pool.cidr)
                .map_err(|e| crate::Error::Config(format!("pool.cidr: {}", e)))?;
        }

        if !MTU_RANGE.contains(&self.mesh.default_mtu) {
            return Err(crate::Error::Config(format!(
                "mesh.default_mtu must be within {}..={}",
                MTU_RANGE.start(),
                MTU_RANGE.end()
            )));
        }

        if self.mesh.default_port == 0 {
            return Err(crate::Error::Config("mesh.default_port cannot be 0".into()));
        }

        if self.mesh.interface_name.is_empty() || self.mesh.interface_name.len() > 15 {
            return Err(crate::Error::Config(
                "mesh.interface_name must be 1-15 characters".into(),
            ));
        }

        if self.agent.request_timeout_ms == 0 || self.agent.connect_timeout_ms == 0 {
            return Err(crate::Error::Config("agent timeouts must be non-zero".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or json, got {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.server.data_dir
    }

    /// Path of the SQLite state database
    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("wolfmesh.db")
    }

    /// Per-node agent call timeout
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.request_timeout_ms)
    }

    /// Agent connect timeout
    pub fn agent_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.connect_timeout_ms)
    }
}
