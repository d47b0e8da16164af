//! WolfMesh - Overlay Mesh Control Plane
//!
//! Server binary: loads the configuration, opens the state store and serves
//! the control-plane HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmesh::api::HttpServer;
use wolfmesh::config::{PoolConfig, WolfMeshConfig};
use wolfmesh::control::ControlPlane;
use wolfmesh::error::Result;

/// WolfMesh - Overlay Mesh Control Plane
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane
    Serve,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,

        /// Bootstrap address pool (CIDR)
        #[arg(long)]
        pool: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show control plane information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_serve(cli.config, cli.log_level).await,
        Commands::Init { output, pool } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, pool)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the control plane
async fn run_serve(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = WolfMeshConfig::from_file(&config_path)?;
    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    tracing::info!("Starting WolfMesh control plane");
    tracing::info!("Data directory: {}", config.data_dir().display());

    let control = Arc::new(ControlPlane::open(&config).await?);
    match control.allocator().pool().await {
        Some(pool) => tracing::info!("Address pool: {}", pool.cidr),
        None => tracing::warn!("No address pool configured; create one before building meshes"),
    }

    let http_server = HttpServer::new(config.api.clone(), control);

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, pool: Option<String>) -> Result<()> {
    let mut config = WolfMeshConfig::default();
    if let Some(cidr) = pool {
        config.pool = Some(PoolConfig {
            cidr,
            description: "overlay".to_string(),
        });
    }
    config.validate()?;

    let content = format!(
        "# WolfMesh Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the data directory and address pool.");
    println!("Then start with: wolfmesh --config {} serve", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  API Address: {}", config.api.bind_address);
            println!("  Data Directory: {}", config.data_dir().display());
            match &config.pool {
                Some(pool) => println!("  Pool: {}", pool.cidr),
                None => println!("  Pool: (none)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show control plane information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfMeshConfig::from_file(&config_path)?;

    println!("WolfMesh Control Plane");
    println!("======================");
    println!();
    println!("API Address:      {}", config.api.bind_address);
    println!("CORS:             {}", config.api.cors_enabled);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Database:         {}", config.database_path().display());
    println!();
    println!("Address Pool:");
    match &config.pool {
        Some(pool) => {
            println!("  CIDR:           {}", pool.cidr);
            println!("  Description:    {}", pool.description);
        }
        None => println!("  (not bootstrapped from config)"),
    }
    println!();
    println!("Mesh Defaults:");
    println!("  MTU:            {}", config.mesh.default_mtu);
    println!("  Base Port:      {}", config.mesh.default_port);
    println!("  Transport:      {}", config.mesh.default_transport);
    println!("  Interface:      {}", config.mesh.interface_name);
    println!();
    println!("Agents:");
    println!("  API Prefix:     {}", config.agent.api_prefix);
    println!("  Timeout:        {} ms", config.agent.request_timeout_ms);
    println!("  Connect:        {} ms", config.agent.connect_timeout_ms);

    Ok(())
}
