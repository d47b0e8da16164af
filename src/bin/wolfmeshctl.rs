//! WolfMeshCtl - Command line tool for managing WolfMesh overlays
//!
//! Usage:
//!   wolfmeshctl pool status            - Show address pool utilization
//!   wolfmeshctl node list              - List registered nodes
//!   wolfmeshctl mesh create office ... - Create a mesh
//!   wolfmeshctl mesh apply <id>        - Push a mesh to its nodes

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use wolfmesh::allocator::{AddressAssignment, AddressPool, PoolStatus};
use wolfmesh::api::{ApplyErrorResponse, ErrorResponse, ReleaseResponse};
use wolfmesh::config::WolfMeshConfig;
use wolfmesh::control::{NodeRemoval, NodeView};
use wolfmesh::mesh::{InterfaceSpec, MeshStatus, MeshView, NodeOutcome};
use wolfmesh::orchestrator::{ApplyReport, MeshStatusReport, NodeReport, RemovalReport};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// WolfMesh Control Tool
#[derive(Parser)]
#[command(name = "wolfmeshctl")]
#[command(about = "Control and monitor WolfMesh overlays", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfmesh/wolfmesh.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Address pool management
    Pool {
        #[command(subcommand)]
        action: PoolCommand,
    },
    /// Node directory management
    Node {
        #[command(subcommand)]
        action: NodeCommand,
    },
    /// Mesh lifecycle
    Mesh {
        #[command(subcommand)]
        action: MeshCommand,
    },
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Show the active pool
    Show,
    /// Create the pool (or return the existing one)
    Create {
        /// Pool CIDR, e.g. 10.88.0.0/16
        cidr: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Delete the pool (must have no assignments)
    Delete,
    /// Show utilization
    Status,
    /// List address assignments
    Assignments,
    /// Allocate an address for a node, or pin one with --address
    Assign {
        node_id: String,
        #[arg(short, long)]
        address: Option<Ipv4Addr>,
    },
    /// Return a node's address to the pool
    Release { node_id: String },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// List registered nodes
    List,
    /// Register a node
    Add {
        id: String,
        /// Base URL of the node agent
        #[arg(long)]
        agent_url: String,
        /// server | client
        #[arg(long, default_value = "client")]
        role: String,
        /// Publicly reachable host for rendezvous listeners
        #[arg(long)]
        public_host: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Change a registered node; omitted flags keep their value
    Update {
        id: String,
        #[arg(long)]
        agent_url: Option<String>,
        /// server | client
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        public_host: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Delete a node, detaching it from every mesh
    Remove { id: String },
}

#[derive(Subcommand)]
enum MeshCommand {
    /// List meshes
    List,
    /// Create a mesh
    Create {
        name: String,
        /// Member node IDs; the first is the hub in hub-spoke meshes
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// LAN subnet advertised by a member, as NODE=CIDR (repeatable)
        #[arg(long = "lan")]
        lan: Vec<String>,
        /// full-mesh | hub-spoke
        #[arg(long, default_value = "full-mesh")]
        topology: String,
        /// tcp | udp | both
        #[arg(long)]
        transport: Option<String>,
        #[arg(long)]
        mtu: Option<u16>,
        /// Base rendezvous port
        #[arg(long)]
        port: Option<u16>,
        /// Must equal the pool CIDR when given
        #[arg(long)]
        overlay_subnet: Option<String>,
    },
    /// Show a mesh
    Show { id: Uuid },
    /// Push the mesh configuration to every member
    Apply { id: Uuid },
    /// Query every member's agent
    Status { id: Uuid },
    /// Regenerate all member keys (requires a re-apply)
    Rotate { id: Uuid },
    /// Tear down and delete a mesh
    Delete { id: Uuid },
    /// Show the generated config for one member
    Config {
        id: Uuid,
        node_id: String,
        /// Include the private key
        #[arg(long)]
        reveal: bool,
        /// Print JSON instead of the rendered config
        #[arg(long)]
        json: bool,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replace the member set
    Members {
        id: Uuid,
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        #[arg(long = "lan")]
        lan: Vec<String>,
    },
}

// ============ API Client ============

struct ApiClient {
    endpoint: String,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        decode(self.client.get(self.url(path)).send().await?).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<serde_json::Value>) -> CliResult<T> {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        decode(request.send().await?).await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> CliResult<T> {
        decode(self.client.put(self.url(path)).json(&body).send().await?).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        decode(self.client.delete(self.url(path)).send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> CliResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(err) => Err(format!("{} ({})", err.error, err.code).into()),
        Err(_) => Err(format!("API error: {} {}", status, text.trim()).into()),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let api = ApiClient::new(resolve_endpoint(&cli));

    let result = match cli.command {
        Commands::Pool { action } => run_pool(&api, action).await,
        Commands::Node { action } => run_node(&api, action).await,
        Commands::Mesh { action } => run_mesh(&api, action).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Endpoint from --endpoint, else the config's bind address, else localhost
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return endpoint.clone();
    }

    match WolfMeshConfig::from_file(&cli.config) {
        Ok(config) => {
            let addr = config.api.bind_address;
            // Convert bind address to localhost if it's 0.0.0.0
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => "http://127.0.0.1:8080".to_string(),
    }
}

// ============ Pool ============

async fn run_pool(api: &ApiClient, action: PoolCommand) -> CliResult<()> {
    match action {
        PoolCommand::Show => {
            let pool: AddressPool = api.get("/pool").await?;
            print_pool(&pool);
        }
        PoolCommand::Create { cidr, description } => {
            let pool: AddressPool = api
                .post(
                    "/pool",
                    Some(serde_json::json!({"cidr": cidr, "description": description})),
                )
                .await?;
            print_pool(&pool);
        }
        PoolCommand::Delete => {
            let pool: AddressPool = api.delete("/pool").await?;
            println!("Deleted pool {}", pool.cidr);
        }
        PoolCommand::Status => {
            let status: PoolStatus = api.get("/pool/status").await?;
            println!();
            println!("Pool {}", status.cidr);
            println!("========================================");
            println!("Total:        {}", status.total);
            println!("Assigned:     {}", status.assigned);
            println!("Available:    {}", status.available);
            println!("Utilization:  {}%", status.utilization_pct);
            println!();
        }
        PoolCommand::Assignments => {
            let assignments: Vec<AddressAssignment> = api.get("/pool/assignments").await?;
            println!();
            println!("{:<24} {:<16} {:<12} {}", "NODE ID", "ADDRESS", "INTERFACE", "ASSIGNED");
            println!("{}", "-".repeat(76));
            for a in &assignments {
                println!(
                    "{:<24} {:<16} {:<12} {}",
                    a.node_id,
                    a.address,
                    a.interface_name,
                    a.assigned_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("{} assignments", assignments.len());
        }
        PoolCommand::Assign { node_id, address } => {
            let path = format!("/pool/assignments/{}", node_id);
            let assignment: AddressAssignment =
                api.put(&path, serde_json::json!({ "address": address })).await?;
            println!("{} -> {}", assignment.node_id, assignment.address);
        }
        PoolCommand::Release { node_id } => {
            let path = format!("/pool/assignments/{}", node_id);
            let response: ReleaseResponse = api.delete(&path).await?;
            match response.released {
                Some(a) => println!("Released {} from {}", a.address, a.node_id),
                None => println!("{} had no address", node_id),
            }
        }
    }
    Ok(())
}

fn print_pool(pool: &AddressPool) {
    println!();
    println!("Pool:         {}", pool.cidr);
    println!("Description:  {}", pool.description);
    println!("Hosts:        {}", pool.host_count());
    println!("Created:      {}", pool.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
}

// ============ Nodes ============

async fn run_node(api: &ApiClient, action: NodeCommand) -> CliResult<()> {
    match action {
        NodeCommand::List => {
            let nodes: Vec<NodeView> = api.get("/nodes").await?;
            println!();
            println!(
                "{:<20} {:<8} {:<16} {:<28} {}",
                "NODE ID", "ROLE", "ADDRESS", "PUBLIC HOST", "AGENT"
            );
            println!("{}", "-".repeat(100));
            for view in &nodes {
                let address = view
                    .address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<8} {:<16} {:<28} {}",
                    view.node.id,
                    view.node.role.to_string(),
                    address,
                    view.node.public_host.as_deref().unwrap_or("-"),
                    view.node.agent_url
                );
            }
            println!();
        }
        NodeCommand::Add {
            id,
            agent_url,
            role,
            public_host,
            name,
            fingerprint,
        } => {
            let view: NodeView = api
                .post(
                    "/nodes",
                    Some(serde_json::json!({
                        "id": id,
                        "name": name,
                        "role": role,
                        "public_host": public_host,
                        "agent_url": agent_url,
                        "fingerprint": fingerprint,
                    })),
                )
                .await?;
            println!("Registered {} ({})", view.node.id, view.node.role);
        }
        NodeCommand::Update {
            id,
            agent_url,
            role,
            public_host,
            name,
            fingerprint,
        } => {
            let view: NodeView = api
                .put(
                    &format!("/nodes/{}", id),
                    serde_json::json!({
                        "name": name,
                        "role": role,
                        "public_host": public_host,
                        "agent_url": agent_url,
                        "fingerprint": fingerprint,
                    }),
                )
                .await?;
            println!("Updated {} ({})", view.node.id, view.node.role);
            if role.is_some() || public_host.is_some() {
                println!("  Meshes containing this node may need a re-apply");
            }
        }
        NodeCommand::Remove { id } => {
            let removal: NodeRemoval = api.delete(&format!("/nodes/{}", id)).await?;
            println!("Removed node {}", removal.node.id);
            if let Some(address) = removal.released {
                println!("  Released address {}", address);
            }
            for mesh_id in &removal.meshes {
                println!("  Detached from mesh {} (re-apply required)", mesh_id);
            }
        }
    }
    Ok(())
}

// ============ Meshes ============

async fn run_mesh(api: &ApiClient, action: MeshCommand) -> CliResult<()> {
    match action {
        MeshCommand::List => {
            let meshes: Vec<MeshView> = api.get("/meshes").await?;
            println!();
            println!(
                "{:<38} {:<20} {:<10} {:<8} {}",
                "MESH ID", "NAME", "TOPOLOGY", "NODES", "STATUS"
            );
            println!("{}", "-".repeat(90));
            for mesh in &meshes {
                println!(
                    "{:<38} {:<20} {:<10} {:<8} {}",
                    mesh.id,
                    mesh.name,
                    topology_label(&mesh.topology),
                    mesh.node_ids.len(),
                    colored_status(mesh.status)
                );
            }
            println!();
        }
        MeshCommand::Create {
            name,
            nodes,
            lan,
            topology,
            transport,
            mtu,
            port,
            overlay_subnet,
        } => {
            let body = serde_json::json!({
                "name": name,
                "node_ids": nodes,
                "lan_subnets": parse_lan(&lan)?,
                "topology": topology,
                "transport": transport,
                "mtu": mtu,
                "port": port,
                "overlay_subnet": overlay_subnet,
            });
            let mesh: MeshView = api.post("/meshes", Some(body)).await?;
            println!("Created mesh {} ({})", mesh.id, mesh.name);
            println!("Run `wolfmeshctl mesh apply {}` to push it to the nodes.", mesh.id);
        }
        MeshCommand::Show { id } => {
            let mesh: MeshView = api.get(&format!("/meshes/{}", id)).await?;
            print_mesh(&mesh);
        }
        MeshCommand::Apply { id } => apply(api, id).await?,
        MeshCommand::Status { id } => {
            let report: MeshStatusReport = api.get(&format!("/meshes/{}/status", id)).await?;
            print_status(&report);
        }
        MeshCommand::Rotate { id } => {
            let mesh: MeshView = api.post(&format!("/meshes/{}/rotate-keys", id), None).await?;
            println!(
                "Rotated keys for {} members; mesh is {} until re-applied",
                mesh.node_ids.len(),
                colored_status(mesh.status)
            );
        }
        MeshCommand::Delete { id } => {
            let report: RemovalReport = api.delete(&format!("/meshes/{}", id)).await?;
            println!("Deleted mesh {}", report.mesh_id);
            print_outcomes(&report.results);
        }
        MeshCommand::Config {
            id,
            node_id,
            reveal,
            json,
            output,
        } => {
            let path = format!("/meshes/{}/config/{}?reveal={}", id, node_id, reveal);
            let spec: InterfaceSpec = api.get(&path).await?;
            let content = if json {
                serde_json::to_string_pretty(&spec)?
            } else {
                spec.to_config_string()
            };
            match output {
                Some(file) => {
                    std::fs::write(&file, content)?;
                    println!("Wrote {}", file.display());
                }
                None => print!("{}", content),
            }
        }
        MeshCommand::Members { id, nodes, lan } => {
            let body = serde_json::json!({
                "node_ids": nodes,
                "lan_subnets": parse_lan(&lan)?,
            });
            let mesh: MeshView = api.put(&format!("/meshes/{}/members", id), body).await?;
            println!(
                "Mesh {} now has {} members; status {}",
                mesh.id,
                mesh.node_ids.len(),
                colored_status(mesh.status)
            );
        }
    }
    Ok(())
}

async fn apply(api: &ApiClient, id: Uuid) -> CliResult<()> {
    let response = api
        .client
        .post(api.url(&format!("/meshes/{}/apply", id)))
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        let report: ApplyReport = serde_json::from_str(&text)?;
        println!("Mesh {} is {}", id, colored_status(report.status));
        print_outcomes(&report.results);
        return Ok(());
    }

    // Partial failures and superseded applies still carry a report
    match serde_json::from_str::<ApplyErrorResponse>(&text) {
        Ok(failed) => {
            println!("Mesh {} is {}", id, colored_status(failed.report.status));
            print_outcomes(&failed.report.results);
            Err(format!("{} ({})", failed.error.error, failed.error.code).into())
        }
        Err(_) => match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) => Err(format!("{} ({})", err.error, err.code).into()),
            Err(_) => Err(format!("API error: {} {}", status, text.trim()).into()),
        },
    }
}

fn print_mesh(mesh: &MeshView) {
    println!();
    println!("Mesh {} ({})", mesh.name, mesh.id);
    println!("========================================");
    println!("Status:       {}", colored_status(mesh.status));
    println!("Revision:     {}", mesh.revision);
    println!("Topology:     {}", topology_label(&mesh.topology));
    println!("Subnet:       {}", mesh.overlay_subnet);
    println!("Transport:    {}", mesh.transport);
    println!("MTU:          {}", mesh.mtu);
    println!("Base Port:    {}", mesh.port);
    if let Some(applied) = mesh.last_applied_at {
        println!("Applied:      {}", applied.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    println!("{:<20} {:<20} {:<46} {}", "NODE ID", "LAN", "PUBLIC KEY", "LAST APPLY");
    println!("{}", "-".repeat(100));
    for node_id in &mesh.node_ids {
        let lan = mesh
            .lan_subnets
            .get(node_id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let key = mesh.public_keys.get(node_id).map(String::as_str).unwrap_or("-");
        let last = match mesh.node_results.get(node_id) {
            Some(NodeOutcome::Success) => "\x1b[32mok\x1b[0m".to_string(),
            Some(NodeOutcome::Failed { reason }) => format!("\x1b[31m{}\x1b[0m", reason),
            None => "-".to_string(),
        };
        println!("{:<20} {:<20} {:<46} {}", node_id, lan, key, last);
    }
    println!();
}

fn print_status(report: &MeshStatusReport) {
    println!();
    println!("Mesh {} is {} (revision {})", report.mesh_id, colored_status(report.status), report.revision);
    println!(
        "Reachable: {}  |  Unreachable: {}  |  Active: {}  |  Connected peers: {}  |  Links: {}",
        report.reachable,
        report.unreachable,
        report.active,
        report.connected_peers,
        report.expected_links
    );
    println!();
    println!("{:<20} {:<12} {}", "NODE ID", "INTERFACE", "PEERS");
    println!("{}", "-".repeat(60));
    for (node_id, entry) in &report.nodes {
        match entry {
            NodeReport::Reported { status } => {
                let state = if status.active {
                    format!("\x1b[32m{:<12}\x1b[0m", "up")
                } else {
                    format!("\x1b[33m{:<12}\x1b[0m", "down")
                };
                println!(
                    "{:<20} {} {}/{} connected",
                    node_id,
                    state,
                    status.connected_peers(),
                    status.peers.len()
                );
            }
            NodeReport::Failed { reason } => {
                println!("{:<20} \x1b[31m{:<12}\x1b[0m {}", node_id, "unreachable", reason);
            }
        }
    }
    println!();
}

fn print_outcomes(results: &BTreeMap<String, NodeOutcome>) {
    for (node_id, outcome) in results {
        match outcome {
            NodeOutcome::Success => println!("  \x1b[32m✓\x1b[0m {}", node_id),
            NodeOutcome::Failed { reason } => println!("  \x1b[31m✗\x1b[0m {}: {}", node_id, reason),
        }
    }
}

/// Status padded to fixed width BEFORE adding color codes
fn colored_status(status: MeshStatus) -> String {
    let padded = format!("{:<8}", status.to_string());
    match status {
        MeshStatus::Active => format!("\x1b[32m{}\x1b[0m", padded),
        MeshStatus::Pending => format!("\x1b[33m{}\x1b[0m", padded),
        MeshStatus::Error => format!("\x1b[31m{}\x1b[0m", padded),
        MeshStatus::Deleted => padded,
    }
}

fn topology_label(topology: &wolfmesh::mesh::Topology) -> String {
    serde_json::to_value(topology)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Parse repeated NODE=CIDR arguments
fn parse_lan(entries: &[String]) -> CliResult<BTreeMap<String, String>> {
    let mut lan = BTreeMap::new();
    for entry in entries {
        let (node, cidr) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --lan '{}', expected NODE=CIDR", entry))?;
        lan.insert(node.trim().to_string(), cidr.trim().to_string());
    }
    Ok(lan)
}
