//! Peer Config Generator
//!
//! Turns a mesh's adjacency, addresses, LAN subnets and keys into one
//! interface specification per member. Output is fully determined by its
//! inputs: peers are ordered by node ID and ports by value, so regenerating
//! an unchanged mesh reproduces the previous specs exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as FmtWrite;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mesh::topology::{self, pair_index};
use crate::mesh::{Mesh, Transport};
use crate::node::NodeRole;

/// Keepalive sent to hold NAT and firewall state open
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// What the generator needs to know about a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub address: Ipv4Addr,
    pub interface_name: String,
    pub role: NodeRole,
    /// Publicly reachable host for rendezvous listeners
    pub public_host: Option<String>,
}

impl MemberInfo {
    /// Whether this member advertises listeners
    fn advertises_listener(&self) -> bool {
        self.role == NodeRole::Server && self.public_host.is_some()
    }
}

/// Rendezvous address a peer listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One peer entry of an interface spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Net>,
    pub endpoint: Option<Endpoint>,
    pub persistent_keepalive: u16,
}

/// Interface configuration pushed to one node's agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub interface_name: String,
    pub private_key: String,
    /// Node's overlay address as a single-host prefix
    pub address: Ipv4Net,
    pub mtu: u16,
    pub transport: Transport,
    /// Pair ports this node listens on
    pub listen_ports: Vec<u16>,
    pub peers: Vec<PeerEntry>,
}

impl InterfaceSpec {
    /// Copy with the private key blanked out, for display
    pub fn redacted(&self) -> Self {
        Self {
            private_key: "[REDACTED]".to_string(),
            ..self.clone()
        }
    }

    /// Render as a wg-quick style document
    pub fn to_config_string(&self) -> String {
        let mut config = String::new();

        let _ = writeln!(config, "[Interface]");
        let _ = writeln!(config, "# {}", self.interface_name);
        let _ = writeln!(config, "PrivateKey = {}", self.private_key);
        let _ = writeln!(config, "Address = {}", self.address);
        let _ = writeln!(config, "MTU = {}", self.mtu);
        if !self.listen_ports.is_empty() {
            let ports: Vec<_> = self.listen_ports.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(config, "# ListenPorts ({}) = {}", self.transport, ports.join(", "));
        }

        for peer in &self.peers {
            let _ = writeln!(config);
            let _ = writeln!(config, "# Node: {}", peer.node_id);
            let _ = writeln!(config, "[Peer]");
            let _ = writeln!(config, "PublicKey = {}", peer.public_key);
            let allowed: Vec<_> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
            let _ = writeln!(config, "AllowedIPs = {}", allowed.join(", "));
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(config, "Endpoint = {}", endpoint);
            }
            let _ = writeln!(config, "PersistentKeepalive = {}", peer.persistent_keepalive);
        }

        config
    }
}

/// Rendezvous port for the unordered pair `(a, b)`.
///
/// Members are ranked by ID so both sides derive the same value without a
/// negotiation round-trip.
pub fn rendezvous_port(mesh: &Mesh, a: &str, b: &str) -> Result<u16> {
    let mut sorted: Vec<&str> = mesh.node_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let rank = |id: &str| {
        sorted
            .binary_search(&id)
            .map_err(|_| Error::NodeNotFound(id.to_string()))
    };
    let index = pair_index(rank(a)?, rank(b)?, sorted.len());

    u16::try_from(mesh.port as usize + index).map_err(|_| {
        Error::InvalidArgument(format!(
            "rendezvous port {} + {} exceeds 65535",
            mesh.port, index
        ))
    })
}

/// Check that every pair port of a mesh fits in the port space
pub fn check_port_range(port: u16, members: usize) -> Result<()> {
    let pairs = topology::max_pairs(members);
    if pairs > 0 && port as usize + pairs - 1 > u16::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "base port {} leaves no room for {} pair ports",
            port, pairs
        )));
    }
    Ok(())
}

/// Generate the spec for a single member
pub fn generate_for(
    mesh: &Mesh,
    node_id: &str,
    members: &BTreeMap<String, MemberInfo>,
) -> Result<InterfaceSpec> {
    let adjacency = topology::plan(&mesh.node_ids, mesh.topology);
    let peers = adjacency
        .get(node_id)
        .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
    build_spec(mesh, node_id, peers, members)
}

/// Generate the specs for every member
pub fn generate(
    mesh: &Mesh,
    members: &BTreeMap<String, MemberInfo>,
) -> Result<BTreeMap<String, InterfaceSpec>> {
    let adjacency = topology::plan(&mesh.node_ids, mesh.topology);
    let mut specs = BTreeMap::new();
    for (node_id, peers) in &adjacency {
        specs.insert(node_id.clone(), build_spec(mesh, node_id, peers, members)?);
    }
    Ok(specs)
}

fn build_spec(
    mesh: &Mesh,
    node_id: &str,
    peers: &BTreeSet<String>,
    members: &BTreeMap<String, MemberInfo>,
) -> Result<InterfaceSpec> {
    let local = member(members, node_id)?;
    let key = mesh
        .keys
        .get(node_id)
        .ok_or_else(|| Error::Internal(format!("no key generated for node {}", node_id)))?;

    let mut listen_ports = BTreeSet::new();
    let mut entries = Vec::with_capacity(peers.len());

    for peer_id in peers {
        let peer = member(members, peer_id)?;
        let peer_key = mesh
            .keys
            .get(peer_id)
            .ok_or_else(|| Error::Internal(format!("no key generated for node {}", peer_id)))?;
        let port = rendezvous_port(mesh, node_id, peer_id)?;

        if local.advertises_listener() {
            listen_ports.insert(port);
        }

        let mut allowed_ips = vec![host_prefix(peer.address)];
        if let Some(lan) = mesh.lan_subnets.get(peer_id) {
            allowed_ips.push(*lan);
        }

        let endpoint = match (&peer.public_host, peer.advertises_listener()) {
            (Some(host), true) => Some(Endpoint {
                host: host.clone(),
                port,
                transport: mesh.transport,
            }),
            _ => None,
        };

        entries.push(PeerEntry {
            node_id: peer_id.clone(),
            public_key: peer_key.public_key.clone(),
            allowed_ips,
            endpoint,
            persistent_keepalive: PERSISTENT_KEEPALIVE_SECS,
        });
    }

    Ok(InterfaceSpec {
        interface_name: local.interface_name.clone(),
        private_key: key.private_key.clone(),
        address: host_prefix(local.address),
        mtu: mesh.mtu,
        transport: mesh.transport,
        listen_ports: listen_ports.into_iter().collect(),
        peers: entries,
    })
}

fn member<'a>(members: &'a BTreeMap<String, MemberInfo>, id: &str) -> Result<&'a MemberInfo> {
    members
        .get(id)
        .ok_or_else(|| Error::NodeNotFound(id.to_string()))
}

fn host_prefix(address: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(address)
}
