//! Mesh Orchestrator
//!
//! Owns the mesh lifecycle: create, apply, status, rotate-keys, membership
//! changes and delete. Remote work fans out to one task per member; results
//! are joined before any state transition is recorded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::{AgentStatus, NodeAgent};
use crate::allocator::AddressAllocator;
use crate::config::{MeshDefaults, WolfMeshConfig, MTU_RANGE};
use crate::error::{Error, Result};
use crate::mesh::generator::{self, check_port_range};
use crate::mesh::topology;
use crate::mesh::{
    InterfaceSpec, KeyManager, MemberInfo, Mesh, MeshStatus, MeshView, NodeOutcome, Topology,
    Transport,
};
use crate::node::{Node, NodeDirectory};
use crate::store::Store;

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Budget for each per-node agent call
    pub agent_timeout: Duration,
    pub defaults: MeshDefaults,
}

impl OrchestratorSettings {
    pub fn from_config(config: &WolfMeshConfig) -> Self {
        Self {
            agent_timeout: config.agent_timeout(),
            defaults: config.mesh.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&WolfMeshConfig::default())
    }
}

/// Mesh creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMeshRequest {
    pub name: String,
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub lan_subnets: BTreeMap<String, Ipv4Net>,
    #[serde(default)]
    pub overlay_subnet: Option<Ipv4Net>,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub mtu: Option<u16>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Membership change request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMembersRequest {
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub lan_subnets: BTreeMap<String, Ipv4Net>,
}

/// Outcome of an apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub mesh_id: Uuid,
    pub revision: u64,
    pub status: MeshStatus,
    pub results: BTreeMap<String, NodeOutcome>,
    /// Set when the mesh changed or vanished while the apply was in flight;
    /// the results were not recorded.
    pub discarded: bool,
}

impl ApplyReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn failures(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                NodeOutcome::Failed { reason } => Some((id.clone(), reason.clone())),
                NodeOutcome::Success => None,
            })
            .collect()
    }

    /// The partial-apply error, if any member failed
    pub fn failure(&self) -> Option<Error> {
        let failures = self.failures();
        if failures.is_empty() {
            None
        } else {
            Some(Error::PartialApplyFailure { failures })
        }
    }
}

/// What one member reported for a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum NodeReport {
    Reported { status: AgentStatus },
    Failed { reason: String },
}

/// Aggregated status of a mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshStatusReport {
    pub mesh_id: Uuid,
    /// Stored lifecycle state, never altered by a status query
    pub status: MeshStatus,
    pub revision: u64,
    pub nodes: BTreeMap<String, NodeReport>,
    /// Members that answered
    pub reachable: usize,
    pub unreachable: usize,
    /// Answering members with an active interface
    pub active: usize,
    /// Connected peer links across answering members
    pub connected_peers: usize,
    /// Links the topology calls for
    pub expected_links: usize,
}

/// Outcome of a mesh deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalReport {
    pub mesh_id: Uuid,
    pub status: MeshStatus,
    pub results: BTreeMap<String, NodeOutcome>,
}

/// Mesh lifecycle manager
pub struct MeshOrchestrator {
    store: Arc<Store>,
    allocator: Arc<AddressAllocator>,
    nodes: Arc<NodeDirectory>,
    agent: Arc<dyn NodeAgent>,
    meshes: RwLock<HashMap<Uuid, Mesh>>,
    settings: OrchestratorSettings,
}

impl MeshOrchestrator {
    /// Restore meshes from the store
    pub async fn load(
        store: Arc<Store>,
        allocator: Arc<AddressAllocator>,
        nodes: Arc<NodeDirectory>,
        agent: Arc<dyn NodeAgent>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let meshes: HashMap<Uuid, Mesh> = store
            .load_meshes()
            .await?
            .into_iter()
            .map(|mesh| (mesh.id, mesh))
            .collect();
        tracing::info!("Loaded {} meshes", meshes.len());

        Ok(Self {
            store,
            allocator,
            nodes,
            agent,
            meshes: RwLock::new(meshes),
            settings,
        })
    }

    /// Create a mesh in the pending state
    pub async fn create(&self, req: CreateMeshRequest) -> Result<Mesh> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidArgument("mesh name cannot be empty".into()));
        }

        let pool = self.allocator.require_pool().await?;
        if let Some(requested) = req.overlay_subnet {
            if requested != pool.cidr {
                return Err(Error::SubnetMismatch {
                    requested: requested.to_string(),
                    pool: pool.cidr.to_string(),
                });
            }
        }

        let mtu = req.mtu.unwrap_or(self.settings.defaults.default_mtu);
        if !MTU_RANGE.contains(&mtu) {
            return Err(Error::InvalidArgument(format!(
                "mtu {} outside {}..={}",
                mtu,
                MTU_RANGE.start(),
                MTU_RANGE.end()
            )));
        }
        let port = req.port.unwrap_or(self.settings.defaults.default_port);
        if port == 0 {
            return Err(Error::InvalidArgument("port cannot be 0".into()));
        }

        validate_members(&req.node_ids, &req.lan_subnets, &pool.cidr)?;
        check_port_range(port, req.node_ids.len())?;
        self.nodes.get_many(&req.node_ids).await?;
        self.allocator.allocate_all(&req.node_ids).await?;

        let now = Utc::now();
        let mut mesh = Mesh {
            id: Uuid::new_v4(),
            name: req.name,
            topology: req.topology,
            overlay_subnet: pool.cidr,
            mtu,
            transport: req.transport.unwrap_or(self.settings.defaults.default_transport),
            port,
            node_ids: req.node_ids,
            lan_subnets: req.lan_subnets,
            keys: BTreeMap::new(),
            status: MeshStatus::Pending,
            revision: 1,
            node_results: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_applied_at: None,
        };
        KeyManager::ensure_keys(&mut mesh);

        self.store.save_mesh(&mesh).await?;
        self.meshes.write().await.insert(mesh.id, mesh.clone());

        tracing::info!(
            "Created mesh {} '{}' ({} members, {:?})",
            mesh.id,
            mesh.name,
            mesh.node_ids.len(),
            mesh.topology
        );
        Ok(mesh)
    }

    /// Look up a mesh
    pub async fn get(&self, id: Uuid) -> Result<Mesh> {
        self.meshes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::MeshNotFound(id))
    }

    /// All meshes, oldest first
    pub async fn list(&self) -> Vec<Mesh> {
        let mut meshes: Vec<Mesh> = self.meshes.read().await.values().cloned().collect();
        meshes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        meshes
    }

    /// Push every member's interface spec to its agent.
    ///
    /// The mesh becomes active only if all members succeed; otherwise it
    /// moves to error with the per-node reasons recorded.
    pub async fn apply(&self, id: Uuid) -> Result<ApplyReport> {
        let mesh = self.prepare_apply(id).await?;
        let members = self.member_infos(&mesh, true).await?;
        let specs = generator::generate(&mesh, &members)?;
        let nodes = self.nodes.get_many(&mesh.node_ids).await?;

        tracing::info!(
            "Applying mesh {} revision {} to {} members",
            mesh.id,
            mesh.revision,
            specs.len()
        );

        let targets = specs
            .into_iter()
            .filter_map(|(node_id, spec)| {
                nodes.get(&node_id).cloned().map(|node| (node_id, (node, spec)))
            })
            .collect();
        let results = self
            .fan_out(targets, move |agent, (node, spec): (Node, InterfaceSpec)| async move {
                agent.apply(&node, id, &spec).await
            })
            .await;

        let results: BTreeMap<String, NodeOutcome> = results
            .into_iter()
            .map(|(node_id, result)| {
                let outcome = match result {
                    Ok(()) => NodeOutcome::Success,
                    Err(e) => {
                        tracing::warn!("Apply of mesh {} failed on {}: {}", id, node_id, e);
                        NodeOutcome::Failed { reason: e.to_string() }
                    }
                };
                (node_id, outcome)
            })
            .collect();

        self.record_apply(mesh.id, mesh.revision, results).await
    }

    /// Query every member's agent without touching mesh state
    pub async fn status(&self, id: Uuid) -> Result<MeshStatusReport> {
        let mesh = self.get(id).await?;

        let mut nodes = BTreeMap::new();
        let mut targets = Vec::with_capacity(mesh.node_ids.len());
        for node_id in &mesh.node_ids {
            match self.nodes.get(node_id).await {
                Ok(node) => targets.push((node_id.clone(), node)),
                Err(e) => {
                    nodes.insert(node_id.clone(), NodeReport::Failed { reason: e.to_string() });
                }
            }
        }

        let results = self
            .fan_out(targets, move |agent, node: Node| async move {
                agent.status(&node, id).await
            })
            .await;

        for (node_id, result) in results {
            let report = match result {
                Ok(status) => NodeReport::Reported { status },
                Err(e) => {
                    tracing::debug!("Status of mesh {} unavailable on {}: {}", id, node_id, e);
                    NodeReport::Failed { reason: e.to_string() }
                }
            };
            nodes.insert(node_id, report);
        }

        let mut report = MeshStatusReport {
            mesh_id: mesh.id,
            status: mesh.status,
            revision: mesh.revision,
            nodes: BTreeMap::new(),
            reachable: 0,
            unreachable: 0,
            active: 0,
            connected_peers: 0,
            expected_links: topology::pair_count(&topology::plan(&mesh.node_ids, mesh.topology)),
        };
        for entry in nodes.values() {
            match entry {
                NodeReport::Reported { status } => {
                    report.reachable += 1;
                    if status.active {
                        report.active += 1;
                    }
                    report.connected_peers += status.connected_peers();
                }
                NodeReport::Failed { .. } => report.unreachable += 1,
            }
        }
        report.nodes = nodes;
        Ok(report)
    }

    /// Regenerate every member's keypair. Never applies; the mesh returns to
    /// pending until the next explicit apply.
    pub async fn rotate_keys(&self, id: Uuid) -> Result<Mesh> {
        let mesh = self
            .modify(id, |mesh| {
                KeyManager::rotate(mesh);
                mesh.mark_pending();
                Ok(())
            })
            .await?;
        tracing::info!("Rotated keys of mesh {} (revision {})", id, mesh.revision);
        Ok(mesh)
    }

    /// Replace the member set and LAN subnets
    pub async fn update_members(&self, id: Uuid, req: UpdateMembersRequest) -> Result<Mesh> {
        let pool = self.allocator.require_pool().await?;
        validate_members(&req.node_ids, &req.lan_subnets, &pool.cidr)?;
        self.nodes.get_many(&req.node_ids).await?;

        let current = self.get(id).await?;
        check_port_range(current.port, req.node_ids.len())?;
        self.allocator.allocate_all(&req.node_ids).await?;

        let retained: BTreeSet<&String> = req.node_ids.iter().collect();
        let removed: Vec<String> = current
            .node_ids
            .iter()
            .filter(|node_id| !retained.contains(node_id))
            .cloned()
            .collect();

        let mesh = self
            .modify(id, move |mesh| {
                mesh.node_ids = req.node_ids;
                mesh.lan_subnets = req.lan_subnets;
                KeyManager::prune(mesh);
                KeyManager::ensure_keys(mesh);
                mesh.mark_pending();
                Ok(())
            })
            .await?;

        tracing::info!(
            "Updated members of mesh {}: {} members, {} removed",
            id,
            mesh.node_ids.len(),
            removed.len()
        );
        if !removed.is_empty() {
            self.remove_from(id, &removed).await;
        }
        Ok(mesh)
    }

    /// Drop a node from every mesh it belongs to and tear down its state.
    /// Returns the affected mesh IDs.
    pub async fn detach_node(&self, node: &Node) -> Result<Vec<Uuid>> {
        let affected: Vec<Uuid> = self
            .meshes
            .read()
            .await
            .values()
            .filter(|mesh| mesh.has_member(&node.id))
            .map(|mesh| mesh.id)
            .collect();

        for mesh_id in &affected {
            let node_id = node.id.clone();
            self.modify(*mesh_id, move |mesh| {
                mesh.node_ids.retain(|id| *id != node_id);
                mesh.lan_subnets.remove(&node_id);
                KeyManager::prune(mesh);
                mesh.mark_pending();
                Ok(())
            })
            .await?;

            let outcome = self
                .fan_out(vec![(node.id.clone(), node.clone())], move |agent, node: Node| {
                    let mesh_id = *mesh_id;
                    async move { agent.remove(&node, mesh_id).await }
                })
                .await;
            if let Some(Err(e)) = outcome.get(&node.id) {
                tracing::warn!("Skipping teardown of mesh {} on {}: {}", mesh_id, node.id, e);
            }
            tracing::info!("Detached node {} from mesh {}", node.id, mesh_id);
        }

        Ok(affected)
    }

    /// Return every mesh containing the node to pending after its overlay
    /// address changed. Returns the affected mesh IDs.
    pub async fn invalidate_member(&self, node_id: &str) -> Result<Vec<Uuid>> {
        let affected: Vec<Uuid> = self
            .meshes
            .read()
            .await
            .values()
            .filter(|mesh| mesh.has_member(node_id))
            .map(|mesh| mesh.id)
            .collect();

        for mesh_id in &affected {
            self.modify(*mesh_id, |mesh| {
                mesh.mark_pending();
                Ok(())
            })
            .await?;
            tracing::info!("Mesh {} needs re-apply: address of {} changed", mesh_id, node_id);
        }
        Ok(affected)
    }

    /// Tear down the mesh on every member, then delete its record.
    /// Unreachable members are logged and skipped. Overlay addresses stay
    /// assigned.
    pub async fn delete(&self, id: Uuid) -> Result<RemovalReport> {
        let mesh = self.get(id).await?;
        let results = self.remove_from(id, &mesh.node_ids).await;

        let removed = self.meshes.write().await.remove(&id).is_some();
        if removed {
            self.store.delete_mesh(id).await?;
        }
        tracing::info!("Deleted mesh {} '{}'", id, mesh.name);

        Ok(RemovalReport {
            mesh_id: id,
            status: MeshStatus::Deleted,
            results,
        })
    }

    /// Generated interface spec for one member, as it would be applied
    pub async fn render_config(&self, id: Uuid, node_id: &str) -> Result<InterfaceSpec> {
        let mesh = self.get(id).await?;
        if !mesh.has_member(node_id) {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        let members = self.member_infos(&mesh, false).await?;
        generator::generate_for(&mesh, node_id, &members)
    }

    /// Public views of all meshes
    pub async fn views(&self) -> Vec<MeshView> {
        self.list().await.iter().map(Mesh::view).collect()
    }

    /// Lazily allocate keys for members lacking them, then snapshot the mesh
    async fn prepare_apply(&self, id: Uuid) -> Result<Mesh> {
        let pool = self.allocator.require_pool().await?;
        let mesh = self
            .modify(id, |mesh| {
                if mesh.overlay_subnet != pool.cidr {
                    return Err(Error::SubnetMismatch {
                        requested: mesh.overlay_subnet.to_string(),
                        pool: pool.cidr.to_string(),
                    });
                }
                if mesh.node_ids.len() < 2 {
                    return Err(Error::InsufficientMembers(mesh.node_ids.len()));
                }
                KeyManager::ensure_keys(mesh);
                Ok(())
            })
            .await?;
        Ok(mesh)
    }

    /// Record apply results unless the mesh moved on in the meantime
    async fn record_apply(
        &self,
        id: Uuid,
        revision: u64,
        results: BTreeMap<String, NodeOutcome>,
    ) -> Result<ApplyReport> {
        let mut meshes = self.meshes.write().await;
        let Some(current) = meshes.get(&id) else {
            tracing::warn!("Mesh {} deleted during apply, discarding results", id);
            return Ok(ApplyReport {
                mesh_id: id,
                revision,
                status: MeshStatus::Deleted,
                results,
                discarded: true,
            });
        };
        if current.revision != revision {
            tracing::warn!(
                "Mesh {} changed during apply (revision {} -> {}), discarding results",
                id,
                revision,
                current.revision
            );
            return Ok(ApplyReport {
                mesh_id: id,
                revision,
                status: current.status,
                results,
                discarded: true,
            });
        }

        let mut updated = current.clone();
        let now = Utc::now();
        updated.status = if results.values().all(NodeOutcome::is_success) {
            MeshStatus::Active
        } else {
            MeshStatus::Error
        };
        updated.node_results = results.clone();
        updated.updated_at = now;
        updated.last_applied_at = Some(now);

        self.store.save_mesh(&updated).await?;
        let status = updated.status;
        meshes.insert(id, updated);

        tracing::info!("Mesh {} is now {}", id, status);
        Ok(ApplyReport {
            mesh_id: id,
            revision,
            status,
            results,
            discarded: false,
        })
    }

    /// Apply a change to a copy of the mesh, persist it, then publish it
    async fn modify<F>(&self, id: Uuid, change: F) -> Result<Mesh>
    where
        F: FnOnce(&mut Mesh) -> Result<()>,
    {
        let mut meshes = self.meshes.write().await;
        let mut mesh = meshes.get(&id).cloned().ok_or(Error::MeshNotFound(id))?;
        change(&mut mesh)?;
        self.store.save_mesh(&mesh).await?;
        meshes.insert(id, mesh.clone());
        Ok(mesh)
    }

    /// Gather addresses and roles for every member
    async fn member_infos(&self, mesh: &Mesh, allocate: bool) -> Result<BTreeMap<String, MemberInfo>> {
        let nodes = self.nodes.get_many(&mesh.node_ids).await?;
        let mut members = BTreeMap::new();
        for (node_id, node) in nodes {
            let assignment = if allocate {
                self.allocator.allocate(&node_id).await?
            } else {
                self.allocator.get(&node_id).await.ok_or_else(|| {
                    Error::InvalidArgument(format!("node {} has no overlay address", node_id))
                })?
            };
            members.insert(
                node_id,
                MemberInfo {
                    address: assignment.address,
                    interface_name: assignment.interface_name,
                    role: node.role,
                    public_host: node.public_host,
                },
            );
        }
        Ok(members)
    }

    /// Best-effort teardown of a mesh on the given nodes
    async fn remove_from(&self, id: Uuid, node_ids: &[String]) -> BTreeMap<String, NodeOutcome> {
        let mut results = BTreeMap::new();
        let mut targets = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            match self.nodes.get(node_id).await {
                Ok(node) => targets.push((node_id.clone(), node)),
                Err(e) => {
                    tracing::warn!("Skipping teardown of mesh {} on {}: {}", id, node_id, e);
                    results.insert(node_id.clone(), NodeOutcome::Failed { reason: e.to_string() });
                }
            }
        }

        let removed = self
            .fan_out(targets, move |agent, node: Node| async move {
                agent.remove(&node, id).await
            })
            .await;
        for (node_id, result) in removed {
            let outcome = match result {
                Ok(()) => NodeOutcome::Success,
                Err(e) => {
                    tracing::warn!("Skipping teardown of mesh {} on {}: {}", id, node_id, e);
                    NodeOutcome::Failed { reason: e.to_string() }
                }
            };
            results.insert(node_id, outcome);
        }
        results
    }

    /// Run one agent call per target concurrently, each under the agent
    /// timeout. Calls run on their own tasks, so a caller that stops waiting
    /// does not cancel calls already in flight.
    async fn fan_out<I, T, F, Fut>(&self, targets: Vec<(String, I)>, call: F) -> BTreeMap<String, Result<T>>
    where
        F: Fn(Arc<dyn NodeAgent>, I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.settings.agent_timeout;
        let (ids, handles): (Vec<String>, Vec<_>) = targets
            .into_iter()
            .map(|(node_id, input)| {
                let pending = call(Arc::clone(&self.agent), input);
                let task_node = node_id.clone();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::AgentUnreachable {
                            node_id: task_node,
                            reason: format!("timed out after {}ms", timeout.as_millis()),
                        }),
                    }
                });
                (node_id, handle)
            })
            .unzip();

        let joined = futures::future::join_all(handles).await;
        ids.into_iter()
            .zip(joined)
            .map(|(node_id, result)| {
                let result = result
                    .unwrap_or_else(|e| Err(Error::Internal(format!("agent task failed: {}", e))));
                (node_id, result)
            })
            .collect()
    }
}

/// Check a member list and its LAN subnets
fn validate_members(
    node_ids: &[String],
    lan_subnets: &BTreeMap<String, Ipv4Net>,
    overlay: &Ipv4Net,
) -> Result<()> {
    if node_ids.len() < 2 {
        return Err(Error::InsufficientMembers(node_ids.len()));
    }

    let mut seen = BTreeSet::new();
    for node_id in node_ids {
        if !seen.insert(node_id.as_str()) {
            return Err(Error::InvalidArgument(format!("duplicate member {}", node_id)));
        }
    }

    let subnets: Vec<(&String, &Ipv4Net)> = lan_subnets.iter().collect();
    for (i, (node_id, subnet)) in subnets.iter().enumerate() {
        if !seen.contains(node_id.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "LAN subnet given for non-member {}",
                node_id
            )));
        }
        if **subnet != subnet.trunc() {
            return Err(Error::InvalidCidr(format!(
                "{} has host bits set (did you mean {}?)",
                subnet,
                subnet.trunc()
            )));
        }
        if overlaps(subnet, overlay) {
            return Err(Error::InvalidArgument(format!(
                "LAN subnet {} of {} overlaps the overlay subnet {}",
                subnet, node_id, overlay
            )));
        }
        for (other_id, other) in &subnets[i + 1..] {
            if overlaps(subnet, other) {
                return Err(Error::InvalidArgument(format!(
                    "LAN subnets of {} ({}) and {} ({}) overlap",
                    node_id, subnet, other_id, other
                )));
            }
        }
    }
    Ok(())
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistration, NodeRole};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Ok,
        Reject,
        Hang,
        Delay(u64),
    }

    /// Agent whose behaviour is scripted per node
    #[derive(Default)]
    struct ScriptedAgent {
        scripts: Mutex<HashMap<String, Script>>,
        applied: Mutex<Vec<(String, InterfaceSpec)>>,
        removed: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn script(&self, node_id: &str, script: Script) {
            self.scripts.lock().unwrap().insert(node_id.into(), script);
        }

        async fn run(&self, node: &Node) -> Result<()> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&node.id)
                .copied()
                .unwrap_or(Script::Ok);
            match script {
                Script::Ok => Ok(()),
                Script::Reject => Err(Error::AgentRejected {
                    node_id: node.id.clone(),
                    reason: "interface busy".into(),
                }),
                Script::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Script::Delay(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeAgent for ScriptedAgent {
        async fn apply(&self, node: &Node, _mesh_id: Uuid, spec: &InterfaceSpec) -> Result<()> {
            self.run(node).await?;
            self.applied.lock().unwrap().push((node.id.clone(), spec.clone()));
            Ok(())
        }

        async fn remove(&self, node: &Node, _mesh_id: Uuid) -> Result<()> {
            self.run(node).await?;
            self.removed.lock().unwrap().push(node.id.clone());
            Ok(())
        }

        async fn status(&self, node: &Node, _mesh_id: Uuid) -> Result<AgentStatus> {
            self.run(node).await?;
            Ok(AgentStatus {
                active: true,
                peers: vec![],
            })
        }
    }

    struct Fixture {
        store: Arc<Store>,
        allocator: Arc<AddressAllocator>,
        nodes: Arc<NodeDirectory>,
        agent: Arc<ScriptedAgent>,
        orchestrator: Arc<MeshOrchestrator>,
    }

    async fn fixture(node_ids: &[&str]) -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let allocator = Arc::new(AddressAllocator::load(Arc::clone(&store), "wolfmesh0").await.unwrap());
        allocator.get_or_create_pool("10.88.0.0/24", "test").await.unwrap();

        let nodes = Arc::new(NodeDirectory::load(Arc::clone(&store)).await.unwrap());
        for id in node_ids {
            nodes
                .register(NodeRegistration {
                    id: id.to_string(),
                    name: None,
                    role: NodeRole::Server,
                    public_host: Some(format!("{}.example.net", id)),
                    agent_url: format!("https://{}.example.net:7443", id),
                    fingerprint: None,
                })
                .await
                .unwrap();
        }

        let agent = Arc::new(ScriptedAgent::default());
        let settings = OrchestratorSettings {
            agent_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let orchestrator = Arc::new(
            MeshOrchestrator::load(
                Arc::clone(&store),
                Arc::clone(&allocator),
                Arc::clone(&nodes),
                Arc::clone(&agent) as Arc<dyn NodeAgent>,
                settings,
            )
            .await
            .unwrap(),
        );

        Fixture {
            store,
            allocator,
            nodes,
            agent,
            orchestrator,
        }
    }

    fn request(members: &[&str]) -> CreateMeshRequest {
        CreateMeshRequest {
            name: "branch-offices".into(),
            node_ids: members.iter().map(|s| s.to_string()).collect(),
            lan_subnets: BTreeMap::new(),
            overlay_subnet: None,
            topology: Topology::FullMesh,
            transport: None,
            mtu: None,
            port: None,
        }
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = fixture(&["a", "b", "c"]).await;
        let orch = &f.orchestrator;

        assert!(matches!(
            orch.create(request(&["a"])).await,
            Err(Error::InsufficientMembers(1))
        ));
        assert!(matches!(
            orch.create(request(&["a", "a"])).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            orch.create(request(&["a", "zz"])).await,
            Err(Error::NodeNotFound(_))
        ));

        let mut mismatch = request(&["a", "b"]);
        mismatch.overlay_subnet = Some("10.99.0.0/24".parse().unwrap());
        assert!(matches!(orch.create(mismatch).await, Err(Error::SubnetMismatch { .. })));

        let mut overlap = request(&["a", "b"]);
        overlap.lan_subnets.insert("a".into(), "10.88.0.0/25".parse().unwrap());
        assert!(matches!(orch.create(overlap).await, Err(Error::InvalidArgument(_))));

        let mut stranger = request(&["a", "b"]);
        stranger.lan_subnets.insert("c".into(), "192.168.1.0/24".parse().unwrap());
        assert!(matches!(orch.create(stranger).await, Err(Error::InvalidArgument(_))));

        let mut tiny_mtu = request(&["a", "b"]);
        tiny_mtu.mtu = Some(576);
        assert!(matches!(orch.create(tiny_mtu).await, Err(Error::InvalidArgument(_))));

        // Nothing was allocated by the failed attempts
        assert!(f.allocator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_pool() {
        let f = fixture(&["a", "b"]).await;
        f.allocator.delete_pool().await.unwrap();
        assert!(matches!(
            f.orchestrator.create(request(&["a", "b"])).await,
            Err(Error::PoolNotFound)
        ));
    }

    #[tokio::test]
    async fn test_create_allocates_and_keys() {
        let f = fixture(&["a", "b", "c"]).await;
        let mut req = request(&["a", "b", "c"]);
        req.overlay_subnet = Some("10.88.0.0/24".parse().unwrap());
        let mesh = f.orchestrator.create(req).await.unwrap();

        assert_eq!(mesh.status, MeshStatus::Pending);
        assert_eq!(mesh.keys.len(), 3);
        assert_eq!(mesh.overlay_subnet.to_string(), "10.88.0.0/24");
        assert_eq!(f.allocator.list().await.len(), 3);
        assert!(f.agent.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_all_succeed() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();

        let report = f.orchestrator.apply(mesh.id).await.unwrap();
        assert_eq!(report.status, MeshStatus::Active);
        assert_eq!(report.succeeded(), 3);
        assert!(report.failure().is_none());
        assert!(!report.discarded);

        let stored = f.orchestrator.get(mesh.id).await.unwrap();
        assert_eq!(stored.status, MeshStatus::Active);
        assert!(stored.last_applied_at.is_some());

        let applied = f.agent.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 3);
        for (node_id, spec) in applied {
            assert_eq!(spec.peers.len(), 2);
            assert_eq!(spec.private_key, stored.keys[&node_id].private_key);
        }
    }

    #[tokio::test]
    async fn test_partial_apply_failure() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();
        f.agent.script("c", Script::Hang);

        let report = f.orchestrator.apply(mesh.id).await.unwrap();
        assert_eq!(report.status, MeshStatus::Error);
        assert_eq!(report.succeeded(), 2);

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures["c"].contains("timed out"));
        assert!(matches!(
            report.failure(),
            Some(Error::PartialApplyFailure { failures }) if failures.contains_key("c")
        ));

        let stored = f.orchestrator.get(mesh.id).await.unwrap();
        assert_eq!(stored.status, MeshStatus::Error);
        assert!(stored.node_results["a"].is_success());
        assert!(!stored.node_results["c"].is_success());

        // Retrying once the node recovers brings the mesh up
        f.agent.script("c", Script::Ok);
        let retry = f.orchestrator.apply(mesh.id).await.unwrap();
        assert_eq!(retry.status, MeshStatus::Active);
    }

    #[tokio::test]
    async fn test_rotation_requires_reapply() {
        let f = fixture(&["a", "b"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();
        let applied_count = f.agent.applied.lock().unwrap().len();

        let rotated = f.orchestrator.rotate_keys(mesh.id).await.unwrap();
        assert_eq!(rotated.status, MeshStatus::Pending);
        assert!(rotated.revision > mesh.revision);
        for id in &mesh.node_ids {
            assert_ne!(rotated.keys[id].public_key, mesh.keys[id].public_key);
        }
        assert_eq!(f.agent.applied.lock().unwrap().len(), applied_count);

        let status = f.orchestrator.status(mesh.id).await.unwrap();
        assert_eq!(status.status, MeshStatus::Pending);
        assert_eq!(status.active, 2);
    }

    #[tokio::test]
    async fn test_status_excludes_failed_members() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();
        f.agent.script("b", Script::Reject);
        f.agent.script("c", Script::Hang);

        let status = f.orchestrator.status(mesh.id).await.unwrap();
        assert_eq!(status.status, MeshStatus::Active);
        assert_eq!(status.reachable, 1);
        assert_eq!(status.unreachable, 2);
        assert_eq!(status.active, 1);
        assert_eq!(status.expected_links, 3);
        assert!(matches!(status.nodes["b"], NodeReport::Failed { .. }));
        assert_eq!(
            f.orchestrator.get(mesh.id).await.unwrap().status,
            MeshStatus::Active
        );
    }

    #[tokio::test]
    async fn test_stale_apply_is_discarded() {
        let f = fixture(&["a", "b"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        f.agent.script("a", Script::Delay(50));
        f.agent.script("b", Script::Delay(50));

        let orch = Arc::clone(&f.orchestrator);
        let (report, rotated) = tokio::join!(orch.apply(mesh.id), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.orchestrator.rotate_keys(mesh.id).await
        });
        let report = report.unwrap();
        rotated.unwrap();

        assert!(report.discarded);
        assert_eq!(report.status, MeshStatus::Pending);
        assert_eq!(
            f.orchestrator.get(mesh.id).await.unwrap().status,
            MeshStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_delete_is_best_effort_and_keeps_addresses() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();
        f.agent.script("c", Script::Hang);

        let report = f.orchestrator.delete(mesh.id).await.unwrap();
        assert_eq!(report.status, MeshStatus::Deleted);
        assert!(report.results["a"].is_success());
        assert!(!report.results["c"].is_success());

        assert!(matches!(
            f.orchestrator.get(mesh.id).await,
            Err(Error::MeshNotFound(_))
        ));
        assert!(f.store.load_meshes().await.unwrap().is_empty());
        assert_eq!(f.allocator.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_update_members() {
        let f = fixture(&["a", "b", "c", "d"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();

        let mut lan = BTreeMap::new();
        lan.insert("d".to_string(), "192.168.40.0/24".parse().unwrap());
        let updated = f
            .orchestrator
            .update_members(
                mesh.id,
                UpdateMembersRequest {
                    node_ids: vec!["a".into(), "b".into(), "d".into()],
                    lan_subnets: lan,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, MeshStatus::Pending);
        assert_eq!(updated.keys["a"], mesh.keys["a"]);
        assert!(updated.keys.contains_key("d"));
        assert!(!updated.keys.contains_key("c"));
        assert_eq!(*f.agent.removed.lock().unwrap(), vec!["c".to_string()]);
        assert!(f.allocator.get("d").await.is_some());

        let spec = f.orchestrator.render_config(mesh.id, "a").await.unwrap();
        let to_d = spec.peers.iter().find(|p| p.node_id == "d").unwrap();
        assert_eq!(to_d.allowed_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_node() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b", "c"])).await.unwrap();
        let node = f.nodes.get("c").await.unwrap();

        let affected = f.orchestrator.detach_node(&node).await.unwrap();
        assert_eq!(affected, vec![mesh.id]);

        let stored = f.orchestrator.get(mesh.id).await.unwrap();
        assert_eq!(stored.node_ids, vec!["a".to_string(), "b".to_string()]);
        assert!(!stored.keys.contains_key("c"));
        assert_eq!(*f.agent.removed.lock().unwrap(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_create_against_nearly_full_pool() {
        let f = fixture(&["a", "b", "c"]).await;
        f.allocator.get_or_create_pool("10.88.0.0/30", "tiny").await.unwrap();
        f.allocator.allocate("a").await.unwrap();

        assert!(matches!(
            f.orchestrator.create(request(&["a", "b", "c"])).await,
            Err(Error::PoolExhausted(_))
        ));
        assert!(f.allocator.get("b").await.is_none());
        assert!(f.allocator.get("c").await.is_none());
        assert!(f.orchestrator.list().await.is_empty());

        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        assert_eq!(mesh.node_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_member() {
        let f = fixture(&["a", "b", "c"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        let other = f.orchestrator.create(request(&["b", "c"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();
        f.orchestrator.apply(other.id).await.unwrap();

        let affected = f.orchestrator.invalidate_member("a").await.unwrap();
        assert_eq!(affected, vec![mesh.id]);

        let stored = f.orchestrator.get(mesh.id).await.unwrap();
        assert_eq!(stored.status, MeshStatus::Pending);
        assert_eq!(stored.revision, mesh.revision + 1);
        assert_eq!(
            f.orchestrator.get(other.id).await.unwrap().status,
            MeshStatus::Active
        );
    }

    #[tokio::test]
    async fn test_rendered_config_matches_applied() {
        let f = fixture(&["a", "b"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();

        let applied = f.agent.applied.lock().unwrap().clone();
        for (node_id, spec) in applied {
            let rendered = f.orchestrator.render_config(mesh.id, &node_id).await.unwrap();
            assert_eq!(rendered, spec);
        }
        assert!(matches!(
            f.orchestrator.render_config(mesh.id, "zz").await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_meshes_survive_reload() {
        let f = fixture(&["a", "b"]).await;
        let mesh = f.orchestrator.create(request(&["a", "b"])).await.unwrap();
        f.orchestrator.apply(mesh.id).await.unwrap();

        let reloaded = MeshOrchestrator::load(
            Arc::clone(&f.store),
            Arc::clone(&f.allocator),
            Arc::clone(&f.nodes),
            Arc::clone(&f.agent) as Arc<dyn NodeAgent>,
            OrchestratorSettings::default(),
        )
        .await
        .unwrap();
        let restored = reloaded.get(mesh.id).await.unwrap();
        assert_eq!(restored.status, MeshStatus::Active);
        assert_eq!(restored.keys, f.orchestrator.get(mesh.id).await.unwrap().keys);
    }
}
