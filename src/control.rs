//! Control Plane
//!
//! Wires the store, allocator, node directory and orchestrator together and
//! hosts the operations that span several of them.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{HttpNodeAgent, NodeAgent};
use crate::allocator::{parse_pool_cidr, AddressAllocator, AddressAssignment};
use crate::config::WolfMeshConfig;
use crate::error::Result;
use crate::node::{Node, NodeDirectory, NodeRegistration, NodeUpdate};
use crate::orchestrator::{MeshOrchestrator, OrchestratorSettings};
use crate::store::Store;

/// Node together with its overlay address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub address: Option<Ipv4Addr>,
    pub interface_name: Option<String>,
}

impl NodeView {
    fn new(node: Node, assignment: Option<AddressAssignment>) -> Self {
        let (address, interface_name) = match assignment {
            Some(a) => (Some(a.address), Some(a.interface_name)),
            None => (None, None),
        };
        Self {
            node,
            address,
            interface_name,
        }
    }
}

/// Result of deleting a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRemoval {
    pub node: Node,
    /// Overlay address returned to the pool
    pub released: Option<Ipv4Addr>,
    /// Meshes the node was detached from
    pub meshes: Vec<Uuid>,
}

/// The assembled control plane
pub struct ControlPlane {
    allocator: Arc<AddressAllocator>,
    nodes: Arc<NodeDirectory>,
    orchestrator: Arc<MeshOrchestrator>,
}

impl ControlPlane {
    /// Open the on-disk store and talk to agents over HTTP
    pub async fn open(config: &WolfMeshConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.database_path())?);
        let agent = Arc::new(HttpNodeAgent::new(
            config.agent_connect_timeout(),
            config.agent_timeout(),
            &config.agent.api_prefix,
        )?);
        Self::build(store, agent, config).await
    }

    /// Assemble from an existing store and agent
    pub async fn build(
        store: Arc<Store>,
        agent: Arc<dyn NodeAgent>,
        config: &WolfMeshConfig,
    ) -> Result<Self> {
        let allocator = Arc::new(
            AddressAllocator::load(Arc::clone(&store), config.mesh.interface_name.clone()).await?,
        );
        let nodes = Arc::new(NodeDirectory::load(Arc::clone(&store)).await?);

        if let Some(bootstrap) = &config.pool {
            match allocator.pool().await {
                None => {
                    allocator
                        .get_or_create_pool(&bootstrap.cidr, &bootstrap.description)
                        .await?;
                }
                Some(existing) => {
                    let configured = parse_pool_cidr(&bootstrap.cidr)?;
                    if existing.cidr != configured {
                        tracing::warn!(
                            "Keeping stored pool {}; configured bootstrap pool {} ignored",
                            existing.cidr,
                            configured
                        );
                    }
                }
            }
        }

        let orchestrator = Arc::new(
            MeshOrchestrator::load(
                store,
                Arc::clone(&allocator),
                Arc::clone(&nodes),
                agent,
                OrchestratorSettings::from_config(config),
            )
            .await?,
        );

        Ok(Self {
            allocator,
            nodes,
            orchestrator,
        })
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub fn nodes(&self) -> &NodeDirectory {
        &self.nodes
    }

    pub fn orchestrator(&self) -> &MeshOrchestrator {
        &self.orchestrator
    }

    /// Register a node
    pub async fn register_node(&self, req: NodeRegistration) -> Result<NodeView> {
        let node = self.nodes.register(req).await?;
        Ok(self.view(node).await)
    }

    /// Update a node. Meshes containing it return to pending when its
    /// role or public host changes.
    pub async fn update_node(&self, id: &str, update: NodeUpdate) -> Result<NodeView> {
        let previous = self.nodes.get(id).await?;
        let node = self.nodes.update(id, update).await?;
        if node.changes_endpoint(&previous) {
            self.orchestrator.invalidate_member(id).await?;
        }
        Ok(self.view(node).await)
    }

    /// Look up a node with its address
    pub async fn node(&self, id: &str) -> Result<NodeView> {
        let node = self.nodes.get(id).await?;
        Ok(self.view(node).await)
    }

    /// All nodes with their addresses
    pub async fn list_nodes(&self) -> Vec<NodeView> {
        let mut views = Vec::new();
        for node in self.nodes.list().await {
            views.push(self.view(node).await);
        }
        views
    }

    /// Give a registered node an overlay address: the pinned one if given,
    /// otherwise its current or the next free address. Meshes containing the
    /// node return to pending when the address moves.
    pub async fn assign(&self, node_id: &str, address: Option<Ipv4Addr>) -> Result<AddressAssignment> {
        self.nodes.get(node_id).await?;

        let Some(address) = address else {
            return self.allocator.allocate(node_id).await;
        };
        let previous = self.allocator.get(node_id).await.map(|a| a.address);
        let assignment = self.allocator.set_manual(node_id, address).await?;
        if previous.is_some_and(|p| p != address) {
            self.orchestrator.invalidate_member(node_id).await?;
        }
        Ok(assignment)
    }

    /// Return a node's address to the pool. Meshes containing the node
    /// return to pending, since their next apply hands it a new address.
    pub async fn release(&self, node_id: &str) -> Result<Option<AddressAssignment>> {
        let released = self.allocator.release(node_id).await?;
        if released.is_some() {
            self.orchestrator.invalidate_member(node_id).await?;
        }
        Ok(released)
    }

    /// Delete a node: detach it from every mesh, return its address to the
    /// pool, then drop the record.
    pub async fn delete_node(&self, id: &str) -> Result<NodeRemoval> {
        let node = self.nodes.get(id).await?;
        let meshes = self.orchestrator.detach_node(&node).await?;
        let released = self.allocator.release(id).await?.map(|a| a.address);
        let node = self.nodes.remove(id).await?;

        tracing::info!(
            "Deleted node {} (detached from {} meshes, released {:?})",
            id,
            meshes.len(),
            released
        );
        Ok(NodeRemoval {
            node,
            released,
            meshes,
        })
    }

    async fn view(&self, node: Node) -> NodeView {
        let assignment = self.allocator.get(&node.id).await;
        NodeView::new(node, assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::config::PoolConfig;
    use crate::mesh::{InterfaceSpec, MeshStatus, Topology};
    use crate::node::NodeRole;
    use crate::orchestrator::CreateMeshRequest;
    use std::collections::BTreeMap;

    struct AcceptingAgent;

    #[async_trait::async_trait]
    impl NodeAgent for AcceptingAgent {
        async fn apply(&self, _node: &Node, _mesh_id: Uuid, _spec: &InterfaceSpec) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _node: &Node, _mesh_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn status(&self, _node: &Node, _mesh_id: Uuid) -> Result<AgentStatus> {
            Ok(AgentStatus::default())
        }
    }

    fn config() -> WolfMeshConfig {
        let mut config = WolfMeshConfig::default();
        config.pool = Some(PoolConfig {
            cidr: "10.88.0.0/24".into(),
            description: "test".into(),
        });
        config
    }

    fn registration(id: &str) -> NodeRegistration {
        NodeRegistration {
            id: id.into(),
            name: None,
            role: NodeRole::Client,
            public_host: None,
            agent_url: format!("http://{}:7443", id),
            fingerprint: Some(format!("sha256:{}", id)),
        }
    }

    async fn control_plane() -> ControlPlane {
        let store = Arc::new(Store::in_memory().unwrap());
        ControlPlane::build(store, Arc::new(AcceptingAgent), &config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_pool() {
        let control = control_plane().await;
        let pool = control.allocator().require_pool().await.unwrap();
        assert_eq!(pool.cidr.to_string(), "10.88.0.0/24");
    }

    #[tokio::test]
    async fn test_restart_keeps_pool_changed_at_runtime() {
        let store = Arc::new(Store::in_memory().unwrap());
        let control = ControlPlane::build(Arc::clone(&store), Arc::new(AcceptingAgent), &config())
            .await
            .unwrap();
        control
            .allocator()
            .get_or_create_pool("10.99.0.0/24", "moved")
            .await
            .unwrap();
        control.allocator().allocate("a").await.unwrap();
        drop(control);

        let control = ControlPlane::build(Arc::clone(&store), Arc::new(AcceptingAgent), &config())
            .await
            .unwrap();
        let pool = control.allocator().require_pool().await.unwrap();
        assert_eq!(pool.cidr.to_string(), "10.99.0.0/24");
        assert_eq!(
            control.allocator().get("a").await.unwrap().address,
            Ipv4Addr::new(10, 99, 0, 1)
        );

        // A pool deleted at runtime is bootstrapped again only when missing
        control.allocator().release("a").await.unwrap();
        control.allocator().delete_pool().await.unwrap();
        drop(control);
        let control = ControlPlane::build(store, Arc::new(AcceptingAgent), &config())
            .await
            .unwrap();
        let pool = control.allocator().require_pool().await.unwrap();
        assert_eq!(pool.cidr.to_string(), "10.88.0.0/24");
    }

    #[tokio::test]
    async fn test_moving_member_address_invalidates_mesh() {
        let control = control_plane().await;
        for id in ["a", "b"] {
            control.register_node(registration(id)).await.unwrap();
        }
        let mesh = control
            .orchestrator()
            .create(CreateMeshRequest {
                name: "pair".into(),
                node_ids: vec!["a".into(), "b".into()],
                lan_subnets: BTreeMap::new(),
                overlay_subnet: None,
                topology: Topology::FullMesh,
                transport: None,
                mtu: None,
                port: None,
            })
            .await
            .unwrap();
        control.orchestrator().apply(mesh.id).await.unwrap();

        // Same address: nothing to re-apply
        control.assign("a", Some(Ipv4Addr::new(10, 88, 0, 1))).await.unwrap();
        let current = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(current.status, MeshStatus::Active);

        let moved = control.assign("a", Some(Ipv4Addr::new(10, 88, 0, 40))).await.unwrap();
        assert_eq!(moved.address, Ipv4Addr::new(10, 88, 0, 40));
        let current = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(current.status, MeshStatus::Pending);

        control.orchestrator().apply(mesh.id).await.unwrap();
        control.release("b").await.unwrap();
        let current = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(current.status, MeshStatus::Pending);

        assert!(matches!(
            control.assign("zz", None).await,
            Err(crate::error::Error::NodeNotFound(_))
        ));

        control.assign("b", None).await.unwrap();
        control.orchestrator().apply(mesh.id).await.unwrap();
        control
            .update_node(
                "b",
                NodeUpdate {
                    fingerprint: Some("sha256:rotated".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let current = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(current.status, MeshStatus::Active);

        let view = control
            .update_node(
                "b",
                NodeUpdate {
                    role: Some(NodeRole::Server),
                    public_host: Some("b.example.net".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(view.node.role, NodeRole::Server);
        let current = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(current.status, MeshStatus::Pending);
    }

    #[tokio::test]
    async fn test_node_view_includes_address() {
        let control = control_plane().await;
        let view = control.register_node(registration("a")).await.unwrap();
        assert!(view.address.is_none());

        control.allocator().allocate("a").await.unwrap();
        let view = control.node("a").await.unwrap();
        assert_eq!(view.address, Some(Ipv4Addr::new(10, 88, 0, 1)));
        assert_eq!(view.interface_name.as_deref(), Some("wolfmesh0"));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["address"], "10.88.0.1");
    }

    #[tokio::test]
    async fn test_delete_node_cascades() {
        let control = control_plane().await;
        for id in ["a", "b", "c"] {
            control.register_node(registration(id)).await.unwrap();
        }
        let mut lan_subnets = BTreeMap::new();
        lan_subnets.insert("c".to_string(), "192.168.7.0/24".parse().unwrap());
        let mesh = control
            .orchestrator()
            .create(CreateMeshRequest {
                name: "sites".into(),
                node_ids: vec!["a".into(), "b".into(), "c".into()],
                lan_subnets,
                overlay_subnet: None,
                topology: Topology::HubSpoke,
                transport: None,
                mtu: None,
                port: None,
            })
            .await
            .unwrap();
        control.orchestrator().apply(mesh.id).await.unwrap();

        let removal = control.delete_node("c").await.unwrap();
        assert_eq!(removal.released, Some(Ipv4Addr::new(10, 88, 0, 3)));
        assert_eq!(removal.meshes, vec![mesh.id]);

        let mesh = control.orchestrator().get(mesh.id).await.unwrap();
        assert_eq!(mesh.status, MeshStatus::Pending);
        assert!(!mesh.has_member("c"));
        assert!(mesh.lan_subnets.is_empty());
        assert!(control.allocator().get("c").await.is_none());
        assert!(control.node("c").await.is_err());

        // The freed address goes to the next newcomer
        control.register_node(registration("d")).await.unwrap();
        let assignment = control.allocator().allocate("d").await.unwrap();
        assert_eq!(assignment.address, Ipv4Addr::new(10, 88, 0, 3));
    }
}
