//! Address Allocator
//!
//! Owns the overlay address pool and maps node identities to unique host
//! addresses inside it. All mutations of a pool go through one write lock,
//! so concurrent node registrations can never hand out the same address;
//! reads only take the shared side of the lock.

mod pool;

pub use pool::{host_count, parse_pool_cidr, AddressAssignment, AddressPool, PoolStatus};

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::Store;

/// In-memory view of the pool and its assignments
#[derive(Debug)]
struct PoolState {
    pool: AddressPool,
    /// node_id -> assignment
    assignments: BTreeMap<String, AddressAssignment>,
    /// address (as u32) -> owning node_id
    owners: BTreeMap<u32, String>,
}

impl PoolState {
    fn new(pool: AddressPool) -> Self {
        Self {
            pool,
            assignments: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    fn insert(&mut self, assignment: AddressAssignment) {
        if let Some(previous) = self.assignments.get(&assignment.node_id) {
            self.owners.remove(&u32::from(previous.address));
        }
        self.owners
            .insert(u32::from(assignment.address), assignment.node_id.clone());
        self.assignments.insert(assignment.node_id.clone(), assignment);
    }

    fn remove(&mut self, node_id: &str) -> Option<AddressAssignment> {
        let assignment = self.assignments.remove(node_id)?;
        self.owners.remove(&u32::from(assignment.address));
        Some(assignment)
    }

    /// Host addresses not present in the assignment set, lowest first
    fn free_hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.pool.first_host()..=self.pool.last_host())
            .filter(|ip| !self.owners.contains_key(ip))
            .map(Ipv4Addr::from)
    }

    fn first_free(&self) -> Option<Ipv4Addr> {
        self.free_hosts().next()
    }
}

/// Address allocator for the single active pool
pub struct AddressAllocator {
    store: Arc<Store>,
    /// Interface name recorded on new assignments
    interface_name: String,
    state: RwLock<Option<PoolState>>,
}

impl AddressAllocator {
    /// Restore the allocator from persisted state
    pub async fn load(store: Arc<Store>, interface_name: impl Into<String>) -> Result<Self> {
        let pool = store.load_pool().await?;
        let assignments = store.load_assignments().await?;

        let state = match pool {
            Some(pool) => {
                let mut state = PoolState::new(pool);
                for assignment in assignments {
                    if !state.pool.contains_host(assignment.address) {
                        tracing::warn!(
                            "Assignment {} -> {} lies outside pool {}",
                            assignment.node_id,
                            assignment.address,
                            state.pool.cidr
                        );
                    }
                    state.insert(assignment);
                }
                tracing::info!(
                    "Loaded pool {} with {} assignments",
                    state.pool.cidr,
                    state.assignments.len()
                );
                Some(state)
            }
            None => {
                if !assignments.is_empty() {
                    tracing::warn!(
                        "Ignoring {} assignments persisted without a pool",
                        assignments.len()
                    );
                }
                None
            }
        };

        Ok(Self {
            store,
            interface_name: interface_name.into(),
            state: RwLock::new(state),
        })
    }

    /// Create the pool, or return the existing one if the CIDR matches.
    ///
    /// A pool with a different CIDR is replaced only while it holds no
    /// assignments.
    pub async fn get_or_create_pool(&self, cidr: &str, description: &str) -> Result<AddressPool> {
        let cidr = parse_pool_cidr(cidr)?;
        let mut guard = self.state.write().await;

        if let Some(state) = guard.as_mut() {
            if state.pool.cidr == cidr {
                if !description.is_empty() && state.pool.description != description {
                    let mut pool = state.pool.clone();
                    pool.description = description.to_string();
                    pool.updated_at = Utc::now();
                    self.store.save_pool(&pool).await?;
                    state.pool = pool;
                }
                return Ok(state.pool.clone());
            }

            if !state.assignments.is_empty() {
                return Err(Error::PoolConflict {
                    existing: state.pool.cidr.to_string(),
                    requested: cidr.to_string(),
                    assigned: state.assignments.len(),
                });
            }

            let mut pool = state.pool.clone();
            pool.cidr = cidr;
            pool.description = description.to_string();
            pool.updated_at = Utc::now();
            self.store.save_pool(&pool).await?;
            tracing::info!("Pool {} replaced by {}", state.pool.cidr, cidr);
            *state = PoolState::new(pool.clone());
            return Ok(pool);
        }

        let pool = AddressPool::new(cidr, description.to_string());
        self.store.save_pool(&pool).await?;
        tracing::info!("Created address pool {} ({} hosts)", cidr, pool.host_count());
        *guard = Some(PoolState::new(pool.clone()));
        Ok(pool)
    }

    /// Current pool, if any
    pub async fn pool(&self) -> Option<AddressPool> {
        self.state.read().await.as_ref().map(|s| s.pool.clone())
    }

    /// Current pool, or `PoolNotFound`
    pub async fn require_pool(&self) -> Result<AddressPool> {
        self.pool().await.ok_or(Error::PoolNotFound)
    }

    /// Delete the pool. Fails while any assignment exists.
    pub async fn delete_pool(&self) -> Result<AddressPool> {
        let mut guard = self.state.write().await;
        let state = guard.as_ref().ok_or(Error::PoolNotFound)?;

        if !state.assignments.is_empty() {
            return Err(Error::PoolInUse(state.assignments.len()));
        }

        self.store.delete_pool().await?;
        let pool = state.pool.clone();
        *guard = None;
        tracing::info!("Deleted address pool {}", pool.cidr);
        Ok(pool)
    }

    /// Return the node's address, claiming the lowest free one on first call
    pub async fn allocate(&self, node_id: &str) -> Result<AddressAssignment> {
        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(Error::PoolNotFound)?;

        if let Some(existing) = state.assignments.get(node_id) {
            return Ok(existing.clone());
        }

        let address = state
            .first_free()
            .ok_or_else(|| Error::PoolExhausted(state.pool.cidr.to_string()))?;

        let assignment =
            AddressAssignment::new(node_id.to_string(), address, self.interface_name.clone());
        self.store.save_assignment(&assignment).await?;
        state.insert(assignment.clone());

        tracing::info!("Allocated {} to node {}", address, node_id);
        Ok(assignment)
    }

    /// Allocate for a whole member list at once.
    ///
    /// Capacity for every node still lacking an address is checked before
    /// anything is claimed, so an exhausted pool leaves no partial allocation.
    pub async fn allocate_all(&self, node_ids: &[String]) -> Result<Vec<AddressAssignment>> {
        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(Error::PoolNotFound)?;

        let mut missing: Vec<&String> = Vec::new();
        for node_id in node_ids {
            if !state.assignments.contains_key(node_id) && !missing.contains(&node_id) {
                missing.push(node_id);
            }
        }

        let free: Vec<Ipv4Addr> = state.free_hosts().take(missing.len()).collect();
        if free.len() < missing.len() {
            tracing::warn!(
                "Pool {} has {} free addresses, {} needed",
                state.pool.cidr,
                free.len(),
                missing.len()
            );
            return Err(Error::PoolExhausted(state.pool.cidr.to_string()));
        }

        for (node_id, address) in missing.into_iter().zip(free) {
            let assignment =
                AddressAssignment::new(node_id.clone(), address, self.interface_name.clone());
            self.store.save_assignment(&assignment).await?;
            state.insert(assignment);
            tracing::info!("Allocated {} to node {}", address, node_id);
        }

        Ok(node_ids
            .iter()
            .filter_map(|node_id| state.assignments.get(node_id).cloned())
            .collect())
    }

    /// Drop the node's assignment, returning the address to the free set
    pub async fn release(&self, node_id: &str) -> Result<Option<AddressAssignment>> {
        let mut guard = self.state.write().await;
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(None),
        };

        if !state.assignments.contains_key(node_id) {
            return Ok(None);
        }

        self.store.delete_assignment(node_id).await?;
        let released = state.remove(node_id);
        if let Some(assignment) = &released {
            tracing::info!("Released {} from node {}", assignment.address, node_id);
        }
        Ok(released)
    }

    /// Pin a node to a specific address
    pub async fn set_manual(&self, node_id: &str, address: Ipv4Addr) -> Result<AddressAssignment> {
        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(Error::PoolNotFound)?;

        if !state.pool.contains_host(address) {
            return Err(Error::AddressOutOfRange {
                address,
                cidr: state.pool.cidr.to_string(),
            });
        }

        if let Some(owner) = state.owners.get(&u32::from(address)) {
            if owner != node_id {
                return Err(Error::AddressInUse {
                    address,
                    node_id: owner.clone(),
                });
            }
        }

        let assignment = match state.assignments.get(node_id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.address = address;
                updated.updated_at = Utc::now();
                updated
            }
            None => AddressAssignment::new(node_id.to_string(), address, self.interface_name.clone()),
        };

        self.store.save_assignment(&assignment).await?;
        state.insert(assignment.clone());

        tracing::info!("Pinned node {} to {}", node_id, address);
        Ok(assignment)
    }

    /// Look up a node's assignment
    pub async fn get(&self, node_id: &str) -> Option<AddressAssignment> {
        self.state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.assignments.get(node_id).cloned())
    }

    /// All assignments, ordered by address
    pub async fn list(&self) -> Vec<AddressAssignment> {
        let guard = self.state.read().await;
        match guard.as_ref() {
            Some(state) => state
                .owners
                .values()
                .filter_map(|node_id| state.assignments.get(node_id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Pool utilization
    pub async fn status(&self) -> Result<PoolStatus> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(Error::PoolNotFound)?;
        Ok(PoolStatus::compute(&state.pool, state.assignments.len()))
    }
}
