//! Address pool and assignment records

use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The single CIDR block overlay addresses are handed out from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    pub id: Uuid,
    pub cidr: Ipv4Net,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressPool {
    pub fn new(cidr: Ipv4Net, description: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cidr,
            description,
            created_at: now,
            updated_at: now,
        }
    }

    /// First usable host (network address + 1)
    pub fn first_host(&self) -> u32 {
        u32::from(self.cidr.network()) + 1
    }

    /// Last usable host (broadcast address - 1)
    pub fn last_host(&self) -> u32 {
        u32::from(self.cidr.broadcast()) - 1
    }

    /// Number of assignable addresses
    pub fn host_count(&self) -> usize {
        host_count(&self.cidr)
    }

    /// Check that an address lies in the host range
    pub fn contains_host(&self, address: Ipv4Addr) -> bool {
        let ip = u32::from(address);
        ip >= self.first_host() && ip <= self.last_host()
    }
}

/// A node's claim on one pool address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub id: Uuid,
    pub node_id: String,
    pub address: Ipv4Addr,
    pub interface_name: String,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressAssignment {
    pub fn new(node_id: String, address: Ipv4Addr, interface_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            node_id,
            address,
            interface_name,
            assigned_at: now,
            updated_at: now,
        }
    }
}

/// Pool utilization snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub cidr: Ipv4Net,
    pub total: usize,
    pub assigned: usize,
    pub available: usize,
    pub utilization_pct: u8,
}

impl PoolStatus {
    pub fn compute(pool: &AddressPool, assigned: usize) -> Self {
        let total = pool.host_count();
        let utilization_pct = if total == 0 {
            0
        } else {
            (assigned as f64 / total as f64 * 100.0).round() as u8
        };

        Self {
            cidr: pool.cidr,
            total,
            assigned,
            available: total.saturating_sub(assigned),
            utilization_pct,
        }
    }
}

/// Usable hosts in a CIDR, excluding network and broadcast
pub fn host_count(cidr: &Ipv4Net) -> usize {
    if cidr.prefix_len() >= 31 {
        return 0;
    }
    (1usize << (32 - cidr.prefix_len())) - 2
}

/// Parse and validate a pool CIDR.
///
/// The prefix must leave at least two host addresses (/30 or shorter) and
/// the address part must be the network address.
pub fn parse_pool_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net = Ipv4Net::from_str(cidr.trim())?;

    if net.prefix_len() > 30 {
        return Err(Error::InvalidCidr(format!(
            "{} leaves no usable host addresses (prefix must be /30 or shorter)",
            net
        )));
    }

    if net.addr() != net.network() {
        return Err(Error::InvalidCidr(format!(
            "{} has host bits set, did you mean {}?",
            net,
            net.trunc()
        )));
    }

    Ok(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_range() {
        let pool = AddressPool::new(parse_pool_cidr("10.88.0.0/24").unwrap(), String::new());
        assert_eq!(pool.host_count(), 254);
        assert!(pool.contains_host(Ipv4Addr::new(10, 88, 0, 1)));
        assert!(pool.contains_host(Ipv4Addr::new(10, 88, 0, 254)));
        assert!(!pool.contains_host(Ipv4Addr::new(10, 88, 0, 0)));
        assert!(!pool.contains_host(Ipv4Addr::new(10, 88, 0, 255)));
        assert!(!pool.contains_host(Ipv4Addr::new(10, 88, 1, 1)));
    }

    #[test]
    fn test_parse_pool_cidr() {
        assert!(parse_pool_cidr("10.88.0.0/30").is_ok());
        assert!(matches!(parse_pool_cidr("10.88.0.0/31"), Err(Error::InvalidCidr(_))));
        assert!(matches!(parse_pool_cidr("10.88.0.7/24"), Err(Error::InvalidCidr(_))));
        assert!(matches!(parse_pool_cidr("not-a-cidr"), Err(Error::InvalidCidr(_))));
    }

    #[test]
    fn test_utilization_rounding() {
        let pool = AddressPool::new(parse_pool_cidr("10.88.0.0/29").unwrap(), String::new());
        let status = PoolStatus::compute(&pool, 1);
        assert_eq!(status.total, 6);
        assert_eq!(status.available, 5);
        // 1/6 = 16.67%
        assert_eq!(status.utilization_pct, 17);
    }
}
