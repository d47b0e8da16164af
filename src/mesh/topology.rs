//! Topology Planner
//!
//! Derives the peer adjacency each member must have from the ordered
//! member list and the topology mode.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Adjacency pattern connecting mesh members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Every member links to every other member
    #[default]
    FullMesh,
    /// The first member is the hub; everyone else links only to it
    HubSpoke,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::FullMesh => write!(f, "full-mesh"),
            Topology::HubSpoke => write!(f, "hub-spoke"),
        }
    }
}

/// node_id -> peers that node must link with
pub type Adjacency = BTreeMap<String, BTreeSet<String>>;

/// Compute adjacency for the members.
///
/// Hub selection is positional: the first ID in `members` is the hub.
pub fn plan(members: &[String], topology: Topology) -> Adjacency {
    let mut adjacency: Adjacency = members
        .iter()
        .map(|id| (id.clone(), BTreeSet::new()))
        .collect();

    match topology {
        Topology::FullMesh => {
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    link(&mut adjacency, a, b);
                }
            }
        }
        Topology::HubSpoke => {
            if let Some((hub, spokes)) = members.split_first() {
                for spoke in spokes {
                    link(&mut adjacency, hub, spoke);
                }
            }
        }
    }

    adjacency
}

fn link(adjacency: &mut Adjacency, a: &str, b: &str) {
    if a == b {
        return;
    }
    if let Some(peers) = adjacency.get_mut(a) {
        peers.insert(b.to_string());
    }
    if let Some(peers) = adjacency.get_mut(b) {
        peers.insert(a.to_string());
    }
}

/// Number of unordered links in an adjacency map
pub fn pair_count(adjacency: &Adjacency) -> usize {
    adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
}

/// Row-major index of the pair `(i, j)`, `i < j`, in the upper triangle of
/// an `n x n` matrix. Unique for every unordered pair of `n` members.
pub fn pair_index(i: usize, j: usize, n: usize) -> usize {
    let (i, j) = if i < j { (i, j) } else { (j, i) };
    i * (2 * n - i - 1) / 2 + (j - i - 1)
}

/// Number of distinct pair indices for `n` members
pub fn max_pairs(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_mesh() {
        let adjacency = plan(&ids(&["A", "B", "C", "D"]), Topology::FullMesh);
        assert_eq!(adjacency.len(), 4);
        for (node, peers) in &adjacency {
            assert_eq!(peers.len(), 3);
            assert!(!peers.contains(node));
        }
        assert_eq!(pair_count(&adjacency), 6);
    }

    #[test]
    fn test_hub_spoke() {
        let adjacency = plan(&ids(&["A", "B", "C", "D"]), Topology::HubSpoke);
        assert_eq!(adjacency["A"], set(&["B", "C", "D"]));
        assert_eq!(adjacency["B"], set(&["A"]));
        assert_eq!(adjacency["C"], set(&["A"]));
        assert_eq!(adjacency["D"], set(&["A"]));
        assert_eq!(pair_count(&adjacency), 3);
    }

    #[test]
    fn test_hub_follows_caller_order() {
        let adjacency = plan(&ids(&["D", "A", "B"]), Topology::HubSpoke);
        assert_eq!(adjacency["D"], set(&["A", "B"]));
        assert_eq!(adjacency["A"], set(&["D"]));
    }

    #[test]
    fn test_pair_index_is_unique() {
        let n = 6;
        let mut seen = BTreeSet::new();
        for i in 0..n {
            for j in (i + 1)..n {
                assert_eq!(pair_index(i, j, n), pair_index(j, i, n));
                assert!(seen.insert(pair_index(i, j, n)));
            }
        }
        assert_eq!(seen.len(), max_pairs(n));
        assert_eq!(seen.iter().max().copied(), Some(max_pairs(n) - 1));
    }
}
