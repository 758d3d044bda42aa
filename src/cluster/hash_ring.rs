//! Consistent hash ring with virtual nodes
//!
//! Each physical node is hashed `virtual_nodes` times (key `"node#i"`) onto a
//! u64 ring. A partition key is owned by the first `replication` distinct
//! physical nodes found walking clockwise from the key's hash.

use super::NodeId;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Ring position -> index into `nodes`
    ring: BTreeMap<u64, usize>,
    nodes: Vec<NodeId>,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Build a ring over `nodes`; duplicate entries collapse to one node
    pub fn new<I, S>(nodes: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut ring = Self {
            ring: BTreeMap::new(),
            nodes: Vec::new(),
            virtual_nodes: virtual_nodes.max(1),
        };
        for node in nodes {
            ring.add_node(node.into());
        }
        ring
    }

    fn add_node(&mut self, node: NodeId) {
        if self.nodes.contains(&node) {
            return;
        }
        let slot = self.nodes.len();
        for i in 0..self.virtual_nodes {
            let position = Self::hash_key(&format!("{}#{}", node, i));
            // On a position collision the earlier node keeps the slot
            self.ring.entry(position).or_insert(slot);
        }
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Owners of `key`, ordered by ring position
    pub fn assign(&self, key: &str, replication: usize) -> Result<Vec<NodeId>> {
        self.assign_hash(Self::hash_key(key), replication)
    }

    /// Owners of a precomputed ring position
    pub fn assign_hash(&self, hash: u64, replication: usize) -> Result<Vec<NodeId>> {
        if replication == 0 || replication > self.nodes.len() {
            return Err(Error::InsufficientNodes {
                required: replication,
                available: self.nodes.len(),
            });
        }

        let mut seen = HashSet::with_capacity(replication);
        let mut owners = Vec::with_capacity(replication);
        for (_, &slot) in self.ring.range(hash..).chain(self.ring.range(..hash)) {
            if seen.insert(slot) {
                owners.push(self.nodes[slot].clone());
                if owners.len() == replication {
                    break;
                }
            }
        }
        Ok(owners)
    }

    /// Every distinct ordered replica set the ring can produce
    ///
    /// Each arc of the ring maps to the replica set starting at its
    /// clockwise end, so walking every virtual node covers all of them.
    pub fn replica_sets(&self, replication: usize) -> Result<Vec<Vec<NodeId>>> {
        let mut sets: Vec<Vec<NodeId>> = Vec::new();
        for &position in self.ring.keys() {
            let owners = self.assign_hash(position, replication)?;
            if !sets.contains(&owners) {
                sets.push(owners);
            }
        }
        Ok(sets)
    }

    pub fn hash_key(key: &str) -> u64 {
        xxh3_64(key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nodes(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{}:8888", i)).collect()
    }

    #[test]
    fn test_assign_is_deterministic() {
        let ring = ConsistentHashRing::new(nodes(3), 2);
        let a = ring.assign("root.sg1", 2).unwrap();
        let b = ring.assign("root.sg1", 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let ring = ConsistentHashRing::new(nodes(3), 100);
        let owners: HashSet<String> = (0..100)
            .map(|i| ring.assign(&format!("root.sg{}", i), 1).unwrap()[0].clone())
            .collect();
        assert!(owners.len() > 1);
    }

    #[test]
    fn test_adding_node_moves_few_keys() {
        let before = ConsistentHashRing::new(nodes(3), 100);
        let after = ConsistentHashRing::new(nodes(4), 100);
        let same = (0..100)
            .filter(|i| {
                let key = format!("root.sg{}", i);
                before.assign(&key, 1).unwrap() == after.assign(&key, 1).unwrap()
            })
            .count();
        assert!(same >= 60, "only {} of 100 keys kept their owner", same);
    }

    #[test]
    fn test_insufficient_nodes() {
        let ring = ConsistentHashRing::new(vec!["a:1", "a:1", "b:1"], 2);
        assert_eq!(ring.node_count(), 2);
        let err = ring.assign("root.sg1", 3).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientNodes {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_replica_sets_cover_every_assignment() {
        let ring = ConsistentHashRing::new(nodes(5), 2);
        let sets = ring.replica_sets(3).unwrap();
        for i in 0..200 {
            let owners = ring.assign(&format!("root.sg{}", i), 3).unwrap();
            assert!(sets.contains(&owners));
        }
    }

    proptest! {
        #[test]
        fn prop_assign_returns_r_distinct_nodes(
            key in "[a-z.0-9]{1,24}",
            node_count in 1usize..8,
            virtual_nodes in 1usize..16,
            replication_seed in 0usize..8,
        ) {
            let replication = replication_seed % node_count + 1;
            let ring = ConsistentHashRing::new(nodes(node_count), virtual_nodes);
            let owners = ring.assign(&key, replication).unwrap();

            prop_assert_eq!(owners.len(), replication);
            let distinct: HashSet<_> = owners.iter().collect();
            prop_assert_eq!(distinct.len(), replication);

            let rebuilt = ConsistentHashRing::new(nodes(node_count), virtual_nodes);
            prop_assert_eq!(rebuilt.assign(&key, replication).unwrap(), owners);
        }
    }
}
