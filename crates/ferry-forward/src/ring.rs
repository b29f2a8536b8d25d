use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{ForwardError, ForwardResult};

/// Ring positions per peer unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 128;

fn hash_to_u64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Hash the ordered values of an event's identification keys.
///
/// Missing keys hash as JSON `null`, so events lacking a key still route
/// consistently.
pub fn hash_identification_values(values: &[Option<&Value>]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for value in values {
        match value {
            Some(v) => hasher.update(v.to_string().as_bytes()),
            None => hasher.update(b"null"),
        };
        hasher.update(&[0x1f]);
    }
    let mut head = [0u8; 8];
    head.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Consistent-hash ring over peer addresses.
///
/// Each peer occupies `virtual_nodes` positions. A hash belongs to the peer
/// at the first position at or after it, wrapping around at the top, so
/// adding or removing one of N peers moves roughly 1/N of the keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashRing {
    positions: BTreeMap<u64, String>,
    peers: BTreeSet<String>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new<I, S>(peers: I, virtual_nodes: usize) -> ForwardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if virtual_nodes == 0 {
            return Err(ForwardError::Config("virtual_nodes must be positive".into()));
        }
        let peers: BTreeSet<String> = peers.into_iter().map(Into::into).collect();
        if peers.is_empty() {
            return Err(ForwardError::NoPeers);
        }

        let mut positions = BTreeMap::new();
        for peer in &peers {
            for i in 0..virtual_nodes {
                // On the rare collision the lexically smaller peer keeps the slot.
                positions
                    .entry(hash_to_u64(format!("{peer}-{i}").as_bytes()))
                    .or_insert_with(|| peer.clone());
            }
        }
        Ok(Self {
            positions,
            peers,
            virtual_nodes,
        })
    }

    pub fn with_default_vnodes<I, S>(peers: I) -> ForwardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(peers, DEFAULT_VIRTUAL_NODES)
    }

    pub fn peers(&self) -> &BTreeSet<String> {
        &self.peers
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains(peer)
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// The peer owning `hash`.
    pub fn owner(&self, hash: u64) -> Option<&str> {
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, peer)| peer.as_str())
    }

    pub fn owner_for_values(&self, values: &[Option<&Value>]) -> Option<&str> {
        self.owner(hash_identification_values(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn owner_of(ring: &HashRing, key: &str) -> String {
        let value = json!(key);
        ring.owner_for_values(&[Some(&value)]).unwrap().to_string()
    }

    #[test]
    fn empty_peer_list_fails() {
        assert!(matches!(
            HashRing::with_default_vnodes(Vec::<String>::new()),
            Err(ForwardError::NoPeers)
        ));
        assert!(matches!(
            HashRing::new(["a"], 0),
            Err(ForwardError::Config(_))
        ));
    }

    #[test]
    fn same_key_routes_to_same_peer() {
        let ring = HashRing::with_default_vnodes(["A", "B"]).unwrap();
        let first = owner_of(&ring, "user-42");
        for _ in 0..1000 {
            assert_eq!(owner_of(&ring, "user-42"), first);
        }
        let rebuilt = HashRing::with_default_vnodes(["B", "A"]).unwrap();
        assert_eq!(owner_of(&rebuilt, "user-42"), first);
    }

    #[test]
    fn both_peers_receive_keys() {
        let ring = HashRing::with_default_vnodes(["A", "B"]).unwrap();
        let a = (0..1000)
            .filter(|i| owner_of(&ring, &format!("user-{i}")) == "A")
            .count();
        assert!((300..=700).contains(&a), "skewed split: {a}/1000");
    }

    #[test]
    fn adding_a_peer_remaps_about_one_in_n_plus_one() {
        let before = HashRing::with_default_vnodes(["n1", "n2", "n3", "n4"]).unwrap();
        let after = HashRing::with_default_vnodes(["n1", "n2", "n3", "n4", "n5"]).unwrap();

        let total = 10_000;
        let moved = (0..total)
            .filter(|i| {
                let key = format!("key-{i}");
                owner_of(&before, &key) != owner_of(&after, &key)
            })
            .count();
        let fraction = moved as f64 / total as f64;
        assert!((0.12..=0.28).contains(&fraction), "moved {fraction}");
    }

    #[test]
    fn missing_values_hash_consistently() {
        let present = json!("x");
        assert_eq!(
            hash_identification_values(&[None, Some(&present)]),
            hash_identification_values(&[None, Some(&present)])
        );
        assert_ne!(
            hash_identification_values(&[None, Some(&present)]),
            hash_identification_values(&[Some(&present), None])
        );
    }

    proptest! {
        #[test]
        fn added_peer_only_takes_keys(
            peers in proptest::collection::btree_set("[a-z]{3,8}", 1..6),
            extra in "[A-Z]{3,8}",
            keys in proptest::collection::vec("[a-z0-9]{1,12}", 1..50),
        ) {
            let before = HashRing::new(peers.iter().cloned(), 16).unwrap();
            let mut grown = peers.clone();
            grown.insert(extra.clone());
            let after = HashRing::new(grown, 16).unwrap();

            for key in &keys {
                let old = owner_of(&before, key);
                let new = owner_of(&after, key);
                prop_assert!(new == old || new == extra);
            }
        }

        #[test]
        fn removed_peer_only_loses_keys(
            peers in proptest::collection::btree_set("[a-z]{3,8}", 2..6),
            keys in proptest::collection::vec("[a-z0-9]{1,12}", 1..50),
        ) {
            let before = HashRing::new(peers.iter().cloned(), 16).unwrap();
            let removed = peers.iter().next().unwrap().clone();
            let after = HashRing::new(peers.iter().filter(|p| **p != removed).cloned(), 16).unwrap();

            for key in &keys {
                let old = owner_of(&before, key);
                if old != removed {
                    prop_assert_eq!(owner_of(&after, key), old);
                }
            }
        }
    }
}
