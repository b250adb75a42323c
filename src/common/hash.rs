//! Hashing utilities for chronodb
//!
//! - HRW (Highest Random Weight) for deterministic replica placement
//! - CRC32 for snapshot integrity

use crate::common::NodeId;

/// Weight of `node` for `key`: first 8 bytes of BLAKE3(key || node id)
fn hrw_weight(key: &str, node: NodeId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&node.to_be_bytes());
    let hash = hasher.finalize();
    let mut weight = [0u8; 8];
    weight.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(weight)
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). Every node computing this over the same
/// membership gets the same order.
pub fn hrw_hash(key: &str, nodes: &[NodeId]) -> Vec<NodeId> {
    let mut weights: Vec<(NodeId, u64)> = nodes
        .iter()
        .map(|&node| (node, hrw_weight(key, node)))
        .collect();

    // Highest weight first; node id breaks ties
    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N replicas using HRW hashing
pub fn select_replicas(key: &str, nodes: &[NodeId], n: usize) -> Vec<NodeId> {
    hrw_hash(key, nodes).into_iter().take(n).collect()
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrw_hash_consistent() {
        let nodes = vec![1, 2, 3];

        let sorted1 = hrw_hash("metrics/default/0", &nodes);
        let sorted2 = hrw_hash("metrics/default/0", &nodes);

        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_hrw_ignores_input_order() {
        let a = hrw_hash("k", &[1, 2, 3, 4]);
        let b = hrw_hash("k", &[4, 3, 2, 1]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_select_replicas() {
        let replicas = select_replicas("test-key", &[1, 2, 3, 4], 2);
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0], replicas[1]);

        // Asking for more replicas than nodes returns every node
        assert_eq!(select_replicas("test-key", &[1, 2], 3).len(), 2);
    }

    #[test]
    fn test_crc32() {
        assert_eq!(crc32(b"chronodb"), crc32(b"chronodb"));
        assert_ne!(crc32(b"chronodb"), crc32(b"chronodc"));
    }
}
