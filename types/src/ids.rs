//! Identifier types used across the consensus engine.
//!
//! All identifiers are 64-bit and little-endian on the wire. `NodeIndex` is
//! the 1-based position of a validator in the chain's static node table;
//! index 0 is reserved for the synthetic empty-block proposer.

use {
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Monotonic block identifier. The first block after genesis has id 1.
pub type BlockId = u64;

/// Identifier of one permissioned chain instance.
pub type ChainId = u64;

/// Opaque node identity, assigned out-of-band.
pub type NodeId = u64;

/// 1-based validator position within the chain (1..=N).
pub type NodeIndex = u64;

/// Per-message identifier, unique per sender.
pub type MsgId = u64;

/// Round number within one binary-consensus instance.
pub type ProtocolRound = u64;

/// Maximum number of Byzantine nodes tolerated for a chain of `node_count`
/// validators (f in N >= 3f + 1).
pub fn max_faulty(node_count: u64) -> u64 {
    node_count.saturating_sub(1) / 3
}

/// Size of a 2f+1 quorum for a chain of `node_count` validators.
///
/// Equals ceil(2N/3) for N = 3f + 1 and matches the broadcast loop
/// condition `3 * (sent + 1) < 2 * N`.
pub fn quorum_size(node_count: u64) -> u64 {
    node_count - max_faulty(node_count)
}

/// Addresses a single binary-consensus instance: one per
/// (block id, proposer index) pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProtocolKey {
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
}

impl ProtocolKey {
    pub fn new(block_id: BlockId, proposer_index: NodeIndex) -> Self {
        Self {
            block_id,
            proposer_index,
        }
    }
}

impl fmt::Display for ProtocolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_id, self.proposer_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_key_display() {
        let key = ProtocolKey::new(7, 2);
        assert_eq!(key.to_string(), "7:2");
    }

    #[test]
    fn test_protocol_key_ordering() {
        assert!(ProtocolKey::new(1, 4) < ProtocolKey::new(2, 1));
        assert!(ProtocolKey::new(2, 1) < ProtocolKey::new(2, 3));
    }

    #[test]
    fn test_quorum_arithmetic() {
        assert_eq!(max_faulty(4), 1);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(max_faulty(7), 2);
        assert_eq!(quorum_size(7), 5);
        assert_eq!(max_faulty(10), 3);
        assert_eq!(quorum_size(10), 7);
        // Degenerate single-node chain still needs itself.
        assert_eq!(quorum_size(1), 1);
    }
}
