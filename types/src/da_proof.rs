//! Data-availability proofs.

use {
    crate::{
        hashing::{self, BlockHash},
        ids::{BlockId, NodeIndex},
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Proof that 2f+1 validators have received and stored one proposal: the
/// combined threshold signature over the proposal's hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DAProof {
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
    pub proposal_hash: BlockHash,
    /// Combined 2f+1 threshold signature over the proposal hash, hex.
    pub threshold_sig: String,
}

impl DAProof {
    pub fn new(
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: BlockHash,
        threshold_sig: String,
    ) -> Self {
        Self {
            block_id,
            proposer_index,
            proposal_hash,
            threshold_sig,
        }
    }
}

impl fmt::Display for DAProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DAPROOF:BID:{}:PRP:{}:H:{}",
            self.block_id,
            self.proposer_index,
            &hashing::to_hex(&self.proposal_hash)[..8]
        )
    }
}
