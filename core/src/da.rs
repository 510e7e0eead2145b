//! Data-availability bookkeeping.
//!
//! Two collections drive the DA round:
//!
//! - [`DaShareCollector`] lives at the proposer: it accumulates the DA
//!   shares peers return when a proposal is pushed to them, and combines
//!   2f+1 of them into the proposal's [`DAProof`].
//! - [`DaProofStore`] lives at every node: it tracks which proposals of a
//!   height have proofs, and the moment a 2f+1 quorum of proposer slots
//!   is covered it emits the [`BooleanProposalVector`] that seeds block
//!   consensus.

use {
    log::{debug, warn},
    parking_lot::Mutex,
    std::collections::{BTreeMap, HashMap, HashSet},
    strand_crypto::CryptoManager,
    strand_types::{
        quorum_size, BlockId, BooleanProposalVector, DAProof, NodeIndex, ProtocolKey,
    },
    strand_consensus_net::DaShare,
};

/// Collects DA shares for proposals this node pushed.
#[derive(Default)]
pub struct DaShareCollector {
    /// (block, proposer) → signer → share.
    shares: Mutex<HashMap<ProtocolKey, HashMap<NodeIndex, String>>>,
    /// Slots whose proof has already been combined.
    combined: Mutex<HashSet<ProtocolKey>>,
}

impl DaShareCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one verified share. Returns the combined proof the first time
    /// the quorum completes for the slot.
    pub fn add_share(&self, share: DaShare, crypto: &CryptoManager) -> Option<DAProof> {
        if crypto
            .verify_da_share(share.signer, &share.share_hex, &share.proposal_hash)
            .is_err()
        {
            warn!(
                "invalid DA share from {} for block {}",
                share.signer, share.block_id
            );
            return None;
        }

        let key = ProtocolKey::new(share.block_id, share.proposer_index);
        if self.combined.lock().contains(&key) {
            return None;
        }

        let shares: Vec<(NodeIndex, String)> = {
            let mut all = self.shares.lock();
            let slot = all.entry(key).or_default();
            slot.entry(share.signer).or_insert(share.share_hex);
            if slot.len() < crypto.required_shares() {
                return None;
            }
            slot.iter().map(|(i, s)| (*i, s.clone())).collect()
        };

        match crypto.combine_da_proof(&share.proposal_hash, &shares) {
            Ok(proof_hex) => {
                self.combined.lock().insert(key);
                debug!("DA proof complete for {key}");
                Some(DAProof::new(
                    share.block_id,
                    share.proposer_index,
                    share.proposal_hash,
                    proof_hex,
                ))
            }
            Err(e) => {
                warn!("could not combine DA proof for {key}: {e}");
                None
            }
        }
    }

    /// Drop state for blocks at or below the committed id.
    pub fn prune(&self, committed: BlockId) {
        self.shares.lock().retain(|key, _| key.block_id > committed);
        self.combined.lock().retain(|key| key.block_id > committed);
    }
}

/// Tracks which proposals of each height have DA proofs.
#[derive(Default)]
pub struct DaProofStore {
    proofs: Mutex<HashMap<BlockId, BTreeMap<NodeIndex, DAProof>>>,
    /// Heights whose proposal vector has been emitted.
    emitted: Mutex<HashSet<BlockId>>,
}

impl DaProofStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verified proof. When the height first covers a 2f+1
    /// quorum of proposer slots, returns the proposal vector consensus
    /// starts from.
    pub fn add_proof(
        &self,
        proof: DAProof,
        node_count: u64,
    ) -> Option<BooleanProposalVector> {
        if proof.proposer_index == 0 || proof.proposer_index > node_count {
            warn!("DA proof with proposer index {} dropped", proof.proposer_index);
            return None;
        }

        let block_id = proof.block_id;
        let mut proofs = self.proofs.lock();
        let slots = proofs.entry(block_id).or_default();
        slots.entry(proof.proposer_index).or_insert(proof);

        if (slots.len() as u64) < quorum_size(node_count) {
            return None;
        }
        if !self.emitted.lock().insert(block_id) {
            return None;
        }

        let mut vector = BooleanProposalVector::new(node_count);
        for index in slots.keys() {
            // Indices were range-checked on insert.
            let _ = vector.set(*index);
        }
        Some(vector)
    }

    pub fn have_proof(&self, block_id: BlockId, proposer_index: NodeIndex) -> bool {
        self.proofs
            .lock()
            .get(&block_id)
            .is_some_and(|slots| slots.contains_key(&proposer_index))
    }

    pub fn proof(&self, block_id: BlockId, proposer_index: NodeIndex) -> Option<DAProof> {
        self.proofs
            .lock()
            .get(&block_id)
            .and_then(|slots| slots.get(&proposer_index))
            .cloned()
    }

    /// Drop state for blocks at or below the committed id.
    pub fn prune(&self, committed: BlockId) {
        self.proofs.lock().retain(|block_id, _| *block_id > committed);
        self.emitted.lock().retain(|block_id| *block_id > committed);
    }
}
