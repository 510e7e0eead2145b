//! The crypto seam the agreement engines run against.
//!
//! The engines are pure state machines; everything that touches key
//! material goes through [`ConsensusCrypto`]. Production code passes a
//! [`CryptoManager`]; tests substitute a scripted coin to force specific
//! round outcomes.

use strand_types::{BlockHash, BlockId, NodeIndex, ProtocolKey, ProtocolRound};

/// Threshold-crypto operations the agreement engines need.
///
/// A coin share doubles as the AUX message's authentication: verifying it
/// against the signer's public key share proves both origin and coin
/// contribution. BVB message authentication is handled by the router
/// before messages reach the engines.
pub trait ConsensusCrypto {
    /// This node's 1-based position in the chain.
    fn node_index(&self) -> NodeIndex;

    /// Shares needed to reveal a coin or combine a signature (2f+1).
    fn required_shares(&self) -> usize;

    /// This node's coin share for one round of one instance.
    fn sign_coin_share(&self, key: ProtocolKey, round: ProtocolRound) -> String;

    /// Check a peer's coin share before it counts toward the threshold.
    fn verify_coin_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        key: ProtocolKey,
        round: ProtocolRound,
    ) -> bool;

    /// Reveal the round coin from collected shares. `None` while fewer
    /// than 2f+1 valid shares are present.
    fn combine_coin(
        &self,
        key: ProtocolKey,
        round: ProtocolRound,
        shares: &[(NodeIndex, String)],
    ) -> Option<bool>;

    /// This node's share of the block finalization signature.
    fn sign_block_share(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> String;

    /// Check a peer's block-signature share.
    fn verify_block_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> bool;

    /// Combine 2f+1 block-signature shares into the finalization
    /// signature (hex). `None` while the quorum is incomplete.
    fn combine_block_sig(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
        shares: &[(NodeIndex, String)],
    ) -> Option<String>;
}

impl ConsensusCrypto for strand_crypto::CryptoManager {
    fn node_index(&self) -> NodeIndex {
        strand_crypto::CryptoManager::node_index(self)
    }

    fn required_shares(&self) -> usize {
        strand_crypto::CryptoManager::required_shares(self)
    }

    fn sign_coin_share(&self, key: ProtocolKey, round: ProtocolRound) -> String {
        strand_crypto::CryptoManager::sign_coin_share(self, key, round)
    }

    fn verify_coin_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        key: ProtocolKey,
        round: ProtocolRound,
    ) -> bool {
        strand_crypto::CryptoManager::verify_coin_share(self, signer, share_hex, key, round)
            .is_ok()
    }

    fn combine_coin(
        &self,
        key: ProtocolKey,
        round: ProtocolRound,
        shares: &[(NodeIndex, String)],
    ) -> Option<bool> {
        strand_crypto::CryptoManager::combine_coin(self, key, round, shares).ok()
    }

    fn sign_block_share(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> String {
        strand_crypto::CryptoManager::sign_block_share(self, block_id, proposer_index, proposal_hash)
    }

    fn verify_block_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> bool {
        strand_crypto::CryptoManager::verify_block_share(
            self,
            signer,
            share_hex,
            block_id,
            proposer_index,
            proposal_hash,
        )
        .is_ok()
    }

    fn combine_block_sig(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
        shares: &[(NodeIndex, String)],
    ) -> Option<String> {
        strand_crypto::CryptoManager::combine_block_sig(
            self,
            block_id,
            proposer_index,
            proposal_hash,
            shares,
        )
        .ok()
    }
}
