//! Finalize downloader: fetching a decided proposal this node never saw.
//!
//! Only 2f+1 nodes need to hold a proposal for it to win consensus, so a
//! node can decide a proposer whose proposal it lacks. The downloader
//! queries all peers in parallel over the proposal channel; any response
//! whose DA proof (a 2f+1 threshold signature over the proposal hash)
//! verifies is accepted — the proof, not the peer, is what's trusted.

use {
    crate::{
        config::NetConfig,
        node_table::NodeTable,
        proposal::{self, ProposalRequest, ProposalResponse},
    },
    log::{debug, info},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
    strand_types::{BlockId, BlockProposal, DAProof, NodeIndex, Result},
};

/// Proof checking the downloader needs; implemented by the crypto
/// manager.
pub trait ProofChecker: Send + Sync {
    fn check_da_proof(&self, proof: &DAProof) -> bool;
}

impl ProofChecker for strand_crypto::CryptoManager {
    fn check_da_proof(&self, proof: &DAProof) -> bool {
        self.verify_da_proof(&proof.proposal_hash, &proof.threshold_sig)
            .is_ok()
    }
}

/// Downloads one decided proposal from whoever holds it.
pub struct BlockFinalizeDownloader {
    table: Arc<NodeTable>,
    self_index: NodeIndex,
    config: NetConfig,
    checker: Arc<dyn ProofChecker>,
    exit: Arc<AtomicBool>,
}

impl BlockFinalizeDownloader {
    pub fn new(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        checker: Arc<dyn ProofChecker>,
        exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            table,
            self_index,
            config,
            checker,
            exit,
        }
    }

    /// Fetch the proposal for (block id, proposer index), retrying until
    /// a peer supplies one with a valid proof, `cancelled` reports true
    /// (e.g. the block arrived through catch-up first), or shutdown.
    ///
    /// `Ok(None)` means cancelled, not failed.
    pub fn download(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<(BlockProposal, DAProof)>> {
        info!("FINALIZE_DOWNLOAD: BID:{block_id}:PRP:{proposer_index}");
        loop {
            if self.exit.load(Ordering::Relaxed) {
                return Err(strand_types::ConsensusError::ExitRequested);
            }
            if cancelled() {
                return Ok(None);
            }

            if let Some(found) = self.query_all_peers(block_id, proposer_index) {
                return Ok(Some(found));
            }

            thread::sleep(Duration::from_millis(self.config.deferred_tick_ms));
        }
    }

    /// One parallel round: every peer queried on its own thread, first
    /// valid response wins.
    fn query_all_peers(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
    ) -> Option<(BlockProposal, DAProof)> {
        let (found_tx, found_rx) = crossbeam_channel::unbounded();

        thread::scope(|scope| {
            for peer in self.table.peers_of(self.self_index) {
                let found_tx = found_tx.clone();
                let checker = Arc::clone(&self.checker);
                let chain_id = self.table.chain_id();
                let max_size = self.config.max_message_size;
                scope.spawn(move || {
                    let request = ProposalRequest::Get {
                        chain_id,
                        block_id,
                        proposer_index,
                    };
                    match proposal::request_response(peer, &request, max_size) {
                        Ok(ProposalResponse::Proposal {
                            block: Some(block),
                            proof: Some(proof),
                        }) => {
                            if let Some(valid) =
                                validate_download(&block, &proof, block_id, proposer_index, &*checker)
                            {
                                let _ = found_tx.send(valid);
                            }
                        }
                        Ok(_) => {
                            debug!("peer {} does not hold {block_id}:{proposer_index}", peer.index);
                        }
                        Err(e) => {
                            debug!("finalize query to {} failed: {e}", peer.index);
                        }
                    }
                });
            }
            drop(found_tx);
            // First verified response; None when every peer came up empty.
            found_rx.recv().ok()
        })
    }
}

/// Deserialize and authenticate one download response.
fn validate_download(
    block: &[u8],
    proof: &DAProof,
    block_id: BlockId,
    proposer_index: NodeIndex,
    checker: &dyn ProofChecker,
) -> Option<(BlockProposal, DAProof)> {
    let proposal = match BlockProposal::deserialize(block) {
        Ok(p) => p,
        Err(e) => {
            debug!("undecodable downloaded proposal: {e}");
            return None;
        }
    };
    if proposal.block_id() != block_id || proposal.proposer_index() != proposer_index {
        debug!(
            "downloaded proposal is for {}:{}, wanted {block_id}:{proposer_index}",
            proposal.block_id(),
            proposal.proposer_index()
        );
        return None;
    }
    if proof.block_id != block_id
        || proof.proposer_index != proposer_index
        || proof.proposal_hash != *proposal.hash()
    {
        debug!("downloaded proof does not match the proposal");
        return None;
    }
    if !checker.check_da_proof(proof) {
        debug!("downloaded proof failed threshold verification");
        return None;
    }
    Some((proposal, proof.clone()))
}
