//! Pending-transaction pool and proposal building.
//!
//! Client transactions queue here until this node's next proposal picks
//! them up. Duplicates are detected by transaction hash — both against
//! the queue and against everything already committed that we still
//! remember.
//!
//! `build_block_proposal` is deliberately blocking: with an empty pool it
//! waits up to the configured empty-block interval before giving in and
//! producing an empty proposal, which keeps idle chains from minting a
//! block every commit cycle.

use {
    log::{debug, info},
    parking_lot::Mutex,
    std::{
        collections::{HashSet, VecDeque},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    strand_types::{
        BlockHash, BlockId, BlockProposal, ChainId, ConsensusError, NodeId, NodeIndex, Result,
        Transaction, TransactionList,
    },
};

/// Bounds for the pool.
#[derive(Debug, Clone)]
pub struct PendingQueueConfig {
    /// Maximum queued transactions; submissions beyond it are refused.
    pub max_pending: usize,
    /// Maximum transactions packed into one proposal.
    pub max_transactions_per_block: usize,
    /// How long to wait for transactions before proposing an empty block
    /// (ms).
    pub empty_block_interval_ms: u64,
}

impl Default for PendingQueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 100_000,
            max_transactions_per_block: 4_096,
            empty_block_interval_ms: 3_000,
        }
    }
}

/// Deduplicated pool of client transactions awaiting inclusion.
pub struct PendingTransactionsAgent {
    chain_id: ChainId,
    node_index: NodeIndex,
    node_id: NodeId,
    config: PendingQueueConfig,
    queue: Mutex<VecDeque<Transaction>>,
    /// Hashes of everything queued or recently committed.
    known: Mutex<HashSet<BlockHash>>,
    exit: Arc<AtomicBool>,
}

impl PendingTransactionsAgent {
    pub fn new(
        chain_id: ChainId,
        node_index: NodeIndex,
        node_id: NodeId,
        config: PendingQueueConfig,
        exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain_id,
            node_index,
            node_id,
            config,
            queue: Mutex::new(VecDeque::new()),
            known: Mutex::new(HashSet::new()),
            exit,
        }
    }

    /// Submit one client transaction. Returns false for duplicates.
    pub fn push_transaction(&self, data: Vec<u8>) -> Result<bool> {
        let tx = Transaction::new(data)?;
        let mut known = self.known.lock();
        if known.contains(tx.hash()) {
            return Ok(false);
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_pending {
            return Err(ConsensusError::InvalidState {
                context: "push_transaction".into(),
                source: Box::new(ConsensusError::InvalidArgument(
                    "pending queue full".into(),
                )),
            });
        }
        known.insert(*tx.hash());
        queue.push_back(tx);
        Ok(true)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn known_transactions_size(&self) -> usize {
        self.known.lock().len()
    }

    /// Build this node's proposal for `block_id`, waiting up to the
    /// empty-block interval for transactions to arrive. The timestamp is
    /// strictly after the previous block's.
    pub fn build_block_proposal(
        &self,
        block_id: BlockId,
        prev_timestamp_sec: u64,
        prev_timestamp_ms: u32,
    ) -> Result<BlockProposal> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.empty_block_interval_ms);
        loop {
            if self.exit.load(Ordering::Relaxed) {
                return Err(ConsensusError::ExitRequested);
            }
            if self.pending_count() > 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let transactions = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.config.max_transactions_per_block);
            queue.drain(..take).collect::<Vec<_>>()
        };
        if !transactions.is_empty() {
            info!(
                "building proposal {block_id} with {} transactions",
                transactions.len()
            );
        } else {
            debug!("building empty proposal for block {block_id}");
        }

        let (sec, ms) = proposal_timestamp(prev_timestamp_sec, prev_timestamp_ms);
        BlockProposal::new(
            self.chain_id,
            block_id,
            self.node_index,
            self.node_id,
            sec,
            ms,
            TransactionList::new(transactions),
        )
    }

    /// Forget transactions of a committed block: they leave the queue if
    /// still there, and their hashes stay known so resubmissions bounce.
    pub fn remove_committed(&self, transactions: &TransactionList) {
        let committed: HashSet<&BlockHash> =
            transactions.items().iter().map(Transaction::hash).collect();
        self.queue
            .lock()
            .retain(|tx| !committed.contains(tx.hash()));
    }
}

/// Wall clock, floored to strictly after the previous block's timestamp.
fn proposal_timestamp(prev_sec: u64, prev_ms: u32) -> (u64, u32) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let now_sec = now.as_secs();
    let now_ms = now.subsec_millis();
    if (now_sec, now_ms) > (prev_sec, prev_ms) {
        (now_sec, now_ms)
    } else {
        strand_types::proposal::next_timestamp(prev_sec, prev_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(config: PendingQueueConfig) -> PendingTransactionsAgent {
        PendingTransactionsAgent::new(11, 2, 1002, config, Arc::new(AtomicBool::new(false)))
    }

    fn fast_config() -> PendingQueueConfig {
        PendingQueueConfig {
            empty_block_interval_ms: 50,
            ..PendingQueueConfig::default()
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let agent = agent(fast_config());
        assert!(agent.push_transaction(b"tx1".to_vec()).unwrap());
        assert!(!agent.push_transaction(b"tx1".to_vec()).unwrap());
        assert!(agent.push_transaction(b"tx2".to_vec()).unwrap());
        assert_eq!(agent.pending_count(), 2);
    }

    #[test]
    fn test_queue_cap() {
        let agent = agent(PendingQueueConfig {
            max_pending: 2,
            ..fast_config()
        });
        agent.push_transaction(b"a".to_vec()).unwrap();
        agent.push_transaction(b"b".to_vec()).unwrap();
        assert!(agent.push_transaction(b"c".to_vec()).is_err());
    }

    #[test]
    fn test_build_drains_queue_in_order() {
        let agent = agent(fast_config());
        agent.push_transaction(b"first".to_vec()).unwrap();
        agent.push_transaction(b"second".to_vec()).unwrap();

        let proposal = agent.build_block_proposal(1, 1_000, 0).unwrap();
        assert_eq!(proposal.block_id(), 1);
        assert_eq!(proposal.proposer_index(), 2);
        assert_eq!(proposal.transaction_count(), 2);
        assert_eq!(proposal.transactions().items()[0].data(), b"first");
        assert_eq!(agent.pending_count(), 0);
    }

    #[test]
    fn test_empty_proposal_after_interval() {
        let agent = agent(fast_config());
        let started = Instant::now();
        let proposal = agent.build_block_proposal(1, 1_000, 0).unwrap();
        assert!(proposal.transactions().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_block_size_cap() {
        let agent = agent(PendingQueueConfig {
            max_transactions_per_block: 3,
            ..fast_config()
        });
        for i in 0..5u8 {
            agent.push_transaction(vec![i + 1]).unwrap();
        }
        let proposal = agent.build_block_proposal(1, 1_000, 0).unwrap();
        assert_eq!(proposal.transaction_count(), 3);
        assert_eq!(agent.pending_count(), 2);
    }

    #[test]
    fn test_timestamp_strictly_monotone() {
        let agent = agent(fast_config());
        agent.push_transaction(b"tx".to_vec()).unwrap();
        // A previous timestamp in the far future forces the +1ms path.
        let future_sec = 33_000_000_000;
        let proposal = agent.build_block_proposal(1, future_sec, 999).unwrap();
        assert_eq!(proposal.timestamp_sec(), future_sec + 1);
        assert_eq!(proposal.timestamp_ms(), 0);
    }

    #[test]
    fn test_remove_committed_keeps_hashes_known() {
        let agent = agent(fast_config());
        agent.push_transaction(b"tx1".to_vec()).unwrap();
        agent.push_transaction(b"tx2".to_vec()).unwrap();

        let committed = TransactionList::new(vec![Transaction::new(b"tx1".to_vec()).unwrap()]);
        agent.remove_committed(&committed);
        assert_eq!(agent.pending_count(), 1);
        // A resubmission of the committed transaction is still a dup.
        assert!(!agent.push_transaction(b"tx1".to_vec()).unwrap());
    }
}
