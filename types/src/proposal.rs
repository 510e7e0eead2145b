//! Block proposals.
//!
//! A proposal is created once by its proposer for a given height, stored in
//! the proposal store, pushed to peers, and — if it wins consensus — wrapped
//! into a [`CommittedBlock`](crate::block::CommittedBlock).
//!
//! The proposal hash covers the chain id, block id, proposer index, both
//! timestamp components, and the concatenated transaction hashes, in that
//! order, all integers little-endian.

use {
    crate::{
        block,
        error::{ConsensusError, Result},
        hashing::{self, BlockHash},
        ids::{BlockId, ChainId, NodeId, NodeIndex},
        transaction::TransactionList,
    },
    std::fmt,
};

/// Milliseconds roll over into the seconds component at this value.
const MS_PER_SEC: u32 = 1000;

/// The timestamp strictly after `(sec, ms)` by one millisecond.
///
/// Committed-block timestamps are strictly monotone; when a block reuses its
/// predecessor's second, the millisecond component advances by one, rolling
/// into the next second at 999.
pub fn next_timestamp(sec: u64, ms: u32) -> (u64, u32) {
    if ms >= MS_PER_SEC - 1 {
        (sec + 1, 0)
    } else {
        (sec, ms + 1)
    }
}

/// A block proposal for one (block id, proposer index) slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockProposal {
    chain_id: ChainId,
    block_id: BlockId,
    proposer_index: NodeIndex,
    proposer_node_id: NodeId,
    timestamp_sec: u64,
    timestamp_ms: u32,
    transactions: TransactionList,
    /// Proposer's signature share over the proposal hash (hex). Absent on
    /// synthetic empty proposals.
    signature: Option<String>,
    hash: BlockHash,
}

impl BlockProposal {
    /// Build a proposal and derive its hash.
    pub fn new(
        chain_id: ChainId,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposer_node_id: NodeId,
        timestamp_sec: u64,
        timestamp_ms: u32,
        transactions: TransactionList,
    ) -> Result<Self> {
        if timestamp_ms >= MS_PER_SEC {
            return Err(ConsensusError::InvalidArgument(format!(
                "timestamp_ms out of range: {timestamp_ms}"
            )));
        }
        let hash = Self::calculate_hash(
            chain_id,
            block_id,
            proposer_index,
            timestamp_sec,
            timestamp_ms,
            &transactions,
        );
        Ok(Self {
            chain_id,
            block_id,
            proposer_index,
            proposer_node_id,
            timestamp_sec,
            timestamp_ms,
            transactions,
            signature: None,
            hash,
        })
    }

    /// The canonical empty block for a height: proposer index 0, no
    /// transactions, timestamp one millisecond after the previous block.
    pub fn empty(
        chain_id: ChainId,
        block_id: BlockId,
        prev_timestamp_sec: u64,
        prev_timestamp_ms: u32,
    ) -> Self {
        let (sec, ms) = next_timestamp(prev_timestamp_sec, prev_timestamp_ms);
        Self::new(chain_id, block_id, 0, 0, sec, ms, TransactionList::default())
            .expect("empty proposal fields are always valid")
    }

    fn calculate_hash(
        chain_id: ChainId,
        block_id: BlockId,
        proposer_index: NodeIndex,
        timestamp_sec: u64,
        timestamp_ms: u32,
        transactions: &TransactionList,
    ) -> BlockHash {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(5 + transactions.len());
        let chain = chain_id.to_le_bytes();
        let block = block_id.to_le_bytes();
        let proposer = proposer_index.to_le_bytes();
        let sec = timestamp_sec.to_le_bytes();
        let ms = timestamp_ms.to_le_bytes();
        parts.push(&chain);
        parts.push(&block);
        parts.push(&proposer);
        parts.push(&sec);
        parts.push(&ms);
        for tx in transactions.items() {
            parts.push(tx.hash());
        }
        hashing::hashv(&parts)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn proposer_index(&self) -> NodeIndex {
        self.proposer_index
    }

    pub fn proposer_node_id(&self) -> NodeId {
        self.proposer_node_id
    }

    pub fn timestamp_sec(&self) -> u64 {
        self.timestamp_sec
    }

    pub fn timestamp_ms(&self) -> u32 {
        self.timestamp_ms
    }

    pub fn transactions(&self) -> &TransactionList {
        &self.transactions
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hashing::to_hex(&self.hash)
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Attach the proposer's signature share (hex).
    pub fn set_signature(&mut self, signature: String) {
        self.signature = Some(signature);
    }

    /// True when this is the synthetic empty proposal for its height.
    pub fn is_empty_proposal(&self) -> bool {
        self.proposer_index == 0
    }

    // ── Wire form ───────────────────────────────────────────────────────

    /// Serialize as `[u64 header size][JSON header][tx payloads]`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let header = block::WireBlockHeader {
            proposer_index: self.proposer_index,
            proposer_node_id: self.proposer_node_id,
            block_id: self.block_id,
            chain_id: self.chain_id,
            timestamp_sec: self.timestamp_sec,
            timestamp_ms: self.timestamp_ms,
            hash: self.hash_hex(),
            sizes: self.transactions.sizes(),
            proposer_sig: self.signature.clone(),
            threshold_sig: None,
        };
        block::encode_block(&header, &self.transactions)
    }

    /// Inverse of [`serialize`](Self::serialize). The hash is recomputed
    /// from the decoded fields; corruption that survives the structural
    /// checks is caught later by signature verification, not here.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (header, transactions) = block::decode_block(bytes)?;
        let mut proposal = Self::new(
            header.chain_id,
            header.block_id,
            header.proposer_index,
            header.proposer_node_id,
            header.timestamp_sec,
            header.timestamp_ms,
            transactions,
        )?;
        proposal.signature = header.proposer_sig;
        Ok(proposal)
    }
}

// Short form for log lines: "BID:5:PRP:2:TXS:17".
impl fmt::Display for BlockProposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BID:{}:PRP:{}:TXS:{}",
            self.block_id,
            self.proposer_index,
            self.transactions.len()
        )
    }
}
