//! Committed blocks and the block wire format.
//!
//! Serialized form, shared by proposals and committed blocks:
//!
//! ```text
//! [u64 header_size (le)] [header_size bytes of UTF-8 JSON] [tx payloads]
//! ```
//!
//! Framing invariants: the byte at offset 8 is `{`, the last byte of the
//! header region is `}`, and `header_size` lies in `[2, MAX_BUFFER_SIZE]`.
//! The structural checks end there: a corrupted payload byte still parses
//! and is only caught when the block's threshold signature is verified.

use {
    crate::{
        error::{ConsensusError, Result},
        ids::{BlockId, ChainId, NodeId, NodeIndex},
        proposal::BlockProposal,
        transaction::TransactionList,
    },
    serde::{Deserialize, Serialize},
};

/// Upper bound on the JSON header region of a serialized block.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE_LEN: usize = std::mem::size_of::<u64>();

/// The JSON header carried at the front of every serialized block.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireBlockHeader {
    #[serde(rename = "proposerIndex")]
    pub proposer_index: NodeIndex,
    #[serde(rename = "proposerNodeID")]
    pub proposer_node_id: NodeId,
    #[serde(rename = "blockID")]
    pub block_id: BlockId,
    #[serde(rename = "schainID")]
    pub chain_id: ChainId,
    #[serde(rename = "timeStamp")]
    pub timestamp_sec: u64,
    #[serde(rename = "timeStampMs")]
    pub timestamp_ms: u32,
    #[serde(rename = "hash")]
    pub hash: String,
    #[serde(rename = "sizes")]
    pub sizes: Vec<u64>,
    #[serde(
        rename = "proposerSig",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub proposer_sig: Option<String>,
    #[serde(
        rename = "thresholdSig",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub threshold_sig: Option<String>,
}

/// Frame a header and transaction payloads into the block wire form.
pub(crate) fn encode_block(
    header: &WireBlockHeader,
    transactions: &TransactionList,
) -> Result<Vec<u8>> {
    let header_bytes = serde_json::to_vec(header)
        .map_err(|e| ConsensusError::Parsing(format!("block header encode: {e}")))?;
    if header_bytes.len() > MAX_BUFFER_SIZE {
        return Err(ConsensusError::InvalidArgument(
            "block header too large".into(),
        ));
    }

    let mut out =
        Vec::with_capacity(HEADER_SIZE_LEN + header_bytes.len() + transactions.serialized_size());
    out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    transactions.serialize_into(&mut out);

    debug_assert_eq!(out[HEADER_SIZE_LEN], b'{');
    debug_assert_eq!(out[HEADER_SIZE_LEN + header_bytes.len() - 1], b'}');
    Ok(out)
}

/// Parse the block wire form back into a header and transaction list.
pub(crate) fn decode_block(bytes: &[u8]) -> Result<(WireBlockHeader, TransactionList)> {
    if bytes.len() < HEADER_SIZE_LEN + 2 {
        return Err(ConsensusError::InvalidArgument(format!(
            "serialized block too small: {}",
            bytes.len()
        )));
    }

    let header_size =
        u64::from_le_bytes(bytes[..HEADER_SIZE_LEN].try_into().expect("8-byte prefix")) as usize;
    if header_size < 2 || HEADER_SIZE_LEN + header_size > bytes.len() {
        return Err(ConsensusError::InvalidArgument(format!(
            "invalid header size {header_size}"
        )));
    }
    if header_size > MAX_BUFFER_SIZE {
        return Err(ConsensusError::InvalidArgument(
            "header size too large".into(),
        ));
    }

    let header_region = &bytes[HEADER_SIZE_LEN..HEADER_SIZE_LEN + header_size];
    if header_region[0] != b'{' {
        return Err(ConsensusError::InvalidArgument(
            "block header does not start with {".into(),
        ));
    }
    if header_region[header_size - 1] != b'}' {
        return Err(ConsensusError::InvalidArgument(
            "block header does not end with }".into(),
        ));
    }

    let header: WireBlockHeader = serde_json::from_slice(header_region)
        .map_err(|e| ConsensusError::Parsing(format!("could not parse block header: {e}")))?;

    let transactions =
        TransactionList::deserialize(&header.sizes, bytes, HEADER_SIZE_LEN + header_size)?;

    Ok((header, transactions))
}

/// A proposal that won consensus for its height, together with the
/// threshold signature that finalized it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    proposal: BlockProposal,
    /// Combined 2f+1 threshold signature over the decided
    /// (block id, proposer index, proposal hash), hex-encoded.
    threshold_sig: String,
}

impl CommittedBlock {
    pub fn new(proposal: BlockProposal, threshold_sig: String) -> Self {
        Self {
            proposal,
            threshold_sig,
        }
    }

    pub fn proposal(&self) -> &BlockProposal {
        &self.proposal
    }

    pub fn threshold_sig(&self) -> &str {
        &self.threshold_sig
    }

    pub fn block_id(&self) -> BlockId {
        self.proposal.block_id()
    }

    pub fn proposer_index(&self) -> NodeIndex {
        self.proposal.proposer_index()
    }

    pub fn timestamp_sec(&self) -> u64 {
        self.proposal.timestamp_sec()
    }

    pub fn timestamp_ms(&self) -> u32 {
        self.proposal.timestamp_ms()
    }

    /// Serialize as `[u64 header size][JSON header][tx payloads]`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let header = WireBlockHeader {
            proposer_index: self.proposal.proposer_index(),
            proposer_node_id: self.proposal.proposer_node_id(),
            block_id: self.proposal.block_id(),
            chain_id: self.proposal.chain_id(),
            timestamp_sec: self.proposal.timestamp_sec(),
            timestamp_ms: self.proposal.timestamp_ms(),
            hash: self.proposal.hash_hex(),
            sizes: self.proposal.transactions().sizes(),
            proposer_sig: self.proposal.signature().map(str::to_owned),
            threshold_sig: Some(self.threshold_sig.clone()),
        };
        encode_block(&header, self.proposal.transactions())
    }

    /// Inverse of [`serialize`](Self::serialize). Rejects blocks whose
    /// header lacks a threshold signature; everything else follows the
    /// structural rules at the top of this module.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (header, transactions) = decode_block(bytes)?;
        let threshold_sig = header.threshold_sig.ok_or_else(|| {
            ConsensusError::Parsing("committed block missing threshold signature".into())
        })?;

        let mut proposal = BlockProposal::new(
            header.chain_id,
            header.block_id,
            header.proposer_index,
            header.proposer_node_id,
            header.timestamp_sec,
            header.timestamp_ms,
            transactions,
        )?;
        if let Some(sig) = header.proposer_sig {
            proposal.set_signature(sig);
        }

        Ok(Self {
            proposal,
            threshold_sig,
        })
    }
}

/// A contiguous batch of committed blocks, as served by the catch-up
/// protocol. The envelope is a bincode vector of serialized blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlockList {
    blocks: Vec<CommittedBlock>,
}

impl CommittedBlockList {
    /// Wrap a batch. Blocks must be contiguous and ascending by id.
    pub fn new(blocks: Vec<CommittedBlock>) -> Result<Self> {
        for pair in blocks.windows(2) {
            if pair[1].block_id() != pair[0].block_id() + 1 {
                return Err(ConsensusError::InvalidArgument(format!(
                    "block list is not contiguous at id {}",
                    pair[0].block_id()
                )));
            }
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[CommittedBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let raw: Vec<Vec<u8>> = self
            .blocks
            .iter()
            .map(CommittedBlock::serialize)
            .collect::<Result<_>>()?;
        Ok(bincode::serialize(&raw)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let raw: Vec<Vec<u8>> = bincode::deserialize(bytes)?;
        let blocks = raw
            .iter()
            .map(|b| CommittedBlock::deserialize(b))
            .collect::<Result<Vec<_>>>()?;
        Self::new(blocks)
    }
}
