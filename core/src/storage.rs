//! Storage collaborator boundary and the typed stores built on it.
//!
//! The engine treats persistence as an external collaborator behind a
//! namespaced key-value trait; crash safety is the backing store's
//! concern (write-ahead logging or equivalent). [`MemStorage`] is the
//! in-process backend used by tests and development chains.
//!
//! [`ChainStorage`] layers the engine's namespaces on top: committed
//! blocks, proposals, proposal hashes (at most one per height and
//! proposer), proposal vectors, and the raw incoming / outgoing network
//! messages that bootstrap replays.

use {
    parking_lot::RwLock,
    std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
    strand_types::{
        BlockId, BlockProposal, BooleanProposalVector, CommittedBlock, ConsensusError,
        NetworkMessage, NodeIndex, Result,
    },
};

/// Namespaced key-value operations the storage backend must provide.
///
/// No transactions are required across namespaces; each call is atomic on
/// its own.
pub trait KeyValueStorage: Send + Sync {
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Keys in a namespace with the given prefix, in ascending order.
    fn keys_with_prefix(&self, namespace: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// In-memory backend: a map of ordered maps.
#[derive(Default)]
pub struct MemStorage {
    namespaces: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemStorage {
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn keys_with_prefix(&self, namespace: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|ns| {
                ns.keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// Namespaces.
const NS_BLOCKS: &str = "blocks";
const NS_META: &str = "meta";
const NS_PROPOSALS: &str = "proposals";
const NS_PROPOSAL_HASHES: &str = "proposal_hashes";
const NS_PROPOSAL_VECTORS: &str = "proposal_vectors";
const NS_PRICES: &str = "prices";
const NS_OUTGOING: &str = "outgoing_msgs";
const NS_INCOMING: &str = "incoming_msgs";

const KEY_LAST_COMMITTED: &[u8] = b"last_committed_block_id";

fn block_key(block_id: BlockId) -> [u8; 8] {
    block_id.to_be_bytes()
}

fn slot_key(block_id: BlockId, proposer_index: NodeIndex) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&block_id.to_be_bytes());
    key[8..].copy_from_slice(&proposer_index.to_be_bytes());
    key
}

/// The engine's typed view of the storage collaborator.
#[derive(Clone)]
pub struct ChainStorage {
    backend: Arc<dyn KeyValueStorage>,
    msg_seq: Arc<AtomicU64>,
}

impl ChainStorage {
    pub fn new(backend: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            backend,
            msg_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    // ── Committed blocks ────────────────────────────────────────────────

    /// Persist a committed block and advance the stored tip.
    pub fn save_block(&self, block: &CommittedBlock) -> Result<()> {
        let bytes = block.serialize()?;
        self.backend
            .put(NS_BLOCKS, &block_key(block.block_id()), &bytes)?;
        self.backend.put(
            NS_META,
            KEY_LAST_COMMITTED,
            &block.block_id().to_le_bytes(),
        )
    }

    pub fn last_committed_block_id(&self) -> BlockId {
        self.backend
            .get(NS_META, KEY_LAST_COMMITTED)
            .ok()
            .flatten()
            .and_then(|v| v.try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0)
    }

    pub fn serialized_block(&self, block_id: BlockId) -> Option<Vec<u8>> {
        self.backend.get(NS_BLOCKS, &block_key(block_id)).ok().flatten()
    }

    pub fn block(&self, block_id: BlockId) -> Result<Option<CommittedBlock>> {
        match self.serialized_block(block_id) {
            Some(bytes) => Ok(Some(CommittedBlock::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Proposals ───────────────────────────────────────────────────────

    pub fn save_proposal(&self, proposal: &BlockProposal) -> Result<()> {
        let key = slot_key(proposal.block_id(), proposal.proposer_index());
        self.backend
            .put(NS_PROPOSALS, &key, &proposal.serialize()?)
    }

    pub fn proposal(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
    ) -> Result<Option<BlockProposal>> {
        match self
            .backend
            .get(NS_PROPOSALS, &slot_key(block_id, proposer_index))?
        {
            Some(bytes) => Ok(Some(BlockProposal::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record a proposal hash, enforcing at most one per
    /// (height, proposer). Returns false when a different hash is already
    /// recorded — an equivocation attempt.
    pub fn check_and_save_hash(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        hash_hex: &str,
    ) -> Result<bool> {
        let key = slot_key(block_id, proposer_index);
        if let Some(existing) = self.backend.get(NS_PROPOSAL_HASHES, &key)? {
            return Ok(existing == hash_hex.as_bytes());
        }
        self.backend
            .put(NS_PROPOSAL_HASHES, &key, hash_hex.as_bytes())?;
        Ok(true)
    }

    pub fn have_proposal_hash(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
    ) -> Result<bool> {
        Ok(self
            .backend
            .get(NS_PROPOSAL_HASHES, &slot_key(block_id, proposer_index))?
            .is_some())
    }

    // ── Proposal vectors ────────────────────────────────────────────────

    pub fn save_proposal_vector(
        &self,
        block_id: BlockId,
        vector: &BooleanProposalVector,
    ) -> Result<()> {
        self.backend.put(
            NS_PROPOSAL_VECTORS,
            &block_key(block_id),
            &bincode::serialize(vector)?,
        )
    }

    pub fn proposal_vector(&self, block_id: BlockId) -> Result<Option<BooleanProposalVector>> {
        match self.backend.get(NS_PROPOSAL_VECTORS, &block_key(block_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Gas prices ──────────────────────────────────────────────────────

    pub fn save_price(&self, block_id: BlockId, price: u64) -> Result<()> {
        self.backend
            .put(NS_PRICES, &block_key(block_id), &price.to_le_bytes())
    }

    pub fn price(&self, block_id: BlockId) -> Option<u64> {
        self.backend
            .get(NS_PRICES, &block_key(block_id))
            .ok()
            .flatten()
            .and_then(|v| v.try_into().ok().map(u64::from_le_bytes))
    }

    // ── Network message stores ──────────────────────────────────────────

    fn save_message(&self, namespace: &str, msg: &NetworkMessage) -> Result<()> {
        let seq = self.msg_seq.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&msg.block_id.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        self.backend.put(namespace, &key, &bincode::serialize(msg)?)
    }

    pub fn save_outgoing_message(&self, msg: &NetworkMessage) -> Result<()> {
        self.save_message(NS_OUTGOING, msg)
    }

    pub fn save_incoming_message(&self, msg: &NetworkMessage) -> Result<()> {
        self.save_message(NS_INCOMING, msg)
    }

    /// Outgoing messages recorded for one block, in send order.
    pub fn outgoing_messages(&self, block_id: BlockId) -> Result<Vec<NetworkMessage>> {
        let keys = self
            .backend
            .keys_with_prefix(NS_OUTGOING, &block_id.to_be_bytes())?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.backend.get(NS_OUTGOING, &key)? {
                messages.push(bincode::deserialize(&bytes)?);
            }
        }
        Ok(messages)
    }
}

impl strand_consensus_net::MessageStore for ChainStorage {
    fn save_outgoing(&self, msg: &NetworkMessage) {
        if let Err(e) = self.save_outgoing_message(msg) {
            log::warn!("could not persist outgoing message: {e}");
        }
    }

    fn save_incoming(&self, msg: &NetworkMessage) {
        if let Err(e) = self.save_incoming_message(msg) {
            log::warn!("could not persist incoming message: {e}");
        }
    }
}

impl strand_consensus_net::BlockSource for ChainStorage {
    fn last_committed_block_id(&self) -> BlockId {
        ChainStorage::last_committed_block_id(self)
    }

    fn serialized_block(&self, block_id: BlockId) -> Option<Vec<u8>> {
        ChainStorage::serialized_block(self, block_id)
    }
}

/// Map a storage miss onto the state-machine error the commit path wants.
pub fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| {
        ConsensusError::invalid_state(
            "storage lookup",
            ConsensusError::InvalidArgument(format!("{what} not found")),
        )
    })
}
