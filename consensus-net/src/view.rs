//! Read-only view of consensus progress for the transport.
//!
//! The deferral policy needs three facts the orchestrator owns: the last
//! committed block id, each instance's current round, and whether it has
//! decided. The orchestrator publishes them here after every state change;
//! the network threads only read.

use {
    parking_lot::RwLock,
    std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, Ordering},
    },
    strand_types::{BlockId, ProtocolKey, ProtocolRound},
};

/// Shared progress snapshot between the orchestrator and the transport.
#[derive(Debug, Default)]
pub struct ConsensusView {
    last_committed: AtomicU64,
    instances: RwLock<HashMap<ProtocolKey, (ProtocolRound, bool)>>,
}

impl ConsensusView {
    pub fn new(last_committed: BlockId) -> Self {
        Self {
            last_committed: AtomicU64::new(last_committed),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn last_committed_block_id(&self) -> BlockId {
        self.last_committed.load(Ordering::Acquire)
    }

    /// The block id currently being agreed on.
    pub fn current_block_id(&self) -> BlockId {
        self.last_committed_block_id() + 1
    }

    pub fn round_of(&self, key: ProtocolKey) -> ProtocolRound {
        self.instances
            .read()
            .get(&key)
            .map(|(round, _)| *round)
            .unwrap_or(0)
    }

    pub fn is_decided(&self, key: ProtocolKey) -> bool {
        self.instances
            .read()
            .get(&key)
            .map(|(_, decided)| *decided)
            .unwrap_or(false)
    }

    /// Publish an instance's progress.
    pub fn publish_instance(&self, key: ProtocolKey, round: ProtocolRound, decided: bool) {
        self.instances.write().insert(key, (round, decided));
    }

    /// Advance the committed id and drop snapshots for finished blocks.
    pub fn publish_committed(&self, block_id: BlockId) {
        self.last_committed.store(block_id, Ordering::Release);
        self.instances.write().retain(|key, _| key.block_id > block_id);
    }
}
