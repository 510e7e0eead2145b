//! Engine configuration.
//!
//! One flat struct carries everything a node needs at construction:
//! chain identity, the static validator table, networking tunables, and
//! the protocol knobs. Key material is handed over separately — key
//! management is the operator's concern, not the engine's.

use {
    crate::pending_queue::PendingQueueConfig,
    crate::pricing::PricingConfig,
    strand_consensus_net::{NetConfig, NodeInfo},
    strand_types::{ChainId, ConsensusError, NodeId, Result},
};

/// Full configuration of one consensus node.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    /// This node's identity; must appear in `nodes`.
    pub node_id: NodeId,
    /// The static validator table, indices 1..=N.
    pub nodes: Vec<NodeInfo>,
    pub net: NetConfig,
    pub pending: PendingQueueConfig,
    pub pricing: PricingConfig,
    /// Threads in the signature-verification pool.
    pub sig_verify_threads: usize,
    /// Health-check window before startup is declared failed.
    pub health_check_timeout_ms: u64,
    /// Test flag: always fetch decided proposals through the finalize
    /// downloader, even when they are present locally.
    pub finalization_download_only: bool,
}

impl ChainConfig {
    pub fn new(chain_id: ChainId, node_id: NodeId, nodes: Vec<NodeInfo>) -> Self {
        Self {
            chain_id,
            node_id,
            nodes,
            net: NetConfig::default(),
            pending: PendingQueueConfig::default(),
            pricing: PricingConfig::default(),
            sig_verify_threads: 2,
            health_check_timeout_ms: 15_000,
            finalization_download_only: false,
        }
    }

    pub fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn validate(&self) -> Result<()> {
        self.net.validate()?;
        if self.nodes.is_empty() {
            return Err(ConsensusError::EngineInit("empty validator table".into()));
        }
        if !self.nodes.iter().any(|n| n.node_id == self.node_id) {
            return Err(ConsensusError::EngineInit(format!(
                "node id {} is not in the validator table",
                self.node_id
            )));
        }
        if self.sig_verify_threads == 0 {
            return Err(ConsensusError::EngineInit(
                "sig_verify_threads must be > 0".into(),
            ));
        }
        Ok(())
    }
}
