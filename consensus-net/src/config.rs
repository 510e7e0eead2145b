//! Configuration for the validator-to-validator networking layer.

use strand_types::{BlockId, ConsensusError, Result};

/// Offsets from a node's base port, one listener per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    /// TCP: block-proposal push, DA proofs, finalize downloads.
    Proposal,
    /// TCP: catch-up block requests.
    Catchup,
    /// UDP: binary-consensus datagrams.
    Consensus,
}

impl PortRole {
    pub fn offset(self) -> u16 {
        match self {
            PortRole::Proposal => 0,
            PortRole::Catchup => 1,
            PortRole::Consensus => 2,
        }
    }
}

/// Tunables for transport, catch-up, and the server pools.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Simulated packet loss on consensus sends, percent (0..=100).
    pub packet_loss: u32,

    /// Blocks at or below this id are assumed committed everywhere;
    /// consensus messages for them are silently dropped.
    pub catchup_blocks: BlockId,

    /// Messages older than this many blocks behind the current id are
    /// dropped instead of deferred.
    pub max_active_consensuses: u64,

    /// Cap of each per-peer delayed-sends FIFO.
    pub max_delayed_sends_per_peer: usize,

    /// Tick of the deferred-messages thread (ms).
    pub deferred_tick_ms: u64,

    /// Socket read timeout, which doubles as the exit-flag poll interval
    /// (ms).
    pub socket_timeout_ms: u64,

    /// Worker threads in each TCP accept pool.
    pub accept_pool_size: usize,

    /// Catch-up client request cadence (ms).
    pub catchup_interval_ms: u64,

    /// Maximum blocks per catch-up response batch.
    pub catchup_batch_cap: usize,

    /// Upper bound on one framed TCP message.
    pub max_message_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            packet_loss: 0,
            catchup_blocks: 0,
            max_active_consensuses: 64,
            max_delayed_sends_per_peer: 256,
            deferred_tick_ms: 100,
            socket_timeout_ms: 100,
            accept_pool_size: 4,
            catchup_interval_ms: 1_000,
            catchup_batch_cap: 128,
            max_message_size: 32 * 1024 * 1024,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.packet_loss > 100 {
            return Err(ConsensusError::InvalidArgument(format!(
                "packet_loss must be 0..=100, got {}",
                self.packet_loss
            )));
        }
        if self.max_active_consensuses == 0 {
            return Err(ConsensusError::InvalidArgument(
                "max_active_consensuses must be > 0".into(),
            ));
        }
        if self.accept_pool_size == 0 {
            return Err(ConsensusError::InvalidArgument(
                "accept_pool_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Shorter timeouts for loopback tests.
    pub fn dev_default() -> Self {
        Self {
            deferred_tick_ms: 20,
            socket_timeout_ms: 20,
            catchup_interval_ms: 100,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(NetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_packet_loss_range_enforced() {
        let cfg = NetConfig {
            packet_loss: 101,
            ..NetConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_port_role_offsets_distinct() {
        assert_ne!(PortRole::Proposal.offset(), PortRole::Catchup.offset());
        assert_ne!(PortRole::Catchup.offset(), PortRole::Consensus.offset());
    }
}
