//! Consensus network message types.
//!
//! Every consensus datagram carries one [`NetworkMessage`]: a fixed set of
//! header fields plus a signature-share payload. The binary layout lives in
//! the networking crate's codec; this module owns the typed form and the
//! routing helpers.

use {
    crate::{
        error::{ConsensusError, Result},
        ids::{BlockId, ChainId, MsgId, NodeId, NodeIndex, ProtocolKey, ProtocolRound},
    },
    serde::{Deserialize, Serialize},
    std::{fmt, net::Ipv4Addr},
};

/// Discriminates the consensus message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum MsgType {
    /// BV-broadcast of a binary estimate.
    BvBroadcast = 1,
    /// AUX-broadcast of a bin-value, carrying a coin signature share.
    AuxBroadcast = 2,
    /// Broadcast of a block-signature share for the decided proposal.
    BlockSignBroadcast = 3,
}

impl MsgType {
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn from_u64(raw: u64) -> Result<Self> {
        match raw {
            1 => Ok(Self::BvBroadcast),
            2 => Ok(Self::AuxBroadcast),
            3 => Ok(Self::BlockSignBroadcast),
            other => Err(ConsensusError::InvalidMessageFormat(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::BvBroadcast => "BVB",
            Self::AuxBroadcast => "AUX",
            Self::BlockSignBroadcast => "SIG",
        };
        f.write_str(tag)
    }
}

/// One consensus message as exchanged between validators.
///
/// `value` is a binary estimate and must be 0 or 1. `sig_share` is the
/// ASCII (hex) encoding of a threshold signature share; its meaning depends
/// on the message type (BVB: sender authentication, AUX: coin share over
/// the round seed, SIG: block-signature share over the decided hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub chain_id: ChainId,
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
    pub msg_type: MsgType,
    pub msg_id: MsgId,
    pub src_node_id: NodeId,
    pub dst_node_id: NodeId,
    pub round: ProtocolRound,
    pub value: u8,
    pub src_ip: Ipv4Addr,
    pub sig_share: String,
}

impl NetworkMessage {
    /// Validate field ranges that the codec cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.value > 1 {
            return Err(ConsensusError::InvalidMessageFormat(format!(
                "binary value out of range: {}",
                self.value
            )));
        }
        if self.block_id == 0 {
            return Err(ConsensusError::InvalidMessageFormat(
                "message for block id 0".into(),
            ));
        }
        Ok(())
    }

    /// The binary-consensus instance this message addresses.
    pub fn protocol_key(&self) -> ProtocolKey {
        ProtocolKey::new(self.block_id, self.proposer_index)
    }

    pub fn bin_value(&self) -> bool {
        self.value != 0
    }
}

impl fmt::Display for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:BID:{}:PRP:{}:R:{}:V:{}",
            self.msg_type, self.block_id, self.proposer_index, self.round, self.value
        )
    }
}

/// A received message together with the resolved sender position.
///
/// The sender index comes from the node-table lookup on the source IP, not
/// from any self-reported field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessageEnvelope {
    pub message: NetworkMessage,
    pub src_index: NodeIndex,
}

impl NetworkMessageEnvelope {
    pub fn new(message: NetworkMessage, src_index: NodeIndex) -> Self {
        Self { message, src_index }
    }

    pub fn block_id(&self) -> BlockId {
        self.message.block_id
    }
}
