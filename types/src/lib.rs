//! Strand Consensus Core Types
//!
//! Data structures shared by every layer of the Strand consensus engine:
//!
//! - **Identifiers** — block ids, chain ids, node ids/indices, protocol keys.
//! - **Transactions** — opaque client payloads with derived hashes, and the
//!   ordered lists blocks are built from.
//! - **Proposals and blocks** — [`BlockProposal`], [`CommittedBlock`], and
//!   their wire serialization (length-prefixed JSON header + raw payloads).
//! - **Network messages** — the fixed-layout consensus message header types
//!   exchanged between validators.
//! - **Errors** — the engine-wide [`ConsensusError`] taxonomy.
//!
//! Everything in this crate is plain data: no sockets, no threads, no
//! clocks. The networking and orchestration crates build on top of it.

pub mod block;
pub mod da_proof;
pub mod error;
pub mod hashing;
pub mod ids;
pub mod message;
pub mod proposal;
pub mod proposal_vector;
pub mod transaction;

pub use block::{CommittedBlock, CommittedBlockList, MAX_BUFFER_SIZE};
pub use da_proof::DAProof;
pub use error::{ConsensusError, Result};
pub use hashing::BlockHash;
pub use ids::{
    max_faulty, quorum_size, BlockId, ChainId, MsgId, NodeId, NodeIndex, ProtocolKey,
    ProtocolRound,
};
pub use message::{MsgType, NetworkMessage, NetworkMessageEnvelope};
pub use proposal::BlockProposal;
pub use proposal_vector::BooleanProposalVector;
pub use transaction::{Transaction, TransactionList};
