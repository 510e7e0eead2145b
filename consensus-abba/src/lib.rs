//! Strand Binary Byzantine Agreement
//!
//! The agreement core of the Strand consensus engine: asynchronous binary
//! Byzantine agreement (ABBA) instances, one per (block id, proposer
//! index), aggregated per block into a decision vector that selects the
//! committed proposer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            BlockConsensusAggregator (per block)      │
//! │                                                      │
//! │  ┌────────────┐ ┌────────────┐     ┌────────────┐   │
//! │  │ Instance 1 │ │ Instance 2 │ ... │ Instance N │   │
//! │  │ (BV / AUX) │ │ (BV / AUX) │     │ (BV / AUX) │   │
//! │  └──────┬─────┘ └──────┬─────┘     └──────┬─────┘   │
//! │         └── decisions ─┴── decision vector ┘         │
//! │                          │                           │
//! │            proposer selection + 2f+1 block-sign      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Both layers are pure state machines in the same mold: methods consume
//! verified messages and return an output struct with messages to
//! broadcast and events for the orchestrator. All sockets, clocks, and
//! persistence live elsewhere; callers pass a monotonic `now_ms` in and
//! loop this node's own broadcasts back.
//!
//! # Key properties
//!
//! - **Agreement**: honest nodes decide the same bit per instance, so the
//!   decision vectors — and the selected proposer — match everywhere.
//! - **Termination**: each round's common coin gives an independent 1/2
//!   chance of deciding, so instances terminate in expected two rounds.
//! - **Liveness under partial DA**: once f+1 instances decided with at
//!   least one 1, unstarted instances are seeded 0 so a silent proposer
//!   cannot stall the block.

pub mod aggregator;
pub mod instance;
pub mod traits;

pub use aggregator::{AggregatorOutput, BlockConsensusAggregator, BlockSigned, ProposerDecided};
pub use instance::{BinConsensusInstance, ChildDecided, InstanceOutput, OutMessage};
pub use traits::ConsensusCrypto;
