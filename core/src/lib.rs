//! Strand Consensus Core
//!
//! The orchestration layer of the Strand consensus engine. This crate
//! ties the data model, threshold crypto, binary agreement, and
//! networking crates into one running validator:
//!
//! ```text
//!  transactions → pending pool → proposal builder → DA layer
//!        → binary consensus → commit → execution collaborator
//! ```
//!
//! - [`schain`] — the single-writer chain orchestrator: commit pipeline,
//!   proposal flow, DA bookkeeping, bootstrap, catch-up ingestion.
//! - [`engine`] — node assembly: sockets, servers, threads, health
//!   check, shutdown.
//! - [`storage`] — the key-value collaborator boundary and the typed
//!   stores built on it.
//! - [`pending_queue`] — deduplicated client-transaction pool.
//! - [`pricing`] — fullness-driven gas price tracking.
//! - [`execution`] — the committed-block hand-off boundary.
//! - [`da`] — DA share collection and proof tracking.

pub mod config;
pub mod da;
pub mod engine;
pub mod execution;
pub mod pending_queue;
pub mod pricing;
pub mod schain;
pub mod storage;

pub use config::ChainConfig;
pub use da::{DaProofStore, DaShareCollector};
pub use engine::{ConsensusNode, HEALTH_CHECK_EXIT_CODE};
pub use execution::{ExecutionClient, NullExecution};
pub use pending_queue::{PendingQueueConfig, PendingTransactionsAgent};
pub use pricing::{PricingAgent, PricingConfig};
pub use schain::{
    ConsensusBroadcast, ProposalFetcher, ProposalPublisher, Schain, SchainSink,
};
pub use storage::{ChainStorage, KeyValueStorage, MemStorage};
