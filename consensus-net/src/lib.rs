//! Strand Consensus Networking
//!
//! Validator-to-validator plumbing for the Strand consensus engine:
//!
//! - **Codec** — fixed-layout binary frames for consensus datagrams
//!   ([`codec`]).
//! - **Transport** — UDP datagram exchange with source-IP
//!   authentication, broadcast-until-quorum, per-peer delayed-send
//!   backlogs, and the deferred-message queue that holds future-block and
//!   future-round traffic ([`transport`]).
//! - **Proposal channel** — TCP push of block proposals, DA-share
//!   collection, DA-proof distribution, finalize downloads, and the
//!   health-check probe ([`proposal`], [`finalize`]).
//! - **Catch-up** — periodic block sync from random peers with
//!   threshold-signature validation ([`catchup`]).
//!
//! ## Threads
//!
//! | Thread | Role |
//! |--------|------|
//! | `strandNetRead`     | blocking UDP receive, decode, post-or-defer |
//! | `strandDeferred`    | 100 ms tick: re-evaluate deferred, drain delayed sends |
//! | `strandPropPush`    | pushes proposals / proofs, collects DA shares |
//! | `strandPropAccept` + pool | proposal server |
//! | `strandCatchAccept` + pool | catch-up server |
//! | `strandCatchClient` | periodic catch-up requests |
//!
//! Every loop polls one shared exit flag; shutdown sets the flag and
//! joins all handles.

pub mod catchup;
pub mod codec;
pub mod config;
pub mod finalize;
pub mod framing;
pub mod node_table;
pub mod proposal;
pub mod transport;
pub mod view;

pub use catchup::{BatchValidator, BlockSource, CatchupClient, CatchupRequest, CatchupServer};
pub use config::{NetConfig, PortRole};
pub use finalize::{BlockFinalizeDownloader, ProofChecker};
pub use node_table::{NodeInfo, NodeTable};
pub use proposal::{DaShare, ProposalClient, ProposalServer, ProposalSink};
pub use transport::{ConsensusTransport, MessageStore};
pub use view::ConsensusView;
