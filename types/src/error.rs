//! Engine-wide error taxonomy.
//!
//! One enum covers every failure class the engine distinguishes. The
//! propagation policy is layered:
//!
//! - per-message faults ([`InvalidMessageFormat`], [`InvalidChain`],
//!   [`InvalidSourceIp`]) are logged and the message is dropped;
//! - per-block faults surface as [`InvalidState`] wrapping the cause; the
//!   orchestrator logs and continues, and catch-up re-attempts the block;
//! - [`ExitRequested`] unwinds to the top of the owning thread and is never
//!   swallowed;
//! - [`Fatal`] terminates the process with a logged cause.
//!
//! [`InvalidMessageFormat`]: ConsensusError::InvalidMessageFormat
//! [`InvalidChain`]: ConsensusError::InvalidChain
//! [`InvalidSourceIp`]: ConsensusError::InvalidSourceIp
//! [`InvalidState`]: ConsensusError::InvalidState
//! [`ExitRequested`]: ConsensusError::ExitRequested
//! [`Fatal`]: ConsensusError::Fatal

use {
    crate::ids::ChainId,
    std::net::Ipv4Addr,
    thiserror::Error,
};

/// Errors produced anywhere in the consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A caller passed a structurally invalid value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A byte sequence could not be parsed into the expected structure.
    #[error("parsing error: {0}")]
    Parsing(String),

    /// A network message had an unknown type or corrupt field.
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// A message carried a chain id other than the local one.
    #[error("message for unknown chain {got} (local chain {local})")]
    InvalidChain { got: ChainId, local: ChainId },

    /// A message arrived from an IP that is not in the node table.
    #[error("message from unknown source ip {0}")]
    InvalidSourceIp(Ipv4Addr),

    /// A peer violated the request/response protocol.
    #[error("network protocol violation: {0}")]
    NetworkProtocol(String),

    /// A state-machine invariant was violated while processing a block.
    /// The orchestrator logs these and continues; the affected block is
    /// re-attempted through catch-up.
    #[error("invalid state in {context}")]
    InvalidState {
        context: String,
        #[source]
        source: Box<ConsensusError>,
    },

    /// Engine construction failed (bad config, node not in the table, ...).
    #[error("engine initialization failed: {0}")]
    EngineInit(String),

    /// Shutdown was requested; unwinds every long-running operation.
    #[error("exit requested")]
    ExitRequested,

    /// Unrecoverable failure; the process terminates.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal envelope (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl ConsensusError {
    /// Wrap `cause` as an [`ConsensusError::InvalidState`] tagged with the
    /// operation that observed it.
    pub fn invalid_state(context: impl Into<String>, cause: ConsensusError) -> Self {
        Self::InvalidState {
            context: context.into(),
            source: Box::new(cause),
        }
    }

    /// True for the distinguished cancellation result.
    pub fn is_exit_requested(&self) -> bool {
        matches!(self, Self::ExitRequested)
    }
}

/// Convenience result type used throughout the engine.
pub type Result<T> = std::result::Result<T, ConsensusError>;
