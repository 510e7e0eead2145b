//! Strand Threshold Cryptography
//!
//! All signing in the engine goes through threshold BLS: each validator
//! holds one share of a chain-wide secret key, generated out-of-band, and
//! any 2f+1 shares combine into a unique chain signature. Three protocol
//! artifacts are built on this:
//!
//! - **DA proofs** — 2f+1 shares over a proposal hash prove that a quorum
//!   has stored the proposal.
//! - **Block signatures** — 2f+1 shares over the decided
//!   (block id, proposer index, proposal hash) finalize a block.
//! - **The common coin** — the combined signature over a canonical
//!   per-round seed is unique, so its parity bit is unpredictable before
//!   2f+1 shares exist and deterministic afterwards: exactly the coin the
//!   binary agreement rounds need.
//!
//! The underlying primitive is the `threshold_crypto` BLS12-381
//! implementation; this crate only derives domain-separated messages,
//! encodes shares for the wire (hex over bincode), and batches
//! verification onto a dedicated pool.

pub mod manager;
pub mod verify_pool;

pub use manager::{
    generate_key_sets, public_set_from_hex, public_set_to_hex, secret_share_from_hex,
    secret_share_to_hex, CryptoManager, KeySet,
};
pub use verify_pool::{ShareVerifyJob, SigVerifyPool};

use thiserror::Error;

/// Failures in share handling and signature assembly.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A share failed hex or bincode decoding.
    #[error("malformed signature share: {0}")]
    MalformedShare(String),

    /// A share did not verify against the signer's public key share.
    #[error("signature share from node {0} failed verification")]
    ShareVerification(u64),

    /// Not enough valid shares to combine a threshold signature.
    #[error("need {needed} valid shares, got {got}")]
    NotEnoughShares { needed: usize, got: usize },

    /// `threshold_crypto` rejected the share set during interpolation.
    #[error("could not combine threshold signature: {0}")]
    Combine(String),

    /// A combined signature failed verification against the chain key.
    #[error("threshold signature verification failed")]
    SignatureVerification,

    /// Verification pool construction failed.
    #[error("could not build verification pool: {0}")]
    Pool(String),
}

impl From<CryptoError> for strand_types::ConsensusError {
    fn from(err: CryptoError) -> Self {
        strand_types::ConsensusError::NetworkProtocol(err.to_string())
    }
}

/// Convenience result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
