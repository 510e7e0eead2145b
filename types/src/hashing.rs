//! SHA-256 helpers shared by the data structures.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type BlockHash = [u8; 32];

/// Hash the concatenation of the given byte slices.
pub fn hashv(vals: &[&[u8]]) -> BlockHash {
    let mut hasher = Sha256::new();
    for v in vals {
        hasher.update(v);
    }
    hasher.finalize().into()
}

/// Hex-encode a digest for headers and log lines.
pub fn to_hex(hash: &BlockHash) -> String {
    hex::encode(hash)
}

/// Decode a hex digest from a block header.
pub fn from_hex(s: &str) -> Result<BlockHash, crate::error::ConsensusError> {
    let bytes = hex::decode(s)
        .map_err(|e| crate::error::ConsensusError::Parsing(format!("bad hash hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| crate::error::ConsensusError::Parsing("hash is not 32 bytes".into()))
}
