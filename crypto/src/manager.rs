//! Key material and threshold signing operations.
//!
//! Key shares are dealt out-of-band (the chain operator runs the DKG or a
//! trusted dealer); a node receives its [`KeySet`] through configuration.
//! The [`CryptoManager`] derives the domain-separated messages the protocol
//! signs, encodes shares as hex for the wire, and combines quorums of
//! shares into unique chain signatures.

use {
    crate::{CryptoError, Result},
    strand_types::{BlockHash, BlockId, ChainId, NetworkMessage, NodeIndex, ProtocolKey,
        ProtocolRound},
    threshold_crypto::{
        serde_impl::SerdeSecret, PublicKeySet, SecretKeySet, SecretKeyShare, Signature,
        SignatureShare,
    },
};

// Domain tags keep signatures from one protocol artifact unusable in
// another.
const DOMAIN_DA: &[u8] = b"STRAND:DA:";
const DOMAIN_BLOCK: &[u8] = b"STRAND:BLK:";
const DOMAIN_COIN: &[u8] = b"STRAND:COIN:";
const DOMAIN_MSG: &[u8] = b"STRAND:MSG:";

/// One validator's share of the chain key plus the chain's public key set.
#[derive(Clone)]
pub struct KeySet {
    node_index: NodeIndex,
    secret_share: SecretKeyShare,
    public_set: PublicKeySet,
}

impl KeySet {
    pub fn new(
        node_index: NodeIndex,
        secret_share: SecretKeyShare,
        public_set: PublicKeySet,
    ) -> Result<Self> {
        if node_index == 0 {
            return Err(CryptoError::MalformedShare(
                "node index 0 cannot hold a key share".into(),
            ));
        }
        Ok(Self {
            node_index,
            secret_share,
            public_set,
        })
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn public_set(&self) -> &PublicKeySet {
        &self.public_set
    }
}

/// Signs, verifies, and combines threshold shares for one chain.
pub struct CryptoManager {
    chain_id: ChainId,
    node_count: u64,
    keys: KeySet,
}

impl CryptoManager {
    pub fn new(chain_id: ChainId, node_count: u64, keys: KeySet) -> Result<Self> {
        if keys.node_index > node_count {
            return Err(CryptoError::MalformedShare(format!(
                "node index {} exceeds node count {node_count}",
                keys.node_index
            )));
        }
        Ok(Self {
            chain_id,
            node_count,
            keys,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn node_index(&self) -> NodeIndex {
        self.keys.node_index
    }

    pub fn public_set(&self) -> &PublicKeySet {
        &self.keys.public_set
    }

    /// Number of shares needed to combine a signature (2f+1).
    pub fn required_shares(&self) -> usize {
        self.keys.public_set.threshold() + 1
    }

    // ── Share primitives ────────────────────────────────────────────────

    fn sign_bytes(&self, message: &[u8]) -> String {
        let share = self.keys.secret_share.sign(message);
        encode_share(&share)
    }

    fn verify_share_bytes(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        message: &[u8],
    ) -> Result<SignatureShare> {
        if signer == 0 || signer > self.node_count {
            return Err(CryptoError::ShareVerification(signer));
        }
        let share = decode_share(share_hex)?;
        let pk_share = self.keys.public_set.public_key_share((signer - 1) as usize);
        if !pk_share.verify(&share, message) {
            return Err(CryptoError::ShareVerification(signer));
        }
        Ok(share)
    }

    /// Verify every share and interpolate the unique chain signature.
    /// Invalid shares are skipped; at least 2f+1 valid ones must remain.
    fn combine(&self, message: &[u8], shares: &[(NodeIndex, String)]) -> Result<Signature> {
        let mut valid: Vec<(usize, SignatureShare)> = Vec::with_capacity(shares.len());
        for (signer, share_hex) in shares {
            match self.verify_share_bytes(*signer, share_hex, message) {
                Ok(share) => valid.push(((*signer - 1) as usize, share)),
                Err(e) => log::warn!("skipping bad signature share: {e}"),
            }
        }

        let needed = self.required_shares();
        if valid.len() < needed {
            return Err(CryptoError::NotEnoughShares {
                needed,
                got: valid.len(),
            });
        }

        let sig = self
            .keys
            .public_set
            .combine_signatures(valid.iter().map(|(i, s)| (*i, s)))
            .map_err(|e| CryptoError::Combine(format!("{e:?}")))?;

        if !self.keys.public_set.public_key().verify(&sig, message) {
            return Err(CryptoError::SignatureVerification);
        }
        Ok(sig)
    }

    // ── DA proofs ───────────────────────────────────────────────────────

    fn da_message(&self, proposal_hash: &BlockHash) -> Vec<u8> {
        let mut m = Vec::with_capacity(DOMAIN_DA.len() + 8 + 32);
        m.extend_from_slice(DOMAIN_DA);
        m.extend_from_slice(&self.chain_id.to_le_bytes());
        m.extend_from_slice(proposal_hash);
        m
    }

    /// This node's DA share attesting it has stored the proposal.
    pub fn sign_da_share(&self, proposal_hash: &BlockHash) -> String {
        self.sign_bytes(&self.da_message(proposal_hash))
    }

    pub fn verify_da_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        proposal_hash: &BlockHash,
    ) -> Result<()> {
        self.verify_share_bytes(signer, share_hex, &self.da_message(proposal_hash))
            .map(drop)
    }

    /// Combine 2f+1 DA shares into the proof that a quorum holds the
    /// proposal.
    pub fn combine_da_proof(
        &self,
        proposal_hash: &BlockHash,
        shares: &[(NodeIndex, String)],
    ) -> Result<String> {
        let sig = self.combine(&self.da_message(proposal_hash), shares)?;
        Ok(encode_signature(&sig))
    }

    pub fn verify_da_proof(&self, proposal_hash: &BlockHash, proof_hex: &str) -> Result<()> {
        self.verify_signature_hex(proof_hex, &self.da_message(proposal_hash))
    }

    // ── Block signatures ────────────────────────────────────────────────

    fn block_message(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> Vec<u8> {
        let mut m = Vec::with_capacity(DOMAIN_BLOCK.len() + 24 + 32);
        m.extend_from_slice(DOMAIN_BLOCK);
        m.extend_from_slice(&self.chain_id.to_le_bytes());
        m.extend_from_slice(&block_id.to_le_bytes());
        m.extend_from_slice(&proposer_index.to_le_bytes());
        m.extend_from_slice(proposal_hash);
        m
    }

    /// This node's share of the finalization signature for a decided block.
    pub fn sign_block_share(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> String {
        self.sign_bytes(&self.block_message(block_id, proposer_index, proposal_hash))
    }

    pub fn verify_block_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
    ) -> Result<()> {
        self.verify_share_bytes(
            signer,
            share_hex,
            &self.block_message(block_id, proposer_index, proposal_hash),
        )
        .map(drop)
    }

    pub fn combine_block_sig(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
        shares: &[(NodeIndex, String)],
    ) -> Result<String> {
        let sig = self.combine(
            &self.block_message(block_id, proposer_index, proposal_hash),
            shares,
        )?;
        Ok(encode_signature(&sig))
    }

    /// Verify a block's finalization signature, e.g. on a catch-up batch.
    pub fn verify_block_sig(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        proposal_hash: &BlockHash,
        sig_hex: &str,
    ) -> Result<()> {
        self.verify_signature_hex(
            sig_hex,
            &self.block_message(block_id, proposer_index, proposal_hash),
        )
    }

    // ── The common coin ─────────────────────────────────────────────────

    fn coin_message(&self, key: ProtocolKey, round: ProtocolRound) -> Vec<u8> {
        let mut m = Vec::with_capacity(DOMAIN_COIN.len() + 32);
        m.extend_from_slice(DOMAIN_COIN);
        m.extend_from_slice(&self.chain_id.to_le_bytes());
        m.extend_from_slice(&key.block_id.to_le_bytes());
        m.extend_from_slice(&key.proposer_index.to_le_bytes());
        m.extend_from_slice(&round.to_le_bytes());
        m
    }

    /// This node's coin share for one round of one binary instance.
    /// Carried by AUX messages.
    pub fn sign_coin_share(&self, key: ProtocolKey, round: ProtocolRound) -> String {
        self.sign_bytes(&self.coin_message(key, round))
    }

    pub fn verify_coin_share(
        &self,
        signer: NodeIndex,
        share_hex: &str,
        key: ProtocolKey,
        round: ProtocolRound,
    ) -> Result<()> {
        self.verify_share_bytes(signer, share_hex, &self.coin_message(key, round))
            .map(drop)
    }

    /// Interpolate the round coin from 2f+1 coin shares. The combined
    /// signature is unique, so every honest node derives the same bit.
    pub fn combine_coin(
        &self,
        key: ProtocolKey,
        round: ProtocolRound,
        shares: &[(NodeIndex, String)],
    ) -> Result<bool> {
        let sig = self.combine(&self.coin_message(key, round), shares)?;
        Ok(sig.parity())
    }

    // ── Message authentication ──────────────────────────────────────────

    fn msg_auth_bytes(&self, msg: &NetworkMessage) -> Vec<u8> {
        let mut m = Vec::with_capacity(DOMAIN_MSG.len() + 64);
        m.extend_from_slice(DOMAIN_MSG);
        m.extend_from_slice(&msg.chain_id.to_le_bytes());
        m.extend_from_slice(&msg.block_id.to_le_bytes());
        m.extend_from_slice(&msg.proposer_index.to_le_bytes());
        m.extend_from_slice(&msg.msg_type.as_u64().to_le_bytes());
        m.extend_from_slice(&msg.src_node_id.to_le_bytes());
        m.extend_from_slice(&msg.round.to_le_bytes());
        m.push(msg.value);
        m
    }

    /// Attach this node's authentication share to an outgoing BVB message.
    /// AUX and block-sign messages carry purpose-specific shares instead.
    pub fn sign_network_message(&self, msg: &mut NetworkMessage) {
        msg.sig_share = self.sign_bytes(&self.msg_auth_bytes(msg));
    }

    pub fn verify_network_message(&self, msg: &NetworkMessage, signer: NodeIndex) -> Result<()> {
        self.verify_share_bytes(signer, &msg.sig_share, &self.msg_auth_bytes(msg))
            .map(drop)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn verify_signature_hex(&self, sig_hex: &str, message: &[u8]) -> Result<()> {
        let sig = decode_signature(sig_hex)?;
        if self.keys.public_set.public_key().verify(&sig, message) {
            Ok(())
        } else {
            Err(CryptoError::SignatureVerification)
        }
    }
}

// ── Wire encoding ───────────────────────────────────────────────────────

fn encode_share(share: &SignatureShare) -> String {
    hex::encode(bincode::serialize(share).expect("signature share serializes"))
}

fn decode_share(share_hex: &str) -> Result<SignatureShare> {
    let bytes = hex::decode(share_hex.trim_end_matches('\0'))
        .map_err(|e| CryptoError::MalformedShare(format!("hex: {e}")))?;
    bincode::deserialize(&bytes).map_err(|e| CryptoError::MalformedShare(format!("bincode: {e}")))
}

fn encode_signature(sig: &Signature) -> String {
    hex::encode(bincode::serialize(sig).expect("signature serializes"))
}

fn decode_signature(sig_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(sig_hex.trim_end_matches('\0'))
        .map_err(|e| CryptoError::MalformedShare(format!("hex: {e}")))?;
    bincode::deserialize(&bytes).map_err(|e| CryptoError::MalformedShare(format!("bincode: {e}")))
}

/// Hex form of a public key set, for config files.
pub fn public_set_to_hex(set: &PublicKeySet) -> String {
    hex::encode(bincode::serialize(set).expect("public key set serializes"))
}

pub fn public_set_from_hex(s: &str) -> Result<PublicKeySet> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedShare(format!("hex: {e}")))?;
    bincode::deserialize(&bytes).map_err(|e| CryptoError::MalformedShare(format!("bincode: {e}")))
}

/// Hex form of a secret key share, for key files.
pub fn secret_share_to_hex(share: &SecretKeyShare) -> String {
    hex::encode(
        bincode::serialize(&SerdeSecret(share.clone())).expect("secret key share serializes"),
    )
}

pub fn secret_share_from_hex(s: &str) -> Result<SecretKeyShare> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedShare(format!("hex: {e}")))?;
    let secret: SerdeSecret<SecretKeyShare> = bincode::deserialize(&bytes)
        .map_err(|e| CryptoError::MalformedShare(format!("bincode: {e}")))?;
    Ok(secret.0)
}

/// Deal a key set for `node_count` validators with a 2f+1 signing
/// threshold. Intended for tests and development chains; production chains
/// run a DKG instead.
pub fn generate_key_sets(node_count: u64, seed: u64) -> (PublicKeySet, Vec<SecretKeyShare>) {
    use rand07::{rngs::StdRng, SeedableRng};

    let threshold = 2 * strand_types::max_faulty(node_count) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let sk_set = SecretKeySet::random(threshold, &mut rng);
    let shares = (0..node_count as usize)
        .map(|i| sk_set.secret_key_share(i))
        .collect();
    (sk_set.public_keys(), shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: ChainId = 11;
    const N: u64 = 4;

    fn managers() -> Vec<CryptoManager> {
        let (pk_set, shares) = generate_key_sets(N, 42);
        shares
            .into_iter()
            .enumerate()
            .map(|(i, share)| {
                let keys = KeySet::new(i as u64 + 1, share, pk_set.clone()).unwrap();
                CryptoManager::new(CHAIN, N, keys).unwrap()
            })
            .collect()
    }

    fn sample_hash() -> BlockHash {
        strand_types::hashing::hashv(&[b"proposal"])
    }

    #[test]
    fn test_required_shares_is_quorum() {
        let ms = managers();
        assert_eq!(ms[0].required_shares(), 3); // 2f+1 for N=4
    }

    #[test]
    fn test_da_share_verifies_only_for_signer() {
        let ms = managers();
        let hash = sample_hash();
        let share = ms[1].sign_da_share(&hash);
        assert!(ms[0].verify_da_share(2, &share, &hash).is_ok());
        assert!(ms[0].verify_da_share(3, &share, &hash).is_err());
    }

    #[test]
    fn test_da_proof_combines_from_quorum() {
        let ms = managers();
        let hash = sample_hash();
        let shares: Vec<(NodeIndex, String)> = ms[..3]
            .iter()
            .map(|m| (m.node_index(), m.sign_da_share(&hash)))
            .collect();
        let proof = ms[0].combine_da_proof(&hash, &shares).unwrap();
        assert!(ms[3].verify_da_proof(&hash, &proof).is_ok());
        assert!(ms[3].verify_da_proof(&sample_hash(), &proof).is_ok());
        let other = strand_types::hashing::hashv(&[b"other"]);
        assert!(ms[3].verify_da_proof(&other, &proof).is_err());
    }

    #[test]
    fn test_da_proof_needs_quorum() {
        let ms = managers();
        let hash = sample_hash();
        let shares: Vec<(NodeIndex, String)> = ms[..2]
            .iter()
            .map(|m| (m.node_index(), m.sign_da_share(&hash)))
            .collect();
        assert!(matches!(
            ms[0].combine_da_proof(&hash, &shares),
            Err(CryptoError::NotEnoughShares { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn test_bad_shares_are_skipped() {
        let ms = managers();
        let hash = sample_hash();
        let mut shares: Vec<(NodeIndex, String)> = ms[..3]
            .iter()
            .map(|m| (m.node_index(), m.sign_da_share(&hash)))
            .collect();
        // A garbage share and a mis-attributed one must not poison the set.
        shares.push((4, "deadbeef".into()));
        shares.push((4, ms[0].sign_da_share(&hash)));
        let proof = ms[0].combine_da_proof(&hash, &shares).unwrap();
        assert!(ms[1].verify_da_proof(&hash, &proof).is_ok());
    }

    #[test]
    fn test_block_sig_round_trip() {
        let ms = managers();
        let hash = sample_hash();
        let shares: Vec<(NodeIndex, String)> = ms[1..]
            .iter()
            .map(|m| (m.node_index(), m.sign_block_share(9, 2, &hash)))
            .collect();
        let sig = ms[0].combine_block_sig(9, 2, &hash, &shares).unwrap();
        assert!(ms[0].verify_block_sig(9, 2, &hash, &sig).is_ok());
        // Same hash under a different block id is a different message.
        assert!(ms[0].verify_block_sig(10, 2, &hash, &sig).is_err());
    }

    #[test]
    fn test_coin_is_subset_independent() {
        let ms = managers();
        let key = ProtocolKey::new(5, 2);
        let shares: Vec<(NodeIndex, String)> = ms
            .iter()
            .map(|m| (m.node_index(), m.sign_coin_share(key, 3)))
            .collect();
        let a = ms[0].combine_coin(key, 3, &shares[..3]).unwrap();
        let b = ms[0].combine_coin(key, 3, &shares[1..]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_coin_share_bound_to_round() {
        let ms = managers();
        let key = ProtocolKey::new(5, 2);
        let share = ms[0].sign_coin_share(key, 3);
        assert!(ms[1].verify_coin_share(1, &share, key, 3).is_ok());
        assert!(ms[1].verify_coin_share(1, &share, key, 4).is_err());
    }

    #[test]
    fn test_network_message_authentication() {
        let ms = managers();
        let mut msg = NetworkMessage {
            chain_id: CHAIN,
            block_id: 5,
            proposer_index: 2,
            msg_type: strand_types::MsgType::BvBroadcast,
            msg_id: 1,
            src_node_id: 1001,
            dst_node_id: 1002,
            round: 0,
            value: 1,
            src_ip: std::net::Ipv4Addr::new(10, 0, 0, 1),
            sig_share: String::new(),
        };
        ms[0].sign_network_message(&mut msg);
        assert!(ms[1].verify_network_message(&msg, 1).is_ok());
        assert!(ms[1].verify_network_message(&msg, 2).is_err());

        // Any tampered header field invalidates the share.
        msg.value = 0;
        assert!(ms[1].verify_network_message(&msg, 1).is_err());
    }

    #[test]
    fn test_key_hex_round_trips() {
        let (pk_set, shares) = generate_key_sets(N, 7);
        let pk2 = public_set_from_hex(&public_set_to_hex(&pk_set)).unwrap();
        assert_eq!(pk_set.public_key(), pk2.public_key());

        let share2 = secret_share_from_hex(&secret_share_to_hex(&shares[0])).unwrap();
        let msg = b"probe";
        assert_eq!(shares[0].sign(msg), share2.sign(msg));
    }
}
