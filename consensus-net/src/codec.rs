//! Fixed-layout framing for consensus datagrams.
//!
//! Every consensus message is one frame, little-endian, no padding:
//!
//! | field          | bytes |
//! |----------------|-------|
//! | magic          | 8     |
//! | chain id       | 8     |
//! | block id       | 8     |
//! | proposer index | 8     |
//! | msg type       | 8     |
//! | msg id         | 8     |
//! | src node id    | 8     |
//! | dst node id    | 8     |
//! | round          | 8     |
//! | value          | 1     |
//! | src ip (IPv4)  | 4     |
//! | sig share      | 1024  |
//!
//! The signature share is ASCII, NUL-padded to [`MAX_SIG_LEN`]. Frames
//! with the wrong magic are rejected before any other field is read.

use {
    std::net::Ipv4Addr,
    strand_types::{ChainId, ConsensusError, MsgType, NetworkMessage, Result},
};

/// Frame preamble; anything else is noise from another protocol.
pub const MAGIC_NUMBER: u64 = 0x5354_524E_4443_4E53;

/// Cap on the ASCII signature share carried by a frame.
pub const MAX_SIG_LEN: usize = 1024;

/// Total size of one consensus frame.
pub const CONSENSUS_MESSAGE_LEN: usize = 9 * 8 + 1 + 4 + MAX_SIG_LEN;

/// Whether a frame starts with the consensus magic. Frames that do not
/// are another protocol's noise and are dropped without logging.
pub fn has_magic(frame: &[u8]) -> bool {
    frame.len() >= 8 && frame[..8] == MAGIC_NUMBER.to_le_bytes()
}

/// Encode a message into a fixed-size frame.
pub fn encode(msg: &NetworkMessage) -> Result<Vec<u8>> {
    if msg.sig_share.len() > MAX_SIG_LEN {
        return Err(ConsensusError::InvalidArgument(format!(
            "signature share too long: {} > {MAX_SIG_LEN}",
            msg.sig_share.len()
        )));
    }
    if !msg.sig_share.is_ascii() {
        return Err(ConsensusError::InvalidArgument(
            "signature share is not ascii".into(),
        ));
    }

    let mut buf = Vec::with_capacity(CONSENSUS_MESSAGE_LEN);
    buf.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
    buf.extend_from_slice(&msg.chain_id.to_le_bytes());
    buf.extend_from_slice(&msg.block_id.to_le_bytes());
    buf.extend_from_slice(&msg.proposer_index.to_le_bytes());
    buf.extend_from_slice(&msg.msg_type.as_u64().to_le_bytes());
    buf.extend_from_slice(&msg.msg_id.to_le_bytes());
    buf.extend_from_slice(&msg.src_node_id.to_le_bytes());
    buf.extend_from_slice(&msg.dst_node_id.to_le_bytes());
    buf.extend_from_slice(&msg.round.to_le_bytes());
    buf.push(msg.value);
    buf.extend_from_slice(&msg.src_ip.octets());
    buf.extend_from_slice(msg.sig_share.as_bytes());
    buf.resize(CONSENSUS_MESSAGE_LEN, 0);
    Ok(buf)
}

/// Decode a frame. Rejects short frames, wrong magic, wrong chain id,
/// unknown message types, and non-ASCII share bytes.
pub fn decode(frame: &[u8], local_chain: ChainId) -> Result<NetworkMessage> {
    if frame.len() < CONSENSUS_MESSAGE_LEN {
        return Err(ConsensusError::InvalidMessageFormat(format!(
            "short frame: {} bytes",
            frame.len()
        )));
    }

    let mut cursor = Cursor { frame, pos: 0 };
    let magic = cursor.u64();
    if magic != MAGIC_NUMBER {
        return Err(ConsensusError::InvalidMessageFormat("bad magic".into()));
    }

    let chain_id = cursor.u64();
    let block_id = cursor.u64();
    let proposer_index = cursor.u64();
    let raw_type = cursor.u64();
    let msg_id = cursor.u64();
    let src_node_id = cursor.u64();
    let dst_node_id = cursor.u64();
    let round = cursor.u64();
    let value = cursor.u8();
    let src_ip = Ipv4Addr::from(cursor.bytes::<4>());

    if chain_id != local_chain {
        return Err(ConsensusError::InvalidChain {
            got: chain_id,
            local: local_chain,
        });
    }

    let msg_type = MsgType::from_u64(raw_type)?;

    let sig_raw = &frame[cursor.pos..cursor.pos + MAX_SIG_LEN];
    let sig_end = sig_raw.iter().position(|b| *b == 0).unwrap_or(MAX_SIG_LEN);
    let sig_share = std::str::from_utf8(&sig_raw[..sig_end])
        .map_err(|_| ConsensusError::InvalidMessageFormat("share is not ascii".into()))?
        .to_string();
    if !sig_share.is_ascii() {
        return Err(ConsensusError::InvalidMessageFormat(
            "share is not ascii".into(),
        ));
    }

    let msg = NetworkMessage {
        chain_id,
        block_id,
        proposer_index,
        msg_type,
        msg_id,
        src_node_id,
        dst_node_id,
        round,
        value,
        src_ip,
        sig_share,
    };
    msg.validate()?;
    Ok(msg)
}

struct Cursor<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(
            self.frame[self.pos..self.pos + 8]
                .try_into()
                .expect("8 bytes"),
        );
        self.pos += 8;
        v
    }

    fn u8(&mut self) -> u8 {
        let v = self.frame[self.pos];
        self.pos += 1;
        v
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let v: [u8; N] = self.frame[self.pos..self.pos + N]
            .try_into()
            .expect("fixed slice");
        self.pos += N;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: ChainId = 11;

    fn sample() -> NetworkMessage {
        NetworkMessage {
            chain_id: CHAIN,
            block_id: 5,
            proposer_index: 2,
            msg_type: MsgType::AuxBroadcast,
            msg_id: 99,
            src_node_id: 1001,
            dst_node_id: 1003,
            round: 7,
            value: 1,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            sig_share: "a1b2c3d4".into(),
        }
    }

    #[test]
    fn test_frame_is_fixed_size() {
        let frame = encode(&sample()).unwrap();
        assert_eq!(frame.len(), CONSENSUS_MESSAGE_LEN);
        assert_eq!(CONSENSUS_MESSAGE_LEN, 1101);
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame, CHAIN).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_max_len_share() {
        let mut msg = sample();
        msg.sig_share = "f".repeat(MAX_SIG_LEN);
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame, CHAIN).unwrap(), msg);
    }

    #[test]
    fn test_share_over_cap_rejected() {
        let mut msg = sample();
        msg.sig_share = "f".repeat(MAX_SIG_LEN + 1);
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = encode(&sample()).unwrap();
        frame[0] ^= 0xFF;
        assert!(matches!(
            decode(&frame, CHAIN),
            Err(ConsensusError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_wrong_chain_rejected() {
        let frame = encode(&sample()).unwrap();
        assert!(matches!(
            decode(&frame, CHAIN + 1),
            Err(ConsensusError::InvalidChain { got: 11, local: 12 })
        ));
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        let mut frame = encode(&sample()).unwrap();
        // msg type is the 5th u64.
        frame[32..40].copy_from_slice(&77u64.to_le_bytes());
        assert!(matches!(
            decode(&frame, CHAIN),
            Err(ConsensusError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_short_frame_rejected() {
        let frame = encode(&sample()).unwrap();
        assert!(decode(&frame[..100], CHAIN).is_err());
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut frame = encode(&sample()).unwrap();
        frame[72] = 3; // value byte
        assert!(decode(&frame, CHAIN).is_err());
    }
}
