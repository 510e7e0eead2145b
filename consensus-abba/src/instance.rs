//! One binary-consensus instance.
//!
//! Each instance agrees on a single bit for one (block id, proposer index)
//! pair, running numbered rounds from 0:
//!
//! 1. **BV-broadcast** — broadcast the round estimate. Seeing a value from
//!    f+1 distinct nodes forces an echo of that value; seeing it from 2f+1
//!    admits it into `bin_values`.
//! 2. **AUX-broadcast** — once `bin_values` is non-empty, broadcast one of
//!    its members together with this node's coin share for the round.
//! 3. **Decide** — with 2f+1 AUX messages whose values all lie in
//!    `bin_values`, reveal the round coin from their shares. A single AUX
//!    value equal to the coin decides; a single value unequal to the coin
//!    becomes the next estimate; a split keeps the coin as the estimate.
//!
//! The instance is a pure state machine: methods consume already
//! authenticated messages and return messages to broadcast plus an
//! optional decision. The caller is responsible for delivering this node's
//! own broadcasts back into the instance, exactly as it delivers peer
//! messages.
//!
//! Messages for rounds the instance has not reached yet are buffered in
//! per-round state and evaluated when the round becomes current; the
//! transport's deferred queue bounds how far ahead they can run.

use {
    crate::traits::ConsensusCrypto,
    log::{debug, info, trace},
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::Arc,
    },
    strand_types::{MsgType, NodeIndex, ProtocolKey, ProtocolRound},
};

/// A protocol message this node must broadcast.
///
/// For AUX messages `sig_share` carries the round coin share; for
/// block-sign messages the block-signature share. BVB messages leave it
/// empty — the network router attaches the sender-authentication share
/// when it serializes the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMessage {
    pub key: ProtocolKey,
    pub msg_type: MsgType,
    pub round: ProtocolRound,
    pub value: u8,
    pub sig_share: String,
}

/// Decision notification reported to the parent aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildDecided {
    pub key: ProtocolKey,
    pub value: bool,
    pub round: ProtocolRound,
    pub elapsed_ms: u64,
}

/// Result of feeding one event into an instance.
#[derive(Debug, Default)]
pub struct InstanceOutput {
    pub messages: Vec<OutMessage>,
    pub decided: Option<ChildDecided>,
}

impl InstanceOutput {
    fn merge(&mut self, mut other: InstanceOutput) {
        self.messages.append(&mut other.messages);
        if other.decided.is_some() {
            self.decided = other.decided;
        }
    }
}

/// Per-round bookkeeping.
#[derive(Debug, Default)]
struct RoundState {
    /// Who BV-broadcast each value this round. Index 0 = value 0.
    bvb_received: [HashSet<NodeIndex>; 2],
    /// Values this node has itself BV-broadcast this round.
    bvb_sent: [bool; 2],
    /// Values admitted by 2f+1 BV-broadcasts.
    bin_values: [bool; 2],
    /// First AUX message per sender: value and coin share.
    aux_received: BTreeMap<NodeIndex, (bool, String)>,
    /// Whether this node has AUX-broadcast this round.
    aux_sent: bool,
}

/// Binary Byzantine agreement for one (block id, proposer index).
pub struct BinConsensusInstance {
    key: ProtocolKey,
    node_count: u64,
    crypto: Arc<dyn ConsensusCrypto + Send + Sync>,
    rounds: HashMap<ProtocolRound, RoundState>,
    current_round: ProtocolRound,
    /// Estimate entering the current round. None until started.
    estimate: Option<bool>,
    decided: Option<(bool, ProtocolRound)>,
    started_at_ms: u64,
}

impl BinConsensusInstance {
    pub fn new(
        key: ProtocolKey,
        node_count: u64,
        crypto: Arc<dyn ConsensusCrypto + Send + Sync>,
        now_ms: u64,
    ) -> Self {
        Self {
            key,
            node_count,
            crypto,
            rounds: HashMap::new(),
            current_round: 0,
            estimate: None,
            decided: None,
            started_at_ms: now_ms,
        }
    }

    /// Join the protocol with an initial estimate, BV-broadcasting it for
    /// round 0. No-op if already started.
    pub fn start(&mut self, estimate: bool, now_ms: u64) -> InstanceOutput {
        if self.estimate.is_some() || self.decided.is_some() {
            return InstanceOutput::default();
        }
        debug!("BIN_START: {}:EST:{}", self.key, estimate as u8);
        self.estimate = Some(estimate);
        let mut out = InstanceOutput::default();
        self.broadcast_bvb(self.current_round, estimate, &mut out);
        self.evaluate(now_ms, &mut out);
        out
    }

    pub fn is_started(&self) -> bool {
        self.estimate.is_some()
    }

    pub fn current_round(&self) -> ProtocolRound {
        self.current_round
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    pub fn decision(&self) -> Option<bool> {
        self.decided.map(|(v, _)| v)
    }

    /// Process a BV-broadcast from `src` (self included).
    pub fn on_bvb(
        &mut self,
        src: NodeIndex,
        round: ProtocolRound,
        value: bool,
        now_ms: u64,
    ) -> InstanceOutput {
        let mut out = InstanceOutput::default();
        if self.decided.is_some() {
            self.help_lagging_round(round, &mut out);
            return out;
        }
        trace!("BVB<: {}:R:{round}:V:{}:SRC:{src}", self.key, value as u8);
        self.round_state(round).bvb_received[value as usize].insert(src);
        self.evaluate(now_ms, &mut out);
        out
    }

    /// Process an AUX broadcast from `src` (self included). The coin share
    /// must verify for `src` before it counts toward any threshold.
    pub fn on_aux(
        &mut self,
        src: NodeIndex,
        round: ProtocolRound,
        value: bool,
        coin_share: &str,
        now_ms: u64,
    ) -> InstanceOutput {
        let mut out = InstanceOutput::default();
        if self.decided.is_some() {
            self.help_lagging_round(round, &mut out);
            return out;
        }
        if !self.crypto.verify_coin_share(src, coin_share, self.key, round) {
            debug!("AUX with bad coin share: {}:R:{round}:SRC:{src}", self.key);
            return out;
        }
        trace!("AUX<: {}:R:{round}:V:{}:SRC:{src}", self.key, value as u8);
        self.round_state(round)
            .aux_received
            .entry(src)
            .or_insert((value, coin_share.to_string()));
        self.evaluate(now_ms, &mut out);
        out
    }

    /// Termination support: a decided instance never changes its decision,
    /// but peers that saw a mixed AUX set keep running rounds and need
    /// 2f+1 participants to finish. Traffic for a round past the decision
    /// is answered with the decided value's BV and AUX broadcasts for that
    /// round, and the current round follows the laggard so the transport's
    /// one-round lookahead keeps delivering.
    fn help_lagging_round(&mut self, round: ProtocolRound, out: &mut InstanceOutput) {
        let Some((value, decided_round)) = self.decided else {
            return;
        };
        if round <= decided_round {
            return;
        }
        if round > self.current_round {
            self.current_round = round;
        }

        self.broadcast_bvb(round, value, out);
        let state = self.round_state(round);
        if !state.aux_sent {
            state.aux_sent = true;
            let share = self.crypto.sign_coin_share(self.key, round);
            trace!("AUX> (post-decide): {}:R:{round}:V:{}", self.key, value as u8);
            out.messages.push(OutMessage {
                key: self.key,
                msg_type: MsgType::AuxBroadcast,
                round,
                value: value as u8,
                sig_share: share,
            });
        }
    }

    // ── Round evaluation ────────────────────────────────────────────────

    /// Run the current round to a fixpoint: echoes, bin-value admission,
    /// AUX emission, and the decide/advance rule.
    fn evaluate(&mut self, now_ms: u64, out: &mut InstanceOutput) {
        if self.estimate.is_none() {
            return;
        }

        loop {
            if self.decided.is_some() {
                return;
            }
            let round = self.current_round;
            let quorum = strand_types::quorum_size(self.node_count) as usize;
            let faulty_plus_one = strand_types::max_faulty(self.node_count) as usize + 1;

            // Echo rule: f+1 distinct BV-broadcasts of v force our own.
            for value in [false, true] {
                let state = self.round_state(round);
                if state.bvb_received[value as usize].len() >= faulty_plus_one
                    && !state.bvb_sent[value as usize]
                {
                    self.broadcast_bvb(round, value, out);
                }
            }

            // Admission rule: 2f+1 distinct BV-broadcasts of v.
            let state = self.round_state(round);
            for value in [false, true] {
                if state.bvb_received[value as usize].len() >= quorum {
                    state.bin_values[value as usize] = true;
                }
            }

            // AUX once bin_values is non-empty.
            let state = self.round_state(round);
            if !state.aux_sent && (state.bin_values[0] || state.bin_values[1]) {
                // Prefer 1 when both are admitted.
                let aux_value = state.bin_values[1];
                state.aux_sent = true;
                let share = self.crypto.sign_coin_share(self.key, round);
                trace!("AUX>: {}:R:{round}:V:{}", self.key, aux_value as u8);
                out.messages.push(OutMessage {
                    key: self.key,
                    msg_type: MsgType::AuxBroadcast,
                    round,
                    value: aux_value as u8,
                    sig_share: share,
                });
            }

            // Decide rule: 2f+1 AUX messages with values inside bin_values.
            let state = self.round_state(round);
            let bin_values = state.bin_values;
            let eligible: Vec<(NodeIndex, bool, String)> = state
                .aux_received
                .iter()
                .filter(|(_, (v, _))| bin_values[*v as usize])
                .map(|(src, (v, share))| (*src, *v, share.clone()))
                .collect();
            if eligible.len() < quorum {
                return;
            }

            let has_zero = eligible.iter().any(|(_, v, _)| !*v);
            let has_one = eligible.iter().any(|(_, v, _)| *v);
            let shares: Vec<(NodeIndex, String)> = eligible
                .iter()
                .map(|(src, _, share)| (*src, share.clone()))
                .collect();
            let Some(coin) = self.crypto.combine_coin(self.key, round, &shares) else {
                debug!("coin not revealed yet: {}:R:{round}", self.key);
                return;
            };

            match (has_zero, has_one) {
                (true, true) => {
                    // Split vote: adopt the coin and move on.
                    self.advance_round(coin, out);
                }
                (false, true) => {
                    if coin {
                        self.decide(true, round, now_ms, out);
                        return;
                    }
                    self.advance_round(true, out);
                }
                (true, false) => {
                    if !coin {
                        self.decide(false, round, now_ms, out);
                        return;
                    }
                    self.advance_round(false, out);
                }
                (false, false) => return,
            }
            // Loop: buffered messages may already complete the new round.
        }
    }

    fn advance_round(&mut self, estimate: bool, out: &mut InstanceOutput) {
        self.current_round += 1;
        self.estimate = Some(estimate);
        debug!(
            "BIN_ROUND: {}:R:{}:EST:{}",
            self.key, self.current_round, estimate as u8
        );
        self.broadcast_bvb(self.current_round, estimate, out);
    }

    fn decide(&mut self, value: bool, round: ProtocolRound, now_ms: u64, out: &mut InstanceOutput) {
        info!(
            "BIN_DECIDE: {}:R:{round}:V:{}",
            self.key, value as u8
        );
        self.decided = Some((value, round));
        out.decided = Some(ChildDecided {
            key: self.key,
            value,
            round,
            elapsed_ms: now_ms.saturating_sub(self.started_at_ms),
        });
    }

    /// Queue a BVB broadcast for `value` and mark it sent. The caller's
    /// router loops our own copy back through [`on_bvb`](Self::on_bvb).
    fn broadcast_bvb(&mut self, round: ProtocolRound, value: bool, out: &mut InstanceOutput) {
        let state = self.round_state(round);
        if state.bvb_sent[value as usize] {
            return;
        }
        state.bvb_sent[value as usize] = true;
        trace!("BVB>: {}:R:{round}:V:{}", self.key, value as u8);
        out.messages.push(OutMessage {
            key: self.key,
            msg_type: MsgType::BvBroadcast,
            round,
            value: value as u8,
            sig_share: String::new(),
        });
    }

    fn round_state(&mut self, round: ProtocolRound) -> &mut RoundState {
        self.rounds.entry(round).or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::scripted, *};

    const KEY: ProtocolKey = ProtocolKey {
        block_id: 5,
        proposer_index: 2,
    };
    const N: u64 = 4;

    fn coin_true(_r: ProtocolRound) -> bool {
        true
    }

    fn coin_false(_r: ProtocolRound) -> bool {
        false
    }

    fn coin_odd(r: ProtocolRound) -> bool {
        r % 2 == 1
    }

    fn instance(coin: fn(ProtocolRound) -> bool) -> BinConsensusInstance {
        BinConsensusInstance::new(KEY, N, scripted(1, N, coin), 1_000)
    }

    fn share(src: NodeIndex) -> String {
        format!("coin:{src}")
    }

    /// Feed BVB value from peers 2..=n, then AUX from peers 2..=n.
    fn drive_round(
        inst: &mut BinConsensusInstance,
        round: ProtocolRound,
        value: bool,
        out: &mut InstanceOutput,
    ) {
        for src in 2..=N {
            out.merge(inst.on_bvb(src, round, value, 2_000));
        }
        // Self copies: the instance's own broadcasts loop back.
        out.merge(inst.on_bvb(1, round, value, 2_000));
        for src in 2..=N {
            out.merge(inst.on_aux(src, round, value, &share(src), 3_000));
        }
        out.merge(inst.on_aux(1, round, value, &share(1), 3_000));
    }

    #[test]
    fn test_start_broadcasts_estimate() {
        let mut inst = instance(coin_true);
        let out = inst.start(true, 1_000);
        assert_eq!(out.messages.len(), 1);
        let msg = &out.messages[0];
        assert_eq!(msg.msg_type, MsgType::BvBroadcast);
        assert_eq!(msg.round, 0);
        assert_eq!(msg.value, 1);
        assert!(!inst.is_decided());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut inst = instance(coin_true);
        inst.start(true, 1_000);
        assert!(inst.start(false, 1_000).messages.is_empty());
    }

    #[test]
    fn test_single_round_decide_when_coin_matches() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(true, 1_000);
        drive_round(&mut inst, 0, true, &mut out);

        assert!(inst.is_decided());
        assert_eq!(inst.decision(), Some(true));
        let decided = out.decided.expect("decision emitted");
        assert_eq!(decided.key, KEY);
        assert_eq!(decided.round, 0);
        assert!(decided.value);
        assert_eq!(decided.elapsed_ms, 2_000);

        // An AUX broadcast must have gone out before the decision.
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::AuxBroadcast && m.round == 0 && m.value == 1));
    }

    #[test]
    fn test_advances_round_when_coin_differs() {
        let mut inst = instance(coin_odd);
        let mut out = inst.start(true, 1_000);
        drive_round(&mut inst, 0, true, &mut out);

        // Round 0 coin is 0 but vals = {1}: carry the estimate to round 1.
        assert!(!inst.is_decided());
        assert_eq!(inst.current_round(), 1);
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::BvBroadcast && m.round == 1 && m.value == 1));

        // Round 1 coin is 1: decide.
        let mut out = InstanceOutput::default();
        drive_round(&mut inst, 1, true, &mut out);
        assert_eq!(inst.decision(), Some(true));
        assert_eq!(out.decided.unwrap().round, 1);
    }

    #[test]
    fn test_zero_decides_on_zero_coin() {
        let mut inst = instance(coin_false);
        let mut out = inst.start(false, 1_000);
        drive_round(&mut inst, 0, false, &mut out);
        assert_eq!(inst.decision(), Some(false));
    }

    #[test]
    fn test_split_vote_adopts_coin() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(false, 1_000);

        // Both values reach 2f+1 BV-broadcasts.
        for src in 2..=N {
            out.merge(inst.on_bvb(src, 0, true, 2_000));
            out.merge(inst.on_bvb(src, 0, false, 2_000));
        }
        out.merge(inst.on_bvb(1, 0, false, 2_000));
        out.merge(inst.on_bvb(1, 0, true, 2_000));

        // Split AUX: two zeros, two ones.
        out.merge(inst.on_aux(1, 0, false, &share(1), 3_000));
        out.merge(inst.on_aux(2, 0, false, &share(2), 3_000));
        out.merge(inst.on_aux(3, 0, true, &share(3), 3_000));
        out.merge(inst.on_aux(4, 0, true, &share(4), 3_000));

        // vals = {0,1}: no decision, estimate becomes the coin (1).
        assert!(!inst.is_decided());
        assert_eq!(inst.current_round(), 1);
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::BvBroadcast && m.round == 1 && m.value == 1));
    }

    #[test]
    fn test_echo_after_f_plus_one() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(false, 1_000);
        assert_eq!(out.messages.len(), 1);

        // f+1 = 2 peers broadcast 1: we must echo 1 despite estimating 0.
        out.merge(inst.on_bvb(2, 0, true, 2_000));
        assert!(!out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::BvBroadcast && m.value == 1));
        out.merge(inst.on_bvb(3, 0, true, 2_000));
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::BvBroadcast && m.round == 0 && m.value == 1));
    }

    #[test]
    fn test_no_aux_before_bin_values() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(true, 1_000);
        out.merge(inst.on_bvb(2, 0, true, 2_000));
        assert!(!out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::AuxBroadcast));
    }

    #[test]
    fn test_bad_coin_share_not_counted() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(true, 1_000);
        for src in 1..=N {
            out.merge(inst.on_bvb(src, 0, true, 2_000));
        }
        // Quorum of AUX messages, but one share is garbage.
        out.merge(inst.on_aux(1, 0, true, &share(1), 3_000));
        out.merge(inst.on_aux(2, 0, true, "bad", 3_000));
        out.merge(inst.on_aux(3, 0, true, &share(3), 3_000));
        assert!(!inst.is_decided());

        out.merge(inst.on_aux(4, 0, true, &share(4), 3_000));
        assert!(inst.is_decided());
    }

    #[test]
    fn test_duplicate_senders_do_not_fake_quorum() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(true, 1_000);
        for _ in 0..10 {
            out.merge(inst.on_bvb(2, 0, true, 2_000));
        }
        let state = &inst.rounds[&0];
        assert_eq!(state.bvb_received[1].len(), 1);
        assert!(!state.bin_values[1]);
    }

    #[test]
    fn test_decision_is_final_but_laggards_get_help() {
        let mut inst = instance(coin_true);
        let mut out = inst.start(true, 1_000);
        drive_round(&mut inst, 0, true, &mut out);
        assert!(inst.is_decided());
        assert_eq!(inst.decision(), Some(true));

        // Round-1 traffic after the decision: answered with the decided
        // value's BV and AUX for that round, decision unchanged.
        let out = inst.on_bvb(2, 1, false, 9_000);
        assert!(out.decided.is_none());
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::BvBroadcast && m.round == 1 && m.value == 1));
        assert!(out
            .messages
            .iter()
            .any(|m| m.msg_type == MsgType::AuxBroadcast && m.round == 1 && m.value == 1));
        assert_eq!(inst.decision(), Some(true));
        assert_eq!(inst.current_round(), 1);

        // No duplicates on repeated traffic for the same round.
        let out = inst.on_aux(2, 1, false, &share(2), 9_000);
        assert!(out.messages.is_empty());

        // Traffic at or below the decided round needs no answer.
        let out = inst.on_bvb(3, 0, false, 9_000);
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_future_round_messages_buffer_until_current() {
        let mut inst = instance(coin_odd);
        let mut out = inst.start(true, 1_000);

        // Deliver a full round-1 quorum before round 0 completes.
        for src in 2..=N {
            out.merge(inst.on_bvb(src, 1, true, 2_000));
            out.merge(inst.on_aux(src, 1, true, &share(src), 2_000));
        }
        assert_eq!(inst.current_round(), 0);
        assert!(!inst.is_decided());

        // Completing round 0 rolls straight through buffered round 1.
        drive_round(&mut inst, 0, true, &mut out);
        assert!(inst.is_decided());
        assert_eq!(out.decided.unwrap().round, 1);
    }
}
