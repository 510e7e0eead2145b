//! Per-block aggregation of the N binary-consensus instances.
//!
//! For block id B the aggregator runs one [`BinConsensusInstance`] per
//! proposer index. Instances whose proposer had a DA proof start with
//! estimate 1; proof-less slots stay unstarted at first. As instances
//! decide, their bits assemble into the decision vector; once every
//! position is known the committed proposer is the smallest index that
//! decided 1 (or the synthetic empty block when none did). The aggregator
//! then collects 2f+1 block-signature shares over the decided proposal
//! hash and reports the finalized signature upward.
//!
//! Liveness rule: as soon as f+1 positions are decided and at least one of
//! them is 1, the still-unstarted instances are seeded with estimate 0 —
//! a proposer whose DA proof never showed up here cannot stall the block.
//! The all-zero vector of the empty-block scenario has nothing to trigger
//! the rule with and starts every instance at 0 up front.

use {
    crate::{
        instance::{BinConsensusInstance, ChildDecided, InstanceOutput, OutMessage},
        traits::ConsensusCrypto,
    },
    log::{debug, info, warn},
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
    strand_types::{
        BlockHash, BlockId, BooleanProposalVector, MsgType, NetworkMessageEnvelope, NodeIndex,
        ProtocolKey, ProtocolRound,
    },
};

/// All N instances decided; the block needs its proposal resolved.
///
/// `proposer_index` 0 means the all-zero vector won and the canonical
/// empty block is committed for this height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposerDecided {
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
}

/// The finalization signature is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSigned {
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
    pub threshold_sig: String,
}

/// Result of feeding one event into the aggregator.
#[derive(Debug, Default)]
pub struct AggregatorOutput {
    /// Messages to broadcast (and loop back to this node).
    pub messages: Vec<OutMessage>,
    /// Set once, when the decision vector completes.
    pub proposer_decided: Option<ProposerDecided>,
    /// Set once, when 2f+1 block-signature shares combined.
    pub block_signed: Option<BlockSigned>,
}

impl AggregatorOutput {
    fn absorb_instance(&mut self, out: InstanceOutput) -> Option<ChildDecided> {
        self.messages.extend(out.messages);
        out.decided
    }
}

/// Drives block consensus for one block id.
pub struct BlockConsensusAggregator {
    block_id: BlockId,
    node_count: u64,
    crypto: Arc<dyn ConsensusCrypto + Send + Sync>,
    instances: HashMap<NodeIndex, BinConsensusInstance>,
    /// Decided bit per proposer index.
    decision_vector: BTreeMap<NodeIndex, bool>,
    /// DA vector, present once consensus started.
    proposal_vector: Option<BooleanProposalVector>,
    decided_proposer: Option<NodeIndex>,
    /// Hash of the decided proposal, supplied by the orchestrator once it
    /// holds (or synthesized) the proposal.
    decided_hash: Option<BlockHash>,
    /// Verified block-signature shares.
    sig_shares: Vec<(NodeIndex, String)>,
    /// Shares that arrived before the decided hash was known.
    pending_sig_shares: Vec<(NodeIndex, String)>,
    own_sig_sent: bool,
    finalized: bool,
    created_at_ms: u64,
}

impl BlockConsensusAggregator {
    pub fn new(
        block_id: BlockId,
        node_count: u64,
        crypto: Arc<dyn ConsensusCrypto + Send + Sync>,
        now_ms: u64,
    ) -> Self {
        Self {
            block_id,
            node_count,
            crypto,
            instances: HashMap::new(),
            decision_vector: BTreeMap::new(),
            proposal_vector: None,
            decided_proposer: None,
            decided_hash: None,
            sig_shares: Vec::new(),
            pending_sig_shares: Vec::new(),
            own_sig_sent: false,
            finalized: false,
            created_at_ms: now_ms,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn decided_proposer(&self) -> Option<NodeIndex> {
        self.decided_proposer
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Round the instance for `key` is in, for the transport's deferral
    /// policy. Unknown instances are at round 0.
    pub fn round_of(&self, key: ProtocolKey) -> ProtocolRound {
        self.instances
            .get(&key.proposer_index)
            .map(BinConsensusInstance::current_round)
            .unwrap_or(0)
    }

    /// Whether the instance for `key` has decided.
    pub fn is_decided(&self, key: ProtocolKey) -> bool {
        self.instances
            .get(&key.proposer_index)
            .map(BinConsensusInstance::is_decided)
            .unwrap_or(false)
    }

    /// Start consensus with the DA proposal vector.
    ///
    /// Instances whose proposer has a DA proof start with estimate 1.
    /// Proof-less slots are created but left unstarted; the liveness rule
    /// seeds them with 0 once f+1 instances have decided with at least
    /// one 1. DA-produced vectors always carry at least 2f+1 true entries; the
    /// one legitimate sparse input is the all-zero vector of the
    /// empty-block scenario, where nothing can trigger the rule and every
    /// instance starts at 0 immediately.
    pub fn start_consensus(
        &mut self,
        vector: &BooleanProposalVector,
        now_ms: u64,
    ) -> AggregatorOutput {
        let mut out = AggregatorOutput::default();
        if self.proposal_vector.is_some() {
            debug!("consensus already started for block {}", self.block_id);
            return out;
        }
        info!(
            "BIN_CONSENSUS_START: BID:{}:PROPOSING:{vector}",
            self.block_id
        );
        self.proposal_vector = Some(vector.clone());
        let any_available = vector.count_true() > 0;

        for proposer_index in 1..=self.node_count {
            let estimate = vector.get(proposer_index).unwrap_or(false);
            if !estimate && any_available {
                // Created so peer traffic buffers, but unstarted until
                // the f+1 rule seeds it.
                let _ = self.instance_entry(proposer_index, now_ms);
                continue;
            }
            let inst_out = self
                .instance_entry(proposer_index, now_ms)
                .start(estimate, now_ms);
            if let Some(decided) = out.absorb_instance(inst_out) {
                self.record_decision(decided, &mut out);
            }
        }
        out
    }

    /// Route a verified consensus message into the owning instance.
    pub fn route_and_process_message(
        &mut self,
        envelope: &NetworkMessageEnvelope,
        now_ms: u64,
    ) -> AggregatorOutput {
        let mut out = AggregatorOutput::default();
        let msg = &envelope.message;
        if msg.block_id != self.block_id {
            warn!(
                "message for block {} routed to aggregator {}",
                msg.block_id, self.block_id
            );
            return out;
        }

        match msg.msg_type {
            MsgType::BvBroadcast => {
                let key = msg.protocol_key();
                let value = msg.bin_value();
                let inst_out = self.instance_entry(key.proposer_index, now_ms).on_bvb(
                    envelope.src_index,
                    msg.round,
                    value,
                    now_ms,
                );
                if let Some(decided) = out.absorb_instance(inst_out) {
                    self.record_decision(decided, &mut out);
                }
            }
            MsgType::AuxBroadcast => {
                let key = msg.protocol_key();
                let value = msg.bin_value();
                let share = msg.sig_share.clone();
                let inst_out = self.instance_entry(key.proposer_index, now_ms).on_aux(
                    envelope.src_index,
                    msg.round,
                    value,
                    &share,
                    now_ms,
                );
                if let Some(decided) = out.absorb_instance(inst_out) {
                    self.record_decision(decided, &mut out);
                }
            }
            MsgType::BlockSignBroadcast => {
                self.on_block_sign_share(envelope.src_index, &msg.sig_share, &mut out);
            }
        }
        out
    }

    /// The orchestrator resolved the decided proposal (or synthesized the
    /// empty block): verify held shares, contribute our own, and try to
    /// combine.
    pub fn set_decided_proposal_hash(&mut self, hash: BlockHash) -> AggregatorOutput {
        let mut out = AggregatorOutput::default();
        let Some(proposer) = self.decided_proposer else {
            warn!(
                "decided hash supplied before proposer decided for block {}",
                self.block_id
            );
            return out;
        };
        if self.decided_hash.is_some() {
            return out;
        }
        self.decided_hash = Some(hash);

        for (src, share) in std::mem::take(&mut self.pending_sig_shares) {
            self.admit_sig_share(src, &share);
        }

        if !self.own_sig_sent {
            self.own_sig_sent = true;
            let share = self.crypto.sign_block_share(self.block_id, proposer, &hash);
            self.admit_sig_share(self.crypto.node_index(), &share);
            out.messages.push(OutMessage {
                key: ProtocolKey::new(self.block_id, proposer),
                msg_type: MsgType::BlockSignBroadcast,
                round: 0,
                value: 1,
                sig_share: share,
            });
        }

        self.try_combine_block_sig(&mut out);
        out
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn instance_entry(&mut self, proposer_index: NodeIndex, now_ms: u64) -> &mut BinConsensusInstance {
        let key = ProtocolKey::new(self.block_id, proposer_index);
        let node_count = self.node_count;
        let crypto = self.crypto.clone();
        self.instances
            .entry(proposer_index)
            .or_insert_with(|| BinConsensusInstance::new(key, node_count, crypto, now_ms))
    }

    fn record_decision(&mut self, decided: ChildDecided, out: &mut AggregatorOutput) {
        let index = decided.key.proposer_index;
        if self.decision_vector.contains_key(&index) {
            return;
        }
        info!(
            "CHILD_DECIDED: BID:{}:PRP:{index}:V:{}:R:{}:T:{}ms",
            self.block_id, decided.value as u8, decided.round, decided.elapsed_ms
        );
        self.decision_vector.insert(index, decided.value);

        self.force_zero_estimates(out);

        if self.decision_vector.len() as u64 == self.node_count {
            self.select_proposer(out);
        }
    }

    /// Liveness rule: f+1 decisions with at least one 1 seed every
    /// still-unstarted instance with estimate 0.
    fn force_zero_estimates(&mut self, out: &mut AggregatorOutput) {
        let threshold = strand_types::max_faulty(self.node_count) + 1;
        if (self.decision_vector.len() as u64) < threshold {
            return;
        }
        if !self.decision_vector.values().any(|v| *v) {
            return;
        }

        let mut decisions = Vec::new();
        for proposer_index in 1..=self.node_count {
            let now_ms = self.created_at_ms;
            let block_id = self.block_id;
            let inst = self.instance_entry(proposer_index, now_ms);
            if inst.is_started() {
                continue;
            }
            debug!(
                "forcing zero estimate: BID:{}:PRP:{proposer_index}",
                block_id
            );
            let inst_out = inst.start(false, now_ms);
            if let Some(decided) = out.absorb_instance(inst_out) {
                decisions.push(decided);
            }
        }
        for decided in decisions {
            self.record_decision(decided, out);
        }
    }

    fn select_proposer(&mut self, out: &mut AggregatorOutput) {
        if self.decided_proposer.is_some() {
            return;
        }
        // Smallest index that decided 1; 0 when the vector is all zeros.
        let winner = self
            .decision_vector
            .iter()
            .find(|(_, v)| **v)
            .map(|(i, _)| *i)
            .unwrap_or(0);
        let vector: String = (1..=self.node_count)
            .map(|i| {
                if self.decision_vector.get(&i).copied().unwrap_or(false) {
                    '1'
                } else {
                    '0'
                }
            })
            .collect();
        info!(
            "BLOCK_DECIDED: BID:{}:PRPSR:{winner}:VECTOR:{vector}",
            self.block_id
        );
        self.decided_proposer = Some(winner);
        out.proposer_decided = Some(ProposerDecided {
            block_id: self.block_id,
            proposer_index: winner,
        });
    }

    fn on_block_sign_share(&mut self, src: NodeIndex, share: &str, out: &mut AggregatorOutput) {
        if self.finalized {
            return;
        }
        if self.decided_hash.is_some() {
            self.admit_sig_share(src, share);
            self.try_combine_block_sig(out);
        } else {
            // Cannot verify until the decided hash is known; hold on to it.
            self.pending_sig_shares.push((src, share.to_string()));
        }
    }

    fn admit_sig_share(&mut self, src: NodeIndex, share: &str) {
        let (Some(proposer), Some(hash)) = (self.decided_proposer, self.decided_hash) else {
            return;
        };
        if self.sig_shares.iter().any(|(s, _)| *s == src) {
            return;
        }
        if !self
            .crypto
            .verify_block_share(src, share, self.block_id, proposer, &hash)
        {
            warn!(
                "bad block-signature share: BID:{}:SRC:{src}",
                self.block_id
            );
            return;
        }
        self.sig_shares.push((src, share.to_string()));
    }

    fn try_combine_block_sig(&mut self, out: &mut AggregatorOutput) {
        if self.finalized {
            return;
        }
        let (Some(proposer), Some(hash)) = (self.decided_proposer, self.decided_hash) else {
            return;
        };
        if self.sig_shares.len() < self.crypto.required_shares() {
            return;
        }
        let Some(sig) = self
            .crypto
            .combine_block_sig(self.block_id, proposer, &hash, &self.sig_shares)
        else {
            return;
        };
        info!("BLOCK_SIGNED: BID:{}:PRPSR:{proposer}", self.block_id);
        self.finalized = true;
        out.block_signed = Some(BlockSigned {
            block_id: self.block_id,
            proposer_index: proposer,
            threshold_sig: sig,
        });
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::instance::test_support::scripted,
        std::net::Ipv4Addr,
        strand_types::NetworkMessage,
    };

    const N: u64 = 4;
    const BLOCK: BlockId = 5;

    fn coin_true(_r: ProtocolRound) -> bool {
        true
    }

    fn coin_odd(r: ProtocolRound) -> bool {
        r % 2 == 1
    }

    struct Cluster {
        nodes: Vec<BlockConsensusAggregator>,
    }

    impl Cluster {
        fn new(coin: fn(ProtocolRound) -> bool) -> Self {
            let nodes = (1..=N)
                .map(|i| BlockConsensusAggregator::new(BLOCK, N, scripted(i, N, coin), 1_000))
                .collect();
            Self { nodes }
        }

        /// Deliver `out` messages from node `src` (1-based) to every node,
        /// the sender included, collecting all resulting outputs.
        fn relay(&mut self, src: NodeIndex, out: AggregatorOutput, pending: &mut Vec<(NodeIndex, AggregatorOutput)>) {
            for msg in out.messages {
                for dst in 1..=N as usize {
                    let envelope = NetworkMessageEnvelope::new(
                        NetworkMessage {
                            chain_id: 11,
                            block_id: msg.key.block_id,
                            proposer_index: msg.key.proposer_index,
                            msg_type: msg.msg_type,
                            msg_id: 0,
                            src_node_id: src,
                            dst_node_id: dst as u64,
                            round: msg.round,
                            value: msg.value,
                            src_ip: Ipv4Addr::LOCALHOST,
                            sig_share: msg.sig_share.clone(),
                        },
                        src,
                    );
                    let dst_out =
                        self.nodes[dst - 1].route_and_process_message(&envelope, 2_000);
                    pending.push((dst as u64, dst_out));
                }
            }
        }

        /// Start all nodes with `vector` and pump messages to quiescence.
        fn run(&mut self, vector: &BooleanProposalVector, skip: &[NodeIndex]) {
            let mut pending: Vec<(NodeIndex, AggregatorOutput)> = Vec::new();
            for i in 1..=N {
                if skip.contains(&i) {
                    continue;
                }
                let out = self.nodes[i as usize - 1].start_consensus(vector, 1_000);
                pending.push((i, out));
            }
            self.pump(&mut pending, skip);
        }

        fn pump(
            &mut self,
            pending: &mut Vec<(NodeIndex, AggregatorOutput)>,
            skip: &[NodeIndex],
        ) {
            let mut budget = 100_000;
            while let Some((src, out)) = pending.pop() {
                budget -= 1;
                assert!(budget > 0, "message relay did not quiesce");
                if skip.contains(&src) {
                    continue;
                }
                // Surface proposer decisions: hand each node the decided
                // hash, as the orchestrator would.
                if let Some(decided) = out.proposer_decided {
                    let hash = strand_types::hashing::hashv(&[
                        b"proposal",
                        &decided.proposer_index.to_le_bytes(),
                    ]);
                    let sig_out = self.nodes[src as usize - 1].set_decided_proposal_hash(hash);
                    pending.push((src, sig_out));
                }
                self.relay(src, out, pending);
            }
        }

        fn alive<'a>(
            &'a self,
            skip: &'a [NodeIndex],
        ) -> impl Iterator<Item = &'a BlockConsensusAggregator> + 'a {
            self.nodes.iter().enumerate().filter_map(move |(i, n)| {
                let index = i as u64 + 1;
                (!skip.contains(&index)).then_some(n)
            })
        }
    }

    #[test]
    fn test_happy_path_selects_lowest_proposer() {
        let mut cluster = Cluster::new(coin_true);
        let vector = BooleanProposalVector::from_values(vec![true; N as usize]);
        cluster.run(&vector, &[]);

        for node in &cluster.nodes {
            assert_eq!(node.decided_proposer(), Some(1));
            assert!(node.is_finalized());
        }
    }

    #[test]
    fn test_partial_vector_skips_missing_proposer() {
        let mut cluster = Cluster::new(coin_odd);
        // Proposer 1 has no DA proof; 2 is the lowest with one.
        let vector = BooleanProposalVector::from_values(vec![false, true, true, true]);
        cluster.run(&vector, &[]);

        for node in &cluster.nodes {
            assert_eq!(node.decided_proposer(), Some(2));
            assert!(node.is_finalized());
        }
    }

    #[test]
    fn test_all_zero_vector_selects_empty_block() {
        let mut cluster = Cluster::new(coin_odd);
        let vector = BooleanProposalVector::from_values(vec![false; N as usize]);
        cluster.run(&vector, &[]);

        for node in &cluster.nodes {
            assert_eq!(node.decided_proposer(), Some(0));
            assert!(node.is_finalized());
        }
    }

    #[test]
    fn test_crashed_node_resolves_to_zero() {
        let mut cluster = Cluster::new(coin_odd);
        // Node 3 is down: nobody saw its proposal, and it neither sends
        // nor receives.
        let vector = BooleanProposalVector::from_values(vec![true, true, false, true]);
        cluster.run(&vector, &[3]);

        for node in cluster.alive(&[3]) {
            assert_eq!(node.decided_proposer(), Some(1));
            assert!(node.is_finalized());
            assert_eq!(node.decision_vector.get(&3), Some(&false));
        }
    }

    fn envelope(
        src: NodeIndex,
        proposer: NodeIndex,
        msg_type: MsgType,
        round: ProtocolRound,
        value: u8,
        share: &str,
    ) -> NetworkMessageEnvelope {
        NetworkMessageEnvelope::new(
            NetworkMessage {
                chain_id: 11,
                block_id: BLOCK,
                proposer_index: proposer,
                msg_type,
                msg_id: 0,
                src_node_id: src,
                dst_node_id: 0,
                round,
                value,
                src_ip: Ipv4Addr::LOCALHOST,
                sig_share: share.into(),
            },
            src,
        )
    }

    #[test]
    fn test_proof_less_slots_start_unstarted() {
        let mut agg = BlockConsensusAggregator::new(BLOCK, N, scripted(1, N, coin_true), 1_000);
        let vector = BooleanProposalVector::from_values(vec![false, true, true, true]);
        let out = agg.start_consensus(&vector, 1_000);

        // Round-0 broadcasts go out for the slots with proofs only.
        assert!(!out.messages.iter().any(|m| m.key.proposer_index == 1));
        for proposer in 2..=N {
            assert!(out
                .messages
                .iter()
                .any(|m| m.key.proposer_index == proposer && m.value == 1));
        }
    }

    #[test]
    fn test_force_zero_seeds_unstarted_slots() {
        let mut agg = BlockConsensusAggregator::new(BLOCK, N, scripted(1, N, coin_true), 1_000);
        let vector = BooleanProposalVector::from_values(vec![false, true, true, true]);
        agg.start_consensus(&vector, 1_000);

        // Decide slots 2 and 3 by replaying the full quorum traffic,
        // this node's own loopback copies included.
        let mut emitted = Vec::new();
        for proposer in [2u64, 3] {
            for src in 1..=N {
                let out = agg.route_and_process_message(
                    &envelope(src, proposer, MsgType::BvBroadcast, 0, 1, ""),
                    2_000,
                );
                emitted.extend(out.messages);
            }
            for src in 1..=N {
                let out = agg.route_and_process_message(
                    &envelope(src, proposer, MsgType::AuxBroadcast, 0, 1, &format!("coin:{src}")),
                    2_000,
                );
                emitted.extend(out.messages);
            }
        }
        assert!(agg.is_decided(ProtocolKey::new(BLOCK, 2)));
        assert!(agg.is_decided(ProtocolKey::new(BLOCK, 3)));

        // f+1 decisions with at least one 1: slot 1 was seeded 0 and its
        // round-0 BV-broadcast went out.
        assert!(emitted
            .iter()
            .any(|m| m.key.proposer_index == 1
                && m.msg_type == MsgType::BvBroadcast
                && m.round == 0
                && m.value == 0));
        assert!(!agg.is_decided(ProtocolKey::new(BLOCK, 1)));
    }

    #[test]
    fn test_round_and_decided_exposed_for_deferral() {
        let agg = BlockConsensusAggregator::new(BLOCK, N, scripted(1, N, coin_true), 1_000);
        let key = ProtocolKey::new(BLOCK, 2);
        assert_eq!(agg.round_of(key), 0);
        assert!(!agg.is_decided(key));
    }

    #[test]
    fn test_sig_shares_held_until_hash_known() {
        let mut cluster = Cluster::new(coin_true);
        let vector = BooleanProposalVector::from_values(vec![true; N as usize]);

        // Drive node 1 manually so its hash arrives late.
        let mut pending = Vec::new();
        for i in 2..=N {
            let out = cluster.nodes[i as usize - 1].start_consensus(&vector, 1_000);
            pending.push((i, out));
        }
        let out = cluster.nodes[0].start_consensus(&vector, 1_000);
        pending.push((1, out));

        // Pump without ever answering node 1's proposer_decided.
        let mut budget = 100_000;
        let mut node1_decided = None;
        while let Some((src, out)) = pending.pop() {
            budget -= 1;
            assert!(budget > 0);
            if let Some(decided) = out.proposer_decided {
                if src == 1 {
                    node1_decided = Some(decided);
                } else {
                    let hash = strand_types::hashing::hashv(&[
                        b"proposal",
                        &decided.proposer_index.to_le_bytes(),
                    ]);
                    let sig_out =
                        cluster.nodes[src as usize - 1].set_decided_proposal_hash(hash);
                    pending.push((src, sig_out));
                }
            }
            cluster.relay(src, out, &mut pending);
        }

        let decided = node1_decided.expect("node 1 decided the proposer");
        assert!(!cluster.nodes[0].is_finalized());
        assert!(!cluster.nodes[0].pending_sig_shares.is_empty());

        // Late hash: held shares verify and the signature completes.
        let hash = strand_types::hashing::hashv(&[
            b"proposal",
            &decided.proposer_index.to_le_bytes(),
        ]);
        let out = cluster.nodes[0].set_decided_proposal_hash(hash);
        assert!(out.block_signed.is_some());
        assert!(cluster.nodes[0].is_finalized());
    }
}
