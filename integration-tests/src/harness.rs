//! Strand test harness: an N-node chain over a simulated network.
//!
//! Each node runs a real [`Schain`] with real threshold keys and
//! in-memory storage; only the wire is simulated. Outbound consensus
//! datagrams, DA shares, and DA proofs land in one shared event queue the
//! test drains deterministically on a single thread, so every scenario is
//! reproducible and needs no sockets, no sleeps, no ports.
//!
//! Crashed nodes are modeled by marking them down: nothing is delivered
//! to or accepted from them.

use {
    crossbeam_channel::{unbounded, Receiver, Sender},
    parking_lot::Mutex,
    std::{
        collections::{HashSet, VecDeque},
        net::Ipv4Addr,
        sync::{atomic::AtomicBool, Arc},
    },
    strand_core::{
        execution::testing::RecordingExecution, ChainConfig, ChainStorage, ConsensusBroadcast,
        MemStorage, PendingQueueConfig, PendingTransactionsAgent, ProposalFetcher,
        ProposalPublisher, Schain, SchainSink,
    },
    strand_consensus_net::{
        ConsensusView, DaShare, NodeInfo, NodeTable, ProposalSink,
    },
    strand_crypto::{generate_key_sets, CryptoManager, KeySet},
    strand_monitoring::Metrics,
    strand_types::{
        BlockId, BlockProposal, DAProof, NetworkMessage, NetworkMessageEnvelope, NodeIndex,
        Result,
    },
};

/// The chain id every harness chain runs under.
pub const CHAIN_ID: u64 = 11;

/// Base timestamp the chains bootstrap from.
pub const GENESIS_TS_SEC: u64 = 1_700_000_000;

/// One simulated delivery.
enum SimEvent {
    Net {
        dst: NodeIndex,
        envelope: NetworkMessageEnvelope,
    },
    Share {
        dst: NodeIndex,
        share: DaShare,
    },
    Proof {
        dst: NodeIndex,
        proof: DAProof,
    },
}

/// Shared wire state: the event queue, the sinks, and the down set.
struct SimNet {
    node_count: u64,
    queue: Mutex<VecDeque<SimEvent>>,
    sinks: Mutex<Vec<Option<Arc<SchainSink>>>>,
    down: Mutex<HashSet<NodeIndex>>,
}

impl SimNet {
    fn is_down(&self, index: NodeIndex) -> bool {
        self.down.lock().contains(&index)
    }

    fn push(&self, event: SimEvent) {
        self.queue.lock().push_back(event);
    }
}

struct SimBroadcast {
    net: Arc<SimNet>,
    src: NodeIndex,
}

impl ConsensusBroadcast for SimBroadcast {
    fn broadcast(&self, msg: NetworkMessage) -> Result<()> {
        if self.net.is_down(self.src) {
            return Ok(());
        }
        for dst in 1..=self.net.node_count {
            if dst == self.src || self.net.is_down(dst) {
                continue;
            }
            self.net.push(SimEvent::Net {
                dst,
                envelope: NetworkMessageEnvelope::new(msg.clone(), self.src),
            });
        }
        Ok(())
    }
}

struct SimPublisher {
    net: Arc<SimNet>,
    src: NodeIndex,
}

impl ProposalPublisher for SimPublisher {
    fn publish_proposal(&self, proposal: BlockProposal) {
        if self.net.is_down(self.src) {
            return;
        }
        let sinks = self.net.sinks.lock().clone();
        for (slot, sink) in sinks.iter().enumerate() {
            let dst = slot as u64 + 1;
            if dst == self.src || self.net.is_down(dst) {
                continue;
            }
            let Some(sink) = sink else { continue };
            match sink.proposal_pushed(proposal.clone()) {
                Ok(share_hex) => {
                    // The peer's DA share travels back to the proposer.
                    self.net.push(SimEvent::Share {
                        dst: self.src,
                        share: DaShare {
                            block_id: proposal.block_id(),
                            proposer_index: proposal.proposer_index(),
                            proposal_hash: *proposal.hash(),
                            signer: dst,
                            share_hex,
                        },
                    });
                }
                Err(e) => log::debug!("sim push to {dst} refused: {e}"),
            }
        }
    }

    fn publish_proof(&self, proof: DAProof) {
        if self.net.is_down(self.src) {
            return;
        }
        for dst in 1..=self.net.node_count {
            if dst == self.src || self.net.is_down(dst) {
                continue;
            }
            self.net.push(SimEvent::Proof {
                dst,
                proof: proof.clone(),
            });
        }
    }
}

struct SimFetcher {
    net: Arc<SimNet>,
    src: NodeIndex,
}

impl ProposalFetcher for SimFetcher {
    fn fetch(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        _cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<(BlockProposal, DAProof)>> {
        let sinks = self.net.sinks.lock().clone();
        for (slot, sink) in sinks.iter().enumerate() {
            let dst = slot as u64 + 1;
            if dst == self.src || self.net.is_down(dst) {
                continue;
            }
            let Some(sink) = sink else { continue };
            if let Some((bytes, proof)) = sink.fetch_proposal(block_id, proposer_index) {
                if let Ok(proposal) = BlockProposal::deserialize(&bytes) {
                    return Ok(Some((proposal, proof)));
                }
            }
        }
        Ok(None)
    }
}

/// One simulated validator.
pub struct SimNode {
    pub index: NodeIndex,
    pub schain: Arc<Schain>,
    pub executor: Arc<RecordingExecution>,
    pub exit: Arc<AtomicBool>,
    proof_rx: Receiver<DAProof>,
}

/// An N-node chain over the simulated wire.
pub struct TestChain {
    pub nodes: Vec<SimNode>,
    net: Arc<SimNet>,
}

impl TestChain {
    /// Build `node_count` wired nodes with freshly dealt threshold keys.
    pub fn new(node_count: u64) -> Self {
        Self::with_seed(node_count, 7)
    }

    pub fn with_seed(node_count: u64, seed: u64) -> Self {
        let net = Arc::new(SimNet {
            node_count,
            queue: Mutex::new(VecDeque::new()),
            sinks: Mutex::new(vec![None; node_count as usize]),
            down: Mutex::new(HashSet::new()),
        });

        let table_nodes: Vec<NodeInfo> = (1..=node_count)
            .map(|i| NodeInfo::new(1000 + i, i, Ipv4Addr::new(10, 0, 0, i as u8), 26000))
            .collect();
        let (pk_set, shares) = generate_key_sets(node_count, seed);

        let mut nodes = Vec::with_capacity(node_count as usize);
        for (i, share) in shares.into_iter().enumerate() {
            let index = i as u64 + 1;
            let node_id = 1000 + index;
            let mut config = ChainConfig::new(CHAIN_ID, node_id, table_nodes.clone());
            config.pending = PendingQueueConfig {
                empty_block_interval_ms: 10,
                ..PendingQueueConfig::default()
            };

            let table = Arc::new(NodeTable::new(CHAIN_ID, table_nodes.clone()).unwrap());
            let keys = KeySet::new(index, share, pk_set.clone()).unwrap();
            let crypto = Arc::new(CryptoManager::new(CHAIN_ID, node_count, keys).unwrap());
            let exit = Arc::new(AtomicBool::new(false));
            let storage = ChainStorage::new(Arc::new(MemStorage::new()));
            let view = Arc::new(ConsensusView::new(0));
            let pending = Arc::new(PendingTransactionsAgent::new(
                CHAIN_ID,
                index,
                node_id,
                config.pending.clone(),
                Arc::clone(&exit),
            ));
            let executor = Arc::new(RecordingExecution::default());

            let schain = Schain::new(
                config,
                table,
                crypto,
                storage,
                view,
                pending,
                executor.clone(),
                Arc::new(SimBroadcast {
                    net: Arc::clone(&net),
                    src: index,
                }),
                Arc::new(SimPublisher {
                    net: Arc::clone(&net),
                    src: index,
                }),
                Arc::new(SimFetcher {
                    net: Arc::clone(&net),
                    src: index,
                }),
                Arc::new(Metrics::new()),
                Arc::clone(&exit),
            )
            .unwrap();

            let (proof_tx, proof_rx): (Sender<DAProof>, Receiver<DAProof>) = unbounded();
            let sink = Arc::new(SchainSink::new(Arc::clone(&schain), proof_tx));
            net.sinks.lock()[i] = Some(sink);

            nodes.push(SimNode {
                index,
                schain,
                executor,
                exit,
                proof_rx,
            });
        }

        Self { nodes, net }
    }

    pub fn node(&self, index: NodeIndex) -> &SimNode {
        &self.nodes[(index - 1) as usize]
    }

    /// Mark a node crashed before it ever participates.
    pub fn crash(&self, index: NodeIndex) {
        self.net.down.lock().insert(index);
    }

    fn is_down(&self, index: NodeIndex) -> bool {
        self.net.is_down(index)
    }

    /// Bootstrap every live node from genesis.
    pub fn bootstrap_all(&self) {
        for node in &self.nodes {
            if self.is_down(node.index) {
                continue;
            }
            node.schain.bootstrap(0, GENESIS_TS_SEC, 0).unwrap();
        }
    }

    /// Deliver queued events until every live node has committed
    /// `target_block`, panicking if the network quiesces or the step
    /// budget runs out first.
    pub fn run_until_committed(&self, target_block: BlockId) {
        let mut budget: u64 = 500_000;
        loop {
            assert!(budget > 0, "step budget exhausted before block {target_block}");
            budget -= 1;

            let mut progressed = self.drain_proof_channels();

            let event = self.net.queue.lock().pop_front();
            if let Some(event) = event {
                progressed = true;
                self.deliver(event);
            }

            if self
                .live_nodes()
                .all(|n| n.schain.last_committed_block_id() >= target_block)
            {
                return;
            }

            if !progressed {
                panic!(
                    "network quiesced before block {target_block}: committed {:?}",
                    self.nodes
                        .iter()
                        .map(|n| n.schain.last_committed_block_id())
                        .collect::<Vec<_>>()
                );
            }
        }
    }

    /// Live nodes, in index order.
    pub fn live_nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter().filter(|n| !self.is_down(n.index))
    }

    fn drain_proof_channels(&self) -> bool {
        let mut any = false;
        for node in &self.nodes {
            if self.is_down(node.index) {
                continue;
            }
            while let Ok(proof) = node.proof_rx.try_recv() {
                any = true;
                if let Err(e) = node.schain.da_proof_arrived(proof) {
                    log::debug!("node {} rejected proof: {e}", node.index);
                }
            }
        }
        any
    }

    fn deliver(&self, event: SimEvent) {
        match event {
            SimEvent::Net { dst, envelope } => {
                if self.is_down(dst) {
                    return;
                }
                if let Err(e) = self.node(dst).schain.handle_network_envelope(envelope) {
                    log::debug!("node {dst} dropped message: {e}");
                }
            }
            SimEvent::Share { dst, share } => {
                if self.is_down(dst) {
                    return;
                }
                self.node(dst).schain.da_share_arrived(share).unwrap();
            }
            SimEvent::Proof { dst, proof } => {
                if self.is_down(dst) {
                    return;
                }
                if let Err(e) = self.node(dst).schain.da_proof_arrived(proof) {
                    log::debug!("node {dst} rejected proof: {e}");
                }
            }
        }
    }
}
