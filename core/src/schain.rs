//! The chain orchestrator.
//!
//! `Schain` is the single writer of chain state: the last committed block
//! id and timestamps, the per-block consensus aggregators, and the commit
//! pipeline. Every mutation happens on the orchestrator's message thread
//! (plus the bootstrap call before that thread starts); the networking
//! threads interact through channels, the storage-backed sink, and the
//! read-only [`ConsensusView`].
//!
//! The commit path is strictly sequential: block N+1 is persisted, handed
//! to the execution layer with its gas price, and only then does the node
//! propose for block N+2. Catch-up batches run through the same path one
//! block at a time.

use {
    crate::{
        config::ChainConfig,
        da::{DaProofStore, DaShareCollector},
        execution::ExecutionClient,
        pending_queue::PendingTransactionsAgent,
        pricing::PricingAgent,
        storage::{required, ChainStorage},
    },
    crossbeam_channel::Sender,
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        net::Ipv4Addr,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        time::{SystemTime, UNIX_EPOCH},
    },
    strand_consensus_abba::{
        AggregatorOutput, BlockConsensusAggregator, BlockSigned, ConsensusCrypto, OutMessage,
        ProposerDecided,
    },
    strand_consensus_net::{ConsensusView, DaShare, NodeTable, ProposalSink},
    strand_crypto::CryptoManager,
    strand_monitoring::Metrics,
    strand_types::{
        BlockId, BlockProposal, CommittedBlock, CommittedBlockList, ConsensusError, DAProof,
        MsgType, NetworkMessage, NetworkMessageEnvelope, NodeIndex, ProtocolKey, Result,
    },
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Outbound seams ──────────────────────────────────────────────────────
//
// The orchestrator only sees these three traits; production wires them to
// the UDP transport, the proposal pusher, and the finalize downloader,
// while the simulation harness substitutes an in-process relay.

/// Consensus datagram broadcast.
pub trait ConsensusBroadcast: Send + Sync {
    fn broadcast(&self, msg: NetworkMessage) -> Result<()>;
}

impl ConsensusBroadcast for strand_consensus_net::ConsensusTransport {
    fn broadcast(&self, msg: NetworkMessage) -> Result<()> {
        self.broadcast_message(msg)
    }
}

/// Proposal and DA-proof distribution.
pub trait ProposalPublisher: Send + Sync {
    fn publish_proposal(&self, proposal: BlockProposal);
    fn publish_proof(&self, proof: DAProof);
}

impl ProposalPublisher for strand_consensus_net::ProposalClient {
    fn publish_proposal(&self, proposal: BlockProposal) {
        self.enqueue_proposal(proposal);
    }

    fn publish_proof(&self, proof: DAProof) {
        self.enqueue_proof(proof);
    }
}

/// Fetching a decided proposal this node does not hold.
pub trait ProposalFetcher: Send + Sync {
    /// Blocks until fetched, cancelled, or shutdown. `Ok(None)` =
    /// cancelled (the block arrived some other way).
    fn fetch(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<(BlockProposal, DAProof)>>;
}

impl ProposalFetcher for strand_consensus_net::BlockFinalizeDownloader {
    fn fetch(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<(BlockProposal, DAProof)>> {
        self.download(block_id, proposer_index, cancelled)
    }
}

// ── State ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ChainState {
    last_committed_block_id: BlockId,
    last_committed_ts_sec: u64,
    last_committed_ts_ms: u32,
    last_commit_time_ms: u64,
    state_root: u64,
    total_transactions: u64,
    bootstrapped: bool,
}

/// The per-chain orchestrator.
pub struct Schain {
    config: ChainConfig,
    table: Arc<NodeTable>,
    node_index: NodeIndex,
    self_ip: Ipv4Addr,
    crypto: Arc<CryptoManager>,
    storage: ChainStorage,
    view: Arc<ConsensusView>,
    pending: Arc<PendingTransactionsAgent>,
    pricing: PricingAgent,
    executor: Arc<dyn ExecutionClient>,
    broadcast: Arc<dyn ConsensusBroadcast>,
    publisher: Arc<dyn ProposalPublisher>,
    fetcher: Arc<dyn ProposalFetcher>,
    da_collector: DaShareCollector,
    da_proofs: DaProofStore,
    aggregators: Mutex<HashMap<BlockId, BlockConsensusAggregator>>,
    state: Mutex<ChainState>,
    metrics: Arc<Metrics>,
    exit: Arc<AtomicBool>,
    msg_id_seq: AtomicU64,
}

impl Schain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainConfig,
        table: Arc<NodeTable>,
        crypto: Arc<CryptoManager>,
        storage: ChainStorage,
        view: Arc<ConsensusView>,
        pending: Arc<PendingTransactionsAgent>,
        executor: Arc<dyn ExecutionClient>,
        broadcast: Arc<dyn ConsensusBroadcast>,
        publisher: Arc<dyn ProposalPublisher>,
        fetcher: Arc<dyn ProposalFetcher>,
        metrics: Arc<Metrics>,
        exit: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let node_index = table
            .index_of_node_id(config.node_id)
            .ok_or_else(|| {
                ConsensusError::EngineInit(format!(
                    "chain {} does not include node id {}",
                    config.chain_id, config.node_id
                ))
            })?;
        let self_ip = table
            .get(node_index)
            .map(|n| n.ip)
            .ok_or_else(|| ConsensusError::EngineInit("node table inconsistent".into()))?;
        let pricing = PricingAgent::new(config.pricing.clone(), storage.clone());

        Ok(Arc::new(Self {
            config,
            table,
            node_index,
            self_ip,
            crypto,
            storage,
            view,
            pending,
            pricing,
            executor,
            broadcast,
            publisher,
            fetcher,
            da_collector: DaShareCollector::new(),
            da_proofs: DaProofStore::new(),
            aggregators: Mutex::new(HashMap::new()),
            state: Mutex::new(ChainState::default()),
            metrics,
            exit,
            msg_id_seq: AtomicU64::new(1),
        }))
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn chain_id(&self) -> strand_types::ChainId {
        self.config.chain_id
    }

    pub fn last_committed_block_id(&self) -> BlockId {
        self.state.lock().last_committed_block_id
    }

    pub fn last_committed_timestamp(&self) -> (u64, u32) {
        let state = self.state.lock();
        (state.last_committed_ts_sec, state.last_committed_ts_ms)
    }

    pub fn total_transactions(&self) -> u64 {
        self.state.lock().total_transactions
    }

    pub fn pending(&self) -> &Arc<PendingTransactionsAgent> {
        &self.pending
    }

    pub fn storage(&self) -> &ChainStorage {
        &self.storage
    }

    /// The embedder reports the execution layer's state root here; it is
    /// passed through on subsequent hand-offs.
    pub fn set_state_root(&self, state_root: u64) {
        self.state.lock().state_root = state_root;
    }

    fn check_for_exit(&self) -> Result<()> {
        if self.exit.load(Ordering::Relaxed) {
            return Err(ConsensusError::ExitRequested);
        }
        Ok(())
    }

    // ── Bootstrap ───────────────────────────────────────────────────────

    /// Jump-start the chain from the embedder's last committed block.
    ///
    /// Reconciles a storage tip one ahead of the caller (the snapshot was
    /// taken just before a block was handed to execution), proposes for
    /// the next height, and replays the outgoing messages recorded for it.
    pub fn bootstrap(
        &self,
        last_committed_block_id: BlockId,
        last_committed_ts_sec: u64,
        last_committed_ts_ms: u32,
    ) -> Result<()> {
        self.check_for_exit()?;

        let mut tip = last_committed_block_id;
        let mut ts_sec = last_committed_ts_sec;
        let mut ts_ms = last_committed_ts_ms;

        let stored = self.storage.last_committed_block_id();
        info!("bootstrap: caller at {tip}, storage at {stored}");

        if stored == tip + 1 {
            match self.storage.block(stored) {
                Ok(Some(block)) => {
                    let price = self.pricing.read_price(stored.saturating_sub(1));
                    let state_root = self.state.lock().state_root;
                    self.executor.create_block(
                        block.proposal().transactions(),
                        block.timestamp_sec(),
                        block.timestamp_ms(),
                        block.block_id(),
                        price,
                        state_root,
                    );
                    tip = stored;
                    ts_sec = block.timestamp_sec();
                    ts_ms = block.timestamp_ms();
                }
                _ => {
                    // Corrupt or missing in the snapshot; catch-up will
                    // pull it from peers instead.
                    warn!("bootstrap could not read block {stored} from storage");
                }
            }
        } else {
            if stored < tip {
                return Err(ConsensusError::Fatal(format!(
                    "storage tip {stored} is behind the caller's {tip}"
                )));
            }
            if stored > tip + 1 {
                return Err(ConsensusError::Fatal(format!(
                    "storage tip {stored} is more than one ahead of the caller's {tip}"
                )));
            }
        }

        {
            let mut state = self.state.lock();
            if state.bootstrapped {
                return Err(ConsensusError::Fatal("bootstrap called twice".into()));
            }
            state.bootstrapped = true;
            state.last_committed_block_id = tip;
            state.last_committed_ts_sec = ts_sec;
            state.last_committed_ts_ms = ts_ms;
            state.last_commit_time_ms = now_ms();
        }
        self.view.publish_committed(tip);
        self.metrics.last_committed_block.set(tip);
        info!("jump starting the chain from block {tip}");

        self.propose_next_block(ts_sec, ts_ms)?;

        // Replay the in-flight height recorded before the restart.
        let next = tip + 1;
        if let Some(vector) = self.storage.proposal_vector(next)? {
            for msg in self.storage.outgoing_messages(next)? {
                self.broadcast.broadcast(msg)?;
            }
            self.start_consensus(next, vector)?;
        }
        Ok(())
    }

    // ── Proposal flow ───────────────────────────────────────────────────

    /// Build (or reuse) this node's proposal for the next height, record
    /// its hash, push it to peers, and self-submit the first DA share.
    pub fn propose_next_block(
        &self,
        prev_timestamp_sec: u64,
        prev_timestamp_ms: u32,
    ) -> Result<()> {
        self.check_for_exit()?;
        let block_id = self.last_committed_block_id() + 1;

        let proposal = if self.storage.have_proposal_hash(block_id, self.node_index)? {
            required(
                self.storage.proposal(block_id, self.node_index)?,
                "own proposal",
            )?
        } else {
            let mut proposal = self.pending.build_block_proposal(
                block_id,
                prev_timestamp_sec,
                prev_timestamp_ms,
            )?;
            // The proposer's signature doubles as its own DA share.
            proposal.set_signature(self.crypto.sign_da_share(proposal.hash()));
            proposal
        };

        debug!("proposing block {block_id}");
        self.storage.save_proposal(&proposal)?;
        if !self
            .storage
            .check_and_save_hash(block_id, self.node_index, &proposal.hash_hex())?
        {
            return Err(ConsensusError::invalid_state(
                "propose_next_block",
                ConsensusError::InvalidArgument(
                    "conflicting proposal hash already recorded for this node".into(),
                ),
            ));
        }

        self.publisher.publish_proposal(proposal.clone());

        let Some(signature) = proposal.signature() else {
            return Err(ConsensusError::invalid_state(
                "propose_next_block",
                ConsensusError::InvalidArgument("own proposal is unsigned".into()),
            ));
        };
        self.da_share_arrived(DaShare {
            block_id,
            proposer_index: self.node_index,
            proposal_hash: *proposal.hash(),
            signer: self.node_index,
            share_hex: signature.to_string(),
        })
    }

    /// A DA share came back from a peer (or from this node itself). When
    /// the quorum completes, the proof starts its own distribution round
    /// and feeds the local DA store.
    pub fn da_share_arrived(&self, share: DaShare) -> Result<()> {
        if share.block_id <= self.last_committed_block_id() {
            return Ok(());
        }
        if let Some(proof) = self.da_collector.add_share(share, &self.crypto) {
            self.publisher.publish_proof(proof.clone());
            self.da_proof_arrived(proof)?;
        }
        Ok(())
    }

    /// A completed DA proof is known. If it completes the height's DA
    /// set, persist the proposal vector and start consensus.
    pub fn da_proof_arrived(&self, proof: DAProof) -> Result<()> {
        if proof.block_id <= self.last_committed_block_id() {
            return Ok(());
        }
        self.crypto
            .verify_da_proof(&proof.proposal_hash, &proof.threshold_sig)
            .map_err(ConsensusError::from)?;

        if let Some(vector) = self.da_proofs.add_proof(proof.clone(), self.table.node_count()) {
            self.storage.save_proposal_vector(proof.block_id, &vector)?;
            self.start_consensus(proof.block_id, vector)?;
        }
        Ok(())
    }

    /// Launch the binary-consensus instances for a block.
    pub fn start_consensus(
        &self,
        block_id: BlockId,
        vector: strand_types::BooleanProposalVector,
    ) -> Result<()> {
        self.check_for_exit()?;
        let current = self.last_committed_block_id() + 1;
        if block_id < current {
            debug!("too late to start consensus for {block_id}: already committed");
            return Ok(());
        }
        if block_id > current {
            debug!("consensus for {block_id} is in the future, current is {current}");
            return Ok(());
        }
        self.pump(block_id, |agg| agg.start_consensus(&vector, now_ms()))
    }

    // ── Message routing ─────────────────────────────────────────────────

    /// Route one verified network envelope into its block's aggregator.
    pub fn handle_network_envelope(&self, envelope: NetworkMessageEnvelope) -> Result<()> {
        self.check_for_exit()?;
        let msg = &envelope.message;
        if msg.block_id <= self.last_committed_block_id() {
            return Ok(());
        }

        // BVB messages authenticate with a share over their header; AUX
        // and block-sign shares are checked against their purpose inside
        // the aggregator.
        if msg.msg_type == MsgType::BvBroadcast {
            self.crypto
                .verify_network_message(msg, envelope.src_index)
                .map_err(ConsensusError::from)?;
        }

        self.pump(envelope.block_id(), |agg| {
            agg.route_and_process_message(&envelope, now_ms())
        })
    }

    /// Run one aggregator interaction to quiescence: broadcast every
    /// produced message, loop this node's own copies back, and surface
    /// the decision notifications afterwards.
    fn pump<F>(&self, block_id: BlockId, seed: F) -> Result<()>
    where
        F: FnOnce(&mut BlockConsensusAggregator) -> AggregatorOutput,
    {
        let mut proposer_decided: Option<ProposerDecided> = None;
        let mut block_signed: Option<BlockSigned> = None;

        {
            let mut aggregators = self.aggregators.lock();
            let aggregator = aggregators.entry(block_id).or_insert_with(|| {
                BlockConsensusAggregator::new(
                    block_id,
                    self.table.node_count(),
                    self.crypto.clone() as Arc<dyn ConsensusCrypto + Send + Sync>,
                    now_ms(),
                )
            });

            let mut out = seed(aggregator);
            let mut queue: std::collections::VecDeque<OutMessage> =
                out.messages.drain(..).collect();
            proposer_decided = proposer_decided.or(out.proposer_decided);
            block_signed = block_signed.or(out.block_signed.take());

            while let Some(out_msg) = queue.pop_front() {
                self.check_for_exit()?;
                let net_msg = self.to_network_message(out_msg);
                self.broadcast.broadcast(net_msg.clone())?;

                let envelope = NetworkMessageEnvelope::new(net_msg, self.node_index);
                let mut out = aggregator.route_and_process_message(&envelope, now_ms());
                queue.extend(out.messages.drain(..));
                proposer_decided = proposer_decided.or(out.proposer_decided);
                block_signed = block_signed.or(out.block_signed.take());
            }

            for proposer in 1..=self.table.node_count() {
                let key = ProtocolKey::new(block_id, proposer);
                self.view
                    .publish_instance(key, aggregator.round_of(key), aggregator.is_decided(key));
            }
        }

        if let Some(decided) = proposer_decided {
            self.proposer_decided(decided)?;
        }
        if let Some(signed) = block_signed {
            self.finalize_decided_and_signed_block(signed)?;
        }
        Ok(())
    }

    fn to_network_message(&self, out: OutMessage) -> NetworkMessage {
        let mut msg = NetworkMessage {
            chain_id: self.config.chain_id,
            block_id: out.key.block_id,
            proposer_index: out.key.proposer_index,
            msg_type: out.msg_type,
            msg_id: self.msg_id_seq.fetch_add(1, Ordering::Relaxed),
            src_node_id: self.config.node_id,
            dst_node_id: 0,
            round: out.round,
            value: out.value,
            src_ip: self.self_ip,
            sig_share: out.sig_share,
        };
        if msg.msg_type == MsgType::BvBroadcast {
            self.crypto.sign_network_message(&mut msg);
        }
        msg
    }

    // ── Decision and commit path ────────────────────────────────────────

    /// All N instances decided: resolve the winning proposal (local
    /// store, synthesized empty block, or finalize download) and give the
    /// aggregator the hash to collect block signatures over.
    fn proposer_decided(&self, decided: ProposerDecided) -> Result<()> {
        let block_id = decided.block_id;
        if block_id <= self.last_committed_block_id() {
            info!(
                "ignoring old block decide for {block_id}: already got it through catch-up"
            );
            return Ok(());
        }

        let hash = if decided.proposer_index == 0 {
            let (sec, ms) = self.last_committed_timestamp();
            *BlockProposal::empty(self.config.chain_id, block_id, sec, ms).hash()
        } else {
            let local = self.storage.proposal(block_id, decided.proposer_index)?;
            // Trust the local copy only when the DA proof covers exactly
            // its hash; an equivocating proposer may have DA-proven a
            // different payload than the one it pushed here.
            let trusted = !self.config.finalization_download_only
                && match (&local, self.da_proofs.proof(block_id, decided.proposer_index)) {
                    (Some(proposal), Some(proof)) => proof.proposal_hash == *proposal.hash(),
                    _ => false,
                };

            match (trusted, local) {
                (true, Some(proposal)) => *proposal.hash(),
                _ => {
                    // Only 2f+1 nodes are guaranteed to hold the
                    // proposal; pull it with its DA proof from them.
                    let cancelled = || {
                        self.view.last_committed_block_id() >= block_id
                            || self.exit.load(Ordering::Relaxed)
                    };
                    match self.fetcher.fetch(
                        block_id,
                        decided.proposer_index,
                        &cancelled,
                    )? {
                        Some((proposal, proof)) => {
                            let hash = *proposal.hash();
                            self.storage.save_proposal(&proposal)?;
                            let _ = self.da_proofs.add_proof(proof, self.table.node_count());
                            hash
                        }
                        None => {
                            debug!("finalize download for {block_id} cancelled");
                            return Ok(());
                        }
                    }
                }
            }
        };

        self.pump(block_id, |agg| agg.set_decided_proposal_hash(hash))
    }

    /// The finalization signature is complete: assemble the committed
    /// block, run the commit pipeline, and propose for the next height.
    pub fn finalize_decided_and_signed_block(&self, signed: BlockSigned) -> Result<()> {
        let block_id = signed.block_id;
        if block_id <= self.last_committed_block_id() {
            info!("ignoring old block signature for {block_id}");
            return Ok(());
        }
        info!("BLOCK_SIGNED: finalizing block {block_id}");

        let proposal = if signed.proposer_index == 0 {
            let (sec, ms) = self.last_committed_timestamp();
            BlockProposal::empty(self.config.chain_id, block_id, sec, ms)
        } else {
            required(
                self.storage.proposal(block_id, signed.proposer_index)?,
                "decided proposal",
            )?
        };

        let block = CommittedBlock::new(proposal, signed.threshold_sig);
        let (sec, ms) = (block.timestamp_sec(), block.timestamp_ms());
        self.process_committed_block(&block)?;
        self.propose_next_block(sec, ms)
    }

    /// Persist, execute, and advance. The caller guarantees the block is
    /// exactly one past the committed tip.
    pub fn process_committed_block(&self, block: &CommittedBlock) -> Result<()> {
        self.check_for_exit()?;
        let transactions = block.proposal().transactions();

        {
            let mut state = self.state.lock();
            if block.block_id() != state.last_committed_block_id + 1 {
                return Err(ConsensusError::invalid_state(
                    "process_committed_block",
                    ConsensusError::InvalidArgument(format!(
                        "block {} does not follow committed tip {}",
                        block.block_id(),
                        state.last_committed_block_id
                    )),
                ));
            }

            state.total_transactions += transactions.len() as u64;
            info!(
                "BLOCK_COMMIT: PRPSR:{}:BID:{}:HASH:{}:TXS:{}:TOTAL:{}:KNWN:{}",
                block.proposer_index(),
                block.block_id(),
                &block.proposal().hash_hex()[..8],
                transactions.len(),
                state.total_transactions,
                self.pending.known_transactions_size(),
            );

            self.storage.save_block(block)?;

            self.pricing
                .calculate_price(block.block_id(), transactions.len())?;
            let gas_price = self.pricing.read_price(block.block_id().saturating_sub(1));
            self.executor.create_block(
                transactions,
                block.timestamp_sec(),
                block.timestamp_ms(),
                block.block_id(),
                gas_price,
                state.state_root,
            );
            self.check_for_exit()?;

            let commit_time = now_ms();
            self.metrics
                .block_finality_ms
                .observe(commit_time.saturating_sub(state.last_commit_time_ms));
            state.last_committed_block_id = block.block_id();
            state.last_committed_ts_sec = block.timestamp_sec();
            state.last_committed_ts_ms = block.timestamp_ms();
            state.last_commit_time_ms = commit_time;
        }

        let committed = block.block_id();
        self.view.publish_committed(committed);
        self.pending.remove_committed(transactions);
        self.da_collector.prune(committed);
        self.da_proofs.prune(committed);
        self.aggregators
            .lock()
            .retain(|block_id, _| *block_id > committed);

        self.metrics.blocks_committed.add(1);
        self.metrics
            .transactions_committed
            .add(transactions.len() as u64);
        self.metrics.last_committed_block.set(committed);
        Ok(())
    }

    /// Ingest a validated catch-up batch: commit everything past the tip
    /// in order, then propose for the next height.
    pub fn block_commits_arrived_through_catchup(
        &self,
        batch: CommittedBlockList,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let before = self.last_committed_block_id();
        let mut last_ts: Option<(u64, u32)> = None;

        for block in batch.blocks() {
            if block.block_id() <= self.last_committed_block_id() {
                continue;
            }
            self.process_committed_block(block)?;
            self.metrics.catchup_blocks.add(1);
            last_ts = Some((block.timestamp_sec(), block.timestamp_ms()));
        }

        if let Some((sec, ms)) = last_ts {
            info!(
                "BLOCK_CATCHUP: {} blocks applied",
                self.last_committed_block_id() - before
            );
            self.propose_next_block(sec, ms)?;
        }
        Ok(())
    }
}

// ── The storage-backed proposal sink ────────────────────────────────────

/// Server-side entry points of the proposal channel. Runs on the accept
/// pool threads; everything it touches is internally synchronized.
pub struct SchainSink {
    schain: Arc<Schain>,
    proof_tx: Sender<DAProof>,
}

impl SchainSink {
    pub fn new(schain: Arc<Schain>, proof_tx: Sender<DAProof>) -> Self {
        Self { schain, proof_tx }
    }
}

impl ProposalSink for SchainSink {
    fn proposal_pushed(&self, proposal: BlockProposal) -> Result<String> {
        let schain = &self.schain;
        if proposal.chain_id() != schain.config.chain_id {
            return Err(ConsensusError::InvalidChain {
                got: proposal.chain_id(),
                local: schain.config.chain_id,
            });
        }
        if proposal.block_id() <= schain.view.last_committed_block_id() {
            return Err(ConsensusError::InvalidArgument(format!(
                "stale proposal for block {}",
                proposal.block_id()
            )));
        }
        let index = proposal.proposer_index();
        let expected_node = schain
            .table
            .get(index)
            .ok_or_else(|| {
                ConsensusError::InvalidMessageFormat(format!("unknown proposer index {index}"))
            })?
            .node_id;
        if proposal.proposer_node_id() != expected_node {
            return Err(ConsensusError::InvalidMessageFormat(format!(
                "proposer index {index} does not belong to node {}",
                proposal.proposer_node_id()
            )));
        }
        let Some(signature) = proposal.signature() else {
            return Err(ConsensusError::InvalidMessageFormat(
                "unsigned proposal".into(),
            ));
        };
        schain
            .crypto
            .verify_da_share(index, signature, proposal.hash())
            .map_err(ConsensusError::from)?;

        // At most one proposal per (height, proposer): a second, different
        // hash is an equivocation attempt and is refused.
        if !schain
            .storage
            .check_and_save_hash(proposal.block_id(), index, &proposal.hash_hex())?
        {
            return Err(ConsensusError::NetworkProtocol(format!(
                "conflicting proposal for block {} from proposer {index}",
                proposal.block_id()
            )));
        }
        schain.storage.save_proposal(&proposal)?;
        debug!(
            "stored pushed proposal {}:{index}",
            proposal.block_id()
        );

        Ok(schain.crypto.sign_da_share(proposal.hash()))
    }

    fn da_proof_arrived(&self, proof: DAProof) -> Result<()> {
        self.proof_tx
            .send(proof)
            .map_err(|_| ConsensusError::InvalidArgument("orchestrator queue closed".into()))
    }

    fn fetch_proposal(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
    ) -> Option<(Vec<u8>, DAProof)> {
        let proposal = self.schain.storage.proposal(block_id, proposer_index).ok()??;
        let proof = self.schain.da_proofs.proof(block_id, proposer_index)?;
        Some((proposal.serialize().ok()?, proof))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            execution::testing::RecordingExecution,
            execution::ExecutionClient,
            pending_queue::PendingQueueConfig,
            storage::MemStorage,
        },
        std::net::Ipv4Addr,
        strand_consensus_net::NodeInfo,
        strand_crypto::{generate_key_sets, KeySet},
        strand_types::{Transaction, TransactionList},
    };

    const CHAIN: u64 = 11;

    struct NoopBroadcast;

    impl ConsensusBroadcast for NoopBroadcast {
        fn broadcast(&self, _msg: NetworkMessage) -> Result<()> {
            Ok(())
        }
    }

    struct NoopPublisher;

    impl ProposalPublisher for NoopPublisher {
        fn publish_proposal(&self, _proposal: BlockProposal) {}
        fn publish_proof(&self, _proof: DAProof) {}
    }

    struct NoFetcher;

    impl ProposalFetcher for NoFetcher {
        fn fetch(
            &self,
            _block_id: BlockId,
            _proposer_index: NodeIndex,
            _cancelled: &dyn Fn() -> bool,
        ) -> Result<Option<(BlockProposal, DAProof)>> {
            Ok(None)
        }
    }

    /// Records hand-offs and flips the exit flag after a block budget, to
    /// unwind the synchronous single-node pipeline.
    struct StopAfter {
        inner: RecordingExecution,
        exit: Arc<AtomicBool>,
        limit: usize,
    }

    impl ExecutionClient for StopAfter {
        fn create_block(
            &self,
            transactions: &TransactionList,
            timestamp_sec: u64,
            timestamp_ms: u32,
            block_id: BlockId,
            gas_price: u64,
            state_root: u64,
        ) {
            self.inner.create_block(
                transactions,
                timestamp_sec,
                timestamp_ms,
                block_id,
                gas_price,
                state_root,
            );
            if self.inner.blocks.lock().len() >= self.limit {
                self.exit.store(true, Ordering::Relaxed);
            }
        }
    }

    fn build_schain(
        node_count: u64,
        executor: Arc<dyn ExecutionClient>,
        exit: Arc<AtomicBool>,
    ) -> Arc<Schain> {
        let nodes: Vec<NodeInfo> = (1..=node_count)
            .map(|i| NodeInfo::new(1000 + i, i, Ipv4Addr::new(10, 0, 0, i as u8), 26000))
            .collect();
        let mut config = ChainConfig::new(CHAIN, 1001, nodes.clone());
        config.pending = PendingQueueConfig {
            empty_block_interval_ms: 10,
            ..PendingQueueConfig::default()
        };
        let table = Arc::new(NodeTable::new(CHAIN, nodes).unwrap());

        let (pk_set, mut shares) = generate_key_sets(node_count, 99);
        let keys = KeySet::new(1, shares.remove(0), pk_set).unwrap();
        let crypto = Arc::new(CryptoManager::new(CHAIN, node_count, keys).unwrap());

        let storage = ChainStorage::new(Arc::new(MemStorage::new()));
        let view = Arc::new(ConsensusView::new(0));
        let pending = Arc::new(PendingTransactionsAgent::new(
            CHAIN,
            1,
            1001,
            config.pending.clone(),
            Arc::clone(&exit),
        ));

        Schain::new(
            config,
            table,
            crypto,
            storage,
            view,
            pending,
            executor,
            Arc::new(NoopBroadcast),
            Arc::new(NoopPublisher),
            Arc::new(NoFetcher),
            Arc::new(Metrics::new()),
            exit,
        )
        .unwrap()
    }

    fn committed(block_id: BlockId, txs: Vec<&[u8]>) -> CommittedBlock {
        let list = TransactionList::new(
            txs.into_iter()
                .map(|t| Transaction::new(t.to_vec()).unwrap())
                .collect(),
        );
        let proposal = BlockProposal::new(
            CHAIN,
            block_id,
            2,
            1002,
            1_700_000_000 + block_id,
            0,
            list,
        )
        .unwrap();
        CommittedBlock::new(proposal, "sig".into())
    }

    #[test]
    fn test_single_node_chain_commits_blocks() {
        let exit = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(StopAfter {
            inner: RecordingExecution::default(),
            exit: Arc::clone(&exit),
            limit: 3,
        });
        let schain = build_schain(1, Arc::clone(&recorder) as Arc<dyn ExecutionClient>, exit);

        schain.pending().push_transaction(b"tx-one".to_vec()).unwrap();

        // With one node the whole pipeline runs synchronously inside
        // bootstrap until the executor trips the exit flag.
        let err = schain.bootstrap(0, 1_700_000_000, 0).unwrap_err();
        assert!(err.is_exit_requested());

        let blocks = recorder.inner.blocks.lock();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].block_id, 1);
        assert_eq!(blocks[0].transaction_count, 1);
        assert_eq!(blocks[1].block_id, 2);
        assert_eq!(blocks[2].block_id, 3);
        // Monotone timestamps across commits.
        for pair in blocks.windows(2) {
            assert!(
                (pair[1].timestamp_sec, pair[1].timestamp_ms)
                    > (pair[0].timestamp_sec, pair[0].timestamp_ms)
            );
        }
        drop(blocks);

        // The exit fired between handing block 3 to execution and
        // advancing the tip, so the chain state sits one behind storage —
        // exactly the snapshot scenario bootstrap reconciles.
        assert_eq!(schain.last_committed_block_id(), 2);
        assert_eq!(schain.storage().last_committed_block_id(), 3);
        assert_eq!(schain.total_transactions(), 1);
    }

    #[test]
    fn test_catchup_jump_applies_batch_and_proposes() {
        let exit = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(RecordingExecution::default());
        let schain = build_schain(4, Arc::clone(&recorder) as Arc<dyn ExecutionClient>, exit);

        schain.bootstrap(0, 1_600_000_000, 0).unwrap();

        let blocks: Vec<CommittedBlock> = (1..=10).map(|id| committed(id, vec![])).collect();
        let batch = CommittedBlockList::new(blocks).unwrap();
        schain.block_commits_arrived_through_catchup(batch).unwrap();

        assert_eq!(schain.last_committed_block_id(), 10);
        assert_eq!(recorder.blocks.lock().len(), 10);
        assert_eq!(
            schain.last_committed_timestamp(),
            (1_700_000_010, 0),
            "timestamps follow block 10"
        );
        // proposeNextBlock ran once for height 11.
        let own = schain.storage().proposal(11, 1).unwrap().expect("proposal for 11");
        assert!(
            (own.timestamp_sec(), own.timestamp_ms()) > (1_700_000_010, 0),
            "next proposal is strictly after block 10"
        );
    }

    #[test]
    fn test_catchup_skips_already_committed_blocks() {
        let exit = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(RecordingExecution::default());
        let schain = build_schain(4, Arc::clone(&recorder) as Arc<dyn ExecutionClient>, exit);

        schain.bootstrap(0, 1_600_000_000, 0).unwrap();
        let batch =
            CommittedBlockList::new((1..=5).map(|id| committed(id, vec![])).collect()).unwrap();
        schain.block_commits_arrived_through_catchup(batch).unwrap();

        // An overlapping batch only applies the new tail.
        let batch =
            CommittedBlockList::new((3..=8).map(|id| committed(id, vec![])).collect()).unwrap();
        schain.block_commits_arrived_through_catchup(batch).unwrap();
        assert_eq!(schain.last_committed_block_id(), 8);
        assert_eq!(recorder.blocks.lock().len(), 8);
    }

    #[test]
    fn test_commit_rejects_gap() {
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );
        schain.bootstrap(0, 1_600_000_000, 0).unwrap();

        let err = schain.process_committed_block(&committed(5, vec![])).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidState { .. }));
    }

    #[test]
    fn test_empty_block_finalization() {
        let exit = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(RecordingExecution::default());
        let schain = build_schain(4, Arc::clone(&recorder) as Arc<dyn ExecutionClient>, exit);
        schain.bootstrap(0, 1_600_000_000, 500).unwrap();

        schain
            .finalize_decided_and_signed_block(BlockSigned {
                block_id: 1,
                proposer_index: 0,
                threshold_sig: "combined".into(),
            })
            .unwrap();

        assert_eq!(schain.last_committed_block_id(), 1);
        let blocks = recorder.blocks.lock();
        assert_eq!(blocks[0].transaction_count, 0);
        assert_eq!(
            (blocks[0].timestamp_sec, blocks[0].timestamp_ms),
            (1_600_000_000, 501),
            "empty block is one millisecond after its predecessor"
        );
    }

    #[test]
    fn test_bootstrap_reconciles_storage_ahead_by_one() {
        let exit = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(RecordingExecution::default());
        let schain = build_schain(4, Arc::clone(&recorder) as Arc<dyn ExecutionClient>, exit);

        // The snapshot scenario: storage already holds block 1.
        schain.storage().save_block(&committed(1, vec![b"t"])).unwrap();
        schain.bootstrap(0, 1_600_000_000, 0).unwrap();

        assert_eq!(schain.last_committed_block_id(), 1);
        let blocks = recorder.blocks.lock();
        assert_eq!(blocks.len(), 1, "the stored block was pushed to execution");
        assert_eq!(blocks[0].block_id, 1);
    }

    #[test]
    fn test_bootstrap_fatal_on_storage_mismatch() {
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );

        // Storage behind the caller is unrecoverable.
        let err = schain.bootstrap(5, 1_600_000_000, 0).unwrap_err();
        assert!(matches!(err, ConsensusError::Fatal(_)));

        // Storage more than one ahead is too.
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );
        for id in 1..=3 {
            schain.storage().save_block(&committed(id, vec![])).unwrap();
        }
        let err = schain.bootstrap(1, 1_600_000_000, 0).unwrap_err();
        assert!(matches!(err, ConsensusError::Fatal(_)));
    }

    #[test]
    fn test_own_proposal_reused_after_restart_of_height() {
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );
        schain.bootstrap(0, 1_600_000_000, 0).unwrap();
        let first = schain.storage().proposal(1, 1).unwrap().unwrap();

        // Proposing again for the same height must reuse the stored
        // proposal rather than minting a second hash.
        schain.propose_next_block(1_600_000_000, 0).unwrap();
        let second = schain.storage().proposal(1, 1).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_da_proof_rejected() {
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );
        schain.bootstrap(0, 1_600_000_000, 0).unwrap();

        let proof = DAProof::new(1, 2, strand_types::hashing::hashv(&[b"p"]), "abcd".into());
        assert!(schain.da_proof_arrived(proof).is_err());
    }

    #[test]
    fn test_unauthenticated_bvb_rejected() {
        let exit = Arc::new(AtomicBool::new(false));
        let schain = build_schain(
            4,
            Arc::new(RecordingExecution::default()) as Arc<dyn ExecutionClient>,
            exit,
        );
        schain.bootstrap(0, 1_600_000_000, 0).unwrap();

        let msg = NetworkMessage {
            chain_id: CHAIN,
            block_id: 1,
            proposer_index: 2,
            msg_type: MsgType::BvBroadcast,
            msg_id: 1,
            src_node_id: 1002,
            dst_node_id: 1001,
            round: 0,
            value: 1,
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            sig_share: "deadbeef".into(),
        };
        let err = schain
            .handle_network_envelope(NetworkMessageEnvelope::new(msg, 2))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::NetworkProtocol(_)));
    }
}
