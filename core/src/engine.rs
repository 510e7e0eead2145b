//! Node assembly and lifecycle.
//!
//! [`ConsensusNode`] owns every subsystem of one validator: storage,
//! crypto, the UDP transport, the proposal and catch-up servers and
//! clients, the orchestrator, and the long-lived threads that drive them.
//! Ownership is rooted here; the subsystems reference each other only
//! through channels, trait objects, and the shared read-only view.
//!
//! Lifecycle: `start` binds sockets and spawns threads, `health_check`
//! waits for 2/3 of the peers to become reachable (the embedder maps a
//! failure to process exit code 110), `bootstrap` jump-starts the chain
//! from the embedder's tip, and `shutdown` flips the exit flag and joins
//! every thread.

use {
    crate::{
        config::ChainConfig,
        execution::ExecutionClient,
        pending_queue::PendingTransactionsAgent,
        schain::{
            now_ms, ConsensusBroadcast, ProposalFetcher, ProposalPublisher, Schain, SchainSink,
        },
        storage::{ChainStorage, KeyValueStorage},
    },
    crossbeam_channel::{unbounded, Receiver},
    log::{info, warn},
    rayon::prelude::*,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Duration,
    },
    strand_consensus_net::{
        proposal, BatchValidator, BlockFinalizeDownloader, BlockSource, CatchupClient,
        CatchupServer, ConsensusTransport, ConsensusView, DaShare, MessageStore, NodeTable,
        ProofChecker, ProposalClient, ProposalServer, ProposalSink,
    },
    strand_crypto::{CryptoManager, KeySet, SigVerifyPool},
    strand_monitoring::Metrics,
    strand_types::{
        quorum_size, CommittedBlock, CommittedBlockList, ConsensusError,
        NetworkMessageEnvelope, DAProof, Result,
    },
};

/// Process exit code the embedder uses when the health check fails.
pub const HEALTH_CHECK_EXIT_CODE: i32 = 110;

/// One running consensus validator.
pub struct ConsensusNode {
    config: ChainConfig,
    table: Arc<NodeTable>,
    schain: Arc<Schain>,
    transport: Arc<ConsensusTransport>,
    metrics: Arc<Metrics>,
    exit: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ConsensusNode {
    /// Bind sockets, wire the subsystems, and spawn every long-lived
    /// thread. The node is idle until [`bootstrap`](Self::bootstrap).
    pub fn start(
        config: ChainConfig,
        keys: KeySet,
        backend: Arc<dyn KeyValueStorage>,
        executor: Arc<dyn ExecutionClient>,
    ) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(NodeTable::new(config.chain_id, config.nodes.clone())?);
        let node_index = table.index_of_node_id(config.node_id).ok_or_else(|| {
            ConsensusError::EngineInit(format!(
                "node id {} is not in the validator table",
                config.node_id
            ))
        })?;
        let crypto = Arc::new(
            CryptoManager::new(config.chain_id, table.node_count(), keys)
                .map_err(|e| ConsensusError::EngineInit(e.to_string()))?,
        );

        let exit = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::new());
        let storage = ChainStorage::new(backend);
        let view = Arc::new(ConsensusView::new(storage.last_committed_block_id()));

        let (net_tx, net_rx) = unbounded::<NetworkMessageEnvelope>();
        let (share_tx, share_rx) = unbounded::<DaShare>();
        let (proof_tx, proof_rx) = unbounded::<DAProof>();
        let (batch_tx, batch_rx) = unbounded::<CommittedBlockList>();

        let transport = ConsensusTransport::new(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            Arc::clone(&view),
            net_tx,
            Some(Arc::new(storage.clone()) as Arc<dyn MessageStore>),
            Arc::clone(&exit),
        )?;

        let (proposal_client, pusher_handle) = ProposalClient::start(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            share_tx,
            Arc::clone(&exit),
        );

        let pending = Arc::new(PendingTransactionsAgent::new(
            config.chain_id,
            node_index,
            config.node_id,
            config.pending.clone(),
            Arc::clone(&exit),
        ));

        let downloader = BlockFinalizeDownloader::new(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            Arc::clone(&crypto) as Arc<dyn ProofChecker>,
            Arc::clone(&exit),
        );

        let schain = Schain::new(
            config.clone(),
            Arc::clone(&table),
            Arc::clone(&crypto),
            storage.clone(),
            Arc::clone(&view),
            Arc::clone(&pending),
            executor,
            Arc::clone(&transport) as Arc<dyn ConsensusBroadcast>,
            Arc::new(proposal_client) as Arc<dyn ProposalPublisher>,
            Arc::new(downloader) as Arc<dyn ProposalFetcher>,
            Arc::clone(&metrics),
            Arc::clone(&exit),
        )?;

        let mut threads = transport.start_threads();
        threads.push(pusher_handle);

        let sink = Arc::new(SchainSink::new(Arc::clone(&schain), proof_tx));
        threads.extend(ProposalServer::start(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            sink as Arc<dyn ProposalSink>,
            Arc::clone(&exit),
        )?);

        threads.extend(CatchupServer::start(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            Arc::new(storage.clone()) as Arc<dyn BlockSource>,
            Arc::clone(&exit),
        )?);

        let validator = Arc::new(PooledBatchValidator {
            crypto: Arc::clone(&crypto),
            pool: SigVerifyPool::new(config.sig_verify_threads)
                .map_err(|e| ConsensusError::EngineInit(e.to_string()))?,
        });
        threads.push(CatchupClient::start(
            Arc::clone(&table),
            node_index,
            config.net.clone(),
            validator as Arc<dyn BatchValidator>,
            Arc::clone(&view),
            batch_tx,
            Arc::clone(&exit),
        ));

        {
            let schain = Arc::clone(&schain);
            let exit = Arc::clone(&exit);
            threads.push(
                Builder::new()
                    .name("strandSchainMsg".to_string())
                    .spawn(move || message_loop(schain, net_rx, share_rx, proof_rx, batch_rx, exit))
                    .expect("failed to spawn orchestrator message thread"),
            );
        }

        {
            let metrics = Arc::clone(&metrics);
            let transport = Arc::clone(&transport);
            let pending = Arc::clone(&pending);
            let exit = Arc::clone(&exit);
            threads.push(
                Builder::new()
                    .name("strandMonitor".to_string())
                    .spawn(move || monitoring_loop(metrics, transport, pending, exit))
                    .expect("failed to spawn monitoring thread"),
            );
        }

        info!(
            "consensus node started: chain {} node index {node_index}",
            config.chain_id
        );
        Ok(Self {
            config,
            table,
            schain,
            transport,
            metrics,
            exit,
            threads,
        })
    }

    pub fn schain(&self) -> &Arc<Schain> {
        &self.schain
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Submit one client transaction. Returns false for duplicates.
    pub fn submit_transaction(&self, data: Vec<u8>) -> Result<bool> {
        self.schain.pending().push_transaction(data)
    }

    /// Jump-start the chain from the embedder's last committed block.
    pub fn bootstrap(
        &self,
        last_committed_block_id: strand_types::BlockId,
        last_committed_ts_sec: u64,
        last_committed_ts_ms: u32,
    ) -> Result<()> {
        self.schain
            .bootstrap(last_committed_block_id, last_committed_ts_sec, last_committed_ts_ms)
    }

    /// Wait for the chain's peers to come up. Succeeds immediately with
    /// full connectivity, after a short grace period once 2f+1 nodes
    /// (this one included) are reachable, and fails after the configured
    /// window otherwise — the embedder then exits with
    /// [`HEALTH_CHECK_EXIT_CODE`].
    pub fn health_check(&self) -> Result<()> {
        let node_count = self.table.node_count();
        let quorum = quorum_size(node_count);
        let grace_ms = (self.config.health_check_timeout_ms / 3).min(5_000);
        let started = now_ms();
        let mut connected: std::collections::HashSet<u64> = std::collections::HashSet::new();

        info!("health check: waiting to connect to peers");
        loop {
            if self.exit.load(Ordering::Relaxed) {
                return Err(ConsensusError::ExitRequested);
            }
            let elapsed = now_ms().saturating_sub(started);

            for peer in self.table.peers_of(self.schain.node_index()) {
                if !connected.contains(&peer.index)
                    && proposal::probe_peer(peer, self.config.chain_id, self.config.net.max_message_size)
                {
                    connected.insert(peer.index);
                }
            }

            let reachable = connected.len() as u64 + 1;
            if reachable == node_count {
                info!("health check passed: all {node_count} nodes reachable");
                return Ok(());
            }
            if reachable >= quorum && elapsed >= grace_ms {
                info!("health check passed: {reachable}/{node_count} nodes reachable");
                return Ok(());
            }
            if elapsed > self.config.health_check_timeout_ms {
                return Err(ConsensusError::Fatal(format!(
                    "could not connect to 2/3 of peers: {reachable}/{node_count} reachable"
                )));
            }
            std::thread::sleep(Duration::from_millis(1_000.min(
                self.config.health_check_timeout_ms / 10 + 1,
            )));
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// Flip the exit flag and join every long-lived thread.
    pub fn shutdown(mut self) {
        info!("shutting down consensus node");
        self.exit.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("a consensus thread panicked during shutdown");
            }
        }
    }

    /// Current depth of the transport queues, mostly for tests.
    pub fn transport(&self) -> &Arc<ConsensusTransport> {
        &self.transport
    }
}

// ── The orchestrator message loop ───────────────────────────────────────

fn message_loop(
    schain: Arc<Schain>,
    net_rx: Receiver<NetworkMessageEnvelope>,
    share_rx: Receiver<DaShare>,
    proof_rx: Receiver<DAProof>,
    batch_rx: Receiver<CommittedBlockList>,
    exit: Arc<AtomicBool>,
) {
    while !exit.load(Ordering::Relaxed) {
        let result = crossbeam_channel::select! {
            recv(net_rx) -> msg => match msg {
                Ok(envelope) => schain.handle_network_envelope(envelope),
                Err(_) => break,
            },
            recv(share_rx) -> msg => match msg {
                Ok(share) => schain.da_share_arrived(share),
                Err(_) => break,
            },
            recv(proof_rx) -> msg => match msg {
                Ok(proof) => schain.da_proof_arrived(proof),
                Err(_) => break,
            },
            recv(batch_rx) -> msg => match msg {
                Ok(batch) => schain.block_commits_arrived_through_catchup(batch),
                Err(_) => break,
            },
            default(Duration::from_millis(100)) => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_exit_requested() => break,
            Err(e) => {
                // Per-message and per-block faults are logged and the
                // loop continues; catch-up re-attempts affected blocks.
                warn!("orchestrator error: {e}");
                let mut source = std::error::Error::source(&e);
                while let Some(cause) = source {
                    warn!("  caused by: {cause}");
                    source = cause.source();
                }
            }
        }
    }
    info!("orchestrator message thread exiting");
}

fn monitoring_loop(
    metrics: Arc<Metrics>,
    transport: Arc<ConsensusTransport>,
    pending: Arc<PendingTransactionsAgent>,
    exit: Arc<AtomicBool>,
) {
    while !exit.load(Ordering::Relaxed) {
        metrics
            .deferred_messages
            .set(transport.total_deferred_messages() as u64);
        metrics
            .delayed_sends
            .set(transport.total_delayed_sends() as u64);
        metrics
            .pending_transactions
            .set(pending.pending_count() as u64);
        std::thread::sleep(Duration::from_millis(1_000));
    }
}

// ── Parallel catch-up validation ────────────────────────────────────────

/// Validates catch-up batches on the signature-verification pool.
struct PooledBatchValidator {
    crypto: Arc<CryptoManager>,
    pool: SigVerifyPool,
}

impl BatchValidator for PooledBatchValidator {
    fn validate_batch(&self, blocks: &[CommittedBlock]) -> Result<()> {
        let crypto = &self.crypto;
        let results: Vec<Result<()>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| {
                    crypto
                        .verify_block_sig(
                            block.block_id(),
                            block.proposer_index(),
                            block.proposal().hash(),
                            block.threshold_sig(),
                        )
                        .map_err(|e| {
                            ConsensusError::NetworkProtocol(format!(
                                "catch-up block {} failed signature validation: {e}",
                                block.block_id()
                            ))
                        })
                })
                .collect()
        });
        results.into_iter().collect()
    }
}
