//! Catch-up: pulling already-committed blocks from peers.
//!
//! A lagging node cannot take part in consensus for heights it has not
//! committed; it closes the gap by asking a randomly chosen peer for
//! everything past its tip. The server side answers with a contiguous
//! batch of serialized committed blocks, capped by configuration. Every
//! block in a batch is validated against the chain's threshold public key
//! before it reaches the orchestrator.

use {
    crate::{
        config::{NetConfig, PortRole},
        framing,
        node_table::NodeTable,
        view::ConsensusView,
    },
    crossbeam_channel::Sender,
    log::{debug, info, warn},
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::{
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Duration,
    },
    strand_types::{
        BlockId, ChainId, CommittedBlockList, ConsensusError, NodeIndex, Result,
    },
};

/// Catch-up request: "send me what comes after my tip".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub chain_id: ChainId,
    pub last_committed_block_id: BlockId,
}

/// Storage access the catch-up server needs.
pub trait BlockSource: Send + Sync {
    fn last_committed_block_id(&self) -> BlockId;
    /// Serialized committed block, if stored.
    fn serialized_block(&self, block_id: BlockId) -> Option<Vec<u8>>;
}

/// Validation of a whole batch before it is accepted. Implementations may
/// verify blocks in parallel; the signature-verification pool does.
pub trait BatchValidator: Send + Sync {
    /// Verify the threshold signature of every block in the batch.
    fn validate_batch(&self, blocks: &[strand_types::CommittedBlock]) -> Result<()>;
}

impl BatchValidator for strand_crypto::CryptoManager {
    fn validate_batch(&self, blocks: &[strand_types::CommittedBlock]) -> Result<()> {
        for block in blocks {
            self.verify_block_sig(
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
            })?;
        }
        Ok(())
    }
}

// ── Server ──────────────────────────────────────────────────────────────

/// Accept pool answering catch-up requests with contiguous batches.
pub struct CatchupServer;

impl CatchupServer {
    pub fn start(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        source: Arc<dyn BlockSource>,
        exit: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let this = table.get(self_index).ok_or_else(|| {
            ConsensusError::EngineInit(format!("node index {self_index} not in the table"))
        })?;
        let addr = this.addr(PortRole::Catchup);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("catch-up server listening on {addr}");

        let (conn_tx, conn_rx) = crossbeam_channel::bounded::<TcpStream>(config.accept_pool_size * 2);
        let mut handles = Vec::new();

        {
            let exit = Arc::clone(&exit);
            let poll = Duration::from_millis(config.socket_timeout_ms);
            handles.push(
                Builder::new()
                    .name("strandCatchAccept".to_string())
                    .spawn(move || {
                        while !exit.load(Ordering::Relaxed) {
                            match listener.accept() {
                                Ok((stream, _)) => {
                                    if conn_tx.send(stream).is_err() {
                                        break;
                                    }
                                }
                                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                    std::thread::sleep(poll);
                                }
                                Err(e) => warn!("catch-up accept error: {e}"),
                            }
                        }
                    })
                    .expect("failed to spawn catch-up accept thread"),
            );
        }

        for worker in 0..config.accept_pool_size {
            let conn_rx = conn_rx.clone();
            let source = Arc::clone(&source);
            let exit = Arc::clone(&exit);
            let chain_id = table.chain_id();
            let batch_cap = config.catchup_batch_cap;
            let max_size = config.max_message_size;
            handles.push(
                Builder::new()
                    .name(format!("strandCatchWork{worker}"))
                    .spawn(move || {
                        while !exit.load(Ordering::Relaxed) {
                            let Ok(mut stream) =
                                conn_rx.recv_timeout(Duration::from_millis(100))
                            else {
                                continue;
                            };
                            if let Err(e) = serve_request(
                                &mut stream,
                                &source,
                                chain_id,
                                batch_cap,
                                max_size,
                            ) {
                                debug!("catch-up connection error: {e}");
                            }
                        }
                    })
                    .expect("failed to spawn catch-up worker thread"),
            );
        }
        Ok(handles)
    }
}

fn serve_request(
    stream: &mut TcpStream,
    source: &Arc<dyn BlockSource>,
    chain_id: ChainId,
    batch_cap: usize,
    max_size: usize,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let payload = framing::read_frame(stream, max_size)?;
    let request: CatchupRequest = bincode::deserialize(&payload)?;
    if request.chain_id != chain_id {
        return Err(ConsensusError::InvalidChain {
            got: request.chain_id,
            local: chain_id,
        });
    }

    // Contiguous batch starting right after the requester's tip.
    let mut raw: Vec<Vec<u8>> = Vec::new();
    let tip = source.last_committed_block_id();
    let mut next = request.last_committed_block_id + 1;
    while next <= tip && raw.len() < batch_cap {
        match source.serialized_block(next) {
            Some(bytes) => raw.push(bytes),
            None => break,
        }
        next += 1;
    }
    debug!(
        "serving catch-up: {} blocks from {}",
        raw.len(),
        request.last_committed_block_id + 1
    );

    framing::write_frame(stream, &bincode::serialize(&raw)?, max_size)
}

// ── Client ──────────────────────────────────────────────────────────────

/// Periodic catch-up client thread.
pub struct CatchupClient;

impl CatchupClient {
    /// Spawn the client loop: every interval, ask one random peer for
    /// blocks past the current tip, validate the batch, and hand it to
    /// the orchestrator.
    pub fn start(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        validator: Arc<dyn BatchValidator>,
        view: Arc<ConsensusView>,
        batch_tx: Sender<CommittedBlockList>,
        exit: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        Builder::new()
            .name("strandCatchClient".to_string())
            .spawn(move || {
                client_loop(table, self_index, config, validator, view, batch_tx, exit);
            })
            .expect("failed to spawn catch-up client thread")
    }
}

fn client_loop(
    table: Arc<NodeTable>,
    self_index: NodeIndex,
    config: NetConfig,
    validator: Arc<dyn BatchValidator>,
    view: Arc<ConsensusView>,
    batch_tx: Sender<CommittedBlockList>,
    exit: Arc<AtomicBool>,
) {
    while !exit.load(Ordering::Relaxed) {
        sleep_checking_exit(&exit, config.catchup_interval_ms);
        if exit.load(Ordering::Relaxed) {
            break;
        }

        let peers: Vec<_> = table.peers_of(self_index).cloned().collect();
        if peers.is_empty() {
            continue;
        }
        let peer = &peers[rand::rng().random_range(0..peers.len())];
        let tip = view.last_committed_block_id();

        match fetch_batch(peer, table.chain_id(), tip, &config) {
            Ok(list) if list.is_empty() => {}
            Ok(list) => match validate_batch(&list, tip, validator.as_ref()) {
                Ok(()) => {
                    info!(
                        "BLOCK_CATCHUP: {} blocks from peer {}",
                        list.len(),
                        peer.index
                    );
                    if batch_tx.send(list).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("invalid catch-up batch from {}: {e}", peer.index),
            },
            Err(e) => debug!("catch-up fetch from {} failed: {e}", peer.index),
        }
    }
    info!("catch-up client thread exiting");
}

fn fetch_batch(
    peer: &crate::node_table::NodeInfo,
    chain_id: ChainId,
    last_committed: BlockId,
    config: &NetConfig,
) -> Result<CommittedBlockList> {
    let mut stream =
        TcpStream::connect_timeout(&peer.addr(PortRole::Catchup), Duration::from_secs(2))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let request = CatchupRequest {
        chain_id,
        last_committed_block_id: last_committed,
    };
    framing::write_frame(&mut stream, &bincode::serialize(&request)?, config.max_message_size)?;
    let payload = framing::read_frame(&mut stream, config.max_message_size)?;
    CommittedBlockList::deserialize(&payload)
}

/// A batch must start at or before the requester's next block and carry a
/// valid threshold signature on every block. Contiguity is enforced by
/// [`CommittedBlockList`] itself.
fn validate_batch(
    list: &CommittedBlockList,
    last_committed: BlockId,
    validator: &dyn BatchValidator,
) -> Result<()> {
    let Some(first_block) = list.blocks().first() else {
        return Ok(());
    };
    let first = first_block.block_id();
    if first > last_committed + 1 {
        return Err(ConsensusError::NetworkProtocol(format!(
            "batch starts at {first}, expected at most {}",
            last_committed + 1
        )));
    }
    validator.validate_batch(list.blocks())
}

fn sleep_checking_exit(exit: &AtomicBool, total_ms: u64) {
    let mut remaining = total_ms;
    while remaining > 0 && !exit.load(Ordering::Relaxed) {
        let step = remaining.min(50);
        std::thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        parking_lot::Mutex,
        std::{collections::HashMap, net::Ipv4Addr},
        strand_types::{BlockProposal, CommittedBlock, TransactionList},
    };

    const CHAIN: ChainId = 11;

    struct MapSource {
        blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
        tip: BlockId,
    }

    impl BlockSource for MapSource {
        fn last_committed_block_id(&self) -> BlockId {
            self.tip
        }

        fn serialized_block(&self, block_id: BlockId) -> Option<Vec<u8>> {
            self.blocks.lock().get(&block_id).cloned()
        }
    }

    struct AcceptAll;

    impl BatchValidator for AcceptAll {
        fn validate_batch(&self, _blocks: &[strand_types::CommittedBlock]) -> Result<()> {
            Ok(())
        }
    }

    struct RejectAll;

    impl BatchValidator for RejectAll {
        fn validate_batch(&self, blocks: &[strand_types::CommittedBlock]) -> Result<()> {
            Err(ConsensusError::NetworkProtocol(format!(
                "rejecting batch of {} blocks",
                blocks.len()
            )))
        }
    }

    fn committed(block_id: BlockId) -> CommittedBlock {
        let proposal = BlockProposal::new(
            CHAIN,
            block_id,
            1,
            1001,
            1_700_000_000 + block_id,
            0,
            TransactionList::default(),
        )
        .unwrap();
        CommittedBlock::new(proposal, "sig".into())
    }

    fn table(base: u16) -> Arc<NodeTable> {
        let nodes = vec![
            crate::node_table::NodeInfo::new(1001, 1, Ipv4Addr::LOCALHOST, base),
            crate::node_table::NodeInfo::new(1002, 2, Ipv4Addr::LOCALHOST, base + 10),
        ];
        Arc::new(NodeTable::new(CHAIN, nodes).unwrap())
    }

    fn source_with_blocks(range: std::ops::RangeInclusive<BlockId>) -> Arc<MapSource> {
        let tip = *range.end();
        let blocks = range
            .map(|id| (id, committed(id).serialize().unwrap()))
            .collect();
        Arc::new(MapSource {
            blocks: Mutex::new(blocks),
            tip,
        })
    }

    #[test]
    fn test_server_returns_contiguous_batch() {
        let table = table(28300);
        let exit = Arc::new(AtomicBool::new(false));
        let source = source_with_blocks(1..=10);
        let handles = CatchupServer::start(
            Arc::clone(&table),
            2,
            NetConfig::dev_default(),
            source as Arc<dyn BlockSource>,
            Arc::clone(&exit),
        )
        .unwrap();

        let peer = table.get(2).unwrap();
        let list = fetch_batch(peer, CHAIN, 0, &NetConfig::dev_default()).unwrap();
        assert_eq!(list.len(), 10);
        assert_eq!(list.blocks()[0].block_id(), 1);
        assert_eq!(list.blocks()[9].block_id(), 10);

        // A node already at 7 only gets the tail.
        let list = fetch_batch(peer, CHAIN, 7, &NetConfig::dev_default()).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.blocks()[0].block_id(), 8);

        // A node at the tip gets nothing.
        let list = fetch_batch(peer, CHAIN, 10, &NetConfig::dev_default()).unwrap();
        assert!(list.is_empty());

        exit.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_server_respects_batch_cap() {
        let table = table(28400);
        let exit = Arc::new(AtomicBool::new(false));
        let source = source_with_blocks(1..=50);
        let config = NetConfig {
            catchup_batch_cap: 16,
            ..NetConfig::dev_default()
        };
        let handles = CatchupServer::start(
            Arc::clone(&table),
            2,
            config.clone(),
            source as Arc<dyn BlockSource>,
            Arc::clone(&exit),
        )
        .unwrap();

        let peer = table.get(2).unwrap();
        let list = fetch_batch(peer, CHAIN, 0, &config).unwrap();
        assert_eq!(list.len(), 16);

        exit.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_validate_batch_rejects_gap_to_tip() {
        let blocks = vec![committed(5), committed(6)];
        let list = CommittedBlockList::new(blocks).unwrap();
        // Requester is at 2: a batch starting at 5 leaves a hole.
        assert!(validate_batch(&list, 2, &AcceptAll).is_err());
        assert!(validate_batch(&list, 4, &AcceptAll).is_ok());
    }

    #[test]
    fn test_validate_batch_applies_signature_check() {
        let list = CommittedBlockList::new(vec![committed(1)]).unwrap();
        assert!(validate_batch(&list, 0, &AcceptAll).is_ok());
        assert!(validate_batch(&list, 0, &RejectAll).is_err());
    }

    #[test]
    fn test_client_delivers_validated_batches() {
        let table = table(28500);
        let exit = Arc::new(AtomicBool::new(false));
        let source = source_with_blocks(1..=4);
        let server_handles = CatchupServer::start(
            Arc::clone(&table),
            2,
            NetConfig::dev_default(),
            source as Arc<dyn BlockSource>,
            Arc::clone(&exit),
        )
        .unwrap();

        let view = Arc::new(ConsensusView::new(0));
        let (batch_tx, batch_rx) = crossbeam_channel::unbounded();
        let client_handle = CatchupClient::start(
            Arc::clone(&table),
            1,
            NetConfig::dev_default(),
            Arc::new(AcceptAll),
            view,
            batch_tx,
            Arc::clone(&exit),
        );

        let list = batch_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("catch-up batch delivered");
        assert_eq!(list.len(), 4);

        exit.store(true, Ordering::Relaxed);
        client_handle.join().unwrap();
        for handle in server_handles {
            handle.join().unwrap();
        }
    }
}
