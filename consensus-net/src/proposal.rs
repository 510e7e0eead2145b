//! Block-proposal exchange and DA-share collection.
//!
//! The proposer pushes each proposal to every peer over TCP. A peer that
//! stores the proposal answers with its DA signature share; the pusher
//! funnels the shares back to the orchestrator, which combines 2f+1 of
//! them into the DA proof and then enqueues the proof itself for a second
//! push round. The same channel serves finalize downloads (fetching a
//! stored proposal plus its DA proof) and the health-check probe.
//!
//! One request/response pair per connection; requests are bincode inside
//! length-prefixed frames.

use {
    crate::{
        config::{NetConfig, PortRole},
        framing,
        node_table::{NodeInfo, NodeTable},
    },
    crossbeam_channel::{bounded, Receiver, Sender},
    log::{debug, info, warn},
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
        BlockHash, BlockId, BlockProposal, ChainId, ConsensusError, DAProof, NodeIndex, Result,
    },
};

/// Requests on the proposal channel.
#[derive(Debug, Serialize, Deserialize)]
pub enum ProposalRequest {
    /// Health-check probe; answered with an empty ack.
    Probe { chain_id: ChainId },
    /// A proposal pushed by its proposer (serialized block form).
    Push { chain_id: ChainId, block: Vec<u8> },
    /// A completed DA proof, pushed to peers that may lack it.
    Proof { chain_id: ChainId, proof: DAProof },
    /// Finalize download: fetch a stored proposal and its DA proof.
    Get {
        chain_id: ChainId,
        block_id: BlockId,
        proposer_index: NodeIndex,
    },
}

/// Responses on the proposal channel.
#[derive(Debug, Serialize, Deserialize)]
pub enum ProposalResponse {
    /// For `Push`, carries the receiver's DA share over the proposal
    /// hash; empty for `Probe` and `Proof`.
    Ack { da_share: Option<String> },
    /// For `Get`: the stored proposal and proof, when present.
    Proposal {
        block: Option<Vec<u8>>,
        proof: Option<DAProof>,
    },
    /// The request was understood but refused.
    Refused { reason: String },
}

/// One peer's DA share for one proposal, as collected by the pusher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaShare {
    pub block_id: BlockId,
    pub proposer_index: NodeIndex,
    pub proposal_hash: BlockHash,
    pub signer: NodeIndex,
    pub share_hex: String,
}

/// The orchestrator side of the proposal channel.
pub trait ProposalSink: Send + Sync {
    /// Store a pushed proposal; return this node's DA share over its
    /// hash, or an error when the proposal is stale or malformed.
    fn proposal_pushed(&self, proposal: BlockProposal) -> Result<String>;

    /// A peer delivered a completed DA proof.
    fn da_proof_arrived(&self, proof: DAProof) -> Result<()>;

    /// Serve a stored proposal and its DA proof for a finalize download.
    fn fetch_proposal(
        &self,
        block_id: BlockId,
        proposer_index: NodeIndex,
    ) -> Option<(Vec<u8>, DAProof)>;
}

// ── Server ──────────────────────────────────────────────────────────────

/// Accept pool serving the proposal channel.
pub struct ProposalServer;

impl ProposalServer {
    /// Bind the proposal port and spawn one accept thread plus the
    /// configured number of handler workers.
    pub fn start(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        sink: Arc<dyn ProposalSink>,
        exit: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let this = table.get(self_index).ok_or_else(|| {
            ConsensusError::EngineInit(format!("node index {self_index} not in the table"))
        })?;
        let addr = this.addr(PortRole::Proposal);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("proposal server listening on {addr}");

        let (conn_tx, conn_rx) = bounded::<TcpStream>(config.accept_pool_size * 2);
        let mut handles = Vec::new();

        {
            let exit = Arc::clone(&exit);
            let timeout = Duration::from_millis(config.socket_timeout_ms);
            handles.push(
                Builder::new()
                    .name("strandPropAccept".to_string())
                    .spawn(move || accept_loop(listener, conn_tx, exit, timeout))
                    .expect("failed to spawn proposal accept thread"),
            );
        }

        for worker in 0..config.accept_pool_size {
            let conn_rx = conn_rx.clone();
            let sink = Arc::clone(&sink);
            let exit = Arc::clone(&exit);
            let chain_id = table.chain_id();
            let max_size = config.max_message_size;
            handles.push(
                Builder::new()
                    .name(format!("strandPropWork{worker}"))
                    .spawn(move || {
                        handler_loop(conn_rx, sink, exit, chain_id, max_size);
                    })
                    .expect("failed to spawn proposal worker thread"),
            );
        }
        Ok(handles)
    }
}

fn accept_loop(
    listener: TcpListener,
    conn_tx: Sender<TcpStream>,
    exit: Arc<AtomicBool>,
    poll: Duration,
) {
    while !exit.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if conn_tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(poll);
            }
            Err(e) => {
                warn!("proposal accept error: {e}");
            }
        }
    }
}

fn handler_loop(
    conn_rx: Receiver<TcpStream>,
    sink: Arc<dyn ProposalSink>,
    exit: Arc<AtomicBool>,
    chain_id: ChainId,
    max_size: usize,
) {
    while !exit.load(Ordering::Relaxed) {
        let Ok(mut stream) = conn_rx.recv_timeout(Duration::from_millis(100)) else {
            continue;
        };
        if let Err(e) = handle_connection(&mut stream, &sink, chain_id, max_size) {
            debug!("proposal connection error: {e}");
        }
    }
}

fn handle_connection(
    stream: &mut TcpStream,
    sink: &Arc<dyn ProposalSink>,
    chain_id: ChainId,
    max_size: usize,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let payload = framing::read_frame(stream, max_size)?;
    let request: ProposalRequest = bincode::deserialize(&payload)?;

    let response = match request {
        ProposalRequest::Probe { chain_id: got } => {
            if got == chain_id {
                ProposalResponse::Ack { da_share: None }
            } else {
                ProposalResponse::Refused {
                    reason: format!("unknown chain {got}"),
                }
            }
        }
        ProposalRequest::Push { chain_id: got, block } => {
            if got != chain_id {
                ProposalResponse::Refused {
                    reason: format!("unknown chain {got}"),
                }
            } else {
                match BlockProposal::deserialize(&block)
                    .and_then(|proposal| sink.proposal_pushed(proposal))
                {
                    Ok(share) => ProposalResponse::Ack {
                        da_share: Some(share),
                    },
                    Err(e) => ProposalResponse::Refused {
                        reason: e.to_string(),
                    },
                }
            }
        }
        ProposalRequest::Proof { chain_id: got, proof } => {
            if got != chain_id {
                ProposalResponse::Refused {
                    reason: format!("unknown chain {got}"),
                }
            } else {
                match sink.da_proof_arrived(proof) {
                    Ok(()) => ProposalResponse::Ack { da_share: None },
                    Err(e) => ProposalResponse::Refused {
                        reason: e.to_string(),
                    },
                }
            }
        }
        ProposalRequest::Get {
            chain_id: got,
            block_id,
            proposer_index,
        } => {
            if got != chain_id {
                ProposalResponse::Refused {
                    reason: format!("unknown chain {got}"),
                }
            } else {
                match sink.fetch_proposal(block_id, proposer_index) {
                    Some((block, proof)) => ProposalResponse::Proposal {
                        block: Some(block),
                        proof: Some(proof),
                    },
                    None => ProposalResponse::Proposal {
                        block: None,
                        proof: None,
                    },
                }
            }
        }
    };

    framing::write_frame(stream, &bincode::serialize(&response)?, max_size)
}

// ── Client ──────────────────────────────────────────────────────────────

/// Work items for the pusher thread.
#[derive(Debug)]
enum PushItem {
    Proposal(Box<BlockProposal>),
    Proof(DAProof),
}

/// Pushes proposals and DA proofs to every peer from a dedicated thread.
pub struct ProposalClient {
    queue_tx: Sender<PushItem>,
}

impl ProposalClient {
    /// Spawn the pusher thread. Collected DA shares flow out through
    /// `da_share_tx`.
    pub fn start(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        da_share_tx: Sender<DaShare>,
        exit: Arc<AtomicBool>,
    ) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<PushItem>();
        let handle = Builder::new()
            .name("strandPropPush".to_string())
            .spawn(move || {
                pusher_loop(table, self_index, config, queue_rx, da_share_tx, exit);
            })
            .expect("failed to spawn proposal pusher thread");
        (Self { queue_tx }, handle)
    }

    /// Queue this node's proposal for broadcast to all peers.
    pub fn enqueue_proposal(&self, proposal: BlockProposal) {
        let _ = self.queue_tx.send(PushItem::Proposal(Box::new(proposal)));
    }

    /// Queue a completed DA proof for broadcast to all peers.
    pub fn enqueue_proof(&self, proof: DAProof) {
        let _ = self.queue_tx.send(PushItem::Proof(proof));
    }
}

fn pusher_loop(
    table: Arc<NodeTable>,
    self_index: NodeIndex,
    config: NetConfig,
    queue_rx: Receiver<PushItem>,
    da_share_tx: Sender<DaShare>,
    exit: Arc<AtomicBool>,
) {
    const ATTEMPTS_PER_PEER: usize = 3;

    while !exit.load(Ordering::Relaxed) {
        let Ok(item) = queue_rx.recv_timeout(Duration::from_millis(100)) else {
            continue;
        };

        let chain_id = table.chain_id();
        for peer in table.peers_of(self_index) {
            if exit.load(Ordering::Relaxed) {
                return;
            }
            let request = match &item {
                PushItem::Proposal(proposal) => match proposal.serialize() {
                    Ok(block) => ProposalRequest::Push { chain_id, block },
                    Err(e) => {
                        warn!("could not serialize proposal {proposal}: {e}");
                        break;
                    }
                },
                PushItem::Proof(proof) => ProposalRequest::Proof {
                    chain_id,
                    proof: proof.clone(),
                },
            };

            let mut delivered = false;
            for attempt in 0..ATTEMPTS_PER_PEER {
                match request_response(peer, &request, config.max_message_size) {
                    Ok(response) => {
                        handle_push_response(&item, peer.index, response, &da_share_tx);
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        debug!(
                            "push to {} attempt {} failed: {e}",
                            peer.index,
                            attempt + 1
                        );
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            if !delivered {
                warn!("giving up pushing to peer {}", peer.index);
            }
        }
    }
}

fn handle_push_response(
    item: &PushItem,
    peer_index: NodeIndex,
    response: ProposalResponse,
    da_share_tx: &Sender<DaShare>,
) {
    match (item, response) {
        (
            PushItem::Proposal(proposal),
            ProposalResponse::Ack {
                da_share: Some(share_hex),
            },
        ) => {
            let _ = da_share_tx.send(DaShare {
                block_id: proposal.block_id(),
                proposer_index: proposal.proposer_index(),
                proposal_hash: *proposal.hash(),
                signer: peer_index,
                share_hex,
            });
        }
        (_, ProposalResponse::Refused { reason }) => {
            debug!("peer {peer_index} refused push: {reason}");
        }
        _ => {}
    }
}

/// One framed request/response exchange with a peer's proposal port.
pub fn request_response(
    peer: &NodeInfo,
    request: &ProposalRequest,
    max_size: usize,
) -> Result<ProposalResponse> {
    let mut stream = TcpStream::connect_timeout(&peer.addr(PortRole::Proposal), Duration::from_secs(2))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    framing::write_frame(&mut stream, &bincode::serialize(request)?, max_size)?;
    let payload = framing::read_frame(&mut stream, max_size)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Health-check probe: can the peer's proposal server answer us?
pub fn probe_peer(peer: &NodeInfo, chain_id: ChainId, max_size: usize) -> bool {
    matches!(
        request_response(peer, &ProposalRequest::Probe { chain_id }, max_size),
        Ok(ProposalResponse::Ack { .. })
    )
}
