//! UDP transport for consensus datagrams.
//!
//! Two long-lived threads own the consensus traffic:
//!
//! - the **network read thread** blocks on the socket, decodes and
//!   validates each frame, resolves the sender by source IP, and routes
//!   the envelope through [`post_or_defer`](ConsensusTransport::post_or_defer);
//! - the **deferred-messages thread** ticks every 100 ms, re-evaluating
//!   deferred envelopes whose block became current and draining one
//!   delayed send per peer.
//!
//! Asynchronous agreement produces messages from the future — higher
//! blocks, higher rounds — that can be neither dropped (liveness) nor
//! processed early (safety). They park in the deferred map, keyed by
//! block id, with a round lookahead of exactly one. Messages at or below
//! the catch-up watermark are assumed committed everywhere and silently
//! dropped; messages further behind the current block than the active
//! window are stale and dropped too.
//!
//! Broadcast retries each message until 2f+1 validators, this node
//! included, accepted it; stragglers get the message queued into their
//! bounded delayed-sends FIFO (oldest dropped at 256).

use {
    crate::{
        codec,
        config::{NetConfig, PortRole},
        node_table::NodeTable,
        view::ConsensusView,
    },
    crossbeam_channel::Sender,
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    rand::Rng,
    std::{
        collections::{BTreeMap, HashSet, VecDeque},
        net::{IpAddr, SocketAddr, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
    strand_types::{
        BlockId, ConsensusError, NetworkMessage, NetworkMessageEnvelope, NodeIndex, Result,
    },
};

/// Persistence hooks for raw network messages; the orchestrator replays
/// the outgoing side after a restart.
pub trait MessageStore: Send + Sync {
    fn save_outgoing(&self, msg: &NetworkMessage);
    fn save_incoming(&self, msg: &NetworkMessage);
}

/// Consensus datagram exchange for one node.
pub struct ConsensusTransport {
    table: Arc<NodeTable>,
    self_index: NodeIndex,
    config: NetConfig,
    socket: UdpSocket,
    view: Arc<ConsensusView>,
    inbound: Sender<NetworkMessageEnvelope>,
    message_store: Option<Arc<dyn MessageStore>>,
    exit: Arc<AtomicBool>,
    deferred: Mutex<BTreeMap<BlockId, Vec<NetworkMessageEnvelope>>>,
    /// Slot i-1 holds peer i's backlog.
    delayed_sends: Mutex<Vec<VecDeque<NetworkMessage>>>,
}

impl ConsensusTransport {
    /// Bind the consensus socket and assemble the transport. Threads are
    /// started separately with [`start_threads`](Self::start_threads).
    pub fn new(
        table: Arc<NodeTable>,
        self_index: NodeIndex,
        config: NetConfig,
        view: Arc<ConsensusView>,
        inbound: Sender<NetworkMessageEnvelope>,
        message_store: Option<Arc<dyn MessageStore>>,
        exit: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let this = table
            .get(self_index)
            .ok_or_else(|| ConsensusError::EngineInit(format!(
                "node index {self_index} not in the validator table"
            )))?;
        let bind = this.addr(PortRole::Consensus);
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(Duration::from_millis(config.socket_timeout_ms)))?;
        info!("consensus transport bound on {bind}");

        let node_count = table.node_count() as usize;
        Ok(Arc::new(Self {
            table,
            self_index,
            config,
            socket,
            view,
            inbound,
            message_store,
            exit,
            deferred: Mutex::new(BTreeMap::new()),
            delayed_sends: Mutex::new(vec![VecDeque::new(); node_count]),
        }))
    }

    /// Spawn the network read thread and the deferred-messages thread.
    pub fn start_threads(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let reader = {
            let transport = Arc::clone(self);
            Builder::new()
                .name("strandNetRead".to_string())
                .spawn(move || transport.network_read_loop())
                .expect("failed to spawn network read thread")
        };
        let deferred = {
            let transport = Arc::clone(self);
            Builder::new()
                .name("strandDeferred".to_string())
                .spawn(move || transport.deferred_messages_loop())
                .expect("failed to spawn deferred messages thread")
        };
        vec![reader, deferred]
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Broadcast to all peers, retrying until 2f+1 validators (self
    /// included) accepted; the rest get the message queued for the
    /// deferred thread to retry.
    pub fn broadcast_message(&self, mut msg: NetworkMessage) -> Result<()> {
        if msg.block_id <= self.config.catchup_blocks {
            return Ok(());
        }

        if let Some(store) = &self.message_store {
            store.save_outgoing(&msg);
        }

        let node_count = self.table.node_count();
        let quorum = strand_types::quorum_size(node_count);
        let mut sent: HashSet<NodeIndex> = HashSet::new();

        // sent.len() + 1 counts this node.
        while (sent.len() as u64) + 1 < quorum {
            if self.exit.load(Ordering::Relaxed) {
                return Err(ConsensusError::ExitRequested);
            }
            for peer in self.table.peers_of(self.self_index) {
                if sent.contains(&peer.index) {
                    continue;
                }
                msg.dst_node_id = peer.node_id;
                if self.send_message(peer.index, &msg) {
                    sent.insert(peer.index);
                }
            }
            if (sent.len() as u64) + 1 < quorum {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let mut delayed = self.delayed_sends.lock();
        for peer in self.table.peers_of(self.self_index) {
            if sent.contains(&peer.index) {
                continue;
            }
            msg.dst_node_id = peer.node_id;
            let queue = &mut delayed[(peer.index - 1) as usize];
            queue.push_back(msg.clone());
            if queue.len() > self.config.max_delayed_sends_per_peer {
                queue.pop_front();
            }
        }
        Ok(())
    }

    /// One datagram to one peer. Under simulated packet loss the message
    /// counts as accepted and disappears, like a datagram on a lossy wire.
    fn send_message(&self, peer_index: NodeIndex, msg: &NetworkMessage) -> bool {
        let Some(peer) = self.table.get(peer_index) else {
            return false;
        };
        if self.config.packet_loss > 0
            && rand::rng().random_range(0..100) < self.config.packet_loss
        {
            trace!("packet loss: dropping {msg} to {peer_index}");
            return true;
        }
        let frame = match codec::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unencodable message {msg}: {e}");
                return false;
            }
        };
        match self.socket.send_to(&frame, peer.addr(PortRole::Consensus)) {
            Ok(_) => true,
            Err(e) => {
                trace!("send to {peer_index} failed: {e}");
                false
            }
        }
    }

    /// Messages still queued across all per-peer FIFOs.
    pub fn total_delayed_sends(&self) -> usize {
        self.delayed_sends.lock().iter().map(VecDeque::len).sum()
    }

    /// Envelopes parked in the deferred map.
    pub fn total_deferred_messages(&self) -> usize {
        self.deferred.lock().values().map(Vec::len).sum()
    }

    // ── Receiving ───────────────────────────────────────────────────────

    fn network_read_loop(&self) {
        let mut buf = vec![0u8; codec::CONSENSUS_MESSAGE_LEN];
        while !self.exit.load(Ordering::Relaxed) {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if self.exit.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("consensus socket read error: {e}");
                    continue;
                }
            };

            match self.receive_message(&buf[..len], src) {
                Ok(Some(envelope)) => {
                    if let Some(store) = &self.message_store {
                        store.save_incoming(&envelope.message);
                    }
                    self.post_or_defer(envelope);
                }
                Ok(None) => {}
                Err(e) => {
                    if self.exit.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!("dropping message from {src}: {e}");
                }
            }
        }
        info!("network read thread exiting");
    }

    /// Decode and validate one datagram. `Ok(None)` means silently
    /// dropped (foreign magic, catch-up watermark).
    fn receive_message(
        &self,
        frame: &[u8],
        src: SocketAddr,
    ) -> Result<Option<NetworkMessageEnvelope>> {
        if !codec::has_magic(frame) {
            return Ok(None);
        }
        let msg = codec::decode(frame, self.table.chain_id())?;

        if msg.block_id <= self.config.catchup_blocks {
            return Ok(None);
        }

        let IpAddr::V4(src_ip) = src.ip() else {
            return Err(ConsensusError::InvalidSourceIp(msg.src_ip));
        };
        let sender = self.table.by_ip(src_ip)?;
        if msg.src_ip != src_ip {
            return Err(ConsensusError::InvalidSourceIp(msg.src_ip));
        }

        Ok(Some(NetworkMessageEnvelope::new(msg, sender.index)))
    }

    // ── Deferral ────────────────────────────────────────────────────────

    /// Route an envelope: deliver it to the orchestrator, park it for
    /// later, or drop it as stale.
    pub fn post_or_defer(&self, envelope: NetworkMessageEnvelope) {
        let current = self.view.current_block_id();
        let block_id = envelope.block_id();

        if block_id > current {
            self.add_to_deferred(envelope);
            return;
        }
        if block_id + self.config.max_active_consensuses <= current {
            trace!("dropping stale message for block {block_id}");
            return;
        }

        let msg = &envelope.message;
        let key = msg.protocol_key();
        let local_round = self.view.round_of(key);
        let decided = self.view.is_decided(key);

        if msg.round > local_round + 1
            || (msg.round == local_round + 1 && !decided)
        {
            self.add_to_deferred(envelope);
            return;
        }

        if self.inbound.send(envelope).is_err() {
            debug!("inbound queue closed; dropping message");
        }
    }

    fn add_to_deferred(&self, envelope: NetworkMessageEnvelope) {
        trace!("deferring message for block {}", envelope.block_id());
        self.deferred
            .lock()
            .entry(envelope.block_id())
            .or_default()
            .push(envelope);
    }

    /// Remove and return every deferred envelope with block id at or
    /// below `block_id`, in block order.
    pub fn pull_messages_for_block_id(&self, block_id: BlockId) -> Vec<NetworkMessageEnvelope> {
        let mut deferred = self.deferred.lock();
        let keep = deferred.split_off(&(block_id + 1));
        let pulled = std::mem::replace(&mut *deferred, keep);
        pulled.into_values().flatten().collect()
    }

    fn deferred_messages_loop(&self) {
        while !self.exit.load(Ordering::Relaxed) {
            let current = self.view.current_block_id();
            for envelope in self.pull_messages_for_block_id(current) {
                self.post_or_defer(envelope);
            }

            self.try_delayed_sends();

            thread::sleep(Duration::from_millis(self.config.deferred_tick_ms));
        }
        info!("deferred messages thread exiting");
    }

    /// One delayed send per peer per tick.
    fn try_delayed_sends(&self) {
        for peer in self.table.peers_of(self.self_index) {
            let front = {
                let delayed = self.delayed_sends.lock();
                delayed[(peer.index - 1) as usize].front().cloned()
            };
            let Some(msg) = front else { continue };
            if self.send_message(peer.index, &msg) {
                let mut delayed = self.delayed_sends.lock();
                let queue = &mut delayed[(peer.index - 1) as usize];
                // Guard against the queue shifting while unlocked.
                if queue.front() == Some(&msg) {
                    queue.pop_front();
                }
            }
        }
    }
}
