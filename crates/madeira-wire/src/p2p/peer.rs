// SPDX-License-Identifier: MIT

//! One task per connection. The peer owns its socket and everything that
//! is strictly between us and that remote: the handshake, pings, the
//! announcement queue and the keep-alive bookkeeping. Anything that
//! touches shared state (the chain, request accounting, address relay)
//! goes up to the pool as a [PeerMessages] and comes back down as a
//! [NodeRequest].

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::bip152::BlockTransactions;
use bitcoin::bip152::BlockTransactionsRequest;
use bitcoin::bip152::HeaderAndShortIds;
use bitcoin::block::Header;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::message_blockdata::GetBlocksMessage;
use bitcoin::p2p::message_blockdata::GetHeadersMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_compact_blocks;
use bitcoin::p2p::message_network::Reject;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::Magic;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Amount;
use bitcoin::Block;
use bitcoin::Network;
use bitcoin::Transaction;
use bitcoin::Txid;
use log::debug;
use log::warn;
use madeira_common::constants::MAX_OUTBOUND_BUFFER;
use madeira_common::constants::USER_AGENT;
use madeira_common::version::COMPACT_VERSION;
use madeira_common::version::COMPACT_WITNESS_VERSION;
use madeira_common::version::HEADERS_VERSION;
use madeira_common::version::MIN_VERSION;
use madeira_common::version::PONG_VERSION;
use madeira_common::version::PROTOCOL_VERSION;
use madeira_common::FractionAvg;
use madeira_common::RollingFilter;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::interval;
use tokio::time::timeout;

use super::mempool::SharedMempool;
use super::nonces::NonceRegistry;
use super::pool::NodeNotification;
use super::pool::NodeRequest;
use super::stream_reader::StreamReader;

/// Give up on the TCP connect after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Close if the handshake hasn't completed this long after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often we ping a quiet peer.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How often queued inv announcements are flushed.
const INV_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// How often the keep-alive checks run.
const STALL_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period after connect before keep-alive checks apply.
const ACTIVITY_GRACE: Duration = Duration::from_secs(60);
/// A direction with no traffic for this long is dead.
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Flush the inv queue early once it holds this many entries.
const INV_QUEUE_FLUSH: usize = 500;

#[derive(Debug, PartialEq, Clone, Copy)]
enum State {
    WaitVersion,
    WaitVerack,
    Connected,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Error while sending to peer")]
    Send,
    #[error("Error while reading from peer")]
    Read(#[from] std::io::Error),
    #[error("Error while parsing message")]
    Parse(bitcoin::consensus::encode::Error),
    #[error("Peer sent us a message that we aren't expecting")]
    UnexpectedMessage,
    #[error("Peer sent us a message that is too big")]
    MessageTooBig,
    #[error("Peer sent us a message with the wrong magic bits")]
    MagicBitsMismatch,
    #[error("Peer sent a malformed command")]
    InvalidCommand,
    #[error("Peer sent us a message with an invalid checksum")]
    InvalidChecksum,
    #[error("Peer did not complete the handshake in time")]
    HandshakeTimeout,
    #[error("Peer is not draining its socket")]
    DrainStall,
    #[error("Peer is stalling ({0})")]
    Stalling(&'static str),
    #[error("We connected to ourselves")]
    SelfConnection,
    #[error("Peer failed a handshake check: {0}")]
    Handshake(&'static str),
    #[error("Connection closed")]
    Closed,
}

impl PeerError {
    /// Errors the framer can resynchronize from. These cost the peer ban
    /// score instead of the connection.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            PeerError::Parse(_)
                | PeerError::MessageTooBig
                | PeerError::MagicBitsMismatch
                | PeerError::InvalidCommand
                | PeerError::InvalidChecksum
        )
    }
}

type Result<T> = std::result::Result<T, PeerError>;

/// What we learned about a peer during the handshake.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub blocks: i32,
    pub user_agent: String,
    pub relay: bool,
    /// The address the remote says it reached us at
    pub our_addr: Option<IpAddr>,
}

/// Messages passed from a peer to the pool. They should be minimal and
/// only sent if handling requires global state; everything else is
/// handled by the peer itself.
#[derive(Debug)]
pub enum PeerMessages {
    /// Handshake completed
    Ready(VersionInfo),
    /// The connection is gone
    Disconnected,
    /// Something cost this peer ban score
    Misbehaving(u32, &'static str),
    /// Peer sent us addresses
    Addr(Vec<(u32, Address)>),
    /// Peer wants to know our addresses
    GetAddr,
    /// Peer announced inventory
    Inv(Vec<Inventory>),
    /// Peer asks us for data
    GetData(Vec<Inventory>),
    /// Peer doesn't have what we asked
    NotFound(Vec<Inventory>),
    /// Peer walks our chain with getblocks
    GetBlocks(GetBlocksMessage),
    /// Peer walks our chain with getheaders
    GetHeaders(GetHeadersMessage),
    /// A response to one of our getheaders
    Headers(Vec<Header>),
    /// A full block
    Block(Block),
    /// An unconfirmed transaction
    Tx(Transaction),
    /// Peer wants our mempool snapshot
    MemPool,
    /// Peer rejected something we sent
    Reject(Reject),
    /// Compact block announcement
    CmpctBlock(HeaderAndShortIds),
    /// Peer asks for transactions of a block we announced compactly
    GetBlockTxn(BlockTransactionsRequest),
    /// The missing transactions we asked for with getblocktxn
    BlockTxn(BlockTransactions),
    /// Peer negotiated compact blocks
    SendCmpct { mode: u8, witness: bool },
}

/// Pool-side knobs a peer needs to run its side of the protocol.
#[derive(Debug, Clone)]
pub struct PeerOpts {
    pub network: Network,
    /// Services we advertise
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
    pub allow_self_connect: bool,
    pub checkpoints: bool,
    pub bip152: bool,
}

impl PeerOpts {
    pub fn new(network: Network) -> Self {
        PeerOpts {
            network,
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            allow_self_connect: false,
            checkpoints: false,
            bip152: false,
        }
    }
}

pub struct Peer {
    id: u32,
    magic: Magic,
    addr: SocketAddr,
    outbound: bool,
    opts: PeerOpts,
    state: State,
    stream: Option<TcpStream>,
    mempool: SharedMempool,
    nonces: Arc<Mutex<NonceRegistry>>,
    our_nonce: u64,

    // What the remote's version taught us
    version: u32,
    services: ServiceFlags,
    no_relay: bool,
    prefer_headers: bool,
    compact_mode: Option<u8>,
    compact_witness: bool,
    fee_rate: Option<i64>,

    // Keep-alive state
    challenge: Option<u64>,
    last_ping: Instant,
    min_ping: Option<Duration>,
    ping_avg: FractionAvg,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    connected_at: Instant,
    ping_timer: Instant,
    inv_timer: Instant,
    stall_timer: Instant,

    inv_queue: Vec<Inventory>,
    inv_filter: RollingFilter,
    sent_getaddr: bool,

    /// Handshake data held between version and verack
    pending_info: Option<VersionInfo>,

    node_tx: UnboundedSender<NodeNotification>,
    node_requests: UnboundedReceiver<NodeRequest>,
    writer: Option<UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
}

impl Peer {
    /// Dial `address` and run the connection as a background task. A
    /// failed dial surfaces as an immediate `Disconnected`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_outbound_connection(
        id: u32,
        address: SocketAddr,
        mempool: SharedMempool,
        nonces: Arc<Mutex<NonceRegistry>>,
        opts: PeerOpts,
        node_tx: UnboundedSender<NodeNotification>,
        node_requests: UnboundedReceiver<NodeRequest>,
    ) {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await;

        let Ok(Ok(stream)) = stream else {
            let _ = node_tx.send(NodeNotification::FromPeer(id, PeerMessages::Disconnected));
            return;
        };

        Self::spawn_peer(
            id,
            stream,
            address,
            true,
            mempool,
            nonces,
            opts,
            node_tx,
            node_requests,
        );
    }

    /// Run an accepted connection as a background task.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_connection(
        id: u32,
        stream: TcpStream,
        address: SocketAddr,
        mempool: SharedMempool,
        nonces: Arc<Mutex<NonceRegistry>>,
        opts: PeerOpts,
        node_tx: UnboundedSender<NodeNotification>,
        node_requests: UnboundedReceiver<NodeRequest>,
    ) {
        Self::spawn_peer(
            id, stream, address, false, mempool, nonces, opts, node_tx, node_requests,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_peer(
        id: u32,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
        mempool: SharedMempool,
        nonces: Arc<Mutex<NonceRegistry>>,
        opts: PeerOpts,
        node_tx: UnboundedSender<NodeNotification>,
        node_requests: UnboundedReceiver<NodeRequest>,
    ) {
        let our_nonce = nonces.lock().expect("poisoned nonce lock").alloc();
        let now = Instant::now();

        let peer = Peer {
            id,
            magic: Magic::from(opts.network),
            addr,
            outbound,
            opts,
            state: State::WaitVersion,
            stream: Some(stream),
            mempool,
            nonces,
            our_nonce,
            version: 0,
            services: ServiceFlags::NONE,
            no_relay: false,
            prefer_headers: false,
            compact_mode: None,
            compact_witness: false,
            fee_rate: None,
            challenge: None,
            last_ping: now,
            min_ping: None,
            ping_avg: FractionAvg::new(0, 0),
            last_send: None,
            last_recv: None,
            connected_at: now,
            ping_timer: now,
            inv_timer: now,
            stall_timer: now,
            inv_queue: Vec::new(),
            inv_filter: RollingFilter::new(50000, 0.000001),
            sent_getaddr: false,
            pending_info: None,
            node_tx,
            node_requests,
            writer: None,
            buffered: Arc::new(AtomicUsize::new(0)),
        };

        tokio::spawn(peer.read_loop());
    }

    pub async fn read_loop(mut self) {
        let result = self.peer_loop_inner().await;
        debug!("peer {} connection loop closed: {result:?}", self.id);

        // Our connection nonce dies with the connection, if the remote's
        // version didn't already retire it.
        self.nonces
            .lock()
            .expect("poisoned nonce lock")
            .remove(self.our_nonce);

        self.send_to_node(PeerMessages::Disconnected);
    }

    async fn peer_loop_inner(&mut self) -> Result<()> {
        let stream = self.stream.take().expect("peer already running");
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = unbounded_channel();
        tokio::spawn(writer_loop(write_half, writer_rx, self.buffered.clone()));
        self.writer = Some(writer_tx);

        let (message_tx, mut message_rx) = unbounded_channel();
        tokio::spawn(StreamReader::new(read_half, self.magic, message_tx).read_loop());

        if self.outbound {
            // Say hello.
            self.send_version()?;
        }

        let mut tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                request = self.node_requests.recv() => {
                    match request {
                        Some(request) => self.handle_node_request(request).await?,
                        None => return Ok(()),
                    }
                }
                message = message_rx.recv() => {
                    match message {
                        Some(Ok(message)) => {
                            self.last_recv = Some(Instant::now());
                            self.handle_peer_message(message).await?;
                        }
                        Some(Err(err)) if err.recoverable() => {
                            self.last_recv = Some(Instant::now());
                            debug!("peer {} parse error: {err}", self.id);
                            self.send_to_node(PeerMessages::Misbehaving(10, "parse error"));
                        }
                        Some(Err(err)) => return Err(err),
                        None => return Err(PeerError::Closed),
                    }
                }
                _ = tick.tick() => {
                    self.handle_tick()?;
                }
            }
        }
    }

    fn send_to_node(&self, message: PeerMessages) {
        let _ = self
            .node_tx
            .send(NodeNotification::FromPeer(self.id, message));
    }

    fn write(&mut self, message: NetworkMessage) -> Result<()> {
        let data = serialize(&RawNetworkMessage::new(self.magic, message));

        let Some(writer) = &self.writer else {
            return Err(PeerError::Send);
        };

        self.buffered.fetch_add(data.len(), Ordering::Relaxed);
        writer.send(data).map_err(|_| PeerError::Send)?;
        self.last_send = Some(Instant::now());

        Ok(())
    }

    async fn handle_node_request(&mut self, request: NodeRequest) -> Result<()> {
        match request {
            NodeRequest::GetData(items) => self.write(NetworkMessage::GetData(items))?,
            NodeRequest::GetHeaders { locator, stop } => {
                self.write(NetworkMessage::GetHeaders(GetHeadersMessage {
                    version: PROTOCOL_VERSION,
                    locator_hashes: locator,
                    stop_hash: stop,
                }))?;
            }
            NodeRequest::GetBlocks { locator, stop } => {
                self.write(NetworkMessage::GetBlocks(GetBlocksMessage {
                    version: PROTOCOL_VERSION,
                    locator_hashes: locator,
                    stop_hash: stop,
                }))?;
            }
            NodeRequest::GetAddr => {
                if !self.sent_getaddr {
                    self.sent_getaddr = true;
                    self.write(NetworkMessage::GetAddr)?;
                }
            }
            NodeRequest::GetBlockTxn(txs_request) => {
                self.write(NetworkMessage::GetBlockTxn(
                    message_compact_blocks::GetBlockTxn { txs_request },
                ))?;
            }
            NodeRequest::MemPool => {
                if !self.services.has(ServiceFlags::BLOOM) {
                    debug!(
                        "peer {} cannot serve a mempool request without bloom support",
                        self.id
                    );
                } else {
                    self.write(NetworkMessage::MemPool)?;
                }
            }
            NodeRequest::SendAddr(addresses) => self.write(NetworkMessage::Addr(addresses))?,
            NodeRequest::SendInv(items) => {
                for item in items.iter() {
                    if let Some(hash) = inv_hash(item) {
                        self.inv_filter.insert(&hash);
                    }
                }
                debug!("serving {} inv items to peer {}", items.len(), self.id);
                self.write(NetworkMessage::Inv(items))?;
            }
            NodeRequest::SendHeaders(headers) => self.write(NetworkMessage::Headers(headers))?,
            NodeRequest::SendBlock(block) => self.write(NetworkMessage::Block(block))?,
            NodeRequest::SendCmpctBlock(block) => self.send_cmpctblock(&block)?,
            NodeRequest::SendTx(tx) => self.write(NetworkMessage::Tx(tx))?,
            NodeRequest::SendNotFound(items) => self.write(NetworkMessage::NotFound(items))?,
            NodeRequest::SendBlockTxn(transactions) => {
                self.write(NetworkMessage::BlockTxn(message_compact_blocks::BlockTxn {
                    transactions,
                }))?;
            }
            NodeRequest::SendCmpct { mode } => self.send_sendcmpct(mode)?,
            NodeRequest::SendReject(reject) => {
                warn!(
                    "rejecting {} from peer {}: code={:?} reason={}",
                    reject.message, self.id, reject.ccode, reject.reason
                );
                self.write(NetworkMessage::Reject(reject))?;
            }
            NodeRequest::AnnounceBlock(block) => self.announce_block(&block)?,
            NodeRequest::AnnounceTx(txid) => self.announce_tx(txid).await?,
            NodeRequest::Shutdown => return Err(PeerError::Closed),
        }

        Ok(())
    }

    async fn handle_peer_message(&mut self, message: NetworkMessage) -> Result<()> {
        match self.state {
            State::WaitVersion => match message {
                NetworkMessage::Version(version) => self.handle_version(version),
                _ => Err(PeerError::UnexpectedMessage),
            },
            State::WaitVerack => match message {
                NetworkMessage::Verack => self.handle_verack(),
                _ => Err(PeerError::UnexpectedMessage),
            },
            State::Connected => self.handle_connected_message(message).await,
        }
    }

    fn handle_version(&mut self, version: VersionMessage) -> Result<()> {
        self.version = version.version;
        self.services = version.services;
        self.no_relay = !version.relay;

        // A version carrying one of our live nonces means we dialed our
        // own advertised address.
        if !self.opts.allow_self_connect {
            let nonces = self.nonces.lock().expect("poisoned nonce lock");
            if nonces.has(version.nonce) {
                return Err(PeerError::SelfConnection);
            }
        }

        // The remote has now introduced itself; our own nonce has done
        // its job.
        self.nonces
            .lock()
            .expect("poisoned nonce lock")
            .remove(self.our_nonce);

        if self.version < MIN_VERSION {
            return Err(PeerError::Handshake("protocol version too old"));
        }

        if self.outbound {
            if !version.services.has(ServiceFlags::NETWORK) {
                return Err(PeerError::Handshake("no network service"));
            }

            if self.opts.checkpoints && self.version < HEADERS_VERSION {
                return Err(PeerError::Handshake("no getheaders support"));
            }

            if !version.services.has(ServiceFlags::WITNESS) {
                return Err(PeerError::Handshake("no witness service"));
            }

            if self.opts.bip152 && !self.has_compact_support() {
                warn!("peer {} does not support compact blocks", self.id);
            }
        }

        self.pending_info = Some(version_info(&version));

        if !self.outbound {
            self.send_version()?;
        }

        self.write(NetworkMessage::Verack)?;
        self.state = State::WaitVerack;

        Ok(())
    }

    fn handle_verack(&mut self) -> Result<()> {
        self.state = State::Connected;
        debug!("version handshake complete for peer {}", self.id);

        let info = self.pending_info.take().ok_or(PeerError::UnexpectedMessage)?;
        self.send_to_node(PeerMessages::Ready(info));

        Ok(())
    }

    async fn handle_connected_message(&mut self, message: NetworkMessage) -> Result<()> {
        match message {
            NetworkMessage::Ping(nonce) => {
                if nonce != 0 {
                    self.write(NetworkMessage::Pong(nonce))?;
                }
            }
            NetworkMessage::Pong(nonce) => self.handle_pong(nonce),
            NetworkMessage::SendHeaders => {
                if self.prefer_headers {
                    debug!("peer {} sent a duplicate sendheaders", self.id);
                } else {
                    self.prefer_headers = true;
                }
            }
            NetworkMessage::FeeFilter(rate) => {
                if rate < 0 || rate > Amount::MAX_MONEY.to_sat() as i64 {
                    self.send_to_node(PeerMessages::Misbehaving(100, "invalid feefilter"));
                } else {
                    self.fee_rate = Some(rate);
                }
            }
            NetworkMessage::SendCmpct(sendcmpct) => self.handle_sendcmpct(sendcmpct),
            NetworkMessage::Addr(addresses) => {
                self.send_to_node(PeerMessages::Addr(addresses));
            }
            NetworkMessage::GetAddr => self.send_to_node(PeerMessages::GetAddr),
            NetworkMessage::Inv(inventory) => {
                // Whatever they announce, they have; never announce it
                // back to them.
                for item in inventory.iter() {
                    if let Some(hash) = inv_hash(item) {
                        self.inv_filter.insert(&hash);
                    }
                }
                self.send_to_node(PeerMessages::Inv(inventory));
            }
            NetworkMessage::GetData(inventory) => {
                self.send_to_node(PeerMessages::GetData(inventory));
            }
            NetworkMessage::NotFound(inventory) => {
                self.send_to_node(PeerMessages::NotFound(inventory));
            }
            NetworkMessage::GetBlocks(request) => {
                self.send_to_node(PeerMessages::GetBlocks(request));
            }
            NetworkMessage::GetHeaders(request) => {
                self.send_to_node(PeerMessages::GetHeaders(request));
            }
            NetworkMessage::Headers(headers) => {
                self.send_to_node(PeerMessages::Headers(headers));
            }
            NetworkMessage::Block(block) => self.send_to_node(PeerMessages::Block(block)),
            NetworkMessage::Tx(tx) => self.send_to_node(PeerMessages::Tx(tx)),
            NetworkMessage::MemPool => self.send_to_node(PeerMessages::MemPool),
            NetworkMessage::Reject(reject) => self.send_to_node(PeerMessages::Reject(reject)),
            NetworkMessage::CmpctBlock(cmpct) => {
                self.send_to_node(PeerMessages::CmpctBlock(cmpct.compact_block));
            }
            NetworkMessage::GetBlockTxn(request) => {
                self.send_to_node(PeerMessages::GetBlockTxn(request.txs_request));
            }
            NetworkMessage::BlockTxn(response) => {
                self.send_to_node(PeerMessages::BlockTxn(response.transactions));
            }
            NetworkMessage::Version(_) | NetworkMessage::Verack => {
                return Err(PeerError::UnexpectedMessage);
            }
            NetworkMessage::Unknown { command, .. } => {
                debug!("peer {} sent an unknown message: {command}", self.id);
            }
            other => {
                debug!("peer {} sent an unhandled message: {}", self.id, other.cmd());
            }
        }

        Ok(())
    }

    fn handle_pong(&mut self, nonce: u64) {
        let now = Instant::now();

        let Some(challenge) = self.challenge else {
            debug!("peer {} sent an unsolicited pong", self.id);
            return;
        };

        if nonce != challenge {
            if nonce == 0 {
                debug!("peer {} sent a zero-nonce pong", self.id);
                self.challenge = None;
            } else {
                debug!("peer {} sent the wrong pong nonce", self.id);
            }
            return;
        }

        let rtt = now.duration_since(self.last_ping);
        self.min_ping = Some(self.min_ping.map_or(rtt, |min| min.min(rtt)));
        self.ping_avg.add(rtt.as_millis() as u64);
        self.challenge = None;

        debug!(
            "peer {} rtt={}ms min={}ms avg={:.0}ms",
            self.id,
            rtt.as_millis(),
            self.min_ping.unwrap_or_default().as_millis(),
            self.ping_avg.value()
        );
    }

    fn handle_sendcmpct(&mut self, sendcmpct: message_compact_blocks::SendCmpct) {
        if self.compact_mode.is_some() {
            debug!("peer {} sent a duplicate sendcmpct", self.id);
            return;
        }

        if sendcmpct.version > 2 {
            debug!(
                "peer {} requested compact blocks version {}",
                self.id, sendcmpct.version
            );
            return;
        }

        let mode = sendcmpct.send_compact as u8;
        let witness = sendcmpct.version == 2;

        debug!(
            "peer {} initialized compact blocks (mode={mode}, witness={witness})",
            self.id
        );

        self.compact_mode = Some(mode);
        self.compact_witness = witness;
        self.send_to_node(PeerMessages::SendCmpct { mode, witness });
    }

    fn handle_tick(&mut self) -> Result<()> {
        if self.state != State::Connected {
            if self.connected_at.elapsed() > HANDSHAKE_TIMEOUT {
                return Err(PeerError::HandshakeTimeout);
            }
            return Ok(());
        }

        if self.ping_timer.elapsed() >= PING_INTERVAL {
            self.send_ping()?;
            self.ping_timer = Instant::now();
        }

        if self.inv_timer.elapsed() >= INV_FLUSH_INTERVAL {
            self.flush_inv()?;
            self.inv_timer = Instant::now();
        }

        if self.stall_timer.elapsed() >= STALL_INTERVAL {
            self.maybe_stall()?;
            self.stall_timer = Instant::now();
        }

        if self.buffered.load(Ordering::Relaxed) > MAX_OUTBOUND_BUFFER {
            return Err(PeerError::DrainStall);
        }

        Ok(())
    }

    fn maybe_stall(&self) -> Result<()> {
        if self.connected_at.elapsed() <= ACTIVITY_GRACE {
            return Ok(());
        }

        let now = Instant::now();
        let mult = if self.version <= PONG_VERSION { 4 } else { 1 };

        let (Some(last_send), Some(last_recv)) = (self.last_send, self.last_recv) else {
            return Err(PeerError::Stalling("no message"));
        };

        if now > last_send + ACTIVITY_TIMEOUT {
            return Err(PeerError::Stalling("send"));
        }

        if now > last_recv + ACTIVITY_TIMEOUT * mult {
            return Err(PeerError::Stalling("recv"));
        }

        if self.challenge.is_some() && now > self.last_ping + ACTIVITY_TIMEOUT {
            return Err(PeerError::Stalling("ping"));
        }

        Ok(())
    }

    fn send_ping(&mut self) -> Result<()> {
        if self.version <= PONG_VERSION {
            return self.write(NetworkMessage::Ping(0));
        }

        if self.challenge.is_some() {
            debug!("peer {} has not responded to our last ping", self.id);
            return Ok(());
        }

        let challenge = rand::random::<u64>();
        self.challenge = Some(challenge);
        self.last_ping = Instant::now();

        self.write(NetworkMessage::Ping(challenge))
    }

    fn send_version(&mut self) -> Result<()> {
        let version = self.build_version();
        self.write(NetworkMessage::Version(version))
    }

    fn build_version(&self) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_secs() as i64;

        let receiver = Address::new(&self.addr, ServiceFlags::NONE);
        let local = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        let sender = Address::new(&local, self.opts.services);

        VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.opts.services,
            timestamp,
            receiver,
            sender,
            nonce: self.our_nonce,
            user_agent: self.opts.user_agent.clone(),
            start_height: self.opts.start_height,
            relay: true,
        }
    }

    fn has_compact_support(&self) -> bool {
        self.version >= COMPACT_VERSION
            && self.services.has(ServiceFlags::WITNESS)
            && self.version >= COMPACT_WITNESS_VERSION
    }

    fn send_sendcmpct(&mut self, mode: u8) -> Result<()> {
        // Only witness compact blocks are worth negotiating.
        if !self.services.has(ServiceFlags::WITNESS)
            || self.version < COMPACT_WITNESS_VERSION
        {
            return Ok(());
        }

        debug!("initializing witness compact blocks with peer {}", self.id);

        self.write(NetworkMessage::SendCmpct(message_compact_blocks::SendCmpct {
            send_compact: mode == 1,
            version: 2,
        }))
    }

    fn send_cmpctblock(&mut self, block: &Block) -> Result<()> {
        let version = if self.compact_witness { 2 } else { 1 };

        match HeaderAndShortIds::from_block(block, rand::random(), version, &[]) {
            Ok(compact_block) => self.write(NetworkMessage::CmpctBlock(
                message_compact_blocks::CmpctBlock { compact_block },
            )),
            Err(err) => {
                debug!("could not build a compact block for peer {}: {err}", self.id);
                Ok(())
            }
        }
    }

    fn flush_inv(&mut self) -> Result<()> {
        if self.inv_queue.is_empty() {
            return Ok(());
        }

        debug!(
            "serving {} inv items to peer {}",
            self.inv_queue.len(),
            self.id
        );

        let items = std::mem::take(&mut self.inv_queue);
        self.write(NetworkMessage::Inv(items))
    }

    /// Queue a transaction announcement, honoring the peer's relay
    /// preference and fee filter, deduplicated against what it already
    /// knows.
    async fn announce_tx(&mut self, txid: Txid) -> Result<()> {
        if self.no_relay {
            return Ok(());
        }

        if self.inv_filter.contains(&txid.to_byte_array()) {
            return Ok(());
        }

        if let Some(min_rate) = self.fee_rate {
            match self.mempool.lock().await.fee_rate(&txid) {
                Some(rate) if rate >= min_rate as u64 => {}
                // Below the peer's floor, or gone from our mempool
                _ => return Ok(()),
            }
        }

        self.inv_filter.insert(&txid.to_byte_array());
        self.inv_queue.push(Inventory::Transaction(txid));

        if self.inv_queue.len() >= INV_QUEUE_FLUSH {
            self.flush_inv()?;
        }

        Ok(())
    }

    /// Announce a block the way the peer asked for: compact push for
    /// high-bandwidth mode, a bare header for sendheaders peers, an inv
    /// otherwise. Block announcements never wait in the queue.
    fn announce_block(&mut self, block: &Block) -> Result<()> {
        let hash = block.block_hash();

        if self.inv_filter.contains(&hash.to_byte_array()) {
            return Ok(());
        }

        self.inv_filter.insert(&hash.to_byte_array());

        if self.compact_mode == Some(1) {
            return self.send_cmpctblock(block);
        }

        if self.prefer_headers {
            return self.write(NetworkMessage::Headers(vec![block.header]));
        }

        self.inv_queue.push(Inventory::Block(hash));
        self.flush_inv()
    }
}

async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(data) = receiver.recv().await {
        let length = data.len();

        if writer.write_all(&data).await.is_err() {
            return;
        }

        buffered.fetch_sub(length, Ordering::Relaxed);
    }
}

fn version_info(version: &VersionMessage) -> VersionInfo {
    VersionInfo {
        version: version.version,
        services: version.services,
        blocks: version.start_height,
        user_agent: version.user_agent.clone(),
        relay: version.relay,
        our_addr: version.receiver.socket_addr().ok().map(|addr| addr.ip()),
    }
}

/// The 32 hash bytes behind an inventory item, if it has them.
fn inv_hash(item: &Inventory) -> Option<[u8; 32]> {
    match item {
        Inventory::Block(hash)
        | Inventory::WitnessBlock(hash)
        | Inventory::CompactBlock(hash) => Some(hash.to_byte_array()),
        Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
            Some(txid.to_byte_array())
        }
        Inventory::WTx(wtxid) => Some(wtxid.to_byte_array()),
        _ => None,
    }
}
