// SPDX-License-Identifier: MIT

//! Main file for the p2p layer. The pool is the central task that owns
//! every piece of shared networking state: the peer registry, the
//! pool-wide request accounting, the header-sync scaffold and the
//! address manager. Peers feed it events through a channel; it drives
//! them back with requests. A peer should not show up here for things it
//! can settle by itself, like pings.

use std::collections::HashSet;
use std::io::Cursor;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
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
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::AddrV2;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message_blockdata::GetBlocksMessage;
use bitcoin::p2p::message_blockdata::GetHeadersMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::Reject;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Network;
use bitcoin::Transaction;
use bitcoin::Txid;
use log::debug;
use log::info;
use log::warn;
use madeira_common::constants::GETBLOCKS_PAGE;
use madeira_common::constants::MAX_ADDR;
use madeira_common::constants::MAX_BLOCKTXN_DEPTH;
use madeira_common::constants::MAX_COMPACT_BLOCKS;
use madeira_common::constants::MAX_HEADERS;
use madeira_common::constants::MAX_INV;
use madeira_common::version::COMPACT_VERSION;
use madeira_common::version::COMPACT_WITNESS_VERSION;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::address_man::is_routable;
use super::address_man::AddressMan;
use super::address_man::AddressState;
use super::address_man::LocalAddress;
use super::chain::ChainBackend;
use super::chain::VerifyError;
use super::compact::CompactBlock;
use super::compact::CompactError;
use super::error::AddrParseError;
use super::error::WireError;
use super::header_chain::HeaderChain;
use super::mempool::SharedMempool;
use super::nonces::NonceRegistry;
use super::params::NetworkParams;
use super::peer::Peer;
use super::peer::PeerMessages;
use super::peer::PeerOpts;
use super::peer::VersionInfo;
use super::registry::LocalPeerView;
use super::registry::PeerId;
use super::registry::PeerRegistry;
use super::registry::PeerStatus;

/// Refill outbound slots this often.
const REFILL_INTERVAL: u64 = 3;
/// Sweep for stalled requests this often.
const STALL_INTERVAL: u64 = 5;
/// Persist the address manager this often.
const PEER_DB_DUMP_INTERVAL: u64 = 5 * 60;
/// An unanswered getblocks while not synced.
const GB_TIMEOUT: Duration = Duration::from_secs(30);
/// An unanswered getheaders.
const GH_TIMEOUT: Duration = Duration::from_secs(60);
/// The loader making no block progress while we sync.
const LOADER_BLOCK_TIMEOUT: Duration = Duration::from_secs(120);
/// An unanswered block or tx getdata.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// An unanswered getblocktxn.
const COMPACT_TIMEOUT: Duration = Duration::from_secs(30);
/// Don't redial a candidate more often than this, in seconds.
const CANDIDATE_RETRY: u64 = 600;

#[derive(Debug)]
pub enum NodeNotification {
    FromPeer(PeerId, PeerMessages),
    /// The listener accepted a connection
    Accepted(TcpStream, SocketAddr),
}

#[derive(Debug, Clone, PartialEq)]
/// Sent from the pool to a peer, either a request to the remote or data
/// to serve it.
pub enum NodeRequest {
    /// Ask the remote for blocks or transactions
    GetData(Vec<Inventory>),
    /// Ask the remote for headers
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    /// Ask the remote for block invs
    GetBlocks {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    /// Ask the remote for its known addresses
    GetAddr,
    /// Ask the remote for its mempool
    MemPool,
    /// Ask the remote for a compact block's missing transactions
    GetBlockTxn(BlockTransactionsRequest),
    /// Serve addresses
    SendAddr(Vec<(u32, Address)>),
    /// Serve an inv (also used for announcements we batch ourselves)
    SendInv(Vec<Inventory>),
    /// Serve headers
    SendHeaders(Vec<Header>),
    /// Serve a full block
    SendBlock(Block),
    /// Serve a block in compact form
    SendCmpctBlock(Block),
    /// Serve a mempool transaction
    SendTx(Transaction),
    /// Tell the remote we don't have what it asked
    SendNotFound(Vec<Inventory>),
    /// Serve a blocktxn reply
    SendBlockTxn(BlockTransactions),
    /// Advertise our compact block support
    SendCmpct { mode: u8 },
    /// Tell the remote why we refused its data
    SendReject(Reject),
    /// Announce a new block (the peer picks cmpct/headers/inv form)
    AnnounceBlock(Block),
    /// Announce a transaction, subject to the peer's relay settings
    AnnounceTx(Txid),
    /// Close the connection
    Shutdown,
}

/// Candidate filtering for outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetPreference {
    #[default]
    Any,
    Ipv4Only,
    Ipv6Only,
}

/// A snapshot of one connection, for operators.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub state: PeerStatus,
    pub address: String,
    pub services: String,
    pub user_agent: String,
    pub initial_height: u32,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The network we are on, defaults to Bitcoin.
    pub network: Network,
    /// Whether to accept inbound connections.
    pub listen: bool,
    /// Listening port, defaulting to the network's canonical one.
    pub port: Option<u16>,
    /// Maximum outbound connections. Defaults to 8.
    pub max_outbound: usize,
    /// Maximum inbound connections. Defaults to 8.
    pub max_inbound: usize,
    /// Gate the initial sync behind the hard-coded checkpoints and fetch
    /// headers first.
    pub checkpoints: bool,
    /// Serve bip37 requests (the `mempool` message).
    pub bip37: bool,
    /// Negotiate bip152 compact blocks.
    pub bip152: bool,
    /// Compact block bandwidth mode: 0 asks peers for announcements via
    /// inv/headers, 1 asks for unsolicited cmpctblock pushes.
    pub block_mode: u8,
    /// Restrict outbound candidates to one address family.
    pub only_net: NetPreference,
    /// Services a peer must advertise before we sync from it.
    pub required_services: ServiceFlags,
    /// Tolerate connecting to ourselves. Defaults to the per-network
    /// setting.
    pub self_connect: Option<bool>,
    /// Only connect to this address, `host[:port]`.
    pub fixed_peer: Option<String>,
    /// Maximum ban score. Defaults to 100.
    ///
    /// If a peer misbehaves, we increase its ban score. If the ban score
    /// reaches this value, we disconnect from the peer and ban its
    /// address.
    pub max_banscore: u32,
    /// Where the address manager keeps its dump.
    pub datadir: String,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            network: Network::Bitcoin,
            listen: true,
            port: None,
            max_outbound: 8,
            max_inbound: 8,
            checkpoints: false,
            bip37: false,
            bip152: false,
            block_mode: 0,
            only_net: NetPreference::Any,
            required_services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            self_connect: None,
            fixed_peer: None,
            max_banscore: madeira_common::constants::BAN_THRESHOLD,
            datadir: ".madeira-node".to_string(),
            user_agent: madeira_common::constants::USER_AGENT.to_string(),
        }
    }
}

pub struct Pool<Chain: ChainBackend> {
    // 1. Core blockchain and transient data
    pub(crate) chain: Chain,
    pub(crate) mempool: SharedMempool,

    // 2. Peer management
    pub(crate) peer_id_count: u32,
    pub(crate) peers: PeerRegistry,
    pub(crate) nonces: Arc<Mutex<NonceRegistry>>,
    pub(crate) address_man: AddressMan,

    // 3. Internal communication
    pub(crate) node_rx: UnboundedReceiver<NodeNotification>,
    pub(crate) node_tx: UnboundedSender<NodeNotification>,

    // 4. Pool-wide request accounting
    pub(crate) block_map: HashSet<BlockHash>,
    pub(crate) tx_map: HashSet<Txid>,
    pub(crate) compact_map: HashSet<BlockHash>,

    // 5. Sync state
    pub(crate) header_sync: Option<HeaderChain>,
    pub(crate) synced: bool,

    // 6. Timers
    refill_timer: Instant,
    stall_timer: Instant,
    dump_timer: Instant,

    // 7. Configuration and metadata
    pub(crate) config: PoolConfig,
    pub(crate) params: NetworkParams,
    fixed_peer: Option<LocalAddress>,
}

/// Run a task and log any errors that might occur.
macro_rules! try_and_log {
    ($what:expr) => {
        let result = $what;

        if let Err(error) = result {
            log::error!("{}:{} - {:?}", line!(), file!(), error);
        }
    };
}

macro_rules! periodic_job {
    ($what:expr, $timer:expr, $interval:expr) => {
        if $timer.elapsed() > Duration::from_secs($interval) {
            try_and_log!($what);
            $timer = Instant::now();
        }
    };
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs()
}

/// The 16 bytes of an address as they appear on the wire, used for the
/// relay peer pick.
fn ip16(addr: &Address) -> [u8; 16] {
    let mut bytes = [0_u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(addr.address.iter()) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Address-filter key: ip bytes plus port.
fn addr_key(addr: &Address) -> [u8; 18] {
    let mut key = [0_u8; 18];
    key[..16].copy_from_slice(&ip16(addr));
    key[16..].copy_from_slice(&addr.port.to_be_bytes());
    key
}

fn murmur_pick(data: &[u8], seed: u32, len: usize) -> usize {
    let hash = murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0);
    hash as usize % len
}

impl<Chain: ChainBackend> Pool<Chain> {
    pub fn new(
        config: PoolConfig,
        chain: Chain,
        mempool: SharedMempool,
    ) -> Result<Self, WireError> {
        let (node_tx, node_rx) = unbounded_channel();
        let params = NetworkParams::new(config.network);

        let fixed_peer = config
            .fixed_peer
            .as_ref()
            .map(|address| Self::resolve_connect_host(address, params.default_port))
            .transpose()?;

        Ok(Pool {
            chain,
            mempool,
            peer_id_count: 0,
            peers: PeerRegistry::default(),
            nonces: Arc::new(Mutex::new(NonceRegistry::new())),
            address_man: AddressMan::default(),
            node_rx,
            node_tx,
            block_map: HashSet::new(),
            tx_map: HashSet::new(),
            compact_map: HashSet::new(),
            header_sync: None,
            synced: false,
            refill_timer: Instant::now(),
            stall_timer: Instant::now(),
            dump_timer: Instant::now(),
            params,
            fixed_peer,
            config,
        })
    }

    /// Resolves a string address into a LocalAddress
    ///
    /// This function should get an address in the format `<address>[<:port>]` and return a
    /// usable [`LocalAddress`]. It can be an ipv4, ipv6 or a hostname. In case of hostnames,
    /// we resolve them using the system's DNS resolver and return an ip address. Errors if
    /// the provided address is invalid, or we can't resolve it.
    fn resolve_connect_host(
        address: &str,
        default_port: u16,
    ) -> Result<LocalAddress, AddrParseError> {
        // ipv6
        if address.starts_with('[') {
            if !address.contains(']') {
                return Err(AddrParseError::InvalidIpv6);
            }

            let mut split = address.trim_end().split(']');
            let hostname = split.next().ok_or(AddrParseError::InvalidIpv6)?;
            let port = split
                .next()
                .filter(|x| !x.is_empty())
                .map(|port| {
                    port.trim_start_matches(':')
                        .parse()
                        .map_err(|_e| AddrParseError::InvalidPort)
                })
                .transpose()?
                .unwrap_or(default_port);

            let hostname = hostname.trim_start_matches('[');
            let ip = hostname.parse().map_err(|_e| AddrParseError::InvalidIpv6)?;
            return Ok(LocalAddress::new(
                AddrV2::Ipv6(ip),
                0,
                AddressState::NeverTried,
                ServiceFlags::NONE,
                port,
                rand::random(),
            ));
        }

        // ipv4 - it's hard to differentiate between ipv4 and hostname without an actual
        // regex, simply try to parse it as an ip address and if it fails, assume it's a
        // hostname
        let mut address = address;
        if address.is_empty() {
            address = "127.0.0.1"
        }

        let mut split = address.split(':');
        let ip = split
            .next()
            .ok_or(AddrParseError::InvalidIpv4)?
            .parse()
            .map_err(|_e| AddrParseError::InvalidIpv4);

        match ip {
            Ok(ip) => {
                let port = split
                    .next()
                    .map(|port| port.parse().map_err(|_e| AddrParseError::InvalidPort))
                    .transpose()?
                    .unwrap_or(default_port);

                if split.next().is_some() {
                    return Err(AddrParseError::Inconclusive);
                }

                Ok(LocalAddress::new(
                    AddrV2::Ipv4(ip),
                    0,
                    AddressState::NeverTried,
                    ServiceFlags::NONE,
                    port,
                    rand::random(),
                ))
            }

            Err(_) => {
                let mut split = address.split(':');
                let hostname = split.next().ok_or(AddrParseError::InvalidHostname)?;
                let port = split
                    .next()
                    .map(|port| port.parse().map_err(|_e| AddrParseError::InvalidPort))
                    .transpose()?
                    .unwrap_or(default_port);

                if split.next().is_some() {
                    return Err(AddrParseError::Inconclusive);
                }

                let ips =
                    dns_lookup::lookup_host(hostname).map_err(|_e| AddrParseError::InvalidHostname)?;
                let ip = match ips.first().ok_or(AddrParseError::InvalidHostname)? {
                    IpAddr::V4(ip) => AddrV2::Ipv4(*ip),
                    IpAddr::V6(ip) => AddrV2::Ipv6(*ip),
                };

                Ok(LocalAddress::new(
                    ip,
                    0,
                    AddressState::NeverTried,
                    ServiceFlags::NONE,
                    port,
                    rand::random(),
                ))
            }
        }
    }

    /// Bind the listener, load the peer dump and size up the sync. Must
    /// run once before [Pool::run].
    pub async fn open(&mut self) -> Result<(), WireError> {
        info!("opening pool on network {}", self.config.network);

        if self.config.listen {
            let port = self.config.port.unwrap_or(self.params.default_port);
            let listener = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port))
                .await
                .map_err(WireError::Listen)?;

            info!("listening on port {port}");

            let node_tx = self.node_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, address)) => {
                            if node_tx
                                .send(NodeNotification::Accepted(stream, address))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => warn!("failed to accept a connection: {err}"),
                    }
                }
            });
        }

        try_and_log!(self.address_man.restore_peers(&self.config.datadir));

        self.synced = self.chain.synced();
        self.reset_header_chain();

        Ok(())
    }

    /// The main loop: drain peer events, then run the periodic jobs.
    pub async fn run(&mut self, kill_signal: Arc<RwLock<bool>>) {
        loop {
            while let Ok(Some(notification)) =
                timeout(Duration::from_millis(100), self.node_rx.recv()).await
            {
                try_and_log!(self.handle_notification(notification).await);
            }

            if *kill_signal.read().await {
                self.shutdown();
                break;
            }

            periodic_job!(self.fill_outbound(), self.refill_timer, REFILL_INTERVAL);
            periodic_job!(self.check_for_stalls(), self.stall_timer, STALL_INTERVAL);
            periodic_job!(
                self.address_man.dump_peers(&self.config.datadir),
                self.dump_timer,
                PEER_DB_DUMP_INTERVAL
            );
        }
    }

    pub(crate) fn shutdown(&mut self) {
        info!("shutting down pool");

        for peer in self.peers.ids() {
            try_and_log!(self.send_to_peer(peer, NodeRequest::Shutdown));
        }

        try_and_log!(self.address_man.dump_peers(&self.config.datadir));
    }

    /// Rebuild the checkpoint scaffold from the current tip. Clears it
    /// when checkpoints are off, the network has none, or we are past
    /// the last one.
    fn reset_header_chain(&mut self) {
        self.header_sync = None;

        if !self.config.checkpoints {
            return;
        }

        let Some(last) = self.params.last_checkpoint() else {
            return;
        };

        let tip_height = self.chain.height();

        if tip_height < last.height {
            let target = *self
                .params
                .next_checkpoint(tip_height)
                .expect("tip is below the last checkpoint");

            info!(
                "initialized header chain to height {tip_height} (checkpoint={})",
                target.hash
            );

            self.header_sync = Some(HeaderChain::new(self.chain.tip(), tip_height, target));
        }
    }

    fn peer_opts(&self) -> PeerOpts {
        let mut opts = PeerOpts::new(self.config.network);

        opts.user_agent = self.config.user_agent.clone();
        opts.start_height = self.chain.height() as i32;
        opts.allow_self_connect = self
            .config
            .self_connect
            .unwrap_or(self.params.allow_self_connect);
        opts.checkpoints = self.config.checkpoints;
        opts.bip152 = self.config.bip152;

        opts
    }

    pub fn get_peer_info(&self, peer: PeerId) -> Option<PeerInfo> {
        let peer = self.peers.get(peer)?;

        Some(PeerInfo {
            state: peer.state,
            address: format!("{}:{}", peer.address, peer.port),
            services: peer.services.to_string(),
            user_agent: peer.user_agent.clone(),
            initial_height: peer.height,
        })
    }

    pub(crate) fn send_to_peer(&self, peer_id: PeerId, req: NodeRequest) -> Result<(), WireError> {
        if let Some(peer) = self.peers.get(peer_id) {
            peer.channel.send(req)?;
        }

        Ok(())
    }

    /// Ask a peer to go away. The registry entry stays until its
    /// Disconnected notification arrives.
    fn close_peer(&mut self, peer_id: PeerId, reason: &str) -> Result<(), WireError> {
        warn!("closing peer {peer_id}: {reason}");
        self.send_to_peer(peer_id, NodeRequest::Shutdown)
    }

    /// Increases the "banscore" of a peer.
    ///
    /// This is an always increasing number that, if it reaches our
    /// `max_banscore` setting, will cause the peer's address to be
    /// banned for one ban time.  The amount of each increment is given
    /// by factor, and it's calibrated for each misbehaving action that a
    /// peer may incur in.
    pub(crate) fn increase_banscore(
        &mut self,
        peer_id: PeerId,
        factor: u32,
        reason: &str,
    ) -> Result<(), WireError> {
        let max_banscore = self.config.max_banscore;

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        peer.banscore += factor;
        debug!("increasing banscore for peer {peer_id} by {factor}: {reason}");

        if peer.banscore >= max_banscore {
            warn!("banning peer {peer_id} for misbehaving ({reason})");

            let address = peer.address;
            peer.state = PeerStatus::Banned;
            peer.channel.send(NodeRequest::Shutdown)?;
            self.address_man.ban(address);
        }

        Ok(())
    }

    pub(crate) async fn handle_notification(
        &mut self,
        notification: NodeNotification,
    ) -> Result<(), WireError> {
        match notification {
            NodeNotification::Accepted(stream, address) => self.handle_inbound(stream, address),
            NodeNotification::FromPeer(peer, message) => match message {
                PeerMessages::Ready(info) => self.handle_peer_ready(peer, &info),
                PeerMessages::Disconnected => self.handle_disconnection(peer),
                PeerMessages::Misbehaving(factor, reason) => {
                    self.increase_banscore(peer, factor, reason)
                }
                PeerMessages::Addr(addresses) => self.handle_addr(peer, addresses),
                PeerMessages::GetAddr => self.handle_getaddr(peer),
                PeerMessages::Inv(inventory) => self.handle_inv(peer, inventory).await,
                PeerMessages::GetData(inventory) => self.handle_getdata(peer, inventory).await,
                PeerMessages::NotFound(inventory) => self.handle_notfound(peer, inventory),
                PeerMessages::GetBlocks(request) => self.handle_getblocks(peer, request),
                PeerMessages::GetHeaders(request) => self.handle_getheaders(peer, request),
                PeerMessages::Headers(headers) => self.handle_headers(peer, headers),
                PeerMessages::Block(block) => self.handle_block(peer, block).await,
                PeerMessages::Tx(tx) => self.handle_tx(peer, tx).await,
                PeerMessages::MemPool => self.handle_mempool_request(peer).await,
                PeerMessages::Reject(reject) => {
                    info!(
                        "received a reject from peer {peer}: msg={} code={:?} reason={}",
                        reject.message, reject.ccode, reject.reason
                    );
                    Ok(())
                }
                PeerMessages::CmpctBlock(compact) => {
                    self.handle_cmpctblock(peer, compact).await
                }
                PeerMessages::GetBlockTxn(request) => self.handle_getblocktxn(peer, request),
                PeerMessages::BlockTxn(transactions) => {
                    self.handle_blocktxn(peer, transactions).await
                }
                PeerMessages::SendCmpct { mode, witness } => {
                    if let Some(view) = self.peers.get_mut(peer) {
                        view.compact_mode = Some(mode);
                        view.compact_witness = witness;
                    }
                    Ok(())
                }
            },
        }
    }

    fn handle_inbound(
        &mut self,
        stream: TcpStream,
        address: SocketAddr,
    ) -> Result<(), WireError> {
        if self.peers.inbound() >= self.config.max_inbound {
            debug!("dropping inbound peer {address}: too many inbound connections");
            return Ok(());
        }

        if self.address_man.is_banned(&address.ip()) {
            debug!("dropping inbound peer {address}: banned");
            return Ok(());
        }

        if self.peers.has_addr(&address.ip()) {
            debug!("dropping inbound peer {address}: already connected");
            return Ok(());
        }

        info!("accepting inbound peer {address}");

        let peer_id = self.peer_id_count;
        self.peer_id_count += 1;

        let (requests_tx, requests_rx) = unbounded_channel();

        Peer::accept_connection(
            peer_id,
            stream,
            address,
            self.mempool.clone(),
            self.nonces.clone(),
            self.peer_opts(),
            self.node_tx.clone(),
            requests_rx,
        );

        self.peers.add(
            peer_id,
            LocalPeerView::new(address.ip(), address.port(), false, None, requests_tx),
        );

        Ok(())
    }

    /// Dial one address, registering the pending connection.
    pub(crate) fn open_connection(
        &mut self,
        address: LocalAddress,
        address_id: Option<usize>,
    ) -> PeerId {
        let peer_id = self.peer_id_count;
        self.peer_id_count += 1;

        if let Some(address_id) = address_id {
            self.address_man.mark_attempt(address_id);
        }

        debug!(
            "attempting connection with address={:?} (peer={peer_id})",
            address.get_net_address()
        );

        let socket = SocketAddr::new(address.get_net_address(), address.get_port());
        let (requests_tx, requests_rx) = unbounded_channel();

        tokio::spawn(Peer::create_outbound_connection(
            peer_id,
            socket,
            self.mempool.clone(),
            self.nonces.clone(),
            self.peer_opts(),
            self.node_tx.clone(),
            requests_rx,
        ));

        self.peers.add(
            peer_id,
            LocalPeerView::new(
                address.get_net_address(),
                address.get_port(),
                true,
                address_id,
                requests_tx,
            ),
        );

        peer_id
    }

    /// Pick an address worth dialing. Mirrors the candidate ladder of
    /// the address manager consumers: skip connected, local, banned,
    /// onion and service-poor entries, prefer recently untried ones and
    /// the canonical port for a while.
    fn get_addr_candidate(&mut self) -> Option<(Option<usize>, LocalAddress)> {
        if let Some(fixed) = &self.fixed_peer {
            if self.peers.has_addr(&fixed.get_net_address()) {
                return None;
            }
            return Some((None, fixed.clone()));
        }

        let now = unix_now();

        for i in 0..100 {
            let (id, entry) = self.address_man.get()?;
            let ip = entry.get_net_address();

            if self.peers.has_addr(&ip) {
                continue;
            }

            if self.address_man.is_local(&ip) {
                continue;
            }

            if self.address_man.is_banned(&ip) {
                continue;
            }

            if entry.get_port() == 0 {
                continue;
            }

            if entry.is_onion() {
                continue;
            }

            match self.config.only_net {
                NetPreference::Ipv4Only if !ip.is_ipv4() => continue,
                NetPreference::Ipv6Only if !ip.is_ipv6() => continue,
                _ => {}
            }

            if !entry.get_services().has(self.config.required_services) {
                continue;
            }

            if i < 30 && now.saturating_sub(entry.get_last_attempt()) < CANDIDATE_RETRY {
                continue;
            }

            if i < 50 && entry.get_port() != self.params.default_port {
                continue;
            }

            return Some((Some(id), entry));
        }

        None
    }

    /// Make sure we have a loader and `max_outbound` outbound peers.
    pub(crate) fn fill_outbound(&mut self) -> Result<(), WireError> {
        // With a fixed peer we only ever talk to that one address.
        if self.fixed_peer.is_some() && !self.peers.is_empty() {
            return Ok(());
        }

        if self.peers.loader().is_none() && !self.add_loader()? {
            return Ok(());
        }

        if self.peers.outbound() >= self.config.max_outbound {
            return Ok(());
        }

        let need =
            (self.config.max_outbound - self.peers.outbound()).min(self.address_man.size());

        if need == 0 {
            return Ok(());
        }

        debug!(
            "refilling {need} peers ({}/{})",
            self.peers.outbound(),
            self.config.max_outbound
        );

        for _ in 0..need {
            if self.peers.loader().is_none() {
                break;
            }

            let Some((address_id, address)) = self.get_addr_candidate() else {
                break;
            };

            self.open_connection(address, address_id);
        }

        Ok(())
    }

    /// Find a loader: repurpose an existing outbound peer, or dial one.
    fn add_loader(&mut self) -> Result<bool, WireError> {
        let candidate = self
            .peers
            .iter()
            .find(|(_, view)| view.outbound && !view.loader)
            .map(|(id, _)| id);

        if let Some(peer_id) = candidate {
            info!("repurposing peer {peer_id} for loader");
            self.peers.set_loader(peer_id);
            self.send_sync(peer_id)?;
            return Ok(true);
        }

        let Some((address_id, address)) = self.get_addr_candidate() else {
            return Ok(false);
        };

        info!("adding loader peer ({:?})", address.get_net_address());

        let peer_id = self.open_connection(address, address_id);
        self.peers.set_loader(peer_id);

        Ok(true)
    }

    fn handle_peer_ready(&mut self, peer_id: PeerId, info: &VersionInfo) -> Result<(), WireError> {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        view.state = PeerStatus::Ready;
        view.services = info.services;
        view.version = info.version;
        view.user_agent.clone_from(&info.user_agent);
        view.height = info.blocks.unsigned_abs();

        let outbound = view.outbound;
        let address_id = view.address_id;

        info!(
            "new peer id={peer_id} version={} blocks={} services={} agent={}",
            info.version, info.blocks, info.services, info.user_agent
        );

        // Inbound peers tell us which of our addresses the world sees.
        if !outbound {
            if let Some(our_addr) = info.our_addr {
                if is_routable(&our_addr) {
                    self.address_man.mark_local(our_addr);
                }
            }
        }

        if outbound {
            if let Some(address_id) = address_id {
                self.address_man.mark_success(address_id);
                self.address_man.mark_ack(address_id, info.services);
            }

            // Advertise the address our peers see us at, then go find
            // some more peers.
            if self.config.listen {
                if let Some(local) = self.local_address() {
                    self.send_to_peer(peer_id, NodeRequest::SendAddr(vec![local]))?;
                }
            }

            self.send_to_peer(peer_id, NodeRequest::GetAddr)?;
            if let Some(view) = self.peers.get_mut(peer_id) {
                view.getting_addr = true;
            }
        }

        // We want compact blocks!
        if self.config.bip152 {
            self.send_to_peer(
                peer_id,
                NodeRequest::SendCmpct {
                    mode: self.config.block_mode,
                },
            )?;
        }

        if outbound {
            self.send_sync(peer_id)?;

            // If the loader slot is held by a connection that never made
            // it, free it up.
            if let Some(loader) = self.peers.loader() {
                if loader != peer_id
                    && self
                        .peers
                        .get(loader)
                        .map_or(true, |view| view.state != PeerStatus::Ready)
                {
                    self.peers.clear_loader();
                }
            }

            if self.peers.loader().is_none() {
                self.peers.set_loader(peer_id);
                self.send_sync(peer_id)?;
            }
        }

        Ok(())
    }

    /// Our best guess of a routable address peers can dial us back at.
    fn local_address(&self) -> Option<(u32, Address)> {
        let ip = self.address_man.local_candidate()?;
        let port = self.config.port.unwrap_or(self.params.default_port);
        let socket = SocketAddr::new(ip, port);

        Some((
            unix_now() as u32,
            Address::new(&socket, self.peer_opts().services),
        ))
    }

    fn handle_disconnection(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        let Some(mut view) = self.peers.remove(peer_id) else {
            return Ok(());
        };

        if view.state == PeerStatus::Ready {
            info!("peer disconnected: {peer_id}");
        }

        if let Some(address_id) = view.address_id {
            match view.state {
                PeerStatus::Ready => {
                    self.address_man
                        .update_set_state(address_id, AddressState::Tried(unix_now()));
                }
                PeerStatus::Awaiting => {
                    self.address_man
                        .update_set_state(address_id, AddressState::Failed(unix_now()));
                }
                PeerStatus::Banned => {}
            }
        }

        // Give the hashes back to the pool: the peer's maps own them,
        // the pool-wide sets mirror them.
        let had_blocks = !view.blocks.is_empty();

        for hash in view.blocks.drain() {
            self.block_map.remove(&hash);
        }

        for txid in view.txs.drain() {
            self.tx_map.remove(&txid);
        }

        for hash in view.compact.keys() {
            self.compact_map.remove(hash);
        }

        if view.loader {
            info!("removed loader peer {peer_id}");
            if self.header_sync.is_some() {
                self.reset_header_chain();
            }
        }

        if self.chain.synced() && had_blocks {
            info!("peer {peer_id} disconnected with requested blocks, resending sync");
            self.resync(true)?;
        }

        Ok(())
    }

    /// Send a sync request (getheaders under checkpoints, getblocks
    /// otherwise) to a peer that isn't syncing yet.
    fn send_sync(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        if self.peers.get(peer_id).map_or(true, |view| view.syncing) {
            return Ok(());
        }

        let locator = self.chain.get_locator(None);
        self.send_locator(peer_id, locator)
    }

    fn send_locator(
        &mut self,
        peer_id: PeerId,
        locator: Vec<BlockHash>,
    ) -> Result<(), WireError> {
        let synced = self.chain.synced();
        let stop = self.header_sync.as_ref().map(|sync| sync.target().hash);
        let required = self.config.required_services;
        let request_mempool = self.params.request_mempool;

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        if view.state != PeerStatus::Ready {
            return Ok(());
        }

        if !view.services.has(required) {
            return Ok(());
        }

        if !view.loader && !synced {
            return Ok(());
        }

        // Ask for the mempool if we're synced.
        if request_mempool && view.loader && synced {
            view.channel.send(NodeRequest::MemPool)?;
        }

        view.syncing = true;
        view.block_time = Some(Instant::now());

        match stop {
            Some(stop) => {
                debug!("requesting headers from peer {peer_id} with getheaders");
                view.gh_time = Some(Instant::now());
                view.channel.send(NodeRequest::GetHeaders { locator, stop })?;
            }
            None => {
                debug!("requesting an inv from peer {peer_id} with getblocks");
                view.gb_time = Some(Instant::now());
                view.channel.send(NodeRequest::GetBlocks {
                    locator,
                    stop: BlockHash::all_zeros(),
                })?;
            }
        }

        Ok(())
    }

    /// Restart the sync conversation with every outbound peer.
    pub(crate) fn resync(&mut self, force: bool) -> Result<(), WireError> {
        let locator = self.chain.get_locator(None);

        for peer_id in self.peers.ids() {
            let Some(view) = self.peers.get(peer_id) else {
                continue;
            };

            if !view.outbound {
                continue;
            }

            if !force && view.syncing {
                continue;
            }

            self.send_locator(peer_id, locator.clone())?;
        }

        Ok(())
    }

    fn send_getheaders(
        &mut self,
        peer_id: PeerId,
        locator: Vec<BlockHash>,
        stop: BlockHash,
    ) -> Result<(), WireError> {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        debug!("requesting headers from peer {peer_id} with getheaders");
        view.gh_time = Some(Instant::now());
        view.channel.send(NodeRequest::GetHeaders { locator, stop })?;

        Ok(())
    }

    fn send_getblocks(
        &mut self,
        peer_id: PeerId,
        from: Option<BlockHash>,
        stop: BlockHash,
    ) -> Result<(), WireError> {
        let locator = self.chain.get_locator(from);

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        debug!("requesting an inv from peer {peer_id} with getblocks");
        view.gb_time = Some(Instant::now());
        view.channel.send(NodeRequest::GetBlocks { locator, stop })?;

        Ok(())
    }

    /// The inventory type we request blocks under for this peer.
    fn block_inv_type(&self, view: &LocalPeerView) -> fn(BlockHash) -> Inventory {
        let compact = self.config.bip152
            && view.version >= COMPACT_VERSION
            && view.version >= COMPACT_WITNESS_VERSION
            && view.services.has(ServiceFlags::WITNESS)
            && view.compact_mode.is_some()
            && view.compact_witness;

        if compact {
            return Inventory::CompactBlock;
        }

        if view.services.has(ServiceFlags::WITNESS) {
            return Inventory::WitnessBlock;
        }

        Inventory::Block
    }

    fn tx_inv_type(&self, view: &LocalPeerView) -> fn(Txid) -> Inventory {
        if view.services.has(ServiceFlags::WITNESS) {
            return Inventory::WitnessTransaction;
        }

        Inventory::Transaction
    }

    /// Register block requests on a peer and send out what fits its
    /// window. Hashes some other peer is already fetching are skipped.
    pub(crate) fn request_blocks(
        &mut self,
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
    ) -> Result<(), WireError> {
        if hashes.is_empty() {
            return Ok(());
        }

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        if view.state != PeerStatus::Ready {
            debug!("peer {peer_id} handshake not complete (getdata)");
            return Ok(());
        }

        for hash in hashes {
            if self.block_map.contains(&hash) {
                continue;
            }

            if !view.blocks.push(hash) {
                return self.close_peer(peer_id, "advertised too many blocks");
            }

            self.block_map.insert(hash);
        }

        self.dispatch_block_requests(peer_id)
    }

    /// Move queued block requests into the peer's window and emit the
    /// getdata.
    fn dispatch_block_requests(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        let synced = self.chain.synced();

        let Some(as_inv) = self.peers.get(peer_id).map(|view| self.block_inv_type(view)) else {
            return Ok(());
        };

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        let batch = view.blocks.fill(synced);

        if batch.is_empty() {
            return Ok(());
        }

        debug!(
            "requesting {}/{} blocks from peer {peer_id} with getdata",
            batch.len(),
            self.block_map.len()
        );

        let items = batch.into_iter().map(as_inv).collect();
        view.channel.send(NodeRequest::GetData(items))?;

        Ok(())
    }

    pub(crate) fn request_txs(
        &mut self,
        peer_id: PeerId,
        txids: Vec<Txid>,
    ) -> Result<(), WireError> {
        if txids.is_empty() {
            return Ok(());
        }

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        if view.state != PeerStatus::Ready {
            debug!("peer {peer_id} handshake not complete (getdata)");
            return Ok(());
        }

        for txid in txids {
            if self.tx_map.contains(&txid) {
                continue;
            }

            if !view.txs.push(txid) {
                return self.close_peer(peer_id, "advertised too many txs");
            }

            self.tx_map.insert(txid);
        }

        self.dispatch_tx_requests(peer_id)
    }

    fn dispatch_tx_requests(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        let synced = self.chain.synced();

        let Some(as_inv) = self.peers.get(peer_id).map(|view| self.tx_inv_type(view)) else {
            return Ok(());
        };

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        let batch = view.txs.fill(synced);

        if batch.is_empty() {
            return Ok(());
        }

        debug!(
            "requesting {}/{} txs from peer {peer_id} with getdata",
            batch.len(),
            self.tx_map.len()
        );

        let items = batch.into_iter().map(as_inv).collect();
        view.channel.send(NodeRequest::GetData(items))?;

        Ok(())
    }

    /// The peer answered (or notfound'd) a block we asked it for.
    fn resolve_block(&mut self, peer_id: PeerId, hash: &BlockHash) -> bool {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return false;
        };

        if !view.blocks.resolve(hash) {
            return false;
        }

        self.block_map.remove(hash);
        true
    }

    fn resolve_tx(&mut self, peer_id: PeerId, txid: &Txid) -> bool {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return false;
        };

        if !view.txs.resolve(txid) {
            return false;
        }

        self.tx_map.remove(txid);
        true
    }

    async fn handle_inv(
        &mut self,
        peer_id: PeerId,
        items: Vec<Inventory>,
    ) -> Result<(), WireError> {
        if items.len() > MAX_INV {
            return self.increase_banscore(peer_id, 100, "oversized inv");
        }

        let mut blocks = Vec::new();
        let mut txs = Vec::new();
        let mut unknown = None;

        for item in items {
            match item {
                Inventory::Block(hash) => blocks.push(hash),
                Inventory::Transaction(txid) => txs.push(txid),
                other => unknown = Some(other),
            }
        }

        debug!(
            "received inv from peer {peer_id}: blocks={} txs={}",
            blocks.len(),
            txs.len()
        );

        if let Some(item) = unknown {
            debug!("peer {peer_id} sent an unknown inv type: {item:?}");
        }

        if !blocks.is_empty() {
            self.handle_block_inv(peer_id, blocks)?;
        }

        if !txs.is_empty() {
            return self.handle_tx_inv(peer_id, txs).await;
        }

        Ok(())
    }

    fn handle_block_inv(
        &mut self,
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
    ) -> Result<(), WireError> {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        view.gb_time = None;
        let loader = view.loader;

        // Ignore for now if we're still syncing.
        if !self.chain.synced() && !loader {
            return Ok(());
        }

        // Under checkpoints we want headers, not invs.
        if self.header_sync.is_some() {
            return Ok(());
        }

        let last = hashes.last().copied();
        let mut out = Vec::new();

        for hash in hashes {
            // Ignore invalid.
            if self.chain.has_invalid(&hash) {
                continue;
            }

            // Resolve orphan chain.
            if self.chain.has_orphan(&hash) {
                debug!("peer {peer_id} sent a known orphan hash");
                self.resolve_orphan(peer_id, &hash)?;
                continue;
            }

            // Request the block if we don't have it.
            if !self.chain.has_hash(&hash) {
                out.push(hash);
                continue;
            }

            // Normally we request the hashContinue. In the odd case
            // where we already have it, do a getblocks from the last
            // hash to keep the conversation going.
            if Some(hash) == last {
                debug!("peer {peer_id} sent an existing hash");
                self.send_getblocks(peer_id, Some(hash), BlockHash::all_zeros())?;
            }
        }

        self.request_blocks(peer_id, out)
    }

    fn resolve_orphan(&mut self, peer_id: PeerId, hash: &BlockHash) -> Result<(), WireError> {
        let Some(root) = self.chain.get_orphan_root(hash) else {
            return Ok(());
        };

        self.send_getblocks(peer_id, None, root)
    }

    async fn handle_tx_inv(&mut self, peer_id: PeerId, txids: Vec<Txid>) -> Result<(), WireError> {
        if !self.chain.synced() {
            return Ok(());
        }

        let out: Vec<Txid> = {
            let mempool = self.mempool.lock().await;

            txids
                .into_iter()
                .filter(|txid| {
                    if mempool.has(txid) {
                        return false;
                    }
                    if mempool.has_reject(txid) {
                        debug!("saw known reject of {txid}");
                        return false;
                    }
                    true
                })
                .collect()
        };

        self.request_txs(peer_id, out)
    }

    async fn handle_block(&mut self, peer_id: PeerId, block: Block) -> Result<(), WireError> {
        let hash = block.block_hash();

        if !self.resolve_block(peer_id, &hash) && self.config.block_mode != 1 {
            return self.close_peer(peer_id, "sent an unrequested block");
        }

        if let Some(view) = self.peers.get_mut(peer_id) {
            view.block_time = Some(Instant::now());
        }

        if let Err(err) = self.chain.add_block(&block, peer_id) {
            return self.send_reject(peer_id, "block", hash.to_raw_hash(), err);
        }

        // Block was orphaned.
        if self.chain.has_orphan(&hash) {
            if self.header_sync.is_some() {
                debug!("peer {peer_id} sent an orphan block during header sync");
                return Ok(());
            }

            debug!("peer {peer_id} sent an orphan block, resolving");
            return self.resolve_orphan(peer_id, &hash);
        }

        if !self.synced && self.chain.synced() {
            self.synced = true;
            self.resync(false)?;
        }

        let height = self.chain.height();

        if height % 2000 == 0 {
            info!(
                "received 2000 more blocks (height={height}, progress={:.2}%, active={}, peers={})",
                self.chain.progress() * 100.0,
                self.block_map.len(),
                self.peers.len()
            );
        }

        self.resolve_chain(peer_id, &hash)?;
        self.dispatch_block_requests(peer_id)?;

        if self.chain.synced() {
            self.announce_block(&block)?;
        }

        Ok(())
    }

    /// Advance the checkpoint scaffold after a block connected.
    fn resolve_chain(&mut self, peer_id: PeerId, hash: &BlockHash) -> Result<(), WireError> {
        if self.header_sync.is_none() {
            return Ok(());
        }

        let Some(view) = self.peers.get(peer_id) else {
            return Ok(());
        };

        if !view.loader || view.state != PeerStatus::Ready {
            return Ok(());
        }

        let sync = self.header_sync.as_mut().expect("checked above");

        let Some(front) = sync.front().copied() else {
            return Ok(());
        };

        if *hash != front.hash {
            warn!(
                "header hash mismatch: {hash} != {} (peer={peer_id})",
                front.hash
            );
            return self.close_peer(peer_id, "bad header chain");
        }

        let last_checkpoint = self
            .params
            .last_checkpoint()
            .expect("header sync requires checkpoints")
            .height;

        if front.height < last_checkpoint {
            if front.height == sync.target().height {
                info!("received checkpoint {} ({})", front.hash, front.height);

                let next = *self
                    .params
                    .next_checkpoint(front.height)
                    .expect("not the last checkpoint");

                sync.set_target(next);
                return self.send_getheaders(peer_id, vec![*hash], next.hash);
            }

            self.header_sync.as_mut().expect("checked above").shift();
            return self.resolve_header_requests(peer_id);
        }

        info!("switching to getblocks (peer={peer_id})");
        self.header_sync = None;
        self.send_getblocks(peer_id, Some(*hash), BlockHash::all_zeros())
    }

    /// Queue the next span of checkpointed headers for download.
    fn resolve_header_requests(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        let Some(sync) = self.header_sync.as_mut() else {
            return Ok(());
        };

        let batch = sync.next_batch(MAX_INV);
        self.request_blocks(peer_id, batch)
    }

    fn handle_headers(
        &mut self,
        peer_id: PeerId,
        headers: Vec<Header>,
    ) -> Result<(), WireError> {
        if let Some(view) = self.peers.get_mut(peer_id) {
            view.gh_time = None;
        }

        if self.header_sync.is_none() {
            return Ok(());
        }

        if !self.peers.get(peer_id).is_some_and(|view| view.loader) {
            return Ok(());
        }

        if headers.is_empty() {
            return Ok(());
        }

        if headers.len() > MAX_HEADERS {
            return self.increase_banscore(peer_id, 100, "oversized headers");
        }

        enum Outcome {
            Ban(&'static str),
            Close(&'static str),
            Extended { checkpoint: bool, last: BlockHash },
        }

        let outcome = {
            let sync = self.header_sync.as_mut().expect("checked above");
            let target = sync.target();
            let mut checkpoint = false;
            let mut last = sync.tail().hash;
            let mut failed = None;

            for header in &headers {
                let tail = sync.tail();
                let height = tail.height + 1;

                if header.validate_pow(header.target()).is_err() {
                    failed = Some(Outcome::Ban("invalid header"));
                    break;
                }

                if header.prev_blockhash != tail.hash {
                    failed = Some(Outcome::Close("bad header chain"));
                    break;
                }

                let hash = header.block_hash();

                if height == target.height {
                    if hash != target.hash {
                        failed = Some(Outcome::Close("invalid checkpoint"));
                        break;
                    }
                    checkpoint = true;
                }

                sync.append(hash, height);
                last = hash;
            }

            failed.unwrap_or(Outcome::Extended { checkpoint, last })
        };

        match outcome {
            Outcome::Ban(reason) => self.increase_banscore(peer_id, 100, reason),
            Outcome::Close(reason) => self.close_peer(peer_id, reason),
            Outcome::Extended { checkpoint, last } => {
                debug!("received {} headers from peer {peer_id}", headers.len());

                // A valid header chain counts as block progress.
                if let Some(view) = self.peers.get_mut(peer_id) {
                    view.block_time = Some(Instant::now());
                }

                if checkpoint {
                    // Request the blocks we just added.
                    self.header_sync.as_mut().expect("checked above").shift();
                    return self.resolve_header_requests(peer_id);
                }

                // Request more headers.
                let stop = self.header_sync.as_ref().expect("checked above").target().hash;
                self.send_getheaders(peer_id, vec![last], stop)
            }
        }
    }

    async fn handle_tx(&mut self, peer_id: PeerId, tx: Transaction) -> Result<(), WireError> {
        let txid = tx.compute_txid();

        if !self.resolve_tx(peer_id, &txid) {
            return self.close_peer(peer_id, "sent an unrequested tx");
        }

        let added = self.mempool.lock().await.add(tx.clone(), peer_id);

        if let Err(err) = added {
            return self.send_reject(peer_id, "tx", txid.to_raw_hash(), err);
        }

        if self.mempool.lock().await.has_orphan(&txid) {
            let missing = self.mempool.lock().await.missing(&tx);

            debug!(
                "requesting {} missing transactions from peer {peer_id}",
                missing.len()
            );

            return self.request_txs(peer_id, missing);
        }

        self.announce_tx(txid)?;
        self.dispatch_tx_requests(peer_id)
    }

    fn handle_notfound(
        &mut self,
        peer_id: PeerId,
        items: Vec<Inventory>,
    ) -> Result<(), WireError> {
        for item in items {
            let resolved = match item {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    self.resolve_tx(peer_id, &txid)
                }
                Inventory::Block(hash)
                | Inventory::WitnessBlock(hash)
                | Inventory::CompactBlock(hash) => self.resolve_block(peer_id, &hash),
                _ => false,
            };

            if !resolved {
                return self.close_peer(peer_id, "sent notfound for an unrequested item");
            }
        }

        Ok(())
    }

    /// Send a reject naming the offending message, then apply the verify
    /// error's ban score.
    fn send_reject(
        &mut self,
        peer_id: PeerId,
        message: &'static str,
        hash: bitcoin::hashes::sha256d::Hash,
        err: VerifyError,
    ) -> Result<(), WireError> {
        let reject = Reject {
            message: message.into(),
            ccode: err.code,
            reason: err.reason.into(),
            hash,
        };

        self.send_to_peer(peer_id, NodeRequest::SendReject(reject))?;
        self.increase_banscore(peer_id, err.score, err.reason)
    }

    // Serving

    async fn handle_getdata(
        &mut self,
        peer_id: PeerId,
        items: Vec<Inventory>,
    ) -> Result<(), WireError> {
        if items.len() > MAX_INV {
            return self.increase_banscore(peer_id, 100, "oversized getdata");
        }

        let hash_continue = self.peers.get(peer_id).and_then(|view| view.hash_continue);
        let mut notfound = Vec::new();
        let mut served_blocks = 0_usize;
        let mut served_txs = 0_usize;

        for item in items {
            match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    match self.chain.get_block(&hash) {
                        Some(block) => {
                            self.send_to_peer(peer_id, NodeRequest::SendBlock(block))?;
                            served_blocks += 1;
                        }
                        None => notfound.push(item),
                    }
                }
                Inventory::CompactBlock(hash) => match self.chain.get_block(&hash) {
                    Some(block) => {
                        // Compact form only makes sense near the tip.
                        let depth_ok = self
                            .chain
                            .height_of(&hash)
                            .is_some_and(|height| height + 10 >= self.chain.height());

                        if depth_ok {
                            self.send_to_peer(peer_id, NodeRequest::SendCmpctBlock(block))?;
                        } else {
                            self.send_to_peer(peer_id, NodeRequest::SendBlock(block))?;
                        }
                        served_blocks += 1;
                    }
                    None => notfound.push(item),
                },
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    match self.mempool.lock().await.get(&txid) {
                        Some(tx) => {
                            self.send_to_peer(peer_id, NodeRequest::SendTx(tx))?;
                            served_txs += 1;
                        }
                        None => notfound.push(item),
                    }
                }
                other => {
                    debug!("peer {peer_id} sent an unknown getdata type: {other:?}");
                    notfound.push(other);
                }
            }

            // The hashContinue trick: when the peer fetches the last
            // block of a getblocks page, nudge it with our tip.
            if let Some(cont) = hash_continue {
                let served = match item {
                    Inventory::Block(hash)
                    | Inventory::WitnessBlock(hash)
                    | Inventory::CompactBlock(hash) => hash == cont,
                    _ => false,
                };

                if served {
                    let tip = self.chain.tip();
                    self.send_to_peer(peer_id, NodeRequest::SendInv(vec![Inventory::Block(tip)]))?;
                    if let Some(view) = self.peers.get_mut(peer_id) {
                        view.hash_continue = None;
                    }
                }
            }
        }

        if served_blocks > 0 {
            debug!(
                "served {served_blocks} blocks to peer {peer_id} (notfound={})",
                notfound.len()
            );
        }

        if served_txs > 0 {
            debug!(
                "served {served_txs} txs to peer {peer_id} (notfound={})",
                notfound.len()
            );
        }

        if !notfound.is_empty() {
            self.send_to_peer(peer_id, NodeRequest::SendNotFound(notfound))?;
        }

        Ok(())
    }

    fn handle_getblocks(
        &mut self,
        peer_id: PeerId,
        request: GetBlocksMessage,
    ) -> Result<(), WireError> {
        if !self.chain.synced() {
            return Ok(());
        }

        let from = self.chain.find_locator(&request.locator_hashes);
        let Some(mut height) = self.chain.height_of(&from) else {
            return Ok(());
        };

        let mut items = Vec::new();
        let mut hash_continue = None;

        loop {
            height += 1;

            let Some(hash) = self.chain.block_hash_at(height) else {
                break;
            };

            if hash == request.stop_hash {
                break;
            }

            items.push(Inventory::Block(hash));

            if items.len() == GETBLOCKS_PAGE {
                hash_continue = Some(hash);
                break;
            }
        }

        if let Some(view) = self.peers.get_mut(peer_id) {
            view.hash_continue = hash_continue;
        }

        self.send_to_peer(peer_id, NodeRequest::SendInv(items))
    }

    fn handle_getheaders(
        &mut self,
        peer_id: PeerId,
        request: GetHeadersMessage,
    ) -> Result<(), WireError> {
        if !self.chain.synced() {
            return Ok(());
        }

        let mut headers = Vec::new();

        if request.locator_hashes.is_empty() {
            // A bare stop hash asks for that one header.
            if let Some(header) = self.chain.header(&request.stop_hash) {
                headers.push(header);
            }
        } else {
            let from = self.chain.find_locator(&request.locator_hashes);
            let Some(mut height) = self.chain.height_of(&from) else {
                return Ok(());
            };

            loop {
                height += 1;

                let Some(hash) = self.chain.block_hash_at(height) else {
                    break;
                };

                let Some(header) = self.chain.header(&hash) else {
                    break;
                };

                headers.push(header);

                if hash == request.stop_hash || headers.len() == MAX_HEADERS {
                    break;
                }
            }
        }

        self.send_to_peer(peer_id, NodeRequest::SendHeaders(headers))
    }

    async fn handle_mempool_request(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        if !self.chain.synced() {
            return Ok(());
        }

        if !self.config.bip37 {
            debug!("peer {peer_id} requested mempool without bip37 enabled");
            return self.close_peer(peer_id, "mempool request without bip37");
        }

        let txids = self.mempool.lock().await.txids();

        debug!("sending mempool snapshot to peer {peer_id}");

        for page in txids.chunks(1000) {
            let items = page.iter().copied().map(Inventory::Transaction).collect();
            self.send_to_peer(peer_id, NodeRequest::SendInv(items))?;
        }

        Ok(())
    }

    fn handle_getaddr(&mut self, peer_id: PeerId) -> Result<(), WireError> {
        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        if view.outbound {
            debug!("ignoring getaddr from outbound peer {peer_id}");
            return Ok(());
        }

        if view.sent_addr {
            debug!("ignoring repeated getaddr from peer {peer_id}");
            return Ok(());
        }

        view.sent_addr = true;

        let mut out = Vec::new();

        for entry in self.address_man.iter() {
            let ip = entry.get_net_address();
            let socket = SocketAddr::new(ip, entry.get_port());
            let address = Address::new(&socket, entry.get_services());
            let key = addr_key(&address);

            if view.addr_filter.contains(&key) {
                continue;
            }

            view.addr_filter.insert(&key);
            out.push((entry.get_last_connected() as u32, address));

            if out.len() == MAX_ADDR {
                break;
            }
        }

        debug!("sending {} addrs to peer {peer_id}", out.len());

        if !out.is_empty() {
            view.channel.send(NodeRequest::SendAddr(out))?;
        }

        Ok(())
    }

    fn handle_addr(
        &mut self,
        peer_id: PeerId,
        addresses: Vec<(u32, Address)>,
    ) -> Result<(), WireError> {
        if addresses.len() > MAX_ADDR {
            return self.increase_banscore(peer_id, 100, "oversized addr");
        }

        let count = addresses.len();
        let required = self.config.required_services;
        let now = unix_now();
        let since = now.saturating_sub(10 * 60);

        let getting_addr = self
            .peers
            .get(peer_id)
            .map(|view| view.getting_addr)
            .unwrap_or(false);

        let mut relay = Vec::new();

        for (time, address) in addresses {
            if let Some(view) = self.peers.get_mut(peer_id) {
                view.addr_filter.insert(&addr_key(&address));
            }

            let Ok(socket) = address.socket_addr() else {
                continue;
            };

            if !is_routable(&socket.ip()) {
                continue;
            }

            if !address.services.has(required) {
                continue;
            }

            if socket.port() == 0 {
                continue;
            }

            if self.address_man.is_banned(&socket.ip()) {
                continue;
            }

            if !getting_addr && count < 10 && u64::from(time) > since {
                relay.push((time, address.clone()));
            }

            let addr = match socket.ip() {
                IpAddr::V4(ip) => AddrV2::Ipv4(ip),
                IpAddr::V6(ip) => AddrV2::Ipv6(ip),
            };

            self.address_man.push_addresses(&[LocalAddress::new(
                addr,
                u64::from(time),
                AddressState::NeverTried,
                address.services,
                socket.port(),
                rand::random(),
            )]);
        }

        if count < MAX_ADDR {
            if let Some(view) = self.peers.get_mut(peer_id) {
                view.getting_addr = false;
            }
        }

        debug!(
            "received {count} addrs from peer {peer_id} (hosts={}, peers={})",
            self.address_man.size(),
            self.peers.len()
        );

        if !relay.is_empty() {
            self.relay_addresses(&relay)?;
        }

        Ok(())
    }

    /// Gossip fresh addresses to two peers picked by hashing the
    /// address, so every node forwards a given address along the same
    /// two edges.
    fn relay_addresses(&mut self, relay: &[(u32, Address)]) -> Result<(), WireError> {
        debug!("relaying {} addrs to peers", relay.len());

        let connected: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, view)| view.state == PeerStatus::Ready)
            .map(|(id, _)| id)
            .collect();

        if connected.is_empty() {
            return Ok(());
        }

        for (time, address) in relay {
            let ip = ip16(address);
            let first = connected[murmur_pick(&ip, 0, connected.len())];
            let second = connected[murmur_pick(&ip, 1, connected.len())];

            for target in [first, second] {
                let Some(view) = self.peers.get_mut(target) else {
                    continue;
                };

                let key = addr_key(address);

                if view.addr_filter.contains(&key) {
                    continue;
                }

                view.addr_filter.insert(&key);
                view.channel
                    .send(NodeRequest::SendAddr(vec![(*time, address.clone())]))?;
            }
        }

        Ok(())
    }

    // Compact blocks

    /// Ask for the old-fashioned full block after a compact attempt
    /// fell through.
    fn get_full_block(&mut self, peer_id: PeerId, hash: BlockHash) -> Result<(), WireError> {
        let Some(view) = self.peers.get(peer_id) else {
            return Ok(());
        };

        let item = if view.services.has(ServiceFlags::WITNESS) {
            Inventory::WitnessBlock(hash)
        } else {
            Inventory::Block(hash)
        };

        self.send_to_peer(peer_id, NodeRequest::GetData(vec![item]))
    }

    async fn handle_cmpctblock(
        &mut self,
        peer_id: PeerId,
        compact: HeaderAndShortIds,
    ) -> Result<(), WireError> {
        let hash = compact.header.block_hash();

        if !self.config.bip152 {
            return self.close_peer(peer_id, "sent an unsolicited cmpctblock");
        }

        let Some(view) = self.peers.get(peer_id) else {
            return Ok(());
        };

        let supported = view.version >= COMPACT_VERSION
            && view.version >= COMPACT_WITNESS_VERSION
            && view.services.has(ServiceFlags::WITNESS);
        let negotiated = view.compact_mode.is_some() && view.compact_witness;

        if !supported || !negotiated {
            return self.close_peer(peer_id, "sent an unsolicited cmpctblock");
        }

        if view.compact.contains_key(&hash) {
            debug!("peer {peer_id} sent a duplicate compact block");
            return Ok(());
        }

        if self.compact_map.contains(&hash) {
            debug!("already waiting for compact block {hash}");
            return Ok(());
        }

        let requested = view.blocks.contains(&hash);
        let witness = view.compact_witness;

        if !requested {
            // Only high-bandwidth mode tolerates unsolicited pushes.
            if self.config.block_mode != 1 {
                return self.close_peer(peer_id, "sent an unrequested compact block");
            }

            if let Some(view) = self.peers.get_mut(peer_id) {
                view.blocks.push_in_flight(hash);
                self.block_map.insert(hash);
            }
        }

        if compact.header.validate_pow(compact.header.target()).is_err() {
            return self.increase_banscore(peer_id, 100, "invalid compact block header");
        }

        let mut block = match CompactBlock::setup(&compact, witness) {
            Ok(block) => block,
            Err(CompactError::Invalid) => {
                return self.increase_banscore(peer_id, 100, "invalid compact block");
            }
            Err(CompactError::Collision) => {
                debug!("siphash collision for {hash}, requesting full block");
                self.get_full_block(peer_id, hash)?;
                return self.increase_banscore(peer_id, 10, "siphash collision");
            }
        };

        let complete = {
            let mempool = self.mempool.lock().await;
            let snapshot: Vec<Transaction> = mempool
                .txids()
                .iter()
                .filter_map(|txid| mempool.get(txid))
                .collect();
            block.fill_mempool(snapshot)
        };

        if complete {
            debug!("received full compact block {hash} from peer {peer_id}");

            let Some(full) = block.finalize() else {
                return self.increase_banscore(peer_id, 100, "invalid compact block");
            };

            return self.handle_block(peer_id, full).await;
        }

        let Some(view) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };

        if view.compact.len() >= MAX_COMPACT_BLOCKS {
            return self.close_peer(peer_id, "compact block DoS attempt");
        }

        let indexes = block.missing_indexes();

        debug!(
            "received non-full compact block {hash} tx={}/{} (peer={peer_id})",
            block.total() - block.missing_count(),
            block.total()
        );

        self.compact_map.insert(hash);
        view.compact.insert(hash, block);

        view.channel
            .send(NodeRequest::GetBlockTxn(BlockTransactionsRequest {
                block_hash: hash,
                indexes,
            }))?;

        Ok(())
    }

    async fn handle_blocktxn(
        &mut self,
        peer_id: PeerId,
        response: BlockTransactions,
    ) -> Result<(), WireError> {
        let hash = response.block_hash;

        let Some(mut block) = self
            .peers
            .get_mut(peer_id)
            .and_then(|view| view.compact.remove(&hash))
        else {
            debug!("peer {peer_id} sent an unsolicited blocktxn");
            return Ok(());
        };

        self.compact_map.remove(&hash);

        if !block.fill_missing(&response.transactions) {
            debug!("peer {peer_id} sent a non-full blocktxn for {hash}, requesting full block");
            self.get_full_block(peer_id, hash)?;
            return self.increase_banscore(peer_id, 10, "non-full blocktxn");
        }

        debug!("filled compact block {hash} (peer={peer_id})");

        let Some(full) = block.finalize() else {
            return self.increase_banscore(peer_id, 100, "invalid compact block");
        };

        self.handle_block(peer_id, full).await
    }

    fn handle_getblocktxn(
        &mut self,
        peer_id: PeerId,
        request: BlockTransactionsRequest,
    ) -> Result<(), WireError> {
        let hash = request.block_hash;

        let Some(height) = self.chain.height_of(&hash) else {
            return self.increase_banscore(peer_id, 100, "getblocktxn for an unknown block");
        };

        if height + MAX_BLOCKTXN_DEPTH < self.chain.height() {
            debug!("peer {peer_id} sent a getblocktxn for a block > 15 deep");
            return Ok(());
        }

        let Some(block) = self.chain.get_block(&hash) else {
            return self.send_to_peer(
                peer_id,
                NodeRequest::SendNotFound(vec![Inventory::Block(hash)]),
            );
        };

        let transactions: Option<Vec<Transaction>> = request
            .indexes
            .iter()
            .map(|index| block.txdata.get(*index as usize).cloned())
            .collect();

        let Some(transactions) = transactions else {
            return self.increase_banscore(peer_id, 100, "getblocktxn index out of range");
        };

        debug!("sending blocktxn for {hash} to peer {peer_id}");

        self.send_to_peer(
            peer_id,
            NodeRequest::SendBlockTxn(BlockTransactions {
                block_hash: hash,
                transactions,
            }),
        )
    }

    // Announcements

    /// Tell every connected peer about a block, each in the shape it
    /// asked for.
    pub fn announce_block(&mut self, block: &Block) -> Result<(), WireError> {
        for peer_id in self.peers.ids() {
            let Some(view) = self.peers.get(peer_id) else {
                continue;
            };

            if view.state != PeerStatus::Ready {
                continue;
            }

            view.channel.send(NodeRequest::AnnounceBlock(block.clone()))?;
        }

        Ok(())
    }

    /// Tell every connected peer about a transaction we accepted.
    pub fn announce_tx(&mut self, txid: Txid) -> Result<(), WireError> {
        for peer_id in self.peers.ids() {
            let Some(view) = self.peers.get(peer_id) else {
                continue;
            };

            if view.state != PeerStatus::Ready {
                continue;
            }

            view.channel.send(NodeRequest::AnnounceTx(txid))?;
        }

        Ok(())
    }

    // Stall detection

    /// Catch peers that accepted a request and never delivered.
    pub(crate) fn check_for_stalls(&mut self) -> Result<(), WireError> {
        let synced = self.chain.synced();
        let now = Instant::now();
        let mut stalled: Vec<(PeerId, &'static str)> = Vec::new();

        for (peer_id, view) in self.peers.iter() {
            if view.state != PeerStatus::Ready {
                continue;
            }

            if !synced {
                if let Some(gb_time) = view.gb_time {
                    if now > gb_time + GB_TIMEOUT {
                        stalled.push((peer_id, "stalling (inv)"));
                        continue;
                    }
                }
            }

            if let Some(gh_time) = view.gh_time {
                if now > gh_time + GH_TIMEOUT {
                    stalled.push((peer_id, "stalling (headers)"));
                    continue;
                }
            }

            if view.syncing && view.loader && !synced {
                if let Some(block_time) = view.block_time {
                    if now > block_time + LOADER_BLOCK_TIMEOUT {
                        stalled.push((peer_id, "stalling (block)"));
                        continue;
                    }
                }
            }

            if synced || !view.syncing {
                if view.blocks.stalled(REQUEST_TIMEOUT) {
                    stalled.push((peer_id, "stalling (block)"));
                    continue;
                }

                if view.txs.stalled(REQUEST_TIMEOUT) {
                    stalled.push((peer_id, "stalling (tx)"));
                    continue;
                }

                if view
                    .compact
                    .values()
                    .any(|block| now > block.received + COMPACT_TIMEOUT)
                {
                    stalled.push((peer_id, "stalling (blocktxn)"));
                    continue;
                }
            }
        }

        for (peer_id, reason) in stalled {
            self.close_peer(peer_id, reason)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NetPreference;
    use super::PoolConfig;
    use crate::p2p::tests::utils::MockChain;
    use crate::p2p::Pool;

    fn check_address_resolving(address: &str, port: u16, should_succeed: bool, description: &str) {
        let result = Pool::<MockChain>::resolve_connect_host(address, port);
        if should_succeed {
            assert!(result.is_ok(), "Failed: {description}");
        } else {
            assert!(result.is_err(), "Unexpected success: {description}");
        }
    }

    #[test]
    fn test_parse_address() {
        // IPv6 Tests
        check_address_resolving("[::1]", 8333, true, "Valid IPv6 without port");
        check_address_resolving("[::1", 8333, false, "Invalid IPv6 format");
        check_address_resolving("[::1]:8333", 8333, true, "Valid IPv6 with port");
        check_address_resolving(
            "[::1]:8333:8333",
            8333,
            false,
            "Invalid IPv6 with multiple ports",
        );

        // IPv4 Tests
        check_address_resolving("127.0.0.1", 8333, true, "Valid IPv4 without port");
        check_address_resolving("321.321.321.321", 8333, false, "Invalid IPv4 format");
        check_address_resolving("127.0.0.1:8333", 8333, true, "Valid IPv4 with port");
        check_address_resolving(
            "127.0.0.1:8333:8333",
            8333,
            false,
            "Invalid IPv4 with multiple ports",
        );

        // Edge Cases
        check_address_resolving("", 8333, true, "Empty string address");
        check_address_resolving(
            " 127.0.0.1:8333 ",
            8333,
            false,
            "Address with leading/trailing spaces",
        );
        check_address_resolving("127.0.0.1:0", 0, true, "Valid address with port 0");
        check_address_resolving(
            "127.0.0.1:65535",
            65535,
            true,
            "Valid address with maximum port",
        );
        check_address_resolving(
            "127.0.0.1:65536",
            65535,
            false,
            "Valid address with out-of-range port",
        );
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();

        assert_eq!(config.max_outbound, 8);
        assert_eq!(config.max_inbound, 8);
        assert_eq!(config.block_mode, 0);
        assert_eq!(config.only_net, NetPreference::Any);
        assert!(!config.checkpoints);
        assert!(!config.bip37);
        assert!(!config.bip152);
    }
}
