// SPDX-License-Identifier: MIT

//! The set of live connections, as the pool sees them. Each peer actor
//! owns its socket; what lives here is the pool-side view: identity,
//! handshake results, sync bookkeeping, relay filters and the request
//! accounting. Indexed by peer id and by remote address, iterated in
//! insertion order, with a single loader slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use bitcoin::Txid;
use madeira_common::constants::MAX_BLOCK_REQUEST;
use madeira_common::constants::MAX_INV;
use madeira_common::constants::MAX_TX_REQUEST;
use madeira_common::RollingFilter;
use tokio::sync::mpsc::UnboundedSender;

use super::compact::CompactBlock;
use super::pool::NodeRequest;
use super::requests::RequestTracker;

pub type PeerId = u32;

/// Deadline spread inside one getdata batch, so a large batch doesn't
/// time out all at once.
const BLOCK_STAGGER: std::time::Duration = std::time::Duration::from_millis(100);
const TX_STAGGER: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum PeerStatus {
    /// Dialed or accepted, handshake still pending
    Awaiting,
    /// Handshake complete
    Ready,
    /// Shut down for misbehavior
    Banned,
}

pub struct LocalPeerView {
    pub(crate) state: PeerStatus,
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
    pub(crate) outbound: bool,
    pub(crate) loader: bool,
    pub(crate) channel: UnboundedSender<NodeRequest>,
    pub(crate) services: ServiceFlags,
    pub(crate) version: u32,
    pub(crate) user_agent: String,
    pub(crate) height: u32,
    pub(crate) banscore: u32,
    /// Address manager entry this connection came from, for outbound
    pub(crate) address_id: Option<usize>,
    pub(crate) syncing: bool,
    /// We already answered this peer's getaddr
    pub(crate) sent_addr: bool,
    /// We asked this peer for addresses and wait for the reply
    pub(crate) getting_addr: bool,
    /// Last block (or header batch) this peer made progress with
    pub(crate) block_time: Option<Instant>,
    /// When we sent an unanswered getblocks
    pub(crate) gb_time: Option<Instant>,
    /// When we sent an unanswered getheaders
    pub(crate) gh_time: Option<Instant>,
    /// Addresses this peer already knows about
    pub(crate) addr_filter: RollingFilter,
    pub(crate) blocks: RequestTracker<BlockHash>,
    pub(crate) txs: RequestTracker<Txid>,
    pub(crate) compact: HashMap<BlockHash, CompactBlock>,
    /// getblocks paging: when we serve this hash, re-inv our tip
    pub(crate) hash_continue: Option<BlockHash>,
    /// sendcmpct mode the peer asked for, if any
    pub(crate) compact_mode: Option<u8>,
    pub(crate) compact_witness: bool,
}

impl LocalPeerView {
    pub(crate) fn new(
        address: IpAddr,
        port: u16,
        outbound: bool,
        address_id: Option<usize>,
        channel: UnboundedSender<NodeRequest>,
    ) -> Self {
        LocalPeerView {
            state: PeerStatus::Awaiting,
            address,
            port,
            outbound,
            loader: false,
            channel,
            services: ServiceFlags::NONE,
            version: 0,
            user_agent: String::new(),
            height: 0,
            banscore: 0,
            address_id,
            syncing: false,
            sent_addr: false,
            getting_addr: false,
            block_time: None,
            gb_time: None,
            gh_time: None,
            addr_filter: RollingFilter::new(5000, 0.001),
            blocks: RequestTracker::new(MAX_BLOCK_REQUEST, MAX_INV, BLOCK_STAGGER),
            txs: RequestTracker::new(MAX_TX_REQUEST, MAX_INV, TX_STAGGER),
            compact: HashMap::new(),
            hash_continue: None,
            compact_mode: None,
            compact_witness: false,
        }
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, LocalPeerView>,
    by_addr: HashMap<IpAddr, PeerId>,
    /// Insertion order, for deterministic iteration and relay picks
    order: Vec<PeerId>,
    loader: Option<PeerId>,
    inbound: usize,
    outbound: usize,
}

impl PeerRegistry {
    /// Track a new connection. Fails if we already have one to that
    /// address.
    pub fn add(&mut self, id: PeerId, peer: LocalPeerView) -> bool {
        if self.by_addr.contains_key(&peer.address) || self.peers.contains_key(&id) {
            return false;
        }

        if peer.outbound {
            self.outbound += 1;
        } else {
            self.inbound += 1;
        }

        self.by_addr.insert(peer.address, id);
        self.order.push(id);
        self.peers.insert(id, peer);

        true
    }

    pub fn remove(&mut self, id: PeerId) -> Option<LocalPeerView> {
        let peer = self.peers.remove(&id)?;

        self.by_addr.remove(&peer.address);
        self.order.retain(|&other| other != id);

        if peer.outbound {
            self.outbound -= 1;
        } else {
            self.inbound -= 1;
        }

        if self.loader == Some(id) {
            self.loader = None;
        }

        Some(peer)
    }

    pub fn get(&self, id: PeerId) -> Option<&LocalPeerView> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut LocalPeerView> {
        self.peers.get_mut(&id)
    }

    pub fn has_addr(&self, addr: &IpAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn by_addr(&self, addr: &IpAddr) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    pub fn loader(&self) -> Option<PeerId> {
        self.loader
    }

    /// Promote an outbound peer to loader. There is at most one.
    pub fn set_loader(&mut self, id: PeerId) -> bool {
        debug_assert!(self.loader.is_none());

        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };

        if !peer.outbound {
            return false;
        }

        peer.loader = true;
        self.loader = Some(id);
        true
    }

    /// Demote the current loader, if any.
    pub fn clear_loader(&mut self) {
        if let Some(id) = self.loader.take() {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.loader = false;
            }
        }
    }

    /// Peer ids in insertion order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &LocalPeerView)> {
        self.order
            .iter()
            .filter_map(|id| self.peers.get(id).map(|peer| (*id, peer)))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn inbound(&self) -> usize {
        self.inbound
    }

    pub fn outbound(&self) -> usize {
        self.outbound
    }
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use tokio::sync::mpsc::unbounded_channel;

    use super::LocalPeerView;
    use super::PeerRegistry;

    fn view(last_octet: u8, outbound: bool) -> LocalPeerView {
        let (tx, _rx) = unbounded_channel();
        LocalPeerView::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            8333,
            outbound,
            None,
            tx,
        )
    }

    #[test]
    fn test_counters_match_length() {
        let mut peers = PeerRegistry::default();

        assert!(peers.add(1, view(1, true)));
        assert!(peers.add(2, view(2, false)));
        assert!(peers.add(3, view(3, true)));

        assert_eq!(peers.inbound() + peers.outbound(), peers.len());
        assert_eq!(peers.outbound(), 2);

        peers.remove(1);
        assert_eq!(peers.inbound() + peers.outbound(), peers.len());
        assert_eq!(peers.outbound(), 1);
    }

    #[test]
    fn test_duplicate_addr_rejected() {
        let mut peers = PeerRegistry::default();

        assert!(peers.add(1, view(1, true)));
        assert!(!peers.add(2, view(1, false)));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_loader_slot() {
        let mut peers = PeerRegistry::default();
        peers.add(1, view(1, true));
        peers.add(2, view(2, false));

        // inbound peers can't be the loader
        assert!(!peers.set_loader(2));
        assert!(peers.set_loader(1));
        assert_eq!(peers.loader(), Some(1));
        assert!(peers.get(1).unwrap().loader);

        // removing the loader frees the slot
        peers.remove(1);
        assert_eq!(peers.loader(), None);
    }

    #[test]
    fn test_iteration_order() {
        let mut peers = PeerRegistry::default();
        for id in [5, 1, 9] {
            peers.add(id, view(id as u8, true));
        }

        let ids: Vec<_> = peers.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![5, 1, 9]);
    }
}
