// SPDX-License-Identifier: MIT

//! Address manager is a module that keeps track of known peer addresses and associated
//! metadata. This module is very important in keeping our node protected against targeted
//! attacks, like eclipse attacks.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::p2p::address::AddrV2;
use bitcoin::p2p::ServiceFlags;
use log::info;
use madeira_common::constants::BAN_TIME;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use super::error::WireError;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs()
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddressState {
    /// We never tried this peer before, so we don't know what to expect. This variant
    /// also applies to peers that we tried to connect, but failed or we didn't connect
    /// to for a long time.
    NeverTried,
    /// We tried this peer before, and had success at least once, so we know what to expect
    Tried(u64),
    /// We are connected to this peer right now
    Connected,
    /// We tried connecting, but failed
    Failed(u64),
}

/// How do we store peers locally
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAddress {
    /// An actual address
    address: AddrV2,
    /// Last time we successfully connected to this peer, only relevant if state == Tried
    last_connected: u64,
    /// Our local state for this peer, as defined in AddressState
    state: AddressState,
    /// Network services announced by this peer
    services: ServiceFlags,
    /// Network port this peer listens to
    port: u16,
    /// Last time we tried dialing this peer
    last_attempt: u64,
    /// Random id for this peer
    pub id: usize,
}

impl From<AddrV2> for LocalAddress {
    fn from(value: AddrV2) -> Self {
        LocalAddress {
            address: value,
            last_connected: unix_now(),
            state: AddressState::NeverTried,
            services: ServiceFlags::NONE,
            port: 8333,
            last_attempt: 0,
            id: rand::random::<usize>(),
        }
    }
}

impl LocalAddress {
    pub fn new(
        address: AddrV2,
        last_connected: u64,
        state: AddressState,
        services: ServiceFlags,
        port: u16,
        id: usize,
    ) -> LocalAddress {
        LocalAddress {
            address,
            last_connected,
            state,
            services,
            port,
            last_attempt: 0,
            id,
        }
    }

    /// Returns this address's port
    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Return an IP address associated with this peer address
    pub fn get_net_address(&self) -> IpAddr {
        match self.address {
            AddrV2::Ipv4(ipv4) => IpAddr::V4(ipv4),
            AddrV2::Ipv6(ipv6) => IpAddr::V6(ipv6),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// Returns the actual address, as defined in AddrV2
    pub fn get_address(&self) -> AddrV2 {
        self.address.clone()
    }

    pub fn get_services(&self) -> ServiceFlags {
        self.services
    }

    pub fn get_last_connected(&self) -> u64 {
        self.last_connected
    }

    pub fn get_last_attempt(&self) -> u64 {
        self.last_attempt
    }

    pub fn is_onion(&self) -> bool {
        matches!(self.address, AddrV2::TorV2(_) | AddrV2::TorV3(_))
    }
}

/// Whether an address may be reached from the open internet. Addresses
/// failing this are neither stored nor relayed.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !ip.is_loopback()
                && !ip.is_private()
                && !ip.is_unspecified()
                && !ip.is_broadcast()
                && !ip.is_link_local()
        }
        IpAddr::V6(ip) => {
            !ip.is_loopback()
                && !ip.is_unspecified()
                // fc00::/7 (unique local) and fe80::/10 (link local)
                && ip.octets()[0] != 0xfd
                && ip.octets()[0] != 0xfc
                && !(ip.octets()[0] == 0xfe && (ip.octets()[1] & 0xc0) == 0x80)
        }
    }
}

/// On-disk representation of a peer for the json dump.
#[derive(Debug, Serialize, Deserialize)]
struct DiskLocalAddress {
    address: String,
    port: u16,
    services: u64,
    last_connected: u64,
    id: usize,
}

/// A module that keeps track of known addresses and serves them to our node to connect
#[derive(Default)]
pub struct AddressMan {
    addresses: HashMap<usize, LocalAddress>,
    banned: HashMap<IpAddr, u64>,
    local: HashSet<IpAddr>,
}

impl AddressMan {
    /// Add a new address to our list of known addresses
    pub fn push_addresses(&mut self, addresses: &[LocalAddress]) {
        for address in addresses {
            // don't add duplicate addresses
            if self
                .addresses
                .values()
                .any(|x| x.address == address.address && x.port == address.port)
            {
                continue;
            }

            self.addresses.entry(address.id).or_insert(address.clone());
        }
    }

    /// A random known address, along with its id.
    pub fn get(&self) -> Option<(usize, LocalAddress)> {
        if self.addresses.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..self.addresses.len());
        self.addresses
            .iter()
            .nth(idx)
            .map(|(id, addr)| (*id, addr.clone()))
    }

    pub fn update_set_state(&mut self, idx: usize, state: AddressState) -> &mut Self {
        if let Some(address) = self.addresses.get_mut(&idx) {
            if let AddressState::Tried(time) = state {
                address.last_connected = time;
            }
            address.state = state;
        }
        self
    }

    pub fn update_set_service_flag(&mut self, idx: usize, services: ServiceFlags) -> &mut Self {
        if let Some(address) = self.addresses.get_mut(&idx) {
            address.services = services;
        }
        self
    }

    /// Remember that we just dialed this address.
    pub fn mark_attempt(&mut self, idx: usize) {
        if let Some(address) = self.addresses.get_mut(&idx) {
            address.last_attempt = unix_now();
        }
    }

    /// The TCP connection succeeded.
    pub fn mark_success(&mut self, idx: usize) {
        if let Some(address) = self.addresses.get_mut(&idx) {
            address.last_connected = unix_now();
        }
    }

    /// The version handshake completed; record what the peer can do.
    pub fn mark_ack(&mut self, idx: usize, services: ServiceFlags) {
        self.update_set_state(idx, AddressState::Connected)
            .update_set_service_flag(idx, services);
    }

    /// Ban an address for the standard ban time and forget it as a
    /// candidate.
    pub fn ban(&mut self, ip: IpAddr) {
        info!("Banning address {ip}");

        self.banned.insert(ip, unix_now() + BAN_TIME);
        self.addresses
            .retain(|_, address| address.get_net_address() != ip);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned
            .get(ip)
            .is_some_and(|until| *until > unix_now())
    }

    /// Mark an address as one of ours, so we never dial it.
    pub fn mark_local(&mut self, ip: IpAddr) {
        self.local.insert(ip);
    }

    pub fn is_local(&self, ip: &IpAddr) -> bool {
        self.local.contains(ip)
    }

    /// One of our own routable addresses, fit for advertising.
    pub fn local_candidate(&self) -> Option<IpAddr> {
        self.local.iter().find(|ip| is_routable(ip)).copied()
    }

    pub fn size(&self) -> usize {
        self.addresses.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalAddress> {
        self.addresses.values()
    }

    /// Write every known peer to `peers.json` inside `datadir`, so a
    /// restart doesn't begin from nothing.
    pub fn dump_peers(&self, datadir: &str) -> Result<(), WireError> {
        let peers: Vec<DiskLocalAddress> = self
            .addresses
            .values()
            .filter_map(|address| {
                let ip = match &address.address {
                    AddrV2::Ipv4(ip) => ip.to_string(),
                    AddrV2::Ipv6(ip) => ip.to_string(),
                    _ => return None,
                };

                Some(DiskLocalAddress {
                    address: ip,
                    port: address.port,
                    services: address.services.to_u64(),
                    last_connected: address.last_connected,
                    id: address.id,
                })
            })
            .collect();

        let contents = serde_json::to_string(&peers)?;
        std::fs::write(format!("{datadir}/peers.json"), contents)?;

        Ok(())
    }

    /// Seed the manager from a previous `dump_peers`, if there was one.
    pub fn restore_peers(&mut self, datadir: &str) -> Result<(), WireError> {
        let path = format!("{datadir}/peers.json");

        if !std::path::Path::new(&path).exists() {
            return Ok(());
        }

        let contents = std::fs::read_to_string(&path)?;
        let peers: Vec<DiskLocalAddress> = serde_json::from_str(&contents)?;

        let peers: Vec<LocalAddress> = peers
            .into_iter()
            .filter_map(|disk| {
                let address = match disk.address.parse::<IpAddr>().ok()? {
                    IpAddr::V4(ip) => AddrV2::Ipv4(ip),
                    IpAddr::V6(ip) => AddrV2::Ipv6(ip),
                };

                Some(LocalAddress::new(
                    address,
                    disk.last_connected,
                    AddressState::NeverTried,
                    ServiceFlags::from(disk.services),
                    disk.port,
                    disk.id,
                ))
            })
            .collect();

        self.push_addresses(&peers);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use bitcoin::p2p::address::AddrV2;
    use bitcoin::p2p::ServiceFlags;

    use super::is_routable;
    use super::AddressMan;
    use super::AddressState;
    use super::LocalAddress;

    fn address(a: u8, b: u8, c: u8, d: u8, id: usize) -> LocalAddress {
        LocalAddress::new(
            AddrV2::Ipv4(Ipv4Addr::new(a, b, c, d)),
            0,
            AddressState::NeverTried,
            ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            8333,
            id,
        )
    }

    #[test]
    fn test_push_dedupes() {
        let mut man = AddressMan::default();

        man.push_addresses(&[address(8, 8, 8, 8, 1)]);
        man.push_addresses(&[address(8, 8, 8, 8, 2)]);

        assert_eq!(man.size(), 1);
    }

    #[test]
    fn test_get_returns_known_address() {
        let mut man = AddressMan::default();
        assert!(man.get().is_none());

        man.push_addresses(&[address(8, 8, 8, 8, 1)]);
        let (id, addr) = man.get().unwrap();

        assert_eq!(id, 1);
        assert_eq!(addr.get_port(), 8333);
    }

    #[test]
    fn test_ban_removes_and_blocks() {
        let mut man = AddressMan::default();
        let ip = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

        man.push_addresses(&[address(8, 8, 8, 8, 1)]);
        man.ban(ip);

        assert_eq!(man.size(), 0);
        assert!(man.is_banned(&ip));
        assert!(!man.is_banned(&IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))));
    }

    #[test]
    fn test_local_marking() {
        let mut man = AddressMan::default();
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));

        assert!(!man.is_local(&ip));
        man.mark_local(ip);
        assert!(man.is_local(&ip));
    }

    #[test]
    fn test_routable() {
        assert!(is_routable(&"8.8.8.8".parse().unwrap()));
        assert!(!is_routable(&"127.0.0.1".parse().unwrap()));
        assert!(!is_routable(&"192.168.1.1".parse().unwrap()));
        assert!(!is_routable(&"0.0.0.0".parse().unwrap()));
        assert!(!is_routable(&"::1".parse().unwrap()));
        assert!(!is_routable(&"fd00::1".parse().unwrap()));
        assert!(is_routable(&"2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_dump_and_restore() {
        let dir = std::env::temp_dir().join("madeira-addrman-test");
        std::fs::create_dir_all(&dir).unwrap();
        let dir = dir.to_str().unwrap().to_string();

        let mut man = AddressMan::default();
        man.push_addresses(&[address(8, 8, 8, 8, 1), address(1, 1, 1, 1, 2)]);
        man.dump_peers(&dir).unwrap();

        let mut restored = AddressMan::default();
        restored.restore_peers(&dir).unwrap();

        assert_eq!(restored.size(), 2);
    }
}
