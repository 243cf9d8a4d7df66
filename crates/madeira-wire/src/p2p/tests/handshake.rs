// SPDX-License-Identifier: MIT

//! Handshake scenarios against a scripted remote on a real socket.

use std::time::Duration;

use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::AddrV2;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::Magic;
use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use bitcoin::Network;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::p2p::address_man::AddressState;
use crate::p2p::address_man::LocalAddress;
use crate::p2p::chain::ChainBackend;
use crate::p2p::registry::PeerId;
use crate::p2p::registry::PeerStatus;
use crate::p2p::tests::utils::pump_one;
use crate::p2p::tests::utils::read_message;
use crate::p2p::tests::utils::test_config;
use crate::p2p::tests::utils::test_pool;
use crate::p2p::tests::utils::write_message;
use crate::p2p::tests::utils::MockChain;
use crate::p2p::Pool;

fn remote_version(nonce: u64) -> VersionMessage {
    let socket = "127.0.0.1:18444".parse().unwrap();

    VersionMessage {
        version: 70015,
        services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        timestamp: 0,
        receiver: Address::new(&socket, ServiceFlags::NONE),
        sender: Address::new(&socket, ServiceFlags::NETWORK | ServiceFlags::WITNESS),
        nonce,
        user_agent: "/scripted:0.1/".to_string(),
        start_height: 0,
        relay: true,
    }
}

async fn dial(pool: &mut Pool<MockChain>, listener: &TcpListener) -> (PeerId, TcpStream) {
    let port = listener.local_addr().unwrap().port();

    let address = LocalAddress::new(
        AddrV2::Ipv4("127.0.0.1".parse().unwrap()),
        0,
        AddressState::NeverTried,
        ServiceFlags::NONE,
        port,
        0,
    );

    let peer_id = pool.open_connection(address, None);
    let (stream, _) = listener.accept().await.unwrap();

    (peer_id, stream)
}

async fn expect_message(stream: &mut TcpStream) -> NetworkMessage {
    timeout(Duration::from_secs(5), read_message(stream))
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
}

#[tokio::test]
async fn test_handshake_happy_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut pool = test_pool(false, test_config());
    let tip = pool.chain.tip();

    let (peer_id, mut stream) = dial(&mut pool, &listener).await;

    // The outbound side speaks first.
    let NetworkMessage::Version(ours) = expect_message(&mut stream).await else {
        panic!("expected a version message");
    };
    assert_eq!(ours.version, 70015);

    write_message(&mut stream, NetworkMessage::Version(remote_version(0x1111))).await;
    assert!(matches!(
        expect_message(&mut stream).await,
        NetworkMessage::Verack
    ));
    write_message(&mut stream, NetworkMessage::Verack).await;

    // Handshake complete: the pool learns about it and elects us loader.
    pump_one(&mut pool).await;

    assert_eq!(pool.peers.loader(), Some(peer_id));
    let view = pool.peers.get(peer_id).unwrap();
    assert_eq!(view.state, PeerStatus::Ready);
    assert!(view.syncing);

    let peer_info = pool.get_peer_info(peer_id).unwrap();
    assert_eq!(peer_info.user_agent, "/scripted:0.1/");
    assert!(peer_info.address.starts_with("127.0.0.1:"));

    // It immediately looks for more peers and starts the sync.
    assert!(matches!(
        expect_message(&mut stream).await,
        NetworkMessage::GetAddr
    ));

    let NetworkMessage::GetBlocks(request) = expect_message(&mut stream).await else {
        panic!("expected a getblocks message");
    };
    assert_eq!(request.locator_hashes, vec![tip]);
    assert_eq!(request.stop_hash, BlockHash::all_zeros());
}

#[tokio::test]
async fn test_self_connection_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut pool = test_pool(false, test_config());

    let (_, mut stream) = dial(&mut pool, &listener).await;

    let NetworkMessage::Version(ours) = expect_message(&mut stream).await else {
        panic!("expected a version message");
    };

    assert!(pool.nonces.lock().unwrap().has(ours.nonce));

    // Echo their own nonce back, as if they dialed themselves.
    write_message(&mut stream, NetworkMessage::Version(remote_version(ours.nonce))).await;

    // The connection dies without a verack.
    pump_one(&mut pool).await;

    assert!(pool.peers.is_empty());
    assert!(pool.nonces.lock().unwrap().is_empty());

    let reply = timeout(Duration::from_secs(5), read_message(&mut stream))
        .await
        .expect("timed out waiting for the close");
    assert!(reply.is_err());
}

#[tokio::test]
async fn test_parse_errors_lead_to_ban() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut pool = test_pool(false, test_config());

    let (peer_id, mut stream) = dial(&mut pool, &listener).await;

    let NetworkMessage::Version(_) = expect_message(&mut stream).await else {
        panic!("expected a version message");
    };
    write_message(&mut stream, NetworkMessage::Version(remote_version(0x2222))).await;
    assert!(matches!(
        expect_message(&mut stream).await,
        NetworkMessage::Verack
    ));
    write_message(&mut stream, NetworkMessage::Verack).await;
    pump_one(&mut pool).await;

    // Ten frames with a flipped checksum bit: +10 each, ban at 100.
    for _ in 0..10 {
        let mut frame = serialize(&RawNetworkMessage::new(
            Magic::from(Network::Regtest),
            NetworkMessage::Ping(7),
        ));
        frame[20] ^= 0x01;
        stream.write_all(&frame).await.unwrap();
    }

    for _ in 0..10 {
        pump_one(&mut pool).await;
    }

    assert_eq!(pool.peers.get(peer_id).unwrap().banscore, 100);
    assert_eq!(pool.peers.get(peer_id).unwrap().state, PeerStatus::Banned);
    assert!(pool
        .address_man
        .is_banned(&"127.0.0.1".parse().unwrap()));

    // The shutdown request tears the connection down.
    pump_one(&mut pool).await;
    assert!(pool.peers.is_empty());
}
