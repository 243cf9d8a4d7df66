// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::block::Version as BlockVersion;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::Magic;
use bitcoin::p2p::ServiceFlags;
use bitcoin::transaction;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::Network;
use bitcoin::Transaction;
use bitcoin::TxMerkleNode;
use bitcoin::Txid;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use crate::p2p::chain::ChainBackend;
use crate::p2p::chain::VerifyError;
use crate::p2p::mempool::MempoolBackend;
use crate::p2p::mempool::SharedMempool;
use crate::p2p::pool::NodeRequest;
use crate::p2p::pool::Pool;
use crate::p2p::pool::PoolConfig;
use crate::p2p::registry::LocalPeerView;
use crate::p2p::registry::PeerId;
use crate::p2p::registry::PeerStatus;

/// A scriptable main chain: a list of hashes, the block data we "store",
/// and whatever orphan/invalid markers a test wants to fake.
pub(crate) struct MockChain {
    inner: StdMutex<MockChainInner>,
}

struct MockChainInner {
    chain: Vec<BlockHash>,
    blocks: HashMap<BlockHash, Block>,
    orphans: HashMap<BlockHash, BlockHash>,
    invalid: HashSet<BlockHash>,
    synced: bool,
    reject_next: Option<VerifyError>,
    accepted: Vec<BlockHash>,
}

impl MockChain {
    pub fn new(synced: bool) -> Self {
        MockChain {
            inner: StdMutex::new(MockChainInner {
                chain: vec![BlockHash::all_zeros()],
                blocks: HashMap::new(),
                orphans: HashMap::new(),
                invalid: HashSet::new(),
                synced,
                reject_next: None,
                accepted: Vec::new(),
            }),
        }
    }

    pub fn store_block(&self, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        let hash = block.block_hash();
        inner.chain.push(hash);
        inner.blocks.insert(hash, block);
    }

    pub fn set_synced(&self, synced: bool) {
        self.inner.lock().unwrap().synced = synced;
    }

    pub fn reject_next(&self, err: VerifyError) {
        self.inner.lock().unwrap().reject_next = Some(err);
    }

    pub fn accepted(&self) -> Vec<BlockHash> {
        self.inner.lock().unwrap().accepted.clone()
    }
}

impl ChainBackend for MockChain {
    fn height(&self) -> u32 {
        (self.inner.lock().unwrap().chain.len() - 1) as u32
    }

    fn tip(&self) -> BlockHash {
        *self.inner.lock().unwrap().chain.last().unwrap()
    }

    fn synced(&self) -> bool {
        self.inner.lock().unwrap().synced
    }

    fn progress(&self) -> f64 {
        if self.synced() {
            1.0
        } else {
            0.0
        }
    }

    fn header(&self, hash: &BlockHash) -> Option<Header> {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .get(hash)
            .map(|block| block.header)
    }

    fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
        self.inner.lock().unwrap().chain.get(height as usize).copied()
    }

    fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .chain
            .iter()
            .position(|h| h == hash)
            .map(|height| height as u32)
    }

    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.lock().unwrap().blocks.get(hash).cloned()
    }

    fn get_locator(&self, from: Option<BlockHash>) -> Vec<BlockHash> {
        vec![from.unwrap_or_else(|| self.tip())]
    }

    fn find_locator(&self, locator: &[BlockHash]) -> BlockHash {
        let inner = self.inner.lock().unwrap();
        locator
            .iter()
            .find(|hash| inner.chain.contains(hash))
            .copied()
            .unwrap_or(inner.chain[0])
    }

    fn has_hash(&self, hash: &BlockHash) -> bool {
        self.inner.lock().unwrap().chain.contains(hash)
    }

    fn has_orphan(&self, hash: &BlockHash) -> bool {
        self.inner.lock().unwrap().orphans.contains_key(hash)
    }

    fn get_orphan_root(&self, hash: &BlockHash) -> Option<BlockHash> {
        self.inner.lock().unwrap().orphans.get(hash).copied()
    }

    fn has_invalid(&self, hash: &BlockHash) -> bool {
        self.inner.lock().unwrap().invalid.contains(hash)
    }

    fn add_block(&self, block: &Block, _from: u32) -> Result<(), VerifyError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(err) = inner.reject_next.take() {
            return Err(err);
        }

        let hash = block.block_hash();
        inner.accepted.push(hash);

        if !inner.chain.contains(&hash) {
            inner.chain.push(hash);
            inner.blocks.insert(hash, block.clone());
        }

        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockMempool {
    pub txs: HashMap<Txid, Transaction>,
    pub rejects: HashSet<Txid>,
    pub orphans: HashSet<Txid>,
    pub fee_rates: HashMap<Txid, u64>,
    pub added: Vec<Txid>,
}

impl MempoolBackend for MockMempool {
    fn get(&self, txid: &Txid) -> Option<Transaction> {
        self.txs.get(txid).cloned()
    }

    fn has(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    fn has_reject(&self, txid: &Txid) -> bool {
        self.rejects.contains(txid)
    }

    fn has_orphan(&self, txid: &Txid) -> bool {
        self.orphans.contains(txid)
    }

    fn missing(&self, _tx: &Transaction) -> Vec<Txid> {
        Vec::new()
    }

    fn fee_rate(&self, txid: &Txid) -> Option<u64> {
        self.fee_rates.get(txid).copied()
    }

    fn txids(&self) -> Vec<Txid> {
        self.txs.keys().copied().collect()
    }

    fn add(&mut self, tx: Transaction, _from: u32) -> Result<(), VerifyError> {
        self.added.push(tx.compute_txid());
        self.txs.insert(tx.compute_txid(), tx);
        Ok(())
    }
}

pub(crate) fn shared_mempool(mempool: MockMempool) -> SharedMempool {
    Arc::new(Mutex::new(mempool))
}

pub(crate) fn test_config() -> PoolConfig {
    PoolConfig {
        network: Network::Regtest,
        listen: false,
        self_connect: Some(false),
        datadir: std::env::temp_dir()
            .join("madeira-wire-test")
            .to_str()
            .unwrap()
            .to_string(),
        ..Default::default()
    }
}

pub(crate) fn test_pool(synced: bool, config: PoolConfig) -> Pool<MockChain> {
    test_pool_with(MockChain::new(synced), MockMempool::default(), config)
}

pub(crate) fn test_pool_with(
    chain: MockChain,
    mempool: MockMempool,
    config: PoolConfig,
) -> Pool<MockChain> {
    let synced = chain.synced();
    let mut pool = Pool::new(config, chain, shared_mempool(mempool)).unwrap();
    pool.synced = synced;
    pool
}

/// Register a scripted peer directly in the registry, skipping the
/// socket layer. The returned receiver sees every request the pool sends
/// it.
pub(crate) fn add_peer(
    pool: &mut Pool<MockChain>,
    id: PeerId,
    outbound: bool,
) -> UnboundedReceiver<NodeRequest> {
    let (sender, receiver) = unbounded_channel();

    let mut view = LocalPeerView::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, id as u8)),
        8333,
        outbound,
        None,
        sender,
    );
    view.state = PeerStatus::Ready;
    view.services = ServiceFlags::NETWORK | ServiceFlags::WITNESS;
    view.version = 70015;

    assert!(pool.peers.add(id, view));
    receiver
}

/// Process exactly one queued notification.
pub(crate) async fn pump_one(pool: &mut Pool<MockChain>) {
    let notification = tokio::time::timeout(std::time::Duration::from_secs(5), pool.node_rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("pool channel closed");

    pool.handle_notification(notification).await.unwrap();
}

// Wire helpers for tests that talk real TCP to the peer actor.

pub(crate) async fn write_message(stream: &mut TcpStream, msg: NetworkMessage) {
    let data = serialize(&RawNetworkMessage::new(Magic::from(Network::Regtest), msg));
    stream.write_all(&data).await.unwrap();
}

pub(crate) async fn read_message(stream: &mut TcpStream) -> std::io::Result<NetworkMessage> {
    let mut header = [0_u8; 24];
    stream.read_exact(&mut header).await?;

    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;

    let mut frame = vec![0_u8; 24 + length];
    frame[..24].copy_from_slice(&header);
    stream.read_exact(&mut frame[24..]).await?;

    let raw: RawNetworkMessage = deserialize(&frame)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    Ok(raw.into_payload())
}

// Block building

pub(crate) fn dummy_tx(lock: u32) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::from_consensus(lock),
        input: Vec::new(),
        output: Vec::new(),
    }
}

/// A block over `txs` whose header passes its own proof of work, using
/// the easiest possible target.
pub(crate) fn mined_block(txs: Vec<Transaction>) -> Block {
    let mut header = Header {
        version: BlockVersion::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 0,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: 0,
    };

    loop {
        if header.validate_pow(header.target()).is_ok() {
            break;
        }
        header.nonce += 1;
    }

    Block {
        header,
        txdata: txs,
    }
}
