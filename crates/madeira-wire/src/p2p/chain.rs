// SPDX-License-Identifier: MIT

//! The chain the pool syncs. Consensus validation, storage and reorg
//! logic all live behind this trait; the pool only drives it with blocks
//! and asks it questions. Implementations are expected to use interior
//! mutability, so a shared handle works from the pool task.

use bitcoin::block::Header;
use bitcoin::p2p::message_network::RejectReason;
use bitcoin::Block;
use bitcoin::BlockHash;

/// Why a block or transaction was refused, in wire terms.
///
/// `code` and `reason` go out in a `reject` message verbatim; `score` is
/// added to the offending peer's ban score afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyError {
    pub code: RejectReason,
    pub reason: &'static str,
    pub score: u32,
}

impl VerifyError {
    pub fn new(code: RejectReason, reason: &'static str, score: u32) -> Self {
        VerifyError {
            code,
            reason,
            score,
        }
    }
}

pub trait ChainBackend {
    /// Height of the active chain tip.
    fn height(&self) -> u32;

    /// Hash of the active chain tip.
    fn tip(&self) -> BlockHash;

    /// Whether we consider ourselves caught up with the network.
    fn synced(&self) -> bool;

    /// Rough sync progress in [0, 1].
    fn progress(&self) -> f64;

    /// Header of a main-chain or side-chain block we know.
    fn header(&self, hash: &BlockHash) -> Option<Header>;

    /// Main-chain hash at `height`.
    fn block_hash_at(&self, height: u32) -> Option<BlockHash>;

    /// Main-chain height of `hash`, if it is on the main chain.
    fn height_of(&self, hash: &BlockHash) -> Option<u32>;

    /// Full block data, if stored.
    fn get_block(&self, hash: &BlockHash) -> Option<Block>;

    /// Locator walking back from `from` (or the tip), exponentially
    /// thinning.
    fn get_locator(&self, from: Option<BlockHash>) -> Vec<BlockHash>;

    /// Best common ancestor named by `locator`, falling back to genesis.
    fn find_locator(&self, locator: &[BlockHash]) -> BlockHash;

    /// Whether this hash is on a chain we know.
    fn has_hash(&self, hash: &BlockHash) -> bool;

    /// Whether this hash is a known orphan.
    fn has_orphan(&self, hash: &BlockHash) -> bool;

    /// Root of the orphan chain `hash` belongs to.
    fn get_orphan_root(&self, hash: &BlockHash) -> Option<BlockHash>;

    /// Whether this hash was marked invalid.
    fn has_invalid(&self, hash: &BlockHash) -> bool;

    /// Try to connect a block. `from` is the announcing peer id, kept for
    /// the chain's own misbehavior bookkeeping.
    fn add_block(&self, block: &Block, from: u32) -> Result<(), VerifyError>;
}
