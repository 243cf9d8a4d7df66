// SPDX-License-Identifier: MIT

//! The scaffolding used while syncing headers-first under checkpoints: a
//! forward list of (hash, height) pairs the loader announced, starting
//! at our tip when the round began. Blocks are downloaded against it in
//! order, the front node falling off as each body arrives, until the
//! final checkpoint is crossed and the pool switches to getblocks.

use std::collections::VecDeque;

use bitcoin::BlockHash;

use super::params::Checkpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderNode {
    pub hash: BlockHash,
    pub height: u32,
}

#[derive(Debug)]
pub struct HeaderChain {
    /// Front is the next block body we expect, back is the last header
    /// we accepted. Heights are contiguous throughout.
    nodes: VecDeque<HeaderNode>,
    /// Count of nodes (from the front) already handed out for download
    requested: usize,
    /// The checkpoint this sync round is working towards
    target: Checkpoint,
}

impl HeaderChain {
    /// Start a round at our current tip, aiming at `target`.
    pub fn new(tip_hash: BlockHash, tip_height: u32, target: Checkpoint) -> Self {
        let mut nodes = VecDeque::new();
        nodes.push_back(HeaderNode {
            hash: tip_hash,
            height: tip_height,
        });

        HeaderChain {
            // The tip node only anchors linkage checks; it is never
            // handed out for download.
            requested: 1,
            nodes,
            target,
        }
    }

    /// The node new headers must link against.
    pub fn tail(&self) -> HeaderNode {
        *self.nodes.back().expect("chain is never empty")
    }

    /// The next block body we expect.
    pub fn front(&self) -> Option<&HeaderNode> {
        self.nodes.front()
    }

    /// Append a header that extends the tail.
    pub fn append(&mut self, hash: BlockHash, height: u32) {
        debug_assert_eq!(height, self.tail().height + 1);

        self.nodes.push_back(HeaderNode { hash, height });
    }

    /// Drop the front node after its body arrived (or, right after a
    /// checkpointed batch, to discard the anchor).
    pub fn shift(&mut self) {
        if self.nodes.pop_front().is_some() {
            self.requested = self.requested.saturating_sub(1);
        }
    }

    /// Hand out up to `max` hashes that were never requested before.
    pub fn next_batch(&mut self, max: usize) -> Vec<BlockHash> {
        let batch: Vec<BlockHash> = self
            .nodes
            .iter()
            .skip(self.requested)
            .take(max)
            .map(|node| node.hash)
            .collect();

        self.requested += batch.len();
        batch
    }

    pub fn target(&self) -> Checkpoint {
        self.target
    }

    pub fn set_target(&mut self, target: Checkpoint) {
        self.target = target;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use madeira_common::bhash;

    use super::Checkpoint;
    use super::HeaderChain;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    fn chain() -> HeaderChain {
        let target = Checkpoint {
            height: 546,
            hash: bhash!("000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
        };

        HeaderChain::new(hash(0), 100, target)
    }

    #[test]
    fn test_append_extends_tail() {
        let mut hc = chain();

        hc.append(hash(1), 101);
        hc.append(hash(2), 102);

        assert_eq!(hc.tail().hash, hash(2));
        assert_eq!(hc.tail().height, 102);
        assert_eq!(hc.len(), 3);
    }

    #[test]
    fn test_batches_skip_the_anchor_and_do_not_repeat() {
        let mut hc = chain();
        for i in 1..=5 {
            hc.append(hash(i), 100 + i as u32);
        }

        assert_eq!(hc.next_batch(2), vec![hash(1), hash(2)]);
        assert_eq!(hc.next_batch(10), vec![hash(3), hash(4), hash(5)]);
        assert!(hc.next_batch(10).is_empty());
    }

    #[test]
    fn test_shift_tracks_requested() {
        let mut hc = chain();
        for i in 1..=3 {
            hc.append(hash(i), 100 + i as u32);
        }

        hc.next_batch(10);
        hc.shift(); // anchor
        assert_eq!(hc.front().unwrap().hash, hash(1));

        hc.shift();
        assert_eq!(hc.front().unwrap().hash, hash(2));

        // Later appends are still handed out exactly once
        hc.append(hash(4), 104);
        assert_eq!(hc.next_batch(10), vec![hash(4)]);
    }
}
