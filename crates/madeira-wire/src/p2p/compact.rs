// SPDX-License-Identifier: MIT

//! Compact block (BIP152) reconstruction. A `cmpctblock` gives us the
//! header, a few prefilled transactions and 6-byte siphash shortids for
//! the rest; we fill what we can from the mempool and fetch the holes
//! with `getblocktxn`. Shortid collisions can't be resolved at this
//! layer, so they fall back to a full block download.

use std::collections::HashMap;
use std::time::Instant;

use bitcoin::bip152::HeaderAndShortIds;
use bitcoin::bip152::ShortId;
use bitcoin::block::Header;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Transaction;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompactError {
    #[error("Malformed compact block")]
    Invalid,
    #[error("Siphash collision between shortids")]
    Collision,
}

/// A block being reconstructed from a `cmpctblock` message.
#[derive(Debug)]
pub struct CompactBlock {
    pub hash: BlockHash,
    header: Header,
    sip_keys: (u64, u64),
    /// One slot per transaction in the block, in block order
    slots: Vec<Option<Transaction>>,
    /// shortid -> index of the slot it identifies
    id_map: HashMap<u64, usize>,
    /// Shortids are over wtxids (version 2) or txids (version 1)
    witness: bool,
    /// When the cmpctblock arrived; drives the blocktxn stall check
    pub received: Instant,
}

fn sid_key(id: &ShortId) -> u64 {
    let bytes = id.as_bytes();
    let mut key = [0_u8; 8];
    key[..6].copy_from_slice(&bytes[..]);
    u64::from_le_bytes(key)
}

impl CompactBlock {
    /// Lay out the slot table from the wire representation. Prefilled
    /// indexes are differentially encoded; shortids identify the holes
    /// between them in order.
    pub fn setup(cb: &HeaderAndShortIds, witness: bool) -> Result<CompactBlock, CompactError> {
        let total = cb
            .short_ids
            .len()
            .checked_add(cb.prefilled_txs.len())
            .ok_or(CompactError::Invalid)?;

        if total == 0 {
            return Err(CompactError::Invalid);
        }

        let mut slots: Vec<Option<Transaction>> = vec![None; total];

        let mut index = 0_usize;
        for (i, prefilled) in cb.prefilled_txs.iter().enumerate() {
            index = index
                .checked_add(prefilled.idx as usize)
                .ok_or(CompactError::Invalid)?;

            if i > 0 {
                index = index.checked_add(1).ok_or(CompactError::Invalid)?;
            }

            if index >= total {
                return Err(CompactError::Invalid);
            }

            slots[index] = Some(prefilled.tx.clone());
        }

        let sip_keys = ShortId::calculate_siphash_keys(&cb.header, cb.nonce);

        let mut id_map = HashMap::with_capacity(cb.short_ids.len());
        let mut ids = cb.short_ids.iter();

        for (slot, entry) in slots.iter().enumerate() {
            if entry.is_some() {
                continue;
            }

            let id = ids.next().ok_or(CompactError::Invalid)?;

            if id_map.insert(sid_key(id), slot).is_some() {
                return Err(CompactError::Collision);
            }
        }

        if ids.next().is_some() {
            return Err(CompactError::Invalid);
        }

        Ok(CompactBlock {
            hash: cb.header.block_hash(),
            header: cb.header,
            sip_keys,
            slots,
            id_map,
            witness,
            received: Instant::now(),
        })
    }

    fn place(&mut self, tx: Transaction) {
        let id = if self.witness {
            ShortId::with_siphash_keys(&tx.compute_wtxid(), self.sip_keys)
        } else {
            ShortId::with_siphash_keys(&tx.compute_txid(), self.sip_keys)
        };

        if let Some(&slot) = self.id_map.get(&sid_key(&id)) {
            if self.slots[slot].is_none() {
                self.slots[slot] = Some(tx);
            }
        }
    }

    /// Fill holes from a mempool snapshot. Returns whether the block is
    /// now complete.
    pub fn fill_mempool(&mut self, txs: impl IntoIterator<Item = Transaction>) -> bool {
        for tx in txs {
            self.place(tx);

            if self.missing_count() == 0 {
                break;
            }
        }

        self.missing_count() == 0
    }

    /// Fill holes, in block order, from a `blocktxn` reply. Returns
    /// whether the block is now complete.
    pub fn fill_missing(&mut self, txs: &[Transaction]) -> bool {
        let mut supplied = txs.iter();

        for slot in self.slots.iter_mut() {
            if slot.is_some() {
                continue;
            }

            match supplied.next() {
                Some(tx) => *slot = Some(tx.clone()),
                None => return false,
            }
        }

        supplied.next().is_none()
    }

    /// Absolute indexes of the transactions we still miss, for
    /// `getblocktxn`.
    pub fn missing_indexes(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u64)
            .collect()
    }

    pub fn missing_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Assemble the full block once every slot is filled.
    pub fn finalize(self) -> Option<Block> {
        let txdata: Option<Vec<Transaction>> = self.slots.into_iter().collect();

        Some(Block {
            header: self.header,
            txdata: txdata?,
        })
    }
}

#[cfg(test)]
mod test {
    use bitcoin::absolute::LockTime;
    use bitcoin::bip152::HeaderAndShortIds;
    use bitcoin::bip152::PrefilledTransaction;
    use bitcoin::bip152::ShortId;
    use bitcoin::block::Header;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction;
    use bitcoin::Block;
    use bitcoin::BlockHash;
    use bitcoin::CompactTarget;
    use bitcoin::Transaction;
    use bitcoin::TxMerkleNode;

    use super::CompactBlock;
    use super::CompactError;

    fn tx(lock: u32) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::from_consensus(lock),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    fn block() -> Block {
        Block {
            header: Header {
                version: Version::TWO,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                nonce: 0,
            },
            txdata: vec![tx(1), tx(2), tx(3)],
        }
    }

    /// cmpctblock for `block()` with the coinbase prefilled and shortids
    /// for the rest, computed over txids (version 1).
    fn compact(block: &Block) -> HeaderAndShortIds {
        let nonce = 7;
        let keys = ShortId::calculate_siphash_keys(&block.header, nonce);

        HeaderAndShortIds {
            header: block.header,
            nonce,
            short_ids: block.txdata[1..]
                .iter()
                .map(|tx| ShortId::with_siphash_keys(&tx.compute_txid(), keys))
                .collect(),
            prefilled_txs: vec![PrefilledTransaction {
                idx: 0,
                tx: block.txdata[0].clone(),
            }],
        }
    }

    #[test]
    fn test_mempool_completes_reconstruction() {
        let block = block();
        let mut cmpct = CompactBlock::setup(&compact(&block), false).unwrap();

        assert_eq!(cmpct.missing_count(), 2);
        assert!(cmpct.fill_mempool(block.txdata[1..].to_vec()));
        assert_eq!(cmpct.finalize().unwrap(), block);
    }

    #[test]
    fn test_partial_fill_then_blocktxn() {
        let block = block();
        let mut cmpct = CompactBlock::setup(&compact(&block), false).unwrap();

        assert!(!cmpct.fill_mempool(vec![block.txdata[1].clone()]));
        assert_eq!(cmpct.missing_indexes(), vec![2]);

        assert!(cmpct.fill_missing(&[block.txdata[2].clone()]));
        assert_eq!(cmpct.finalize().unwrap(), block);
    }

    #[test]
    fn test_short_blocktxn_is_incomplete() {
        let block = block();
        let mut cmpct = CompactBlock::setup(&compact(&block), false).unwrap();

        assert!(!cmpct.fill_missing(&[]));
    }

    #[test]
    fn test_shortid_collision() {
        let mut block = block();
        block.txdata[2] = block.txdata[1].clone();

        assert_eq!(
            CompactBlock::setup(&compact(&block), false).unwrap_err(),
            CompactError::Collision
        );
    }

    #[test]
    fn test_shortid_count_mismatch() {
        let block = block();
        let mut cb = compact(&block);
        cb.short_ids.pop();

        assert_eq!(
            CompactBlock::setup(&cb, false).unwrap_err(),
            CompactError::Invalid
        );
    }
}
