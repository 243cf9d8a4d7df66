// SPDX-License-Identifier: MIT

//! The unconfirmed transaction pool, as seen from the wire. Policy and
//! validation live behind the trait; the pool uses it to decide what to
//! request, to serve `getdata`/`mempool`, to apply fee filters and to
//! fill compact blocks.

use std::sync::Arc;

use bitcoin::Transaction;
use bitcoin::Txid;
use tokio::sync::Mutex;

use super::chain::VerifyError;

pub trait MempoolBackend {
    /// A transaction currently in the pool.
    fn get(&self, txid: &Txid) -> Option<Transaction>;

    /// Whether the pool holds this transaction.
    fn has(&self, txid: &Txid) -> bool;

    /// Whether this txid was recently rejected.
    fn has_reject(&self, txid: &Txid) -> bool;

    /// Whether this transaction is parked as an orphan.
    fn has_orphan(&self, txid: &Txid) -> bool;

    /// Parents of `tx` we don't have.
    fn missing(&self, tx: &Transaction) -> Vec<Txid>;

    /// Fee rate of a pooled transaction, in satoshis per kvB.
    fn fee_rate(&self, txid: &Txid) -> Option<u64>;

    /// Snapshot of every txid in the pool.
    fn txids(&self) -> Vec<Txid>;

    /// Try to accept a transaction. `from` is the announcing peer id.
    fn add(&mut self, tx: Transaction, from: u32) -> Result<(), VerifyError>;
}

/// The mempool handle shared between the pool task and the peers (peers
/// only read it, for fee filtering on announce).
pub type SharedMempool = Arc<Mutex<dyn MempoolBackend + Send>>;
