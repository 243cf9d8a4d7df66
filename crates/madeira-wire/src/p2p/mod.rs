// SPDX-License-Identifier: MIT

//! Main module for the p2p layer: peer discovery, connection handshakes,
//! block and transaction download, relay and misbehavior policing for a
//! proof-of-work chain.

pub mod address_man;
pub mod chain;
pub mod compact;
pub mod error;
pub mod header_chain;
pub mod mempool;
pub mod nonces;
pub mod params;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod requests;
pub mod stream_reader;

#[cfg(test)]
pub(crate) mod tests;

pub use chain::ChainBackend;
pub use chain::VerifyError;
pub use error::WireError;
pub use mempool::MempoolBackend;
pub use mempool::SharedMempool;
pub use pool::NetPreference;
pub use pool::PeerInfo;
pub use pool::Pool;
pub use pool::PoolConfig;
