// SPDX-License-Identifier: MIT

//! The peer-to-peer pool of the madeira node. This crate talks to the
//! network: it discovers peers, shakes hands with them, syncs block
//! headers and bodies, relays transactions and blocks, and cuts off
//! peers that stall or misbehave. Consensus validation and storage stay
//! behind the [p2p::ChainBackend] and [p2p::MempoolBackend] seams.

pub mod p2p;

pub use p2p::ChainBackend;
pub use p2p::MempoolBackend;
pub use p2p::Pool;
pub use p2p::PoolConfig;
pub use p2p::WireError;
