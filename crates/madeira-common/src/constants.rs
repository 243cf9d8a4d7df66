// SPDX-License-Identifier: MIT

//! Wire-protocol limits shared by the framer, the peer state machine and
//! the pool. These are all hard protocol or DoS limits; timers live next
//! to the code that polls them.

/// Maximum size of a framed message, header excluded.
pub const MAX_MESSAGE: usize = 32 * 1024 * 1024;

/// Maximum number of items in an `inv`, `getdata` or `notfound` message.
pub const MAX_INV: usize = 50_000;

/// Maximum number of entries in an `addr` message.
pub const MAX_ADDR: usize = 1000;

/// Maximum number of headers in a `headers` message.
pub const MAX_HEADERS: usize = 2000;

/// Maximum number of block requests in flight per peer.
pub const MAX_BLOCK_REQUEST: usize = 16;

/// Maximum number of transaction requests in flight per peer.
pub const MAX_TX_REQUEST: usize = 10_000;

/// Maximum number of compact blocks being reconstructed per peer.
pub const MAX_COMPACT_BLOCKS: usize = 15;

/// How deep below the tip we still answer `getblocktxn` for.
pub const MAX_BLOCKTXN_DEPTH: u32 = 15;

/// Close the connection when this many outbound bytes sit unflushed.
pub const MAX_OUTBOUND_BUFFER: usize = 30 * 1024 * 1024;

/// Ban score at which a peer's address is banned.
pub const BAN_THRESHOLD: u32 = 100;

/// How long a ban lasts, in seconds.
pub const BAN_TIME: u64 = 24 * 60 * 60;

/// `getblocks` replies page their invs at this many hashes.
pub const GETBLOCKS_PAGE: usize = 500;

/// User agent advertised in our version message.
pub const USER_AGENT: &str = "/madeira:0.1.0/";
