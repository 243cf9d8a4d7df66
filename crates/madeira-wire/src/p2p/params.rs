// SPDX-License-Identifier: MIT

//! Per-network parameters the pool cares about: canonical port, whether
//! connecting to ourselves is tolerated, whether the loader asks for the
//! remote mempool once synced, and the hard-coded checkpoint table that
//! gates the initial headers sync.

use std::str::FromStr;

use bitcoin::BlockHash;
use bitcoin::Network;
use madeira_common::bhash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    /// Canonical listening port for this network.
    pub default_port: u16,
    /// Whether a version message carrying one of our own nonces is
    /// tolerated. Only useful on test networks.
    pub allow_self_connect: bool,
    /// Whether the loader peer requests the remote mempool after sync.
    pub request_mempool: bool,
    /// Hard-coded (height, hash) pairs, ascending by height.
    pub checkpoints: Vec<Checkpoint>,
}

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Bitcoin => NetworkParams {
                network,
                default_port: 8333,
                allow_self_connect: false,
                request_mempool: false,
                checkpoints: mainnet_checkpoints(),
            },
            Network::Testnet => NetworkParams {
                network,
                default_port: 18333,
                allow_self_connect: true,
                request_mempool: false,
                checkpoints: testnet_checkpoints(),
            },
            Network::Signet => NetworkParams {
                network,
                default_port: 38333,
                allow_self_connect: true,
                request_mempool: false,
                checkpoints: Vec::new(),
            },
            _ => NetworkParams {
                network,
                default_port: 18444,
                allow_self_connect: true,
                request_mempool: true,
                checkpoints: Vec::new(),
            },
        }
    }

    /// The highest checkpoint, if the network defines any.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// First checkpoint strictly above `height`.
    pub fn next_checkpoint(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|chk| chk.height > height)
    }
}

macro_rules! checkpoints {
    ( $( ($height:expr, $hash:expr) ),+ $(,)? ) => {
        vec![ $( Checkpoint { height: $height, hash: bhash!($hash) } ),+ ]
    };
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    checkpoints![
        (
            11111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"
        ),
        (
            33333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"
        ),
        (
            74000,
            "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"
        ),
        (
            105000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"
        ),
        (
            134444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"
        ),
        (
            168000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"
        ),
        (
            193000,
            "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"
        ),
        (
            210000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"
        ),
        (
            216116,
            "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"
        ),
        (
            225430,
            "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"
        ),
        (
            250000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"
        ),
        (
            279000,
            "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"
        ),
        (
            295000,
            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"
        ),
    ]
}

fn testnet_checkpoints() -> Vec<Checkpoint> {
    checkpoints![(
        546,
        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"
    )]
}

#[cfg(test)]
mod test {
    use bitcoin::Network;

    use super::NetworkParams;

    #[test]
    fn test_checkpoint_lookup() {
        let params = NetworkParams::new(Network::Bitcoin);

        assert_eq!(params.last_checkpoint().unwrap().height, 295000);
        assert_eq!(params.next_checkpoint(0).unwrap().height, 11111);
        assert_eq!(params.next_checkpoint(11111).unwrap().height, 33333);
        assert!(params.next_checkpoint(295000).is_none());
    }

    #[test]
    fn test_checkpoints_ascend() {
        for network in [Network::Bitcoin, Network::Testnet] {
            let params = NetworkParams::new(network);
            let heights: Vec<_> = params.checkpoints.iter().map(|c| c.height).collect();
            let mut sorted = heights.clone();
            sorted.sort_unstable();
            assert_eq!(heights, sorted);
        }
    }

    #[test]
    fn test_regtest_allows_self_connect() {
        assert!(NetworkParams::new(Network::Regtest).allow_self_connect);
        assert!(!NetworkParams::new(Network::Bitcoin).allow_self_connect);
    }
}
