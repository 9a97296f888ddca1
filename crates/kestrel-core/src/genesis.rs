//! Genesis block headers.
//!
//! The literal first header of each network, from which an otherwise-empty
//! local chain is seeded. The mainnet hash is the well-known
//! `000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f`.

use crate::constants::Network;
use crate::types::{BlockHeader, Hash256};

/// Merkle root of the genesis coinbase, shared by all three networks.
fn genesis_merkle_root() -> Hash256 {
    Hash256::from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
        .unwrap_or(Hash256::ZERO)
}

/// The genesis block header for a network.
pub fn genesis_header(network: Network) -> BlockHeader {
    let merkle_root = genesis_merkle_root();
    match network {
        Network::Mainnet => BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        },
        Network::Testnet => BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: 1_296_688_602,
            bits: 0x1d00ffff,
            nonce: 414_098_458,
        },
        Network::Regtest => BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: 1_296_688_602,
            bits: 0x207fffff,
            nonce: 2,
        },
    }
}
