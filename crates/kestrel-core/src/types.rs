//! Core protocol types: hashes, block headers, header summaries.
//!
//! A block header is the canonical 80-byte Bitcoin structure. Hashing is
//! double SHA-256 over that serialization; byte order on the wire is
//! little-endian per field, and hashes display in the conventional
//! byte-reversed hex.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value in wire byte order.
///
/// Used for block header hashes and merkle roots. [`fmt::Display`] renders
/// the conventional byte-reversed hex (so the genesis hash prints with its
/// leading zeros), and [`Hash256::from_hex`] accepts the same form.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Previous-hash of the genesis header.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array in wire order.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes in wire order.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a hash from display-order (byte-reversed) hex.
    ///
    /// This is the form block explorers and checkpoint tables use.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Double SHA-256 over arbitrary bytes.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// An 80-byte Bitcoin block header.
///
/// Field order and widths match the consensus serialization exactly:
/// version, previous hash, merkle root, timestamp, compact target, nonce,
/// all little-endian.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Protocol version (version-bits field).
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target (`nBits`).
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

impl BlockHeader {
    /// Serialize to the canonical 80-byte form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Deserialize from the canonical 80-byte form.
    ///
    /// Every 80-byte string is a structurally valid header; validity of the
    /// target encoding and proof of work is checked separately.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        fn le_u32(src: &[u8]) -> u32 {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(src);
            u32::from_le_bytes(buf)
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        Self {
            version: le_u32(&bytes[0..4]),
            prev_hash: Hash256(prev),
            merkle_root: Hash256(merkle),
            timestamp: le_u32(&bytes[68..72]),
            bits: le_u32(&bytes[72..76]),
            nonce: le_u32(&bytes[76..80]),
        }
    }

    /// Compute the block header hash (double SHA-256 of the 80-byte form).
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    /// Reduce to a [`HeaderSummary`] at the given chain height.
    pub fn summarize(&self, height: u64) -> HeaderSummary {
        HeaderSummary {
            hash: self.hash(),
            prev_hash: self.prev_hash,
            bits: self.bits,
            timestamp: self.timestamp,
            version: self.version,
            height,
        }
    }
}

/// What the header queue retains per header: enough for proof-of-work
/// verification and chain linkage, without the merkle root or nonce.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderSummary {
    /// This header's hash.
    pub hash: Hash256,
    /// Hash of the predecessor header.
    pub prev_hash: Hash256,
    /// Compact difficulty target.
    pub bits: u32,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Protocol version.
    pub version: u32,
    /// Chain height of this header.
    pub height: u64,
}
