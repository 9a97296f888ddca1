//! Local chain interface.
//!
//! The persistent block chain is an external collaborator; the session
//! consumes only the three queries below. [`MemoryChain`] is the in-memory
//! implementation used by the binary and the test suites.

use crate::error::ChainError;
use crate::types::BlockHeader;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Read-only view of the locally persisted header chain.
///
/// Implemented by the node's storage layer; the header-sync session uses it
/// to derive its sync range.
pub trait LocalChain: Send + Sync {
    /// Height of the highest persisted block.
    fn last_height(&self) -> Result<u64, ChainError>;

    /// The first missing contiguous height range `[first, last]`, if the
    /// persisted chain has a hole below its tip.
    fn gap_range(&self) -> Result<Option<(u64, u64)>, ChainError>;

    /// The persisted header at `height`. Returns `None` if that height is
    /// missing (beyond the tip or inside a gap).
    fn header_at(&self, height: u64) -> Result<Option<BlockHeader>, ChainError>;
}

/// Height-keyed in-memory header store.
pub struct MemoryChain {
    headers: Mutex<BTreeMap<u64, BlockHeader>>,
}

impl MemoryChain {
    /// Create a chain holding only the given genesis header at height 0.
    pub fn new(genesis: BlockHeader) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(0, genesis);
        Self {
            headers: Mutex::new(headers),
        }
    }

    /// Insert (or replace) the header at `height`.
    pub fn store(&self, height: u64, header: BlockHeader) {
        self.headers.lock().insert(height, header);
    }

    /// Number of persisted headers.
    pub fn len(&self) -> usize {
        self.headers.lock().len()
    }

    /// True iff nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.headers.lock().is_empty()
    }
}

impl LocalChain for MemoryChain {
    fn last_height(&self) -> Result<u64, ChainError> {
        self.headers
            .lock()
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| ChainError::OperationFailed("chain store is empty".into()))
    }

    fn gap_range(&self) -> Result<Option<(u64, u64)>, ChainError> {
        let headers = self.headers.lock();
        let mut expected = 0u64;
        for height in headers.keys() {
            if *height > expected {
                return Ok(Some((expected, height - 1)));
            }
            expected = height + 1;
        }
        Ok(None)
    }

    fn header_at(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.headers.lock().get(&height).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;

    fn header(seed: u8) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256([seed; 32]),
            merkle_root: Hash256::ZERO,
            timestamp: 1_231_006_505,
            bits: 0x207fffff,
            nonce: seed as u32,
        }
    }

    #[test]
    fn new_chain_has_genesis_at_zero() {
        let chain = MemoryChain::new(header(0));
        assert_eq!(chain.last_height().unwrap(), 0);
        assert_eq!(chain.header_at(0).unwrap(), Some(header(0)));
        assert_eq!(chain.header_at(1).unwrap(), None);
    }

    #[test]
    fn last_height_tracks_highest_insert() {
        let chain = MemoryChain::new(header(0));
        chain.store(1, header(1));
        chain.store(5, header(5));
        assert_eq!(chain.last_height().unwrap(), 5);
    }

    #[test]
    fn contiguous_chain_has_no_gap() {
        let chain = MemoryChain::new(header(0));
        chain.store(1, header(1));
        chain.store(2, header(2));
        assert_eq!(chain.gap_range().unwrap(), None);
    }

    #[test]
    fn gap_is_first_missing_run() {
        let chain = MemoryChain::new(header(0));
        chain.store(1, header(1));
        // Heights 2..=4 missing.
        chain.store(5, header(5));
        chain.store(6, header(6));
        assert_eq!(chain.gap_range().unwrap(), Some((2, 4)));
    }

    #[test]
    fn only_first_gap_reported() {
        let chain = MemoryChain::new(header(0));
        chain.store(3, header(3));
        chain.store(10, header(10));
        assert_eq!(chain.gap_range().unwrap(), Some((1, 2)));
    }

    #[test]
    fn trait_object_usable() {
        let chain = MemoryChain::new(header(0));
        let dyn_chain: &dyn LocalChain = &chain;
        assert_eq!(dyn_chain.last_height().unwrap(), 0);
    }
}
