//! Configured chain checkpoints.
//!
//! A checkpoint pins the block hash at a given height as axiomatic. The
//! header queue rejects any batch that disagrees with a checkpoint inside
//! its range, and the session uses the highest checkpoint above the local
//! tip as its stop.

use crate::constants::Network;
use crate::error::CheckpointError;
use crate::types::Hash256;
use std::ops::RangeInclusive;

/// A (height, hash) pair treated as axiomatic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// Chain height of the pinned block.
    pub height: u64,
    /// Hash the block at that height must have.
    pub hash: Hash256,
}

impl Checkpoint {
    /// Convenience constructor.
    pub fn new(height: u64, hash: Hash256) -> Self {
        Self { height, hash }
    }
}

/// An immutable, ascending-sorted list of checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    points: Vec<Checkpoint>,
}

impl CheckpointSet {
    /// Build a set from arbitrary-order input.
    ///
    /// Input is sorted ascending by height (stably, so a sorted valid list
    /// passes through unchanged). Two entries at the same height are a
    /// configuration error: [`CheckpointError::DuplicateHeight`] when the
    /// hashes agree, [`CheckpointError::Contradiction`] when they differ.
    pub fn new(mut points: Vec<Checkpoint>) -> Result<Self, CheckpointError> {
        points.sort_by_key(|cp| cp.height);
        for pair in points.windows(2) {
            if pair[0].height == pair[1].height {
                if pair[0].hash == pair[1].hash {
                    return Err(CheckpointError::DuplicateHeight(pair[0].height));
                }
                return Err(CheckpointError::Contradiction(pair[0].height));
            }
        }
        Ok(Self { points })
    }

    /// An empty set (accepts any chain).
    pub fn none() -> Self {
        Self::default()
    }

    /// The built-in checkpoint list for a network.
    pub fn for_network(network: Network) -> Self {
        let points = match network {
            Network::Mainnet => mainnet_checkpoints(),
            Network::Testnet => testnet_checkpoints(),
            Network::Regtest => Vec::new(),
        };
        // Built-in lists are sorted and duplicate-free by construction.
        Self { points }
    }

    /// The highest configured checkpoint, if any.
    pub fn highest(&self) -> Option<&Checkpoint> {
        self.points.last()
    }

    /// The pinned hash at `height`, if a checkpoint exists there.
    pub fn hash_at(&self, height: u64) -> Option<Hash256> {
        self.points
            .binary_search_by_key(&height, |cp| cp.height)
            .ok()
            .map(|idx| self.points[idx].hash)
    }

    /// Iterate the checkpoints whose heights fall within `range`.
    pub fn in_range(&self, range: RangeInclusive<u64>) -> impl Iterator<Item = &Checkpoint> {
        let (start, end) = (*range.start(), *range.end());
        self.points
            .iter()
            .skip_while(move |cp| cp.height < start)
            .take_while(move |cp| cp.height <= end)
    }

    /// Number of configured checkpoints.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True iff no checkpoints are configured.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn cp(height: u64, hash_hex: &str) -> Checkpoint {
    // Built-in constants are compile-time-known valid hex.
    let hash = Hash256::from_hex(hash_hex).unwrap_or(Hash256::ZERO);
    Checkpoint { height, hash }
}

/// Classic mainnet checkpoints.
fn mainnet_checkpoints() -> Vec<Checkpoint> {
    vec![
        cp(11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
        cp(33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
        cp(74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
        cp(105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
        cp(134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
        cp(168_000, "000000000000099e61ea72015e79632f216fe2cb33d7899acb35b75c8303b763"),
        cp(250_000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    ]
}

/// Testnet checkpoints.
fn testnet_checkpoints() -> Vec<Checkpoint> {
    vec![cp(
        546,
        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(height: u64, byte: u8) -> Checkpoint {
        Checkpoint::new(height, Hash256([byte; 32]))
    }

    #[test]
    fn construction_sorts_ascending() {
        let set = CheckpointSet::new(vec![point(300, 3), point(100, 1), point(200, 2)]).unwrap();
        let heights: Vec<u64> = set.in_range(0..=u64::MAX).map(|cp| cp.height).collect();
        assert_eq!(heights, vec![100, 200, 300]);
    }

    #[test]
    fn sorted_input_is_identity() {
        let input = vec![point(1, 1), point(2, 2), point(3, 3)];
        let set = CheckpointSet::new(input.clone()).unwrap();
        let out: Vec<Checkpoint> = set.in_range(0..=u64::MAX).copied().collect();
        assert_eq!(out, input);
    }

    #[test]
    fn duplicate_height_rejected() {
        let err = CheckpointSet::new(vec![point(5, 1), point(5, 1)]).unwrap_err();
        assert_eq!(err, CheckpointError::DuplicateHeight(5));
    }

    #[test]
    fn contradiction_rejected() {
        let err = CheckpointSet::new(vec![point(5, 1), point(5, 2)]).unwrap_err();
        assert_eq!(err, CheckpointError::Contradiction(5));
    }

    #[test]
    fn highest_returns_top() {
        let set = CheckpointSet::new(vec![point(10, 1), point(30, 3), point(20, 2)]).unwrap();
        assert_eq!(set.highest().map(|cp| cp.height), Some(30));
        assert!(CheckpointSet::none().highest().is_none());
    }

    #[test]
    fn hash_at_exact_height_only() {
        let set = CheckpointSet::new(vec![point(10, 0xAA)]).unwrap();
        assert_eq!(set.hash_at(10), Some(Hash256([0xAA; 32])));
        assert_eq!(set.hash_at(11), None);
    }

    #[test]
    fn in_range_is_inclusive() {
        let set =
            CheckpointSet::new(vec![point(10, 1), point(20, 2), point(30, 3), point(40, 4)])
                .unwrap();
        let heights: Vec<u64> = set.in_range(20..=30).map(|cp| cp.height).collect();
        assert_eq!(heights, vec![20, 30]);
    }

    #[test]
    fn builtin_lists_are_well_formed() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let set = CheckpointSet::for_network(network);
            // Re-running construction must accept the built-in list unchanged.
            let rebuilt =
                CheckpointSet::new(set.in_range(0..=u64::MAX).copied().collect()).unwrap();
            assert_eq!(rebuilt, set);
        }
        assert!(CheckpointSet::for_network(Network::Regtest).is_empty());
        assert_eq!(
            CheckpointSet::for_network(Network::Mainnet)
                .highest()
                .map(|cp| cp.height),
            Some(250_000)
        );
    }

    #[test]
    fn builtin_hashes_parse_to_nonzero() {
        for cp in CheckpointSet::for_network(Network::Mainnet).in_range(0..=u64::MAX) {
            assert!(!cp.hash.is_zero());
        }
    }
}
