//! Shared header queue.
//!
//! An ordered, contiguous buffer of header summaries covering the height
//! range being synchronized. The session creates one queue per sync and
//! every peer protocol appends into it; all mutation serializes through a
//! single mutex, with critical sections bounded by the 2000-header batch
//! cap so lock hold times stay small.
//!
//! Invariants maintained on every append:
//! 1. contiguity: each header links to its predecessor by hash and height;
//! 2. seed linkage: the first header builds on the seed;
//! 3. checkpoint agreement: any configured checkpoint inside the range, and
//!    the stop checkpoint itself, must match exactly;
//! 4. proof of work: the stated compact target is well-formed, within the
//!    network PoW limit, and met by the header's hash;
//! 5. terminal bound: no append may exceed the stop height.
//!
//! `enqueue` is atomic at batch granularity: a rejected batch leaves the
//! queue bit-identical to its pre-call state.

use kestrel_core::checkpoint::{Checkpoint, CheckpointSet};
use kestrel_core::error::QueueError;
use kestrel_core::locator::locator_heights;
use kestrel_core::pow::Target;
use kestrel_core::types::{BlockHeader, Hash256, HeaderSummary};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

/// The sync range the queue was initialized with.
#[derive(Debug, Clone, Copy)]
struct SyncRange {
    /// The highest already-persisted header the queue builds on.
    seed: HeaderSummary,
    /// Terminal checkpoint: the queue is full when a header with exactly
    /// this hash is committed at this height.
    stop: Checkpoint,
}

#[derive(Debug)]
struct Inner {
    range: Option<SyncRange>,
    headers: VecDeque<HeaderSummary>,
    /// Height and hash the next appended header must link to: the seed at
    /// first, then the committed tail.
    attach: (u64, Hash256),
    /// Floor for rollback: the seed, advanced past dequeued headers.
    base: (u64, Hash256),
}

/// Ordered, contiguous, append-only buffer of header summaries.
///
/// Shared between the session and all active peer protocols; lifetime is
/// that of the longest holder.
pub struct HeaderQueue {
    checkpoints: CheckpointSet,
    pow_limit: Target,
    inner: Mutex<Inner>,
}

impl HeaderQueue {
    /// Create an uninitialized queue validating against the given
    /// checkpoints and proof-of-work limit.
    pub fn new(checkpoints: CheckpointSet, pow_limit: Target) -> Self {
        Self {
            checkpoints,
            pow_limit,
            inner: Mutex::new(Inner {
                range: None,
                headers: VecDeque::new(),
                attach: (0, Hash256::ZERO),
                base: (0, Hash256::ZERO),
            }),
        }
    }

    /// Record the sync range. The queue must be untouched.
    ///
    /// `seed` is the highest persisted header the downloaded chain will
    /// build on; `stop` pins both the terminal height and the hash required
    /// there. `seed.height == stop.height` denotes an empty range.
    pub fn initialize(&self, seed: HeaderSummary, stop: Checkpoint) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.range.is_some() {
            return Err(QueueError::AlreadyInitialized);
        }
        inner.attach = (seed.height, seed.hash);
        inner.base = (seed.height, seed.hash);
        inner.range = Some(SyncRange { seed, stop });
        debug!(
            seed_height = seed.height,
            stop_height = stop.height,
            "queue: initialized"
        );
        Ok(())
    }

    /// Append a contiguous run of headers starting at the current tail.
    ///
    /// Validates every header against the queue invariants, in order, and
    /// commits all-or-nothing.
    pub fn enqueue(&self, batch: &[BlockHeader]) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let range = inner.range.ok_or(QueueError::NotInitialized)?;

        if batch.is_empty() {
            return Ok(());
        }
        let (tail_height, _) = inner.attach;
        if tail_height + batch.len() as u64 > range.stop.height {
            return Err(QueueError::RangeExceeded {
                last_height: range.stop.height,
            });
        }

        let (mut height, mut prev) = inner.attach;
        let mut staged = Vec::with_capacity(batch.len());
        for header in batch {
            height += 1;
            if header.prev_hash != prev {
                return Err(QueueError::DiscontinuousHeight {
                    height,
                    expected: prev,
                    got: header.prev_hash,
                });
            }
            let target = Target::from_compact(header.bits)
                .map_err(|source| QueueError::InvalidHeader { height, source })?;
            if !target.within_limit(&self.pow_limit) {
                return Err(QueueError::BadProofOfWork { height });
            }
            let hash = header.hash();
            if !target.is_met_by(&hash) {
                return Err(QueueError::BadProofOfWork { height });
            }
            if let Some(pinned) = self.checkpoints.hash_at(height) {
                if hash != pinned {
                    return Err(QueueError::CheckpointMismatch { height });
                }
            }
            if height == range.stop.height && hash != range.stop.hash {
                return Err(QueueError::CheckpointMismatch { height });
            }
            staged.push(header.summarize(height));
            prev = hash;
        }

        inner.headers.extend(staged);
        inner.attach = (height, prev);
        debug!(tail = height, appended = batch.len(), "queue: batch committed");
        Ok(())
    }

    /// Remove and return up to `n` headers from the front, for downstream
    /// block-body fetch. The remainder keeps all invariants.
    pub fn dequeue(&self, n: usize) -> Vec<HeaderSummary> {
        let mut inner = self.inner.lock();
        let take = n.min(inner.headers.len());
        let out: Vec<HeaderSummary> = inner.headers.drain(..take).collect();
        if let Some(last) = out.last() {
            inner.base = (last.height, last.hash);
        }
        out
    }

    /// Truncate so the tail is at `height`.
    ///
    /// Used when a peer that contributed tail headers is disproven. Clamped
    /// below by the seed / dequeue boundary; heights at or above the tail
    /// are a no-op.
    pub fn rollback_to(&self, height: u64) {
        let mut inner = self.inner.lock();
        if inner.range.is_none() {
            return;
        }
        let floor = inner.base.0;
        let target_height = height.max(floor);
        while inner
            .headers
            .back()
            .is_some_and(|tail| tail.height > target_height)
        {
            inner.headers.pop_back();
        }
        inner.attach = match inner.headers.back() {
            Some(tail) => (tail.height, tail.hash),
            None => inner.base,
        };
        debug!(tail = inner.attach.0, "queue: rolled back");
    }

    /// True iff the queue has reached the stop height.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        match inner.range {
            Some(range) => inner.attach.0 >= range.stop.height,
            None => false,
        }
    }

    /// True iff no headers are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().headers.is_empty()
    }

    /// Number of buffered headers.
    pub fn len(&self) -> usize {
        self.inner.lock().headers.len()
    }

    /// Height of the newest committed header (the seed height while empty).
    /// `None` before initialization.
    pub fn tail_height(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.range.map(|_| inner.attach.0)
    }

    /// First height the queue downloads. `None` before initialization.
    pub fn first_height(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.range.map(|range| range.seed.height + 1)
    }

    /// Terminal height of the sync range. `None` before initialization.
    pub fn last_height(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner.range.map(|range| range.stop.height)
    }

    /// Stop hash for `get-headers` requests.
    pub fn stop_hash(&self) -> Option<Hash256> {
        let inner = self.inner.lock();
        inner.range.map(|range| range.stop.hash)
    }

    /// Hash of the committed header at `height`, the seed, or the dequeue
    /// boundary. `None` for anything no longer (or not yet) held.
    pub fn hash_at(&self, height: u64) -> Option<Hash256> {
        let inner = self.inner.lock();
        Self::resolve_hash(&inner, height)
    }

    /// Locator hashes from the current tail back to the seed, newest first.
    pub fn locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock();
        let Some(range) = inner.range else {
            return Vec::new();
        };
        locator_heights(inner.attach.0, range.seed.height)
            .into_iter()
            .filter_map(|height| Self::resolve_hash(&inner, height))
            .collect()
    }

    /// Snapshot of the buffered summaries, front to tail.
    pub fn summaries(&self) -> Vec<HeaderSummary> {
        self.inner.lock().headers.iter().copied().collect()
    }

    fn resolve_hash(inner: &Inner, height: u64) -> Option<Hash256> {
        let range = inner.range?;
        if height == range.seed.height {
            return Some(range.seed.hash);
        }
        if height == inner.base.0 {
            return Some(inner.base.1);
        }
        let front = inner.headers.front()?.height;
        if height < front || height > inner.attach.0 {
            return None;
        }
        inner
            .headers
            .get((height - front) as usize)
            .map(|summary| summary.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::constants::Network;

    const EASY_BITS: u32 = 0x207fffff;

    fn pow_limit() -> Target {
        Target::from_compact(Network::Regtest.pow_limit_bits()).unwrap()
    }

    /// Grind a nonce until the header meets its own (trivial) target.
    fn mine(prev_hash: Hash256, tag: u32) -> BlockHeader {
        let target = Target::from_compact(EASY_BITS).unwrap();
        let mut header = BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256([tag as u8; 32]),
            timestamp: 1_296_688_602 + tag,
            bits: EASY_BITS,
            nonce: 0,
        };
        while !target.is_met_by(&header.hash()) {
            header.nonce += 1;
        }
        header
    }

    /// A contiguous mined chain of `n` headers building on `seed_hash`.
    fn mine_chain(seed_hash: Hash256, n: usize) -> Vec<BlockHeader> {
        let mut out = Vec::with_capacity(n);
        let mut prev = seed_hash;
        for i in 0..n {
            let header = mine(prev, i as u32);
            prev = header.hash();
            out.push(header);
        }
        out
    }

    fn seed() -> HeaderSummary {
        HeaderSummary {
            hash: Hash256([0xEE; 32]),
            prev_hash: Hash256::ZERO,
            bits: EASY_BITS,
            timestamp: 1_296_688_602,
            version: 1,
            height: 0,
        }
    }

    /// Queue over `[1, stop_height]` with the stop hash pinned to the mined
    /// chain's last header.
    fn queue_for(chain: &[BlockHeader], checkpoints: CheckpointSet) -> HeaderQueue {
        let queue = HeaderQueue::new(checkpoints, pow_limit());
        let stop = Checkpoint::new(
            chain.len() as u64,
            chain.last().map(|h| h.hash()).unwrap_or(seed().hash),
        );
        queue.initialize(seed(), stop).unwrap();
        queue
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    #[test]
    fn initialize_twice_fails() {
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        let stop = Checkpoint::new(5, Hash256([1; 32]));
        queue.initialize(seed(), stop).unwrap();
        assert_eq!(
            queue.initialize(seed(), stop),
            Err(QueueError::AlreadyInitialized)
        );
    }

    #[test]
    fn enqueue_before_initialize_fails() {
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        let chain = mine_chain(seed().hash, 1);
        assert_eq!(queue.enqueue(&chain), Err(QueueError::NotInitialized));
    }

    #[test]
    fn empty_range_is_immediately_full() {
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        queue
            .initialize(seed(), Checkpoint::new(seed().height, seed().hash))
            .unwrap();
        assert!(queue.is_full());
        assert!(queue.is_empty());
    }

    // -------------------------------------------------------------------------
    // Append validation
    // -------------------------------------------------------------------------

    #[test]
    fn accepts_contiguous_chain() {
        let chain = mine_chain(seed().hash, 8);
        let queue = queue_for(&chain, CheckpointSet::none());

        queue.enqueue(&chain[..5]).unwrap();
        assert_eq!(queue.tail_height(), Some(5));
        assert!(!queue.is_full());

        queue.enqueue(&chain[5..]).unwrap();
        assert_eq!(queue.tail_height(), Some(8));
        assert!(queue.is_full());
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn first_header_must_link_to_seed() {
        let chain = mine_chain(Hash256([0x99; 32]), 3);
        let queue = queue_for(&chain, CheckpointSet::none());
        assert!(matches!(
            queue.enqueue(&chain),
            Err(QueueError::DiscontinuousHeight { height: 1, .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn broken_linkage_mid_batch_rejected() {
        let mut chain = mine_chain(seed().hash, 5);
        chain[3].prev_hash = Hash256([0x77; 32]);
        let queue = queue_for(&chain, CheckpointSet::none());
        assert!(matches!(
            queue.enqueue(&chain),
            Err(QueueError::DiscontinuousHeight { height: 4, .. })
        ));
    }

    #[test]
    fn rejected_batch_leaves_queue_unchanged() {
        let chain = mine_chain(seed().hash, 6);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain[..3]).unwrap();
        let before = queue.summaries();

        let mut bad = chain[3..].to_vec();
        bad[2].prev_hash = Hash256([0x55; 32]);
        assert!(queue.enqueue(&bad).is_err());

        assert_eq!(queue.summaries(), before);
        assert_eq!(queue.tail_height(), Some(3));
    }

    #[test]
    fn overlapping_batch_rejected_as_discontinuous() {
        let chain = mine_chain(seed().hash, 8);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain[..4]).unwrap();
        // A second peer re-sending an already-committed range loses the race.
        assert!(matches!(
            queue.enqueue(&chain[..4]),
            Err(QueueError::DiscontinuousHeight { .. })
        ));
        // The loser did not poison the queue.
        queue.enqueue(&chain[4..]).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn malformed_target_rejected() {
        let mut chain = mine_chain(seed().hash, 2);
        chain[1].bits = 0x04800001; // sign bit set
        let queue = queue_for(&chain, CheckpointSet::none());
        assert!(matches!(
            queue.enqueue(&chain),
            Err(QueueError::InvalidHeader { height: 2, .. })
        ));
    }

    #[test]
    fn target_easier_than_limit_rejected() {
        let limit = Target::from_compact(0x1d00ffff).unwrap();
        let queue = HeaderQueue::new(CheckpointSet::none(), limit);
        let chain = mine_chain(seed().hash, 1);
        queue
            .initialize(seed(), Checkpoint::new(1, chain[0].hash()))
            .unwrap();
        // Regtest-easy bits are far beyond the mainnet limit.
        assert_eq!(
            queue.enqueue(&chain),
            Err(QueueError::BadProofOfWork { height: 1 })
        );
    }

    #[test]
    fn hash_above_target_rejected() {
        let chain = mine_chain(seed().hash, 1);
        let mut unmined = chain.clone();
        // A harder target the mined nonce almost surely misses.
        unmined[0].bits = 0x0300ffff;
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        queue
            .initialize(seed(), Checkpoint::new(1, unmined[0].hash()))
            .unwrap();
        assert_eq!(
            queue.enqueue(&unmined),
            Err(QueueError::BadProofOfWork { height: 1 })
        );
    }

    #[test]
    fn checkpoint_agreement_enforced() {
        let chain = mine_chain(seed().hash, 5);
        let wrong = CheckpointSet::new(vec![Checkpoint::new(3, Hash256([0xBB; 32]))]).unwrap();
        let queue = queue_for(&chain, wrong);
        assert_eq!(
            queue.enqueue(&chain),
            Err(QueueError::CheckpointMismatch { height: 3 })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn matching_checkpoint_accepted() {
        let chain = mine_chain(seed().hash, 5);
        let pinned = CheckpointSet::new(vec![Checkpoint::new(3, chain[2].hash())]).unwrap();
        let queue = queue_for(&chain, pinned);
        queue.enqueue(&chain).unwrap();
        assert_eq!(queue.hash_at(3), Some(chain[2].hash()));
    }

    #[test]
    fn stop_hash_mismatch_rejected() {
        let chain = mine_chain(seed().hash, 4);
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        queue
            .initialize(seed(), Checkpoint::new(4, Hash256([0xCC; 32])))
            .unwrap();
        assert_eq!(
            queue.enqueue(&chain),
            Err(QueueError::CheckpointMismatch { height: 4 })
        );
    }

    #[test]
    fn batch_past_stop_height_rejected() {
        let chain = mine_chain(seed().hash, 6);
        let queue = HeaderQueue::new(CheckpointSet::none(), pow_limit());
        queue
            .initialize(seed(), Checkpoint::new(4, chain[3].hash()))
            .unwrap();
        assert_eq!(
            queue.enqueue(&chain),
            Err(QueueError::RangeExceeded { last_height: 4 })
        );
        queue.enqueue(&chain[..4]).unwrap();
        assert!(queue.is_full());
    }

    // -------------------------------------------------------------------------
    // Dequeue and rollback
    // -------------------------------------------------------------------------

    #[test]
    fn dequeue_preserves_remainder() {
        let chain = mine_chain(seed().hash, 6);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();

        let taken = queue.dequeue(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].height, 1);
        assert_eq!(taken[1].height, 2);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.tail_height(), Some(6));
        assert_eq!(queue.summaries()[0].height, 3);
    }

    #[test]
    fn dequeue_more_than_len_drains() {
        let chain = mine_chain(seed().hash, 3);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();
        assert_eq!(queue.dequeue(10).len(), 3);
        assert!(queue.is_empty());
        // Tail is unchanged: the range is still complete.
        assert!(queue.is_full());
    }

    #[test]
    fn rollback_truncates_tail() {
        let chain = mine_chain(seed().hash, 6);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain[..5]).unwrap();

        queue.rollback_to(2);
        assert_eq!(queue.tail_height(), Some(2));
        assert_eq!(queue.len(), 2);

        // Appends re-link at the new tail.
        queue.enqueue(&chain[2..]).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn rollback_to_seed_empties_queue() {
        let chain = mine_chain(seed().hash, 4);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();

        queue.rollback_to(0);
        assert!(queue.is_empty());
        assert_eq!(queue.tail_height(), Some(0));
        queue.enqueue(&chain).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn rollback_clamps_at_dequeue_boundary() {
        let chain = mine_chain(seed().hash, 6);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();
        queue.dequeue(3);

        queue.rollback_to(0);
        // Cannot roll back past the consumed prefix.
        assert_eq!(queue.tail_height(), Some(3));
        assert!(queue.is_empty());
        queue.enqueue(&chain[3..]).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn rollback_above_tail_is_noop() {
        let chain = mine_chain(seed().hash, 3);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();
        queue.rollback_to(100);
        assert_eq!(queue.tail_height(), Some(3));
    }

    // -------------------------------------------------------------------------
    // Locator
    // -------------------------------------------------------------------------

    #[test]
    fn locator_of_empty_queue_is_seed() {
        let chain = mine_chain(seed().hash, 3);
        let queue = queue_for(&chain, CheckpointSet::none());
        assert_eq!(queue.locator(), vec![seed().hash]);
    }

    #[test]
    fn locator_starts_at_tail_and_ends_at_seed() {
        let chain = mine_chain(seed().hash, 6);
        let queue = queue_for(&chain, CheckpointSet::none());
        queue.enqueue(&chain).unwrap();
        let locator = queue.locator();
        assert_eq!(locator.first(), Some(&chain[5].hash()));
        assert_eq!(locator.last(), Some(&seed().hash));
    }
}
