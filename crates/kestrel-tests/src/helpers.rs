//! Shared test helpers: regtest-difficulty mining and scripted peers.

use kestrel_core::pow::Target;
use kestrel_core::types::{BlockHeader, Hash256};
use kestrel_network::memory::HeadersResponder;

/// Regtest-trivial compact target: roughly every second nonce works.
pub const EASY_BITS: u32 = 0x207fffff;

/// Grind a nonce until the header meets its own target. `tag` varies the
/// merkle root and timestamp so distinct chains diverge.
pub fn mine(prev_hash: Hash256, tag: u32) -> BlockHeader {
    let target = Target::from_compact(EASY_BITS).expect("constant bits decode");
    let mut header = BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: Hash256([(tag % 251) as u8; 32]),
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
pub fn mine_chain(seed_hash: Hash256, n: usize) -> Vec<BlockHeader> {
    mine_chain_tagged(seed_hash, n, 0)
}

/// Like [`mine_chain`], with a tag offset so two chains from the same seed
/// diverge from their very first header.
pub fn mine_chain_tagged(seed_hash: Hash256, n: usize, tag_offset: u32) -> Vec<BlockHeader> {
    let mut out = Vec::with_capacity(n);
    let mut prev = seed_hash;
    for i in 0..n {
        let header = mine(prev, tag_offset + i as u32);
        prev = header.hash();
        out.push(header);
    }
    out
}

/// A responder that serves `chain` honestly, the way a well-behaved peer
/// answers `get-headers`: locate the requester's tip, return up to `batch`
/// successors, never pass the stop hash.
pub fn honest_responder(chain: Vec<BlockHeader>, batch: usize) -> HeadersResponder {
    Box::new(move |request| {
        let start = chain
            .iter()
            .position(|h| request.locator.first() == Some(&h.prev_hash))
            .unwrap_or(chain.len());
        let mut end = (start + batch).min(chain.len());
        if let Some(stop_index) = chain.iter().position(|h| h.hash() == request.stop_hash) {
            end = end.min(stop_index + 1);
        }
        Some(chain[start..end].to_vec())
    })
}

/// A responder that always claims to have nothing.
pub fn stalling_responder() -> HeadersResponder {
    Box::new(|_| Some(Vec::new()))
}

/// A responder that never answers at all.
pub fn silent_responder() -> HeadersResponder {
    Box::new(|_| None)
}
