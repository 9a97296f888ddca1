//! # kestrel-core
//! Foundation types for the Kestrel header-sync node: block headers and
//! hashing, proof-of-work targets, chain checkpoints, block locators, and
//! the local-chain interface the sync session consumes.

pub mod chain;
pub mod checkpoint;
pub mod constants;
pub mod error;
pub mod genesis;
pub mod locator;
pub mod pow;
pub mod types;
