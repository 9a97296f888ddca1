//! Error types for the Kestrel header-sync core.
use crate::types::Hash256;
use thiserror::Error;

/// Compact-target (`nBits`) decoding failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    #[error("negative compact target {0:#010x}")] Negative(u32),
    #[error("zero compact target {0:#010x}")] Zero(u32),
    #[error("compact target overflows 256 bits: {0:#010x}")] Overflow(u32),
}

/// Checkpoint-list construction failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("duplicate checkpoint height {0}")] DuplicateHeight(u64),
    #[error("contradictory checkpoints at height {0}")] Contradiction(u64),
}

/// Local chain query failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("header not found at height {0}")] NotFound(u64),
    #[error("chain query failed: {0}")] OperationFailed(String),
}

/// Header queue failures. `enqueue` is atomic: any of these leaves the
/// queue exactly as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue already initialized")] AlreadyInitialized,
    #[error("queue not initialized")] NotInitialized,
    #[error("discontinuous batch at height {height}: expected prev {expected}, got {got}")]
    DiscontinuousHeight { height: u64, expected: Hash256, got: Hash256 },
    #[error("batch extends past terminal height {last_height}")]
    RangeExceeded { last_height: u64 },
    #[error("malformed header at height {height}: {source}")]
    InvalidHeader { height: u64, source: TargetError },
    #[error("checkpoint mismatch at height {height}")] CheckpointMismatch { height: u64 },
    #[error("bad proof of work at height {height}")] BadProofOfWork { height: u64 },
}

/// Transport-level channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("connect failed: {0}")] ConnectFailed(String),
    #[error("handshake failed: {0}")] HandshakeFailed(String),
    #[error("peer version {peer} below minimum {min}")] VersionTooLow { peer: u32, min: u32 },
    #[error("peer lacks required services: have {have:#x}, need {need:#x}")]
    MissingServices { have: u64, need: u64 },
    #[error("malformed message: {0}")] Malformed(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("channel closed")] ChannelClosed,
    #[error("timed out")] Timeout,
    #[error("io: {0}")] Io(String),
}

/// Terminal outcomes of a single peer's header-sync protocol run.
///
/// These never reach the session handler; they feed the back-off loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)] Queue(#[from] QueueError),
    #[error("channel below rate floor: {rate:.0} < {floor:.0} headers/s")]
    ChannelSlow { rate: f64, floor: f64 },
    #[error("peer returned no headers before the queue was full")] Stalled,
    #[error("channel gone: {0}")] ChannelGone(NetError),
    #[error("cancelled")] Cancelled,
}

/// Session-level failures surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already started")] AlreadyStarted,
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Queue(#[from] QueueError),
    #[error("session stopped before completion")] Cancelled,
}

#[derive(Error, Debug)]
pub enum KestrelError {
    #[error(transparent)] Target(#[from] TargetError),
    #[error(transparent)] Checkpoint(#[from] CheckpointError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Queue(#[from] QueueError),
    #[error(transparent)] Net(#[from] NetError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error(transparent)] Session(#[from] SessionError),
}
