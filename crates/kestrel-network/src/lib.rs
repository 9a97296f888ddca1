//! # kestrel-network — header-first P2P sync layer.
//!
//! Speaks the Bitcoin wire protocol over TCP: message framing with
//! double-SHA-256 checksums, the version handshake, and the
//! `get-headers`/`headers` exchange. On top of the transport sit the shared
//! [`HeaderQueue`], the per-peer [`HeaderSyncProtocol`], and the
//! [`HeaderSyncSession`] that orchestrates multi-peer download with an
//! adaptive per-peer throughput floor.
//!
//! The main entry point is [`HeaderSyncSession::start`], which derives the
//! sync range from the local chain and drives peers until the queue is
//! full, the session is stopped, or the range turns out to be empty.

pub mod channel;
pub mod config;
pub mod header_sync;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod queue;
pub mod rate;
pub mod session;
pub mod tcp;
pub mod wire;

pub use channel::{Channel, Connector};
pub use config::{NetworkConfig, SyncConfig};
pub use header_sync::HeaderSyncProtocol;
pub use queue::HeaderQueue;
pub use rate::RateTracker;
pub use session::{HeaderSyncSession, SessionHandler};
pub use tcp::{TcpChannel, TcpConnector};
pub use wire::{GetHeaders, Message, VersionMessage};
