//! Per-peer header-sync protocol.
//!
//! One protocol instance drives one channel: it issues `get-headers` with a
//! locator built from the shared queue's tail, validates each `headers`
//! reply by appending it to the queue, samples throughput, and terminates
//! the channel on any violation. Peer-local failures never reach the
//! session handler; they surface as [`SyncError`] values feeding the
//! session's back-off loop.
//!
//! The queue is only ever written through the single `enqueue` call per
//! reply, so concurrent protocols serialize at the queue mutex and a loser
//! in an overlap race fails with a discontinuity without poisoning the
//! shared state.

use crate::channel::Channel;
use crate::config::SyncConfig;
use crate::queue::HeaderQueue;
use crate::rate::RateTracker;
use crate::wire::{GetHeaders, Message};
use kestrel_core::constants::MIN_PEER_VERSION;
use kestrel_core::error::{NetError, QueueError, SyncError};
use kestrel_core::types::{BlockHeader, Hash256};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Header-sync state machine for a single channel.
pub struct HeaderSyncProtocol {
    channel: Arc<dyn Channel>,
    queue: Arc<HeaderQueue>,
    /// Floor snapshot taken at attach time. A stale snapshot only delays
    /// back-off by one cycle.
    floor: f64,
    config: SyncConfig,
    stop: watch::Receiver<bool>,
    tracker: RateTracker,
    /// Queue tail when this peer attached; rollback point if the peer is
    /// disproven by a checkpoint.
    attach_height: u64,
}

impl HeaderSyncProtocol {
    /// Attach a protocol to a handshake-complete channel.
    pub fn new(
        channel: Arc<dyn Channel>,
        queue: Arc<HeaderQueue>,
        floor: f64,
        config: SyncConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let tracker = RateTracker::new(config.grace);
        let attach_height = queue.tail_height().unwrap_or(0);
        Self {
            channel,
            queue,
            floor,
            config,
            stop,
            tracker,
            attach_height,
        }
    }

    /// Drive the channel until the queue is full or the peer is dropped.
    ///
    /// Returns `Ok(())` only when the shared queue reached its stop height;
    /// every other outcome is a [`SyncError`] and the channel is stopped.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let peer = self.channel.authority();
        let version = self.channel.negotiated_version();
        if version < MIN_PEER_VERSION {
            self.channel.stop();
            return Err(SyncError::ChannelGone(NetError::VersionTooLow {
                peer: version,
                min: MIN_PEER_VERSION,
            }));
        }
        debug!(%peer, version, floor = self.floor, "header_sync: attached");

        let mut messages = self.channel.subscribe();
        loop {
            if *self.stop.borrow() {
                self.channel.stop();
                return Err(SyncError::Cancelled);
            }
            if self.queue.is_full() {
                debug!(%peer, "header_sync: queue full, complete");
                return Ok(());
            }

            self.request_headers()?;
            let headers = self.await_headers(&mut messages).await?;

            if headers.is_empty() {
                if self.queue.is_full() {
                    return Ok(());
                }
                warn!(%peer, "header_sync: empty reply before queue full");
                self.channel.stop();
                return Err(SyncError::Stalled);
            }

            if let Err(err) = self.queue.enqueue(&headers) {
                warn!(%peer, %err, "header_sync: batch rejected");
                if matches!(err, QueueError::CheckpointMismatch { .. }) {
                    // Everything this peer contributed is suspect.
                    self.queue.rollback_to(self.attach_height);
                }
                self.channel.stop();
                return Err(SyncError::Queue(err));
            }

            self.tracker.record(headers.len() as u64);
            debug!(
                %peer,
                delivered = self.tracker.delivered(),
                tail = self.queue.tail_height().unwrap_or(0),
                "header_sync: batch accepted"
            );
            if self.tracker.below_floor(self.floor) {
                let rate = self.tracker.current_rate();
                warn!(%peer, rate, floor = self.floor, "header_sync: below rate floor");
                self.channel.stop();
                return Err(SyncError::ChannelSlow {
                    rate,
                    floor: self.floor,
                });
            }
        }
    }

    /// Issue a `get-headers` for the range after the current tail.
    fn request_headers(&self) -> Result<(), SyncError> {
        let request = GetHeaders {
            version: self.channel.negotiated_version(),
            locator: self.queue.locator(),
            stop_hash: self.queue.stop_hash().unwrap_or(Hash256::ZERO),
        };
        self.channel
            .send(Message::GetHeaders(request))
            .map_err(SyncError::ChannelGone)
    }

    /// Wait for the next `headers` reply, ignoring unrelated traffic.
    async fn await_headers(
        &mut self,
        messages: &mut broadcast::Receiver<Message>,
    ) -> Result<Vec<BlockHeader>, SyncError> {
        let deadline = tokio::time::sleep(self.config.response_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    // A dropped sender means the session itself is gone.
                    if changed.is_err() || *self.stop.borrow() {
                        self.channel.stop();
                        return Err(SyncError::Cancelled);
                    }
                }
                _ = &mut deadline => {
                    let rate = self.tracker.current_rate();
                    warn!(
                        peer = %self.channel.authority(),
                        idle_secs = self.tracker.last_sample_age().as_secs(),
                        "header_sync: response timeout"
                    );
                    self.channel.stop();
                    return Err(SyncError::ChannelSlow { rate, floor: self.floor });
                }
                received = messages.recv() => match received {
                    Ok(Message::Headers(headers)) => return Ok(headers),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "header_sync: subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SyncError::ChannelGone(NetError::ChannelClosed));
                    }
                },
            }
        }
    }
}
