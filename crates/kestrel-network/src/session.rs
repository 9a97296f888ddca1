//! Header-sync session controller.
//!
//! The session owns one logical goal: fill the shared header queue once.
//! At start it derives the sync range from the local chain (seed below,
//! stop checkpoint above), then repeatedly acquires a channel from the
//! connector and attaches a [`HeaderSyncProtocol`] to it. A peer that
//! completes the queue ends the session with success; any peer failure
//! lowers the throughput floor multiplicatively and a replacement peer is
//! tried. The completion handler fires exactly once, guarded by a
//! take-once latch, no matter how many peer attempts run in parallel.

use crate::channel::Connector;
use crate::config::SyncConfig;
use crate::header_sync::HeaderSyncProtocol;
use crate::queue::HeaderQueue;
use kestrel_core::chain::LocalChain;
use kestrel_core::checkpoint::{Checkpoint, CheckpointSet};
use kestrel_core::error::{ChainError, SessionError, SyncError};
use kestrel_core::pow::Target;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause after a failed dial. Connect failures alone carry no back-off;
/// this only keeps a dead connector from spinning the loop hot.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Invoked exactly once with the session's terminal outcome.
pub type SessionHandler = Box<dyn FnOnce(Result<(), SessionError>) + Send + 'static>;

/// Controller for one header synchronization.
pub struct HeaderSyncSession {
    chain: Arc<dyn LocalChain>,
    connector: Arc<dyn Connector>,
    checkpoints: CheckpointSet,
    config: SyncConfig,
    queue: Arc<HeaderQueue>,
    /// Owned by the session; peer protocols receive a snapshot at attach.
    floor: Arc<Mutex<f64>>,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    handler: Arc<Mutex<Option<SessionHandler>>>,
}

impl HeaderSyncSession {
    /// Build a session over the given chain, connector, and consensus
    /// parameters. Nothing runs until [`HeaderSyncSession::start`].
    pub fn new(
        chain: Arc<dyn LocalChain>,
        connector: Arc<dyn Connector>,
        checkpoints: CheckpointSet,
        pow_limit: Target,
        config: SyncConfig,
    ) -> Self {
        let queue = Arc::new(HeaderQueue::new(checkpoints.clone(), pow_limit));
        let floor = Arc::new(Mutex::new(config.initial_floor));
        let (stop, _) = watch::channel(false);
        Self {
            chain,
            connector,
            checkpoints,
            config,
            queue,
            floor,
            started: AtomicBool::new(false),
            stop,
            handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin synchronizing. `handler` fires exactly once with the terminal
    /// outcome; if the derived range is already empty it fires with success
    /// before this call returns and no channel is ever opened.
    ///
    /// Range-derivation failures surface here and the handler never fires.
    pub fn start<H>(&self, handler: H) -> Result<(), SessionError>
    where
        H: FnOnce(Result<(), SessionError>) + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        *self.handler.lock() = Some(Box::new(handler));

        let (seed, stop) = self.derive_range()?;
        self.queue.initialize(seed, stop)?;
        info!(
            seed_height = seed.height,
            stop_height = stop.height,
            "session: sync range derived"
        );

        if self.queue.is_full() {
            info!("session: nothing to synchronize");
            Self::complete(&self.handler, Ok(()));
            return Ok(());
        }

        for worker in 0..self.config.parallel_outbound.max(1) {
            let connector = Arc::clone(&self.connector);
            let queue = Arc::clone(&self.queue);
            let floor = Arc::clone(&self.floor);
            let handler = Arc::clone(&self.handler);
            let config = self.config.clone();
            let stop_tx = self.stop.clone();
            tokio::spawn(async move {
                debug!(worker, "session: peer loop started");
                Self::peer_loop(connector, queue, floor, handler, config, stop_tx).await;
            });
        }
        Ok(())
    }

    /// Request termination. Idempotent and non-blocking: in-flight peer
    /// protocols observe the flag at their next suspension point, and the
    /// handler fires once with [`SessionError::Cancelled`] unless success
    /// was already reported.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// The shared queue, for the block-body download stage once full.
    pub fn queue(&self) -> Arc<HeaderQueue> {
        Arc::clone(&self.queue)
    }

    /// The current per-peer throughput floor.
    pub fn current_floor(&self) -> f64 {
        *self.floor.lock()
    }

    /// Determine seed and stop per the local chain and checkpoint set.
    ///
    /// The stop is the highest configured checkpoint above the local view,
    /// or the predecessor link of the locally-known block just past the
    /// gap, so locally-persisted blocks are never re-downloaded.
    fn derive_range(
        &self,
    ) -> Result<(kestrel_core::types::HeaderSummary, Checkpoint), SessionError> {
        let tip = self.chain.last_height()?;
        let (first, last) = match self.chain.gap_range()? {
            Some((gap_first, gap_last)) => (gap_first.saturating_sub(1), gap_last + 1),
            None => (tip, tip),
        };

        let seed_header = self
            .chain
            .header_at(first)?
            .ok_or(ChainError::NotFound(first))?;
        let seed = seed_header.summarize(first);

        let cp_top = self.checkpoints.highest().copied();
        let stop = match cp_top {
            Some(cp) if cp.height > last => cp,
            _ if first == last => Checkpoint::new(seed.height, seed.hash),
            _ => {
                let stop_header = self
                    .chain
                    .header_at(last)?
                    .ok_or(ChainError::NotFound(last))?;
                Checkpoint::new(last - 1, stop_header.prev_hash)
            }
        };
        Ok((seed, stop))
    }

    /// One worker's acquire-attach-retry loop.
    async fn peer_loop(
        connector: Arc<dyn Connector>,
        queue: Arc<HeaderQueue>,
        floor: Arc<Mutex<f64>>,
        handler: Arc<Mutex<Option<SessionHandler>>>,
        config: SyncConfig,
        stop_tx: watch::Sender<bool>,
    ) {
        let mut stop_rx = stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                Self::complete(&handler, Err(SessionError::Cancelled));
                return;
            }
            if queue.is_full() {
                // A concurrent attempt already won; exit cleanly.
                return;
            }

            let channel = tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        Self::complete(&handler, Err(SessionError::Cancelled));
                        return;
                    }
                    continue;
                }
                dialed = connector.connect() => match dialed {
                    Ok(channel) => channel,
                    Err(err) => {
                        debug!(%err, "session: connect failed, retrying");
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            let snapshot = *floor.lock();
            let peer = channel.authority();
            info!(%peer, floor = snapshot, "session: attaching header-sync protocol");
            let protocol = HeaderSyncProtocol::new(
                Arc::clone(&channel),
                Arc::clone(&queue),
                snapshot,
                config.clone(),
                stop_tx.subscribe(),
            );
            let outcome = protocol.run().await;
            channel.stop();

            match outcome {
                Ok(()) => {
                    info!(%peer, "session: header queue filled");
                    Self::complete(&handler, Ok(()));
                    // Release any sibling attempts still dialing.
                    stop_tx.send_replace(true);
                    return;
                }
                Err(SyncError::Cancelled) => {
                    Self::complete(&handler, Err(SessionError::Cancelled));
                    return;
                }
                Err(SyncError::ChannelGone(err)) => {
                    // Disconnection alone does not indict the peer's rate.
                    info!(%peer, %err, "session: channel gone, retrying");
                }
                Err(err) => {
                    if queue.is_full() {
                        // The race is already decided; a losing peer must
                        // not depress the floor.
                        debug!(%peer, %err, "session: failure after completion");
                        continue;
                    }
                    let mut floor = floor.lock();
                    let lowered = (*floor * config.backoff_factor).max(config.min_floor);
                    warn!(
                        %peer,
                        %err,
                        floor = lowered,
                        "session: peer failed, lowering rate floor"
                    );
                    *floor = lowered;
                }
            }
        }
    }

    /// Fire the completion handler if it has not fired yet.
    fn complete(handler: &Mutex<Option<SessionHandler>>, outcome: Result<(), SessionError>) {
        if let Some(handler) = handler.lock().take() {
            handler(outcome);
        }
    }
}
