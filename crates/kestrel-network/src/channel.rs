//! Channel abstraction over the peer transport.
//!
//! The sync session and peer protocol are written against these traits;
//! [`crate::tcp`] provides the production implementation and the `testing`
//! feature provides a scripted in-memory one. Inbound messages fan out on a
//! broadcast stream, so a protocol subscribes once and reads at its own pace.

use crate::wire::Message;
use async_trait::async_trait;
use kestrel_core::error::NetError;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Inbound broadcast buffer per channel. A lagging subscriber loses old
/// messages rather than stalling the reader.
pub const SUBSCRIBE_BUFFER: usize = 128;

/// A live, handshake-complete connection to one peer.
pub trait Channel: Send + Sync {
    /// The remote endpoint, for logging.
    fn authority(&self) -> String;

    /// Protocol version agreed during the handshake
    /// (minimum of ours and the peer's).
    fn negotiated_version(&self) -> u32;

    /// Queue a message for delivery to the peer.
    fn send(&self, msg: Message) -> Result<(), NetError>;

    /// Subscribe to inbound messages from this peer.
    fn subscribe(&self) -> broadcast::Receiver<Message>;

    /// Tear the connection down. Idempotent.
    fn stop(&self);

    /// True once the channel has stopped or failed.
    fn is_stopped(&self) -> bool;
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial a peer and complete the version handshake.
    async fn connect(&self) -> Result<Arc<dyn Channel>, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullChannel {
        stopped: AtomicBool,
        inbound: broadcast::Sender<Message>,
    }

    impl Channel for NullChannel {
        fn authority(&self) -> String {
            "null:0".into()
        }

        fn negotiated_version(&self) -> u32 {
            70016
        }

        fn send(&self, _msg: Message) -> Result<(), NetError> {
            if self.is_stopped() {
                return Err(NetError::ChannelClosed);
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Message> {
            self.inbound.subscribe()
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn channel_is_object_safe() {
        let (inbound, _) = broadcast::channel(SUBSCRIBE_BUFFER);
        let chan = NullChannel {
            stopped: AtomicBool::new(false),
            inbound,
        };
        let dyn_chan: &dyn Channel = &chan;
        assert_eq!(dyn_chan.negotiated_version(), 70016);
        assert!(dyn_chan.send(Message::Verack).is_ok());
        dyn_chan.stop();
        assert!(dyn_chan.is_stopped());
        assert!(dyn_chan.send(Message::Verack).is_err());
    }
}
