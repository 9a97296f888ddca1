//! Scripted in-memory transport.
//!
//! Implements [`Connector`]/[`Channel`] without sockets so protocol and
//! session behavior can be driven deterministically: each channel answers
//! `get-headers` through a caller-supplied responder, and a connector
//! hands out a scripted sequence of channels and dial failures.

use crate::channel::{Channel, Connector, SUBSCRIBE_BUFFER};
use crate::wire::{GetHeaders, Message};
use async_trait::async_trait;
use kestrel_core::constants::PROTOCOL_VERSION;
use kestrel_core::error::NetError;
use kestrel_core::types::BlockHeader;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Answers one `get-headers` request. `None` means never reply.
pub type HeadersResponder =
    Box<dyn FnMut(GetHeaders) -> Option<Vec<BlockHeader>> + Send + 'static>;

/// An in-memory peer channel driven by a responder script.
pub struct MemoryChannel {
    authority: String,
    version: u32,
    inbound: broadcast::Sender<Message>,
    responder: Mutex<HeadersResponder>,
    stopped: AtomicBool,
    sent: Mutex<Vec<Message>>,
}

impl MemoryChannel {
    /// A channel that answers every `get-headers` through `responder`.
    pub fn new(authority: &str, responder: HeadersResponder) -> Arc<Self> {
        Self::with_protocol_version(authority, responder, PROTOCOL_VERSION)
    }

    /// Like [`MemoryChannel::new`] but with a specific negotiated version
    /// (for version-gating tests).
    pub fn with_protocol_version(
        authority: &str,
        responder: HeadersResponder,
        version: u32,
    ) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(SUBSCRIBE_BUFFER);
        Arc::new(Self {
            authority: authority.to_string(),
            version,
            inbound,
            responder: Mutex::new(responder),
            stopped: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Everything the local side has sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

impl Channel for MemoryChannel {
    fn authority(&self) -> String {
        self.authority.clone()
    }

    fn negotiated_version(&self) -> u32 {
        self.version
    }

    fn send(&self, msg: Message) -> Result<(), NetError> {
        if self.is_stopped() {
            return Err(NetError::ChannelClosed);
        }
        self.sent.lock().push(msg.clone());
        if let Message::GetHeaders(request) = msg {
            let reply = (self.responder.lock())(request);
            if let Some(headers) = reply {
                let inbound = self.inbound.clone();
                tokio::spawn(async move {
                    let _ = inbound.send(Message::Headers(headers));
                });
            }
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

/// One scripted dial outcome.
pub enum DialScript {
    /// The dial succeeds with this channel.
    Ok(Arc<MemoryChannel>),
    /// The dial fails.
    Fail(NetError),
}

/// Hands out scripted dial outcomes in order; exhausted scripts fail.
pub struct MemoryConnector {
    script: Mutex<VecDeque<DialScript>>,
}

impl MemoryConnector {
    /// Build a connector from a dial script.
    pub fn new(script: Vec<DialScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }

    /// Dials left in the script.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Channel>, NetError> {
        let next = self.script.lock().pop_front();
        match next {
            Some(DialScript::Ok(channel)) => Ok(channel),
            Some(DialScript::Fail(err)) => Err(err),
            None => Err(NetError::ConnectFailed("dial script exhausted".into())),
        }
    }
}
