//! TCP transport speaking the Bitcoin message framing.
//!
//! [`TcpConnector`] dials configured peers round-robin and completes the
//! version handshake before handing the channel out; only peers that
//! negotiate at least the headers-message protocol level and advertise the
//! required services pass. A [`TcpChannel`] runs three background tasks in
//! a command-channel arrangement: a writer draining an mpsc queue, a reader
//! broadcasting inbound messages (answering pings inline), and a periodic
//! keep-alive pinger. `stop()` flips a watch flag that all three observe.

use crate::channel::{Channel, Connector, SUBSCRIBE_BUFFER};
use crate::config::NetworkConfig;
use crate::wire::{self, Message, VersionMessage, FRAME_HEADER_SIZE};
use async_trait::async_trait;
use kestrel_core::constants::SERVICES_NONE;
use kestrel_core::error::NetError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Dials configured peer addresses in round-robin order.
pub struct TcpConnector {
    config: NetworkConfig,
    peers: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl TcpConnector {
    /// A connector over a fixed peer list.
    pub fn new(config: NetworkConfig, peers: Vec<SocketAddr>) -> Self {
        Self {
            config,
            peers,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Channel>, NetError> {
        if self.peers.is_empty() {
            return Err(NetError::ConnectFailed("no peers configured".into()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        let addr = self.peers[index];
        debug!(%addr, "tcp: dialing");
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|err| NetError::ConnectFailed(format!("{addr}: {err}")))?;
        let channel = TcpChannel::establish(stream, addr, self.config.clone()).await?;
        Ok(channel)
    }
}

/// A handshake-complete TCP connection to one peer.
pub struct TcpChannel {
    authority: SocketAddr,
    negotiated_version: u32,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: broadcast::Sender<Message>,
    stopped: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl TcpChannel {
    /// Perform the version handshake on a fresh stream and spawn the
    /// channel's background tasks.
    ///
    /// We advertise no services and decline transaction relay; the peer
    /// must meet `config.min_peer_version` and `config.required_services`.
    pub async fn establish(
        mut stream: TcpStream,
        authority: SocketAddr,
        config: NetworkConfig,
    ) -> Result<Arc<Self>, NetError> {
        let magic = config.network.magic();
        let local_version = Message::Version(VersionMessage {
            version: config.protocol_version,
            services: SERVICES_NONE,
            timestamp: unix_time(),
            receiver_services: config.required_services,
            nonce: clock_nonce(),
            user_agent: config.user_agent.clone(),
            start_height: 0,
            relay: false,
        });
        write_message(&mut stream, magic, &local_version).await?;

        let peer = timeout(
            config.handshake_timeout,
            negotiate(&mut stream, magic, &config),
        )
        .await
        .map_err(|_| NetError::HandshakeFailed("timed out".into()))??;

        let negotiated_version = config.protocol_version.min(peer.version);
        info!(
            %authority,
            peer_version = peer.version,
            negotiated_version,
            user_agent = %peer.user_agent,
            start_height = peer.start_height,
            "tcp: handshake complete"
        );

        let (inbound, _) = broadcast::channel(SUBSCRIBE_BUFFER);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let stopped = Arc::new(AtomicBool::new(false));

        let channel = Arc::new(Self {
            authority,
            negotiated_version,
            outbound: outbound.clone(),
            inbound: inbound.clone(),
            stopped: Arc::clone(&stopped),
            shutdown: shutdown.clone(),
        });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(writer_task(
            write_half,
            magic,
            outbound_rx,
            shutdown.clone(),
            Arc::clone(&stopped),
        ));
        tokio::spawn(reader_task(
            read_half,
            magic,
            inbound,
            outbound.clone(),
            shutdown.clone(),
            Arc::clone(&stopped),
            authority,
        ));
        tokio::spawn(ping_task(outbound, config.ping_interval, shutdown.subscribe()));

        Ok(channel)
    }
}

impl Channel for TcpChannel {
    fn authority(&self) -> String {
        self.authority.to_string()
    }

    fn negotiated_version(&self) -> u32 {
        self.negotiated_version
    }

    fn send(&self, msg: Message) -> Result<(), NetError> {
        if self.is_stopped() {
            return Err(NetError::ChannelClosed);
        }
        self.outbound
            .send(msg)
            .map_err(|_| NetError::ChannelClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbound.subscribe()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Read handshake messages until the peer's version is known and our own
/// was acknowledged.
async fn negotiate(
    stream: &mut TcpStream,
    magic: [u8; 4],
    config: &NetworkConfig,
) -> Result<VersionMessage, NetError> {
    let mut peer_version: Option<VersionMessage> = None;
    let mut acked = false;
    while peer_version.is_none() || !acked {
        match read_message(stream, magic).await? {
            Message::Version(version) => {
                if version.version < config.min_peer_version {
                    return Err(NetError::VersionTooLow {
                        peer: version.version,
                        min: config.min_peer_version,
                    });
                }
                if version.services & config.required_services != config.required_services {
                    return Err(NetError::MissingServices {
                        have: version.services,
                        need: config.required_services,
                    });
                }
                write_message(stream, magic, &Message::Verack).await?;
                peer_version = Some(version);
            }
            Message::Verack => acked = true,
            Message::Ping(nonce) => {
                write_message(stream, magic, &Message::Pong(nonce)).await?;
            }
            other => {
                debug!(command = other.command(), "tcp: ignoring pre-handshake message");
            }
        }
    }
    peer_version.ok_or_else(|| NetError::HandshakeFailed("missing version".into()))
}

async fn writer_task(
    mut write_half: impl AsyncWrite + Unpin,
    magic: [u8; 4],
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            queued = outbound.recv() => {
                let Some(msg) = queued else { return };
                if let Err(err) = write_message(&mut write_half, magic, &msg).await {
                    warn!(%err, "tcp: write failed, closing channel");
                    stopped.store(true, Ordering::SeqCst);
                    shutdown.send_replace(true);
                    return;
                }
            }
        }
    }
}

async fn reader_task(
    mut read_half: impl AsyncRead + Unpin,
    magic: [u8; 4],
    inbound: broadcast::Sender<Message>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
    authority: SocketAddr,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            received = read_message(&mut read_half, magic) => {
                let msg = match received {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(%authority, %err, "tcp: read failed, closing channel");
                        stopped.store(true, Ordering::SeqCst);
                        shutdown.send_replace(true);
                        return;
                    }
                };
                match msg {
                    Message::Ping(nonce) => {
                        let _ = outbound.send(Message::Pong(nonce));
                    }
                    Message::Pong(_) => {}
                    Message::Unknown(command) => {
                        debug!(%authority, command, "tcp: ignoring unhandled command");
                    }
                    other => {
                        // No subscribers is fine; the protocol may not have
                        // attached yet.
                        let _ = inbound.send(other);
                    }
                }
            }
        }
    }
}

async fn ping_task(
    outbound: mpsc::UnboundedSender<Message>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if outbound.send(Message::Ping(clock_nonce())).is_err() {
                    return;
                }
            }
        }
    }
}

/// Read one complete, checksum-verified message.
async fn read_message(
    stream: &mut (impl AsyncRead + Unpin),
    magic: [u8; 4],
) -> Result<Message, NetError> {
    let mut envelope = [0u8; FRAME_HEADER_SIZE];
    stream
        .read_exact(&mut envelope)
        .await
        .map_err(map_io_error)?;
    let header = wire::decode_frame_header(&envelope, magic)?;
    let mut payload = vec![0u8; header.length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(map_io_error)?;
    if wire::checksum_of(&payload) != header.checksum {
        return Err(NetError::Malformed(format!(
            "bad checksum on '{}'",
            header.command
        )));
    }
    Message::decode_payload(&header.command, &payload)
}

/// Frame and write one message.
async fn write_message(
    stream: &mut (impl AsyncWrite + Unpin),
    magic: [u8; 4],
    msg: &Message,
) -> Result<(), NetError> {
    let frame = wire::encode_frame(magic, msg)?;
    stream.write_all(&frame).await.map_err(map_io_error)?;
    Ok(())
}

fn map_io_error(err: std::io::Error) -> NetError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        NetError::ChannelClosed
    } else {
        NetError::Io(err.to_string())
    }
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Connection nonce for self-connection detection. Clock-derived entropy
/// is plenty for this purpose.
fn clock_nonce() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x6b65_7374)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::constants::{Network, NODE_NETWORK, PROTOCOL_VERSION};
    use tokio::net::TcpListener;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            network: Network::Regtest,
            ..NetworkConfig::default()
        }
    }

    /// A minimal scripted peer: accepts one connection, completes the
    /// handshake with the given version/services, then runs `script` on
    /// the established stream.
    async fn spawn_peer<F, Fut>(
        version: u32,
        services: u64,
        script: F,
    ) -> SocketAddr
    where
        F: FnOnce(TcpStream, [u8; 4]) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let magic = Network::Regtest.magic();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Expect the dialer's version first.
            let first = read_message(&mut stream, magic).await.unwrap();
            assert!(matches!(first, Message::Version(_)));
            let reply = Message::Version(VersionMessage {
                version,
                services,
                timestamp: 0,
                receiver_services: 0,
                nonce: 1,
                user_agent: "/peer:0.0.1/".into(),
                start_height: 500,
                relay: true,
            });
            write_message(&mut stream, magic, &reply).await.unwrap();
            write_message(&mut stream, magic, &Message::Verack)
                .await
                .unwrap();
            // Consume the dialer's verack.
            loop {
                match read_message(&mut stream, magic).await.unwrap() {
                    Message::Verack => break,
                    _ => continue,
                }
            }
            script(stream, magic).await;
        });
        addr
    }

    #[tokio::test]
    async fn handshake_negotiates_minimum_version() {
        let addr = spawn_peer(70001, NODE_NETWORK, |_stream, _magic| async {}).await;
        let connector = TcpConnector::new(test_config(), vec![addr]);
        let channel = connector.connect().await.unwrap();
        assert_eq!(channel.negotiated_version(), 70001.min(PROTOCOL_VERSION));
        assert_eq!(channel.authority(), addr.to_string());
        channel.stop();
    }

    #[tokio::test]
    async fn low_version_peer_rejected() {
        let addr = spawn_peer(209, NODE_NETWORK, |_stream, _magic| async {}).await;
        let connector = TcpConnector::new(test_config(), vec![addr]);
        assert!(matches!(
            connector.connect().await,
            Err(NetError::VersionTooLow { peer: 209, .. })
        ));
    }

    #[tokio::test]
    async fn serviceless_peer_rejected() {
        let addr = spawn_peer(PROTOCOL_VERSION, 0, |_stream, _magic| async {}).await;
        let connector = TcpConnector::new(test_config(), vec![addr]);
        assert!(matches!(
            connector.connect().await,
            Err(NetError::MissingServices { have: 0, .. })
        ));
    }

    #[tokio::test]
    async fn inbound_headers_reach_subscribers() {
        let addr = spawn_peer(PROTOCOL_VERSION, NODE_NETWORK, |mut stream, magic| async move {
            // Give the dialer a moment to subscribe before pushing.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            write_message(&mut stream, magic, &Message::Headers(Vec::new()))
                .await
                .unwrap();
            // Hold the stream open so the reader does not see EOF early.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        })
        .await;
        let connector = TcpConnector::new(test_config(), vec![addr]);
        let channel = connector.connect().await.unwrap();
        let mut messages = channel.subscribe();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Headers(Vec::new()));
        channel.stop();
    }

    #[tokio::test]
    async fn peer_ping_is_answered() {
        let addr = spawn_peer(PROTOCOL_VERSION, NODE_NETWORK, |mut stream, magic| async move {
            write_message(&mut stream, magic, &Message::Ping(42)).await.unwrap();
            loop {
                match read_message(&mut stream, magic).await {
                    Ok(Message::Pong(nonce)) => {
                        assert_eq!(nonce, 42);
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => panic!("peer read failed: {err}"),
                }
            }
        })
        .await;
        let connector = TcpConnector::new(test_config(), vec![addr]);
        let channel = connector.connect().await.unwrap();
        // Give the reader/writer tasks time to relay the pong.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        channel.stop();
    }

    #[tokio::test]
    async fn dialing_unreachable_peer_fails() {
        let config = NetworkConfig {
            dial_timeout: std::time::Duration::from_millis(200),
            ..test_config()
        };
        // An address from TEST-NET-1 that nothing answers on.
        let connector =
            TcpConnector::new(config, vec!["192.0.2.1:8333".parse().unwrap()]);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn empty_peer_list_fails_immediately() {
        let connector = TcpConnector::new(test_config(), vec![]);
        assert!(matches!(
            connector.connect().await,
            Err(NetError::ConnectFailed(_))
        ));
    }
}
