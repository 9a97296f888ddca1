//! Bitcoin P2P wire messages and framing.
//!
//! Every message travels in a 24-byte frame envelope: network magic,
//! NUL-padded 12-byte command, payload length, and a checksum of the first
//! four bytes of the payload's double SHA-256. Payload encodings are
//! bit-exact with the reference protocol; nothing here is serde.
//!
//! Size caps are enforced before deserialization so a hostile peer cannot
//! make us allocate from a length field.

use bytes::{Buf, BufMut};
use kestrel_core::constants::{
    MAX_HEADERS_PER_MESSAGE, MAX_LOCATOR_HASHES, MAX_PAYLOAD_SIZE,
};
use kestrel_core::error::NetError;
use kestrel_core::types::{sha256d, BlockHeader, Hash256, HEADER_SIZE};

/// Width of the command field in the frame envelope.
pub const COMMAND_SIZE: usize = 12;

/// Total size of the frame envelope preceding the payload.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Longest user agent accepted in a `version` payload.
const MAX_USER_AGENT_LEN: usize = 256;

/// A network message exchanged with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opening handshake announcement.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// Keep-alive probe with a nonce to echo.
    Ping(u64),
    /// Keep-alive echo.
    Pong(u64),
    /// Request for headers following a locator.
    GetHeaders(GetHeaders),
    /// A batch of up to 2000 block headers.
    Headers(Vec<BlockHeader>),
    /// A command we do not handle; retained for logging only.
    Unknown(String),
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Sender's protocol version.
    pub version: u32,
    /// Sender's service bitmask.
    pub services: u64,
    /// Sender's Unix time.
    pub timestamp: i64,
    /// Services the sender believes the receiver has.
    pub receiver_services: u64,
    /// Random connection nonce (self-connection detection).
    pub nonce: u64,
    /// Sender's user agent string.
    pub user_agent: String,
    /// Sender's best block height.
    pub start_height: i32,
    /// Whether the sender wants transaction relay.
    pub relay: bool,
}

/// The `getheaders` request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeaders {
    /// Requester's protocol version.
    pub version: u32,
    /// Newest-first locator hashes.
    pub locator: Vec<Hash256>,
    /// Send headers up to and including this hash (zero = as many as fit).
    pub stop_hash: Hash256,
}

impl Message {
    /// The frame command string for this message.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Unknown(cmd) => cmd.as_str(),
        }
    }

    /// Encode the payload body (no frame envelope).
    pub fn encode_payload(&self) -> Result<Vec<u8>, NetError> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                buf.put_u32_le(v.version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                // addr_recv: services + unroutable IPv6-mapped zero address.
                buf.put_u64_le(v.receiver_services);
                buf.put_slice(&[0u8; 16]);
                buf.put_u16(0);
                // addr_from: our services, zero address.
                buf.put_u64_le(v.services);
                buf.put_slice(&[0u8; 16]);
                buf.put_u16(0);
                buf.put_u64_le(v.nonce);
                if v.user_agent.len() > MAX_USER_AGENT_LEN {
                    return Err(NetError::Malformed("user agent too long".into()));
                }
                put_varint(&mut buf, v.user_agent.len() as u64);
                buf.put_slice(v.user_agent.as_bytes());
                buf.put_i32_le(v.start_height);
                buf.put_u8(v.relay as u8);
            }
            Message::Verack => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::GetHeaders(gh) => {
                if gh.locator.len() > MAX_LOCATOR_HASHES {
                    return Err(NetError::Malformed(format!(
                        "locator has {} hashes, max {MAX_LOCATOR_HASHES}",
                        gh.locator.len()
                    )));
                }
                buf.put_u32_le(gh.version);
                put_varint(&mut buf, gh.locator.len() as u64);
                for hash in &gh.locator {
                    buf.put_slice(hash.as_bytes());
                }
                buf.put_slice(gh.stop_hash.as_bytes());
            }
            Message::Headers(headers) => {
                if headers.len() > MAX_HEADERS_PER_MESSAGE {
                    return Err(NetError::Malformed(format!(
                        "{} headers exceed the {MAX_HEADERS_PER_MESSAGE} per-message cap",
                        headers.len()
                    )));
                }
                put_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    buf.put_slice(&header.to_bytes());
                    // Transaction count, always zero in a headers message.
                    buf.put_u8(0);
                }
            }
            Message::Unknown(cmd) => {
                return Err(NetError::Malformed(format!("cannot encode '{cmd}'")));
            }
        }
        Ok(buf)
    }

    /// Decode a payload body for the given command.
    ///
    /// Unrecognized commands decode to [`Message::Unknown`]; the channel
    /// ignores them rather than dropping the peer.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, NetError> {
        let mut buf = payload;
        let msg = match command {
            "version" => Message::Version(decode_version(&mut buf)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(read_u64(&mut buf)?),
            "pong" => Message::Pong(read_u64(&mut buf)?),
            "getheaders" => {
                let version = read_u32(&mut buf)?;
                let count = read_varint(&mut buf)?;
                if count as usize > MAX_LOCATOR_HASHES {
                    return Err(NetError::Malformed(format!(
                        "locator count {count} exceeds {MAX_LOCATOR_HASHES}"
                    )));
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(read_hash(&mut buf)?);
                }
                let stop_hash = read_hash(&mut buf)?;
                Message::GetHeaders(GetHeaders {
                    version,
                    locator,
                    stop_hash,
                })
            }
            "headers" => {
                let count = read_varint(&mut buf)?;
                if count as usize > MAX_HEADERS_PER_MESSAGE {
                    return Err(NetError::Malformed(format!(
                        "headers count {count} exceeds {MAX_HEADERS_PER_MESSAGE}"
                    )));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if buf.remaining() < HEADER_SIZE {
                        return Err(truncated());
                    }
                    let mut raw = [0u8; HEADER_SIZE];
                    buf.copy_to_slice(&mut raw);
                    headers.push(BlockHeader::from_bytes(&raw));
                    let tx_count = read_varint(&mut buf)?;
                    if tx_count != 0 {
                        return Err(NetError::Malformed(
                            "nonzero tx count in headers message".into(),
                        ));
                    }
                }
                Message::Headers(headers)
            }
            other => Message::Unknown(other.to_string()),
        };
        Ok(msg)
    }
}

fn decode_version(buf: &mut &[u8]) -> Result<VersionMessage, NetError> {
    let version = read_u32(buf)?;
    let services = read_u64(buf)?;
    let timestamp = read_u64(buf)? as i64;
    let receiver_services = read_u64(buf)?;
    skip(buf, 18)?; // receiver address + port
    skip(buf, 26)?; // sender address block
    let nonce = read_u64(buf)?;
    let ua_len = read_varint(buf)? as usize;
    if ua_len > MAX_USER_AGENT_LEN {
        return Err(NetError::Malformed("user agent too long".into()));
    }
    if buf.remaining() < ua_len {
        return Err(truncated());
    }
    let user_agent = String::from_utf8_lossy(&buf[..ua_len]).into_owned();
    buf.advance(ua_len);
    let start_height = read_u32(buf)? as i32;
    // The relay flag is optional on the wire; absent means true.
    let relay = if buf.has_remaining() {
        buf.get_u8() != 0
    } else {
        true
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        receiver_services,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

// -----------------------------------------------------------------------------
// Frame envelope
// -----------------------------------------------------------------------------

/// A decoded frame header: command, payload length, payload checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// The command string (NUL padding stripped).
    pub command: String,
    /// Payload length in bytes.
    pub length: usize,
    /// First four bytes of the payload's double SHA-256.
    pub checksum: [u8; 4],
}

/// Encode a complete frame (envelope + payload) for a message.
pub fn encode_frame(magic: [u8; 4], msg: &Message) -> Result<Vec<u8>, NetError> {
    let payload = msg.encode_payload()?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(NetError::MessageTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let command = msg.command();
    if command.len() > COMMAND_SIZE {
        return Err(NetError::Malformed(format!("command '{command}' too long")));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_slice(&magic);
    let mut cmd_bytes = [0u8; COMMAND_SIZE];
    cmd_bytes[..command.len()].copy_from_slice(command.as_bytes());
    frame.put_slice(&cmd_bytes);
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&checksum_of(&payload));
    frame.put_slice(&payload);
    Ok(frame)
}

/// Decode and validate a frame envelope.
///
/// Rejects foreign magic and payload lengths beyond the cap; the payload
/// itself is read and checksum-verified by the caller.
pub fn decode_frame_header(raw: &[u8; FRAME_HEADER_SIZE], magic: [u8; 4]) -> Result<FrameHeader, NetError> {
    if raw[0..4] != magic {
        return Err(NetError::Malformed("wrong network magic".into()));
    }
    let command_field = &raw[4..16];
    let end = command_field
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(COMMAND_SIZE);
    if command_field[end..].iter().any(|b| *b != 0) {
        return Err(NetError::Malformed("command has bytes after NUL".into()));
    }
    let command = std::str::from_utf8(&command_field[..end])
        .map_err(|_| NetError::Malformed("non-ASCII command".into()))?
        .to_string();
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[16..20]);
    let length = u32::from_le_bytes(len_bytes) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(NetError::MessageTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&raw[20..24]);
    Ok(FrameHeader {
        command,
        length,
        checksum,
    })
}

/// The frame checksum of a payload.
pub fn checksum_of(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

// -----------------------------------------------------------------------------
// CompactSize varints
// -----------------------------------------------------------------------------

/// Append a CompactSize varint.
pub fn put_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Read a CompactSize varint.
pub fn read_varint(buf: &mut &[u8]) -> Result<u64, NetError> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    match buf.get_u8() {
        prefix @ 0..=0xfc => Ok(prefix as u64),
        0xfd => Ok(read_u16(buf)? as u64),
        0xfe => Ok(read_u32(buf)? as u64),
        _ => read_u64(buf),
    }
}

fn truncated() -> NetError {
    NetError::Malformed("truncated payload".into())
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, NetError> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16_le())
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, NetError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32_le())
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, NetError> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64_le())
}

fn read_hash(buf: &mut &[u8]) -> Result<Hash256, NetError> {
    if buf.remaining() < 32 {
        return Err(truncated());
    }
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash256(bytes))
}

fn skip(buf: &mut &[u8], n: usize) -> Result<(), NetError> {
    if buf.remaining() < n {
        return Err(truncated());
    }
    buf.advance(n);
    Ok(())
}
