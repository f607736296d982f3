//! Packet transport.
//!
//! Units are decoded packets, each a named message with an opaque body.
//! Frame layout on the wire:
//!
//! ```text
//! +----------------+-----------+-------------+---------+
//! | len: u32 (BE)  | n: u8     | name: n     | body    |
//! +----------------+-----------+-------------+---------+
//!                  |<------------- len bytes --------->|
//! ```
//!
//! The first packet a client sends must be `login`, whose body is
//! `username\nversion`. The proxy replays that login to every backend it
//! connects the client to, which is what lets a transfer happen without the
//! client reconnecting.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::debug;

use super::{ApplicationUnit, ClientProfile, Connection, StreamTransport, Transport, UnitSink, UnitSource};
use crate::directory::Backend;
use crate::error::TransportError;

/// Default ceiling for a single frame.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

/// Default time a client gets to send its login packet.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Chat message, body is UTF-8 text.
pub const TEXT: &str = "text";
/// Client identity, body is `username\nversion`.
pub const LOGIN: &str = "login";
/// Sent before closing, body is the UTF-8 reason.
pub const DISCONNECT: &str = "disconnect";

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub name: String,
    pub body: Bytes,
}

impl Packet {
    pub fn new(name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// A chat message packet.
    pub fn text(message: impl Into<String>) -> Self {
        Self::new(TEXT, message.into())
    }

    pub fn login(username: &str, version: &str) -> Self {
        Self::new(LOGIN, format!("{username}\n{version}"))
    }

    pub fn disconnect(reason: &str) -> Self {
        Self::new(DISCONNECT, reason.to_string())
    }

    /// `(username, version)` if this is a well-formed login packet.
    pub fn as_login(&self) -> Option<(String, String)> {
        if self.name != LOGIN {
            return None;
        }
        let body = std::str::from_utf8(&self.body).ok()?;
        let (username, version) = body.split_once('\n')?;
        if username.is_empty() {
            return None;
        }
        Some((username.to_string(), version.to_string()))
    }

    fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl ApplicationUnit for Packet {
    fn size(&self) -> usize {
        self.name.len() + self.body.len()
    }

    fn chat_text(&self) -> Option<&str> {
        if self.name == TEXT {
            self.body_text()
        } else {
            None
        }
    }

    fn notice(text: &str) -> Self {
        Packet::text(text)
    }
}

/// Length-prefixed packet codec.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(TransportError::Protocol("empty frame".into()));
        }
        if len > self.max_packet_size {
            return Err(TransportError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {} bytes",
                self.max_packet_size
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(len);

        let name_len = frame.get_u8() as usize;
        if name_len == 0 || name_len > frame.len() {
            return Err(TransportError::Protocol(format!(
                "invalid packet name length {name_len}"
            )));
        }
        let name = std::str::from_utf8(&frame[..name_len])
            .map_err(|_| TransportError::Protocol("packet name is not UTF-8".into()))?
            .to_string();
        frame.advance(name_len);

        Ok(Some(Packet {
            name,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = TransportError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), TransportError> {
        let name_len = packet.name.len();
        if name_len == 0 || name_len > u8::MAX as usize {
            return Err(TransportError::Protocol(format!(
                "invalid packet name length {name_len}"
            )));
        }

        let len = 1 + name_len + packet.body.len();
        if len > self.max_packet_size {
            return Err(TransportError::Protocol(format!(
                "packet of {len} bytes exceeds limit of {} bytes",
                self.max_packet_size
            )));
        }

        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(name_len as u8);
        dst.put_slice(packet.name.as_bytes());
        dst.put_slice(&packet.body);
        Ok(())
    }
}

/// Packet transport over TCP.
#[derive(Debug, Clone)]
pub struct PacketTransport {
    max_packet_size: usize,
    handshake_timeout: Duration,
}

impl PacketTransport {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    fn split(&self, stream: TcpStream) -> Connection<PacketSource, PacketSink> {
        let (read, write) = stream.into_split();
        let codec = PacketCodec::new(self.max_packet_size);
        Connection::new(
            PacketSource {
                inner: FramedRead::new(read, codec.clone()),
            },
            PacketSink {
                inner: FramedWrite::new(write, codec),
            },
        )
    }
}

impl Default for PacketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for PacketTransport {
    type Unit = Packet;
    type Source = PacketSource;
    type Sink = PacketSink;

    fn kind(&self) -> &'static str {
        "packet"
    }

    /// Connect and log in as the client.
    async fn connect(
        &self,
        backend: &Backend,
        client: &ClientProfile,
    ) -> Result<Connection<PacketSource, PacketSink>, TransportError> {
        let username = client
            .username
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("client profile has no username".into()))?;
        let version = client.version.as_deref().unwrap_or_default();

        let stream = TcpStream::connect(backend.address()).await?;
        stream.set_nodelay(true)?;

        let mut conn = self.split(stream);
        conn.sink.send(Packet::login(username, version)).await?;
        debug!(backend = %backend.name, username, "Login forwarded to backend");

        Ok(conn)
    }
}

#[async_trait]
impl StreamTransport for PacketTransport {
    /// Wait for the client's login packet and build its profile from it.
    async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(ClientProfile, Connection<PacketSource, PacketSink>), TransportError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        let mut conn = self.split(stream);
        let first = timeout(self.handshake_timeout, conn.source.recv())
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))??
            .ok_or(TransportError::Closed)?;

        let (username, version) = first.as_login().ok_or_else(|| {
            TransportError::Protocol(format!("expected login packet, got '{}'", first.name))
        })?;

        debug!(peer_addr = %peer_addr, username = %username, version = %version, "Client logged in");

        let profile =
            ClientProfile::from_addrs(peer_addr, local_addr).with_identity(username, version);
        Ok((profile, conn))
    }
}

/// Read half of a packet connection.
pub struct PacketSource {
    inner: FramedRead<OwnedReadHalf, PacketCodec>,
}

#[async_trait]
impl UnitSource for PacketSource {
    type Unit = Packet;

    async fn recv(&mut self) -> Result<Option<Packet>, TransportError> {
        self.inner.next().await.transpose()
    }
}

/// Write half of a packet connection.
pub struct PacketSink {
    inner: FramedWrite<OwnedWriteHalf, PacketCodec>,
}

#[async_trait]
impl UnitSink for PacketSink {
    type Unit = Packet;

    async fn send(&mut self, unit: Packet) -> Result<(), TransportError> {
        self.inner.send(unit).await
    }

    /// Send a `disconnect` packet with the reason, then shut the socket down.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        let farewell = self.inner.send(Packet::disconnect(reason)).await;
        let shutdown = SinkExt::<Packet>::close(&mut self.inner).await;
        farewell.and(shutdown)
    }
}
