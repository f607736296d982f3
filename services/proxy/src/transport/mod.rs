//! Transport adapters.
//!
//! The session core never touches sockets directly. It talks to a connection
//! through two halves:
//! - [`UnitSource`]: inbound application units, then `Ok(None)` on close or
//!   `Err` on failure
//! - [`UnitSink`]: outbound units and a graceful `close(reason)`
//!
//! A [`Transport`] opens backend-side connections; a [`StreamTransport`] can
//! additionally turn an accepted TCP stream into a client-side connection.
//!
//! ## Implementations
//!
//! ```text
//! RawTransport     TCP byte stream, units are read chunks (Bytes)
//! PacketTransport  length-prefixed packets with a login handshake (Packet)
//! MemoryTransport  in-process channels, for embedding and tests
//! ```

pub mod memory;
pub mod packet;
mod proxy_protocol;
pub mod raw;

use std::fmt::{self, Debug};
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::directory::Backend;
use crate::error::TransportError;

pub use memory::{MemoryBackend, MemoryEnd, MemoryTransport};
pub use packet::{Packet, PacketCodec, PacketTransport};
pub use proxy_protocol::ProxyProtocolV2;
pub use raw::{ProxyProtocol, RawTransport};

/// One opaque message exchanged over a connection.
///
/// The relay forwards units atomically: a unit is never merged with another
/// or split.
pub trait ApplicationUnit: Send + Sync + Debug + 'static {
    /// Size in bytes, used for buffer accounting.
    fn size(&self) -> usize;

    /// Text carried by the unit, if it is a chat-like message.
    ///
    /// Only units with text are candidates for in-band directives.
    fn chat_text(&self) -> Option<&str>;

    /// Build a user-visible notification unit.
    fn notice(text: &str) -> Self
    where
        Self: Sized;
}

/// Identity descriptor of a client connection.
///
/// Transports that need a handshake on the backend side (login packets,
/// PROXY headers) read what they need from here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientProfile {
    /// Remote address of the client, if it came in over a socket.
    pub peer_addr: Option<SocketAddr>,
    /// Local listener address the client connected to.
    pub local_addr: Option<SocketAddr>,
    /// Username announced by the client handshake.
    pub username: Option<String>,
    /// Protocol version announced by the client handshake.
    pub version: Option<String>,
}

impl ClientProfile {
    /// Profile for a client identified only by its socket addresses.
    pub fn from_addrs(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            local_addr: Some(local_addr),
            ..Default::default()
        }
    }

    /// Profile carrying handshake identity.
    pub fn with_identity(mut self, username: impl Into<String>, version: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.version = Some(version.into());
        self
    }
}

/// Inbound half of a connection.
#[async_trait]
pub trait UnitSource: Send + 'static {
    type Unit: ApplicationUnit;

    /// Receive the next unit.
    ///
    /// Returns `Ok(None)` once the peer closed the connection. Must be
    /// cancel-safe: the session polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<Self::Unit>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait UnitSink: Send + 'static {
    type Unit: ApplicationUnit;

    /// Send one unit, waiting until the transport accepted it.
    async fn send(&mut self, unit: Self::Unit) -> Result<(), TransportError>;

    /// Flush and close the connection, telling the peer why if the wire
    /// format allows it.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError>;
}

/// Both halves of an open connection.
pub struct Connection<S, K> {
    pub source: S,
    pub sink: K,
}

impl<S, K> Connection<S, K> {
    pub fn new(source: S, sink: K) -> Self {
        Self { source, sink }
    }
}

impl<S, K> fmt::Debug for Connection<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens backend-side connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Unit: ApplicationUnit;
    type Source: UnitSource<Unit = Self::Unit>;
    type Sink: UnitSink<Unit = Self::Unit>;

    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Connect to a backend on behalf of a client.
    async fn connect(
        &self,
        backend: &Backend,
        client: &ClientProfile,
    ) -> Result<Connection<Self::Source, Self::Sink>, TransportError>;
}

/// A transport that can also serve accepted TCP clients.
#[async_trait]
pub trait StreamTransport: Transport {
    /// Split an accepted stream into a client connection, running the
    /// client-side handshake if the wire format has one.
    async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(ClientProfile, Connection<Self::Source, Self::Sink>), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_builders() {
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let local: SocketAddr = "0.0.0.0:19132".parse().unwrap();
        let profile = ClientProfile::from_addrs(peer, local).with_identity("Steve", "1.21.0");

        assert_eq!(profile.peer_addr, Some(peer));
        assert_eq!(profile.local_addr, Some(local));
        assert_eq!(profile.username.as_deref(), Some("Steve"));
        assert_eq!(profile.version.as_deref(), Some("1.21.0"));
    }

    #[test]
    fn test_connection_debug_needs_no_bounds() {
        struct Opaque;
        let connection = Connection::new(Opaque, Opaque);
        assert_eq!(format!("{connection:?}"), "Connection { .. }");
    }
}
