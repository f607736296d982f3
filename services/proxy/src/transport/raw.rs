//! Raw TCP byte-stream transport.
//!
//! Units are whatever a single socket read returned. Boundaries are not
//! meaningful to the peer, but they are preserved end to end by the relay,
//! so each chunk is written out with one `write_all`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, trace};

use super::proxy_protocol::ProxyProtocolV2;
use super::{ApplicationUnit, ClientProfile, Connection, StreamTransport, Transport, UnitSink, UnitSource};
use crate::directory::Backend;
use crate::error::TransportError;

/// PROXY protocol configuration for backend connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    /// No header is sent.
    #[default]
    Off,
    /// A PROXY v2 header carrying the client address precedes all data.
    V2,
}

impl ApplicationUnit for Bytes {
    fn size(&self) -> usize {
        self.len()
    }

    /// A chunk is treated as a line of text when it is valid UTF-8.
    fn chat_text(&self) -> Option<&str> {
        std::str::from_utf8(self)
            .ok()
            .map(|s| s.trim_end_matches(['\r', '\n']))
    }

    fn notice(text: &str) -> Self {
        Bytes::from(format!("{text}\n"))
    }
}

/// Byte-stream transport over TCP.
#[derive(Debug, Clone, Default)]
pub struct RawTransport {
    proxy_protocol: ProxyProtocol,
}

impl RawTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a PROXY header on every backend connection.
    pub fn with_proxy_protocol(mut self, proxy_protocol: ProxyProtocol) -> Self {
        self.proxy_protocol = proxy_protocol;
        self
    }

    fn split(stream: TcpStream) -> Connection<RawSource, RawSink> {
        let (read, write) = stream.into_split();
        Connection::new(
            RawSource {
                inner: FramedRead::new(read, BytesCodec::new()),
            },
            RawSink { inner: write },
        )
    }
}

#[async_trait]
impl Transport for RawTransport {
    type Unit = Bytes;
    type Source = RawSource;
    type Sink = RawSink;

    fn kind(&self) -> &'static str {
        "raw"
    }

    async fn connect(
        &self,
        backend: &Backend,
        client: &ClientProfile,
    ) -> Result<Connection<RawSource, RawSink>, TransportError> {
        let mut stream = TcpStream::connect(backend.address()).await?;
        stream.set_nodelay(true)?;

        if self.proxy_protocol == ProxyProtocol::V2 {
            if let (Some(src), Some(dst)) = (client.peer_addr, client.local_addr) {
                stream
                    .write_all(&ProxyProtocolV2::new(src, dst).encode())
                    .await?;
                debug!(backend = %backend.name, "PROXY v2 header sent");
            }
        }

        Ok(Self::split(stream))
    }
}

#[async_trait]
impl StreamTransport for RawTransport {
    async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(ClientProfile, Connection<RawSource, RawSink>), TransportError> {
        let profile = ClientProfile::from_addrs(stream.peer_addr()?, stream.local_addr()?);
        stream.set_nodelay(true)?;
        Ok((profile, Self::split(stream)))
    }
}

/// Read half of a raw connection.
pub struct RawSource {
    inner: FramedRead<OwnedReadHalf, BytesCodec>,
}

#[async_trait]
impl UnitSource for RawSource {
    type Unit = Bytes;

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.inner.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Write half of a raw connection.
pub struct RawSink {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl UnitSink for RawSink {
    type Unit = Bytes;

    async fn send(&mut self, unit: Bytes) -> Result<(), TransportError> {
        self.inner.write_all(&unit).await?;
        Ok(())
    }

    /// The byte stream has no place for a reason; it only shows up in logs.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        trace!(reason, "Closing raw connection");
        self.inner.shutdown().await?;
        Ok(())
    }
}
