//! In-process transport backed by bounded channels.
//!
//! Lets a proxy be embedded in a process that already owns its connections,
//! and lets tests drive sessions deterministically: a [`MemoryBackend`] can
//! hold connect attempts open, refuse them, or hand out the backend side of
//! every connection the proxy opens.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{ApplicationUnit, ClientProfile, Connection, Transport, UnitSink, UnitSource};
use crate::directory::Backend;
use crate::error::TransportError;

/// Default per-direction channel capacity.
pub const DEFAULT_CAPACITY: usize = 64;

enum Frame<U> {
    Unit(U),
    Closed(String),
    Failed(String),
}

/// Inbound half of an in-memory connection.
pub struct MemorySource<U> {
    rx: mpsc::Receiver<Frame<U>>,
    close_reason: Option<String>,
    finished: bool,
}

impl<U> MemorySource<U> {
    /// Reason the peer gave when it closed, once the close was received.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }
}

#[async_trait]
impl<U: ApplicationUnit> UnitSource for MemorySource<U> {
    type Unit = U;

    async fn recv(&mut self) -> Result<Option<U>, TransportError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Frame::Unit(unit)) => Ok(Some(unit)),
            Some(Frame::Closed(reason)) => {
                self.finished = true;
                self.close_reason = Some(reason);
                Ok(None)
            }
            Some(Frame::Failed(message)) => {
                self.finished = true;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, message).into())
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}

/// Outbound half of an in-memory connection.
pub struct MemorySink<U> {
    tx: Option<mpsc::Sender<Frame<U>>>,
}

impl<U> MemorySink<U> {
    async fn push(&mut self, frame: Frame<U>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Make the peer's source fail with a connection reset.
    pub async fn fail(&mut self, message: &str) -> Result<(), TransportError> {
        self.push(Frame::Failed(message.to_string())).await?;
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl<U: ApplicationUnit> UnitSink for MemorySink<U> {
    type Unit = U;

    async fn send(&mut self, unit: U) -> Result<(), TransportError> {
        self.push(Frame::Unit(unit)).await
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        let result = self.push(Frame::Closed(reason.to_string())).await;
        self.tx = None;
        result
    }
}

/// One end of an in-memory duplex connection.
pub struct MemoryEnd<U> {
    pub source: MemorySource<U>,
    pub sink: MemorySink<U>,
}

impl<U: ApplicationUnit> MemoryEnd<U> {
    pub async fn send(&mut self, unit: U) -> Result<(), TransportError> {
        self.sink.send(unit).await
    }

    pub async fn recv(&mut self) -> Result<Option<U>, TransportError> {
        self.source.recv().await
    }

    pub async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        self.sink.close(reason).await
    }

    pub async fn fail(&mut self, message: &str) -> Result<(), TransportError> {
        self.sink.fail(message).await
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.source.close_reason()
    }

    /// Convert into the halves a proxy takes ownership of.
    pub fn into_connection(self) -> Connection<MemorySource<U>, MemorySink<U>> {
        Connection::new(self.source, self.sink)
    }
}

/// Create a connected pair of in-memory ends.
pub fn duplex<U>(capacity: usize) -> (MemoryEnd<U>, MemoryEnd<U>) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);

    let end = |rx, tx| MemoryEnd {
        source: MemorySource {
            rx,
            close_reason: None,
            finished: false,
        },
        sink: MemorySink { tx: Some(tx) },
    };

    (end(a_rx, b_tx), end(b_rx, a_tx))
}

/// A connection the proxy opened to a memory backend.
pub struct Accepted<U> {
    /// Profile the proxy connected on behalf of.
    pub profile: ClientProfile,
    /// Backend side of the connection.
    pub end: MemoryEnd<U>,
}

struct BackendSlot<U> {
    accepted: mpsc::UnboundedSender<Accepted<U>>,
    gate: watch::Receiver<bool>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl<U> Clone for BackendSlot<U> {
    fn clone(&self) -> Self {
        Self {
            accepted: self.accepted.clone(),
            gate: self.gate.clone(),
            refuse: Arc::clone(&self.refuse),
            attempts: Arc::clone(&self.attempts),
        }
    }
}

/// Backend side of a [`MemoryTransport`] endpoint.
pub struct MemoryBackend<U> {
    name: String,
    accepted: mpsc::UnboundedReceiver<Accepted<U>>,
    gate: watch::Sender<bool>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl<U> MemoryBackend<U> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next connection the proxy opened to this backend.
    pub async fn accept(&mut self) -> Option<Accepted<U>> {
        self.accepted.recv().await
    }

    /// Keep new connect attempts pending until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let pending and future connect attempts proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Make connect attempts fail with "connection refused".
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts seen so far.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Transport whose backends live in the same process.
pub struct MemoryTransport<U> {
    backends: Mutex<HashMap<String, BackendSlot<U>>>,
    capacity: usize,
}

impl<U: ApplicationUnit> MemoryTransport<U> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Create (or replace) the endpoint for a backend name.
    pub fn backend(&self, name: &str) -> MemoryBackend<U> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(true);
        let refuse = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));

        let slot = BackendSlot {
            accepted: accepted_tx,
            gate: gate_rx,
            refuse: Arc::clone(&refuse),
            attempts: Arc::clone(&attempts),
        };
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), slot);

        MemoryBackend {
            name: name.to_string(),
            accepted: accepted_rx,
            gate: gate_tx,
            refuse,
            attempts,
        }
    }

    /// A connected client end for [`Proxy::attach`](crate::Proxy::attach),
    /// plus the end the caller keeps.
    pub fn client_pair(&self) -> (MemoryEnd<U>, MemoryEnd<U>) {
        duplex(self.capacity)
    }
}

impl<U: ApplicationUnit> Default for MemoryTransport<U> {
    fn default() -> Self {
        Self::new()
    }
}

fn refused(name: &str) -> TransportError {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("memory backend {name} refused the connection"),
    )
    .into()
}

#[async_trait]
impl<U: ApplicationUnit> Transport for MemoryTransport<U> {
    type Unit = U;
    type Source = MemorySource<U>;
    type Sink = MemorySink<U>;

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        backend: &Backend,
        client: &ClientProfile,
    ) -> Result<Connection<MemorySource<U>, MemorySink<U>>, TransportError> {
        let slot = self
            .backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&backend.name)
            .cloned()
            .ok_or_else(|| refused(&backend.name))?;

        slot.attempts.fetch_add(1, Ordering::SeqCst);

        let mut gate = slot.gate;
        while !*gate.borrow_and_update() {
            gate.changed().await.map_err(|_| refused(&backend.name))?;
        }

        if slot.refuse.load(Ordering::SeqCst) {
            return Err(refused(&backend.name));
        }

        let (proxy_end, backend_end) = duplex(self.capacity);
        slot.accepted
            .send(Accepted {
                profile: client.clone(),
                end: backend_end,
            })
            .map_err(|_| refused(&backend.name))?;

        Ok(proxy_end.into_connection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[tokio::test]
    async fn test_duplex_delivers_units_and_close_reason() {
        let (mut a, mut b) = duplex::<Bytes>(4);
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.close("done").await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert!(b.recv().await.unwrap().is_none());
        assert_eq!(b.close_reason(), Some("done"));
        assert!(a.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_surfaces_as_error() {
        let (mut a, mut b) = duplex::<Bytes>(4);
        a.fail("boom").await.unwrap();
        assert!(b.recv().await.is_err());
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_unknown_backend_is_refused() {
        let transport = MemoryTransport::<Bytes>::new();
        let result = transport
            .connect(&Backend::new("nowhere", "mem", 0), &ClientProfile::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let transport = MemoryTransport::<Bytes>::new();
        let mut backend = transport.backend("server1");
        backend.hold();

        let target = Backend::new("server1", "mem", 0);
        let profile = ClientProfile::default();
        let mut connecting = task::spawn(transport.connect(&target, &profile));
        assert_pending!(connecting.poll());
        assert_eq!(backend.connect_attempts(), 1);

        backend.release();
        assert!(connecting.is_woken());
        let mut conn = assert_ready_ok!(connecting.poll());
        let mut accepted = backend.accept().await.unwrap();

        conn.sink.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            accepted.end.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"hi")
        );
    }

    #[tokio::test]
    async fn test_refuse() {
        let transport = MemoryTransport::<Bytes>::new();
        let backend = transport.backend("server1");
        backend.refuse(true);
        let result = transport
            .connect(&Backend::new("server1", "mem", 0), &ClientProfile::default())
            .await;
        assert!(result.is_err());
    }
}
