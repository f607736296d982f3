//! Relay tasks.
//!
//! Each side of a session gets a writer task fed by a bounded queue, so a
//! slow peer only ever blocks the producer feeding its own queue. Each
//! backend link also gets a pump task copying backend units into the client
//! queue. Writers and pumps report closes and failures to the session task
//! as [`LinkEvent`]s; they never touch session state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hopper_id::LinkId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::directory::Backend;
use crate::error::TransportError;
use crate::proxy::ProxyStats;
use crate::transport::{ApplicationUnit, Connection, UnitSink, UnitSource};

/// Message for a writer task.
#[derive(Debug)]
pub(crate) enum Outbound<U> {
    Unit(U),
    /// Flush what is queued, then close with this reason.
    Close(String),
}

/// Which connection an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Client,
    Backend(LinkId),
}

#[derive(Debug)]
pub(crate) enum EventKind {
    /// The peer closed the connection.
    Closed,
    Failed(TransportError),
}

#[derive(Debug)]
pub(crate) struct LinkEvent {
    pub(crate) endpoint: Endpoint,
    pub(crate) kind: EventKind,
}

/// Handle to a writer task.
pub(crate) struct Writer<U> {
    tx: mpsc::Sender<Outbound<U>>,
    task: Option<JoinHandle<()>>,
}

impl<U: ApplicationUnit> Writer<U> {
    pub(crate) fn spawn<K>(
        sink: K,
        capacity: usize,
        endpoint: Endpoint,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self
    where
        K: UnitSink<Unit = U>,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(write_loop(sink, rx, endpoint, events));
        Self {
            tx,
            task: Some(task),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Outbound<U>> {
        self.tx.clone()
    }

    /// Queue a unit, waiting while the queue is full.
    #[cfg(test)]
    pub(crate) async fn send(&self, unit: U) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Unit(unit))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection after what is already queued has been written.
    ///
    /// Runs in the background. If draining takes longer than
    /// `drain_timeout` the writer is aborted and the connection dropped.
    /// Returns the drain task the first time it is called.
    pub(crate) fn retire(&mut self, reason: &str, drain_timeout: Duration) -> Option<JoinHandle<()>> {
        let task = self.task.take()?;
        let tx = self.tx.clone();
        let reason = reason.to_string();

        Some(tokio::spawn(async move {
            let abort = task.abort_handle();
            let drain = async move {
                let _ = tx.send(Outbound::Close(reason)).await;
                drop(tx);
                let _ = task.await;
            };
            if timeout(drain_timeout, drain).await.is_err() {
                warn!(
                    drain_timeout_ms = drain_timeout.as_millis() as u64,
                    "Writer did not drain in time, aborting"
                );
                abort.abort();
            }
        }))
    }
}

async fn write_loop<K: UnitSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<Outbound<K::Unit>>,
    endpoint: Endpoint,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Unit(unit) => {
                if let Err(e) = sink.send(unit).await {
                    let _ = events.send(LinkEvent {
                        endpoint,
                        kind: EventKind::Failed(e),
                    });
                    return;
                }
            }
            Outbound::Close(reason) => {
                if let Err(e) = sink.close(&reason).await {
                    debug!(endpoint = ?endpoint, error = %e, "Close failed");
                }
                return;
            }
        }
    }
}

async fn pump<S: UnitSource>(
    link_id: LinkId,
    mut source: S,
    client: mpsc::Sender<Outbound<S::Unit>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    stats: Arc<ProxyStats>,
) {
    let endpoint = Endpoint::Backend(link_id);
    loop {
        match source.recv().await {
            Ok(Some(unit)) => {
                if client.send(Outbound::Unit(unit)).await.is_err() {
                    return;
                }
                stats
                    .units_backend_to_client
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                let _ = events.send(LinkEvent {
                    endpoint,
                    kind: EventKind::Closed,
                });
                return;
            }
            Err(e) => {
                let _ = events.send(LinkEvent {
                    endpoint,
                    kind: EventKind::Failed(e),
                });
                return;
            }
        }
    }
}

/// One backend-side connection of a session.
pub(crate) struct BackendLink<U> {
    id: LinkId,
    backend: Backend,
    writer: Writer<U>,
    pump: JoinHandle<()>,
}

impl<U: ApplicationUnit> BackendLink<U> {
    /// Start relaying over an established backend connection.
    pub(crate) fn open<S, K>(
        backend: Backend,
        connection: Connection<S, K>,
        capacity: usize,
        client: mpsc::Sender<Outbound<U>>,
        events: mpsc::UnboundedSender<LinkEvent>,
        stats: Arc<ProxyStats>,
    ) -> Self
    where
        S: UnitSource<Unit = U>,
        K: UnitSink<Unit = U>,
    {
        let id = LinkId::new();
        let writer = Writer::spawn(
            connection.sink,
            capacity,
            Endpoint::Backend(id),
            events.clone(),
        );
        let pump = tokio::spawn(pump(id, connection.source, client, events, stats));
        Self {
            id,
            backend,
            writer,
            pump,
        }
    }

    pub(crate) fn id(&self) -> LinkId {
        self.id
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Outbound<U>> {
        self.writer.sender()
    }

    /// Stop relaying backend units and close the connection gracefully.
    ///
    /// Returns the backend the link was bound to.
    pub(crate) fn retire(self, reason: &str, drain_timeout: Duration) -> Backend {
        let backend = self.backend.clone();
        let _ = self.close(reason, drain_timeout);
        backend
    }

    /// Like [`retire`](Self::retire), but hands back the drain task.
    pub(crate) fn close(mut self, reason: &str, drain_timeout: Duration) -> Option<JoinHandle<()>> {
        self.pump.abort();
        let drain = self.writer.retire(reason, drain_timeout);
        debug!(link_id = %self.id, backend = %self.backend.name, reason, "Link retired");
        drain
    }
}
