//! Client sessions.
//!
//! One session task per client owns the client connection, the current
//! backend link and the pending buffer. Everything that touches that state
//! runs on the task, in response to one of:
//! - a unit or close from the client source
//! - a close or error event from a writer or backend pump
//! - completion of the in-flight backend connect
//! - the registry shutdown signal
//!
//! ## States
//!
//! ```text
//! Connecting ──► Active ◄──► Transferring
//!      │           │              │
//!      └───────────┴──────────────┴──► Closed
//! ```

mod lifecycle;
mod registry;
mod relay;
mod transfer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hopper_id::{ClientId, LinkId};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::command::{CommandInterceptor, Interception};
use crate::config::ProxyConfig;
use crate::directory::{Backend, BackendDirectory};
use crate::error::SessionError;
use crate::observer::{ProxyEvent, ProxyObserver};
use crate::proxy::ProxyStats;
use crate::transport::{ApplicationUnit, ClientProfile, Connection, Transport, UnitSource};

pub(crate) use lifecycle::CloseCause;
pub use registry::SessionRegistry;
pub(crate) use registry::Registration;
use relay::{BackendLink, LinkEvent, Writer};
use transfer::{next_connect, ConnectAttempt, ConnectPlan};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the first backend connection.
    Connecting,
    /// Relaying between the client and its bound backend.
    Active,
    /// Old link retired, new link not ready yet.
    Transferring,
    /// Torn down. Terminal.
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Active, Transferring)
                | (Transferring, Active)
                | (Connecting | Active | Transferring, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Transferring => "transferring",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, published by the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Backend the session is bound to; `None` while connecting or
    /// transferring.
    pub backend: Option<Backend>,
    pub link_id: Option<LinkId>,
}

impl SessionSnapshot {
    pub(crate) fn connecting() -> Self {
        Self {
            state: SessionState::Connecting,
            backend: None,
            link_id: None,
        }
    }
}

/// Read-only handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: ClientId,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(client_id: ClientId, snapshot: watch::Receiver<SessionSnapshot>) -> Self {
        Self {
            client_id,
            snapshot,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn backend(&self) -> Option<Backend> {
        self.snapshot.borrow().backend.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Wait until the session published a snapshot matching `predicate`.
    ///
    /// Returns the matching snapshot, or `None` if the session ended first.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Option<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|snapshot| predicate(snapshot)).await;
        result.ok().map(|snapshot| snapshot.clone())
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        self.wait_until(|snapshot| snapshot.state == SessionState::Closed)
            .await;
    }
}

/// Client units held back while no backend link is usable.
#[derive(Debug)]
pub(crate) struct PendingUnits<U> {
    units: VecDeque<U>,
    bytes: usize,
    limit: usize,
}

impl<U: ApplicationUnit> PendingUnits<U> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            units: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Append a unit, failing once the byte ceiling would be exceeded.
    pub(crate) fn push(&mut self, unit: U) -> Result<(), SessionError> {
        let size = self.bytes + unit.size();
        if size > self.limit {
            return Err(SessionError::BufferOverflow {
                size,
                limit: self.limit,
            });
        }
        self.bytes = size;
        self.units.push_back(unit);
        Ok(())
    }

    /// Take every buffered unit in arrival order.
    pub(crate) fn take(&mut self) -> VecDeque<U> {
        self.bytes = 0;
        std::mem::take(&mut self.units)
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// State shared by every session of a proxy.
pub(crate) struct SessionContext<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) directory: Arc<BackendDirectory>,
    pub(crate) registry: SessionRegistry,
    pub(crate) interceptor: CommandInterceptor,
    pub(crate) config: ProxyConfig,
    pub(crate) observer: Arc<dyn ProxyObserver>,
    pub(crate) stats: Arc<ProxyStats>,
    /// Number of session tasks that have not finished yet.
    pub(crate) running: watch::Sender<usize>,
}

/// A client session, owned by its task.
pub(crate) struct Session<T: Transport> {
    ctx: Arc<SessionContext<T>>,
    client_id: ClientId,
    profile: ClientProfile,
    state: SessionState,
    client_source: T::Source,
    client: Writer<T::Unit>,
    link: Option<BackendLink<T::Unit>>,
    connect: Option<ConnectAttempt<T>>,
    pending: PendingUnits<T::Unit>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        ctx: Arc<SessionContext<T>>,
        registration: &Registration,
        profile: ClientProfile,
        client: Connection<T::Source, T::Sink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = Writer::spawn(
            client.sink,
            ctx.config.relay_queue_capacity,
            relay::Endpoint::Client,
            events_tx.clone(),
        );

        Self {
            client_id: registration.handle.client_id(),
            pending: PendingUnits::new(ctx.config.max_pending_bytes),
            snapshot_tx: registration.snapshot_tx.clone(),
            shutdown_rx: registration.shutdown_rx.clone(),
            ctx,
            profile,
            state: SessionState::Connecting,
            client_source: client.source,
            client: writer,
            link: None,
            connect: None,
            events_tx,
            events_rx,
        }
    }

    /// Drive the session until it is closed.
    pub(crate) async fn run(mut self, initial: Backend) {
        self.ctx.observer.on_event(&ProxyEvent::ClientConnected {
            client_id: &self.client_id,
        });
        self.begin_connect(ConnectPlan::initial(initial), None);

        while self.state != SessionState::Closed {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    self.close(CloseCause::Removed).await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                (plan, result) = next_connect(&mut self.connect) => {
                    self.on_connect_result(plan, result).await;
                }
                received = self.client_source.recv() => {
                    match received {
                        Ok(Some(unit)) => self.on_client_unit(unit).await,
                        Ok(None) => self.close(CloseCause::ClientClosed).await,
                        Err(e) => self.close(CloseCause::ClientFailed(e)).await,
                    }
                }
            }
        }
    }

    /// Route one client unit through the interceptor.
    async fn on_client_unit(&mut self, unit: T::Unit) {
        match self.ctx.interceptor.inspect(unit, self.state) {
            Interception::Forward(unit) => {
                if self.state == SessionState::Active {
                    self.forward_to_backend(unit).await;
                } else {
                    self.buffer(unit).await;
                }
            }
            Interception::Transfer(target) => self.start_transfer(target),
            Interception::Reply(text) => {
                self.ctx
                    .stats
                    .directives_rejected
                    .fetch_add(1, Ordering::Relaxed);
                self.notify(&text).await;
            }
        }
    }

    async fn buffer(&mut self, unit: T::Unit) {
        match self.pending.push(unit) {
            Ok(()) => {
                self.ctx.stats.units_buffered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pending_units = self.pending.len(),
                    pending_bytes = self.pending.bytes(),
                    "Client unit buffered"
                );
            }
            Err(e) => self.close(CloseCause::Fatal(e)).await,
        }
    }

    /// Queue a unit for the current link.
    ///
    /// Waits while the link's queue is full, which stops reading from the
    /// client. A registry removal still gets through.
    async fn forward_to_backend(&mut self, unit: T::Unit) {
        let Some(sender) = self.link.as_ref().map(|link| link.sender()) else {
            self.buffer(unit).await;
            return;
        };

        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => {
                self.close(CloseCause::Removed).await;
            }
            sent = sender.send(relay::Outbound::Unit(unit)) => {
                if sent.is_ok() {
                    self.ctx
                        .stats
                        .units_client_to_backend
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    // The writer already reported its failure as an event.
                    debug!("Backend writer gone, unit dropped");
                }
            }
        }
    }

    /// Send a notice to the client.
    ///
    /// Waits while the client queue is full. Registry removal and link
    /// events are still handled meanwhile; if they close the session the
    /// notice is dropped.
    async fn notify(&mut self, text: &str) {
        let sender = self.client.sender();
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    self.close(CloseCause::Removed).await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                permit = sender.reserve() => {
                    match permit {
                        Ok(permit) => {
                            let notice = <T::Unit as ApplicationUnit>::notice(text);
                            permit.send(relay::Outbound::Unit(notice));
                        }
                        Err(_) => debug!(notice = %text, "Client writer gone, notice dropped"),
                    }
                    return;
                }
            }

            if self.state == SessionState::Closed {
                debug!(notice = %text, "Session closed, notice dropped");
                return;
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "Session state changed");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            state: self.state,
            backend: self.link.as_ref().map(|link| link.backend().clone()),
            link_id: self.link.as_ref().map(|link| link.id()),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
