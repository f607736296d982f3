//! Session teardown.
//!
//! Every terminal path ends in [`Session::close`], which runs at most once:
//! the in-flight connect is aborted, the backend link and the client are
//! retired with a reason, and the registry entry is removed. The session task
//! ends once both connections have drained.

use std::fmt;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::relay::{Endpoint, EventKind, LinkEvent};
use super::{Session, SessionState};
use crate::error::{SessionError, TransportError};
use crate::observer::ProxyEvent;
use crate::transport::Transport;

/// Why a session ends.
#[derive(Debug)]
pub(crate) enum CloseCause {
    ClientClosed,
    ClientFailed(TransportError),
    BackendClosed,
    BackendFailed(TransportError),
    /// Removed from the registry from outside the session.
    Removed,
    Fatal(SessionError),
}

impl CloseCause {
    /// Reason given to the backend link, if one is still open.
    pub(crate) fn backend_reason(&self) -> &'static str {
        match self {
            CloseCause::ClientClosed => "Client disconnected",
            CloseCause::ClientFailed(_) => "Client error",
            _ => "Disconnected by proxy",
        }
    }

    /// Reason given to the client.
    pub(crate) fn client_reason(&self) -> &'static str {
        match self {
            CloseCause::BackendClosed => "Server disconnected",
            CloseCause::BackendFailed(_) => "Server error",
            CloseCause::ClientClosed | CloseCause::ClientFailed(_) => "Client disconnected",
            CloseCause::Removed | CloseCause::Fatal(_) => "Disconnected by proxy",
        }
    }

    fn is_error(&self) -> bool {
        matches!(
            self,
            CloseCause::ClientFailed(_) | CloseCause::BackendFailed(_) | CloseCause::Fatal(_)
        )
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::ClientClosed => f.write_str("client closed"),
            CloseCause::ClientFailed(e) => write!(f, "client error: {e}"),
            CloseCause::BackendClosed => f.write_str("backend closed"),
            CloseCause::BackendFailed(e) => write!(f, "backend error: {e}"),
            CloseCause::Removed => f.write_str("removed from registry"),
            CloseCause::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl<T: Transport> Session<T> {
    /// React to a close or failure reported by a writer or pump.
    pub(super) async fn handle_event(&mut self, event: LinkEvent) {
        match event.endpoint {
            Endpoint::Client => {
                let cause = match event.kind {
                    EventKind::Closed => CloseCause::ClientClosed,
                    EventKind::Failed(e) => CloseCause::ClientFailed(e),
                };
                self.close(cause).await;
            }
            Endpoint::Backend(link_id) => {
                let current = self.link.as_ref().filter(|link| link.id() == link_id);
                let Some(link) = current else {
                    debug!(
                        link_id = %link_id,
                        state = %self.state,
                        kind = ?event.kind,
                        "Event from retired link ignored"
                    );
                    return;
                };

                let error = match &event.kind {
                    EventKind::Closed => None,
                    EventKind::Failed(e) => Some(e.to_string()),
                };
                self.ctx.observer.on_event(&ProxyEvent::BackendClosed {
                    client_id: &self.client_id,
                    link_id: &link_id,
                    backend: link.backend(),
                    error: error.as_deref(),
                });

                let cause = match event.kind {
                    EventKind::Closed => CloseCause::BackendClosed,
                    EventKind::Failed(e) => CloseCause::BackendFailed(e),
                };
                self.close(cause).await;
            }
        }
    }

    /// Tear the session down. Safe to call more than once.
    pub(super) async fn close(&mut self, cause: CloseCause) {
        if self.state == SessionState::Closed {
            return;
        }

        match &cause {
            CloseCause::ClientFailed(e) if e.is_disconnect() => {
                debug!(client_id = %self.client_id, state = %self.state, error = %e, "Client dropped the connection");
            }
            cause if cause.is_error() => {
                warn!(client_id = %self.client_id, state = %self.state, error = %cause, "Session failed");
            }
            cause => {
                info!(client_id = %self.client_id, state = %self.state, cause = %cause, "Session closing");
            }
        }

        if let Some(attempt) = self.connect.take() {
            attempt.abort();
        }

        let drain_timeout = self.ctx.config.drain_timeout;
        let mut drains = Vec::with_capacity(2);
        if let Some(link) = self.link.take() {
            drains.extend(link.close(cause.backend_reason(), drain_timeout));
        }
        drains.extend(self.client.retire(cause.client_reason(), drain_timeout));

        let dropped = self.pending.take().len();
        if dropped > 0 {
            debug!(units = dropped, "Pending units discarded");
        }

        self.set_state(SessionState::Closed);
        self.ctx.registry.remove(&self.client_id);

        self.ctx.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.ctx.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);

        match &cause {
            CloseCause::ClientClosed => {
                self.ctx.observer.on_event(&ProxyEvent::ClientClosed {
                    client_id: &self.client_id,
                    error: None,
                });
            }
            CloseCause::ClientFailed(e) => {
                self.ctx.observer.on_event(&ProxyEvent::ClientClosed {
                    client_id: &self.client_id,
                    error: Some(&e.to_string()),
                });
            }
            _ => {}
        }

        let reason = cause.to_string();
        self.ctx.observer.on_event(&ProxyEvent::SessionClosed {
            client_id: &self.client_id,
            reason: &reason,
        });

        // Each drain is bounded by drain_timeout.
        for drain in drains {
            let _ = drain.await;
        }
    }
}
