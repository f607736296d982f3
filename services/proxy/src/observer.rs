//! Proxy event notifications.
//!
//! Embedders that want to react to session activity implement
//! [`ProxyObserver`]. Callbacks run on the session task, so they must not
//! block.

use hopper_id::{ClientId, LinkId};
use tracing::{debug, info, warn};

use crate::directory::Backend;

/// Something that happened to a session.
#[derive(Debug, Clone, Copy)]
pub enum ProxyEvent<'a> {
    /// A client session was registered.
    ClientConnected { client_id: &'a ClientId },

    /// A backend link became the session's current link.
    BackendConnected {
        client_id: &'a ClientId,
        link_id: &'a LinkId,
        backend: &'a Backend,
    },

    /// A transfer finished and the client is bound to `to`.
    Transferred {
        client_id: &'a ClientId,
        from: &'a Backend,
        to: &'a Backend,
    },

    /// Connecting to a transfer target failed.
    TransferFailed {
        client_id: &'a ClientId,
        target: &'a Backend,
        error: &'a str,
    },

    /// The current backend link closed or failed.
    BackendClosed {
        client_id: &'a ClientId,
        link_id: &'a LinkId,
        backend: &'a Backend,
        error: Option<&'a str>,
    },

    /// The client connection closed or failed.
    ClientClosed {
        client_id: &'a ClientId,
        error: Option<&'a str>,
    },

    /// The session was torn down and removed from the registry.
    SessionClosed {
        client_id: &'a ClientId,
        reason: &'a str,
    },
}

impl ProxyEvent<'_> {
    pub fn client_id(&self) -> &ClientId {
        match self {
            ProxyEvent::ClientConnected { client_id }
            | ProxyEvent::BackendConnected { client_id, .. }
            | ProxyEvent::Transferred { client_id, .. }
            | ProxyEvent::TransferFailed { client_id, .. }
            | ProxyEvent::BackendClosed { client_id, .. }
            | ProxyEvent::ClientClosed { client_id, .. }
            | ProxyEvent::SessionClosed { client_id, .. } => client_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::ClientConnected { .. } => "client_connected",
            ProxyEvent::BackendConnected { .. } => "backend_connected",
            ProxyEvent::Transferred { .. } => "transferred",
            ProxyEvent::TransferFailed { .. } => "transfer_failed",
            ProxyEvent::BackendClosed { .. } => "backend_closed",
            ProxyEvent::ClientClosed { .. } => "client_closed",
            ProxyEvent::SessionClosed { .. } => "session_closed",
        }
    }
}

/// Receives session events.
pub trait ProxyObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ProxyEvent<'_>);
}

/// Observer that writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ProxyObserver for LogObserver {
    fn on_event(&self, event: &ProxyEvent<'_>) {
        match *event {
            ProxyEvent::ClientConnected { client_id } => {
                info!(client_id = %client_id, "Client connected");
            }
            ProxyEvent::BackendConnected {
                client_id,
                link_id,
                backend,
            } => {
                info!(
                    client_id = %client_id,
                    link_id = %link_id,
                    backend = %backend,
                    "Backend connected"
                );
            }
            ProxyEvent::Transferred {
                client_id,
                from,
                to,
            } => {
                info!(
                    client_id = %client_id,
                    from = %from.name,
                    to = %to.name,
                    "Client transferred"
                );
            }
            ProxyEvent::TransferFailed {
                client_id,
                target,
                error,
            } => {
                warn!(
                    client_id = %client_id,
                    target = %target.name,
                    error = %error,
                    "Transfer failed"
                );
            }
            ProxyEvent::BackendClosed {
                client_id,
                link_id,
                backend,
                error,
            } => {
                debug!(
                    client_id = %client_id,
                    link_id = %link_id,
                    backend = %backend.name,
                    error = error.unwrap_or(""),
                    "Backend connection closed"
                );
            }
            ProxyEvent::ClientClosed { client_id, error } => {
                debug!(
                    client_id = %client_id,
                    error = error.unwrap_or(""),
                    "Client connection closed"
                );
            }
            ProxyEvent::SessionClosed { client_id, reason } => {
                info!(client_id = %client_id, reason = %reason, "Session closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let client_id = ClientId::new();
        let backend = Backend::new("server1", "127.0.0.1", 19132);
        let link_id = LinkId::new();

        let event = ProxyEvent::BackendConnected {
            client_id: &client_id,
            link_id: &link_id,
            backend: &backend,
        };
        assert_eq!(event.client_id(), &client_id);
        assert_eq!(event.name(), "backend_connected");

        // LogObserver must not panic without a subscriber installed.
        LogObserver.on_event(&event);
        LogObserver.on_event(&ProxyEvent::SessionClosed {
            client_id: &client_id,
            reason: "Client disconnected",
        });
    }
}
