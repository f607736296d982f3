//! Session registry.
//!
//! Owns the handle of every live session, keyed by client. Create and remove
//! are serialized by one mutex that is never held across an await, so a
//! client can never be registered twice and an entry disappears exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hopper_id::ClientId;
use tokio::sync::watch;
use tracing::debug;

use super::{SessionHandle, SessionSnapshot};
use crate::directory::{Backend, BackendDirectory};
use crate::error::RegistryError;

struct Entry {
    handle: SessionHandle,
    shutdown: watch::Sender<bool>,
}

/// Everything a new session task needs from its registration.
pub(crate) struct Registration {
    pub(crate) handle: SessionHandle,
    pub(crate) snapshot_tx: watch::Sender<SessionSnapshot>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    /// Default backend at registration time.
    pub(crate) backend: Backend,
}

/// All live sessions of a proxy.
pub struct SessionRegistry {
    directory: Arc<BackendDirectory>,
    sessions: Mutex<HashMap<ClientId, Entry>>,
}

impl SessionRegistry {
    pub fn new(directory: Arc<BackendDirectory>) -> Self {
        Self {
            directory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ClientId, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session in `Connecting`, bound for the default backend.
    pub(crate) fn create(&self, client_id: ClientId) -> Result<Registration, RegistryError> {
        let backend = self
            .directory
            .default_backend()
            .ok_or(RegistryError::NoBackendsConfigured)?;

        let mut sessions = self.sessions();
        if sessions.contains_key(&client_id) {
            return Err(RegistryError::DuplicateClient(client_id));
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::connecting());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = SessionHandle::new(client_id, snapshot_rx);

        sessions.insert(
            client_id,
            Entry {
                handle: handle.clone(),
                shutdown,
            },
        );
        debug!(client_id = %client_id, backend = %backend.name, "Session registered");

        Ok(Registration {
            handle,
            snapshot_tx,
            shutdown_rx,
            backend,
        })
    }

    pub fn get(&self, client_id: &ClientId) -> Option<SessionHandle> {
        self.sessions()
            .get(client_id)
            .map(|entry| entry.handle.clone())
    }

    /// Remove a session and tell its task to tear down.
    ///
    /// Returns false if there was no such session.
    pub fn remove(&self, client_id: &ClientId) -> bool {
        let removed = self.sessions().remove(client_id);
        match removed {
            Some(entry) => {
                entry.shutdown.send_replace(true);
                debug!(client_id = %client_id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.sessions().keys().copied().collect()
    }
}
