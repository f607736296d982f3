//! Backend directory.
//!
//! Named backend endpoints a session can be bound or transferred to. The
//! directory is loaded at startup and read by every session afterwards:
//! - Entries are keyed by name; registering an existing name replaces it
//! - The earliest-registered entry is the default backend for new clients
//! - Readers get lock-free consistent snapshots

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{debug, info};

/// A named upstream server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Backend {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Backend {
    /// Create a new backend endpoint.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address())
    }
}

/// Immutable snapshot of directory contents.
#[derive(Debug, Default, Clone)]
struct DirectorySnapshot {
    /// Backends in registration order.
    ordered: Vec<Backend>,
    /// Index into `ordered` by name.
    by_name: HashMap<String, usize>,
}

impl DirectorySnapshot {
    fn with_upsert(&self, backend: Backend) -> Self {
        let mut next = self.clone();
        match next.by_name.get(&backend.name) {
            Some(&idx) => next.ordered[idx] = backend,
            None => {
                next.by_name.insert(backend.name.clone(), next.ordered.len());
                next.ordered.push(backend);
            }
        }
        next
    }
}

/// Registry of named backends.
///
/// Uses ArcSwap so that lookups on the session hot path never block.
/// Writers compute a new snapshot and swap it in atomically.
pub struct BackendDirectory {
    snapshot: ArcSwap<DirectorySnapshot>,
}

impl BackendDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(DirectorySnapshot::default()),
        }
    }

    /// Build a directory from backends in configuration order.
    ///
    /// The first backend becomes the default.
    pub fn from_backends(backends: impl IntoIterator<Item = Backend>) -> Self {
        let directory = Self::new();
        for backend in backends {
            directory.insert(backend);
        }
        directory
    }

    /// Register a backend, replacing any existing entry with the same name.
    pub fn register(&self, name: impl Into<String>, host: impl Into<String>, port: u16) {
        self.insert(Backend::new(name, host, port));
    }

    /// Register a backend value.
    pub fn insert(&self, backend: Backend) {
        debug!(backend = %backend, "Registering backend");
        self.snapshot
            .rcu(|current| Arc::new(current.with_upsert(backend.clone())));
    }

    /// Look up a backend by name.
    pub fn lookup(&self, name: &str) -> Option<Backend> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_name
            .get(name)
            .map(|&idx| snapshot.ordered[idx].clone())
    }

    /// The earliest-registered backend, used for a client's first connection.
    pub fn default_backend(&self) -> Option<Backend> {
        self.snapshot.load().ordered.first().cloned()
    }

    /// Backend names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot
            .load()
            .ordered
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().ordered.is_empty()
    }

    /// Log the directory contents.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot.load();
        for (idx, backend) in snapshot.ordered.iter().enumerate() {
            info!(
                backend = %backend.name,
                address = %backend.address(),
                default = idx == 0,
                "Backend registered"
            );
        }
    }
}

impl Default for BackendDirectory {
    fn default() -> Self {
        Self::new()
    }
}
