//! TCP listener.
//!
//! Accepts client connections, runs the transport's client handshake and
//! attaches each client to the proxy. Concurrent connections are capped by a
//! semaphore; a connection holds its permit until its session is closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::DEFAULT_MAX_CONNECTIONS;
use crate::error::TransportError;
use crate::proxy::Proxy;
use crate::transport::StreamTransport;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Client handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
}

/// Accept loop feeding a [`Proxy`].
pub struct Listener<T: StreamTransport> {
    config: ListenerConfig,
    listener: TcpListener,
    proxy: Proxy<T>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl<T: StreamTransport> Listener<T> {
    pub async fn bind(config: ListenerConfig, proxy: Proxy<T>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            transport = proxy.transport().kind(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            proxy,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn proxy(&self) -> &Proxy<T> {
        &self.proxy
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Back off on persistent errors such as fd exhaustion.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handshake, attach, and wait for the session to end.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (profile, connection) = match self.proxy.transport().accept(stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.stats
                    .handshakes_failed
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        debug!(username = ?profile.username, "Client handshake complete");

        match self.proxy.attach(profile, connection) {
            Ok(handle) => handle.closed().await,
            Err(e) => debug!(error = %e, "Client not attached"),
        }
        Ok(())
    }
}
