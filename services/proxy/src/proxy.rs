//! Proxy entry point.
//!
//! [`Proxy`] wires the directory, registry, interceptor and observer
//! together and spawns one session task per attached client. It is cheap to
//! clone; every clone drives the same set of sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hopper_id::ClientId;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use crate::command::{notice, CommandInterceptor, DirectiveParser, SlashCommandParser};
use crate::config::ProxyConfig;
use crate::directory::BackendDirectory;
use crate::error::RegistryError;
use crate::observer::{LogObserver, ProxyObserver};
use crate::session::{Session, SessionContext, SessionHandle, SessionRegistry};
use crate::transport::{ApplicationUnit, ClientProfile, Connection, Transport, UnitSink};

/// Counters across all sessions of a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Sessions registered.
    pub sessions_created: AtomicU64,
    /// Sessions currently registered.
    pub sessions_active: AtomicU64,
    /// Sessions torn down.
    pub sessions_closed: AtomicU64,
    /// Clients turned away before a session existed.
    pub sessions_rejected: AtomicU64,
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    /// Client units queued for a backend.
    pub units_client_to_backend: AtomicU64,
    /// Backend units queued for a client.
    pub units_backend_to_client: AtomicU64,
    /// Client units held in a pending buffer.
    pub units_buffered: AtomicU64,
    /// Directives answered with a notice instead of a transfer.
    pub directives_rejected: AtomicU64,
}

impl ProxyStats {
    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Builder for [`Proxy`].
pub struct ProxyBuilder<T> {
    transport: T,
    directory: Arc<BackendDirectory>,
    config: ProxyConfig,
    observer: Arc<dyn ProxyObserver>,
    parser: Option<Arc<dyn DirectiveParser>>,
}

impl<T: Transport> ProxyBuilder<T> {
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProxyObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the directive syntax. Defaults to a slash command using
    /// `ProxyConfig::directive_command`.
    pub fn parser(mut self, parser: Arc<dyn DirectiveParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn build(self) -> Proxy<T> {
        let parser = self.parser.unwrap_or_else(|| {
            Arc::new(SlashCommandParser::new(self.config.directive_command.clone()))
        });

        Proxy {
            ctx: Arc::new(SessionContext {
                transport: Arc::new(self.transport),
                registry: SessionRegistry::new(Arc::clone(&self.directory)),
                interceptor: CommandInterceptor::new(parser, Arc::clone(&self.directory)),
                directory: self.directory,
                config: self.config,
                observer: self.observer,
                stats: Arc::new(ProxyStats::default()),
                running: watch::channel(0).0,
            }),
        }
    }
}

/// A session-transfer proxy over transport `T`.
pub struct Proxy<T: Transport> {
    ctx: Arc<SessionContext<T>>,
}

impl<T: Transport> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<T: Transport> Proxy<T> {
    pub fn builder(transport: T, directory: Arc<BackendDirectory>) -> ProxyBuilder<T> {
        ProxyBuilder {
            transport,
            directory,
            config: ProxyConfig::default(),
            observer: Arc::new(LogObserver),
            parser: None,
        }
    }

    /// Proxy with the default observer and directive syntax.
    pub fn new(transport: T, directory: Arc<BackendDirectory>, config: ProxyConfig) -> Self {
        Self::builder(transport, directory).config(config).build()
    }

    /// Start a session for a connected client.
    ///
    /// The session is registered and bound for the default backend before
    /// this returns. If no backend is configured the client gets a notice
    /// and is disconnected.
    pub fn attach(
        &self,
        profile: ClientProfile,
        client: Connection<T::Source, T::Sink>,
    ) -> Result<SessionHandle, RegistryError> {
        let client_id = ClientId::new();
        let registration = match self.ctx.registry.create(client_id) {
            Ok(registration) => registration,
            Err(e) => {
                self.ctx
                    .stats
                    .sessions_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %client_id, error = %e, "Client rejected");
                tokio::spawn(reject(client.sink, e.clone()));
                return Err(e);
            }
        };

        self.ctx
            .stats
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.ctx
            .stats
            .sessions_active
            .fetch_add(1, Ordering::Relaxed);

        let handle = registration.handle.clone();
        let span = tracing::info_span!(
            "session",
            client_id = %client_id,
            peer = ?profile.peer_addr,
            username = profile.username.as_deref().unwrap_or("")
        );
        let session = Session::new(Arc::clone(&self.ctx), &registration, profile, client);
        let running = RunningSession::start(Arc::clone(&self.ctx));
        let backend = registration.backend;
        tokio::spawn(
            async move {
                let _running = running;
                session.run(backend).await;
            }
            .instrument(span),
        );

        Ok(handle)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn directory(&self) -> &Arc<BackendDirectory> {
        &self.ctx.directory
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.ctx.config
    }

    pub fn transport(&self) -> &T {
        &self.ctx.transport
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.ctx.stats
    }

    /// Disconnect every session.
    pub fn shutdown(&self) {
        for client_id in self.ctx.registry.ids() {
            self.ctx.registry.remove(&client_id);
        }
    }

    /// Disconnect every session and wait for their tasks to finish, so that
    /// close reasons reach both peers.
    ///
    /// Returns false if some sessions were still running after `limit`.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.shutdown();

        let mut running = self.ctx.running.subscribe();
        let drained = timeout(limit, running.wait_for(|count| *count == 0))
            .await
            .is_ok();
        let remaining = *running.borrow();
        if drained {
            info!("All sessions drained");
        } else {
            warn!(remaining, "Sessions still running after drain limit");
        }
        drained
    }

    /// Session tasks that have not finished yet.
    pub fn running_sessions(&self) -> usize {
        *self.ctx.running.borrow()
    }
}

/// Counts a session task as running until dropped.
struct RunningSession<T: Transport> {
    ctx: Arc<SessionContext<T>>,
}

impl<T: Transport> RunningSession<T> {
    fn start(ctx: Arc<SessionContext<T>>) -> Self {
        ctx.running.send_modify(|count| *count += 1);
        Self { ctx }
    }
}

impl<T: Transport> Drop for RunningSession<T> {
    fn drop(&mut self) {
        self.ctx
            .running
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

async fn reject<K: UnitSink>(mut sink: K, error: RegistryError) {
    let text = match error {
        RegistryError::NoBackendsConfigured => notice::no_backends(),
        RegistryError::DuplicateClient(_) => "Already connected.".to_string(),
    };
    let notice = <K::Unit as ApplicationUnit>::notice(&text);
    if let Err(e) = sink.send(notice).await {
        debug!(error = %e, "Could not notify rejected client");
    }
    let _ = sink.close("Disconnected by proxy").await;
}
