//! Backend connects and live transfers.
//!
//! A connect runs as its own task so the session keeps serving the client
//! (and buffering its units) while the backend is slow to answer. The task
//! handle sits in the session; closing the session aborts it, and a
//! connection that completes after that is dropped with the task.

use std::future::pending;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::lifecycle::CloseCause;
use super::relay::BackendLink;
use super::{Session, SessionState};
use crate::command::notice;
use crate::config::TransferFailurePolicy;
use crate::directory::Backend;
use crate::error::{SessionError, TransportError};
use crate::observer::ProxyEvent;
use crate::transport::{Connection, Transport};

pub(crate) type ConnectResult<T> = Result<
    Connection<<T as Transport>::Source, <T as Transport>::Sink>,
    TransportError,
>;

/// Why a connect was started.
#[derive(Debug, Clone)]
pub(crate) enum ConnectPurpose {
    /// First backend of a new session.
    Initial,
    /// Transfer away from `from`.
    Transfer { from: Backend },
    /// Return to the previous backend after the transfer to `failed` broke.
    Fallback { failed: Backend, error: String },
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectPlan {
    pub(crate) target: Backend,
    pub(crate) purpose: ConnectPurpose,
    /// Retries already spent on this target.
    pub(crate) attempt: u32,
}

impl ConnectPlan {
    pub(crate) fn initial(target: Backend) -> Self {
        Self {
            target,
            purpose: ConnectPurpose::Initial,
            attempt: 0,
        }
    }

    fn transfer(target: Backend, from: Backend) -> Self {
        Self {
            target,
            purpose: ConnectPurpose::Transfer { from },
            attempt: 0,
        }
    }

    fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// An in-flight connect task.
pub(crate) struct ConnectAttempt<T: Transport> {
    plan: ConnectPlan,
    task: JoinHandle<ConnectResult<T>>,
}

impl<T: Transport> ConnectAttempt<T> {
    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

/// Resolve the in-flight connect, or never if there is none.
///
/// Cancel-safe: the attempt stays in the slot until its task finished.
pub(crate) async fn next_connect<T: Transport>(
    slot: &mut Option<ConnectAttempt<T>>,
) -> (ConnectPlan, ConnectResult<T>) {
    let Some(attempt) = slot.as_mut() else {
        return pending().await;
    };

    let joined = (&mut attempt.task).await;
    let plan = attempt.plan.clone();
    *slot = None;

    let result = joined.unwrap_or_else(|e| Err(io::Error::other(e).into()));
    (plan, result)
}

impl<T: Transport> Session<T> {
    /// Spawn a connect task for `plan`, optionally after a delay.
    pub(super) fn begin_connect(&mut self, plan: ConnectPlan, delay: Option<Duration>) {
        if let Some(previous) = self.connect.take() {
            previous.abort();
        }

        let transport = Arc::clone(&self.ctx.transport);
        let connect_timeout = self.ctx.config.connect_timeout;
        let target = plan.target.clone();
        let profile = self.profile.clone();

        debug!(
            backend = %target,
            attempt = plan.attempt,
            transport = transport.kind(),
            "Connecting to backend"
        );

        let task = tokio::spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            timeout(connect_timeout, transport.connect(&target, &profile))
                .await
                .map_err(|_| TransportError::ConnectTimeout(connect_timeout))?
        });

        self.connect = Some(ConnectAttempt { plan, task });
    }

    /// Retire the current link and start connecting to `target`.
    ///
    /// Client units received from here on are buffered until the new link is
    /// installed.
    pub(super) fn start_transfer(&mut self, target: Backend) {
        let Some(link) = self.link.take() else {
            return;
        };

        self.set_state(SessionState::Transferring);
        self.ctx
            .stats
            .transfers_started
            .fetch_add(1, Ordering::Relaxed);

        let from = link.retire(
            "Transferring to another server",
            self.ctx.config.drain_timeout,
        );
        info!(from = %from.name, to = %target.name, "Transfer started");

        self.begin_connect(ConnectPlan::transfer(target, from), None);
    }

    pub(super) async fn on_connect_result(&mut self, plan: ConnectPlan, result: ConnectResult<T>) {
        match result {
            Ok(connection) => self.install(plan, connection).await,
            Err(e) => self.on_connect_failed(plan, e).await,
        }
    }

    /// Make a fresh connection the current link, replay pending units and
    /// report the outcome to the client.
    async fn install(
        &mut self,
        plan: ConnectPlan,
        connection: Connection<T::Source, T::Sink>,
    ) {
        let link = BackendLink::open(
            plan.target.clone(),
            connection,
            self.ctx.config.relay_queue_capacity,
            self.client.sender(),
            self.events_tx.clone(),
            Arc::clone(&self.ctx.stats),
        );
        let link_id = link.id();
        self.link = Some(link);

        self.ctx.observer.on_event(&ProxyEvent::BackendConnected {
            client_id: &self.client_id,
            link_id: &link_id,
            backend: &plan.target,
        });

        if !self.pending.is_empty() {
            debug!(
                units = self.pending.len(),
                bytes = self.pending.bytes(),
                "Replaying pending units"
            );
        }
        for unit in self.pending.take() {
            self.forward_to_backend(unit).await;
            if self.state == SessionState::Closed {
                return;
            }
        }

        self.set_state(SessionState::Active);

        match plan.purpose {
            ConnectPurpose::Initial => {
                info!(backend = %plan.target, link_id = %link_id, "Session bound to backend");
            }
            ConnectPurpose::Transfer { from } => {
                self.ctx
                    .stats
                    .transfers_completed
                    .fetch_add(1, Ordering::Relaxed);
                info!(from = %from.name, to = %plan.target.name, "Transfer completed");
                self.ctx.observer.on_event(&ProxyEvent::Transferred {
                    client_id: &self.client_id,
                    from: &from,
                    to: &plan.target,
                });
                self.notify(&notice::transferred(&plan.target.name)).await;
            }
            ConnectPurpose::Fallback { failed, error } => {
                info!(
                    failed = %failed.name,
                    backend = %plan.target.name,
                    "Returned to previous backend after failed transfer"
                );
                self.notify(&notice::transfer_failed(&failed.name, &error))
                    .await;
            }
        }
    }

    async fn on_connect_failed(&mut self, plan: ConnectPlan, error: TransportError) {
        match plan.purpose.clone() {
            ConnectPurpose::Initial => {
                warn!(backend = %plan.target, error = %error, "Could not connect to backend");
                self.notify(&notice::connect_failed(&plan.target.name, &error))
                    .await;
                self.close(CloseCause::Fatal(SessionError::BackendUnavailable {
                    backend: plan.target.name,
                    source: error,
                }))
                .await;
            }
            ConnectPurpose::Transfer { from } => {
                self.ctx.observer.on_event(&ProxyEvent::TransferFailed {
                    client_id: &self.client_id,
                    target: &plan.target,
                    error: &error.to_string(),
                });

                match self.ctx.config.transfer_failure_policy {
                    TransferFailurePolicy::Retry { attempts, backoff }
                        if plan.attempt < attempts =>
                    {
                        let delay = backoff.delay(plan.attempt);
                        debug!(
                            backend = %plan.target,
                            attempt = plan.attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying transfer target"
                        );
                        self.begin_connect(plan.retry(), Some(delay));
                    }
                    TransferFailurePolicy::FallbackToPrevious => {
                        self.count_failed_transfer();
                        warn!(
                            target = %plan.target.name,
                            fallback = %from.name,
                            error = %error,
                            "Transfer failed, falling back"
                        );
                        let fallback = ConnectPlan {
                            target: from,
                            purpose: ConnectPurpose::Fallback {
                                failed: plan.target,
                                error: error.to_string(),
                            },
                            attempt: 0,
                        };
                        self.begin_connect(fallback, None);
                    }
                    _ => {
                        self.count_failed_transfer();
                        warn!(target = %plan.target.name, error = %error, "Transfer failed");
                        self.notify(&notice::transfer_failed(&plan.target.name, &error))
                            .await;
                        self.close(CloseCause::Fatal(SessionError::TransferFailed {
                            target: plan.target.name,
                            source: error,
                        }))
                        .await;
                    }
                }
            }
            ConnectPurpose::Fallback { failed, error: cause } => {
                warn!(
                    backend = %plan.target.name,
                    error = %error,
                    "Fallback to previous backend failed"
                );
                self.notify(&notice::transfer_failed(&failed.name, &cause))
                    .await;
                self.close(CloseCause::Fatal(SessionError::BackendUnavailable {
                    backend: plan.target.name,
                    source: error,
                }))
                .await;
            }
        }
    }

    fn count_failed_transfer(&self) {
        self.ctx
            .stats
            .transfers_failed
            .fetch_add(1, Ordering::Relaxed);
    }
}
