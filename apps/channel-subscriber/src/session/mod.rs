//! Broker session lifecycle: connect, transparent reconnect, shutdown.
//!
//! The manager owns the [`Session`] fields. Only two paths write them: the
//! initial `connect` (before the lifecycle task exists) and the lifecycle task
//! itself, which reacts to transport signals. `shutdown` is terminal and makes
//! the lifecycle task stop at its next checkpoint.

pub mod events;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::broker::{BrokerTransport, ByteCounts, Credentials, SignalSender, TransportSignal};
use crate::dispatch::stats::ByteCountSource;
use crate::endpoint::Endpoint;
use crate::error::ConnectError;

pub use events::{SessionBroadcast, SessionEvent};

/// Default time allowed for a single candidate to complete its handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Information passed to the retry predicate before each reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number within the current outage.
    pub attempt: u32,
    /// Session id that was lost.
    pub lost_session_id: Option<String>,
}

/// Decides whether the reconnect loop keeps going.
pub type RetryPredicate = Arc<dyn Fn(&RetryAttempt) -> bool + Send + Sync>;

/// Retry forever.
pub fn always_retry() -> RetryPredicate {
    Arc::new(|_: &RetryAttempt| true)
}

/// Retry until `max_attempts` attempts have been made; `0` means forever.
pub fn retry_up_to(max_attempts: u32) -> RetryPredicate {
    Arc::new(move |attempt: &RetryAttempt| max_attempts == 0 || attempt.attempt <= max_attempts)
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl SessionOptions {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub bytes: ByteCounts,
}

/// One physical connection's identity, rewritten on each (re)connect.
struct Session {
    id: Option<String>,
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    candidates: Vec<Endpoint>,
}

struct SessionShared {
    transport: Arc<dyn BrokerTransport>,
    options: SessionOptions,
    session: RwLock<Session>,
    events: SessionBroadcast,
    should_retry: RwLock<RetryPredicate>,
    log_level: AtomicU8,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the connection to the broker.
pub struct SessionManager {
    shared: Arc<SessionShared>,
    initialized: AtomicBool,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, options: SessionOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(SessionShared {
                transport,
                options,
                session: RwLock::new(Session {
                    id: None,
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    candidates: Vec::new(),
                }),
                events: SessionBroadcast::new(),
                should_retry: RwLock::new(always_retry()),
                log_level: AtomicU8::new(1),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
            initialized: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        }
    }

    /// Replace the predicate consulted before every reconnect attempt.
    pub fn set_retry_predicate(&self, predicate: RetryPredicate) {
        *self.shared.should_retry.write() = predicate;
    }

    /// Observe lifecycle notifications from this point on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Open the session against the first reachable candidate, in the order
    /// given. May only be called once per manager.
    pub async fn connect(
        &self,
        candidates: &[Endpoint],
        log_level: u8,
    ) -> Result<SessionSnapshot, ConnectError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyInitialized);
        }
        self.shared.log_level.store(log_level, Ordering::Relaxed);

        {
            let mut session = self.shared.session.write();
            session.state = ConnectionState::Connecting;
            session.candidates = candidates.to_vec();
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (session_id, endpoint) = match self.shared.connect_any(candidates, &signal_tx).await {
            Ok(connected) => connected,
            Err(err) => {
                self.shared.session.write().state = ConnectionState::Disconnected;
                return Err(err);
            }
        };

        {
            let mut session = self.shared.session.write();
            session.id = Some(session_id.clone());
            session.endpoint = Some(endpoint.clone());
            session.state = ConnectionState::Connected;
        }

        tracing::info!(session_id = %session_id, %endpoint, "broker session established");
        self.shared.events.dispatch(SessionEvent::Connected {
            session_id: session_id.clone(),
        });

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_lifecycle(shared, signal_rx, signal_tx));
        *self.lifecycle.lock() = Some(handle);

        Ok(self.snapshot())
    }

    /// Close the session. Idempotent; aborts any reconnect in progress.
    ///
    /// Emits [`SessionEvent::Closed`], on which a
    /// [`ChannelSubscriptions::watch_session`](crate::subscription::ChannelSubscriptions::watch_session)
    /// task releases the subscriptions it holds.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown_tx.send_replace(true);

        if let Some(handle) = self.lifecycle.lock().take() {
            handle.abort();
        }
        self.shared.transport.close().await;

        let last_id = {
            let mut session = self.shared.session.write();
            session.state = ConnectionState::Disconnected;
            session.id.take()
        };

        tracing::info!(session_id = ?last_id, "broker session closed");
        self.shared.events.dispatch(SessionEvent::Closed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.shared.session.read();
        SessionSnapshot {
            session_id: session.id.clone(),
            state: session.state,
            endpoint: session.endpoint.clone(),
            bytes: self.shared.transport.byte_counts(),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session.read().id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.session.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn log_level(&self) -> u8 {
        self.shared.log_level.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        Arc::clone(&self.shared.transport)
    }
}

impl ByteCountSource for SessionManager {
    fn byte_counts(&self) -> ByteCounts {
        self.shared.transport.byte_counts()
    }
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Try each candidate in order. Unreachable and timed-out candidates fall
    /// through to the next one; a broker that answers with a refusal ends the
    /// search.
    async fn connect_any(
        &self,
        candidates: &[Endpoint],
        signals: &SignalSender,
    ) -> Result<(String, Endpoint), ConnectError> {
        let timeout = self.options.connect_timeout;
        let mut tried = Vec::with_capacity(candidates.len());
        let mut timed_out = false;

        for endpoint in candidates {
            tried.push(endpoint.to_string());
            let attempt = self
                .transport
                .connect(endpoint, &self.options.credentials, signals.clone());

            match time::timeout(timeout, attempt).await {
                Ok(Ok(session_id)) => return Ok((session_id, endpoint.clone())),
                Ok(Err(ConnectError::Unreachable { .. })) => {
                    tracing::debug!(%endpoint, "endpoint unreachable");
                }
                Ok(Err(ConnectError::Timeout(_))) | Err(_) => {
                    tracing::debug!(%endpoint, ?timeout, "endpoint timed out");
                    timed_out = true;
                }
                Ok(Err(err)) => return Err(err),
            }
        }

        if timed_out {
            Err(ConnectError::Timeout(timeout))
        } else {
            Err(ConnectError::Unreachable {
                tried: tried.join(", "),
            })
        }
    }

    /// Runs on the lifecycle task after the transport reported a loss.
    async fn reconnect(&self, reason: String, signals: &SignalSender, shutdown: &watch::Receiver<bool>) {
        let lost_session_id = {
            let mut session = self.session.write();
            session.state = ConnectionState::Connecting;
            session.id.clone()
        };
        let candidates = self.session.read().candidates.clone();

        tracing::warn!(session_id = ?lost_session_id, %reason, "disconnected from broker");
        self.events.dispatch(SessionEvent::Disconnected {
            session_id: lost_session_id.clone(),
            reason,
        });

        let mut attempt = 0u32;
        loop {
            if self.is_closed() {
                return;
            }
            attempt += 1;

            let predicate = Arc::clone(&*self.should_retry.read());
            let retry = RetryAttempt {
                attempt,
                lost_session_id: lost_session_id.clone(),
            };
            if !predicate(&retry) {
                self.session.write().state = ConnectionState::Disconnected;
                tracing::warn!(attempts = attempt - 1, "reconnect abandoned");
                self.events.dispatch(SessionEvent::ReconnectAbandoned {
                    attempts: attempt - 1,
                });
                return;
            }

            if self.log_level.load(Ordering::Relaxed) >= 1 {
                tracing::info!(attempt, "attempting to reconnect");
            }
            self.events.dispatch(SessionEvent::Reconnecting { attempt });

            match self.connect_any(&candidates, signals).await {
                Ok((session_id, endpoint)) => {
                    if self.is_closed() {
                        self.transport.close().await;
                        return;
                    }
                    {
                        let mut session = self.session.write();
                        session.id = Some(session_id.clone());
                        session.endpoint = Some(endpoint.clone());
                        session.state = ConnectionState::Connected;
                    }
                    tracing::info!(session_id = %session_id, %endpoint, attempt, "reconnected to broker");
                    self.events.dispatch(SessionEvent::Reconnected { session_id });
                    return;
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "reconnect attempt failed");
                }
            }

            tokio::select! {
                _ = time::sleep(self.options.reconnect_delay) => {}
                _ = wait_for_shutdown(shutdown.clone()) => return,
            }
        }
    }
}

/// Lifecycle task: forwards async errors and drives reconnects until shutdown.
async fn run_lifecycle(
    shared: Arc<SessionShared>,
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    signal_tx: SignalSender,
) {
    let shutdown = shared.shutdown_tx.subscribe();

    loop {
        let signal = tokio::select! {
            _ = wait_for_shutdown(shutdown.clone()) => return,
            signal = signals.recv() => signal,
        };

        match signal {
            Some(TransportSignal::AsyncError(message)) => {
                tracing::warn!(%message, "asynchronous error from broker");
                shared.events.dispatch(SessionEvent::AsyncError { message });
            }
            Some(TransportSignal::ConnectionLost { reason }) => {
                if shared.is_closed() {
                    return;
                }
                shared.reconnect(reason, &signal_tx, &shutdown).await;
            }
            None => return,
        }
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
