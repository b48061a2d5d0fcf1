//! DDP connection management.
//!
//! This module owns the connection lifecycle:
//! - opening the transport and performing the `connect` handshake,
//! - running the single read loop that routes inbound envelopes,
//! - serialising outbound envelopes onto the one socket write path,
//! - heartbeats and liveness,
//! - tearing down and draining the registries when the connection ends.
//!
//! Nothing here retries. Reconnection is a caller policy, see
//! [`connect_with_retry`](crate::reconnect::connect_with_retry).

mod calls;
mod subscriptions;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::{
    config::SessionConfig,
    error::{DdpError, MethodCallError},
    protocol::{DecodeError, Envelope, JsonCodec},
    transport::{Connector, Transport},
};

pub(crate) use calls::CallGuard;
pub(crate) use subscriptions::SubscriptionGuard;
pub use calls::{CallId, CallOutcome, CallRegistry};
pub use subscriptions::{
    Subscription, SubscriptionEvent, SubscriptionId, SubscriptionItem, SubscriptionRegistry,
};

/// Sending half of a connection's write path.
pub(crate) type Outbound = mpsc::UnboundedSender<Envelope>;

/// Stand-in deadline for disabled timers.
const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Lifecycle state of a session's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting {
        target_url: Url,
        resume_session_id: Option<String>,
    },
    Connected {
        session_id: String,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Connected { session_id } => Some(session_id),
            _ => None,
        }
    }
}

/// The live half of a connection: how to reach its task.
struct Link {
    generation: u64,
    outbound: Outbound,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// State shared between the public API and the connection task.
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    calls: CallRegistry,
    subscriptions: SubscriptionRegistry,
    link: Mutex<Option<Link>>,
}

#[derive(Clone, Copy)]
struct Heartbeat {
    ping_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
}

/// The connection state machine.
///
/// Owns the transport (through its task) and is the only component that
/// changes [`ConnectionState`].
pub struct Connection {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    /// Serialises `connect` and `disconnect`.
    transitions: Mutex<()>,
    next_generation: AtomicU64,
    last_session_id: RwLock<Option<String>>,
    /// Bumped by `disconnect` to abort a handshake in progress.
    cancel_attempt: watch::Sender<u64>,
    /// Never sent on. Dropping it stops every connection task.
    alive: watch::Sender<()>,
}

impl Connection {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                state_tx,
                calls: CallRegistry::new(),
                subscriptions: SubscriptionRegistry::new(),
                link: Mutex::new(None),
            }),
            transitions: Mutex::new(()),
            next_generation: AtomicU64::new(0),
            last_session_id: RwLock::new(None),
            cancel_attempt: watch::channel(0).0,
            alive: watch::channel(()).0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the current state. Never blocks.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn calls(&self) -> &CallRegistry {
        &self.shared.calls
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.shared.subscriptions
    }

    /// Session id the server assigned on the most recent successful handshake.
    pub async fn last_session_id(&self) -> Option<String> {
        self.last_session_id.read().await.clone()
    }

    /// Connects to `url` and performs the DDP handshake.
    ///
    /// A no-op when already connected. When an attempt to the same target is
    /// underway, waits for its outcome instead of starting another one.
    ///
    /// # Errors
    ///
    /// Transport errors while opening, [`DdpError::HandshakeRejected`] on a
    /// `failed` reply, [`DdpError::HandshakeClosed`] if the peer hangs up,
    /// [`DdpError::HandshakeTimeout`] after `connect_timeout`,
    /// [`DdpError::ConnectCancelled`] if [`disconnect`](Self::disconnect) is
    /// called meanwhile. The state is `Disconnected` after any of them.
    pub async fn connect(
        &self,
        url: Url,
        resume_session_id: Option<String>,
    ) -> Result<ConnectionState, DdpError> {
        let joining = matches!(
            &*self.shared.state_tx.borrow(),
            ConnectionState::Connecting { target_url, .. } if *target_url == url
        );
        if joining {
            return self.await_attempt().await;
        }

        let _transition = self.transitions.lock().await;
        let mut cancelled = self.cancel_attempt.subscribe();

        let current = self.state();
        if current.is_connected() {
            debug!("Already connected, connect is a no-op");
            return Ok(current);
        }

        self.shared.state_tx.send_replace(ConnectionState::Connecting {
            target_url: url.clone(),
            resume_session_id: resume_session_id.clone(),
        });

        let attempt = timeout(
            self.config.connect_timeout,
            open_and_handshake(self.connector.as_ref(), &url, &self.config, resume_session_id),
        );
        let opened = tokio::select! {
            opened = attempt => opened,
            _ = cancelled.changed() => {
                debug!("Connection attempt to {} cancelled", url);
                self.shared.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(DdpError::ConnectCancelled);
            }
        };

        let (transport, session_id) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", url, e);
                self.shared.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                warn!("Handshake with {} timed out", url);
                self.shared.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(DdpError::HandshakeTimeout);
            }
        };

        *self.last_session_id.write().await = Some(session_id.clone());

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let heartbeat = Heartbeat {
            ping_interval: self.config.ping_interval,
            idle_timeout: self.config.idle_timeout,
        };

        // Hold the link while spawning so a task that dies at once cannot
        // tear down before it is published.
        let mut link = self.shared.link.lock().await;
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            transport,
            outbound_rx,
            shutdown_rx,
            self.alive.subscribe(),
            heartbeat,
            generation,
        ));
        *link = Some(Link {
            generation,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        });
        let state = ConnectionState::Connected { session_id };
        self.shared.state_tx.send_replace(state.clone());
        drop(link);

        debug!("Connected to {} (generation {})", url, generation);
        Ok(state)
    }

    async fn await_attempt(&self) -> Result<ConnectionState, DdpError> {
        let mut changes = self.state_changes();
        let settled = changes
            .wait_for(|state| !matches!(state, ConnectionState::Connecting { .. }))
            .await
            .map(|state| state.clone());
        match settled {
            Ok(state) if state.is_connected() => Ok(state),
            _ => Err(DdpError::NotConnected),
        }
    }

    /// Closes the connection and drains both registries.
    ///
    /// A handshake in progress is aborted. Returns once the connection task
    /// has finished. Idempotent.
    pub async fn disconnect(&self) {
        self.cancel_attempt.send_modify(|attempt| *attempt = attempt.wrapping_add(1));
        let _transition = self.transitions.lock().await;

        let link = self.shared.link.lock().await.take();
        if let Some(link) = link {
            let _ = link.shutdown.send(());
            drop(link.outbound);
            if let Err(e) = link.task.await {
                error!("Connection task failed: {}", e);
            }
        }

        // The task normally did this already.
        drain(&self.shared, "disconnected by client").await;
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Queues an envelope on the connection's write path.
    ///
    /// # Errors
    ///
    /// [`DdpError::NotConnected`] when there is no live connection or its
    /// task has stopped accepting work.
    pub async fn send(&self, envelope: Envelope) -> Result<(), DdpError> {
        self.outbound()
            .await?
            .send(envelope)
            .map_err(|_| DdpError::NotConnected)
    }

    /// A handle on the live connection's write path.
    pub(crate) async fn outbound(&self) -> Result<Outbound, DdpError> {
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(DdpError::NotConnected)
    }
}

async fn open_and_handshake(
    connector: &dyn Connector,
    url: &Url,
    config: &SessionConfig,
    resume_session_id: Option<String>,
) -> Result<(Box<dyn Transport>, String), DdpError> {
    let mut transport = connector.open(url).await?;
    match handshake(transport.as_mut(), config, resume_session_id).await {
        Ok(session_id) => Ok((transport, session_id)),
        Err(e) => {
            let _ = transport.close().await;
            Err(e)
        }
    }
}

/// Sends `connect` and waits for `connected` or `failed`.
///
/// Pings are answered; anything else that arrives first is ignored.
async fn handshake(
    transport: &mut dyn Transport,
    config: &SessionConfig,
    resume_session_id: Option<String>,
) -> Result<String, DdpError> {
    let connect = Envelope::Connect {
        version: config.version.clone(),
        support: config.support.clone(),
        session: resume_session_id,
    };
    send_envelope(transport, &connect).await?;
    debug!("Handshake sent");

    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => return Err(DdpError::HandshakeClosed),
        };
        match JsonCodec::decode(&text) {
            Ok(Envelope::Connected { session }) => {
                debug!("Handshake accepted, session {}", session);
                return Ok(session);
            }
            Ok(Envelope::Failed { version }) => {
                return Err(DdpError::HandshakeRejected { version });
            }
            Ok(Envelope::Ping { id }) => {
                send_envelope(transport, &Envelope::Pong { id }).await?;
            }
            Ok(other) => debug!("Ignoring `{}` during handshake", other.kind()),
            Err(e) => log_dropped_frame(&e, &text),
        }
    }
}

async fn send_envelope(transport: &mut dyn Transport, envelope: &Envelope) -> Result<(), DdpError> {
    let text = JsonCodec::encode(envelope).map_err(DdpError::Encode)?;
    trace!("-> {}", text);
    transport.send(text).await
}

fn log_dropped_frame(error: &DecodeError, text: &str) {
    match error {
        // Meteor servers send `{"server_id": ...}` on connect.
        DecodeError::UnknownMessageType(None) => debug!("Dropping frame without `msg`: {}", text),
        _ => warn!("Dropping undecodable frame ({}): {}", error, text),
    }
}

/// The connection task: one per live connection.
///
/// Multiplexes inbound frames, outbound envelopes, heartbeats and shutdown,
/// then tears the connection down.
async fn run_connection(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
    mut alive: watch::Receiver<()>,
    heartbeat: Heartbeat,
    generation: u64,
) {
    debug!("Connection task {} started", generation);

    let mut last_inbound = Instant::now();
    let mut ping_sent = false;
    let mut next_ping_id: u64 = 0;

    let reason = loop {
        let ping_at = last_inbound + heartbeat.ping_interval.unwrap_or(NEVER);
        let idle_at = last_inbound + heartbeat.idle_timeout.unwrap_or(NEVER);

        tokio::select! {
            // Fires on an explicit disconnect and when the link is dropped.
            _ = &mut shutdown => break "disconnected by client".to_string(),

            // Only resolves once the owning `Connection` is gone.
            _ = alive.changed() => break "connection handle dropped".to_string(),

            frame = transport.recv() => match frame {
                Some(Ok(text)) => {
                    last_inbound = Instant::now();
                    ping_sent = false;
                    trace!("<- {}", text);
                    let envelope = match JsonCodec::decode(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            log_dropped_frame(&e, &text);
                            continue;
                        }
                    };
                    if let Some(reply) = route(&shared, envelope).await {
                        if let Err(e) = send_envelope(transport.as_mut(), &reply).await {
                            break format!("send failed: {e}");
                        }
                    }
                }
                Some(Err(e)) => break format!("transport error: {e}"),
                None => break "connection closed by server".to_string(),
            },

            Some(envelope) = outbound.recv() => {
                if let Err(e) = send_envelope(transport.as_mut(), &envelope).await {
                    break format!("send failed: {e}");
                }
            }

            _ = sleep_until(ping_at), if heartbeat.ping_interval.is_some() && !ping_sent => {
                next_ping_id += 1;
                let ping = Envelope::Ping { id: Some(next_ping_id.to_string()) };
                if let Err(e) = send_envelope(transport.as_mut(), &ping).await {
                    break format!("send failed: {e}");
                }
                ping_sent = true;
            }

            _ = sleep_until(idle_at), if heartbeat.idle_timeout.is_some() => {
                warn!("No traffic for {:?}, treating connection as dead", heartbeat.idle_timeout);
                break "liveness timeout".to_string();
            }
        }
    };

    // After this no caller can queue work that would never be sent.
    outbound.close();
    if let Err(e) = transport.close().await {
        debug!("Error closing transport: {}", e);
    }

    debug!("Connection task {} ending: {}", generation, reason);
    {
        let mut link = shared.link.lock().await;
        if link.as_ref().is_some_and(|link| link.generation == generation) {
            link.take();
        }
    }
    drain(&shared, &reason).await;
    shared.state_tx.send_replace(ConnectionState::Disconnected);
}

/// Fails everything pending with a connection-loss error.
async fn drain(shared: &Shared, reason: &str) {
    let lost = MethodCallError::ConnectionLost(reason.to_string());
    let calls = shared.calls.drain_all(lost.clone()).await;
    let subscriptions = shared.subscriptions.drain_all(lost).await;
    if calls + subscriptions > 0 {
        debug!(
            "Drained {} pending calls and {} subscriptions ({})",
            calls, subscriptions, reason
        );
    }
}

/// Routes one inbound envelope. Returns an envelope to send back, if any.
async fn route(shared: &Shared, envelope: Envelope) -> Option<Envelope> {
    match envelope {
        Envelope::Ping { id } => return Some(Envelope::Pong { id }),
        Envelope::Pong { .. } => {}
        Envelope::Result { id, result, error } => {
            let pending = match error {
                Some(error) => shared.calls.reject(&id, error.into()).await,
                None => {
                    shared
                        .calls
                        .resolve(&id, result.unwrap_or(Value::Null))
                        .await
                }
            };
            if !pending {
                debug!("Dropping result for call {} that is no longer pending", id);
            }
        }
        Envelope::Updated { .. } => {}
        Envelope::Ready { subs } => {
            for id in subs {
                shared.subscriptions.ready(&id).await;
            }
        }
        Envelope::Added {
            collection,
            id,
            fields,
        } => {
            shared
                .subscriptions
                .dispatch_added(collection, id, fields.unwrap_or_default())
                .await;
        }
        Envelope::Changed {
            collection,
            id,
            fields,
            cleared,
        } => {
            shared
                .subscriptions
                .dispatch_changed(
                    collection,
                    id,
                    fields.unwrap_or_default(),
                    cleared.unwrap_or_default(),
                )
                .await;
        }
        Envelope::Removed { collection, id } => {
            shared.subscriptions.dispatch_removed(collection, id).await;
        }
        Envelope::Nosub { id, error } => {
            shared.subscriptions.nosub(&id, error.map(Into::into)).await;
        }
        Envelope::Error {
            reason,
            offending_message,
        } => {
            warn!(
                "Server reported a protocol error: {} (offending message: {:?})",
                reason, offending_message
            );
        }
        Envelope::Connected { .. } | Envelope::Failed { .. } => {
            warn!("Ignoring handshake reply on an established connection");
        }
        other @ (Envelope::Connect { .. }
        | Envelope::Method { .. }
        | Envelope::Sub { .. }
        | Envelope::Unsub { .. }) => {
            warn!("Ignoring client-only `{}` envelope from server", other.kind());
        }
    }
    None
}
