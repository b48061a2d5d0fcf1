//! The public DDP session.
//!
//! [`DdpSession`] is the facade the rest of an application talks to. It is a
//! cheap, cloneable handle; construct one per appliance and pass it to the
//! components that need it.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::{
    config::SessionConfig,
    connection::{CallGuard, Connection, ConnectionState, Subscription, SubscriptionGuard},
    error::{DdpError, MethodCallError},
    protocol::Envelope,
    transport::{Connector, WebSocketConnector},
};

/// A DDP session multiplexing method calls and subscriptions over one
/// connection.
///
/// # Example
///
/// ```no_run
/// use ddp_client::{DdpSession, SessionConfig};
///
/// # async fn example() -> Result<(), ddp_client::DdpError> {
/// let session = DdpSession::websocket(SessionConfig::default());
/// session.connect("https://nas.local/websocket", None).await?;
///
/// let boot_id: String = session.call_method::<_, ()>("system.boot_id", &[]).await?;
/// println!("boot id: {boot_id}");
///
/// session.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DdpSession {
    connection: Arc<Connection>,
}

impl DdpSession {
    /// Creates a disconnected session that opens transports with `connector`.
    pub fn new(connector: impl Connector, config: SessionConfig) -> Self {
        Self {
            connection: Arc::new(Connection::new(Arc::new(connector), config)),
        }
    }

    /// Creates a disconnected session over WebSocket.
    pub fn websocket(config: SessionConfig) -> Self {
        Self::new(WebSocketConnector, config)
    }

    /// Connects and performs the handshake, optionally resuming `session_id`.
    ///
    /// See [`Connection::connect`] for the no-op and error rules.
    pub async fn connect(
        &self,
        url: &str,
        session_id: Option<String>,
    ) -> Result<ConnectionState, DdpError> {
        let url = Url::parse(url)?;
        self.connection.connect(url, session_id).await
    }

    /// Closes the connection. Pending calls fail with
    /// [`MethodCallError::ConnectionLost`].
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Current connection state. Never blocks.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// A receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    /// Session id of the most recent successful handshake, for resuming.
    pub async fn last_session_id(&self) -> Option<String> {
        self.connection.last_session_id().await
    }

    /// Calls a remote method and decodes its result into `R`.
    ///
    /// # Errors
    ///
    /// - [`DdpError::NotConnected`] if the session is not connected; nothing
    ///   is sent in that case.
    /// - [`DdpError::Method`] with the server's error, a connection loss or
    ///   a local timeout.
    /// - [`DdpError::Encode`]/[`DdpError::Decode`] if `params` or the result
    ///   do not fit their types.
    pub async fn call_method<R, P>(&self, method: &str, params: &[P]) -> Result<R, DdpError>
    where
        R: DeserializeOwned,
        P: Serialize,
    {
        let params = to_values(params)?;
        let value = self.call_method_value(method, params).await?;
        serde_json::from_value(value).map_err(DdpError::Decode)
    }

    /// Untyped variant of [`call_method`](Self::call_method).
    pub async fn call_method_value(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, DdpError> {
        if !self.state().is_connected() {
            return Err(DdpError::NotConnected);
        }

        let calls = self.connection.calls();
        let id = calls.reserve();
        let completion = calls.register(id.clone()).await;
        let guard = CallGuard::new(calls.clone(), id.clone());

        debug!("Calling {} (id {})", method, id);
        self.connection
            .send(Envelope::Method {
                method: method.to_string(),
                params,
                id: id.clone(),
            })
            .await?;

        let outcome = match self.connection.config().call_timeout {
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    calls.forget(&id).await;
                    guard.disarm();
                    debug!("Call {} (id {}) timed out after {:?}", method, id, limit);
                    return Err(MethodCallError::Timeout.into());
                }
            },
            None => completion.await,
        };
        guard.disarm();

        match outcome {
            Ok(result) => result.map_err(DdpError::from),
            // The entry was removed without being completed.
            Err(_canceled) => Err(MethodCallError::ConnectionLost("call abandoned".into()).into()),
        }
    }

    /// Subscribes to a publication.
    ///
    /// The returned stream yields [`SubscriptionEvent::Ready`] once the
    /// initial data set is in, then document events.
    ///
    /// [`SubscriptionEvent::Ready`]: crate::SubscriptionEvent::Ready
    pub async fn subscribe<P: Serialize>(
        &self,
        name: &str,
        params: &[P],
    ) -> Result<Subscription, DdpError> {
        if !self.state().is_connected() {
            return Err(DdpError::NotConnected);
        }
        let params = to_values(params)?;
        let outbound = self.connection.outbound().await?;

        let subscriptions = self.connection.subscriptions();
        let id = subscriptions.reserve();
        let events = subscriptions.register(id.clone(), name.to_string()).await;

        debug!("Subscribing to {} (id {})", name, id);
        let sent = outbound.send(Envelope::Sub {
            id: id.clone(),
            name: name.to_string(),
            params,
        });
        if sent.is_err() {
            subscriptions.remove(&id).await;
            return Err(DdpError::NotConnected);
        }

        let guard = SubscriptionGuard::new(subscriptions.clone(), outbound, id);
        Ok(Subscription::new(name.to_string(), events, guard))
    }

    /// Ends a subscription. Its stream ends without an error.
    ///
    /// Unsubscribing from a subscription that already ended is a no-op.
    /// Dropping the [`Subscription`] has the same effect.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), DdpError> {
        let id = subscription.id();
        if !self.connection.subscriptions().remove(id).await {
            return Ok(());
        }
        debug!("Unsubscribing from {} (id {})", subscription.name(), id);
        self.connection
            .send(Envelope::Unsub { id: id.to_string() })
            .await
    }
}

impl std::fmt::Debug for DdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdpSession")
            .field("state", &self.state())
            .finish()
    }
}

fn to_values<P: Serialize>(params: &[P]) -> Result<Vec<Value>, DdpError> {
    params
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()
        .map_err(DdpError::Encode)
}
