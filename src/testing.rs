//! In-memory transport for tests.
//!
//! [`MockConnector`] hands every opened connection's server end to the test
//! as a [`MockServer`], which scripts the DDP server side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    config::SessionConfig,
    error::DdpError,
    protocol::{Envelope, JsonCodec},
    session::DdpSession,
    transport::{Connector, Transport},
};

pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    refusals: Arc<AtomicU32>,
}

impl MockConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            servers,
            refusals: Arc::new(AtomicU32::new(0)),
        };
        (connector, accepted)
    }

    /// Makes the next `count` opens fail.
    pub(crate) fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, DdpError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DdpError::Transport("connection refused".into()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.servers
            .send(MockServer {
                url: url.clone(),
                from_client,
                to_client: Some(to_client),
            })
            .map_err(|_| DdpError::Transport("nobody listening".into()))?;

        Ok(Box::new(MockTransport {
            to_server: Some(to_server),
            from_server,
        }))
    }
}

struct MockTransport {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), DdpError> {
        self.to_server
            .as_ref()
            .ok_or_else(|| DdpError::Transport("closed".into()))?
            .send(text)
            .map_err(|_| DdpError::Transport("server went away".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, DdpError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), DdpError> {
        self.to_server = None;
        self.from_server.close();
        Ok(())
    }
}

/// Server end of a mock connection.
pub(crate) struct MockServer {
    pub(crate) url: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
}

impl MockServer {
    /// Next envelope from the client, `None` once the client closed.
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        let text = self.from_client.recv().await?;
        Some(JsonCodec::decode(&text).expect("client sent an undecodable frame"))
    }

    /// Waits for the next `method` envelope, answering pings on the way.
    pub(crate) async fn expect_method(&mut self) -> (String, String, Vec<Value>) {
        loop {
            match self.recv().await.expect("client closed before calling") {
                Envelope::Method { id, method, params } => return (id, method, params),
                Envelope::Ping { id } => self.send(&Envelope::Pong { id }),
                other => panic!("expected a method call, got {other:?}"),
            }
        }
    }

    pub(crate) fn send(&self, envelope: &Envelope) {
        self.send_raw(&JsonCodec::encode(envelope).unwrap());
    }

    pub(crate) fn send_raw(&self, text: &str) {
        if let Some(to_client) = &self.to_client {
            // The client may already be gone; tests check that separately.
            let _ = to_client.send(text.to_string());
        }
    }

    pub(crate) fn reply(&self, id: &str, result: Value) {
        self.send(&Envelope::Result {
            id: id.to_string(),
            result: Some(result),
            error: None,
        });
    }

    /// Closes the server side of the socket.
    pub(crate) fn close(&mut self) {
        self.to_client = None;
    }
}

/// Accepts the next connection and completes its handshake.
pub(crate) async fn accept(
    servers: &mut mpsc::UnboundedReceiver<MockServer>,
    session_id: &str,
) -> MockServer {
    let mut server = servers.recv().await.expect("no connection opened");
    match server.recv().await {
        Some(Envelope::Connect { .. }) => {}
        other => panic!("expected connect, got {other:?}"),
    }
    server.send(&Envelope::Connected {
        session: session_id.to_string(),
    });
    server
}

/// A session connected to a fresh mock server.
pub(crate) async fn connected_session(
    config: SessionConfig,
) -> (DdpSession, MockServer, mpsc::UnboundedReceiver<MockServer>) {
    let (connector, mut servers) = MockConnector::new();
    let session = DdpSession::new(connector, config);

    let server = tokio::spawn(async move {
        let server = accept(&mut servers, "session-1").await;
        (server, servers)
    });
    session
        .connect("ws://nas.local/websocket", None)
        .await
        .expect("connect failed");
    let (server, servers) = server.await.unwrap();
    (session, server, servers)
}
