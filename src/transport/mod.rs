//! Transport abstraction.
//!
//! The session never touches sockets directly. It talks to a [`Connector`]
//! that opens a [`Transport`]: a bidirectional channel of text frames.
//! [`WebSocketConnector`] is the production implementation.

mod websocket;

use async_trait::async_trait;
use url::Url;

use crate::error::DdpError;

pub use websocket::{WebSocketConnector, WebSocketTransport, websocket_url};

/// An open, bidirectional text-frame channel.
///
/// The connection task is the only owner of a transport; it never calls
/// `send` and `recv` concurrently.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<(), DdpError>;

    /// Receives the next text frame.
    ///
    /// Returns `None` once the peer has closed the channel. Must be cancel
    /// safe: the connection task polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String, DdpError>>;

    /// Closes the channel. Closing an already closed channel is not an error.
    async fn close(&mut self) -> Result<(), DdpError>;
}

/// Opens transports to a server URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, DdpError>;
}
