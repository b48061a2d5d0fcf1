//! WebSocket transport backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest},
};
use tracing::debug;
use url::Url;

use crate::{
    error::DdpError,
    transport::{Connector, Transport},
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Maps an appliance URL to the WebSocket URL to dial.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` URLs are kept
/// as they are. The fragment is dropped, path and query are preserved.
///
/// # Example
///
/// ```
/// use ddp_client::transport::websocket_url;
/// use url::Url;
///
/// let url = Url::parse("https://nas.local/websocket").unwrap();
/// assert_eq!(websocket_url(&url).unwrap().as_str(), "wss://nas.local/websocket");
/// ```
pub fn websocket_url(url: &Url) -> Result<Url, DdpError> {
    let ws_scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(DdpError::UnsupportedScheme(other.to_string())),
    };

    let mut ws_url = url.clone();
    ws_url.set_fragment(None);
    if ws_url.scheme() != ws_scheme {
        // Switching between special schemes always succeeds.
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|()| DdpError::UnsupportedScheme(url.scheme().to_string()))?;
    }
    Ok(ws_url)
}

/// Opens [`WebSocketTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, DdpError> {
        let ws_url = websocket_url(url)?;
        debug!("WebSocket URL: {}", ws_url);

        let request = ws_url.as_str().into_client_request()?;
        let (ws_stream, response) = connect_async(request).await?;
        debug!("WebSocket upgrade complete (HTTP {})", response.status());

        Ok(Box::new(WebSocketTransport { ws_stream }))
    }
}

/// A DDP text channel over a WebSocket stream.
///
/// Transport-level Ping frames are answered by tungstenite itself on the
/// next write or flush; only Text frames reach the session.
pub struct WebSocketTransport {
    ws_stream: WsStream,
}

impl WebSocketTransport {
    pub fn new(ws_stream: WsStream) -> Self {
        Self { ws_stream }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), DdpError> {
        self.ws_stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, DdpError>> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => {
                    // DDP is a text protocol.
                    debug!("Skipping binary frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(close_frame))) => {
                    let reason = close_frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    debug!("WebSocket closed by peer: {}", reason);
                    return None;
                }
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))
                | None => return None,
                Some(Err(e)) => return Some(Err(DdpError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), DdpError> {
        match self.ws_stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(DdpError::WebSocket(e)),
        }
    }
}
