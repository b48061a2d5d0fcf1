use serde_json::Value;
use thiserror::Error;

use crate::protocol::ErrorPayload;

/// Errors that can occur in the DDP client.
#[derive(Error, Debug)]
pub enum DdpError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake rejected, server suggests protocol version {version}")]
    HandshakeRejected { version: String },

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Connection closed during handshake")]
    HandshakeClosed,

    #[error("Connection attempt cancelled by disconnect")]
    ConnectCancelled,

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Method(#[from] MethodCallError),

    #[error("Failed to encode parameters: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Failure of a single remote method call or subscription.
///
/// Only the caller that issued the call sees this error; other pending
/// calls and the connection itself are unaffected unless the variant is
/// [`MethodCallError::ConnectionLost`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MethodCallError {
    /// The server answered with an error object.
    #[error("{}", server_message(.code, .reason))]
    Server {
        code: String,
        reason: Option<String>,
        details: Option<Value>,
    },

    /// The connection went away before the server answered.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No answer arrived within the configured call timeout.
    #[error("method call timed out")]
    Timeout,
}

impl MethodCallError {
    /// Server-supplied error code, if the server produced this error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Server-supplied human readable reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Server { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

impl From<ErrorPayload> for MethodCallError {
    fn from(payload: ErrorPayload) -> Self {
        Self::Server {
            code: payload.code,
            reason: payload.reason.or(payload.message),
            details: payload.details,
        }
    }
}

fn server_message(code: &str, reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("server error {code}: {reason}"),
        None => format!("server error {code}"),
    }
}
