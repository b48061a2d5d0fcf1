//! DDP protocol envelopes.
//!
//! This module defines the [`Envelope`] enum that represents every message
//! kind the client sends or understands. On the wire each envelope is a JSON
//! object whose `msg` field is the discriminator, e.g.
//! `{"msg":"method","method":"system.info","params":[],"id":"1"}`.
//!
//! Payloads (`params`, `result`, document `fields`) are kept as opaque
//! [`serde_json::Value`]s; they are only turned into typed values at the
//! session boundary.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A DDP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Envelope {
    /// Client → server handshake request.
    ///
    /// Example: `{"msg":"connect","version":"1","support":["1","pre2","pre1"]}`
    Connect {
        /// Proposed protocol version.
        version: String,
        /// All versions the client can speak, most preferred first.
        support: Vec<String>,
        /// Session id of a previous connection to resume.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },

    /// Server → client handshake acceptance.
    Connected {
        /// Server-assigned session id.
        session: String,
    },

    /// Server → client handshake rejection.
    Failed {
        /// Version the server suggests instead.
        version: String,
    },

    /// Client → server remote method call.
    Method {
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        id: String,
    },

    /// Server → client outcome of a method call.
    ///
    /// At most one of `result` or `error` is present. A missing result is
    /// `None`; an explicit `null` is `Some(Value::Null)`.
    Result {
        id: String,
        #[serde(
            default,
            deserialize_with = "present_value",
            skip_serializing_if = "Option::is_none"
        )]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// Server → client notice that the writes of the listed methods are
    /// reflected in the data the client sees.
    Updated {
        #[serde(default)]
        methods: Vec<String>,
    },

    /// Server → client protocol-level complaint about a message it could
    /// not process.
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            deserialize_with = "present_value",
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },

    /// Heartbeat request. Either side may send it.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Heartbeat reply, echoing the ping id if there was one.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Client → server subscription request.
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    /// Client → server subscription cancellation.
    Unsub { id: String },

    /// Server → client: the listed subscriptions have sent their initial data.
    Ready { subs: Vec<String> },

    /// A document was added to a collection.
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
    },

    /// Fields of a document changed.
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },

    /// A document was removed from a collection.
    Removed { collection: String, id: String },

    /// Server → client: a subscription ended, or never started.
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

impl Envelope {
    /// Every `msg` discriminator this implementation understands.
    pub const KINDS: [&'static str; 16] = [
        "connect",
        "connected",
        "failed",
        "method",
        "result",
        "updated",
        "error",
        "ping",
        "pong",
        "sub",
        "unsub",
        "ready",
        "added",
        "changed",
        "removed",
        "nosub",
    ];

    /// The `msg` discriminator of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Method { .. } => "method",
            Self::Result { .. } => "result",
            Self::Updated { .. } => "updated",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Sub { .. } => "sub",
            Self::Unsub { .. } => "unsub",
            Self::Ready { .. } => "ready",
            Self::Added { .. } => "added",
            Self::Changed { .. } => "changed",
            Self::Removed { .. } => "removed",
            Self::Nosub { .. } => "nosub",
        }
    }
}

/// Error object carried by `result` and `nosub` envelopes.
///
/// Servers disagree on the type of `error`: Meteor sends strings or HTTP-like
/// numbers, middleware servers often send an errno. Both are normalised to a
/// string code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "error", deserialize_with = "code_from_wire")]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            code: code.into(),
            reason,
            message: None,
            error_type: None,
            details: None,
        }
    }
}

fn code_from_wire<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(code) => code,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// A field that is present on the wire, `null` included, is `Some`.
/// Absent fields fall back to `None` through `#[serde(default)]`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
