//! JSON codec for DDP envelopes.
//!
//! Provides serialization (`encode`) and deserialization (`decode`) of
//! [`Envelope`] to/from the JSON text frames DDP servers speak.

use serde_json::Value;

use crate::protocol::Envelope;

/// Errors that can occur while decoding an inbound frame.
///
/// None of these are fatal to the connection: the read loop logs and drops
/// the offending frame.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("malformed JSON frame: {0}")]
    MalformedJson(#[source] serde_json::Error),

    /// The `msg` discriminator is missing or not one this client knows.
    #[error("unknown message type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnknownMessageType(Option<String>),

    /// The discriminator is known but the fields do not match its shape.
    #[error("invalid `{msg}` envelope: {source}")]
    InvalidEnvelope {
        msg: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Codec for the DDP JSON wire format.
///
/// This struct provides static methods to convert between [`Envelope`] and
/// text frames.
pub struct JsonCodec;

impl JsonCodec {
    /// Encodes an [`Envelope`] into a JSON text frame.
    ///
    /// The `msg` discriminator is always the first field of the object.
    ///
    /// # Errors
    ///
    /// Only fails if a payload value cannot be represented as JSON, which
    /// cannot happen for envelopes built from [`serde_json::Value`]s.
    pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
        serde_json::to_string(envelope)
    }

    /// Decodes a JSON text frame into an [`Envelope`].
    ///
    /// # Errors
    ///
    /// [`DecodeError::MalformedJson`] when the text is not JSON,
    /// [`DecodeError::UnknownMessageType`] when `msg` is absent or
    /// unrecognised, [`DecodeError::InvalidEnvelope`] when required fields
    /// are missing.
    pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::MalformedJson)?;

        // Check the discriminator first so unknown kinds are told apart from
        // known kinds with broken fields.
        let msg = match value.get("msg").and_then(Value::as_str) {
            Some(msg) if Envelope::KINDS.contains(&msg) => msg.to_owned(),
            other => return Err(DecodeError::UnknownMessageType(other.map(str::to_owned))),
        };

        serde_json::from_value(value).map_err(|source| DecodeError::InvalidEnvelope { msg, source })
    }
}
