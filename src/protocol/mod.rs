//! DDP protocol implementation.
//!
//! This module provides the wire envelopes of the Distributed Data Protocol
//! and the JSON codec that turns them into text frames and back.

mod codec;
mod envelope;

pub use codec::{DecodeError, JsonCodec};
pub use envelope::{Envelope, ErrorPayload};

/// Protocol version offered first in the `connect` envelope.
pub const DEFAULT_VERSION: &str = "1";

/// Versions offered in the `connect` envelope, most preferred first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];
