//! Async client for the Distributed Data Protocol (DDP).
//!
//! This crate implements the client side of DDP, the JSON-over-WebSocket
//! protocol that multiplexes remote method calls and live data subscriptions
//! over one connection. It is used to talk to NAS management APIs that speak
//! DDP, but knows nothing about any particular API surface.
//!
//! # Quick start
//!
//! ```rust
//! use ddp_client::protocol::{Envelope, JsonCodec};
//!
//! let frame = Envelope::Method {
//!     method: "system.boot_id".into(),
//!     params: vec![],
//!     id: "1".into(),
//! };
//! let text = JsonCodec::encode(&frame).unwrap();
//! assert_eq!(JsonCodec::decode(&text).unwrap(), frame);
//! ```
//!
//! For connecting and calling methods, see [`DdpSession`].

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use connection::{ConnectionState, Subscription, SubscriptionEvent};
pub use error::{DdpError, MethodCallError};
pub use protocol::{DecodeError, Envelope, JsonCodec};
pub use reconnect::{ReconnectPolicy, connect_with_retry};
pub use session::DdpSession;
