//! Session configuration.

use std::time::Duration;

use crate::protocol::{DEFAULT_VERSION, SUPPORTED_VERSIONS};

/// Default bound on socket open plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default inbound silence after which the client pings the server.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Default inbound silence after which the connection is considered dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`DdpSession`](crate::DdpSession).
///
/// All fields have defaults; override them with the `with_*` setters.
///
/// # Example
///
/// ```
/// use ddp_client::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::default()
///     .with_call_timeout(Duration::from_secs(30))
///     .with_idle_timeout(None);
/// assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Protocol version proposed in the `connect` envelope.
    pub version: String,
    /// Protocol versions offered in the `connect` envelope.
    pub support: Vec<String>,
    /// Bound on socket open plus handshake.
    pub connect_timeout: Duration,
    /// Local deadline for a method reply. `None` waits until the reply or
    /// connection loss.
    pub call_timeout: Option<Duration>,
    /// Inbound silence after which a client `ping` is sent.
    pub ping_interval: Option<Duration>,
    /// Inbound silence after which the connection is torn down.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl SessionConfig {
    pub fn with_version(mut self, version: impl Into<String>, support: Vec<String>) -> Self {
        self.version = version.into();
        self.support = support;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}
