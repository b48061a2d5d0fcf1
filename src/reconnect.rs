//! Caller-side reconnection with exponential backoff.
//!
//! The connection state machine never retries on its own. Applications that
//! want to keep a session alive apply a [`ReconnectPolicy`] here, where every
//! attempt is an ordinary [`DdpSession::connect`] and every transition stays
//! observable through [`DdpSession::state_changes`].

use std::time::Duration;

use tracing::warn;

use crate::{connection::ConnectionState, error::DdpError, session::DdpSession};

/// The maximum number of reconnect attempts before giving up, by default.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff schedule for [`connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Connects, retrying failed attempts according to `policy`.
///
/// Returns the first successful state, or the last error once
/// `policy.max_attempts` retries are exhausted.
///
/// # Example
///
/// ```no_run
/// use ddp_client::{DdpSession, ReconnectPolicy, SessionConfig, connect_with_retry};
///
/// # async fn example() -> Result<(), ddp_client::DdpError> {
/// let session = DdpSession::websocket(SessionConfig::default());
/// connect_with_retry(&session, "wss://nas.local/websocket", None, ReconnectPolicy::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect_with_retry(
    session: &DdpSession,
    url: &str,
    session_id: Option<String>,
    policy: ReconnectPolicy,
) -> Result<ConnectionState, DdpError> {
    let mut attempts = 0;
    loop {
        match session.connect(url, session_id.clone()).await {
            Ok(state) => return Ok(state),
            // Retrying cannot fix a malformed URL, and a cancelled attempt
            // was meant to stop.
            Err(
                e @ (DdpError::UrlParse(_)
                | DdpError::UnsupportedScheme(_)
                | DdpError::ConnectCancelled),
            ) => return Err(e),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    return Err(e);
                }

                let delay = policy.delay(attempts);
                warn!(
                    "Connection attempt {} failed ({}), retrying in {:?}",
                    attempts + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
        }
    }
}
