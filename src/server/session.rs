//! Per-connection session state
//!
//! One `ConnectionSession` is owned by the task driving a socket and lives
//! exactly as long as the connection. Everything here is mutated
//! synchronously from that single task; shared registries live elsewhere.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::protocol::messages::AgentCapabilities;

/// Rolling per-minute message counter.
///
/// The window resets when a full period has elapsed since it opened; within a
/// window, every call counts against the limit.
#[derive(Debug)]
pub struct RateWindow {
    limit: u32,
    count: u32,
    window_start: Instant,
    period: Duration,
}

impl RateWindow {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            count: 0,
            window_start: Instant::now(),
            period,
        }
    }

    /// Count one message; false when the window budget is exhausted.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.period {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

/// Connection lifecycle: every socket starts unauthenticated and either
/// completes a handshake or is closed by the auth timeout.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Assigned at handshake ("agent-" prefixed), absent before
    pub agent_id: Option<String>,
    pub address: Option<String>,
    pub token_id: Option<String>,
    pub session_token: Option<String>,
    /// Declared at handshake, immutable afterwards
    pub capabilities: AgentCapabilities,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_counter: u64,
    /// Markets this connection subscribed to, mirrored for disconnect cleanup
    pub subscriptions: HashSet<String>,
    pub peer: SocketAddr,
    rate: RateWindow,
}

impl ConnectionSession {
    pub fn new(peer: SocketAddr, message_rate_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            agent_id: None,
            address: None,
            token_id: None,
            session_token: None,
            capabilities: AgentCapabilities::default(),
            authenticated: false,
            connected_at: now,
            last_activity: now,
            request_counter: 0,
            subscriptions: HashSet::new(),
            peer,
            rate: RateWindow::per_minute(message_rate_limit),
        }
    }

    /// Record one inbound request; false when over the rate limit.
    pub fn note_request(&mut self) -> bool {
        self.last_activity = Utc::now();
        self.request_counter += 1;
        self.rate.allow()
    }

    /// Promote the connection after a successful handshake.
    pub fn promote(
        &mut self,
        agent_id: String,
        address: String,
        token_id: String,
        session_token: String,
        capabilities: AgentCapabilities,
    ) {
        self.agent_id = Some(agent_id);
        self.address = Some(address);
        self.token_id = Some(token_id);
        self.session_token = Some(session_token);
        self.capabilities = capabilities;
        self.authenticated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn test_rate_window_exhausts() {
        let mut window = RateWindow::per_minute(3);
        assert!(window.allow());
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());
        assert!(!window.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_resets_after_period() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(window.allow());
    }

    #[test]
    fn test_session_starts_unauthenticated() {
        let session = ConnectionSession::new(peer(), 10);
        assert!(!session.authenticated);
        assert!(session.agent_id.is_none());
        assert!(session.subscriptions.is_empty());
    }

    #[test]
    fn test_promote_sets_identity() {
        let mut session = ConnectionSession::new(peer(), 10);
        session.promote(
            "agent-1".to_string(),
            "0xabc".to_string(),
            "7".to_string(),
            "tok".to_string(),
            AgentCapabilities::default(),
        );
        assert!(session.authenticated);
        assert_eq!(session.agent_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_request_counter_increments() {
        let mut session = ConnectionSession::new(peer(), 10);
        session.note_request();
        session.note_request();
        assert_eq!(session.request_counter, 2);
    }
}
