//! In-memory registries shared across connections
//!
//! All state here is process-local. Mutations are synchronous map operations
//! with no await between check and write, which serializes them against the
//! interleaving of connection tasks. Each registry is injected into the
//! router at construction; there is no ambient global state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::jsonrpc::JsonRpcNotification;
use crate::protocol::messages::{
    AgentCapabilities, AgentInfo, AnalysisRecord, Coalition, PaymentRequest,
};

/// Sender half of a connection's outbound frame channel. The writer task on
/// the other end owns the socket sink.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// A registered, authenticated connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub agent_id: String,
    pub address: String,
    pub token_id: String,
    pub capabilities: AgentCapabilities,
    pub connected_at: DateTime<Utc>,
    outbound: OutboundSender,
}

impl ConnectionHandle {
    pub fn new(
        agent_id: String,
        address: String,
        token_id: String,
        capabilities: AgentCapabilities,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            agent_id,
            address,
            token_id,
            capabilities,
            connected_at: Utc::now(),
            outbound,
        }
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id.clone(),
            address: self.address.clone(),
            capabilities: self.capabilities.clone(),
            reputation: None,
            connected: true,
            connected_at: Some(self.connected_at),
        }
    }
}

/// Global `agent_id -> socket` map.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.inner.insert(handle.agent_id.clone(), handle);
    }

    pub fn remove(&self, agent_id: &str) -> Option<ConnectionHandle> {
        self.inner.remove(agent_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.inner.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Push a notification to one agent. Returns false when the agent is not
    /// connected or its channel is gone; the reader task's close path does
    /// the actual cleanup.
    pub fn notify(&self, agent_id: &str, notification: &JsonRpcNotification) -> bool {
        let Some(handle) = self.inner.get(agent_id) else {
            return false;
        };
        let frame = match serde_json::to_string(notification) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize notification {}: {}", notification.method, e);
                return false;
            }
        };
        if handle.outbound.send(Message::Text(frame)).is_err() {
            debug!(agent_id, "Dropping notification for closed connection");
            return false;
        }
        true
    }

    /// Fan a notification out to a set of agents. Returns the delivered count.
    pub fn notify_many<'a>(
        &self,
        agent_ids: impl IntoIterator<Item = &'a str>,
        notification: &JsonRpcNotification,
    ) -> usize {
        agent_ids
            .into_iter()
            .filter(|agent_id| self.notify(agent_id, notification))
            .count()
    }

    /// Fan a notification out to every connection except `exclude`.
    pub fn broadcast_except(&self, exclude: &str, notification: &JsonRpcNotification) -> usize {
        let targets: Vec<String> = self
            .inner
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|agent_id| agent_id != exclude)
            .collect();
        self.notify_many(targets.iter().map(String::as_str), notification)
    }

    /// Snapshot of every connected agent for discovery scans.
    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.inner.iter().map(|entry| entry.value().info()).collect()
    }
}

/// Many-to-many `(market_id, agent_id)` subscription relation.
#[derive(Default)]
pub struct SubscriptionRegistry {
    markets: DashMap<String, HashMap<String, DateTime<Utc>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-subscribing keeps the original timestamp.
    pub fn subscribe(&self, market_id: &str, agent_id: &str) {
        self.markets
            .entry(market_id.to_string())
            .or_default()
            .entry(agent_id.to_string())
            .or_insert_with(Utc::now);
    }

    pub fn unsubscribe(&self, market_id: &str, agent_id: &str) -> bool {
        let Some(mut subscribers) = self.markets.get_mut(market_id) else {
            return false;
        };
        subscribers.remove(agent_id).is_some()
    }

    /// Current subscriber list; empty (never null) for unknown markets.
    pub fn subscribers(&self, market_id: &str) -> Vec<String> {
        self.markets
            .get(market_id)
            .map(|subscribers| subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Markets with at least one subscriber, for the market-data pump.
    pub fn active_markets(&self) -> Vec<String> {
        self.markets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every subscription held by a disconnecting agent.
    pub fn remove_agent(&self, agent_id: &str) -> usize {
        let mut removed = 0;
        for mut entry in self.markets.iter_mut() {
            if entry.value_mut().remove(agent_id).is_some() {
                removed += 1;
            }
        }
        self.markets.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoalitionError {
    #[error("Coalition not found: {0}")]
    NotFound(String),
    #[error("Agent {agent_id} is not a member of coalition {coalition_id}")]
    NotAMember {
        coalition_id: String,
        agent_id: String,
    },
}

/// Coalition records. Never hard-deleted: disband and last-leave flip
/// `active` to false, keeping the history inspectable.
#[derive(Default)]
pub struct CoalitionRegistry {
    inner: DashMap<String, Coalition>,
}

impl CoalitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a coalition with the proposer as its first member.
    pub fn create(
        &self,
        proposer: &str,
        name: String,
        target_market: String,
        strategy: String,
        min_members: usize,
        max_members: usize,
    ) -> Coalition {
        let coalition = Coalition {
            id: Uuid::new_v4().to_string(),
            name,
            members: vec![proposer.to_string()],
            strategy,
            target_market,
            min_members,
            max_members,
            created_at: Utc::now(),
            active: true,
        };
        self.inner
            .insert(coalition.id.clone(), coalition.clone());
        coalition
    }

    pub fn get(&self, coalition_id: &str) -> Option<Coalition> {
        self.inner.get(coalition_id).map(|c| c.value().clone())
    }

    /// Append a member (dedup). The size band is a creation-time constraint
    /// only, so joins past `max_members` are accepted.
    pub fn join(&self, coalition_id: &str, agent_id: &str) -> Result<Coalition, CoalitionError> {
        let mut entry = self
            .inner
            .get_mut(coalition_id)
            .ok_or_else(|| CoalitionError::NotFound(coalition_id.to_string()))?;
        if !entry.members.iter().any(|member| member == agent_id) {
            entry.members.push(agent_id.to_string());
        }
        Ok(entry.clone())
    }

    /// Remove a member; silently succeeds when the agent was never in it.
    /// Membership dropping to zero deactivates the coalition.
    pub fn leave(&self, coalition_id: &str, agent_id: &str) -> Option<Coalition> {
        let mut entry = self.inner.get_mut(coalition_id)?;
        entry.members.retain(|member| member != agent_id);
        if entry.members.is_empty() {
            entry.active = false;
        }
        Some(entry.clone())
    }

    /// Deactivate a coalition. Only members may disband.
    pub fn disband(&self, coalition_id: &str, agent_id: &str) -> Result<Coalition, CoalitionError> {
        let mut entry = self
            .inner
            .get_mut(coalition_id)
            .ok_or_else(|| CoalitionError::NotFound(coalition_id.to_string()))?;
        if !entry.members.iter().any(|member| member == agent_id) {
            return Err(CoalitionError::NotAMember {
                coalition_id: coalition_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        entry.active = false;
        Ok(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Analysis retention window.
const ANALYSIS_TTL_MINUTES: i64 = 60;

/// Maximum stored analyses (prevent unbounded growth).
const MAX_ANALYSES: usize = 10_000;

/// Broadcast analyses, retained in memory for a bounded window so newly
/// interested agents can be served recent history. Durability belongs to an
/// external datastore, not this server.
pub struct AnalysisStore {
    inner: DashMap<String, AnalysisRecord>,
    max_size: usize,
    ttl: Duration,
}

impl Default for AnalysisStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            max_size: MAX_ANALYSES,
            ttl: Duration::minutes(ANALYSIS_TTL_MINUTES),
        }
    }

    fn is_stale(&self, record: &AnalysisRecord) -> bool {
        Utc::now() - record.timestamp > self.ttl
    }

    pub fn insert(&self, record: AnalysisRecord) {
        if self.inner.len() >= self.max_size {
            self.cleanup_stale();
        }
        self.inner.insert(record.analysis_id.clone(), record);
    }

    pub fn get(&self, analysis_id: &str) -> Option<AnalysisRecord> {
        self.inner
            .get(analysis_id)
            .filter(|record| !self.is_stale(record))
            .map(|record| record.value().clone())
    }

    /// Non-stale analyses for one market, newest first.
    pub fn for_market(&self, market_id: &str) -> Vec<AnalysisRecord> {
        let mut records: Vec<AnalysisRecord> = self
            .inner
            .iter()
            .filter(|entry| entry.market_id == market_id && !self.is_stale(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    pub fn cleanup_stale(&self) -> usize {
        let before = self.inner.len();
        let cutoff = Utc::now() - self.ttl;
        self.inner.retain(|_, record| record.timestamp >= cutoff);
        before - self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentLedgerError {
    #[error("Unknown payment request: {0}")]
    Unknown(String),
    #[error("Payment request expired: {0}")]
    Expired(String),
}

/// Open micropayment requests awaiting their receipt.
#[derive(Default)]
pub struct PaymentLedger {
    open: DashMap<String, PaymentRequest>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, request: PaymentRequest) {
        self.open.insert(request.request_id.clone(), request);
    }

    pub fn get(&self, request_id: &str) -> Option<PaymentRequest> {
        self.open.get(request_id).map(|r| r.value().clone())
    }

    /// Close a request against its receipt. Unknown ids and expired requests
    /// are rejected; a successful settle removes the entry so a second
    /// receipt for the same id is rejected as unknown.
    pub fn settle(&self, request_id: &str) -> Result<PaymentRequest, PaymentLedgerError> {
        let Some(entry) = self.open.get(request_id) else {
            return Err(PaymentLedgerError::Unknown(request_id.to_string()));
        };
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.open.remove(request_id);
            return Err(PaymentLedgerError::Expired(request_id.to_string()));
        }
        drop(entry);
        self.open
            .remove(request_id)
            .map(|(_, request)| request)
            .ok_or_else(|| PaymentLedgerError::Unknown(request_id.to_string()))
    }

    pub fn cleanup_expired(&self) -> usize {
        let before = self.open.len();
        let now = Utc::now();
        self.open.retain(|_, request| request.expires_at > now);
        before - self.open.len()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

/// Bundle of every shared registry, built once and injected into the router.
#[derive(Clone)]
pub struct Registries {
    pub connections: Arc<ConnectionRegistry>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub coalitions: Arc<CoalitionRegistry>,
    pub analyses: Arc<AnalysisStore>,
    pub payments: Arc<PaymentLedger>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(ConnectionRegistry::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            coalitions: Arc::new(CoalitionRegistry::new()),
            analyses: Arc::new(AnalysisStore::new()),
            payments: Arc::new(PaymentLedger::new()),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
