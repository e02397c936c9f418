//! A2A message definitions
//!
//! Typed params and results for every `a2a.*` method, plus the shared domain
//! records (coalitions, analyses, payments). Everything here crosses the wire
//! as camelCase JSON; the structs are the single source of truth for what a
//! well-formed request looks like, so malformed params fail at the dispatch
//! boundary instead of deep inside a handler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names dispatched by the router.
pub mod methods {
    pub const HANDSHAKE: &str = "a2a.handshake";
    pub const DISCOVER: &str = "a2a.discover";
    pub const SUBSCRIBE_MARKET: &str = "a2a.subscribeMarket";
    pub const UNSUBSCRIBE_MARKET: &str = "a2a.unsubscribeMarket";
    pub const PROPOSE_COALITION: &str = "a2a.proposeCoalition";
    pub const JOIN_COALITION: &str = "a2a.joinCoalition";
    pub const LEAVE_COALITION: &str = "a2a.leaveCoalition";
    pub const DISBAND_COALITION: &str = "a2a.disbandCoalition";
    pub const SHARE_ANALYSIS: &str = "a2a.shareAnalysis";
    pub const REQUEST_ANALYSIS: &str = "a2a.requestAnalysis";
    pub const PAYMENT_REQUEST: &str = "a2a.paymentRequest";
    pub const PAYMENT_RECEIPT: &str = "a2a.paymentReceipt";
    pub const PING: &str = "a2a.ping";
}

/// Notification names pushed by the server.
pub mod notifications {
    pub const MARKET_UPDATE: &str = "a2a.marketUpdate";
    pub const ANALYSIS_SHARED: &str = "a2a.analysisShared";
    pub const ANALYSIS_REQUESTED: &str = "a2a.analysisRequested";
    pub const COALITION_UPDATED: &str = "a2a.coalitionUpdated";
    pub const PAYMENT_REQUESTED: &str = "a2a.paymentRequested";
    pub const PAYMENT_CONFIRMED: &str = "a2a.paymentConfirmed";
}

/// Ephemeral handshake credentials. Submitted once, verified, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredentials {
    /// Wallet address (0x-prefixed hex)
    pub address: String,
    /// Registry token id the agent claims to hold
    pub token_id: String,
    /// EIP-191 signature over the canonical challenge string
    pub signature: String,
    /// Unix milliseconds at signing time
    pub timestamp: i64,
}

/// Capabilities declared at handshake, immutable for the connection lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub markets: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub address: String,
    pub token_id: String,
    pub signature: String,
    pub timestamp: i64,
    #[serde(default)]
    pub capabilities: Option<AgentCapabilities>,
}

impl HandshakeParams {
    pub fn credentials(&self) -> AgentCredentials {
        AgentCredentials {
            address: self.address.clone(),
            token_id: self.token_id.clone(),
            signature: self.signature.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// What the server advertises back in a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    pub version: String,
    pub coalitions: bool,
    pub x402: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    pub agent_id: String,
    pub session_token: String,
    pub server_capabilities: ServerCapabilities,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverFilters {
    #[serde(default)]
    pub strategies: Option<Vec<String>>,
    #[serde(default)]
    pub markets: Option<Vec<String>>,
    #[serde(default)]
    pub min_reputation: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverParams {
    #[serde(default)]
    pub filters: Option<DiscoverFilters>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One row of a discovery result: a currently-connected agent or a
/// registry-listed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub address: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub reputation: Option<f64>,
    /// Whether the agent holds a live connection to this server
    pub connected: bool,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub agents: Vec<AgentInfo>,
    /// Count before `limit` truncation
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketParams {
    pub market_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeCoalitionParams {
    pub name: String,
    pub target_market: String,
    pub strategy: String,
    pub min_members: usize,
    pub max_members: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalitionIdParams {
    pub coalition_id: String,
}

/// An ad-hoc group of agents coordinating around one market and strategy.
///
/// Never hard-deleted: `active` drops to false when the last member leaves or
/// the coalition is disbanded. The `min_members <= members <= max_members`
/// band is enforced at creation only; later joins and leaves may transiently
/// violate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coalition {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub strategy: String,
    pub target_market: String,
    pub min_members: usize,
    pub max_members: usize,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Analyst-submitted prediction for a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSubmission {
    pub market_id: String,
    /// Probability estimate in [0, 1]
    pub prediction: f64,
    /// Analyst confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub data_points: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareAnalysisParams {
    pub analysis: AnalysisSubmission,
}

/// A stored/broadcast analysis. Retained in memory for the process lifetime
/// only; durability is a datastore concern this server does not own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub analysis_id: String,
    pub market_id: String,
    /// Agent id of the submitting analyst
    pub analyst: String,
    pub prediction: f64,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub data_points: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAnalysisParams {
    pub market_id: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_offer: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequestParams {
    /// Target agent id
    pub to: String,
    pub amount: Decimal,
    /// Service the payment is for (e.g., "analysis")
    pub service: String,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
}

/// An open micropayment request between two agents (the x402 pattern).
/// Settlement is delegated to an external payment collaborator; this record
/// only correlates the request with its eventual receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub request_id: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub service: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceiptParams {
    pub request_id: String,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub request_id: String,
    pub tx_hash: String,
    pub confirmed: bool,
}

/// Price/volume snapshot pushed to market subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketUpdate {
    pub market_id: String,
    #[serde(default)]
    pub yes_price: Option<Decimal>,
    #[serde(default)]
    pub no_price: Option<Decimal>,
    #[serde(default)]
    pub volume_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}
