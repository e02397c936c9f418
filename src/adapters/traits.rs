//! External collaborator seams
//!
//! The server treats registry lookups, market data, and payment settlement
//! as injected collaborators. Calls into these are suspension points; no
//! handler holds a registry entry open across them.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::messages::{AgentInfo, DiscoverFilters, MarketUpdate, PaymentRequest};

/// On-chain agent directory. Results are merged into discovery scans next to
/// locally-connected agents.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn lookup_agents(&self, filters: &DiscoverFilters) -> Result<Vec<AgentInfo>>;
}

/// Price/volume snapshots for subscribed markets. The fan-out pump polls this
/// and pushes updates to subscribers.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self, market_id: &str) -> Result<MarketUpdate>;
}

/// Settles a payment request against the receipt's transaction hash.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn settle(&self, request: &PaymentRequest, tx_hash: &str) -> Result<()>;
}
