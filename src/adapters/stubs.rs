//! In-process collaborator implementations
//!
//! Used by tests and the demo CLI; production deployments inject real
//! adapters at server construction.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use crate::adapters::traits::{MarketDataProvider, PaymentProcessor, RegistryClient};
use crate::error::{ParleyError, Result};
use crate::protocol::messages::{AgentInfo, DiscoverFilters, MarketUpdate, PaymentRequest};

/// Serves discovery results from a fixed list.
#[derive(Default)]
pub struct StaticRegistryClient {
    agents: Vec<AgentInfo>,
}

impl StaticRegistryClient {
    pub fn new(agents: Vec<AgentInfo>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl RegistryClient for StaticRegistryClient {
    async fn lookup_agents(&self, _filters: &DiscoverFilters) -> Result<Vec<AgentInfo>> {
        Ok(self.agents.clone())
    }
}

/// Market snapshots backed by a settable map. A snapshot for a market nobody
/// published is an error, mirroring a provider that has no feed for it.
#[derive(Default)]
pub struct StaticMarketData {
    snapshots: DashMap<String, MarketUpdate>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, update: MarketUpdate) {
        self.snapshots.insert(update.market_id.clone(), update);
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketData {
    async fn snapshot(&self, market_id: &str) -> Result<MarketUpdate> {
        self.snapshots
            .get(market_id)
            .map(|update| {
                let mut update = update.value().clone();
                update.timestamp = Utc::now();
                update
            })
            .ok_or_else(|| {
                ParleyError::Internal(format!("No market data available for {}", market_id))
            })
    }
}

/// Accepts every receipt without touching a chain. Logs the settlement so
/// demo runs show the flow end to end.
#[derive(Default)]
pub struct NoopPaymentProcessor;

impl NoopPaymentProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PaymentProcessor for NoopPaymentProcessor {
    async fn settle(&self, request: &PaymentRequest, tx_hash: &str) -> Result<()> {
        info!(
            request_id = %request.request_id,
            amount = %request.amount,
            tx_hash,
            "Settled payment (noop processor)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_market_data_roundtrip() {
        let provider = StaticMarketData::new();
        provider.publish(MarketUpdate {
            market_id: "market-123".to_string(),
            yes_price: Some(dec!(0.62)),
            no_price: Some(dec!(0.39)),
            volume_24h: None,
            timestamp: Utc::now(),
        });

        let snap = provider.snapshot("market-123").await.unwrap();
        assert_eq!(snap.yes_price, Some(dec!(0.62)));
        assert!(provider.snapshot("unknown").await.is_err());
    }
}
