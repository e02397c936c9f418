//! HTTP gateway adapter for the on-chain agent registry
//!
//! The registry contract itself is out of scope; deployments front it with a
//! small HTTP gateway exposing `GET /agents`. Rows are normalized into the
//! same `AgentInfo` shape discovery uses for locally-connected agents.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::adapters::traits::RegistryClient;
use crate::error::{ParleyError, Result};
use crate::protocol::messages::{AgentCapabilities, AgentInfo, DiscoverFilters};

/// One row as the gateway returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryRow {
    address: String,
    token_id: String,
    #[serde(default)]
    reputation: Option<f64>,
    #[serde(default)]
    strategies: Vec<String>,
    #[serde(default)]
    markets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryResponse {
    agents: Vec<RegistryRow>,
}

pub struct HttpRegistryClient {
    base_url: Url,
    client: Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ParleyError::Registry(format!("Invalid registry URL: {}", e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ParleyError::Http)?;
        Ok(Self { base_url, client })
    }

    fn agents_url(&self, filters: &DiscoverFilters) -> Result<Url> {
        let mut url = self
            .base_url
            .join("agents")
            .map_err(|e| ParleyError::Registry(format!("Invalid registry URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(strategies) = &filters.strategies {
                if !strategies.is_empty() {
                    query.append_pair("strategies", &strategies.join(","));
                }
            }
            if let Some(markets) = &filters.markets {
                if !markets.is_empty() {
                    query.append_pair("markets", &markets.join(","));
                }
            }
            if let Some(min_reputation) = filters.min_reputation {
                query.append_pair("minReputation", &min_reputation.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn lookup_agents(&self, filters: &DiscoverFilters) -> Result<Vec<AgentInfo>> {
        let url = self.agents_url(filters)?;
        debug!(%url, "Querying agent registry");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "Registry lookup failed");
            return Err(ParleyError::Registry(format!(
                "Registry returned status {}",
                response.status()
            )));
        }

        let body: RegistryResponse = response.json().await?;
        Ok(body
            .agents
            .into_iter()
            .map(|row| AgentInfo {
                // Registry-listed agents have no live connection here; use
                // the on-chain identity as a stable id.
                agent_id: format!("registry-{}-{}", row.address, row.token_id),
                address: row.address,
                capabilities: AgentCapabilities {
                    strategies: row.strategies,
                    markets: row.markets,
                    actions: Vec::new(),
                    version: None,
                },
                reputation: row.reputation,
                connected: false,
                connected_at: None,
            })
            .collect())
    }
}
