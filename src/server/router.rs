//! JSON-RPC method dispatch
//!
//! `route` always returns a response object so the connection task can
//! serialize uniformly; handler failures become protocol error codes, never
//! panics. Registry mutations inside handlers are synchronous; the only
//! awaits are calls into external collaborators.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::traits::{PaymentProcessor, RegistryClient};
use crate::auth::AuthManager;
use crate::config::ServerConfig;
use crate::protocol::jsonrpc::{ErrorCode, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::protocol::messages::{
    methods, notifications, AgentInfo, AnalysisRecord, CoalitionIdParams, DiscoverFilters,
    DiscoverParams, DiscoverResult, HandshakeParams, HandshakeResult, MarketParams,
    PaymentReceipt, PaymentReceiptParams, PaymentRequest, PaymentRequestParams,
    ProposeCoalitionParams, RequestAnalysisParams, ServerCapabilities, ShareAnalysisParams,
};
use crate::server::events::{EventBus, ServerEvent};
use crate::server::registry::{
    CoalitionError, ConnectionHandle, OutboundSender, PaymentLedgerError, Registries,
};
use crate::server::session::ConnectionSession;

/// Default cap on discovery results when the caller sends no limit.
const DEFAULT_DISCOVER_LIMIT: usize = 50;

/// Default payment request lifetime when the caller sends no expiry.
const DEFAULT_PAYMENT_TTL_SECS: u64 = 3600;

/// Handler-level error: an error code plus human-readable message.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

type HandlerResult = Result<Value, RpcError>;

/// Dispatches incoming requests to their handlers using connection-scoped
/// session state and the shared registries injected at construction.
pub struct MessageRouter {
    auth: Arc<AuthManager>,
    registries: Registries,
    registry_client: Option<Arc<dyn RegistryClient>>,
    payment_processor: Option<Arc<dyn PaymentProcessor>>,
    events: EventBus,
    server_capabilities: ServerCapabilities,
}

impl MessageRouter {
    pub fn new(
        config: &ServerConfig,
        auth: Arc<AuthManager>,
        registries: Registries,
        registry_client: Option<Arc<dyn RegistryClient>>,
        payment_processor: Option<Arc<dyn PaymentProcessor>>,
        events: EventBus,
    ) -> Self {
        Self {
            auth,
            registries,
            registry_client,
            payment_processor,
            events,
            server_capabilities: ServerCapabilities {
                version: env!("CARGO_PKG_VERSION").to_string(),
                coalitions: config.enable_coalitions,
                x402: config.enable_x402,
            },
        }
    }

    /// Route one request to its handler and shape the outcome into a
    /// response. Internal failures surface as INTERNAL_ERROR, logged with
    /// method context.
    pub async fn route(
        &self,
        request: JsonRpcRequest,
        session: &mut ConnectionSession,
        outbound: &OutboundSender,
    ) -> JsonRpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);
        if !request.is_valid_version() {
            return JsonRpcResponse::error(
                id,
                ErrorCode::InvalidRequest,
                "Unsupported JSON-RPC version",
            );
        }

        let method = request.method.clone();
        match self.dispatch(&method, request.params, session, outbound).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                if e.code == ErrorCode::InternalError {
                    error!(method, peer = %session.peer, "Handler failed: {}", e.message);
                } else {
                    debug!(method, code = e.code.code(), "Request rejected: {}", e.message);
                }
                JsonRpcResponse::error(id, e.code, e.message)
            }
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        session: &mut ConnectionSession,
        outbound: &OutboundSender,
    ) -> HandlerResult {
        match method {
            methods::HANDSHAKE => self.handle_handshake(params, session, outbound).await,
            methods::DISCOVER => {
                self.require_auth(session)?;
                self.handle_discover(params).await
            }
            methods::SUBSCRIBE_MARKET => {
                let agent_id = self.require_auth(session)?;
                self.handle_subscribe(params, &agent_id, session)
            }
            methods::UNSUBSCRIBE_MARKET => {
                let agent_id = self.require_auth(session)?;
                self.handle_unsubscribe(params, &agent_id, session)
            }
            methods::PROPOSE_COALITION => {
                let agent_id = self.require_auth(session)?;
                self.require_coalitions()?;
                self.handle_propose_coalition(params, &agent_id)
            }
            methods::JOIN_COALITION => {
                let agent_id = self.require_auth(session)?;
                self.require_coalitions()?;
                self.handle_join_coalition(params, &agent_id)
            }
            methods::LEAVE_COALITION => {
                let agent_id = self.require_auth(session)?;
                self.require_coalitions()?;
                self.handle_leave_coalition(params, &agent_id)
            }
            methods::DISBAND_COALITION => {
                let agent_id = self.require_auth(session)?;
                self.require_coalitions()?;
                self.handle_disband_coalition(params, &agent_id)
            }
            methods::SHARE_ANALYSIS => {
                let agent_id = self.require_auth(session)?;
                self.handle_share_analysis(params, &agent_id)
            }
            methods::REQUEST_ANALYSIS => {
                let agent_id = self.require_auth(session)?;
                self.handle_request_analysis(params, &agent_id)
            }
            methods::PAYMENT_REQUEST => {
                let agent_id = self.require_auth(session)?;
                self.require_x402()?;
                self.handle_payment_request(params, &agent_id)
            }
            methods::PAYMENT_RECEIPT => {
                let agent_id = self.require_auth(session)?;
                self.require_x402()?;
                self.handle_payment_receipt(params, &agent_id).await
            }
            methods::PING => {
                self.require_auth(session)?;
                Ok(json!({"pong": true, "now": Utc::now()}))
            }
            _ => Err(RpcError::new(
                ErrorCode::MethodNotFound,
                format!("Method not found: {method}"),
            )),
        }
    }

    fn require_auth(&self, session: &ConnectionSession) -> Result<String, RpcError> {
        if !session.authenticated {
            return Err(RpcError::new(
                ErrorCode::NotAuthenticated,
                "Not authenticated",
            ));
        }
        session
            .agent_id
            .clone()
            .ok_or_else(|| RpcError::internal("Authenticated session without agent id"))
    }

    fn require_coalitions(&self) -> Result<(), RpcError> {
        if !self.server_capabilities.coalitions {
            return Err(RpcError::new(
                ErrorCode::Forbidden,
                "Coalitions are disabled on this server",
            ));
        }
        Ok(())
    }

    fn require_x402(&self) -> Result<(), RpcError> {
        if !self.server_capabilities.x402 {
            return Err(RpcError::new(
                ErrorCode::Forbidden,
                "x402 payments are disabled on this server",
            ));
        }
        Ok(())
    }

    /// Subscriber list for a market; empty, never null, for unknown markets.
    pub fn market_subscribers(&self, market_id: &str) -> Vec<String> {
        self.registries.subscriptions.subscribers(market_id)
    }

    async fn handle_handshake(
        &self,
        params: Option<Value>,
        session: &mut ConnectionSession,
        outbound: &OutboundSender,
    ) -> HandlerResult {
        if session.authenticated {
            return Err(RpcError::new(
                ErrorCode::InvalidRequest,
                "Already authenticated",
            ));
        }
        let params: HandshakeParams = parse_params(params)?;

        let outcome = self.auth.authenticate(&params.credentials());
        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "Authentication failed".to_string());
            let code = if message.contains("Invalid signature") {
                ErrorCode::InvalidSignature
            } else if message.contains("expired") {
                ErrorCode::ExpiredRequest
            } else {
                ErrorCode::AuthFailed
            };
            return Err(RpcError::new(code, message));
        }

        let session_token = outcome
            .session_token
            .ok_or_else(|| RpcError::internal("Authentication succeeded without a token"))?;
        let record = self
            .auth
            .get_session(&session_token)
            .ok_or_else(|| RpcError::internal("Freshly minted session not found"))?;

        let agent_id = format!("agent-{}", Uuid::new_v4());
        let capabilities = params.capabilities.clone().unwrap_or_default();

        session.promote(
            agent_id.clone(),
            params.address.clone(),
            params.token_id.clone(),
            session_token.clone(),
            capabilities.clone(),
        );
        self.registries.connections.register(ConnectionHandle::new(
            agent_id.clone(),
            params.address.clone(),
            params.token_id.clone(),
            capabilities,
            outbound.clone(),
        ));
        self.events.emit(ServerEvent::AgentConnected {
            agent_id: agent_id.clone(),
            address: params.address.clone(),
            token_id: params.token_id.clone(),
        });
        info!(agent_id, address = %params.address, "Agent authenticated");

        to_value(&HandshakeResult {
            agent_id,
            session_token,
            server_capabilities: self.server_capabilities.clone(),
            expires_at: record.expires_at,
        })
    }

    async fn handle_discover(&self, params: Option<Value>) -> HandlerResult {
        let params: DiscoverParams = parse_params(params)?;
        let filters = params.filters.unwrap_or_default();
        let limit = params.limit.unwrap_or(DEFAULT_DISCOVER_LIMIT);

        let mut agents = self.registries.connections.snapshot();
        // Registry rows for a wallet that also holds a live connection are
        // shadowed by the connection.
        let mut seen: std::collections::HashSet<String> = agents
            .iter()
            .map(|agent| agent.address.to_lowercase())
            .collect();

        // External registry is best-effort: a gateway outage must not take
        // discovery of live connections down with it.
        if let Some(registry) = &self.registry_client {
            match registry.lookup_agents(&filters).await {
                Ok(listed) => {
                    for agent in listed {
                        if seen.insert(agent.address.to_lowercase()) {
                            agents.push(agent);
                        }
                    }
                }
                Err(e) => warn!("Registry lookup failed, serving local agents only: {}", e),
            }
        }

        let filtered: Vec<AgentInfo> = agents
            .into_iter()
            .filter(|agent| matches_filters(agent, &filters))
            .collect();
        let total = filtered.len();
        let agents: Vec<AgentInfo> = filtered.into_iter().take(limit).collect();

        to_value(&DiscoverResult { agents, total })
    }

    fn handle_subscribe(
        &self,
        params: Option<Value>,
        agent_id: &str,
        session: &mut ConnectionSession,
    ) -> HandlerResult {
        let params: MarketParams = parse_params(params)?;
        self.registries
            .subscriptions
            .subscribe(&params.market_id, agent_id);
        session.subscriptions.insert(params.market_id.clone());
        debug!(agent_id, market_id = %params.market_id, "Market subscription added");
        Ok(json!({"subscribed": true, "marketId": params.market_id}))
    }

    fn handle_unsubscribe(
        &self,
        params: Option<Value>,
        agent_id: &str,
        session: &mut ConnectionSession,
    ) -> HandlerResult {
        let params: MarketParams = parse_params(params)?;
        self.registries
            .subscriptions
            .unsubscribe(&params.market_id, agent_id);
        session.subscriptions.remove(&params.market_id);
        Ok(json!({"unsubscribed": true, "marketId": params.market_id}))
    }

    fn handle_propose_coalition(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: ProposeCoalitionParams = parse_params(params)?;
        if params.min_members == 0 {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "minMembers must be at least 1",
            ));
        }
        if params.max_members < params.min_members {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "maxMembers must be >= minMembers",
            ));
        }

        let coalition = self.registries.coalitions.create(
            agent_id,
            params.name,
            params.target_market,
            params.strategy,
            params.min_members,
            params.max_members,
        );
        info!(agent_id, coalition_id = %coalition.id, name = %coalition.name, "Coalition proposed");
        Ok(json!({"coalitionId": coalition.id, "proposal": coalition}))
    }

    fn handle_join_coalition(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: CoalitionIdParams = parse_params(params)?;
        let coalition = self
            .registries
            .coalitions
            .join(&params.coalition_id, agent_id)
            .map_err(coalition_error)?;

        self.notify_members(
            &coalition.members,
            agent_id,
            json!({
                "event": "memberJoined",
                "coalitionId": coalition.id,
                "agentId": agent_id,
                "coalition": coalition,
            }),
        );
        Ok(json!({"joined": true, "coalition": coalition}))
    }

    fn handle_leave_coalition(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: CoalitionIdParams = parse_params(params)?;
        if let Some(coalition) = self
            .registries
            .coalitions
            .leave(&params.coalition_id, agent_id)
        {
            self.notify_members(
                &coalition.members,
                agent_id,
                json!({
                    "event": "memberLeft",
                    "coalitionId": coalition.id,
                    "agentId": agent_id,
                    "coalition": coalition,
                }),
            );
        }
        // Leaving a coalition you are not in (or that does not exist) is not
        // an error.
        Ok(json!({"left": true}))
    }

    fn handle_disband_coalition(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: CoalitionIdParams = parse_params(params)?;
        let coalition = self
            .registries
            .coalitions
            .disband(&params.coalition_id, agent_id)
            .map_err(coalition_error)?;

        self.notify_members(
            &coalition.members,
            agent_id,
            json!({
                "event": "disbanded",
                "coalitionId": coalition.id,
                "agentId": agent_id,
                "coalition": coalition,
            }),
        );
        info!(agent_id, coalition_id = %coalition.id, "Coalition disbanded");
        Ok(json!({"disbanded": true, "coalition": coalition}))
    }

    fn handle_share_analysis(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: ShareAnalysisParams = parse_params(params)?;
        let submission = params.analysis;
        if !(0.0..=1.0).contains(&submission.prediction) {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "prediction must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&submission.confidence) {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "confidence must be within [0, 1]",
            ));
        }

        let record = AnalysisRecord {
            analysis_id: Uuid::new_v4().to_string(),
            market_id: submission.market_id.clone(),
            analyst: agent_id.to_string(),
            prediction: submission.prediction,
            confidence: submission.confidence,
            reasoning: submission.reasoning,
            data_points: submission.data_points,
            timestamp: Utc::now(),
        };
        self.registries.analyses.insert(record.clone());

        let subscribers = self
            .registries
            .subscriptions
            .subscribers(&record.market_id);
        let note = JsonRpcNotification::new(
            notifications::ANALYSIS_SHARED,
            serde_json::to_value(&record).unwrap_or(Value::Null),
        );
        let delivered = self.registries.connections.notify_many(
            subscribers
                .iter()
                .map(String::as_str)
                .filter(|subscriber| *subscriber != agent_id),
            &note,
        );
        debug!(
            agent_id,
            market_id = %record.market_id,
            delivered,
            "Analysis shared"
        );
        Ok(json!({"shared": true, "analysisId": record.analysis_id}))
    }

    fn handle_request_analysis(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: RequestAnalysisParams = parse_params(params)?;
        let request_id = Uuid::new_v4().to_string();

        let note = JsonRpcNotification::new(
            notifications::ANALYSIS_REQUESTED,
            json!({
                "requestId": request_id,
                "marketId": params.market_id,
                "requestedBy": agent_id,
                "deadline": params.deadline,
                "paymentOffer": params.payment_offer,
            }),
        );
        let delivered = self.registries.connections.broadcast_except(agent_id, &note);
        debug!(agent_id, market_id = %params.market_id, delivered, "Analysis requested");
        Ok(json!({"requestId": request_id, "broadcasted": true}))
    }

    fn handle_payment_request(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: PaymentRequestParams = parse_params(params)?;
        if params.amount <= rust_decimal::Decimal::ZERO {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "amount must be positive",
            ));
        }
        if !self.registries.connections.contains(&params.to) {
            return Err(RpcError::new(
                ErrorCode::AgentNotFound,
                format!("Agent not connected: {}", params.to),
            ));
        }

        let ttl = params.expires_in_secs.unwrap_or(DEFAULT_PAYMENT_TTL_SECS);
        let request = PaymentRequest {
            request_id: Uuid::new_v4().to_string(),
            from: agent_id.to_string(),
            to: params.to.clone(),
            amount: params.amount,
            service: params.service,
            expires_at: Utc::now() + Duration::seconds(ttl as i64),
        };
        self.registries.payments.open(request.clone());

        let note = JsonRpcNotification::new(
            notifications::PAYMENT_REQUESTED,
            serde_json::to_value(&request).unwrap_or(Value::Null),
        );
        self.registries.connections.notify(&params.to, &note);
        info!(
            from = agent_id,
            to = %params.to,
            amount = %request.amount,
            request_id = %request.request_id,
            "Payment requested"
        );
        to_value(&request)
    }

    async fn handle_payment_receipt(&self, params: Option<Value>, agent_id: &str) -> HandlerResult {
        let params: PaymentReceiptParams = parse_params(params)?;

        let open = self
            .registries
            .payments
            .get(&params.request_id)
            .ok_or_else(|| {
                RpcError::new(
                    ErrorCode::PaymentFailed,
                    format!("Unknown payment request: {}", params.request_id),
                )
            })?;
        if open.to != agent_id {
            return Err(RpcError::new(
                ErrorCode::Forbidden,
                "Receipt must come from the agent the payment was requested of",
            ));
        }

        let request = self
            .registries
            .payments
            .settle(&params.request_id)
            .map_err(|e| match e {
                PaymentLedgerError::Unknown(id) => RpcError::new(
                    ErrorCode::PaymentFailed,
                    format!("Unknown payment request: {id}"),
                ),
                PaymentLedgerError::Expired(id) => RpcError::new(
                    ErrorCode::ExpiredRequest,
                    format!("Payment request expired: {id}"),
                ),
            })?;

        if let Some(processor) = &self.payment_processor {
            if let Err(e) = processor.settle(&request, &params.tx_hash).await {
                // Re-open so the payer can retry once the processor recovers.
                self.registries.payments.open(request);
                return Err(RpcError::new(
                    ErrorCode::PaymentFailed,
                    format!("Settlement failed: {e}"),
                ));
            }
        }

        let receipt = PaymentReceipt {
            request_id: request.request_id.clone(),
            tx_hash: params.tx_hash,
            confirmed: true,
        };
        let note = JsonRpcNotification::new(
            notifications::PAYMENT_CONFIRMED,
            serde_json::to_value(&receipt).unwrap_or(Value::Null),
        );
        self.registries.connections.notify(&request.from, &note);
        info!(request_id = %receipt.request_id, "Payment confirmed");
        to_value(&receipt)
    }

    /// Notify every coalition member except the acting agent.
    fn notify_members(&self, members: &[String], acting: &str, params: Value) {
        let note = JsonRpcNotification::new(notifications::COALITION_UPDATED, params);
        self.registries.connections.notify_many(
            members
                .iter()
                .map(String::as_str)
                .filter(|member| *member != acting),
            &note,
        );
    }
}

fn coalition_error(e: CoalitionError) -> RpcError {
    match e {
        CoalitionError::NotFound(id) => RpcError::new(
            ErrorCode::CoalitionNotFound,
            format!("Coalition not found: {id}"),
        ),
        CoalitionError::NotAMember { .. } => {
            RpcError::new(ErrorCode::Forbidden, e.to_string())
        }
    }
}

fn matches_filters(agent: &AgentInfo, filters: &DiscoverFilters) -> bool {
    if let Some(strategies) = &filters.strategies {
        if !strategies.is_empty()
            && !strategies
                .iter()
                .any(|wanted| agent.capabilities.strategies.contains(wanted))
        {
            return false;
        }
    }
    if let Some(markets) = &filters.markets {
        if !markets.is_empty()
            && !markets
                .iter()
                .any(|wanted| agent.capabilities.markets.contains(wanted))
        {
            return false;
        }
    }
    if let Some(min_reputation) = filters.min_reputation {
        if agent.reputation.unwrap_or(0.0) < min_reputation {
            return false;
        }
    }
    true
}

/// Absent params are treated as an empty object, so methods with all-optional
/// params accept a bare request and required fields produce a field-level
/// invalid-params message.
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(value) => value,
    };
    serde_json::from_value(value)
        .map_err(|e| RpcError::new(ErrorCode::InvalidParams, format!("Invalid params: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| RpcError::internal(format!("Serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::AgentCapabilities;
    use crate::signing::{sign_challenge, Wallet};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn test_router(config: ServerConfig) -> MessageRouter {
        MessageRouter::new(
            &config,
            Arc::new(AuthManager::new()),
            Registries::new(),
            None,
            None,
            EventBus::default(),
        )
    }

    fn test_session() -> ConnectionSession {
        ConnectionSession::new("127.0.0.1:9999".parse().unwrap(), 100)
    }

    fn outbound() -> (OutboundSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(1, method, Some(params))
    }

    async fn handshake(
        router: &MessageRouter,
        session: &mut ConnectionSession,
        out: &OutboundSender,
    ) -> String {
        let wallet = Wallet::random();
        let timestamp = Utc::now().timestamp_millis();
        let signature = sign_challenge(&wallet, "1", timestamp).await.unwrap();
        let response = router
            .route(
                request(
                    methods::HANDSHAKE,
                    json!({
                        "address": wallet.address_hex(),
                        "tokenId": "1",
                        "signature": signature,
                        "timestamp": timestamp,
                        "capabilities": AgentCapabilities {
                            strategies: vec!["momentum".to_string()],
                            ..Default::default()
                        },
                    }),
                ),
                session,
                out,
            )
            .await;
        assert!(response.is_success(), "handshake failed: {:?}", response.error);
        let result: HandshakeResult =
            serde_json::from_value(response.result.unwrap()).unwrap();
        result.agent_id
    }

    #[tokio::test]
    async fn test_unauthenticated_requests_are_gated() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();

        for method in [
            methods::DISCOVER,
            methods::SUBSCRIBE_MARKET,
            methods::PROPOSE_COALITION,
            methods::SHARE_ANALYSIS,
            methods::PAYMENT_REQUEST,
            methods::PING,
        ] {
            let response = router
                .route(request(method, json!({})), &mut session, &out)
                .await;
            let error = response.error.expect("expected error");
            assert_eq!(error.code, ErrorCode::NotAuthenticated.code(), "{method}");
            assert_eq!(error.message, "Not authenticated");
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();

        let response = router
            .route(request("a2a.noSuchThing", json!({})), &mut session, &out)
            .await;
        assert_eq!(
            response.error.unwrap().code,
            ErrorCode::MethodNotFound.code()
        );
    }

    #[tokio::test]
    async fn test_handshake_assigns_prefixed_agent_id() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();

        let agent_id = handshake(&router, &mut session, &out).await;
        assert!(agent_id.starts_with("agent-"));
        assert!(session.authenticated);
        assert!(router.registries.connections.contains(&agent_id));
    }

    #[tokio::test]
    async fn test_handshake_with_bad_signature() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();

        let signer = Wallet::random();
        let impostor = Wallet::random();
        let timestamp = Utc::now().timestamp_millis();
        let signature = sign_challenge(&signer, "1", timestamp).await.unwrap();

        let response = router
            .route(
                request(
                    methods::HANDSHAKE,
                    json!({
                        "address": impostor.address_hex(),
                        "tokenId": "1",
                        "signature": signature,
                        "timestamp": timestamp,
                    }),
                ),
                &mut session,
                &out,
            )
            .await;
        assert_eq!(
            response.error.unwrap().code,
            ErrorCode::InvalidSignature.code()
        );
        assert!(!session.authenticated);
    }

    #[tokio::test]
    async fn test_subscribe_and_subscriber_listing() {
        let router = test_router(ServerConfig::default());
        let (out_a, _rx_a) = outbound();
        let (out_b, _rx_b) = outbound();
        let mut session_a = test_session();
        let mut session_b = test_session();

        let agent_a = handshake(&router, &mut session_a, &out_a).await;
        let agent_b = handshake(&router, &mut session_b, &out_b).await;

        for (session, out) in [(&mut session_a, &out_a), (&mut session_b, &out_b)] {
            let response = router
                .route(
                    request(methods::SUBSCRIBE_MARKET, json!({"marketId": "market-123"})),
                    session,
                    out,
                )
                .await;
            let result = response.result.unwrap();
            assert_eq!(result["subscribed"], json!(true));
            assert_eq!(result["marketId"], json!("market-123"));
        }

        let mut subscribers = router.market_subscribers("market-123");
        subscribers.sort();
        let mut expected = vec![agent_a, agent_b];
        expected.sort();
        assert_eq!(subscribers, expected);
        assert!(router.market_subscribers("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_params_surface_as_invalid_params() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();
        handshake(&router, &mut session, &out).await;

        let response = router
            .route(request(methods::SUBSCRIBE_MARKET, json!({})), &mut session, &out)
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidParams.code());

        // Null params on a write-type method is also invalid params, not an
        // internal error.
        let response = router
            .route(
                JsonRpcRequest::new(2, methods::PAYMENT_REQUEST, Some(Value::Null)),
                &mut session,
                &out,
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidParams.code());
    }

    #[tokio::test]
    async fn test_coalition_flow() {
        let router = test_router(ServerConfig::default());
        let (out_a, _rx_a) = outbound();
        let (out_b, mut rx_b) = outbound();
        let mut session_a = test_session();
        let mut session_b = test_session();

        let agent_a = handshake(&router, &mut session_a, &out_a).await;
        let agent_b = handshake(&router, &mut session_b, &out_b).await;

        let response = router
            .route(
                request(
                    methods::PROPOSE_COALITION,
                    json!({
                        "name": "Alpha",
                        "targetMarket": "market-123",
                        "strategy": "momentum",
                        "minMembers": 2,
                        "maxMembers": 5,
                    }),
                ),
                &mut session_a,
                &out_a,
            )
            .await;
        let coalition_id = response.result.unwrap()["coalitionId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .route(
                request(methods::JOIN_COALITION, json!({"coalitionId": &coalition_id})),
                &mut session_b,
                &out_b,
            )
            .await;
        let coalition: crate::protocol::messages::Coalition =
            serde_json::from_value(response.result.unwrap()["coalition"].clone()).unwrap();
        assert!(coalition.members.contains(&agent_a));
        assert!(coalition.members.contains(&agent_b));

        let response = router
            .route(
                request(methods::LEAVE_COALITION, json!({"coalitionId": &coalition_id})),
                &mut session_a,
                &out_a,
            )
            .await;
        assert_eq!(response.result.unwrap()["left"], json!(true));
        let remaining = router
            .registries
            .coalitions
            .get(&coalition_id)
            .unwrap();
        assert!(!remaining.members.contains(&agent_a));

        // agent_b saw the join fan-out was not sent to itself but the leave
        // notification is delivered.
        let mut saw_member_left = false;
        while let Ok(message) = rx_b.try_recv() {
            if let Message::Text(text) = message {
                if text.contains("memberLeft") {
                    saw_member_left = true;
                }
            }
        }
        assert!(saw_member_left);
    }

    #[tokio::test]
    async fn test_join_unknown_coalition() {
        let router = test_router(ServerConfig::default());
        let mut session = test_session();
        let (out, _rx) = outbound();
        handshake(&router, &mut session, &out).await;

        let response = router
            .route(
                request(methods::JOIN_COALITION, json!({"coalitionId": "nope"})),
                &mut session,
                &out,
            )
            .await;
        assert_eq!(
            response.error.unwrap().code,
            ErrorCode::CoalitionNotFound.code()
        );
    }

    #[tokio::test]
    async fn test_coalitions_disabled_are_forbidden() {
        let router = test_router(ServerConfig {
            enable_coalitions: false,
            ..ServerConfig::default()
        });
        let mut session = test_session();
        let (out, _rx) = outbound();
        handshake(&router, &mut session, &out).await;

        let response = router
            .route(
                request(
                    methods::PROPOSE_COALITION,
                    json!({
                        "name": "Alpha",
                        "targetMarket": "m",
                        "strategy": "s",
                        "minMembers": 1,
                        "maxMembers": 2,
                    }),
                ),
                &mut session,
                &out,
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::Forbidden.code());
    }

    #[tokio::test]
    async fn test_payment_roundtrip() {
        let router = test_router(ServerConfig::default());
        let (out_a, mut rx_a) = outbound();
        let (out_b, mut rx_b) = outbound();
        let mut session_a = test_session();
        let mut session_b = test_session();

        handshake(&router, &mut session_a, &out_a).await;
        let agent_b = handshake(&router, &mut session_b, &out_b).await;

        let response = router
            .route(
                request(
                    methods::PAYMENT_REQUEST,
                    json!({"to": agent_b, "amount": "0.25", "service": "analysis"}),
                ),
                &mut session_a,
                &out_a,
            )
            .await;
        let request_value = response.result.unwrap();
        let request_id = request_value["requestId"].as_str().unwrap().to_string();

        // Payer receives the request notification.
        let mut payer_notified = false;
        while let Ok(Message::Text(text)) = rx_b.try_recv() {
            if text.contains("a2a.paymentRequested") && text.contains(&request_id) {
                payer_notified = true;
            }
        }
        assert!(payer_notified);

        let response = router
            .route(
                request(
                    methods::PAYMENT_RECEIPT,
                    json!({"requestId": request_id, "txHash": "0xfeed"}),
                ),
                &mut session_b,
                &out_b,
            )
            .await;
        let receipt = response.result.unwrap();
        assert_eq!(receipt["confirmed"], json!(true));

        // Requester is told the payment confirmed.
        let mut requester_notified = false;
        while let Ok(Message::Text(text)) = rx_a.try_recv() {
            if text.contains("a2a.paymentConfirmed") {
                requester_notified = true;
            }
        }
        assert!(requester_notified);

        // Unknown receipt is rejected.
        let response = router
            .route(
                request(
                    methods::PAYMENT_RECEIPT,
                    json!({"requestId": "never-opened", "txHash": "0xfeed"}),
                ),
                &mut session_b,
                &out_b,
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::PaymentFailed.code());
    }

    #[tokio::test]
    async fn test_discover_filters_by_strategy() {
        let router = test_router(ServerConfig::default());
        let (out_a, _rx_a) = outbound();
        let mut session_a = test_session();
        handshake(&router, &mut session_a, &out_a).await;

        let response = router
            .route(
                request(
                    methods::DISCOVER,
                    json!({"filters": {"strategies": ["momentum"]}}),
                ),
                &mut session_a,
                &out_a,
            )
            .await;
        let result: DiscoverResult =
            serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.total, 1);

        let response = router
            .route(
                request(
                    methods::DISCOVER,
                    json!({"filters": {"strategies": ["mean-reversion"]}}),
                ),
                &mut session_a,
                &out_a,
            )
            .await;
        let result: DiscoverResult =
            serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.total, 0);
    }
}
