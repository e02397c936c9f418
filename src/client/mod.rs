//! Agent-side A2A client
//!
//! Connects, signs the timestamped challenge, handshakes, and then exposes
//! request/response calls correlated by id plus event listeners for
//! unsolicited notifications. A request that outlives its timeout is removed
//! from the pending table; a late response for a removed id is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ParleyError, Result};
use crate::protocol::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::protocol::messages::{
    methods, AgentCapabilities, AnalysisSubmission, Coalition, DiscoverFilters, DiscoverParams,
    DiscoverResult, HandshakeParams, HandshakeResult, PaymentReceipt, PaymentRequest,
};
use crate::signing::{sign_challenge, Wallet};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Connection state machine. `Ready` is the only state in which calls are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint (ws:// or wss://)
    pub url: String,
    /// Registry token id this agent claims
    pub token_id: String,
    /// Capabilities declared at handshake
    pub capabilities: AgentCapabilities,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Re-run connect+handshake on unexpected close
    pub auto_reconnect: bool,
    /// Fixed delay between reconnect attempts
    pub reconnect_backoff: Duration,
}

impl ClientConfig {
    pub fn new(url: &str, token_id: &str) -> Self {
        Self {
            url: url.to_string(),
            token_id: token_id.to_string(),
            capabilities: AgentCapabilities::default(),
            request_timeout: Duration::from_secs(30),
            auto_reconnect: false,
            reconnect_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct ClientInner {
    config: ClientConfig,
    wallet: Wallet,
    state: RwLock<ClientState>,
    next_id: AtomicU64,
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    handlers: DashMap<String, Vec<EventHandler>>,
    out_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    identity: RwLock<Option<HandshakeResult>>,
    closing: AtomicBool,
}

pub struct AgentClient {
    inner: Arc<ClientInner>,
}

impl AgentClient {
    pub fn new(config: ClientConfig, wallet: Wallet) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                wallet,
                state: RwLock::new(ClientState::Disconnected),
                next_id: AtomicU64::new(0),
                pending: DashMap::new(),
                handlers: DashMap::new(),
                out_tx: RwLock::new(None),
                identity: RwLock::new(None),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Open the socket, sign the challenge, handshake. Resolves with the
    /// server-assigned identity or rejects on failure/timeout.
    pub async fn connect(&self) -> Result<HandshakeResult> {
        self.inner.closing.store(false, Ordering::SeqCst);
        establish(self.inner.clone()).await
    }

    /// Disable auto-reconnect and close cleanly.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        *self.inner.state.write().await = ClientState::Disconnected;
        if let Some(tx) = self.inner.out_tx.write().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.inner.pending.clear();
        *self.inner.identity.write().await = None;
        debug!("Client disconnected");
    }

    pub async fn state(&self) -> ClientState {
        *self.inner.state.read().await
    }

    /// Identity returned by the last successful handshake.
    pub async fn identity(&self) -> Option<HandshakeResult> {
        self.inner.identity.read().await.clone()
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.inner
            .identity
            .read()
            .await
            .as_ref()
            .map(|identity| identity.agent_id.clone())
    }

    /// Register a handler for a server notification method
    /// (e.g. `a2a.marketUpdate`). Handlers receive the notification params.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Send a request and wait for its raw response frame. Most callers want
    /// [`call`](Self::call) instead.
    pub async fn request(&self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        if *self.inner.state.read().await != ClientState::Ready {
            return Err(ParleyError::ConnectionClosed(
                "client is not connected".to_string(),
            ));
        }
        raw_request(&self.inner, method, params).await
    }

    /// Send a request and unwrap the result, mapping protocol errors to
    /// `ParleyError::Protocol`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let response = self.request(method, params).await?;
        if let Some(error) = response.error {
            return Err(ParleyError::Protocol(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        response
            .result
            .ok_or_else(|| ParleyError::Protocol("Response missing result".to_string()))
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, Value::Object(Default::default()))
            .await
            .map(|_| ())
    }

    pub async fn discover_agents(
        &self,
        filters: Option<DiscoverFilters>,
        limit: Option<usize>,
    ) -> Result<DiscoverResult> {
        let params = serde_json::to_value(DiscoverParams { filters, limit })?;
        let result = self.call(methods::DISCOVER, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn subscribe_market(&self, market_id: &str) -> Result<Value> {
        self.call(
            methods::SUBSCRIBE_MARKET,
            serde_json::json!({"marketId": market_id}),
        )
        .await
    }

    pub async fn unsubscribe_market(&self, market_id: &str) -> Result<Value> {
        self.call(
            methods::UNSUBSCRIBE_MARKET,
            serde_json::json!({"marketId": market_id}),
        )
        .await
    }

    pub async fn propose_coalition(
        &self,
        name: &str,
        target_market: &str,
        strategy: &str,
        min_members: usize,
        max_members: usize,
    ) -> Result<(String, Coalition)> {
        let result = self
            .call(
                methods::PROPOSE_COALITION,
                serde_json::json!({
                    "name": name,
                    "targetMarket": target_market,
                    "strategy": strategy,
                    "minMembers": min_members,
                    "maxMembers": max_members,
                }),
            )
            .await?;
        let coalition_id = result
            .get("coalitionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ParleyError::Protocol("Missing coalitionId".to_string()))?
            .to_string();
        let coalition = serde_json::from_value(
            result
                .get("proposal")
                .cloned()
                .ok_or_else(|| ParleyError::Protocol("Missing proposal".to_string()))?,
        )?;
        Ok((coalition_id, coalition))
    }

    pub async fn join_coalition(&self, coalition_id: &str) -> Result<Coalition> {
        let result = self
            .call(
                methods::JOIN_COALITION,
                serde_json::json!({"coalitionId": coalition_id}),
            )
            .await?;
        Ok(serde_json::from_value(
            result
                .get("coalition")
                .cloned()
                .ok_or_else(|| ParleyError::Protocol("Missing coalition".to_string()))?,
        )?)
    }

    pub async fn leave_coalition(&self, coalition_id: &str) -> Result<()> {
        self.call(
            methods::LEAVE_COALITION,
            serde_json::json!({"coalitionId": coalition_id}),
        )
        .await
        .map(|_| ())
    }

    pub async fn disband_coalition(&self, coalition_id: &str) -> Result<Coalition> {
        let result = self
            .call(
                methods::DISBAND_COALITION,
                serde_json::json!({"coalitionId": coalition_id}),
            )
            .await?;
        Ok(serde_json::from_value(
            result
                .get("coalition")
                .cloned()
                .ok_or_else(|| ParleyError::Protocol("Missing coalition".to_string()))?,
        )?)
    }

    /// Returns the server-assigned analysis id.
    pub async fn share_analysis(&self, analysis: AnalysisSubmission) -> Result<String> {
        let result = self
            .call(
                methods::SHARE_ANALYSIS,
                serde_json::json!({"analysis": analysis}),
            )
            .await?;
        result
            .get("analysisId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ParleyError::Protocol("Missing analysisId".to_string()))
    }

    /// Returns the broadcast request id.
    pub async fn request_analysis(&self, market_id: &str) -> Result<String> {
        let result = self
            .call(
                methods::REQUEST_ANALYSIS,
                serde_json::json!({"marketId": market_id}),
            )
            .await?;
        result
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ParleyError::Protocol("Missing requestId".to_string()))
    }

    pub async fn send_payment_request(
        &self,
        to: &str,
        amount: rust_decimal::Decimal,
        service: &str,
    ) -> Result<PaymentRequest> {
        let result = self
            .call(
                methods::PAYMENT_REQUEST,
                serde_json::json!({"to": to, "amount": amount, "service": service}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn send_payment_receipt(
        &self,
        request_id: &str,
        tx_hash: &str,
    ) -> Result<PaymentReceipt> {
        let result = self
            .call(
                methods::PAYMENT_RECEIPT,
                serde_json::json!({"requestId": request_id, "txHash": tx_hash}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Dial, spawn the io tasks, and run the handshake.
async fn establish(inner: Arc<ClientInner>) -> Result<HandshakeResult> {
    *inner.state.write().await = ClientState::Connecting;

    let (ws, _) = match connect_async(inner.config.url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            *inner.state.write().await = ClientState::Disconnected;
            return Err(e.into());
        }
    };
    debug!(url = %inner.config.url, "Connected, starting handshake");

    let (sink, stream) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    *inner.out_tx.write().await = Some(out_tx);

    tokio::spawn(write_loop(sink, out_rx));
    tokio::spawn(read_loop(inner.clone(), stream));

    *inner.state.write().await = ClientState::Handshaking;
    match handshake(&inner).await {
        Ok(result) => {
            *inner.identity.write().await = Some(result.clone());
            *inner.state.write().await = ClientState::Ready;
            info!(agent_id = %result.agent_id, "Handshake complete");
            Ok(result)
        }
        Err(e) => {
            *inner.state.write().await = ClientState::Disconnected;
            if let Some(tx) = inner.out_tx.write().await.take() {
                let _ = tx.send(Message::Close(None));
            }
            Err(e)
        }
    }
}

async fn handshake(inner: &Arc<ClientInner>) -> Result<HandshakeResult> {
    let timestamp = Utc::now().timestamp_millis();
    let signature = sign_challenge(&inner.wallet, &inner.config.token_id, timestamp).await?;
    let params = HandshakeParams {
        address: inner.wallet.address_hex(),
        token_id: inner.config.token_id.clone(),
        signature,
        timestamp,
        capabilities: Some(inner.config.capabilities.clone()),
    };

    let response = raw_request(inner, methods::HANDSHAKE, serde_json::to_value(&params)?).await?;
    if let Some(error) = response.error {
        return Err(ParleyError::Handshake(format!(
            "{} (code {})",
            error.message, error.code
        )));
    }
    let result = response
        .result
        .ok_or_else(|| ParleyError::Handshake("Handshake response missing result".to_string()))?;
    Ok(serde_json::from_value(result)?)
}

/// Allocate an id, park a oneshot in the pending table, send, and wait.
async fn raw_request(
    inner: &Arc<ClientInner>,
    method: &str,
    params: Value,
) -> Result<JsonRpcResponse> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let key = id.to_string();

    let (tx, rx) = oneshot::channel();
    inner.pending.insert(key.clone(), tx);

    let request = JsonRpcRequest::new(id, method, Some(params));
    let frame = serde_json::to_string(&request)?;
    let sent = {
        let guard = inner.out_tx.read().await;
        match guard.as_ref() {
            Some(out) => out.send(Message::Text(frame)).is_ok(),
            None => false,
        }
    };
    if !sent {
        inner.pending.remove(&key);
        return Err(ParleyError::ConnectionClosed(
            "send failed: not connected".to_string(),
        ));
    }

    match timeout(inner.config.request_timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => {
            inner.pending.remove(&key);
            Err(ParleyError::ConnectionClosed(
                "connection lost while awaiting response".to_string(),
            ))
        }
        Err(_) => {
            // Remove the entry so a late response is dropped by the reader.
            inner.pending.remove(&key);
            Err(ParleyError::RequestTimeout(method.to_string()))
        }
    }
}

async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: WsStream) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_frame(&inner, &text),
            Ok(Message::Ping(data)) => {
                let guard = inner.out_tx.read().await;
                if let Some(out) = guard.as_ref() {
                    let _ = out.send(Message::Pong(data));
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error: {}", e);
                break;
            }
        }
    }
    on_connection_lost(inner).await;
}

/// Responses resolve their pending entry; notifications go to event
/// listeners. A frame that is neither is logged and dropped.
fn dispatch_frame(inner: &Arc<ClientInner>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping unparseable frame: {}", e);
            return;
        }
    };

    let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
    if has_id {
        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                let key = id_key(&response.id);
                match inner.pending.remove(&key) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    // Timed-out or never-issued id: drop silently.
                    None => debug!(id = %key, "Dropping response for unknown request id"),
                }
            }
            Err(e) => warn!("Malformed response frame: {}", e),
        }
    } else {
        match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(note) => {
                let handlers = inner
                    .handlers
                    .get(&note.method)
                    .map(|entry| entry.value().clone());
                if let Some(handlers) = handlers {
                    let params = note.params.unwrap_or(Value::Null);
                    for handler in handlers {
                        handler(params.clone());
                    }
                } else {
                    debug!(method = %note.method, "No handler for notification");
                }
            }
            Err(e) => warn!("Malformed notification frame: {}", e),
        }
    }
}

async fn on_connection_lost(inner: Arc<ClientInner>) {
    *inner.out_tx.write().await = None;
    // Dropping the senders rejects every in-flight request.
    inner.pending.clear();
    *inner.state.write().await = ClientState::Disconnected;

    if inner.closing.load(Ordering::SeqCst) || !inner.config.auto_reconnect {
        return;
    }
    // Boxed: the reconnect future embeds `establish`, which spawns this
    // reader again, so the future types are mutually recursive.
    let reconnect: futures_util::future::BoxFuture<'static, ()> =
        Box::pin(reconnect_loop(inner));
    tokio::spawn(reconnect);
}

async fn reconnect_loop(inner: Arc<ClientInner>) {
    loop {
        tokio::time::sleep(inner.config.reconnect_backoff).await;
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }
        info!("Reconnecting to {}", inner.config.url);
        match establish(inner.clone()).await {
            Ok(result) => {
                info!(agent_id = %result.agent_id, "Reconnected");
                return;
            }
            Err(e) => warn!("Reconnect attempt failed: {}", e),
        }
    }
}

/// Response ids come back as numbers or strings; key the pending table on a
/// canonical string form.
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
