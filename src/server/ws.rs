//! WebSocket transport
//!
//! Accepts raw TCP connections, upgrades them, and drives one task per
//! socket: read a frame, rate-limit, route, write the response. Outbound
//! traffic (responses and unsolicited notifications) funnels through a
//! per-connection channel so a single writer task owns the sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::adapters::traits::{MarketDataProvider, PaymentProcessor, RegistryClient};
use crate::auth::AuthManager;
use crate::config::AppConfig;
use crate::error::{ParleyError, Result};
use crate::protocol::jsonrpc::{ErrorCode, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::protocol::messages::notifications;
use crate::server::events::{EventBus, ServerEvent};
use crate::server::registry::{OutboundSender, Registries};
use crate::server::router::MessageRouter;
use crate::server::session::ConnectionSession;

/// Maintenance sweep cadence (expired sessions, payments, stale analyses).
const SWEEP_INTERVAL_SECS: u64 = 60;

struct ServerContext {
    config: AppConfig,
    auth: Arc<AuthManager>,
    router: MessageRouter,
    registries: Registries,
    events: EventBus,
    market_data: Option<Arc<dyn MarketDataProvider>>,
    active_connections: AtomicUsize,
}

/// The A2A WebSocket server. Owns the connection registry and the accept
/// loop; every registry and the router are built at construction and shared
/// with connection tasks through one context.
pub struct WebSocketServer {
    ctx: Arc<ServerContext>,
    listener: Option<TcpListener>,
}

impl WebSocketServer {
    pub fn new(config: AppConfig) -> Self {
        Self::with_collaborators(config, None, None, None)
    }

    pub fn with_collaborators(
        config: AppConfig,
        registry_client: Option<Arc<dyn RegistryClient>>,
        market_data: Option<Arc<dyn MarketDataProvider>>,
        payment_processor: Option<Arc<dyn PaymentProcessor>>,
    ) -> Self {
        let auth = Arc::new(AuthManager::new());
        let registries = Registries::new();
        let events = EventBus::default();
        let router = MessageRouter::new(
            &config.server,
            auth.clone(),
            registries.clone(),
            registry_client,
            payment_processor,
            events.clone(),
        );

        Self {
            ctx: Arc::new(ServerContext {
                config,
                auth,
                router,
                registries,
                events,
                market_data,
                active_connections: AtomicUsize::new(0),
            }),
            listener: None,
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.ctx.events.subscribe()
    }

    pub fn auth(&self) -> Arc<AuthManager> {
        self.ctx.auth.clone()
    }

    pub fn registries(&self) -> Registries {
        self.ctx.registries.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the listen socket. Port 0 picks an ephemeral port; the bound
    /// address is returned for callers that need it (tests, service
    /// registration).
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.server.host, self.ctx.config.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accept connections until the task is cancelled or the listener fails.
    pub async fn run(mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ParleyError::Internal("Server listener missing".to_string()))?;
        let local = listener.local_addr()?;
        info!("A2A server listening on ws://{}", local);

        spawn_maintenance(self.ctx.clone());
        spawn_market_pump(self.ctx.clone());

        loop {
            let (stream, peer) = listener.accept().await?;

            let active = self.ctx.active_connections.load(Ordering::Relaxed);
            if active >= self.ctx.config.server.max_connections {
                warn!(%peer, active, "Connection limit reached, refusing connection");
                drop(stream);
                continue;
            }

            self.ctx.active_connections.fetch_add(1, Ordering::Relaxed);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(ctx.clone(), stream, peer).await {
                    debug!(%peer, "Connection ended with error: {}", e);
                }
                ctx.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    debug!(%peer, "WebSocket connection accepted");

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Single writer task owns the sink; responses and fan-out notifications
    // interleave through the same channel.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = ConnectionSession::new(peer, ctx.config.server.message_rate_limit);
    let auth_deadline = tokio::time::Instant::now() + ctx.config.server.auth_timeout();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !process_frame(&ctx, &text, &mut session, &out_tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if out_tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%peer, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%peer, "Read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(auth_deadline), if !session.authenticated => {
                warn!(%peer, "Closing connection: handshake not completed in time");
                break;
            }
        }
    }

    cleanup_connection(&ctx, &session);
    writer.abort();
    Ok(())
}

/// Handle one inbound frame. Returns false when the connection should close
/// (the outbound channel is gone).
async fn process_frame(
    ctx: &ServerContext,
    text: &str,
    session: &mut ConnectionSession,
    out_tx: &OutboundSender,
) -> bool {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            // Malformed JSON is recovered per message; the socket survives.
            let response = JsonRpcResponse::error(
                Value::Null,
                ErrorCode::ParseError,
                format!("Parse error: {e}"),
            );
            return send_response(out_tx, &response);
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    if !session.note_request() {
        let response =
            JsonRpcResponse::error(id, ErrorCode::RateLimitExceeded, "Rate limit exceeded");
        return send_response(out_tx, &response);
    }

    let response = ctx.router.route(request, session, out_tx).await;
    send_response(out_tx, &response)
}

fn send_response(out_tx: &OutboundSender, response: &JsonRpcResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(frame) => out_tx.send(Message::Text(frame)).is_ok(),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            true
        }
    }
}

/// Close-path cleanup: transport-scoped state only. Coalition membership
/// deliberately survives disconnects.
fn cleanup_connection(ctx: &ServerContext, session: &ConnectionSession) {
    let Some(agent_id) = &session.agent_id else {
        debug!(peer = %session.peer, "Unauthenticated connection closed");
        return;
    };

    ctx.registries.connections.remove(agent_id);
    let removed = ctx.registries.subscriptions.remove_agent(agent_id);
    ctx.events.emit(ServerEvent::AgentDisconnected {
        agent_id: agent_id.clone(),
        address: session.address.clone().unwrap_or_default(),
    });
    info!(agent_id, removed_subscriptions = removed, "Agent disconnected");
}

/// Periodic sweep of expired sessions, expired payment requests, and stale
/// analyses. Runs for the process lifetime.
fn spawn_maintenance(ctx: Arc<ServerContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            let sessions = ctx.auth.cleanup_expired_sessions();
            let payments = ctx.registries.payments.cleanup_expired();
            let analyses = ctx.registries.analyses.cleanup_stale();
            if sessions + payments + analyses > 0 {
                debug!(sessions, payments, analyses, "Maintenance sweep");
            }
        }
    });
}

/// Poll the market data provider for every market with subscribers and fan
/// the snapshots out as notifications.
fn spawn_market_pump(ctx: Arc<ServerContext>) {
    let Some(provider) = ctx.market_data.clone() else {
        return;
    };
    let poll_interval = Duration::from_secs(ctx.config.market_data.poll_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            for market_id in ctx.registries.subscriptions.active_markets() {
                match provider.snapshot(&market_id).await {
                    Ok(update) => {
                        let params = match serde_json::to_value(&update) {
                            Ok(params) => params,
                            Err(e) => {
                                error!("Failed to serialize market update: {}", e);
                                continue;
                            }
                        };
                        let note =
                            JsonRpcNotification::new(notifications::MARKET_UPDATE, params);
                        let subscribers = ctx.registries.subscriptions.subscribers(&market_id);
                        ctx.registries
                            .connections
                            .notify_many(subscribers.iter().map(String::as_str), &note);
                    }
                    Err(e) => debug!(market_id, "No market snapshot: {}", e),
                }
            }
        }
    });
}
