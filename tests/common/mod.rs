//! Shared harness for integration tests: a real server on an ephemeral port
//! plus raw-socket helpers for protocol-level assertions.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parley::adapters::{NoopPaymentProcessor, StaticMarketData};
use parley::config::{AppConfig, LoggingConfig, MarketDataConfig, RegistryConfig, ServerConfig};
use parley::protocol::messages::AgentCapabilities;
use parley::server::{Registries, ServerEvent, WebSocketServer};
use parley::client::{AgentClient, ClientConfig};
use parley::signing::Wallet;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub market_data: Arc<StaticMarketData>,
    pub registries: Registries,
    pub events: broadcast::Receiver<ServerEvent>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

pub async fn spawn_server(server: ServerConfig) -> TestServer {
    let market_data = Arc::new(StaticMarketData::new());
    let config = AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..server
        },
        registry: RegistryConfig::default(),
        market_data: MarketDataConfig {
            poll_interval_secs: 1,
        },
        logging: LoggingConfig::default(),
    };

    let mut server = WebSocketServer::with_collaborators(
        config,
        None,
        Some(market_data.clone()),
        Some(Arc::new(NoopPaymentProcessor::new())),
    );
    let addr = server.bind().await.expect("bind test server");
    let registries = server.registries();
    let events = server.events();
    tokio::spawn(server.run());

    TestServer {
        addr,
        market_data,
        registries,
        events,
    }
}

pub async fn spawn_default_server() -> TestServer {
    spawn_server(ServerConfig::default()).await
}

/// A ready client with a fresh random wallet and momentum capabilities.
pub async fn connect_client(server: &TestServer) -> AgentClient {
    let config = ClientConfig::new(&server.url(), "1").with_capabilities(AgentCapabilities {
        strategies: vec!["momentum".to_string()],
        markets: vec!["market-123".to_string()],
        actions: vec!["analyze".to_string()],
        version: Some("0.1.0".to_string()),
    });
    let client = AgentClient::new(config, Wallet::random());
    client.connect().await.expect("client connect");
    client
}

/// Raw connection without any handshake.
pub async fn raw_connect(server: &TestServer) -> RawSocket {
    let url = server.url();
    let (ws, _) = connect_async(url.as_str()).await.expect("raw connect");
    ws
}

/// Send one frame and read the next text frame back as JSON.
pub async fn roundtrip(socket: &mut RawSocket, frame: Value) -> Value {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send frame");
    loop {
        match socket.next().await.expect("socket closed").expect("read frame") {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse response");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id})
}
