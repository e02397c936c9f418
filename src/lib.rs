pub mod adapters;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod signing;

pub use auth::{AuthManager, AuthOutcome, SessionRecord};
pub use client::{AgentClient, ClientConfig, ClientState};
pub use config::{AppConfig, ServerConfig};
pub use error::{ParleyError, Result};
pub use protocol::{ErrorCode, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use server::{MessageRouter, ServerEvent, WebSocketServer};
pub use signing::Wallet;
