//! A2A wire protocol: JSON-RPC 2.0 envelope and per-method message types.

pub mod jsonrpc;
pub mod messages;

pub use jsonrpc::{ErrorCode, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use messages::{
    AgentCapabilities, AgentCredentials, AgentInfo, AnalysisRecord, Coalition, DiscoverFilters,
    PaymentReceipt, PaymentRequest,
};
