//! A2A protocol server: transport, dispatch, and shared registries.

pub mod events;
pub mod registry;
pub mod router;
pub mod session;
pub mod ws;

pub use events::{EventBus, ServerEvent};
pub use registry::{
    AnalysisStore, CoalitionRegistry, ConnectionHandle, ConnectionRegistry, PaymentLedger,
    Registries, SubscriptionRegistry,
};
pub use router::MessageRouter;
pub use session::{ConnectionSession, RateWindow};
pub use ws::WebSocketServer;
