pub mod http_registry;
pub mod stubs;
pub mod traits;

pub use http_registry::HttpRegistryClient;
pub use stubs::{NoopPaymentProcessor, StaticMarketData, StaticRegistryClient};
pub use traits::{MarketDataProvider, PaymentProcessor, RegistryClient};
