pub mod adapters;
pub mod canonical;
pub mod config;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod providers;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod translate;

pub use adapters::VendorAdapter;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use logging::RequestLog;
pub use normalize::{ParamNormalizer, VendorParamRule};
pub use proxy::{LlmProxy, ProxyFrame, ProxyOutcome};
pub use registry::AdapterRegistry;
pub use server::{build_router, AppState};
pub use snapshot::{BrokerSnapshot, SnapshotHandle};
