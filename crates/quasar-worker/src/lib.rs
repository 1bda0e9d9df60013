pub mod api;
pub mod args;
pub mod circuit_breaker;
pub mod executor;
pub mod gpu;
pub mod heartbeat;
pub mod loader;
pub mod metrics;
pub mod model_cache;
pub mod token_bucket;

pub use circuit_breaker::CircuitBreaker;
pub use executor::{ExecutorSettings, WorkerExecutor};
pub use loader::{ConnectorLoader, ModelLoader};
pub use model_cache::{CachedModel, ModelCache};
pub use token_bucket::TokenBucket;
