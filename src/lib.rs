//! OpenAI-API-compatible reverse proxy fronting a fleet of Azure OpenAI
//! deployments. Requests arrive in OpenAI wire format; the proxy selects a
//! healthy backend with token capacity, rewrites the request into the
//! Azure dialect, forwards it (streaming or buffered), and records usage
//! and errors into a shared coordination store to inform future routing.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimator;
pub mod health;
pub mod http;
pub mod manager;
pub mod rate_limit;
pub mod selector;
pub mod sse;
pub mod state;
pub mod store;
pub mod transform;
pub mod upstream;

pub use config::{AppConfig, InstanceConfig, Loader, ProviderType, RoutingStrategy};
pub use dispatch::{DispatchReply, Dispatcher};
pub use error::{classify, ErrorKind, ProxyError, StoreError};
pub use health::HealthSweeper;
pub use http::{router, AppState};
pub use manager::InstanceManager;
pub use rate_limit::RateLimiter;
pub use state::{ErrorOrigin, InstanceState, InstanceStatus};
pub use store::{MemoryStore, RedisStore, StateStore, WindowStore};
pub use transform::{ProxyEndpoint, RequestTransformer, TransformResult};
