pub mod adapter;
pub mod circuit_breaker;
pub mod http;
pub mod loopback;

pub use adapter::{
    invoke_operation, AdapterFactory, AdapterRequest, AdapterResponse, AdapterResult, BackendAdapter,
    DefaultAdapterFactory,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use http::HttpAdapter;
pub use loopback::{LoopbackAdapter, LoopbackBehavior};
