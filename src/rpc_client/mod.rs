pub mod config;
mod endpoint;
mod error;
pub mod inner;
pub mod retry;
mod types;

pub use config::{EndpointConfig, LimitConfig, RetryConfig, RpcClientConfig};
pub use error::{Error, ErrorKind, Result};
pub use inner::RpcClient;
pub use retry::RetryPolicy;
pub use types::LogFilter;
