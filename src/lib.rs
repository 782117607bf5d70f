pub mod args;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod range;
pub mod rpc_client;
mod runner;
pub mod source;
pub mod store;

pub use args::Args;
pub use config::Config;
pub use range::BlockRange;
pub use runner::Runner;
pub use source::{CountSource, LogSource};
pub use store::RangeCountStore;
