use std::num::{NonZeroU64, NonZeroUsize};

use serde::{Deserialize, Serialize};

use crate::pipeline::{NarrowConfig, Tiling};
use crate::rpc_client::{EndpointConfig, RpcClientConfig};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub rpc: RpcClientConfig,
    /// Provider whose counts are stored as ground truth
    pub reference: Option<EndpointConfig>,
    /// Provider under test
    pub candidate: Option<EndpointConfig>,
    #[serde(default)]
    pub span: SpanConfig,
    #[serde(default)]
    pub narrow: NarrowConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// e.g. "sqlite://logcounts.db"
    pub database_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanConfig {
    #[serde(default = "default_start")]
    pub start: u64,
    #[serde(default = "default_end")]
    pub end: u64,
    #[serde(flatten)]
    pub tiling: Tiling,
    ///  Number of ranges counted at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: NonZeroUsize,
    /// Populate bisects failing ranges down to this width, 0 disables splitting
    #[serde(default = "default_split_on_error_min_width")]
    pub split_on_error_min_width: u64,
}

impl Default for SpanConfig {
    fn default() -> Self {
        Self {
            start: default_start(),
            end: default_end(),
            tiling: Tiling::default(),
            concurrency: default_concurrency(),
            split_on_error_min_width: default_split_on_error_min_width(),
        }
    }
}

impl SpanConfig {
    pub fn split_min_width(&self) -> Option<NonZeroU64> {
        NonZeroU64::new(self.split_on_error_min_width)
    }
}

fn default_start() -> u64 {
    6_306_357
}

fn default_end() -> u64 {
    42_618_965
}

fn default_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}

fn default_split_on_error_min_width() -> u64 {
    500
}
