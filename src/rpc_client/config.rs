use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroU64, NonZeroUsize};
use url::Url;

use super::types::LogFilter;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcClientConfig {
    #[serde(default = "default_req_timeout")]
    pub http_req_timeout_millis: NonZeroU64,
    #[serde(default = "default_connect_timeout")]
    pub http_connect_timeout_millis: NonZeroU64,
    /// Widest block range a single eth_getLogs call may cover
    #[serde(default = "default_max_range_width")]
    pub max_range_width: NonZeroU64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub filter: LogFilter,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            http_req_timeout_millis: default_req_timeout(),
            http_connect_timeout_millis: default_connect_timeout(),
            max_range_width: default_max_range_width(),
            retry: RetryConfig::default(),
            filter: LogFilter::default(),
        }
    }
}

pub fn default_req_timeout() -> NonZeroU64 {
    NonZeroU64::new(120_000).unwrap()
}

pub fn default_connect_timeout() -> NonZeroU64 {
    NonZeroU64::new(5_000).unwrap()
}

pub fn default_max_range_width() -> NonZeroU64 {
    NonZeroU64::new(1_000).unwrap()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: NonZeroU32,
    /// Delay before the second attempt, doubled for every further attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_millis: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_millis: u64,
    /// Extra factor applied to the delay when the provider signals throttling
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
    /// Upper bound of the random delay added to every backoff
    #[serde(default = "default_jitter")]
    pub jitter_millis: u64,
    /// Total time budget for one call including all retries
    pub deadline_millis: Option<NonZeroU64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_millis: default_base_delay(),
            max_delay_millis: default_max_delay(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            jitter_millis: default_jitter(),
            deadline_millis: None,
        }
    }
}

pub fn default_max_attempts() -> NonZeroU32 {
    NonZeroU32::new(5).unwrap()
}

pub fn default_base_delay() -> u64 {
    800
}

pub fn default_max_delay() -> u64 {
    16_000
}

pub fn default_rate_limit_multiplier() -> u32 {
    2
}

pub fn default_jitter() -> u64 {
    1_000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointConfig {
    pub url: Url,
    pub bearer_token: Option<String>,
    #[serde(flatten)]
    pub limit: LimitConfig,
    pub label: Option<String>,
}

impl EndpointConfig {
    pub fn from_url(url: Url) -> Self {
        Self {
            url,
            bearer_token: None,
            limit: LimitConfig::default(),
            label: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LimitConfig {
    #[serde(default = "default_req_limit")]
    pub req_limit: NonZeroUsize,
    #[serde(default = "default_limit_window")]
    pub req_limit_window_ms: NonZeroU64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            req_limit: default_req_limit(),
            req_limit_window_ms: default_limit_window(),
        }
    }
}

pub fn default_req_limit() -> NonZeroUsize {
    NonZeroUsize::new(10).unwrap()
}

pub fn default_limit_window() -> NonZeroU64 {
    NonZeroU64::new(1000).unwrap()
}
