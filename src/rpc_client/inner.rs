use anyhow::Context;
use async_trait::async_trait;

use super::endpoint::Endpoint;
use super::types::{GetLogs, LogFilter};
use super::{EndpointConfig, Result, RpcClientConfig};
use crate::range::BlockRange;
use crate::source::LogSource;
use std::sync::Arc;
use std::time::Duration;

/// eth_getLogs client for a single provider. Every call is one attempt, retries are
/// applied by [`crate::source::CountSource`].
pub struct RpcClient {
    endpoint: Endpoint,
    filter: Arc<LogFilter>,
}

impl RpcClient {
    pub fn new(endpoint: EndpointConfig, cfg: &RpcClientConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .gzip(true)
            .http1_only()
            .timeout(Duration::from_millis(cfg.http_req_timeout_millis.get()))
            .connect_timeout(Duration::from_millis(cfg.http_connect_timeout_millis.get()))
            .tcp_keepalive(Duration::from_secs(7200))
            .build()
            .context("build http client")?;

        Ok(Self {
            endpoint: Endpoint::new(http_client, endpoint),
            filter: Arc::new(cfg.filter.clone()),
        })
    }
}

#[async_trait]
impl LogSource for RpcClient {
    fn label(&self) -> &str {
        self.endpoint.label()
    }

    async fn fetch_log_count(&self, range: BlockRange) -> Result<u64> {
        let req = Arc::new(GetLogs {
            range,
            filter: self.filter.clone(),
        });

        self.endpoint.send(req).await
    }
}
