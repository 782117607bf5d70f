use super::types::{GetLogs, LogsResponse};
use super::{EndpointConfig, Error, LimitConfig, Result};
use reqwest::Method;
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;
use url::Url;

pub struct Endpoint {
    job_tx: mpsc::Sender<Job>,
    label: String,
}

impl Endpoint {
    /// Spawns the request listener, so this has to be called from within a tokio runtime.
    pub fn new(http_client: reqwest::Client, config: EndpointConfig) -> Self {
        let url = Arc::new(config.url);
        // Make label default to the url if not specified
        let label = config.label.unwrap_or_else(|| url.to_string());
        let bearer_token = config.bearer_token.map(Arc::new);

        let (job_tx, job_rx) = mpsc::channel(1);

        tokio::spawn(
            Listen {
                http_client,
                job_rx,
                limit_config: config.limit,
                window_num_reqs: 0,
                last_limit_refresh: Instant::now(),
                url,
                bearer_token,
            }
            .listen(),
        );

        Self { job_tx, label }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&self, req: Arc<GetLogs>) -> Result<u64> {
        let (res_tx, mut res_rx) = mpsc::channel(1);

        self.job_tx
            .send(Job { res_tx, req })
            .await
            .map_err(|_| Error::EndpointClosed)?;

        res_rx.recv().await.ok_or(Error::EndpointClosed)?
    }
}

struct Job {
    req: Arc<GetLogs>,
    res_tx: mpsc::Sender<Result<u64>>,
}

struct Listen {
    url: Arc<Url>,
    bearer_token: Option<Arc<String>>,
    http_client: reqwest::Client,
    job_rx: mpsc::Receiver<Job>,
    limit_config: LimitConfig,
    window_num_reqs: usize,
    last_limit_refresh: Instant,
}

impl Listen {
    async fn listen(mut self) {
        while let Some(job) = self.job_rx.recv().await {
            if let Err(e) = self.update_limit() {
                tokio::spawn(async move {
                    job.res_tx.send(Err(e)).await.ok();
                });
                continue;
            }

            tokio::spawn(
                SendRpcRequest {
                    http_client: self.http_client.clone(),
                    job,
                    url: self.url.clone(),
                    bearer_token: self.bearer_token.clone(),
                }
                .send(),
            );
        }
    }

    fn update_limit(&mut self) -> Result<()> {
        if self.last_limit_refresh.elapsed().as_millis()
            >= u128::from(self.limit_config.req_limit_window_ms.get())
        {
            self.last_limit_refresh = Instant::now();
            self.window_num_reqs = 0;
        }

        if self.window_num_reqs < self.limit_config.req_limit.get() {
            self.window_num_reqs += 1;
            Ok(())
        } else {
            Err(Error::EndpointLimitTooLow)
        }
    }
}

struct SendRpcRequest {
    url: Arc<Url>,
    bearer_token: Option<Arc<String>>,
    http_client: reqwest::Client,
    job: Job,
}

impl SendRpcRequest {
    async fn send(self) {
        let res_tx = self.job.res_tx.clone();
        let res = self.send_impl().await;

        if let Err(e) = res.as_ref() {
            log::warn!(
                "eth_getLogs {} failed: {} . The url was: {}",
                self.job.req.range,
                e,
                self.url.as_str()
            );
        }

        res_tx.send(res).await.ok();
    }

    async fn send_impl(&self) -> Result<u64> {
        let json: serde_json::Value = self.job.req.as_ref().into();

        let mut req = self
            .http_client
            .request(Method::POST, Url::clone(&self.url));

        if let Some(bearer_token) = &self.bearer_token {
            req = req.bearer_auth(bearer_token);
        }

        let res = req.json(&json).send().await.map_err(Error::HttpRequest)?;

        let status = res.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status));
        }

        let res = res.text().await.map_err(Error::HttpRequest)?;

        match self.job.req.resp_from_json(res) {
            Ok(LogsResponse::Count(count)) => Ok(count),
            Ok(LogsResponse::Error { code, message }) => Err(Error::Rpc { code, message }),
            Err(e) => Err(Error::InvalidRPCResponse(e)),
        }
    }
}
