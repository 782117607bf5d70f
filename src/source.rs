use std::fmt;
use std::num::NonZeroU64;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::range::BlockRange;
use crate::rpc_client::{Error, ErrorKind, Result, RetryPolicy, RpcClientConfig};

/// Something that can count the logs a provider returns for a block range, one attempt per call.
#[async_trait]
pub trait LogSource: Send + Sync {
    fn label(&self) -> &str;

    async fn fetch_log_count(&self, range: BlockRange) -> Result<u64>;
}

/// A [`LogSource`] behind the range width ceiling, the shared retry policy and the run's
/// cancellation token. All pipelines talk to providers through this.
pub struct CountSource<S> {
    source: S,
    retry: RetryPolicy,
    max_range_width: NonZeroU64,
    cancel: CancellationToken,
}

impl<S: LogSource> CountSource<S> {
    pub fn new(source: S, cfg: &RpcClientConfig, cancel: CancellationToken) -> Self {
        Self::with_policy(
            source,
            RetryPolicy::new(&cfg.retry),
            cfg.max_range_width,
            cancel,
        )
    }

    pub fn with_policy(
        source: S,
        retry: RetryPolicy,
        max_range_width: NonZeroU64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            retry,
            max_range_width,
            cancel,
        }
    }

    pub fn label(&self) -> &str {
        self.source.label()
    }

    pub fn inner(&self) -> &S {
        &self.source
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn count_logs(&self, range: BlockRange) -> Result<u64> {
        let width = range.width();
        if width > self.max_range_width.get() {
            return Err(Error::RangeTooWide {
                range,
                width,
                max: self.max_range_width.get(),
            });
        }

        self.retry
            .run(&self.cancel, || self.source.fetch_log_count(range))
            .await
    }

    /// Counts a range of any width as the sum of `max_range_width` sized calls.
    pub async fn count_span(&self, range: BlockRange) -> Result<u64> {
        let mut total = 0u64;

        for chunk in range.chunks(self.max_range_width) {
            total += self.count_logs(chunk).await?;
        }

        Ok(total)
    }
}

/// Cloneable summary of a failed count, kept in reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for CountFailure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<Error> for CountFailure {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

impl fmt::Display for CountFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
