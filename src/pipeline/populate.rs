use std::num::{NonZeroU64, NonZeroUsize};

use futures::{stream, StreamExt};

use super::{RangeFailure, Tiling};
use crate::error::Result;
use crate::range::BlockRange;
use crate::rpc_client::{self, ErrorKind};
use crate::source::{CountSource, LogSource};
use crate::store::RangeCountStore;

#[derive(Debug, Clone)]
pub struct PopulateConfig {
    pub span: BlockRange,
    pub tiling: Tiling,
    /// Ranges counted at the same time within one step chunk
    pub concurrency: NonZeroUsize,
    /// Failed ranges wider than this are bisected and their halves summed
    pub split_on_error_min_width: Option<NonZeroU64>,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            span: BlockRange {
                start: 6_306_357,
                end: 42_618_965,
            },
            tiling: Tiling::default(),
            concurrency: NonZeroUsize::new(4).unwrap(),
            split_on_error_min_width: NonZeroU64::new(500),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PopulationReport {
    pub populated: u64,
    /// Ranges left without a fresh record, re-runnable on their own
    pub failed: Vec<RangeFailure>,
    /// Part of the span not reached because the run was cancelled
    pub remaining: Option<BlockRange>,
}

impl PopulationReport {
    pub fn cancelled(&self) -> bool {
        self.remaining.is_some()
    }
}

/// Fills `store` with the reference counts of every range of `cfg.span`.
/// Existing records are overwritten. Only store failures abort the run.
pub async fn populate<S: LogSource>(
    cfg: &PopulateConfig,
    source: &CountSource<S>,
    store: &RangeCountStore,
) -> Result<PopulationReport> {
    let mut report = PopulationReport::default();
    let split_min = cfg.split_on_error_min_width;

    log::info!(
        "Populating {} from {} with range size {} and step size {}",
        cfg.span,
        source.label(),
        cfg.tiling.range_size,
        cfg.tiling.step_size
    );

    for chunk in cfg.span.chunks(cfg.tiling.step_size) {
        if source.is_cancelled() {
            report.remaining = Some(BlockRange {
                start: chunk.start,
                end: cfg.span.end,
            });
            break;
        }

        let mut counts = stream::iter(chunk.chunks(cfg.tiling.range_size))
            .map(move |range| async move {
                (range, count_splitting(source, range, split_min).await)
            })
            .buffered(cfg.concurrency.get());

        let mut stored = 0;
        let mut failed = 0;

        while let Some((range, res)) = counts.next().await {
            match res {
                Ok(count) => {
                    store.put(range, count).await?;
                    log::debug!("{} {}", range, count);
                    stored += 1;
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    report.remaining = Some(BlockRange {
                        start: range.start,
                        end: cfg.span.end,
                    });
                    break;
                }
                Err(e) => {
                    log::warn!("{} ERROR: {}", range, e);
                    report.failed.push(RangeFailure {
                        range,
                        failure: e.into(),
                    });
                    failed += 1;
                }
            }
        }

        report.populated += stored;
        log::info!("Step {}: {} ranges stored, {} failed", chunk, stored, failed);

        if let Some(remaining) = report.remaining {
            log::warn!("Population cancelled, {} is not populated", remaining);
            break;
        }
    }

    log::info!(
        "Done. Ranges populated: {}, failed: {}",
        report.populated,
        report.failed.len()
    );

    Ok(report)
}

/// Counts `range`, bisecting sub-ranges that keep failing until they reach `min_width`.
async fn count_splitting<S: LogSource>(
    source: &CountSource<S>,
    range: BlockRange,
    min_width: Option<NonZeroU64>,
) -> rpc_client::Result<u64> {
    let mut pending = vec![range];
    let mut total = 0u64;

    while let Some(r) = pending.pop() {
        match source.count_span(r).await {
            Ok(n) => total += n,
            Err(e) => {
                let min = match min_width {
                    Some(min) if e.kind() != ErrorKind::Cancelled && r.width() > min.get() => min,
                    _ => return Err(e),
                };

                let Some((left, right)) = r.split() else {
                    return Err(e);
                };

                log::warn!(
                    "Counting {} failed, splitting into {} and {} (min width {}): {}",
                    r,
                    left,
                    right,
                    min,
                    e
                );

                pending.push(right);
                pending.push(left);
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{counted, BlockLogs};
    use crate::store::tests::setup_store;
    use tokio_util::sync::CancellationToken;

    fn range(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    fn small_config(span: BlockRange) -> PopulateConfig {
        PopulateConfig {
            span,
            tiling: Tiling {
                range_size: NonZeroU64::new(100).unwrap(),
                step_size: NonZeroU64::new(250).unwrap(),
            },
            concurrency: NonZeroUsize::new(3).unwrap(),
            split_on_error_min_width: None,
        }
    }

    #[tokio::test]
    async fn test_populates_every_range() {
        let (store, _temp_db) = setup_store().await;
        let span = range(1000, 1999);
        let source = counted(BlockLogs::filled("reference", span, |b| b % 2));

        let report = populate(&small_config(span), &source, &store).await.unwrap();

        assert_eq!(report.populated, 12);
        assert!(report.failed.is_empty());
        assert!(!report.cancelled());

        let records = store.iterate(span).await.unwrap();
        let ranges: Vec<_> = records.iter().map(|r| r.range).collect();
        let expected: Vec<_> = small_config(span).tiling.ranges(span).collect();
        assert_eq!(ranges, expected);

        for record in records {
            assert_eq!(record.count, record.range.width() / 2);
        }
    }

    #[tokio::test]
    async fn test_population_is_idempotent() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 733);
        let source = counted(BlockLogs::filled("reference", span, |b| b % 5));
        let cfg = small_config(span);

        populate(&cfg, &source, &store).await.unwrap();
        let first: Vec<_> = store
            .iterate(span)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.range, r.count))
            .collect();

        populate(&cfg, &source, &store).await.unwrap();
        let second: Vec<_> = store
            .iterate(span)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.range, r.count))
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_failed_range_does_not_abort_run() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 499);
        let source = counted(
            BlockLogs::filled("reference", span, |_| 1)
                .fail_overlapping(range(150, 150), ErrorKind::Transient),
        );

        let report = populate(&small_config(span), &source, &store).await.unwrap();

        assert_eq!(report.populated, 5);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].range, range(100, 199));
        assert_eq!(report.failed[0].failure.kind, ErrorKind::Transient);
        assert!(store.get(range(100, 199)).await.unwrap().is_none());
        assert_eq!(store.get(range(200, 249)).await.unwrap().unwrap().count, 50);
    }

    #[tokio::test]
    async fn test_ranges_wider_than_call_limit_are_chunked() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 3_999);
        let source = counted(BlockLogs::filled("reference", span, |_| 1));
        let mut cfg = small_config(span);
        cfg.tiling = Tiling {
            range_size: NonZeroU64::new(2_000).unwrap(),
            step_size: NonZeroU64::new(4_000).unwrap(),
        };

        let report = populate(&cfg, &source, &store).await.unwrap();

        assert_eq!(report.populated, 2);
        assert!(report.failed.is_empty());
        assert_eq!(store.get(range(0, 1_999)).await.unwrap().unwrap().count, 2_000);
        assert_eq!(source.inner().calls(), 4);
    }

    #[tokio::test]
    async fn test_split_on_error_sums_halves() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 99);
        // the full range is refused, both halves answer
        let source = counted(FailWide(BlockLogs::filled("reference", span, |_| 2)));
        let mut cfg = small_config(span);
        cfg.split_on_error_min_width = NonZeroU64::new(10);

        let report = populate(&cfg, &source, &store).await.unwrap();

        assert!(report.failed.is_empty());
        assert_eq!(store.get(span).await.unwrap().unwrap().count, 200);
    }

    #[tokio::test]
    async fn test_split_stops_at_min_width() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 99);
        let source = counted(
            BlockLogs::filled("reference", span, |_| 1)
                .fail_overlapping(range(42, 42), ErrorKind::Permanent),
        );
        let mut cfg = small_config(span);
        cfg.split_on_error_min_width = NonZeroU64::new(25);

        let report = populate(&cfg, &source, &store).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].range, span);
        assert!(store.get(span).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_remaining_span() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 999);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = CountSource::with_policy(
            BlockLogs::filled("reference", span, |_| 1),
            crate::source::testing::instant_retry(5),
            NonZeroU64::new(1_000).unwrap(),
            cancel,
        );

        let report = populate(&small_config(span), &source, &store).await.unwrap();

        assert_eq!(report.remaining, Some(span));
        assert_eq!(report.populated, 0);
        assert_eq!(source.inner().calls(), 0);
    }

    /// Refuses every range wider than 50 blocks.
    struct FailWide(BlockLogs);

    #[async_trait::async_trait]
    impl LogSource for FailWide {
        fn label(&self) -> &str {
            self.0.label()
        }

        async fn fetch_log_count(&self, range: BlockRange) -> rpc_client::Result<u64> {
            if range.width() > 50 {
                return Err(rpc_client::Error::Rpc {
                    code: -32602,
                    message: "block range too large".into(),
                });
            }
            self.0.fetch_log_count(range).await
        }
    }
}
