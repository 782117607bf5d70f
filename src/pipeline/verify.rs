use std::num::NonZeroUsize;

use futures::{stream, StreamExt};

use super::{Discrepancy, RangeFailure, Tiling};
use crate::error::Result;
use crate::range::BlockRange;
use crate::rpc_client::ErrorKind;
use crate::source::{CountSource, LogSource};
use crate::store::RangeCountStore;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub span: BlockRange,
    pub tiling: Tiling,
    pub concurrency: NonZeroUsize,
    /// Check the ranges already stored inside `span` instead of tiling it
    pub stored_ranges: bool,
}

/// A range that did not pass verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationRecord {
    Mismatch(Discrepancy),
    /// No reference count is stored for this range, so it could not be checked
    ReferenceMissing(BlockRange),
    /// The candidate could not produce a count
    CandidateUnreachable(RangeFailure),
}

impl VerificationRecord {
    pub fn range(&self) -> BlockRange {
        match self {
            VerificationRecord::Mismatch(d) => d.range,
            VerificationRecord::ReferenceMissing(range) => *range,
            VerificationRecord::CandidateUnreachable(f) => f.range,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub provider: String,
    /// Issues in ascending range order
    pub records: Vec<VerificationRecord>,
    pub passed: u64,
    /// Part of the span not reached because the run was cancelled
    pub remaining: Option<BlockRange>,
}

impl VerificationReport {
    pub fn discrepancies(&self) -> impl Iterator<Item = &Discrepancy> {
        self.records.iter().filter_map(|r| match r {
            VerificationRecord::Mismatch(d) => Some(d),
            _ => None,
        })
    }

    pub fn reference_missing(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, VerificationRecord::ReferenceMissing(_)))
            .count()
    }

    pub fn unreachable(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, VerificationRecord::CandidateUnreachable(_)))
            .count()
    }

    pub fn cancelled(&self) -> bool {
        self.remaining.is_some()
    }
}

enum Outcome {
    Pass,
    Issue(VerificationRecord),
    Cancelled,
}

/// Compares the candidate's count of every range of `cfg.span` against the stored reference.
pub async fn verify<S: LogSource>(
    cfg: &VerifyConfig,
    candidate: &CountSource<S>,
    store: &RangeCountStore,
) -> Result<VerificationReport> {
    let mut report = VerificationReport {
        provider: candidate.label().to_owned(),
        ..Default::default()
    };

    log::info!("Verifying {} against {}", candidate.label(), cfg.span);

    let ranges: Vec<BlockRange> = if cfg.stored_ranges {
        store
            .iterate(cfg.span)
            .await?
            .into_iter()
            .map(|record| record.range)
            .collect()
    } else {
        cfg.tiling.ranges(cfg.span).collect()
    };

    let mut outcomes = stream::iter(ranges)
        .map(move |range| async move { (range, check_range(range, candidate, store).await) })
        .buffered(cfg.concurrency.get());

    while let Some((range, outcome)) = outcomes.next().await {
        match outcome? {
            Outcome::Pass => report.passed += 1,
            Outcome::Issue(record) => {
                match &record {
                    VerificationRecord::Mismatch(d) => log::warn!(
                        "Discrepancy in {}: {} (reference) vs {} ({})",
                        d.range,
                        d.reference_count,
                        d.test_count,
                        candidate.label()
                    ),
                    VerificationRecord::ReferenceMissing(range) => {
                        log::debug!("No reference count for {}, skipping", range)
                    }
                    VerificationRecord::CandidateUnreachable(f) => {
                        log::warn!("Could not count {}: {}", f.range, f.failure)
                    }
                }
                report.records.push(record);
            }
            Outcome::Cancelled => {
                report.remaining = Some(BlockRange {
                    start: range.start,
                    end: cfg.span.end,
                });
                log::warn!("Verification cancelled at {}", range);
                break;
            }
        }
    }

    log::info!(
        "Done. passed: {}, discrepancies: {}, reference missing: {}, unreachable: {}",
        report.passed,
        report.discrepancies().count(),
        report.reference_missing(),
        report.unreachable()
    );

    Ok(report)
}

async fn check_range<S: LogSource>(
    range: BlockRange,
    candidate: &CountSource<S>,
    store: &RangeCountStore,
) -> Result<Outcome> {
    if candidate.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    let Some(reference) = store.get(range).await? else {
        return Ok(Outcome::Issue(VerificationRecord::ReferenceMissing(range)));
    };

    let outcome = match candidate.count_span(range).await {
        Ok(count) if count == reference.count => Outcome::Pass,
        Ok(count) => Outcome::Issue(VerificationRecord::Mismatch(Discrepancy {
            range,
            reference_count: reference.count,
            test_count: count,
        })),
        Err(e) if e.kind() == ErrorKind::Cancelled => Outcome::Cancelled,
        Err(e) => Outcome::Issue(VerificationRecord::CandidateUnreachable(RangeFailure {
            range,
            failure: e.into(),
        })),
    };

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{counted, error_of_kind, BlockLogs, CancelAfter, Scripted};
    use crate::store::tests::setup_store;
    use std::num::NonZeroU64;

    fn range(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    fn config(span: BlockRange) -> VerifyConfig {
        VerifyConfig {
            span,
            tiling: Tiling::default(),
            concurrency: NonZeroUsize::new(2).unwrap(),
            stored_ranges: false,
        }
    }

    #[tokio::test]
    async fn test_matching_count_passes() {
        let (store, _temp_db) = setup_store().await;
        store.put(range(1000, 1999), 5).await.unwrap();
        let candidate = counted(Scripted::new("candidate", Vec::new(), 5));

        let report = verify(&config(range(1000, 1999)), &candidate, &store)
            .await
            .unwrap();

        assert_eq!(report.passed, 1);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_mismatch_is_reported() {
        let (store, _temp_db) = setup_store().await;
        store.put(range(1000, 1999), 5).await.unwrap();
        let candidate = counted(Scripted::new("candidate", Vec::new(), 3));

        let report = verify(&config(range(1000, 1999)), &candidate, &store)
            .await
            .unwrap();

        assert_eq!(report.passed, 0);
        assert_eq!(
            report.records,
            vec![VerificationRecord::Mismatch(Discrepancy {
                range: range(1000, 1999),
                reference_count: 5,
                test_count: 3,
            })]
        );
    }

    #[tokio::test]
    async fn test_empty_store_only_reports_missing_reference() {
        let (store, _temp_db) = setup_store().await;
        let candidate = counted(Scripted::new("candidate", Vec::new(), 1));

        let report = verify(&config(range(0, 9_999)), &candidate, &store)
            .await
            .unwrap();

        assert_eq!(report.passed, 0);
        assert_eq!(report.discrepancies().count(), 0);
        assert_eq!(report.reference_missing(), 10);
        assert_eq!(candidate.inner().calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_candidate_does_not_stop_run() {
        let (store, _temp_db) = setup_store().await;
        store.put(range(0, 999), 2).await.unwrap();
        store.put(range(1000, 1999), 2).await.unwrap();

        // every attempt of the first range fails, the second range answers
        let script = (0..5)
            .map(|_| Err(error_of_kind(ErrorKind::Transient)))
            .collect();
        let candidate = CountSource::with_policy(
            Scripted::new("candidate", script, 2),
            crate::source::testing::instant_retry(5),
            NonZeroU64::new(1_000).unwrap(),
            tokio_util::sync::CancellationToken::new(),
        );
        let mut cfg = config(range(0, 1999));
        cfg.concurrency = NonZeroUsize::new(1).unwrap();

        let report = verify(&cfg, &candidate, &store).await.unwrap();

        assert_eq!(report.passed, 1);
        assert_eq!(report.unreachable(), 1);
        match &report.records[0] {
            VerificationRecord::CandidateUnreachable(f) => {
                assert_eq!(f.range, range(0, 999));
                assert_eq!(f.failure.kind, ErrorKind::Transient);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_records_are_ordered() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 4_999);
        let reference = BlockLogs::filled("reference", span, |_| 1);
        for r in Tiling::default().ranges(span) {
            if r.start != 2_000 {
                store
                    .put(r, reference.fetch_log_count(r).await.unwrap())
                    .await
                    .unwrap();
            }
        }
        let candidate = counted(
            BlockLogs::filled("candidate", span, |_| 1)
                .set(3_500, 0)
                .set(500, 4),
        );
        let mut cfg = config(span);
        cfg.concurrency = NonZeroUsize::new(4).unwrap();

        let report = verify(&cfg, &candidate, &store).await.unwrap();

        let starts: Vec<_> = report.records.iter().map(|r| r.range().start).collect();
        assert_eq!(starts, vec![0, 2_000, 3_000]);
        assert_eq!(report.passed, 2);
        assert_eq!(report.reference_missing(), 1);
    }

    #[tokio::test]
    async fn test_ranges_wider_than_call_limit_are_chunked() {
        let (store, _temp_db) = setup_store().await;
        store.put(range(0, 1_999), 2_000).await.unwrap();
        store.put(range(2_000, 3_999), 2_000).await.unwrap();
        let span = range(0, 3_999);
        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1));
        let mut cfg = config(span);
        cfg.tiling = Tiling {
            range_size: NonZeroU64::new(2_000).unwrap(),
            step_size: NonZeroU64::new(4_000).unwrap(),
        };

        let report = verify(&cfg, &candidate, &store).await.unwrap();

        assert_eq!(report.passed, 2);
        assert!(report.records.is_empty());
        assert_eq!(candidate.inner().calls(), 4);
    }

    #[tokio::test]
    async fn test_snapped_window_checks_stored_ranges() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 999);
        let tiling = Tiling {
            range_size: NonZeroU64::new(300).unwrap(),
            step_size: NonZeroU64::new(500).unwrap(),
        };
        // 0-299, 300-499, 500-799, 800-999
        for r in tiling.ranges(span) {
            store.put(r, r.width()).await.unwrap();
        }
        let snapped = store.snap_window(310, 999).await.unwrap().unwrap();
        assert_eq!(snapped, range(300, 999));

        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1));
        let cfg = VerifyConfig {
            span: snapped,
            tiling,
            concurrency: NonZeroUsize::new(2).unwrap(),
            stored_ranges: true,
        };

        let report = verify(&cfg, &candidate, &store).await.unwrap();

        assert_eq!(report.passed, 3);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_remaining_span() {
        let (store, _temp_db) = setup_store().await;
        let span = range(0, 2_999);
        for r in Tiling::default().ranges(span) {
            store.put(r, 1_000).await.unwrap();
        }
        let candidate = CancelAfter::counted(BlockLogs::filled("candidate", span, |_| 1), 1);
        let mut cfg = config(span);
        cfg.concurrency = NonZeroUsize::new(1).unwrap();

        let report = verify(&cfg, &candidate, &store).await.unwrap();

        assert_eq!(report.passed, 1);
        assert!(report.cancelled());
        assert_eq!(report.remaining, Some(range(1_000, 2_999)));
        assert!(report.records.is_empty());
    }
}
