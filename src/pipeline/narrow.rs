//! Bisection of a discrepant range down to the blocks that explain it.
//!
//! Pending ranges are processed level by level. Each one is split at its midpoint and
//! both halves are counted on both providers. Only discrepant halves are split again.
//! The two reference halves must sum to their parent's reference count.

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use super::Discrepancy;
use crate::range::BlockRange;
use crate::source::{CountFailure, CountSource, LogSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrowConfig {
    /// Ranges this wide or narrower are not split any further
    #[serde(default = "default_min_width")]
    pub min_width: NonZeroU64,
}

impl Default for NarrowConfig {
    fn default() -> Self {
        Self {
            min_width: default_min_width(),
        }
    }
}

pub fn default_min_width() -> NonZeroU64 {
    NonZeroU64::new(1).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarrowingResult {
    pub range: BlockRange,
    pub reference_count: u64,
    pub test_count: u64,
    /// `range` is at the width floor. A non minimal result is the narrowest range
    /// the mismatch could be pinned to.
    pub is_minimal: bool,
}

/// A half that could not be counted on at least one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconclusive {
    pub range: BlockRange,
    pub reference: Option<CountFailure>,
    pub candidate: Option<CountFailure>,
}

/// `left_count + right_count != parent_count` on the reference provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistencyViolation {
    pub parent: BlockRange,
    pub parent_count: u64,
    pub left_count: u64,
    pub right_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrowingReport {
    pub discrepancy: Discrepancy,
    pub results: Vec<NarrowingResult>,
    pub inconclusive: Vec<Inconclusive>,
    pub inconsistencies: Vec<InconsistencyViolation>,
    /// Number of bisection levels performed
    pub levels: u32,
    pub cancelled: bool,
}

pub async fn narrow<R: LogSource, C: LogSource>(
    cfg: &NarrowConfig,
    discrepancy: &Discrepancy,
    reference: &CountSource<R>,
    candidate: &CountSource<C>,
) -> NarrowingReport {
    let mut report = NarrowingReport {
        discrepancy: *discrepancy,
        results: Vec::new(),
        inconclusive: Vec::new(),
        inconsistencies: Vec::new(),
        levels: 0,
        cancelled: false,
    };

    log::info!(
        "Narrowing {} (reference {} vs {} from {})",
        discrepancy.range,
        discrepancy.reference_count,
        discrepancy.test_count,
        candidate.label()
    );

    let mut pending = vec![NarrowingResult {
        range: discrepancy.range,
        reference_count: discrepancy.reference_count,
        test_count: discrepancy.test_count,
        is_minimal: false,
    }];

    while !pending.is_empty() {
        if reference.is_cancelled() || candidate.is_cancelled() {
            report.cancelled = true;
            report.results.append(&mut pending);
            break;
        }

        let mut next = Vec::new();
        let mut split_any = false;

        for node in pending {
            let halves = match node.range.split() {
                Some(halves) if node.range.width() > cfg.min_width.get() => halves,
                _ => {
                    report.results.push(NarrowingResult {
                        is_minimal: true,
                        ..node
                    });
                    continue;
                }
            };
            split_any = true;

            let (left, right) = halves;
            let (ref_left, ref_right, test_left, test_right) = tokio::join!(
                reference.count_span(left),
                reference.count_span(right),
                candidate.count_span(left),
                candidate.count_span(right),
            );

            if let (Ok(l), Ok(r)) = (&ref_left, &ref_right) {
                if l.saturating_add(*r) != node.reference_count {
                    log::warn!(
                        "Reference counts are not additive: {} = {} but {} + {} = {} + {}",
                        node.range,
                        node.reference_count,
                        left,
                        right,
                        l,
                        r
                    );
                    report.inconsistencies.push(InconsistencyViolation {
                        parent: node.range,
                        parent_count: node.reference_count,
                        left_count: *l,
                        right_count: *r,
                    });
                }
            }

            let mut explained = false;

            for (range, ref_count, test_count) in
                [(left, ref_left, test_left), (right, ref_right, test_right)]
            {
                match (ref_count, test_count) {
                    (Ok(reference_count), Ok(test_count)) => {
                        if reference_count != test_count {
                            next.push(NarrowingResult {
                                range,
                                reference_count,
                                test_count,
                                is_minimal: false,
                            });
                            explained = true;
                        }
                    }
                    (ref_count, test_count) => {
                        let half = Inconclusive {
                            range,
                            reference: ref_count.err().map(CountFailure::from),
                            candidate: test_count.err().map(CountFailure::from),
                        };
                        log::warn!("Narrowing is incomplete for {}: {:?}", range, half);
                        report.inconclusive.push(half);
                        explained = true;
                    }
                }
            }

            if !explained {
                // both halves agree although the parent did not
                log::warn!(
                    "Mismatch in {} does not reproduce in {} or {}",
                    node.range,
                    left,
                    right
                );
                report.results.push(node);
            }
        }

        if split_any {
            report.levels += 1;
        }
        pending = next;
    }

    report.results.sort_by_key(|r| r.range);
    report.inconclusive.sort_by_key(|r| r.range);
    report.inconsistencies.sort_by_key(|r| r.parent);

    for r in report.results.iter() {
        log::info!(
            "{} block range {}: reference={} test={}",
            if r.is_minimal { "Minimal" } else { "Narrowest" },
            r.range,
            r.reference_count,
            r.test_count
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_client::ErrorKind;
    use crate::source::testing::{counted, BlockLogs, CancelAfter};

    fn range(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    async fn discrepancy_of(
        span: BlockRange,
        reference: &CountSource<BlockLogs>,
        candidate: &CountSource<BlockLogs>,
    ) -> Discrepancy {
        Discrepancy {
            range: span,
            reference_count: reference.count_span(span).await.unwrap(),
            test_count: candidate.count_span(span).await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_single_block_discrepancy() {
        for (width, bad_block) in [(16u64, 11u64), (1000, 1), (1000, 999), (37, 20), (2, 1)] {
            let span = range(0, width - 1);
            let reference = counted(BlockLogs::filled("reference", span, |b| b % 3));
            let candidate = counted(
                BlockLogs::filled("candidate", span, |b| b % 3).set(bad_block, 7),
            );
            let d = discrepancy_of(span, &reference, &candidate).await;

            let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

            assert_eq!(
                report.results,
                vec![NarrowingResult {
                    range: BlockRange::single(bad_block),
                    reference_count: bad_block % 3,
                    test_count: 7,
                    is_minimal: true,
                }]
            );
            assert!(report.inconclusive.is_empty());
            assert!(report.inconsistencies.is_empty());
            let max_levels = 64 - (width - 1).leading_zeros();
            assert!(report.levels <= max_levels, "{} levels for width {}", report.levels, width);
        }
    }

    #[tokio::test]
    async fn test_bisects_and_prunes_matching_half() {
        // reference 5 logs in 1000..=1999, candidate misses two of them in the right half
        let span = range(1000, 1999);
        let reference = counted(
            BlockLogs::new("reference")
                .set(1100, 1)
                .set(1200, 1)
                .set(1600, 1)
                .set(1700, 1)
                .set(1800, 1),
        );
        let candidate = counted(
            BlockLogs::new("candidate")
                .set(1100, 1)
                .set(1200, 1)
                .set(1600, 1),
        );
        let d = Discrepancy {
            range: span,
            reference_count: 5,
            test_count: 3,
        };

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        let ranges: Vec<_> = report.results.iter().map(|r| r.range).collect();
        assert_eq!(ranges, vec![BlockRange::single(1700), BlockRange::single(1800)]);
        assert!(report.results.iter().all(|r| r.is_minimal));
        assert!(report.inconsistencies.is_empty());
        assert!(report.levels <= 10);
    }

    #[tokio::test]
    async fn test_min_width_floor() {
        let span = range(0, 63);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1).set(37, 0));
        let d = discrepancy_of(span, &reference, &candidate).await;
        let cfg = NarrowConfig {
            min_width: NonZeroU64::new(8).unwrap(),
        };

        let report = narrow(&cfg, &d, &reference, &candidate).await;

        assert_eq!(
            report.results,
            vec![NarrowingResult {
                range: range(32, 39),
                reference_count: 8,
                test_count: 7,
                is_minimal: true,
            }]
        );
        assert_eq!(report.levels, 3);
    }

    #[tokio::test]
    async fn test_unreachable_half_is_inconclusive() {
        let span = range(0, 15);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        let candidate = counted(
            BlockLogs::filled("candidate", span, |_| 1)
                .set(3, 0)
                .fail_overlapping(range(12, 12), ErrorKind::Transient),
        );
        let d = Discrepancy {
            range: span,
            reference_count: 16,
            test_count: 14,
        };

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].range, BlockRange::single(3));
        assert_eq!(report.inconclusive.len(), 1);
        let half = &report.inconclusive[0];
        assert_eq!(half.range, range(8, 15));
        assert!(half.reference.is_none());
        assert_eq!(half.candidate.as_ref().unwrap().kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_stale_reference_is_flagged() {
        let span = range(0, 7);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1).set(6, 3));
        // the stored reference count predates a change upstream
        let d = Discrepancy {
            range: span,
            reference_count: 9,
            test_count: 10,
        };

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        assert_eq!(
            report.inconsistencies,
            vec![InconsistencyViolation {
                parent: span,
                parent_count: 9,
                left_count: 4,
                right_count: 4,
            }]
        );
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].range, BlockRange::single(6));
    }

    #[tokio::test]
    async fn test_mismatch_that_does_not_reproduce() {
        let span = range(0, 7);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1));
        let d = Discrepancy {
            range: span,
            reference_count: 8,
            test_count: 6,
        };

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        assert_eq!(
            report.results,
            vec![NarrowingResult {
                range: span,
                reference_count: 8,
                test_count: 6,
                is_minimal: false,
            }]
        );
        assert_eq!(report.levels, 1);
    }

    #[tokio::test]
    async fn test_wider_than_call_limit() {
        let span = range(0, 3_999);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        let candidate = counted(BlockLogs::filled("candidate", span, |_| 1).set(2_500, 0));
        let d = discrepancy_of(span, &reference, &candidate).await;

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        assert!(report.inconclusive.is_empty());
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].range, BlockRange::single(2_500));
        assert!(report.results[0].is_minimal);
    }

    #[tokio::test]
    async fn test_cancelled_returns_pending_ranges() {
        let span = range(0, 15);
        let reference = counted(BlockLogs::filled("reference", span, |_| 1));
        // the token fires on the second candidate call, i.e. after the first level
        let candidate =
            CancelAfter::counted(BlockLogs::filled("candidate", span, |_| 1).set(3, 0), 2);
        let d = Discrepancy {
            range: span,
            reference_count: 16,
            test_count: 15,
        };

        let report = narrow(&NarrowConfig::default(), &d, &reference, &candidate).await;

        assert!(report.cancelled);
        assert_eq!(report.levels, 1);
        assert_eq!(
            report.results,
            vec![NarrowingResult {
                range: range(0, 7),
                reference_count: 8,
                test_count: 7,
                is_minimal: false,
            }]
        );
    }
}
