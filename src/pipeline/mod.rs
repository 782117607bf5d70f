use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::range::BlockRange;
use crate::source::CountFailure;

pub mod narrow;
pub mod populate;
pub mod verify;

pub use narrow::{
    narrow, Inconclusive, InconsistencyViolation, NarrowConfig, NarrowingReport, NarrowingResult,
};
pub use populate::{populate, PopulateConfig, PopulationReport};
pub use verify::{verify, VerificationRecord, VerificationReport, VerifyConfig};

/// A range where the candidate's count differs from the stored reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub range: BlockRange,
    pub reference_count: u64,
    pub test_count: u64,
}

/// How a span is cut into stored ranges. Verification has to use the same tiling
/// as the population run it checks against, otherwise lookups do not line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiling {
    #[serde(default = "default_range_size")]
    pub range_size: NonZeroU64,
    #[serde(default = "default_step_size")]
    pub step_size: NonZeroU64,
}

impl Default for Tiling {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
            step_size: default_step_size(),
        }
    }
}

impl Tiling {
    pub fn ranges(&self, span: BlockRange) -> impl Iterator<Item = BlockRange> {
        span.tile(self.range_size, self.step_size)
    }
}

pub fn default_range_size() -> NonZeroU64 {
    NonZeroU64::new(1_000).unwrap()
}

pub fn default_step_size() -> NonZeroU64 {
    NonZeroU64::new(10_000).unwrap()
}

/// A range that could not be counted, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFailure {
    pub range: BlockRange,
    pub failure: CountFailure,
}
