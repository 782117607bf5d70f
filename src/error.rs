use std::result::Result as StdResult;
use thiserror::Error as ThisError;

/// Errors that abort a whole run. Per-range provider failures are never reported through this type.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Invalid block range: start {start} is greater than end {end}.")]
    InvalidRange { start: u64, end: u64 },
    #[error("Range count store failed:\n{0}")]
    Store(#[from] sqlx::Error),
    #[error("Stored value {value} in column {column} does not fit into u64.")]
    CorruptRow { column: &'static str, value: i64 },
}

pub type Result<T> = StdResult<T, Error>;
