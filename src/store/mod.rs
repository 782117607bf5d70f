//! SQLite backed range count store.
//!
//! Holds the reference counts keyed by `(start_block, end_block, role)` and the
//! discrepancies found by verification runs (see [`discrepancy`]).

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::range::BlockRange;

pub mod discrepancy;

/// Logical role a stored count was fetched for. Only reference counts are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderRole {
    Reference,
}

impl ProviderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderRole::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRecord {
    pub range: BlockRange,
    pub provider_role: ProviderRole,
    pub count: u64,
    pub fetched_at: DateTime<Utc>,
}

impl CountRecord {
    pub fn reference(range: BlockRange, count: u64) -> Self {
        Self {
            range,
            provider_role: ProviderRole::Reference,
            count,
            // second precision, that is what the column keeps
            fetched_at: DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeCountStore {
    pool: SqlitePool,
}

impl RangeCountStore {
    /// Connects to `database_url` (e.g. "sqlite://logcounts.db"), creating the file if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        log::info!("Connecting to range count store: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_tables().await?;

        Ok(store)
    }

    pub async fn new_with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url).await
    }

    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_ranges (
                start_block INTEGER NOT NULL,
                end_block   INTEGER NOT NULL,
                role        TEXT NOT NULL,
                count       INTEGER NOT NULL,
                fetched_at  INTEGER NOT NULL,
                PRIMARY KEY (start_block, end_block, role)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        discrepancy::ensure_table(&self.pool).await
    }

    pub async fn close(&self) {
        log::info!("Closing range count store");
        self.pool.close().await;
    }

    /// Upserts the reference count for exactly `range`.
    pub async fn put(&self, range: BlockRange, count: u64) -> Result<()> {
        self.put_record(&CountRecord::reference(range, count)).await
    }

    /// Last write wins for an identical `(start, end, role)`.
    pub async fn put_record(&self, record: &CountRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO log_ranges (start_block, end_block, role, count, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(start_block, end_block, role) DO UPDATE SET
                count = excluded.count,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(record.range.start as i64)
        .bind(record.range.end as i64)
        .bind(record.provider_role.as_str())
        .bind(record.count as i64)
        .bind(record.fetched_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Exact range lookup, overlapping records are not aggregated.
    pub async fn get(&self, range: BlockRange) -> Result<Option<CountRecord>> {
        let row = sqlx::query(
            r#"
            SELECT start_block, end_block, count, fetched_at
            FROM log_ranges
            WHERE start_block = ? AND end_block = ? AND role = ?
            "#,
        )
        .bind(range.start as i64)
        .bind(range.end as i64)
        .bind(ProviderRole::Reference.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Reference records lying entirely inside `span`, ascending by start.
    /// Sub-ranges without a record are simply absent, they are not zero counts.
    pub async fn iterate(&self, span: BlockRange) -> Result<Vec<CountRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT start_block, end_block, count, fetched_at
            FROM log_ranges
            WHERE role = ? AND start_block >= ? AND end_block <= ?
            ORDER BY start_block ASC, end_block ASC
            "#,
        )
        .bind(ProviderRole::Reference.as_str())
        .bind(span.start as i64)
        .bind(span.end as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Moves `from` / `to` onto the closest stored range start / end.
    /// Returns `None` if the store holds no reference records.
    pub async fn snap_window(&self, from: u64, to: u64) -> Result<Option<BlockRange>> {
        let start = self.closest_boundary("start_block", from).await?;
        let end = self.closest_boundary("end_block", to).await?;

        Ok(match (start, end) {
            (Some(s), Some(e)) => Some(BlockRange {
                start: s.min(e),
                end: s.max(e),
            }),
            _ => None,
        })
    }

    async fn closest_boundary(&self, column: &'static str, target: u64) -> Result<Option<u64>> {
        let sql = format!(
            "SELECT {column} FROM log_ranges WHERE role = ? \
             ORDER BY ABS({column} - ?) ASC, {column} ASC LIMIT 1"
        );

        let value: Option<i64> = sqlx::query_scalar(&sql)
            .bind(ProviderRole::Reference.as_str())
            .bind(target as i64)
            .fetch_optional(&self.pool)
            .await?;

        value.map(|v| to_u64(column, v)).transpose()
    }
}

pub(crate) fn to_u64(column: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::CorruptRow { column, value })
}

fn record_from_row(row: &SqliteRow) -> Result<CountRecord> {
    let fetched_at: i64 = row.try_get("fetched_at")?;

    Ok(CountRecord {
        range: BlockRange {
            start: to_u64("start_block", row.try_get("start_block")?)?,
            end: to_u64("end_block", row.try_get("end_block")?)?,
        },
        provider_role: ProviderRole::Reference,
        count: to_u64("count", row.try_get("count")?)?,
        fetched_at: DateTime::from_timestamp(fetched_at, 0).unwrap_or_default(),
    })
}
