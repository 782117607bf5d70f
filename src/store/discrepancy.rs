//! Discrepancies found by verification runs, kept per candidate provider so a later
//! narrowing run can pick them up.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::{to_u64, RangeCountStore};
use crate::error::Result;
use crate::pipeline::Discrepancy;
use crate::range::BlockRange;

pub(super) async fn ensure_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discrepancies (
            start_block     INTEGER NOT NULL,
            end_block       INTEGER NOT NULL,
            provider        TEXT NOT NULL,
            reference_count INTEGER NOT NULL,
            test_count      INTEGER NOT NULL,
            recorded_at     INTEGER NOT NULL,
            PRIMARY KEY (start_block, end_block, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Strips scheme and trailing slashes so textual variants of one endpoint share rows.
pub fn normalize_provider(provider: &str) -> String {
    let p = provider.trim();
    let p = p
        .strip_prefix("https://")
        .or_else(|| p.strip_prefix("http://"))
        .unwrap_or(p);

    p.trim_end_matches('/').to_owned()
}

impl RangeCountStore {
    pub async fn record_discrepancy(
        &self,
        provider: &str,
        discrepancy: &Discrepancy,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discrepancies (start_block, end_block, provider, reference_count, test_count, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(start_block, end_block, provider) DO UPDATE SET
                reference_count = excluded.reference_count,
                test_count = excluded.test_count,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(discrepancy.range.start as i64)
        .bind(discrepancy.range.end as i64)
        .bind(normalize_provider(provider))
        .bind(discrepancy.reference_count as i64)
        .bind(discrepancy.test_count as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All stored discrepancies of `provider`, ascending by start.
    pub async fn discrepancies_for(&self, provider: &str) -> Result<Vec<Discrepancy>> {
        let rows = sqlx::query(
            r#"
            SELECT start_block, end_block, reference_count, test_count
            FROM discrepancies
            WHERE provider = ?
            ORDER BY start_block ASC, end_block ASC
            "#,
        )
        .bind(normalize_provider(provider))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Discrepancy> {
                Ok(Discrepancy {
                    range: BlockRange {
                        start: to_u64("start_block", row.try_get("start_block")?)?,
                        end: to_u64("end_block", row.try_get("end_block")?)?,
                    },
                    reference_count: to_u64("reference_count", row.try_get("reference_count")?)?,
                    test_count: to_u64("test_count", row.try_get("test_count")?)?,
                })
            })
            .collect()
    }

    /// Deletes every stored discrepancy of `provider`, returns the number of rows removed.
    pub async fn clear_discrepancies(&self, provider: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM discrepancies WHERE provider = ?")
            .bind(normalize_provider(provider))
            .execute(&self.pool)
            .await?;

        log::info!(
            "Deleted {} discrepancy rows for provider {}",
            res.rows_affected(),
            provider
        );

        Ok(res.rows_affected())
    }
}
