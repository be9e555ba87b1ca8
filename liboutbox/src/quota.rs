//! Monthly publishing quota ledger
//!
//! One row per calendar month in `monthly_quota`, created on first use.
//! The ledger is the only writer; the sweep reads `remaining` once up
//! front and commits exactly once per successful publish. `commit` is an
//! atomic upsert increment, so concurrent sweeps can at worst overshoot
//! by the number of in-flight publishes, never lose a count.

use chrono::{Datelike, TimeZone, Utc};
use sqlx::Row;

use crate::db::Database;
use crate::error::{DbError, OutboxError, Result};

/// Hard platform cap on publishes per calendar month.
pub const MONTHLY_HARD_CAP: i64 = 1500;

/// Lower cap applied to the interactive publish path, keeping headroom
/// for the scheduled sweep.
pub const INTERACTIVE_SAFETY_CAP: i64 = 1400;

#[derive(Clone)]
pub struct QuotaLedger {
    db: Database,
}

impl QuotaLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The `"YYYY-MM"` key for the month containing `now` (UTC).
    pub fn month_key(now: i64) -> String {
        let dt = Utc
            .timestamp_opt(now, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default());
        format!("{:04}-{:02}", dt.year(), dt.month())
    }

    /// Publishes already committed for the month containing `now`.
    pub async fn used(&self, now: i64) -> Result<i64> {
        let month = Self::month_key(now);
        let row = sqlx::query("SELECT tweets_posted FROM monthly_quota WHERE month = ?")
            .bind(&month)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get::<i64, _>("tweets_posted")).unwrap_or(0))
    }

    /// Publishes still allowed this month under the hard cap.
    pub async fn remaining(&self, now: i64) -> Result<i64> {
        Ok((MONTHLY_HARD_CAP - self.used(now).await?).max(0))
    }

    /// Check that `count` publishes fit under the hard cap, without
    /// consuming anything.
    pub async fn reserve(&self, now: i64, count: i64) -> Result<()> {
        let remaining = self.remaining(now).await?;
        if count > remaining {
            return Err(OutboxError::QuotaExhausted(format!(
                "{}: {} of {} used, {} requested",
                Self::month_key(now),
                MONTHLY_HARD_CAP - remaining,
                MONTHLY_HARD_CAP,
                count
            )));
        }
        Ok(())
    }

    /// Check the interactive safety cap (1400) for a single publish-now.
    pub async fn reserve_interactive(&self, now: i64) -> Result<()> {
        let used = self.used(now).await?;
        if used + 1 > INTERACTIVE_SAFETY_CAP {
            return Err(OutboxError::QuotaExhausted(format!(
                "{}: {} of {} interactive cap used",
                Self::month_key(now),
                used,
                INTERACTIVE_SAFETY_CAP
            )));
        }
        Ok(())
    }

    /// Record `count` successful publishes against the month containing
    /// `now`. Creates the month row on first use.
    pub async fn commit(&self, now: i64, count: i64) -> Result<()> {
        let month = Self::month_key(now);
        sqlx::query(
            r#"
            INSERT INTO monthly_quota (month, tweets_posted, last_posted_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(month) DO UPDATE SET
                tweets_posted = tweets_posted + excluded.tweets_posted,
                last_posted_at = excluded.last_posted_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&month)
        .bind(count)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}
