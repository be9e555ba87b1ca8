//! Database operations for the outbox engine
//!
//! All durable state lives here: the posts table, the settings key/value
//! store (credentials, throttle bookkeeping), and the monthly quota row.
//! Status changes that race with other sweeps go through guarded UPDATEs
//! so a lost race shows up as zero affected rows, not a clobbered state.

use sqlx::sqlite::SqlitePool;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{PlatformKind, Post, PostStatus};

/// How long a post may sit in `posting` before a sweep treats the claim
/// as stale (a crashed process) and fails it as timed out.
pub const STALE_POSTING_WINDOW_SECS: i64 = 300;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (tests and ephemeral runs).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new post.
    ///
    /// Enforces the structural invariants at the write boundary: a draft
    /// never has a `scheduled_at`, a non-draft always does, and a thread
    /// member must extend its thread gap-free with the same `scheduled_at`
    /// as the existing members.
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        match post.status {
            PostStatus::Draft => {
                if post.scheduled_at.is_some() {
                    return Err(DbError::Constraint(
                        "draft posts cannot have scheduled_at".to_string(),
                    )
                    .into());
                }
            }
            PostStatus::Scheduled => {
                if post.scheduled_at.is_none() {
                    return Err(DbError::Constraint(
                        "scheduled posts require scheduled_at".to_string(),
                    )
                    .into());
                }
            }
            other => {
                return Err(DbError::Constraint(format!(
                    "posts cannot be created in status '{}'",
                    other
                ))
                .into());
            }
        }

        match (&post.thread_id, post.thread_order) {
            (None, None) => {}
            (Some(thread_id), Some(order)) => {
                if order < 1 {
                    return Err(
                        DbError::Constraint("thread_order must be 1-based".to_string()).into(),
                    );
                }
                let members = self.thread_members(thread_id).await?;
                if let Some(first) = members.first() {
                    if first.scheduled_at != post.scheduled_at {
                        return Err(DbError::Constraint(
                            "thread members must share scheduled_at".to_string(),
                        )
                        .into());
                    }
                    if first.platform != post.platform {
                        return Err(DbError::Constraint(
                            "thread members must share a platform".to_string(),
                        )
                        .into());
                    }
                }
                if order != members.len() as i64 + 1 {
                    return Err(DbError::Constraint(format!(
                        "thread_order {} would leave a gap (thread has {} members)",
                        order,
                        members.len()
                    ))
                    .into());
                }
            }
            _ => {
                return Err(DbError::Constraint(
                    "thread_id and thread_order must be set together".to_string(),
                )
                .into());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO posts (id, content, platform, status, scheduled_at, thread_id,
                               thread_order, media_refs, recurring_rule, remote_id,
                               posted_at, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.content)
        .bind(post.platform.as_str())
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(&post.thread_id)
        .bind(post.thread_order)
        .bind(&post.media_refs)
        .bind(&post.recurring_rule)
        .bind(&post.remote_id)
        .bind(post.posted_at)
        .bind(&post.error)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a post by ID
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT id, content, platform, status, scheduled_at, thread_id, thread_order,
                   media_refs, recurring_rule, remote_id, posted_at, error,
                   created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_post(&r)).transpose()
    }

    /// Posts due at `now`: scheduled, `scheduled_at <= now`, ordered by
    /// scheduled time then thread position so thread members come out in
    /// publish order.
    pub async fn due_posts(&self, now: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content, platform, status, scheduled_at, thread_id, thread_order,
                   media_refs, recurring_rule, remote_id, posted_at, error,
                   created_at, updated_at
            FROM posts
            WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
            ORDER BY scheduled_at ASC, thread_id ASC, thread_order ASC, created_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// All members of a thread, in `thread_order`.
    pub async fn thread_members(&self, thread_id: &str) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content, platform, status, scheduled_at, thread_id, thread_order,
                   media_refs, recurring_rule, remote_id, posted_at, error,
                   created_at, updated_at
            FROM posts
            WHERE thread_id = ?
            ORDER BY thread_order ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Validated status update. Reads the current status, checks the
    /// transition table, then writes with the old status as a guard so a
    /// concurrent writer loses cleanly.
    pub async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        let current = self
            .get_post(post_id)
            .await?
            .ok_or_else(|| DbError::Constraint(format!("no such post: {}", post_id)))?;

        if !current.status.can_transition_to(status) {
            return Err(DbError::InvalidTransition(format!(
                "{} -> {}",
                current.status, status
            ))
            .into());
        }

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, updated_at = ? WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(DbError::InvalidTransition(format!(
                "post {} changed status concurrently",
                post_id
            ))
            .into());
        }

        Ok(())
    }

    /// Move a draft (or a failed post being re-queued) to `scheduled` at
    /// `scheduled_at`.
    pub async fn schedule_post(&self, post_id: &str, scheduled_at: i64) -> Result<()> {
        let current = self
            .get_post(post_id)
            .await?
            .ok_or_else(|| DbError::Constraint(format!("no such post: {}", post_id)))?;

        if !current.status.can_transition_to(PostStatus::Scheduled) {
            return Err(DbError::InvalidTransition(format!(
                "{} -> scheduled",
                current.status
            ))
            .into());
        }

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(scheduled_at)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(DbError::InvalidTransition(format!(
                "post {} changed status concurrently",
                post_id
            ))
            .into());
        }

        Ok(())
    }

    /// Claim a scheduled post for publishing. Returns `false` if another
    /// sweep claimed it first (or it is no longer scheduled) — that is the
    /// idempotency guard, not an error.
    pub async fn claim_for_posting(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'posting', updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful publish. Only valid from `posting`.
    pub async fn mark_posted(&self, post_id: &str, remote_id: &str, posted_at: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'posted', remote_id = ?, posted_at = ?,
                             error = NULL, updated_at = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(remote_id)
        .bind(posted_at)
        .bind(posted_at)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(
                DbError::InvalidTransition(format!("post {} is not in posting", post_id)).into(),
            );
        }

        Ok(())
    }

    /// Record a failed publish. Only valid from `posting`. A remote id may
    /// still be recorded for partial thread failures where some items went
    /// out before the group failed.
    pub async fn mark_failed(
        &self,
        post_id: &str,
        error: &str,
        remote_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'failed', error = ?,
                             remote_id = COALESCE(?, remote_id), updated_at = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(error)
        .bind(remote_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(
                DbError::InvalidTransition(format!("post {} is not in posting", post_id)).into(),
            );
        }

        Ok(())
    }

    /// Fail a `scheduled` post without claiming it first. Used when the
    /// monthly quota runs out mid-sweep and the post must not cost a
    /// network call.
    pub async fn fail_scheduled(&self, post_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'failed', error = ?, updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(
                DbError::InvalidTransition(format!("post {} is not scheduled", post_id)).into(),
            );
        }

        Ok(())
    }

    /// Mark posts stuck in `posting` longer than the stale window as
    /// `failed` with a timeout error. The claim may have died before or
    /// after the remote call landed, so the post is never retried
    /// automatically. Returns how many were failed.
    pub async fn fail_stale_posting(&self, now: i64) -> Result<u64> {
        let cutoff = now - STALE_POSTING_WINDOW_SECS;

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'failed', error = 'timed out', updated_at = ?
            WHERE status = 'posting' AND updated_at <= ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Get a settings value by name
    pub async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        use sqlx::Row;

        let row = sqlx::query("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("value")))
    }

    /// Upsert a settings value (last write wins)
    pub async fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (name, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Delete a settings value (no-op when absent)
    pub async fn delete_setting(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn row_to_post(r: &sqlx::sqlite::SqliteRow) -> Result<Post> {
    use sqlx::Row;

    let platform_str: String = r.get("platform");
    let platform = PlatformKind::from_str_opt(&platform_str)
        .ok_or_else(|| DbError::Constraint(format!("unknown platform: {}", platform_str)))?;

    let status = match r.get::<String, _>("status").as_str() {
        "draft" => PostStatus::Draft,
        "scheduled" => PostStatus::Scheduled,
        "posting" => PostStatus::Posting,
        "posted" => PostStatus::Posted,
        "failed" => PostStatus::Failed,
        other => {
            return Err(DbError::Constraint(format!("unknown status: {}", other)).into());
        }
    };

    Ok(Post {
        id: r.get("id"),
        content: r.get("content"),
        platform,
        status,
        scheduled_at: r.get("scheduled_at"),
        thread_id: r.get("thread_id"),
        thread_order: r.get("thread_order"),
        media_refs: r.get("media_refs"),
        recurring_rule: r.get("recurring_rule"),
        remote_id: r.get("remote_id"),
        posted_at: r.get("posted_at"),
        error: r.get("error"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
