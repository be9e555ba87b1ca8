//! Core types for the outbox engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The platforms a post can target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    X,
    Bluesky,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Bluesky => "bluesky",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "x" => Some(Self::X),
            "bluesky" => Some(Self::Bluesky),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a post.
///
/// The set is closed and every mutation is validated against
/// [`PostStatus::can_transition_to`]. `Posted` is terminal; `Failed` can
/// only be re-queued by an explicit reschedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Posting,
    Posted,
    Failed,
}

impl PostStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Legal edges:
    /// - `draft -> scheduled`
    /// - `scheduled -> posting` (claim by a sweep)
    /// - `scheduled -> failed` (quota exhausted at sweep time)
    /// - `posting -> posted` / `posting -> failed` (outcome, or a stale
    ///   claim timed out)
    /// - `failed -> scheduled` (manual re-queue)
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Posting)
                | (Scheduled, Failed)
                | (Posting, Posted)
                | (Posting, Failed)
                | (Failed, Scheduled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Posted | PostStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Posting => "posting",
            Self::Posted => "posted",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A post in the outbox.
///
/// Thread membership is expressed with `thread_id` plus a 1-based,
/// gap-free `thread_order`; all members of a thread share the same
/// `scheduled_at`. `media_refs` is an opaque JSON array of media handles
/// passed through to the platform client untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub platform: PlatformKind,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub thread_id: Option<String>,
    pub thread_order: Option<i64>,
    pub media_refs: Option<String>,
    pub recurring_rule: Option<String>,
    pub remote_id: Option<String>,
    pub posted_at: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// Create a new draft (no `scheduled_at`, not yet eligible for any sweep).
    pub fn new_draft(content: String, platform: PlatformKind) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            platform,
            status: PostStatus::Draft,
            scheduled_at: None,
            thread_id: None,
            thread_order: None,
            media_refs: None,
            recurring_rule: None,
            remote_id: None,
            posted_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a post scheduled for `scheduled_at` (epoch seconds).
    pub fn new_scheduled(content: String, platform: PlatformKind, scheduled_at: i64) -> Self {
        let mut post = Self::new_draft(content, platform);
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(scheduled_at);
        post
    }

    pub fn is_thread_member(&self) -> bool {
        self.thread_id.is_some()
    }

    /// The stored media handles, in order. `media_refs` holds a JSON
    /// array of already-uploaded platform handles; a missing or
    /// malformed value reads as no media.
    pub fn media_ref_list(&self) -> Vec<String> {
        self.media_refs
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Result of one sweep run, serialized as the JSON summary the caller sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Posts this sweep acted on (claimed, published, failed, or
    /// failed as a stale claim).
    pub processed: usize,
    pub posted: usize,
    pub failed: usize,
    /// Posts left untouched because the monthly quota was already
    /// exhausted when the sweep started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<usize>,
    /// Set when the sweep itself could not run (not per-post failures).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
