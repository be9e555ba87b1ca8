//! The sweep state machine and publish orchestrator
//!
//! A sweep is driven entirely by rows: fail claims stranded by a
//! crashed run, load due posts, and for each unit (a single post or a
//! whole thread) reserve quota, claim, publish, and record the
//! outcome. Every step is guarded so that two overlapping sweeps at
//! worst split the work, never double-publish. A stranded claim is
//! failed rather than retried because the crash may have happened
//! after the remote call landed.
//!
//! Clients come through the [`ClientProvider`] seam: the production
//! provider wraps the credential managers (which refresh tokens and
//! resume sessions), tests plug in mock clients.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::{BlueskyCredentialManager, XCredentialManager};
use crate::db::Database;
use crate::error::{OutboxError, PlatformError, Result};
use crate::platforms::PlatformClient;
use crate::quota::QuotaLedger;
use crate::recurrence::next_occurrence;
use crate::types::{PlatformKind, Post, PostStatus, SweepSummary};

/// Hands the scheduler a ready-to-use client per platform. Fetching a
/// client may hit the network (token refresh, session resumption), so
/// the sweep asks once per platform per run and caches the result.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for(&self, kind: PlatformKind) -> Result<Arc<dyn PlatformClient>>;

    /// Force fresh credentials, dropping anything cached upstream. Used
    /// once per sweep when an X call comes back unauthenticated even
    /// though the token was just refreshed.
    async fn refreshed_client(&self, kind: PlatformKind) -> Result<Arc<dyn PlatformClient>> {
        self.client_for(kind).await
    }
}

/// Production provider: builds clients through the credential managers.
/// Each `client_for` call refreshes the X token unconditionally and
/// resumes (or re-establishes) the Bluesky session, so a sweep always
/// starts with live credentials.
pub struct ConfigClientProvider {
    x: Option<XCredentialManager>,
    bluesky: Option<BlueskyCredentialManager>,
}

impl ConfigClientProvider {
    pub fn new(db: Database, config: &Config) -> Result<Self> {
        let x = match &config.x {
            Some(cfg) if cfg.enabled => Some(XCredentialManager::new(db.clone(), cfg.clone())?),
            _ => None,
        };
        let bluesky = match &config.bluesky {
            Some(cfg) if cfg.enabled => {
                Some(BlueskyCredentialManager::new(db.clone(), cfg.clone())?)
            }
            _ => None,
        };
        Ok(Self { x, bluesky })
    }
}

#[async_trait]
impl ClientProvider for ConfigClientProvider {
    async fn client_for(&self, kind: PlatformKind) -> Result<Arc<dyn PlatformClient>> {
        match kind {
            PlatformKind::X => {
                let manager = self.x.as_ref().ok_or_else(|| {
                    PlatformError::NotAuthenticated("X is not configured".to_string())
                })?;
                Ok(Arc::new(manager.client().await?))
            }
            PlatformKind::Bluesky => {
                let manager = self.bluesky.as_ref().ok_or_else(|| {
                    PlatformError::NotAuthenticated("Bluesky is not configured".to_string())
                })?;
                Ok(Arc::new(manager.client().await?))
            }
        }
    }
}

/// Provider over a fixed set of clients. No credential plumbing; the
/// refresh hook hands back the same client.
pub struct FixedClientProvider {
    clients: HashMap<PlatformKind, Arc<dyn PlatformClient>>,
}

impl FixedClientProvider {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, client: Arc<dyn PlatformClient>) -> Self {
        self.clients.insert(client.kind(), client);
        self
    }
}

impl Default for FixedClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientProvider for FixedClientProvider {
    async fn client_for(&self, kind: PlatformKind) -> Result<Arc<dyn PlatformClient>> {
        self.clients.get(&kind).cloned().ok_or_else(|| {
            PlatformError::NotAuthenticated(format!("{} is not configured", kind)).into()
        })
    }
}

/// One publishable unit: a standalone post or a complete thread.
enum SweepUnit {
    Single(Post),
    Thread(Vec<Post>),
}

impl SweepUnit {
    fn posts(&self) -> &[Post] {
        match self {
            SweepUnit::Single(post) => std::slice::from_ref(post),
            SweepUnit::Thread(posts) => posts,
        }
    }
}

pub struct Scheduler {
    db: Database,
    quota: QuotaLedger,
    provider: Arc<dyn ClientProvider>,
}

impl Scheduler {
    pub fn new(db: Database, provider: Arc<dyn ClientProvider>) -> Self {
        let quota = QuotaLedger::new(db.clone());
        Self {
            db,
            quota,
            provider,
        }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    /// Run one sweep at `now` (epoch seconds). Idempotent: re-running
    /// after a crash, or concurrently with another sweep, never publishes
    /// a post twice.
    pub async fn sweep(&self, now: i64) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        // A stranded claim is failed, never retried: the crashed run may
        // have published before it died.
        let stale = self.db.fail_stale_posting(now).await?;
        if stale > 0 {
            info!(count = stale, "failed stale posting claims as timed out");
            summary.processed += stale as usize;
            summary.failed += stale as usize;
        }

        let due = self.db.due_posts(now).await?;
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "due posts found");

        // X publishes consume the monthly quota. An exhausted ledger at
        // sweep start leaves all due X work untouched (skipped);
        // exhaustion mid-sweep fails the unit instead.
        let x_blocked = self.quota.remaining(now).await? <= 0;

        let units = group_units(due);
        let mut clients: HashMap<PlatformKind, Arc<dyn PlatformClient>> = HashMap::new();
        let mut skipped = 0usize;

        for unit in units {
            let posts = unit.posts();
            let kind = posts[0].platform;

            if kind == PlatformKind::X {
                if x_blocked {
                    skipped += posts.len();
                    continue;
                }
                match self.quota.reserve(now, posts.len() as i64).await {
                    Ok(()) => {}
                    Err(OutboxError::QuotaExhausted(_)) => {
                        // A thread needs quota for every member; no
                        // partial attempt, no network calls.
                        for post in posts {
                            self.db
                                .fail_scheduled(&post.id, "rate limit reached")
                                .await?;
                        }
                        summary.processed += posts.len();
                        summary.failed += posts.len();
                        debug!(unit_size = posts.len(), "monthly quota exhausted, unit failed");
                        continue;
                    }
                    Err(other) => return Err(other),
                }
            }

            // Claim every member. Losing a claim means another writer
            // raced us; members already claimed stay in posting and a
            // later sweep fails them as stale.
            let mut all_claimed = true;
            for post in posts {
                if !self.db.claim_for_posting(&post.id, now).await? {
                    all_claimed = false;
                    break;
                }
            }
            if !all_claimed {
                warn!(unit_size = posts.len(), "lost claim race, unit skipped");
                continue;
            }

            summary.processed += posts.len();

            let client = match self.client_for_cached(&mut clients, kind).await {
                Ok(client) => client,
                Err(err) => {
                    let label = error_label(&err);
                    for post in posts {
                        self.db.mark_failed(&post.id, &label, None).await?;
                    }
                    summary.failed += posts.len();
                    continue;
                }
            };

            let published = match &unit {
                SweepUnit::Single(post) => {
                    self.publish_single(&client, &mut clients, post, now).await
                }
                SweepUnit::Thread(posts) => self.publish_thread_unit(&client, posts, now).await,
            };

            if published {
                summary.posted += posts.len();
                if kind == PlatformKind::X {
                    self.quota.commit(now, posts.len() as i64).await?;
                }
            } else {
                summary.failed += posts.len();
            }
        }

        if skipped > 0 {
            summary.skipped = Some(skipped);
        }
        info!(
            processed = summary.processed,
            posted = summary.posted,
            failed = summary.failed,
            skipped,
            "sweep complete"
        );
        Ok(summary)
    }

    /// Publish immediately, outside the sweep. Applies the interactive
    /// safety cap for X before any network traffic. Returns the remote ID.
    pub async fn publish_now(&self, post_id: &str, now: i64) -> Result<String> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| OutboxError::InvalidInput(format!("no such post: {}", post_id)))?;

        if post.is_thread_member() {
            return Err(OutboxError::InvalidInput(
                "thread members publish through the sweep".to_string(),
            ));
        }

        if post.platform == PlatformKind::X {
            self.quota.reserve_interactive(now).await?;
        }

        if post.status == PostStatus::Draft {
            self.db.schedule_post(&post.id, now).await?;
        }
        if !self.db.claim_for_posting(&post.id, now).await? {
            return Err(OutboxError::InvalidInput(format!(
                "post {} is not publishable (status {})",
                post.id, post.status
            )));
        }

        let client = match self.provider.client_for(post.platform).await {
            Ok(client) => client,
            Err(err) => {
                self.db
                    .mark_failed(&post.id, &error_label(&err), None)
                    .await?;
                return Err(err);
            }
        };

        match client.publish(&post).await {
            Ok(remote_id) => {
                self.db.mark_posted(&post.id, &remote_id, now).await?;
                if post.platform == PlatformKind::X {
                    self.quota.commit(now, 1).await?;
                }
                self.spawn_recurrence(&post, now).await?;
                Ok(remote_id)
            }
            Err(err) => {
                self.db
                    .mark_failed(&post.id, &error_label(&err), None)
                    .await?;
                Err(err)
            }
        }
    }

    /// Best-effort remote delete: failures are logged and swallowed. The
    /// local row is untouched either way.
    pub async fn delete_remote(&self, post_id: &str) -> Result<()> {
        let Some(post) = self.db.get_post(post_id).await? else {
            return Ok(());
        };
        let Some(remote_id) = &post.remote_id else {
            return Ok(());
        };

        match self.provider.client_for(post.platform).await {
            Ok(client) => {
                if let Err(err) = client.delete_post(remote_id).await {
                    warn!(post_id, remote_id, "remote delete failed: {}", err);
                }
            }
            Err(err) => {
                warn!(post_id, "remote delete skipped, no client: {}", err);
            }
        }
        Ok(())
    }

    async fn client_for_cached(
        &self,
        cache: &mut HashMap<PlatformKind, Arc<dyn PlatformClient>>,
        kind: PlatformKind,
    ) -> Result<Arc<dyn PlatformClient>> {
        if let Some(client) = cache.get(&kind) {
            return Ok(client.clone());
        }
        let client = self.provider.client_for(kind).await?;
        cache.insert(kind, client.clone());
        Ok(client)
    }

    /// Publish a single post. Returns whether it landed; on failure the
    /// post is marked failed.
    async fn publish_single(
        &self,
        client: &Arc<dyn PlatformClient>,
        cache: &mut HashMap<PlatformKind, Arc<dyn PlatformClient>>,
        post: &Post,
        now: i64,
    ) -> bool {
        let mut result = client.publish(post).await;

        // A just-refreshed X token can still bounce when the refresh
        // raced a revocation. One forced re-refresh, then give up.
        if post.platform == PlatformKind::X {
            if let Err(OutboxError::Platform(PlatformError::NotAuthenticated(_))) = &result {
                debug!(post_id = %post.id, "X call unauthenticated, forcing token refresh");
                match self.provider.refreshed_client(PlatformKind::X).await {
                    Ok(fresh) => {
                        cache.insert(PlatformKind::X, fresh.clone());
                        result = fresh.publish(post).await;
                    }
                    Err(err) => result = Err(err),
                }
            }
        }

        match result {
            Ok(remote_id) => {
                if self.db.mark_posted(&post.id, &remote_id, now).await.is_err() {
                    warn!(post_id = %post.id, "published but row left posting state");
                    return false;
                }
                if let Err(err) = self.spawn_recurrence(post, now).await {
                    warn!(post_id = %post.id, "failed to spawn recurrence: {}", err);
                }
                true
            }
            Err(err) => {
                let label = error_label(&err);
                if let Err(db_err) = self.db.mark_failed(&post.id, &label, None).await {
                    warn!(post_id = %post.id, "failed to record failure: {}", db_err);
                }
                false
            }
        }
    }

    /// Publish a whole thread atomically from the caller's view. On a
    /// group failure every member is marked failed and nothing is
    /// counted as posted, but members that did publish keep their
    /// remote IDs for reconciliation.
    async fn publish_thread_unit(
        &self,
        client: &Arc<dyn PlatformClient>,
        posts: &[Post],
        now: i64,
    ) -> bool {
        match client.publish_thread(posts).await {
            Ok(remote_ids) => {
                for (post, remote_id) in posts.iter().zip(remote_ids.iter()) {
                    if let Err(err) = self.db.mark_posted(&post.id, remote_id, now).await {
                        warn!(post_id = %post.id, "published but row left posting state: {}", err);
                    }
                }
                true
            }
            Err(err) => {
                let (published, label) = match &err {
                    OutboxError::Platform(PlatformError::PartialThread {
                        published, total, ..
                    }) => (
                        published.clone(),
                        format!("{} of {} thread items published: {}", published.len(), total, err),
                    ),
                    other => (Vec::new(), error_label(other)),
                };

                for (index, post) in posts.iter().enumerate() {
                    let remote_id = published.get(index).map(String::as_str);
                    if let Err(db_err) = self.db.mark_failed(&post.id, &label, remote_id).await {
                        warn!(post_id = %post.id, "failed to record failure: {}", db_err);
                    }
                }
                false
            }
        }
    }

    /// After a successful publish of a recurring post, create the next
    /// occurrence as a fresh scheduled row. The terminal row is never
    /// reused. A malformed rule drops the recurrence with a warning.
    async fn spawn_recurrence(&self, post: &Post, now: i64) -> Result<()> {
        let Some(rule) = &post.recurring_rule else {
            return Ok(());
        };
        if post.is_thread_member() {
            return Ok(());
        }

        match next_occurrence(rule, now) {
            Some(next_at) => {
                let mut next = Post::new_scheduled(post.content.clone(), post.platform, next_at);
                next.media_refs = post.media_refs.clone();
                next.recurring_rule = Some(rule.clone());
                self.db.create_post(&next).await?;
                debug!(post_id = %post.id, next_id = %next.id, next_at, "spawned next occurrence");
            }
            None => {
                warn!(post_id = %post.id, rule, "malformed recurrence rule, not rescheduling");
            }
        }
        Ok(())
    }
}

/// Group due posts (already ordered by time, thread, position) into
/// publishable units. A thread with a gap or a missing member is split
/// out and will fail its precondition downstream; creation-side checks
/// make that unreachable in practice.
fn group_units(due: Vec<Post>) -> Vec<SweepUnit> {
    let mut units = Vec::new();
    let mut current_thread: Option<(String, Vec<Post>)> = None;

    for post in due {
        match &post.thread_id {
            Some(thread_id) => {
                match &mut current_thread {
                    Some((id, members)) if id == thread_id => members.push(post),
                    Some((_, members)) => {
                        units.push(SweepUnit::Thread(std::mem::take(members)));
                        current_thread = Some((thread_id.clone(), vec![post]));
                    }
                    None => current_thread = Some((thread_id.clone(), vec![post])),
                }
            }
            None => {
                if let Some((_, members)) = current_thread.take() {
                    units.push(SweepUnit::Thread(members));
                }
                units.push(SweepUnit::Single(post));
            }
        }
    }
    if let Some((_, members)) = current_thread {
        units.push(SweepUnit::Thread(members));
    }
    units
}

/// Map a publish failure to the short, human-readable label stored on
/// the post row.
fn error_label(err: &OutboxError) -> String {
    match err {
        OutboxError::Platform(PlatformError::RateLimited { .. }) => {
            "rate limit reached".to_string()
        }
        OutboxError::Platform(PlatformError::NotAuthenticated(_)) => {
            "not authenticated".to_string()
        }
        OutboxError::Platform(PlatformError::Transient(msg)) if msg == "timed out" => {
            "timed out".to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockClient;

    fn scheduled(content: &str, kind: PlatformKind, at: i64) -> Post {
        Post::new_scheduled(content.to_string(), kind, at)
    }

    async fn setup(client: MockClient) -> (Database, Scheduler, Arc<MockClient>) {
        let db = Database::in_memory().await.unwrap();
        let client = Arc::new(client);
        let provider =
            Arc::new(FixedClientProvider::new().with_client(client.clone() as Arc<dyn PlatformClient>));
        let scheduler = Scheduler::new(db.clone(), provider);
        (db, scheduler, client)
    }

    #[tokio::test]
    async fn test_sweep_publishes_due_posts() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;

        let due = scheduled("due", PlatformKind::X, 100);
        let future = scheduled("future", PlatformKind::X, 10_000);
        db.create_post(&due).await.unwrap();
        db.create_post(&future).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.posted, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, None);

        let fetched = db.get_post(&due.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Posted);
        assert!(fetched.remote_id.is_some());
        assert_eq!(fetched.posted_at, Some(1_000));

        let untouched = db.get_post(&future.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, PostStatus::Scheduled);
        assert_eq!(client.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_empty_is_noop() {
        let (_db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(client.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_forwards_media_refs() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let mut post = scheduled("photo post", PlatformKind::X, 100);
        post.media_refs = Some(r#"["m-1","m-2"]"#.to_string());
        db.create_post(&post).await.unwrap();

        scheduler.sweep(1_000).await.unwrap();
        assert_eq!(
            client.published_media(),
            vec![vec!["m-1".to_string(), "m-2".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let post = scheduled("once", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        scheduler.sweep(1_000).await.unwrap();
        let summary = scheduler.sweep(1_001).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(client.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_marks_failed_with_label() {
        let (db, scheduler, _client) = setup(MockClient::failing(
            PlatformKind::X,
            PlatformError::RateLimited {
                message: "429".to_string(),
                reset_at: None,
            },
        ))
        .await;
        let post = scheduled("blocked", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.failed, 1);

        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Failed);
        assert_eq!(fetched.error, Some("rate limit reached".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_timeout_label() {
        let (db, scheduler, _client) = setup(MockClient::failing(
            PlatformKind::X,
            PlatformError::Transient("timed out".to_string()),
        ))
        .await;
        let post = scheduled("slow", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        scheduler.sweep(1_000).await.unwrap();
        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.error, Some("timed out".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_unconfigured_platform_fails_posts() {
        let db = Database::in_memory().await.unwrap();
        let provider = Arc::new(FixedClientProvider::new());
        let scheduler = Scheduler::new(db.clone(), provider);

        let post = scheduled("nowhere", PlatformKind::Bluesky, 100);
        db.create_post(&post).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.failed, 1);
        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.error, Some("not authenticated".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_skips_when_quota_exhausted_at_start() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let post = scheduled("over quota", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        scheduler
            .quota()
            .commit(1_000, crate::quota::MONTHLY_HARD_CAP)
            .await
            .unwrap();

        // Already exhausted when the sweep starts: short-circuit, the
        // post is left scheduled and untouched.
        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, Some(1));
        assert_eq!(client.publish_call_count(), 0);

        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_quota_does_not_gate_bluesky() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::Bluesky)).await;
        let post = scheduled("free", PlatformKind::Bluesky, 100);
        db.create_post(&post).await.unwrap();

        scheduler
            .quota()
            .commit(1_000, crate::quota::MONTHLY_HARD_CAP)
            .await
            .unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.posted, 1);
        assert_eq!(summary.skipped, None);
    }

    #[tokio::test]
    async fn test_sweep_thread_atomic_success() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::Bluesky)).await;
        for (order, content) in [(1, "one"), (2, "two"), (3, "three")] {
            let mut member = scheduled(content, PlatformKind::Bluesky, 100);
            member.thread_id = Some("t1".to_string());
            member.thread_order = Some(order);
            db.create_post(&member).await.unwrap();
        }

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.posted, 3);
        assert_eq!(client.published_content(), vec!["one", "two", "three"]);

        for member in db.thread_members("t1").await.unwrap() {
            assert_eq!(member.status, PostStatus::Posted);
            assert!(member.remote_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_partial_thread_failure() {
        let (db, scheduler, _client) = setup(MockClient::failing_thread_at(
            PlatformKind::Bluesky,
            2,
            PlatformError::Transient("boom".to_string()),
        ))
        .await;
        for order in 1..=3 {
            let mut member = scheduled(&format!("item {}", order), PlatformKind::Bluesky, 100);
            member.thread_id = Some("t1".to_string());
            member.thread_order = Some(order);
            db.create_post(&member).await.unwrap();
        }

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 3);
        // The group failed; nothing counts as posted even though two
        // items reached the platform.
        assert_eq!(summary.posted, 0);

        let members = db.thread_members("t1").await.unwrap();
        for member in &members {
            // Uniform terminal status across the thread.
            assert_eq!(member.status, PostStatus::Failed);
            let error = member.error.as_deref().unwrap();
            assert!(error.contains("2 of 3"));
        }
        // The published members keep their remote IDs for reconciliation.
        assert!(members[0].remote_id.is_some());
        assert!(members[1].remote_id.is_some());
        assert!(members[2].remote_id.is_none());
    }

    #[tokio::test]
    async fn test_partial_thread_does_not_consume_quota() {
        let (db, scheduler, _client) = setup(MockClient::failing_thread_at(
            PlatformKind::X,
            1,
            PlatformError::Transient("boom".to_string()),
        ))
        .await;
        for order in 1..=2 {
            let mut member = scheduled(&format!("item {}", order), PlatformKind::X, 100);
            member.thread_id = Some("t1".to_string());
            member.thread_order = Some(order);
            db.create_post(&member).await.unwrap();
        }

        scheduler.sweep(1_000).await.unwrap();

        // The counter only ever reflects posts that transitioned to
        // posted; a failed group adds nothing.
        assert_eq!(scheduler.quota().used(1_000).await.unwrap(), 0);
        for member in db.thread_members("t1").await.unwrap() {
            assert_eq!(member.status, PostStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_sweep_thread_needs_quota_for_all_members() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        for order in 1..=3 {
            let mut member = scheduled(&format!("item {}", order), PlatformKind::X, 100);
            member.thread_id = Some("t1".to_string());
            member.thread_order = Some(order);
            db.create_post(&member).await.unwrap();
        }

        // Two left under the cap: a three-item thread fails whole, with
        // no partial attempt.
        scheduler
            .quota()
            .commit(1_000, crate::quota::MONTHLY_HARD_CAP - 2)
            .await
            .unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(client.publish_call_count(), 0);

        for member in db.thread_members("t1").await.unwrap() {
            assert_eq!(member.status, PostStatus::Failed);
            assert_eq!(member.error, Some("rate limit reached".to_string()));
        }
    }

    #[tokio::test]
    async fn test_quota_boundary_fails_excess_singles() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let post = scheduled(&format!("post {}", i), PlatformKind::X, 100 + i);
            ids.push(post.id.clone());
            db.create_post(&post).await.unwrap();
        }

        // Two left under the cap: the first two publish, the third is
        // failed without a network call.
        scheduler
            .quota()
            .commit(1_000, crate::quota::MONTHLY_HARD_CAP - 2)
            .await
            .unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.posted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(client.publish_call_count(), 2);

        let first = db.get_post(&ids[0]).await.unwrap().unwrap();
        assert_eq!(first.status, PostStatus::Posted);
        let second = db.get_post(&ids[1]).await.unwrap().unwrap();
        assert_eq!(second.status, PostStatus::Posted);
        let third = db.get_post(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.status, PostStatus::Failed);
        assert_eq!(third.error, Some("rate limit reached".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_commits_quota_per_success() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::X)).await;
        for i in 0..3 {
            db.create_post(&scheduled(&format!("post {}", i), PlatformKind::X, 100))
                .await
                .unwrap();
        }

        scheduler.sweep(1_000).await.unwrap();
        assert_eq!(scheduler.quota().used(1_000).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sweep_fails_stale_claim() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let post = scheduled("stuck", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        // Simulate a crashed sweep: claimed long ago, never resolved.
        let crash_time = 1_000;
        db.claim_for_posting(&post.id, crash_time).await.unwrap();

        let now = crash_time + crate::db::STALE_POSTING_WINDOW_SECS + 1;
        let summary = scheduler.sweep(now).await.unwrap();

        // The crash may have happened after the remote call landed, so
        // the post is failed, never republished.
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.posted, 0);
        assert_eq!(client.publish_call_count(), 0);

        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Failed);
        assert_eq!(fetched.error, Some("timed out".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_claim_alone() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let post = scheduled("in flight", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();
        db.claim_for_posting(&post.id, 990).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(client.publish_call_count(), 0);
        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Posting);
    }

    #[tokio::test]
    async fn test_recurrence_spawns_next_occurrence() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::Bluesky)).await;
        // 2026-02-10T06:00:00Z
        let now = 1_770_703_200;
        let mut post = scheduled("daily update", PlatformKind::Bluesky, now - 100);
        post.recurring_rule = Some("daily:09:00".to_string());
        db.create_post(&post).await.unwrap();

        scheduler.sweep(now).await.unwrap();

        let due_later = db.due_posts(i64::MAX).await.unwrap();
        assert_eq!(due_later.len(), 1);
        let next = &due_later[0];
        assert_ne!(next.id, post.id);
        assert_eq!(next.content, "daily update");
        assert_eq!(next.recurring_rule, Some("daily:09:00".to_string()));
        // Next day, 09:00 UTC.
        assert_eq!(next.scheduled_at, Some(1_770_800_400));
    }

    #[tokio::test]
    async fn test_malformed_recurrence_drops_silently() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::X)).await;
        let mut post = scheduled("broken rule", PlatformKind::X, 100);
        post.recurring_rule = Some("hourly:now".to_string());
        db.create_post(&post).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.posted, 1);
        // No next occurrence spawned.
        assert!(db.due_posts(i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_spawn_recurrence() {
        let (db, scheduler, _client) = setup(MockClient::failing(
            PlatformKind::X,
            PlatformError::Transient("down".to_string()),
        ))
        .await;
        let mut post = scheduled("recurring", PlatformKind::X, 100);
        post.recurring_rule = Some("daily:09:00".to_string());
        db.create_post(&post).await.unwrap();

        scheduler.sweep(1_000).await.unwrap();
        assert!(db.due_posts(i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_now_from_draft() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::X)).await;
        let draft = Post::new_draft("right now".to_string(), PlatformKind::X);
        db.create_post(&draft).await.unwrap();

        let remote_id = scheduler.publish_now(&draft.id, 1_000).await.unwrap();
        assert!(remote_id.starts_with("x:mock-"));

        let fetched = db.get_post(&draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Posted);
        assert_eq!(scheduler.quota().used(1_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_now_blocked_by_safety_cap() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::X)).await;
        let draft = Post::new_draft("too late".to_string(), PlatformKind::X);
        db.create_post(&draft).await.unwrap();

        scheduler
            .quota()
            .commit(1_000, crate::quota::INTERACTIVE_SAFETY_CAP)
            .await
            .unwrap();

        let result = scheduler.publish_now(&draft.id, 1_000).await;
        assert!(matches!(result, Err(OutboxError::QuotaExhausted(_))));
        // Blocked before any network traffic, post untouched.
        assert_eq!(client.publish_call_count(), 0);
        let fetched = db.get_post(&draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Draft);
    }

    #[tokio::test]
    async fn test_publish_now_rejects_thread_member() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::X)).await;
        let mut member = scheduled("threaded", PlatformKind::X, 100);
        member.thread_id = Some("t1".to_string());
        member.thread_order = Some(1);
        db.create_post(&member).await.unwrap();

        let result = scheduler.publish_now(&member.id, 1_000).await;
        assert!(matches!(result, Err(OutboxError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_publish_now_rejects_posted() {
        let (db, scheduler, _client) = setup(MockClient::success(PlatformKind::X)).await;
        let post = scheduled("already out", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();
        db.claim_for_posting(&post.id, 200).await.unwrap();
        db.mark_posted(&post.id, "remote-1", 250).await.unwrap();

        let result = scheduler.publish_now(&post.id, 1_000).await;
        assert!(matches!(result, Err(OutboxError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_remote_best_effort() {
        let (db, scheduler, client) = setup(MockClient::success(PlatformKind::Bluesky)).await;
        let post = scheduled("gone soon", PlatformKind::Bluesky, 100);
        db.create_post(&post).await.unwrap();
        db.claim_for_posting(&post.id, 200).await.unwrap();
        db.mark_posted(&post.id, "at://did:plc:a/app.bsky.feed.post/1", 250)
            .await
            .unwrap();

        scheduler.delete_remote(&post.id).await.unwrap();
        assert_eq!(client.deleted_ids().len(), 1);

        // No remote id: silently nothing to do.
        let draft = Post::new_draft("local only".to_string(), PlatformKind::Bluesky);
        db.create_post(&draft).await.unwrap();
        scheduler.delete_remote(&draft.id).await.unwrap();
        assert_eq!(client.deleted_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_remote_swallows_failures() {
        let (db, scheduler, _client) = setup(MockClient::failing(
            PlatformKind::Bluesky,
            PlatformError::Transient("down".to_string()),
        ))
        .await;
        let post = scheduled("stuck remote", PlatformKind::Bluesky, 100);
        db.create_post(&post).await.unwrap();
        db.claim_for_posting(&post.id, 200).await.unwrap();
        db.mark_posted(&post.id, "at://x/y/z", 250).await.unwrap();

        // Failure is logged, not surfaced.
        scheduler.delete_remote(&post.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_x_unauthenticated_forces_one_refresh() {
        // Provider whose first client always bounces and whose refreshed
        // client succeeds.
        struct FlakyProvider {
            stale: Arc<MockClient>,
            fresh: Arc<MockClient>,
        }

        #[async_trait]
        impl ClientProvider for FlakyProvider {
            async fn client_for(&self, _kind: PlatformKind) -> Result<Arc<dyn PlatformClient>> {
                Ok(self.stale.clone())
            }
            async fn refreshed_client(
                &self,
                _kind: PlatformKind,
            ) -> Result<Arc<dyn PlatformClient>> {
                Ok(self.fresh.clone())
            }
        }

        let db = Database::in_memory().await.unwrap();
        let stale = Arc::new(MockClient::failing(
            PlatformKind::X,
            PlatformError::NotAuthenticated("token revoked".to_string()),
        ));
        let fresh = Arc::new(MockClient::success(PlatformKind::X));
        let provider = Arc::new(FlakyProvider {
            stale: stale.clone(),
            fresh: fresh.clone(),
        });
        let scheduler = Scheduler::new(db.clone(), provider);

        let post = scheduled("retry me", PlatformKind::X, 100);
        db.create_post(&post).await.unwrap();

        let summary = scheduler.sweep(1_000).await.unwrap();
        assert_eq!(summary.posted, 1);
        assert_eq!(stale.publish_call_count(), 1);
        assert_eq!(fresh.publish_call_count(), 1);

        let fetched = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Posted);
    }

    #[tokio::test]
    async fn test_error_label_mapping() {
        assert_eq!(
            error_label(&OutboxError::Platform(PlatformError::RateLimited {
                message: "429".to_string(),
                reset_at: Some(5),
            })),
            "rate limit reached"
        );
        assert_eq!(
            error_label(&OutboxError::Platform(PlatformError::NotAuthenticated(
                "nope".to_string()
            ))),
            "not authenticated"
        );
        assert_eq!(
            error_label(&OutboxError::Platform(PlatformError::Transient(
                "timed out".to_string()
            ))),
            "timed out"
        );
        // Other transients keep their detail.
        let label = error_label(&OutboxError::Platform(PlatformError::Transient(
            "503 from upstream".to_string(),
        )));
        assert!(label.contains("503 from upstream"));
    }
}
