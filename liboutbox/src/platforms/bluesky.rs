//! Bluesky (AT Protocol) platform client
//!
//! Publishes over raw XRPC. Unlike the X client, calls here run inside a
//! classified retry wrapper: rate limits are honored with a bounded
//! sleep, transient failures back off exponentially with jitter, and an
//! expired access token triggers one in-place session rotation that is
//! persisted through the `SessionStore` hook before the call is retried.
//! Bluesky has no monthly quota, so retries are cheap.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::credentials::{BlueskySession, SessionStore};
use crate::error::{PlatformError, Result};
use crate::platforms::PlatformClient;
use crate::types::{PlatformKind, Post};

/// Bluesky counts grapheme clusters (what a user sees as one character),
/// not raw chars.
pub const BLUESKY_GRAPHEME_LIMIT: usize = 300;

/// Attempts per logical call, counting the first.
const MAX_ATTEMPTS: u32 = 3;
/// Longest a rate-limit sleep may last, whatever the platform advertises.
const RATE_LIMIT_SLEEP_CAP_SECS: i64 = 60;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;
const HTTP_TIMEOUT_SECS: u64 = 30;

const POST_COLLECTION: &str = "app.bsky.feed.post";

pub struct BlueskyClient {
    http: reqwest::Client,
    service: String,
    session: Mutex<BlueskySession>,
    store: Arc<dyn SessionStore>,
}

/// Reference to a created record: the AT URI is the durable remote ID,
/// the CID is needed to build reply chains.
#[derive(Debug, Clone, Deserialize)]
struct CreatedRecord {
    uri: String,
    cid: String,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

impl BlueskyClient {
    pub fn new(
        service: &str,
        session: BlueskySession,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            service: service.trim_end_matches('/').to_string(),
            session: Mutex::new(session),
            store,
        })
    }

    /// Map an XRPC error response to the publish taxonomy. Pure on its
    /// inputs so classification is testable without a network.
    pub fn classify_response(
        status: u16,
        error_name: &str,
        message: &str,
        rate_limit_reset: Option<i64>,
    ) -> PlatformError {
        match (status, error_name) {
            (429, _) | (_, "RateLimitExceeded") => PlatformError::RateLimited {
                message: format!("bluesky rate limited: {}", message),
                reset_at: rate_limit_reset,
            },
            (401, _) | (_, "ExpiredToken") | (_, "InvalidToken") | (_, "AuthenticationRequired") => {
                PlatformError::NotAuthenticated(format!("bluesky: {} {}", error_name, message))
            }
            (400, "InvalidRequest") => {
                PlatformError::Validation(format!("bluesky rejected the record: {}", message))
            }
            _ => PlatformError::Transient(format!(
                "bluesky returned {} {}: {}",
                status, error_name, message
            )),
        }
    }

    async fn create_record_once(&self, record: &Value) -> Result<CreatedRecord> {
        let (access_jwt, did) = {
            let session = self.session.lock().await;
            (session.access_jwt.clone(), session.did.clone())
        };

        let response = self
            .http
            .post(format!("{}/xrpc/com.atproto.repo.createRecord", self.service))
            .bearer_auth(access_jwt)
            .json(&json!({
                "repo": did,
                "collection": POST_COLLECTION,
                "record": record,
            }))
            .send()
            .await
            .map_err(classify_request_error)?;

        if response.status().is_success() {
            let created: CreatedRecord = response.json().await.map_err(|e| {
                PlatformError::Transient(format!("malformed createRecord response: {}", e))
            })?;
            return Ok(created);
        }

        Err(self.response_to_error(response).await.into())
    }

    async fn response_to_error(&self, response: reqwest::Response) -> PlatformError {
        let status = response.status().as_u16();
        let reset = response
            .headers()
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body: XrpcErrorBody = response.json().await.unwrap_or(XrpcErrorBody {
            error: String::new(),
            message: String::new(),
        });
        Self::classify_response(status, &body.error, &body.message, reset)
    }

    /// Rotate the session in place with the stored refresh JWT and
    /// persist the rotation before anything else happens.
    async fn rotate_session(&self) -> Result<()> {
        let refresh_jwt = self.session.lock().await.refresh_jwt.clone();

        let response = self
            .http
            .post(format!(
                "{}/xrpc/com.atproto.server.refreshSession",
                self.service
            ))
            .bearer_auth(refresh_jwt)
            .send()
            .await
            .map_err(classify_request_error)?;

        if !response.status().is_success() {
            return Err(self.response_to_error(response).await.into());
        }

        let fresh: BlueskySession = response.json().await.map_err(|e| {
            PlatformError::Transient(format!("malformed refreshSession response: {}", e))
        })?;

        self.store.save_session(&fresh).await?;
        *self.session.lock().await = fresh;
        debug!("bluesky session rotated mid-call");
        Ok(())
    }

    /// Run `create_record_once` under the retry policy: rate-limit sleeps
    /// capped at [`RATE_LIMIT_SLEEP_CAP_SECS`], exponential backoff with
    /// jitter for transient failures, one session rotation for an expired
    /// token, and a hard bound of [`MAX_ATTEMPTS`] attempts.
    async fn create_record_with_retry(&self, record: &Value) -> Result<CreatedRecord> {
        let mut rotated = false;

        for attempt in 1..=MAX_ATTEMPTS {
            let err = match self.create_record_once(record).await {
                Ok(created) => return Ok(created),
                Err(crate::error::OutboxError::Platform(err)) => err,
                Err(other) => return Err(other),
            };

            match &err {
                PlatformError::NotAuthenticated(_) if !rotated => {
                    // One rotation per logical call. If the fresh token
                    // also bounces, the session is genuinely dead.
                    rotated = true;
                    self.rotate_session().await?;
                    continue;
                }
                PlatformError::RateLimited { reset_at, .. } if attempt < MAX_ATTEMPTS => {
                    let now = chrono::Utc::now().timestamp();
                    let wait = reset_at
                        .map(|r| (r - now).clamp(1, RATE_LIMIT_SLEEP_CAP_SECS))
                        .unwrap_or(RATE_LIMIT_SLEEP_CAP_SECS);
                    warn!(wait_secs = wait, "bluesky rate limited, sleeping");
                    tokio::time::sleep(Duration::from_secs(wait as u64)).await;
                }
                PlatformError::Transient(msg) if attempt < MAX_ATTEMPTS => {
                    let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt - 1)
                        + rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
                    debug!(attempt, backoff_ms = backoff, "bluesky transient error, retrying: {}", msg);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                _ => return Err(err.into()),
            }
        }

        Err(PlatformError::Transient("retries exhausted".to_string()).into())
    }

    fn build_record(content: &str, media_refs: &[String], reply: Option<&Value>) -> Value {
        let mut record = json!({
            "$type": POST_COLLECTION,
            "text": content,
            "createdAt": chrono::Utc::now().to_rfc3339(),
        });
        if !media_refs.is_empty() {
            // Blobs were uploaded out of band; each stored handle is
            // either the blob object itself or its CID link.
            let images: Vec<Value> = media_refs
                .iter()
                .map(|handle| {
                    let image = serde_json::from_str::<Value>(handle)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({ "$type": "blob", "ref": { "$link": handle } }));
                    json!({ "alt": "", "image": image })
                })
                .collect();
            record["embed"] = json!({
                "$type": "app.bsky.embed.images",
                "images": images,
            });
        }
        if let Some(reply) = reply {
            record["reply"] = reply.clone();
        }
        record
    }
}

#[async_trait]
impl PlatformClient for BlueskyClient {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Bluesky
    }

    fn content_limit(&self) -> usize {
        BLUESKY_GRAPHEME_LIMIT
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation("content is empty".to_string()).into());
        }
        let graphemes = content.graphemes(true).count();
        if graphemes > BLUESKY_GRAPHEME_LIMIT {
            return Err(PlatformError::Validation(format!(
                "content is {} graphemes, limit is {}",
                graphemes, BLUESKY_GRAPHEME_LIMIT
            ))
            .into());
        }
        Ok(())
    }

    async fn publish(&self, post: &Post) -> Result<String> {
        self.validate_content(&post.content)?;
        let record = Self::build_record(&post.content, &post.media_ref_list(), None);
        let created = self.create_record_with_retry(&record).await?;
        Ok(created.uri)
    }

    async fn publish_thread(&self, posts: &[Post]) -> Result<Vec<String>> {
        for post in posts {
            self.validate_content(&post.content)?;
        }

        let mut root: Option<CreatedRecord> = None;
        let mut parent: Option<CreatedRecord> = None;
        let mut remote_ids: Vec<String> = Vec::with_capacity(posts.len());

        for post in posts {
            let reply = match (&root, &parent) {
                (Some(root), Some(parent)) => Some(json!({
                    "root": { "uri": root.uri, "cid": root.cid },
                    "parent": { "uri": parent.uri, "cid": parent.cid },
                })),
                _ => None,
            };

            let record =
                Self::build_record(&post.content, &post.media_ref_list(), reply.as_ref());
            match self.create_record_with_retry(&record).await {
                Ok(created) => {
                    remote_ids.push(created.uri.clone());
                    if root.is_none() {
                        root = Some(created.clone());
                    }
                    parent = Some(created);
                }
                Err(err) => {
                    if remote_ids.is_empty() {
                        return Err(err);
                    }
                    return Err(PlatformError::PartialThread {
                        published: remote_ids,
                        total: posts.len(),
                        message: err.to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(remote_ids)
    }

    async fn delete_post(&self, remote_id: &str) -> Result<()> {
        let (repo, collection, rkey) = parse_at_uri(remote_id).ok_or_else(|| {
            PlatformError::Validation(format!("not an AT URI: {}", remote_id))
        })?;

        let access_jwt = self.session.lock().await.access_jwt.clone();
        let response = self
            .http
            .post(format!("{}/xrpc/com.atproto.repo.deleteRecord", self.service))
            .bearer_auth(access_jwt)
            .json(&json!({
                "repo": repo,
                "collection": collection,
                "rkey": rkey,
            }))
            .send()
            .await
            .map_err(classify_request_error)?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(self.response_to_error(response).await.into())
    }
}

fn classify_request_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Transient("timed out".to_string())
    } else {
        PlatformError::Transient(format!("request failed: {}", e))
    }
}

/// Split `at://did:plc:xyz/app.bsky.feed.post/rkey` into its parts.
fn parse_at_uri(uri: &str) -> Option<(&str, &str, &str)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let repo = parts.next()?;
    let collection = parts.next()?;
    let rkey = parts.next()?;
    if repo.is_empty() || collection.is_empty() || rkey.is_empty() {
        return None;
    }
    Some((repo, collection, rkey))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::BlueskySession;
    use crate::error::Result;

    struct NullStore;

    #[async_trait]
    impl SessionStore for NullStore {
        async fn save_session(&self, _session: &BlueskySession) -> Result<()> {
            Ok(())
        }
    }

    fn client() -> BlueskyClient {
        let session = BlueskySession {
            access_jwt: "access".to_string(),
            refresh_jwt: "refresh".to_string(),
            did: "did:plc:abc".to_string(),
            handle: "alice.test".to_string(),
        };
        BlueskyClient::new("https://bsky.social", session, Arc::new(NullStore)).unwrap()
    }

    #[test]
    fn test_validate_content_empty() {
        assert!(client().validate_content("").is_err());
        assert!(client().validate_content(" \n ").is_err());
    }

    #[test]
    fn test_validate_grapheme_limit() {
        let content = "a".repeat(BLUESKY_GRAPHEME_LIMIT);
        assert!(client().validate_content(&content).is_ok());

        let content = "a".repeat(BLUESKY_GRAPHEME_LIMIT + 1);
        assert!(client().validate_content(&content).is_err());
    }

    #[test]
    fn test_graphemes_diverge_from_chars() {
        // A family emoji is one grapheme but seven chars (four scalars
        // joined by ZWJs). 300 of them blow the char count to 2100 while
        // staying exactly at the grapheme limit.
        let family = "\u{1F469}\u{200D}\u{1F469}\u{200D}\u{1F467}\u{200D}\u{1F466}";
        assert_eq!(family.graphemes(true).count(), 1);
        assert!(family.chars().count() > 1);

        let content = family.repeat(BLUESKY_GRAPHEME_LIMIT);
        assert!(client().validate_content(&content).is_ok());

        let content = family.repeat(BLUESKY_GRAPHEME_LIMIT + 1);
        assert!(client().validate_content(&content).is_err());
    }

    #[test]
    fn test_classify_rate_limited() {
        let err = BlueskyClient::classify_response(429, "", "slow down", Some(1_700_000_000));
        assert!(matches!(err, PlatformError::RateLimited { .. }));

        // Named error without the 429 status classifies the same way.
        let err = BlueskyClient::classify_response(400, "RateLimitExceeded", "slow down", None);
        assert!(matches!(err, PlatformError::RateLimited { .. }));
    }

    #[test]
    fn test_classify_auth_errors() {
        for (status, name) in [
            (401u16, ""),
            (400, "ExpiredToken"),
            (400, "InvalidToken"),
            (400, "AuthenticationRequired"),
        ] {
            let err = BlueskyClient::classify_response(status, name, "msg", None);
            assert!(
                matches!(err, PlatformError::NotAuthenticated(_)),
                "{} {}",
                status,
                name
            );
        }
    }

    #[test]
    fn test_classify_validation_and_transient() {
        let err = BlueskyClient::classify_response(400, "InvalidRequest", "record too long", None);
        assert!(matches!(err, PlatformError::Validation(_)));

        // Unknown errors default to transient so they stay retryable.
        let err = BlueskyClient::classify_response(500, "InternalServerError", "oops", None);
        assert!(matches!(err, PlatformError::Transient(_)));
        let err = BlueskyClient::classify_response(400, "SomethingNew", "???", None);
        assert!(matches!(err, PlatformError::Transient(_)));
    }

    #[test]
    fn test_parse_at_uri() {
        let uri = "at://did:plc:abc123/app.bsky.feed.post/3k44deefuo52a";
        let (repo, collection, rkey) = parse_at_uri(uri).unwrap();
        assert_eq!(repo, "did:plc:abc123");
        assert_eq!(collection, "app.bsky.feed.post");
        assert_eq!(rkey, "3k44deefuo52a");

        assert!(parse_at_uri("https://bsky.social/whatever").is_none());
        assert!(parse_at_uri("at://did:plc:abc123").is_none());
        assert!(parse_at_uri("at://did:plc:abc123/coll/").is_none());
    }

    #[test]
    fn test_build_record_reply_shape() {
        let reply = json!({
            "root": { "uri": "at://r", "cid": "cid-r" },
            "parent": { "uri": "at://p", "cid": "cid-p" },
        });
        let record = BlueskyClient::build_record("hello", &[], Some(&reply));
        assert_eq!(record["$type"], "app.bsky.feed.post");
        assert_eq!(record["text"], "hello");
        assert_eq!(record["reply"]["root"]["uri"], "at://r");
        assert_eq!(record["reply"]["parent"]["cid"], "cid-p");

        let record = BlueskyClient::build_record("hello", &[], None);
        assert!(record.get("reply").is_none());
        assert!(record.get("embed").is_none());
    }

    #[test]
    fn test_build_record_forwards_media_handles() {
        // A bare CID handle is wrapped as a blob link.
        let media = vec!["bafy-cid-1".to_string()];
        let record = BlueskyClient::build_record("pic", &media, None);
        assert_eq!(record["embed"]["$type"], "app.bsky.embed.images");
        assert_eq!(
            record["embed"]["images"][0]["image"]["ref"]["$link"],
            "bafy-cid-1"
        );

        // A stored blob object passes through untouched.
        let blob = r#"{"$type":"blob","ref":{"$link":"bafy-cid-2"},"mimeType":"image/png","size":512}"#;
        let record = BlueskyClient::build_record("pic", &[blob.to_string()], None);
        assert_eq!(record["embed"]["images"][0]["image"]["mimeType"], "image/png");
        assert_eq!(
            record["embed"]["images"][0]["image"]["ref"]["$link"],
            "bafy-cid-2"
        );
    }
}
