//! X (API v2) platform client
//!
//! Publishes over the v2 tweets endpoint with a bearer access token the
//! credential manager refreshed just before handing this client out.
//! Publishes are NOT retried here: the monthly quota makes every publish
//! attempt expensive, so a failure goes straight back to the caller. The
//! one exception lives in the scheduler, which asks for one forced token
//! refresh when a call comes back unauthenticated mid-sweep.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{PlatformError, Result};
use crate::platforms::PlatformClient;
use crate::types::{PlatformKind, Post};

/// X counts raw characters (not graphemes) against this limit.
pub const X_CHAR_LIMIT: usize = 280;

const HTTP_TIMEOUT_SECS: u64 = 30;

pub struct XClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
}

#[derive(Deserialize)]
struct TweetResponse {
    data: TweetData,
}

#[derive(Deserialize)]
struct TweetData {
    id: String,
}

impl XClient {
    pub fn new(api_base: &str, access_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// Map an HTTP response to the publish error taxonomy. Pure on its
    /// inputs so classification is testable without a network.
    pub fn classify_response(
        status: u16,
        body: &str,
        rate_limit_reset: Option<i64>,
    ) -> PlatformError {
        match status {
            401 | 403 => PlatformError::NotAuthenticated(format!("X returned {}: {}", status, body)),
            429 => PlatformError::RateLimited {
                message: format!("X returned 429: {}", body),
                reset_at: rate_limit_reset,
            },
            400 | 422 => PlatformError::Validation(format!("X rejected the post: {}", body)),
            _ => PlatformError::Transient(format!("X returned {}: {}", status, body)),
        }
    }

    /// Build the create-tweet body. Media handles were uploaded out of
    /// band; they are forwarded as-is.
    fn build_payload(content: &str, media_ids: &[String], reply_to: Option<&str>) -> Value {
        let mut payload = json!({ "text": content });
        if !media_ids.is_empty() {
            payload["media"] = json!({ "media_ids": media_ids });
        }
        if let Some(tweet_id) = reply_to {
            payload["reply"] = json!({ "in_reply_to_tweet_id": tweet_id });
        }
        payload
    }

    async fn create_tweet(
        &self,
        content: &str,
        media_ids: &[String],
        reply_to: Option<&str>,
    ) -> Result<String> {
        let payload = Self::build_payload(content, media_ids, reply_to);

        let response = self
            .http
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status().as_u16();
        if status == 201 || status == 200 {
            let parsed: TweetResponse = response.json().await.map_err(|e| {
                PlatformError::Transient(format!("malformed response from X: {}", e))
            })?;
            return Ok(parsed.data.id);
        }

        let reset = header_i64(&response, "x-rate-limit-reset");
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify_response(status, &body, reset).into())
    }
}

#[async_trait]
impl PlatformClient for XClient {
    fn kind(&self) -> PlatformKind {
        PlatformKind::X
    }

    fn content_limit(&self) -> usize {
        X_CHAR_LIMIT
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation("content is empty".to_string()).into());
        }
        let chars = content.chars().count();
        if chars > X_CHAR_LIMIT {
            return Err(PlatformError::Validation(format!(
                "content is {} characters, limit is {}",
                chars, X_CHAR_LIMIT
            ))
            .into());
        }
        Ok(())
    }

    async fn publish(&self, post: &Post) -> Result<String> {
        self.validate_content(&post.content)?;
        self.create_tweet(&post.content, &post.media_ref_list(), None)
            .await
    }

    async fn publish_thread(&self, posts: &[Post]) -> Result<Vec<String>> {
        for post in posts {
            self.validate_content(&post.content)?;
        }

        let mut remote_ids: Vec<String> = Vec::with_capacity(posts.len());
        for post in posts {
            let reply_to = remote_ids.last().map(String::as_str);
            match self
                .create_tweet(&post.content, &post.media_ref_list(), reply_to)
                .await
            {
                Ok(id) => remote_ids.push(id),
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
        let response = self
            .http
            .delete(format!("{}/2/tweets/{}", self.api_base, remote_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(());
        }
        let reset = header_i64(&response, "x-rate-limit-reset");
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify_response(status, &body, reset).into())
    }
}

fn classify_request_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Transient("timed out".to_string())
    } else {
        PlatformError::Transient(format!("request failed: {}", e))
    }
}

fn header_i64(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
