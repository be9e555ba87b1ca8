//! Mock platform client for testing
//!
//! This module provides a configurable mock client that can simulate
//! successes, scripted failures, partial thread failures, and delays.
//! It's designed for use in integration tests to verify the sweep logic
//! without requiring platform credentials or network access.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::PlatformClient;
use crate::types::{PlatformKind, Post};

/// Configuration for mock client behavior
#[derive(Clone)]
pub struct MockConfig {
    /// Which platform this mock pretends to be
    pub kind: PlatformKind,

    /// Content limit for validation
    pub content_limit: usize,

    /// Error returned by every publish, when set
    pub publish_error: Option<PlatformError>,

    /// Fail the thread item at this 0-based index (earlier items succeed)
    pub fail_thread_at: Option<usize>,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    /// Number of times publish (or a thread item) has been attempted
    pub publish_call_count: Arc<Mutex<usize>>,

    /// Content that was published (for verification)
    pub published_content: Arc<Mutex<Vec<String>>>,

    /// Media handles forwarded with each published item (for verification)
    pub published_media: Arc<Mutex<Vec<Vec<String>>>>,

    /// Remote IDs that were deleted (for verification)
    pub deleted_ids: Arc<Mutex<Vec<String>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            kind: PlatformKind::X,
            content_limit: 280,
            publish_error: None,
            fail_thread_at: None,
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            published_content: Arc::new(Mutex::new(Vec::new())),
            published_media: Arc::new(Mutex::new(Vec::new())),
            deleted_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock client for testing
pub struct MockClient {
    config: MockConfig,
}

impl MockClient {
    /// Create a new mock client with the given configuration
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Create a mock client that always succeeds
    pub fn success(kind: PlatformKind) -> Self {
        Self::new(MockConfig {
            kind,
            ..Default::default()
        })
    }

    /// Create a mock client whose every publish fails with `error`
    pub fn failing(kind: PlatformKind, error: PlatformError) -> Self {
        Self::new(MockConfig {
            kind,
            publish_error: Some(error),
            ..Default::default()
        })
    }

    /// Create a mock client that fails the thread item at `index`
    /// (0-based); earlier items succeed.
    pub fn failing_thread_at(kind: PlatformKind, index: usize, error: PlatformError) -> Self {
        Self::new(MockConfig {
            kind,
            publish_error: Some(error),
            fail_thread_at: Some(index),
            ..Default::default()
        })
    }

    /// Create a mock client with a delay
    pub fn with_delay(kind: PlatformKind, delay: Duration) -> Self {
        Self::new(MockConfig {
            kind,
            delay,
            ..Default::default()
        })
    }

    /// Get the number of publish attempts made
    pub fn publish_call_count(&self) -> usize {
        *self.config.publish_call_count.lock().unwrap()
    }

    /// Get all content that was published
    pub fn published_content(&self) -> Vec<String> {
        self.config.published_content.lock().unwrap().clone()
    }

    /// Get the media handles forwarded with each published item
    pub fn published_media(&self) -> Vec<Vec<String>> {
        self.config.published_media.lock().unwrap().clone()
    }

    /// Get all remote IDs that were deleted
    pub fn deleted_ids(&self) -> Vec<String> {
        self.config.deleted_ids.lock().unwrap().clone()
    }

    async fn publish_one(&self, content: &str) -> Result<String> {
        *self.config.publish_call_count.lock().unwrap() += 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if let Some(error) = &self.config.publish_error {
            return Err(error.clone().into());
        }

        self.config
            .published_content
            .lock()
            .unwrap()
            .push(content.to_string());

        Ok(format!("{}:mock-{}", self.config.kind, uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    fn kind(&self) -> PlatformKind {
        self.config.kind
    }

    fn content_limit(&self) -> usize {
        self.config.content_limit
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation("content is empty".to_string()).into());
        }
        let chars = content.chars().count();
        if chars > self.config.content_limit {
            return Err(PlatformError::Validation(format!(
                "content is {} characters, limit is {}",
                chars, self.config.content_limit
            ))
            .into());
        }
        Ok(())
    }

    async fn publish(&self, post: &Post) -> Result<String> {
        self.validate_content(&post.content)?;
        let remote_id = self.publish_one(&post.content).await?;
        self.config
            .published_media
            .lock()
            .unwrap()
            .push(post.media_ref_list());
        Ok(remote_id)
    }

    async fn publish_thread(&self, posts: &[Post]) -> Result<Vec<String>> {
        for post in posts {
            self.validate_content(&post.content)?;
        }

        let mut remote_ids: Vec<String> = Vec::with_capacity(posts.len());
        for (index, post) in posts.iter().enumerate() {
            // Scripted partial failure: items before the index succeed
            // even when publish_error is set.
            let scripted_failure = match self.config.fail_thread_at {
                Some(fail_at) => index >= fail_at,
                None => self.config.publish_error.is_some(),
            };

            *self.config.publish_call_count.lock().unwrap() += 1;

            if scripted_failure {
                let error = self
                    .config
                    .publish_error
                    .clone()
                    .unwrap_or_else(|| PlatformError::Transient("mock failure".to_string()));
                if remote_ids.is_empty() {
                    return Err(error.into());
                }
                return Err(PlatformError::PartialThread {
                    published: remote_ids,
                    total: posts.len(),
                    message: error.to_string(),
                }
                .into());
            }

            if !self.config.delay.is_zero() {
                sleep(self.config.delay).await;
            }
            self.config
                .published_content
                .lock()
                .unwrap()
                .push(post.content.clone());
            self.config
                .published_media
                .lock()
                .unwrap()
                .push(post.media_ref_list());
            remote_ids.push(format!("{}:mock-{}", self.config.kind, uuid::Uuid::new_v4()));
        }

        Ok(remote_ids)
    }

    async fn delete_post(&self, remote_id: &str) -> Result<()> {
        if let Some(error) = &self.config.publish_error {
            return Err(error.clone().into());
        }
        self.config
            .deleted_ids
            .lock()
            .unwrap()
            .push(remote_id.to_string());
        Ok(())
    }
}
