//! Platform abstraction and implementations
//!
//! This module provides a unified trait for publishing to social platforms.
//! Each implementation handles content validation, single and thread
//! publishing, and best-effort deletion according to platform-specific
//! requirements. Retry behavior is NOT part of the trait contract: the X
//! client publishes once and lets the caller decide, while the Bluesky
//! client wraps its calls in a classified retry loop. Both look the same
//! from here.
//!
//! # Examples
//!
//! ```no_run
//! use liboutbox::platforms::PlatformClient;
//!
//! # async fn example(client: &dyn PlatformClient, post: &liboutbox::Post) -> liboutbox::error::Result<()> {
//! client.validate_content(&post.content)?;
//! let remote_id = client.publish(post).await?;
//! println!("Published as {}", remote_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PlatformKind, Post};

pub mod bluesky;
pub mod x;

// Mock client is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Unified client interface for publishing to a social platform.
///
/// Implementations are constructed by the credential managers with fresh
/// credentials already bound; nothing here re-authenticates explicitly.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Which platform this client publishes to.
    fn kind(&self) -> PlatformKind;

    /// The platform's content length limit, in the platform's own unit
    /// (raw characters for X, grapheme clusters for Bluesky).
    fn content_limit(&self) -> usize;

    /// Validate content before publishing.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Validation` if the content is empty or
    /// exceeds the platform's limit.
    fn validate_content(&self, content: &str) -> Result<()>;

    /// Publish a single post and return the platform-specific remote ID
    /// (a tweet ID for X, an AT URI for Bluesky).
    ///
    /// # Errors
    ///
    /// Returns a `PlatformError`: validation, not-authenticated,
    /// rate-limited, or transient.
    async fn publish(&self, post: &Post) -> Result<String>;

    /// Publish a thread: each item is published as a reply to the
    /// previous one, in slice order. Returns the remote IDs in the same
    /// order.
    ///
    /// # Errors
    ///
    /// If any item fails after the first succeeded, returns
    /// `PlatformError::PartialThread` carrying the remote IDs that did go
    /// out. Remote posts are never rolled back.
    async fn publish_thread(&self, posts: &[Post]) -> Result<Vec<String>>;

    /// Delete a remote post. Best-effort: callers log failures and move on.
    async fn delete_post(&self, remote_id: &str) -> Result<()>;
}
