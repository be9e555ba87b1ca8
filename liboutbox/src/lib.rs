//! Outbox - scheduling and delivery engine for social posts
//!
//! This library provides the persistent post store, the idempotent sweep
//! that publishes due posts, and the platform clients (X, Bluesky) with
//! their credential management.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod quota;
pub mod recurrence;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{OutboxError, PlatformError, Result};
pub use scheduler::{ClientProvider, ConfigClientProvider, Scheduler};
pub use types::{PlatformKind, Post, PostStatus, SweepSummary};
