//! Error types for the outbox engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OutboxError>;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The local monthly publishing cap is reached. Surfaced distinctly
    /// from platform errors so a human can tell local policy from a
    /// platform outage.
    #[error("Monthly quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl OutboxError {
    /// Returns the appropriate process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            OutboxError::InvalidInput(_) => 3,
            OutboxError::Platform(PlatformError::NotAuthenticated(_)) => 2,
            OutboxError::Platform(_) => 1,
            OutboxError::QuotaExhausted(_) => 1,
            OutboxError::Config(_) => 1,
            OutboxError::Database(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Per-attempt publish failure taxonomy.
///
/// `Validation` and `NotAuthenticated` are never retried. `RateLimited` is
/// honored with a bounded sleep inside a single publish attempt.
/// `Transient` gets bounded exponential backoff with jitter. Anything the
/// classifier cannot place is treated as `Transient`.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Platform-advertised reset time (epoch seconds), when known.
        reset_at: Option<i64>,
    },

    #[error("Transient platform error: {0}")]
    Transient(String),

    /// A thread publish that got partway through. The remote posts that
    /// did go out are NOT rolled back; their ids are carried here so the
    /// caller can record them for reconciliation.
    #[error("Partial thread failure ({} of {total} published): {message}", published.len())]
    PartialThread {
        published: Vec<String>,
        total: usize,
        message: String,
    },
}

impl PlatformError {
    /// Whether a retry loop may attempt this failure again.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Validation(_)
            | PlatformError::NotAuthenticated(_)
            | PlatformError::PartialThread { .. } => false,
            PlatformError::RateLimited { .. } | PlatformError::Transient(_) => true,
        }
    }
}
