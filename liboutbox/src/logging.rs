//! Logging setup shared by the engine's binaries
//!
//! Everything goes to stderr so stdout stays reserved for machine
//! output (the sweep's JSON summary). Two formats: `text` for humans,
//! `json` (one object per line) for log shippers. `OUTBOX_LOG_FORMAT`
//! and `OUTBOX_LOG_LEVEL` override the defaults, and `RUST_LOG` wins
//! over both when set.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Install the global subscriber. Call once, before any sweep runs;
/// panics if a subscriber is already set. `verbose` forces debug level
/// unless `RUST_LOG` overrides it.
pub fn init(format: LogFormat, level: &str, verbose: bool) {
    let fallback = if verbose { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
}

/// Initialize from `OUTBOX_LOG_FORMAT` / `OUTBOX_LOG_LEVEL`, defaulting
/// to text at info level.
pub fn init_default() {
    let format = std::env::var("OUTBOX_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("OUTBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    init(format, &level, false);
}
