//! Runtime configuration from the environment.
//!
//! The core reads provider credentials, the default model, compaction and
//! retry tuning, ambient-context file patterns, and the log level from
//! environment variables. Configuration-file loading belongs to the
//! front-ends and stays out of the core.

use crate::compaction::CompactionSettings;
use crate::providers::{Backoff, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Default model when `SKEIN_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// Environment-derived runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub default_provider: Option<String>,
    pub default_model: String,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub compaction: CompactionSettings,
    pub retry: RetryPolicy,
    /// Files read into the system prompt each turn.
    pub context_files: Vec<String>,
    pub log_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            default_model: DEFAULT_MODEL.to_string(),
            anthropic_api_key: None,
            openai_api_key: None,
            compaction: CompactionSettings::default(),
            retry: RetryPolicy::default(),
            context_files: Vec::new(),
            log_level: None,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

impl RuntimeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.default_provider = env_var("SKEIN_PROVIDER");
        if let Some(model) = env_var("SKEIN_MODEL") {
            config.default_model = model;
        }
        config.anthropic_api_key = env_var("ANTHROPIC_API_KEY");
        config.openai_api_key = env_var("OPENAI_API_KEY");

        if let Some(ratio) = env_var("SKEIN_COMPACT_RATIO").and_then(|v| v.parse::<f64>().ok()) {
            if ratio <= 0.0 {
                config.compaction.enabled = false;
            } else {
                config.compaction.ratio = ratio.min(1.0);
            }
        }

        if let Some(attempts) = env_var("SKEIN_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.retry.attempts = attempts;
        }
        if let Some(ms) = env_var("SKEIN_RETRY_INITIAL_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var("SKEIN_RETRY_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(backoff) = env_var("SKEIN_RETRY_BACKOFF").and_then(|v| v.parse::<Backoff>().ok())
        {
            config.retry.backoff = backoff;
        }

        if let Some(patterns) = env_var("SKEIN_CONTEXT_PATTERNS") {
            config.context_files = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        config.log_level = env_var("SKEIN_LOG");
        config
    }

    /// Default on-disk location for conversation storage.
    pub fn conversations_dir() -> PathBuf {
        home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".skein")
            .join("conversations")
    }

    /// Default path of the SQLite conversation database.
    pub fn conversations_db_path() -> PathBuf {
        Self::conversations_dir().join("conversations.sqlite")
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}
