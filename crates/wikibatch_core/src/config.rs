use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher::{BatchOptions, DEFAULT_CONCURRENCY};
use crate::retry::RetryPolicy;
use crate::upload::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_USER_AGENT: &str = "wikibatch/0.2";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub batch: BatchSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub custom_namespaces: Vec<CustomNamespace>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BatchSection {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<usize>,
    pub backoff_ms: Option<u64>,
    pub chunk_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CustomNamespace {
    pub name: String,
    pub id: i32,
}

impl BotConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Ok(value) = env::var("WIKI_API_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.wiki.api_url.clone()
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("WIKI_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Assemble dispatcher options from the `[batch]` section with env overrides.
    pub fn batch_options(&self) -> BatchOptions {
        let concurrency = env_value_usize(
            "WIKI_BATCH_CONCURRENCY",
            self.batch.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
        );
        let max_attempts = env_value_usize(
            "WIKI_BATCH_RETRIES",
            self.batch.max_attempts.unwrap_or_else(|| RetryPolicy::default().max_attempts),
        );
        let backoff_ms = env_value_u64(
            "WIKI_BATCH_BACKOFF_MS",
            self.batch.backoff_ms.unwrap_or(1_000),
        );
        let chunk_size = env_value_u64(
            "WIKI_UPLOAD_CHUNK_SIZE",
            self.batch.chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE),
        );
        BatchOptions {
            concurrency: concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                initial_backoff: Duration::from_millis(backoff_ms),
            },
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub maxlag_seconds: u64,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_env_with_defaults("", DEFAULT_USER_AGENT)
    }

    pub fn from_config(config: &BotConfig) -> Self {
        let api_default = config.wiki.api_url.as_deref().unwrap_or("");
        Self::from_env_with_defaults(api_default, &config.user_agent())
    }

    fn from_env_with_defaults(api_url_default: &str, user_agent_default: &str) -> Self {
        Self {
            api_url: env_value("WIKI_API_URL", api_url_default),
            user_agent: env_value("WIKI_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            maxlag_seconds: env_value_u64("WIKI_MAXLAG", 5),
        }
    }
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
