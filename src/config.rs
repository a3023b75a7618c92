//! Configuration schema and the mtime-memoized configuration provider.
//!
//! The configuration is a YAML document with `feed`, `reddit` and `logging`
//! sections. It is re-read only when the file's modification time changes, so
//! an operator can edit it while the poller runs.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::merge::ListPolicy;

/// Everything the poller needs to run one cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    pub reddit: RedditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream article feed settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Listing endpoint; `perPage` and `page` are appended as query parameters.
    pub api_url: String,
    pub useragent: String,
    /// Base of canonical article URLs.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_articles_per_page")]
    pub articles_per_page: u32,
    /// Comma-separated article types that are expected.
    #[serde(default)]
    pub expected_types: String,
    /// Comma-separated article types that are skipped silently.
    #[serde(default)]
    pub ignore_types: String,
    /// Fields that churn on every poll and are stripped before merging.
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Baseline delay between cycles, in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Divides `check_interval` while unpublished articles remain.
    #[serde(default = "default_backlog_divisor")]
    pub backlog_divisor: u32,
    #[serde(default = "default_feed_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_transport_cooldown")]
    pub transport_cooldown_secs: u64,
    #[serde(default)]
    pub list_merge: ListPolicy,
}

impl FeedConfig {
    pub fn expected_types(&self) -> Vec<String> {
        split_list(&self.expected_types)
    }

    pub fn ignore_types(&self) -> Vec<String> {
        split_list(&self.ignore_types)
    }
}

/// Social platform account and target communities.
#[derive(Debug, Clone, Deserialize)]
pub struct RedditConfig {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
    /// Account expected to author every automoderator revision.
    pub script_author: String,
    pub subreddit: String,
    pub subreddit_english: String,
    pub english_collection_id: String,
    /// Upper bound on already-posted detections per cycle.
    #[serde(default = "default_max_duplicate_skips")]
    pub max_duplicate_skips: usize,
    #[serde(default = "default_reddit_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_oauth_url")]
    pub oauth_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
}

impl RedditConfig {
    pub fn user_agent(&self) -> String {
        format!("Script by u/{}", self.script_author)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_site_url() -> String {
    "https://telex.hu".to_string()
}
fn default_articles_per_page() -> u32 {
    25
}
fn default_volatile_fields() -> Vec<String> {
    vec!["facebookEngagement".to_string()]
}
fn default_content_type() -> String {
    "article".to_string()
}
fn default_check_interval() -> u64 {
    300
}
fn default_backlog_divisor() -> u32 {
    5
}
fn default_feed_delay_ms() -> u64 {
    1000
}
fn default_transport_cooldown() -> u64 {
    600
}
fn default_max_duplicate_skips() -> usize {
    25
}
fn default_reddit_delay_ms() -> u64 {
    2000
}
fn default_oauth_url() -> String {
    "https://oauth.reddit.com".to_string()
}
fn default_auth_url() -> String {
    "https://www.reddit.com".to_string()
}

/// Owns the configuration file and hands out the current parsed config.
#[derive(Debug)]
pub struct ConfigProvider {
    path: PathBuf,
    cached: Option<(SystemTime, Arc<Config>)>,
}

impl ConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    /// Category registry file, kept next to the configuration.
    pub fn categories_path(&self) -> PathBuf {
        self.path.with_file_name("categories.yaml")
    }

    /// The parsed configuration, re-read only if the file's mtime changed.
    pub fn current(&mut self) -> Result<Arc<Config>, ConfigError> {
        let unreadable = |source| ConfigError::Unreadable {
            path: self.path.clone(),
            source,
        };
        let mtime = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(unreadable)?;

        if let Some((seen, config)) = &self.cached {
            if *seen == mtime {
                return Ok(Arc::clone(config));
            }
        }

        let text = fs::read_to_string(&self.path).map_err(unreadable)?;
        let config: Config =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Invalid {
                path: self.path.clone(),
                source,
            })?;
        let config = Arc::new(config);
        info!(path = %self.path.display(), "Loaded configuration");
        self.cached = Some((mtime, Arc::clone(&config)));
        Ok(config)
    }
}
