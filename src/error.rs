//! Error taxonomy for the poller.
//!
//! Each concern owns its own enum; [`CycleError`] aggregates them so a poll
//! cycle can use `?` throughout and the outer loop can decide between a
//! cooldown and an immediate retry.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing a durable record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("store {path}: item without id: {item}")]
    MissingId { path: PathBuf, item: String },
    #[error("store {path}: non-numeric id {id}")]
    NonNumericId { path: PathBuf, id: String },
    #[error("store {path}: duplicate id {id}")]
    DuplicateId { path: PathBuf, id: u64 },
    #[error("store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store {path}: unable to serialize: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the deep merge.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{path}: cannot reconcile list of {source_len} items into list of {dest_len} items")]
    IrreconcilableList {
        path: String,
        source_len: usize,
        dest_len: usize,
    },
    #[error("{path}: list items carry no usable key: {item}")]
    UnkeyedList { path: String, item: String },
}

/// Failures fetching or interpreting the upstream feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid feed URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unexpected JSON structure from {url}")]
    Shape { url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed article ({reason}): {context}")]
    MalformedArticle { reason: String, context: String },
}

impl FeedError {
    /// Network-level failures worth retrying and cooling down on.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::HttpStatus { .. })
    }

    pub fn malformed(reason: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MalformedArticle {
            reason: reason.into(),
            context: context.into(),
        }
    }
}

/// One structured error item returned by the platform API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorItem {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
}

/// Failures talking to the social platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform service error: http {status} for {url}")]
    Service { status: u16, url: String },
    #[error("platform rejected request: http {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("platform API error: {}", format_items(.0))]
    Api(Vec<ApiErrorItem>),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

fn format_items(items: &[ApiErrorItem]) -> String {
    items
        .iter()
        .map(|i| match &i.field {
            Some(field) => format!("{} ({}): {}", i.code, field, i.message),
            None => format!("{}: {}", i.code, i.message),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl PlatformError {
    /// True when every structured item says the URL was already submitted.
    ///
    /// Only the error code and field are inspected; message text is for display.
    pub fn is_already_submitted(&self) -> bool {
        match self {
            Self::Api(items) => {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|i| i.code == "ALREADY_SUB" && i.field.as_deref() == Some("url"))
            }
            _ => false,
        }
    }

    /// Transport failures and 5xx responses: the service is unreachable or
    /// degraded rather than refusing this particular request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Service { .. })
    }
}

/// Failures loading or persisting configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config {path} is not a readable file: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config {path} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unable to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Inconsistencies between the category registry and the community's flairs.
#[derive(Debug, Error)]
pub enum FlairError {
    #[error("duplicate flair: {0}")]
    Duplicate(String),
    #[error("flair missing from categories: {0}")]
    MissingFromRegistry(String),
    #[error("unexpected flair text ({class}): {text} != {expected}")]
    TextMismatch {
        class: String,
        text: String,
        expected: String,
    },
    #[error("category without flair: {0}")]
    MissingFlair(String),
    #[error("unexpected automoderator author: {0}")]
    Author(String),
    #[error("automoderator: {0}")]
    Automoderator(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Anything that aborts a single poll cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CycleError {
    /// Transport failures and platform service errors get a cooldown before
    /// the next cycle.
    pub fn needs_cooldown(&self) -> bool {
        match self {
            Self::Feed(e) => e.is_transport(),
            Self::Platform(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(code: &str, field: Option<&str>) -> ApiErrorItem {
        ApiErrorItem {
            code: code.to_string(),
            message: "that link has already been submitted".to_string(),
            field: field.map(str::to_string),
        }
    }

    #[test]
    fn already_submitted_uses_code_and_field() {
        let err = PlatformError::Api(vec![item("ALREADY_SUB", Some("url"))]);
        assert!(err.is_already_submitted());

        let wrong_field = PlatformError::Api(vec![item("ALREADY_SUB", Some("title"))]);
        assert!(!wrong_field.is_already_submitted());

        let mixed = PlatformError::Api(vec![
            item("ALREADY_SUB", Some("url")),
            item("RATELIMIT", Some("ratelimit")),
        ]);
        assert!(!mixed.is_already_submitted());
    }

    #[test]
    fn message_text_is_ignored() {
        let err = PlatformError::Api(vec![ApiErrorItem {
            code: "SUBREDDIT_NOTALLOWED".to_string(),
            message: "that link has already been submitted".to_string(),
            field: Some("url".to_string()),
        }]);
        assert!(!err.is_already_submitted());
        assert!(!PlatformError::Api(vec![]).is_already_submitted());
    }

    #[test]
    fn service_errors_need_cooldown() {
        let service = CycleError::from(PlatformError::Service {
            status: 503,
            url: "https://oauth.reddit.com/api/submit".to_string(),
        });
        assert!(service.needs_cooldown());

        let rejected = CycleError::from(PlatformError::Rejected {
            status: 403,
            url: "https://oauth.reddit.com/api/submit".to_string(),
        });
        assert!(!rejected.needs_cooldown());
        assert!(!CycleError::from(PlatformError::Api(vec![])).needs_cooldown());
    }

    #[test]
    fn api_error_display_lists_items() {
        let err = PlatformError::Api(vec![item("ALREADY_SUB", Some("url")), item("X", None)]);
        let text = err.to_string();
        assert!(text.contains("ALREADY_SUB (url)"));
        assert!(text.contains("X: "));
    }
}
