//! Data models shared across the pipeline.
//!
//! - [`ArticleRecord`]: raw upstream article, open-ended JSON mapping
//! - [`Projection`]: the derived, scheduling-relevant view of an article
//! - [`Submission`], [`FlairTemplate`], [`WikiPage`]: what the platform hands back

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw article as delivered by the feed, minus its `id` (which is the store key).
pub type ArticleRecord = Map<String, Value>;

/// Legacy field written by the HTML-scraping era; dropped whenever seen.
pub const LEGACY_PARSE_DATE: &str = "parse_date";

/// Minimal per-article record used for publication scheduling.
///
/// Keyed by slug in the projection store. Fields the builder does not know
/// about are carried in `extra` and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Publish timestamp, ISO-8601 UTC with `Z` suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_title: Option<String>,
    /// Category slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// `YYYY/MM/DD` derived from `article_date`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_dir: Option<String>,
    /// Present and `true` only for English-targeted articles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub english: Option<bool>,
    /// Presence (non-empty) means the article has been published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reddit_date: Option<String>,
    /// Permalink of the publication; empty if none was recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reddit_url: Option<String>,
    /// Permalink in the secondary English community.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reddit_english_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Projection {
    pub fn is_published(&self) -> bool {
        self.reddit_date.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn is_english(&self) -> bool {
        self.english == Some(true)
    }

    /// The `article_date` if present and non-empty.
    pub fn dated(&self) -> Option<&str> {
        self.article_date.as_deref().filter(|d| !d.is_empty())
    }
}

/// A link post as seen on the platform.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Submission {
    pub id: String,
    /// Site-relative permalink, e.g. `/r/community/comments/abc/title/`.
    pub permalink: String,
    /// Creation time in epoch seconds.
    pub created_utc: f64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Submission {
    /// Platform-wide identifier of a link post (`t3_<id>`).
    pub fn fullname(&self) -> String {
        if self.id.starts_with("t3_") {
            self.id.clone()
        } else {
            format!("t3_{}", self.id)
        }
    }
}

/// A link flair template configured on a community.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlairTemplate {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub css_class: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub mod_only: bool,
}

/// A moderator wiki page with the authors of its revisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiPage {
    pub content_md: String,
    pub revision_authors: Vec<String>,
}
