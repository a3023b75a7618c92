//! Derives the scheduling view of each raw article.
//!
//! The builder runs after every ingestion pass. It refreshes the derived
//! fields of existing projections and never touches what the scheduler
//! recorded (`reddit_*`) or anything it does not know about.

use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::models::{ArticleRecord, LEGACY_PARSE_DATE, Projection};
use crate::store::{ArticleStore, ProjectionStore};
use crate::utils::{date_dir, from_epoch_seconds, is_valid_slug, iso8601_utc, truncate_for_log};

const CONTEXT_MAX: usize = 500;

/// Outcome counters of one projection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    pub projected: usize,
    pub new_articles: usize,
    pub ignored: usize,
    pub inactive: usize,
}

/// Fields of an article the projection is built from.
#[derive(Debug, Clone, PartialEq)]
struct Derived {
    slug: String,
    article_date: String,
    article_title: String,
    category: String,
    date_dir: String,
    english: bool,
}

fn malformed(id: u64, reason: &str, record: &ArticleRecord) -> FeedError {
    FeedError::malformed(
        format!("article {id}: {reason}"),
        truncate_for_log(&Value::Object(record.clone()).to_string(), CONTEXT_MAX),
    )
}

fn derive(id: u64, record: &ArticleRecord) -> Result<Derived, FeedError> {
    let slug = record
        .get("slug")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(id, "missing slug", record))?;
    let article_title = record
        .get("title")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(id, "missing title", record))?;
    let published = record
        .get("pubDate")
        .and_then(Value::as_f64)
        .and_then(from_epoch_seconds)
        .ok_or_else(|| malformed(id, "missing or invalid pubDate", record))?;
    let category = record
        .get("mainSuperTag")
        .and_then(|tag| tag.get("slug"))
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(id, "no slug in mainSuperTag", record))?;

    Ok(Derived {
        slug: slug.to_string(),
        article_date: iso8601_utc(published),
        article_title: article_title.to_string(),
        category: category.to_string(),
        date_dir: date_dir(published),
        english: record.get("english").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Turns raw articles into projection records.
#[derive(Debug, Clone)]
pub struct ProjectionBuilder {
    expected_types: Vec<String>,
    ignore_types: Vec<String>,
}

impl ProjectionBuilder {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            expected_types: config.expected_types(),
            ignore_types: config.ignore_types(),
        }
    }

    /// Project every article of `articles` into `projections`.
    ///
    /// A malformed active article aborts the pass; projections updated before
    /// it stay updated.
    #[instrument(level = "info", skip_all)]
    pub fn build(
        &self,
        articles: &ArticleStore,
        projections: &mut ProjectionStore,
    ) -> Result<ProjectionReport, FeedError> {
        let mut report = ProjectionReport::default();

        for (&id, record) in articles.iter() {
            let kind = record.get("type").and_then(Value::as_str).unwrap_or_default();
            if self.ignore_types.iter().any(|t| t == kind) {
                report.ignored += 1;
                continue;
            }
            if !self.expected_types.iter().any(|t| t == kind) {
                warn!(id, article_type = kind, "Unexpected type");
            }
            if !record.get("active").and_then(Value::as_bool).unwrap_or(false) {
                warn!(id, "Not active");
                report.inactive += 1;
                continue;
            }

            let derived = derive(id, record)?;
            if !is_valid_slug(&derived.slug) {
                error!(id, slug = %derived.slug, "Invalid article slug");
            }

            let projection = projections
                .entry(derived.slug.clone())
                .or_insert_with(|| {
                    info!(slug = %derived.slug, "New article");
                    report.new_articles += 1;
                    Projection::default()
                });
            apply(projection, derived);
            report.projected += 1;
        }

        for (_, projection) in projections.iter_mut() {
            projection.extra.remove(LEGACY_PARSE_DATE);
        }
        Ok(report)
    }
}

fn apply(projection: &mut Projection, derived: Derived) {
    projection.article_date = Some(derived.article_date);
    projection.article_title = Some(derived.article_title);
    projection.category = Some(derived.category);
    projection.date_dir = Some(derived.date_dir);
    if derived.english {
        projection.english = Some(true);
    }
}
