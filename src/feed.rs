//! Upstream article feed: fetching pages and ingesting them into the store.
//!
//! The feed is paginated (`?perPage=N&page=P`, 1-based). Every page body is
//! either a bare JSON array of article objects or an object with an `items`
//! array. Each article is identified by its numeric `id`; unseen ids are
//! inserted, known ids are deep-merged into the stored record.
//!
//! Pagination stops after the first page that introduces no new id, or after
//! a page shorter than the page size.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::FeedConfig;
use crate::error::{CycleError, FeedError};
use crate::merge::Reconciler;
use crate::models::ArticleRecord;
use crate::registry::CategoryRegistry;
use crate::store::ArticleStore;
use crate::utils::truncate_for_log;

const CONTEXT_MAX: usize = 500;

/// One undecoded page of the feed.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub url: String,
    pub body: String,
}

/// Anything that can serve feed pages.
pub trait FeedSource {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<RawPage, FeedError>;
}

/// The feed served over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    client: Client,
    api_url: String,
}

impl HttpFeed {
    pub fn new(api_url: &str, useragent: &str) -> Result<Self, FeedError> {
        let client = Client::builder()
            .user_agent(useragent)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|source| FeedError::Transport {
                url: api_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
        })
    }

    pub fn page_url(&self, page: u32, per_page: u32) -> Result<Url, FeedError> {
        Url::parse_with_params(
            &self.api_url,
            &[("perPage", per_page.to_string()), ("page", page.to_string())],
        )
        .map_err(|e| FeedError::InvalidUrl {
            url: self.api_url.clone(),
            reason: e.to_string(),
        })
    }
}

impl FeedSource for HttpFeed {
    #[instrument(level = "info", skip(self))]
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<RawPage, FeedError> {
        let url = self.page_url(page, per_page)?;
        let transport = |source| FeedError::Transport {
            url: url.to_string(),
            source,
        };
        debug!(%url, "API");

        let resp = self.client.get(url.clone()).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if final_url != url.as_str() {
            warn!(from = %url, to = %final_url, "URL changed");
        }
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await.map_err(transport)?;
        if body.contains('\0') {
            return Err(FeedError::Shape { url: final_url });
        }
        Ok(RawPage {
            url: final_url,
            body,
        })
    }
}

/// Decode a page body into its list of items.
pub fn parse_page(raw: &RawPage) -> Result<Vec<Value>, FeedError> {
    let document: Value = serde_json::from_str(&raw.body).map_err(|source| FeedError::Decode {
        url: raw.url.clone(),
        source,
    })?;
    match document {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(FeedError::Shape {
                url: raw.url.clone(),
            }),
        },
        _ => Err(FeedError::Shape {
            url: raw.url.clone(),
        }),
    }
}

fn context_of(record: &ArticleRecord) -> String {
    truncate_for_log(&Value::Object(record.clone()).to_string(), CONTEXT_MAX)
}

/// Numeric id of a feed item: an unsigned integer or an all-digit string.
pub fn article_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}

/// Check the fields every article must carry and return its category
/// slug and display name.
pub fn validate_article(
    record: &ArticleRecord,
    content_type: &str,
) -> Result<(String, String), FeedError> {
    if let Some(kind) = record.get("contentType") {
        if kind.as_str() != Some(content_type) {
            return Err(FeedError::malformed("unexpected contentType", context_of(record)));
        }
    }
    let Some(Value::Object(tag)) = record.get("mainSuperTag") else {
        return Err(FeedError::malformed("invalid mainSuperTag", context_of(record)));
    };
    let slug = match tag.get("slug") {
        Some(Value::String(slug)) => slug.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => return Err(FeedError::malformed("no slug in mainSuperTag", context_of(record))),
    };
    let name = tag
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((slug, name))
}

/// Remove fields that change on every poll.
pub fn strip_volatile(record: &mut ArticleRecord, volatile_fields: &[String]) {
    for field in volatile_fields {
        record.remove(field);
    }
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: u32,
    pub new_articles: usize,
    pub changes: usize,
    /// Known articles whose update could not be merged and were left as stored.
    pub merge_failures: usize,
}

/// Pulls the feed into the article store.
#[derive(Debug, Clone)]
pub struct Ingestor<'a> {
    config: &'a FeedConfig,
    reconciler: Reconciler,
    dump_path: Option<PathBuf>,
}

impl<'a> Ingestor<'a> {
    pub fn new(config: &'a FeedConfig) -> Self {
        Self {
            config,
            reconciler: Reconciler::new(config.list_merge),
            dump_path: None,
        }
    }

    /// Keep a copy of the most recent raw response at `path`.
    pub fn with_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }

    /// Re-validate records already in the store, strip volatile fields and
    /// register their categories.
    #[instrument(level = "info", skip_all)]
    pub async fn validate_stored(
        &self,
        store: &mut ArticleStore,
        registry: &mut CategoryRegistry,
    ) -> Result<(), FeedError> {
        for (_, record) in store.iter_mut() {
            let (category, name) = validate_article(record, &self.config.content_type)?;
            strip_volatile(record, &self.config.volatile_fields);
            registry.ensure(&category, &name).await;
        }
        Ok(())
    }

    /// Fetch pages until the feed stops producing new articles.
    ///
    /// # Arguments
    ///
    /// * `feed` - Source of raw pages
    /// * `store` - Article store; new ids are inserted, known ids merged
    /// * `registry` - Receives the category of every article seen
    ///
    /// # Returns
    ///
    /// Page, insertion and change counts. A known article whose update cannot
    /// be merged is logged, left as stored and counted in
    /// [`IngestReport::merge_failures`]; it does not stop ingestion. Transport
    /// failures and malformed items abort it.
    #[instrument(level = "info", skip_all)]
    pub async fn ingest<F: FeedSource>(
        &self,
        feed: &F,
        store: &mut ArticleStore,
        registry: &mut CategoryRegistry,
    ) -> Result<IngestReport, CycleError> {
        let per_page = self.config.articles_per_page.max(1);
        let mut report = IngestReport::default();
        let mut page = 1u32;

        loop {
            if page > 1 && self.config.request_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.request_delay_ms)).await;
            }
            let raw = feed.fetch_page(page, per_page).await?;
            self.dump(&raw).await;
            let items = parse_page(&raw)?;
            report.pages = page;

            let mut new_on_page = 0usize;
            for item in &items {
                let Value::Object(mut record) = item.clone() else {
                    return Err(FeedError::malformed(
                        "article is not an object",
                        truncate_for_log(&item.to_string(), CONTEXT_MAX),
                    )
                    .into());
                };
                let id = record
                    .remove("id")
                    .as_ref()
                    .and_then(article_id)
                    .ok_or_else(|| {
                        FeedError::malformed("missing or invalid id", context_of(&record))
                    })?;
                let (category, name) = validate_article(&record, &self.config.content_type)?;
                strip_volatile(&mut record, &self.config.volatile_fields);
                registry.ensure(&category, &name).await;

                match store.get_mut(&id) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        match self.reconciler.merge(&id.to_string(), &record, &mut merged) {
                            Ok(changes) => {
                                report.changes += changes.len();
                                *existing = merged;
                            }
                            Err(e) => {
                                error!(
                                    id,
                                    error = %e,
                                    "Unable to merge article; keeping stored record"
                                );
                                report.merge_failures += 1;
                            }
                        }
                    }
                    None => {
                        info!(id, "New article record");
                        store.insert(id, record);
                        new_on_page += 1;
                    }
                }
            }
            report.new_articles += new_on_page;
            debug!(page, items = items.len(), new = new_on_page, "Page ingested");

            if new_on_page == 0 || items.len() < per_page as usize {
                break;
            }
            page += 1;
        }

        info!(
            pages = report.pages,
            new_articles = report.new_articles,
            changes = report.changes,
            merge_failures = report.merge_failures,
            "Feed ingested"
        );
        Ok(report)
    }

    async fn dump(&self, raw: &RawPage) {
        if let Some(path) = &self.dump_path {
            if let Err(e) = fs::write(path, &raw.body).await {
                warn!(path = %path.display(), error = %e, "Unable to write API response");
            }
        }
    }
}
