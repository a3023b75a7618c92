//! Publication scheduler: submits the oldest unpublished article.
//!
//! Each pass resolves articles oldest first. An article already present on
//! the platform (found by URL search, or refused as `ALREADY_SUB`) is marked
//! published and the pass moves on to the next one. A genuinely new
//! submission ends the pass, so at most one new post goes out per cycle.

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::config::RedditConfig;
use crate::error::{CycleError, FeedError, PlatformError};
use crate::models::{Projection, Submission};
use crate::platform::Platform;
use crate::store::ProjectionStore;
use crate::utils::{from_epoch_seconds, iso8601_utc, parse_iso8601_utc};

/// What one publication pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub submitted: usize,
    pub already_posted: usize,
    /// Dated, unpublished articles left after the pass.
    pub remaining: usize,
}

/// How an article ended up on the platform.
#[derive(Debug, Clone)]
enum Resolution {
    /// A post with the same URL already existed.
    Found(Submission),
    Submitted(Submission),
    /// The platform refused the URL as already submitted.
    Duplicate,
}

impl Resolution {
    fn submission(&self) -> Option<&Submission> {
        match self {
            Resolution::Found(s) | Resolution::Submitted(s) => Some(s),
            Resolution::Duplicate => None,
        }
    }

    fn already_posted(&self) -> bool {
        !matches!(self, Resolution::Submitted(_))
    }
}

/// Publication time an article is scheduled by, if it has a usable one.
fn scheduled_at(slug: &str, projection: &Projection) -> Option<DateTime<Utc>> {
    let date = projection.dated()?;
    let parsed = parse_iso8601_utc(date);
    if parsed.is_none() {
        warn!(%slug, date, "Unparseable article_date");
    }
    parsed
}

/// Slug of the next article to publish: the unpublished one with the
/// earliest `article_date`, ties going to the smaller slug.
pub fn select_next(projections: &ProjectionStore) -> Option<String> {
    projections
        .iter()
        .filter(|(_, p)| !p.is_published())
        .filter_map(|(slug, p)| {
            if p.dated().is_none() {
                warn!(%slug, "No article_date");
            }
            scheduled_at(slug, p).map(|date| (date, slug))
        })
        .min()
        .map(|(_, slug)| slug.clone())
}

/// Number of schedulable articles still waiting for publication.
pub fn remaining(projections: &ProjectionStore) -> usize {
    projections
        .iter()
        .filter(|(slug, p)| !p.is_published() && scheduled_at(slug, p).is_some())
        .count()
}

/// Public URL of an article: `<site>/<category>/<YYYY/MM/DD>/<slug>`.
pub fn canonical_url(
    site_url: &str,
    slug: &str,
    projection: &Projection,
) -> Result<String, FeedError> {
    let part = |value: &Option<String>, name: &str| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FeedError::malformed(format!("no {name}"), slug.to_string()))
    };
    let category = part(&projection.category, "category")?;
    let date_dir = part(&projection.date_dir, "date_dir")?;
    Ok(format!(
        "{}/{category}/{date_dir}/{slug}",
        site_url.trim_end_matches('/')
    ))
}

/// First label of the site's host, e.g. `telex` for `https://telex.hu`.
fn site_name(site_url: &str) -> Option<String> {
    let url = Url::parse(site_url).ok()?;
    let host = url.host_str()?;
    host.trim_start_matches("www.")
        .split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_lowercase)
}

fn published_at(submission: Option<&Submission>) -> String {
    let when = submission
        .and_then(|s| from_epoch_seconds(s.created_utc))
        .unwrap_or_else(Utc::now);
    iso8601_utc(when)
}

/// Drives publication against a [`Platform`].
#[derive(Debug)]
pub struct Scheduler<'a, P> {
    platform: &'a P,
    reddit: &'a RedditConfig,
    site_url: &'a str,
}

impl<'a, P: Platform> Scheduler<'a, P> {
    pub fn new(platform: &'a P, reddit: &'a RedditConfig, site_url: &'a str) -> Self {
        Self {
            platform,
            reddit,
            site_url,
        }
    }

    async fn resolve(
        &self,
        community: &str,
        title: &str,
        url: &str,
    ) -> Result<Resolution, PlatformError> {
        let existing = self
            .platform
            .search_by_url(community, url)
            .await?
            .into_iter()
            .find(|s| s.url.as_deref() == Some(url));
        if let Some(existing) = existing {
            info!(community, permalink = %existing.permalink, "Submission already posted");
            return Ok(Resolution::Found(existing));
        }
        match self.platform.submit_link(community, title, url).await {
            Ok(submission) => {
                info!(community, permalink = %submission.permalink, "Submitted");
                Ok(Resolution::Submitted(submission))
            }
            Err(e) if e.is_already_submitted() => {
                warn!(community, %url, error = %e, "Already submitted");
                Ok(Resolution::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Collection entry plus a post in the English community.
    async fn mirror_english(
        &self,
        submission: &Submission,
        title: &str,
        url: &str,
    ) -> Result<Option<String>, PlatformError> {
        let link = format!("https://reddit.com{}", submission.permalink);
        info!(%link, "Add new English post to collection");
        if let Err(e) = self
            .platform
            .add_to_collection(&self.reddit.english_collection_id, submission)
            .await
        {
            error!(%link, error = %e, "Unable to add post to collection");
        }

        if let Some(name) = site_name(self.site_url) {
            if title.to_lowercase().contains(&name) {
                warn!(title, "Site name in title (internal post?)");
            }
        }

        let community = &self.reddit.subreddit_english;
        info!(community = %community, %url, "Submit to English community");
        let resolution = self.resolve(community, title, url).await?;
        Ok(resolution.submission().map(|s| s.permalink.clone()))
    }

    /// Run one publication pass over `projections`.
    ///
    /// Articles already on the platform are marked published and the pass
    /// continues, up to `reddit.max_duplicate_skips` of them. The first genuine
    /// submission ends the pass.
    ///
    /// # Arguments
    ///
    /// * `projections` - Scheduling records; publication fields are updated in
    ///   place as soon as the primary submission is resolved, so an error later
    ///   in the pass does not lose them
    ///
    /// # Returns
    ///
    /// Counts of submitted and already-posted articles and the backlog left,
    /// or the first platform or data error, which aborts the pass.
    #[instrument(level = "info", skip_all)]
    pub async fn publish(
        &self,
        projections: &mut ProjectionStore,
    ) -> Result<PublishReport, CycleError> {
        let mut report = PublishReport::default();

        while report.already_posted < self.reddit.max_duplicate_skips {
            let Some(slug) = select_next(projections) else {
                break;
            };
            let Some(projection) = projections.get(&slug) else {
                break;
            };
            let title = projection
                .article_title
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            if title.is_empty() {
                return Err(FeedError::malformed("no article_title", slug).into());
            }
            let url = canonical_url(self.site_url, &slug, projection)?;
            let english = projection.is_english();
            info!(%url, "Submit");

            let resolution = self.resolve(&self.reddit.subreddit, &title, &url).await?;
            let submission = resolution.submission();
            if let Some(projection) = projections.get_mut(&slug) {
                projection.reddit_date = Some(published_at(submission));
                projection.reddit_url = Some(
                    submission
                        .map(|s| s.permalink.clone())
                        .unwrap_or_default(),
                );
            }

            if let (Some(submission), true) = (submission, english) {
                let english_url = self.mirror_english(submission, &title, &url).await?;
                if let (Some(permalink), Some(projection)) =
                    (english_url, projections.get_mut(&slug))
                {
                    projection.reddit_english_url = Some(permalink);
                }
            }

            if resolution.already_posted() {
                report.already_posted += 1;
            } else {
                report.submitted += 1;
                break;
            }
        }

        report.remaining = remaining(projections);
        info!(
            submitted = report.submitted,
            already_posted = report.already_posted,
            remaining = report.remaining,
            "Publication pass finished"
        );
        Ok(report)
    }
}
