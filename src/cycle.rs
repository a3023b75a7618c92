//! One poll cycle and the loop that repeats it.
//!
//! A cycle reads both stores, ingests the feed, rebuilds projections and runs
//! a publication pass. Once both stores have been read, they are flushed
//! whatever happens afterwards, so partial progress (in particular a recorded
//! publication) is never lost.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, ConfigProvider, FeedConfig};
use crate::error::CycleError;
use crate::feed::{FeedSource, IngestReport, Ingestor};
use crate::platform::Platform;
use crate::projection::{ProjectionBuilder, ProjectionReport};
use crate::registry::CategoryRegistry;
use crate::scheduler::{PublishReport, Scheduler};
use crate::store::{ArticleStore, Codec, ProjectionStore, WriteOutcome};

/// Delay used when no configuration could be loaded at all.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(300);

/// Where a poller keeps its files.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub articles: PathBuf,
    pub projections: PathBuf,
    pub api_dump: PathBuf,
    pub codec: Codec,
}

impl DataPaths {
    pub fn new(dir: &Path, codec: Codec) -> Self {
        Self {
            articles: dir.join(codec.file_name("articles")),
            projections: dir.join(codec.file_name("projections")),
            api_dump: dir.join("articles.api.json"),
            codec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub ingest: IngestReport,
    pub projection: ProjectionReport,
    pub publish: PublishReport,
    pub articles_written: WriteOutcome,
    pub projections_written: WriteOutcome,
}

#[derive(Debug)]
struct Progress {
    ingest: IngestReport,
    projection: ProjectionReport,
    publish: PublishReport,
}

async fn advance<F: FeedSource, P: Platform>(
    config: &Config,
    feed: &F,
    platform: &P,
    paths: &DataPaths,
    registry: &mut CategoryRegistry,
    articles: &mut ArticleStore,
    projections: &mut ProjectionStore,
) -> Result<Progress, CycleError> {
    let ingestor = Ingestor::new(&config.feed).with_dump(&paths.api_dump);
    ingestor.validate_stored(articles, registry).await?;
    let ingest = ingestor.ingest(feed, articles, registry).await?;

    let projection = ProjectionBuilder::new(&config.feed).build(articles, projections)?;

    let publish = Scheduler::new(platform, &config.reddit, &config.feed.site_url)
        .publish(projections)
        .await?;

    Ok(Progress {
        ingest,
        projection,
        publish,
    })
}

/// Run a single cycle against the stores under `paths`.
///
/// A store that cannot be read aborts the cycle before anything is written.
#[instrument(level = "info", skip_all)]
pub async fn run_cycle<F: FeedSource, P: Platform>(
    config: &Config,
    feed: &F,
    platform: &P,
    paths: &DataPaths,
    registry: &mut CategoryRegistry,
) -> Result<CycleReport, CycleError> {
    let mut articles = ArticleStore::new(&paths.articles, paths.codec);
    let mut projections = ProjectionStore::new(&paths.projections, paths.codec);
    articles.read().await?;
    projections.read().await?;

    let progress = advance(
        config,
        feed,
        platform,
        paths,
        registry,
        &mut articles,
        &mut projections,
    )
    .await;

    let articles_written = articles.write(true, true).await;
    let projections_written = projections.write(true, true).await;
    for (path, outcome) in [
        (articles.path(), &articles_written),
        (projections.path(), &projections_written),
    ] {
        if let Err(e) = outcome {
            error!(path = %path.display(), error = %e, "Unable to flush store");
        }
    }

    let progress = progress?;
    Ok(CycleReport {
        ingest: progress.ingest,
        projection: progress.projection,
        publish: progress.publish,
        articles_written: articles_written?,
        projections_written: projections_written?,
    })
}

/// Delay before the next cycle.
///
/// The baseline is shortened while a backlog remains. Transport failures and
/// platform service errors add a cooldown on top.
pub fn next_delay(feed: &FeedConfig, outcome: &Result<CycleReport, CycleError>) -> Duration {
    let base = Duration::from_secs(feed.check_interval);
    match outcome {
        Ok(report) if report.publish.remaining > 0 => base / feed.backlog_divisor.max(1),
        Ok(_) => base,
        Err(e) if e.needs_cooldown() => {
            base + Duration::from_secs(feed.transport_cooldown_secs)
        }
        Err(_) => base,
    }
}

/// Owns everything a long-running poller needs.
#[derive(Debug)]
pub struct Poller<F, P> {
    provider: ConfigProvider,
    feed: F,
    platform: P,
    paths: DataPaths,
    last_config: Option<Arc<Config>>,
}

impl<F: FeedSource, P: Platform> Poller<F, P> {
    pub fn new(provider: ConfigProvider, feed: F, platform: P, paths: DataPaths) -> Self {
        Self {
            provider,
            feed,
            platform,
            paths,
            last_config: None,
        }
    }

    /// Reload configuration if it changed and run one cycle.
    pub async fn run_once(&mut self) -> Result<CycleReport, CycleError> {
        let config = self.provider.current()?;
        self.last_config = Some(Arc::clone(&config));
        let mut registry = CategoryRegistry::load(self.provider.categories_path()).await?;
        run_cycle(
            &config,
            &self.feed,
            &self.platform,
            &self.paths,
            &mut registry,
        )
        .await
    }

    /// Cycle until the process is killed.
    pub async fn run_forever(&mut self) {
        loop {
            let outcome = self.run_once().await;
            match &outcome {
                Ok(report) => info!(
                    new_articles = report.ingest.new_articles,
                    submitted = report.publish.submitted,
                    remaining = report.publish.remaining,
                    "Cycle finished"
                ),
                Err(e) if e.needs_cooldown() => {
                    error!(error = %e, "Service unavailable; cooling down")
                }
                Err(e) => error!(error = %e, "Cycle failed"),
            }

            let delay = match &self.last_config {
                Some(config) => next_delay(&config.feed, &outcome),
                None => {
                    warn!(delay = ?FALLBACK_INTERVAL, "No usable configuration yet");
                    FALLBACK_INTERVAL
                }
            };
            debug!(?delay, "Sleeping");
            sleep(delay).await;
        }
    }
}
