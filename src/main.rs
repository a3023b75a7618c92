//! # feed2reddit
//!
//! Mirrors a news site's paginated article feed to a Reddit community,
//! submitting every article exactly once.
//!
//! ## Usage
//!
//! ```sh
//! feed2reddit -c feed2reddit.yaml -d .data
//! ```
//!
//! ## Architecture
//!
//! Each poll cycle runs a one-way pipeline:
//! 1. **Ingest**: fetch feed pages and deep-merge them into the article store
//! 2. **Project**: derive the per-article scheduling records
//! 3. **Publish**: submit the oldest unpublished article, draining articles
//!    that are already on the platform
//! 4. **Flush**: write both stores back, skipping unchanged content

use std::error::Error;
use std::time::Instant;

use chrono::Local;
use clap::Parser;
use tracing::{debug, error, info, warn};

mod cli;
mod config;
mod cycle;
mod error;
mod feed;
mod flair;
mod logging;
mod merge;
mod models;
mod platform;
mod projection;
mod registry;
mod retry;
mod scheduler;
mod store;
mod utils;

use cli::Cli;
use config::ConfigProvider;
use cycle::{DataPaths, Poller};
use feed::HttpFeed;
use logging::SinkRegistry;
use platform::RedditClient;
use registry::CategoryRegistry;
use retry::{BackoffPolicy, RetryFeed};
use store::Codec;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    let mut provider = ConfigProvider::new(&args.config);
    let config = provider.current()?;
    for problem in logging::init(&config.logging, &SinkRegistry::default()) {
        warn!("{problem}");
    }

    let start_time = Instant::now();
    info!(
        started_at = %Local::now().format("%Y-%m-%d %H:%M:%S"),
        config = %args.config.display(),
        "feed2reddit starting up"
    );
    debug!(?args, "Parsed CLI arguments");

    tokio::fs::create_dir_all(&args.data_dir).await?;
    let codec = if args.plain { Codec::Plain } else { Codec::Gzip };
    let paths = DataPaths::new(&args.data_dir, codec);

    let feed = RetryFeed::new(
        HttpFeed::new(&config.feed.api_url, &config.feed.useragent)?,
        BackoffPolicy::default(),
    );
    let platform = RedditClient::connect(&config.reddit).await?;

    if args.skip_category_check {
        info!("Category check skipped");
    } else {
        let registry = CategoryRegistry::load(provider.categories_path()).await?;
        if let Err(e) =
            flair::check_categories(&platform, &registry, &config.reddit, &config.feed.site_url)
                .await
        {
            error!(error = %e, "Category check failed");
        }
    }

    let mut poller = Poller::new(provider, feed, platform, paths);
    if args.once {
        let report = poller.run_once().await?;
        info!(
            new_articles = report.ingest.new_articles,
            submitted = report.publish.submitted,
            already_posted = report.publish.already_posted,
            remaining = report.publish.remaining,
            elapsed_ms = start_time.elapsed().as_millis(),
            "Single cycle finished"
        );
    } else {
        poller.run_forever().await;
    }

    info!(
        finished_at = %Local::now().format("%Y-%m-%d %H:%M:%S"),
        "feed2reddit shutting down"
    );
    Ok(())
}
