//! Scheduler-facing entry points.
//!
//! Every entry point resolves to a human-readable summary string; none of
//! them returns an error. Units of work are described by [`Task`] and can be
//! queued through any [`TaskQueue`] and drained by [`run_worker_pool`].

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::feed::{panic_message, BackfillOutcome, FeedDiscoverer, FetchPipeline};
use crate::http::{FetchError, HttpClient, HttpClientConfig, RateLimiter};
use crate::storage::{Database, Feed, FeedType, NewFeed};

/// One independently schedulable unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    DiscoverWebsite(i64),
    FetchFeed(i64),
    FetchArticle(i64),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,
}

/// Where scheduled work is handed off.
pub trait TaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), QueueError>;
}

impl TaskQueue for mpsc::UnboundedSender<Task> {
    fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.send(task).map_err(|_| QueueError::Closed)
    }
}

/// Totals from a backfill batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BackfillSummary {
    pub fn summary(&self) -> String {
        format!(
            "Processed {} articles: {} succeeded, {} failed",
            self.processed, self.succeeded, self.failed
        )
    }
}

/// The pipeline wired to one store and one rate-limited HTTP client.
#[derive(Clone)]
pub struct Harvester {
    db: Database,
    discoverer: FeedDiscoverer,
    pipeline: FetchPipeline,
    concurrency: usize,
}

impl Harvester {
    /// Builds the shared HTTP client and rate limiter from `config`.
    pub fn new(db: Database, config: &Config) -> Result<Self, FetchError> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.min_interval(),
            config.rate_limit.max_origins,
        ));
        let client = HttpClient::new(HttpClientConfig::from(&config.http), limiter)?;
        Ok(Self::with_client(db, client, config))
    }

    pub fn with_client(db: Database, client: HttpClient, config: &Config) -> Self {
        Self {
            discoverer: FeedDiscoverer::new(client.clone(), &config.discovery),
            pipeline: FetchPipeline::new(
                db.clone(),
                client,
                config.pipeline.clone(),
                config.discovery.sitemap_max_depth,
            ),
            concurrency: config.pipeline.concurrency.max(1),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn run(&self, task: Task) -> String {
        match task {
            Task::DiscoverWebsite(id) => self.discover_feeds_for_website(id).await,
            Task::FetchFeed(id) => self.fetch_feed_content(id).await,
            Task::FetchArticle(id) => self.fetch_article_full_content(id).await,
        }
    }

    /// Discovers feeds and sitemaps for a website and registers new ones.
    ///
    /// Newly created feeds (and feeds never polled) are validated and take
    /// the title and description their document declares.
    pub async fn discover_feeds_for_website(&self, website_id: i64) -> String {
        match self.try_discover(website_id).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(website_id = website_id, error = %e, "Feed discovery failed");
                format!("Error: {:#}", e)
            }
        }
    }

    async fn try_discover(&self, website_id: i64) -> anyhow::Result<String> {
        let Some(website) = self.db.get_website(website_id).await? else {
            tracing::error!(website_id = website_id, "Website not found");
            return Ok(format!("Website with ID {} not found", website_id));
        };
        tracing::info!(website = %website.name, url = %website.url, "Starting feed discovery");

        let results = self.discoverer.discover_all(&website.url).await;
        let mut created = 0;
        let mut failed = 0;

        for found in &results.feeds {
            let new_feed = NewFeed {
                feed_url: found.url.clone(),
                feed_type: found.feed_type,
                title: found.title.clone(),
                description: found.description.clone(),
            };
            match self.register_feed(website.id, &new_feed).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    tracing::warn!(url = %found.url, error = %e, "Failed to register discovered feed");
                }
            }
        }

        for sitemap in &results.sitemaps {
            let new_feed = NewFeed {
                feed_url: sitemap.url.clone(),
                feed_type: FeedType::Sitemap,
                title: Some(sitemap.title.clone()),
                description: None,
            };
            match self.db.get_or_create_feed(website.id, &new_feed).await {
                Ok((feed, true)) => {
                    created += 1;
                    tracing::info!(url = %feed.feed_url, "Created sitemap feed");
                }
                Ok((_, false)) => {}
                Err(e) => {
                    failed += 1;
                    tracing::warn!(url = %sitemap.url, error = %e, "Failed to register discovered sitemap");
                }
            }
        }

        tracing::info!(
            website = %website.name,
            created = created,
            failed = failed,
            "Feed discovery completed"
        );
        if failed > 0 {
            Ok(format!(
                "Discovered {} new feeds for {} ({} failed)",
                created, website.name, failed
            ))
        } else {
            Ok(format!("Discovered {} new feeds for {}", created, website.name))
        }
    }

    /// Creates a discovered feed if needed and enriches it from its own
    /// document when it is new or was never polled. Returns whether it was
    /// created.
    async fn register_feed(&self, website_id: i64, new_feed: &NewFeed) -> anyhow::Result<bool> {
        let (feed, is_new) = self.db.get_or_create_feed(website_id, new_feed).await?;
        if is_new {
            tracing::info!(url = %feed.feed_url, "Created feed");
        }
        if is_new || feed.last_checked.is_none() {
            if let Some(info) = self.discoverer.validate_feed(&feed.feed_url).await {
                self.db
                    .update_feed_metadata(feed.id, info.title.as_deref(), info.description.as_deref())
                    .await?;
            }
        }
        Ok(is_new)
    }

    /// Polls one feed.
    pub async fn fetch_feed_content(&self, feed_id: i64) -> String {
        let feed = match self.db.get_feed(feed_id).await {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                tracing::error!(feed_id = feed_id, "Feed not found");
                return format!("Feed with ID {} not found", feed_id);
            }
            Err(e) => return format!("Error: {:#}", e),
        };

        match self.pipeline.poll_feed(&feed).await {
            Ok(report) => report.summary(),
            Err(e) => format!("Error fetching feed: {}", e),
        }
    }

    /// Backfills one article's body from its page.
    pub async fn fetch_article_full_content(&self, article_id: i64) -> String {
        match self.pipeline.fetch_full_content(article_id).await {
            Ok(outcome) => outcome.summary(article_id),
            Err(e) => {
                tracing::error!(article_id = article_id, error = %e, "Content backfill failed");
                format!("Error: {}", e)
            }
        }
    }

    /// Backfills up to `limit` articles that have no content, sitemap stubs
    /// first. Requests share the rate limiter, so one slow origin only slows
    /// its own articles.
    pub async fn backfill_missing_content(
        &self,
        limit: i64,
        website_filter: Option<&str>,
    ) -> anyhow::Result<BackfillSummary> {
        let articles = self
            .db
            .get_articles_missing_content(limit, website_filter)
            .await?;
        tracing::info!(count = articles.len(), "Backfilling articles without content");

        let outcomes: Vec<_> = stream::iter(articles)
            .map(|article| {
                let pipeline = self.pipeline.clone();
                async move { pipeline.fetch_full_content(article.id).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = BackfillSummary::default();
        for outcome in outcomes {
            summary.processed += 1;
            match outcome {
                Ok(BackfillOutcome::Fetched) => summary.succeeded += 1,
                Ok(BackfillOutcome::AlreadyHasContent) => summary.succeeded += 1,
                Ok(BackfillOutcome::NoContent | BackfillOutcome::NotFound) => summary.failed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(error = %e, "Backfill failed");
                }
            }
        }
        Ok(summary)
    }

    /// Re-validates every active feed of a website. Sitemap feeds are skipped.
    pub async fn validate_website_feeds(&self, website_id: i64) -> anyhow::Result<Vec<(Feed, bool)>> {
        let feeds = self.db.get_feeds_for_website(website_id).await?;
        let mut results = Vec::new();
        for feed in feeds
            .into_iter()
            .filter(|f| f.active && f.feed_type != FeedType::Sitemap)
        {
            let valid = self.discoverer.validate_feed(&feed.feed_url).await.is_some();
            results.push((feed, valid));
        }
        Ok(results)
    }
}

/// Queues one fetch per active feed, optionally restricted to websites
/// whose name or URL contains `website_filter`.
pub async fn queue_active_feeds(
    db: &Database,
    queue: &impl TaskQueue,
    website_filter: Option<&str>,
) -> String {
    let ids = match db.get_active_feed_ids(website_filter).await {
        Ok(ids) => ids,
        Err(e) => return format!("Error: {:#}", e),
    };
    tracing::info!(feeds = ids.len(), "Checking active feeds");

    let queued = enqueue_all(queue, ids.into_iter().map(Task::FetchFeed));
    format!("Queued {} feed fetch tasks", queued)
}

/// Queues one fetch per active feed.
pub async fn check_all_active_feeds(db: &Database, queue: &impl TaskQueue) -> String {
    queue_active_feeds(db, queue, None).await
}

/// Queues one discovery run per active website.
pub async fn discover_new_feeds_for_all_websites(db: &Database, queue: &impl TaskQueue) -> String {
    let websites = match db.get_active_websites().await {
        Ok(websites) => websites,
        Err(e) => return format!("Error: {:#}", e),
    };
    tracing::info!(websites = websites.len(), "Discovering feeds for active websites");

    let queued = enqueue_all(queue, websites.iter().map(|w| Task::DiscoverWebsite(w.id)));
    format!("Queued {} feed discovery tasks", queued)
}

/// Deletes fetch logs started more than `retention_days` days ago.
pub async fn cleanup_old_logs(db: &Database, retention_days: i64) -> String {
    let cutoff = chrono::Utc::now()
        .timestamp()
        .saturating_sub(retention_days.saturating_mul(86_400));
    match db.delete_fetch_logs_before(cutoff).await {
        Ok(deleted) => {
            tracing::info!(deleted = deleted, "Deleted old fetch logs");
            format!("Deleted {} old fetch logs", deleted)
        }
        Err(e) => format!("Error: {:#}", e),
    }
}

fn enqueue_all(queue: &impl TaskQueue, tasks: impl Iterator<Item = Task>) -> usize {
    let mut queued = 0;
    for task in tasks {
        match queue.enqueue(task) {
            Ok(()) => queued += 1,
            Err(e) => {
                tracing::warn!(task = ?task, error = %e, "Could not queue task");
                break;
            }
        }
    }
    queued
}

/// Drains `receiver`, running up to `concurrency` tasks at once, until every
/// sender is dropped. Results come back in completion order.
///
/// A panicking task is reported in its summary and does not stop the pool.
pub async fn run_worker_pool(
    harvester: Harvester,
    receiver: mpsc::UnboundedReceiver<Task>,
    concurrency: usize,
) -> Vec<(Task, String)> {
    let tasks = stream::unfold(receiver, |mut rx| async move {
        rx.recv().await.map(|task| (task, rx))
    });

    tasks
        .map(|task| {
            let harvester = harvester.clone();
            async move {
                let summary = AssertUnwindSafe(harvester.run(task))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic);
                        tracing::error!(task = ?task, error = %message, "Task panicked");
                        format!("Error: task panicked: {}", message)
                    });
                tracing::debug!(task = ?task, summary = %summary, "Task finished");
                (task, summary)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}
