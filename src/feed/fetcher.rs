use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

use super::parser::parse_feed;
use super::sitemap::{SitemapError, SitemapExpander};
use crate::config::PipelineConfig;
use crate::content::extract_main_content;
use crate::http::{FetchError, HttpClient, RequestProfile};
use crate::storage::{Database, Feed, FeedType, FetchOutcome, Reconciliation};
use crate::util::{humanize_slug, title_from_url};

/// Errors that fail a single feed poll.
///
/// Per-article problems never surface here; they are logged and skipped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Database(format!("{:#}", e))
    }
}

impl From<SitemapError> for PipelineError {
    fn from(e: SitemapError) -> Self {
        match e {
            SitemapError::Fetch(e) => PipelineError::Fetch(e),
            other => PipelineError::Parse(other.to_string()),
        }
    }
}

/// Counters from one successful poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReport {
    Feed {
        new_articles: usize,
        updated_articles: usize,
        /// Articles owned by another feed that gained this feed as an edge
        cross_posted: usize,
        /// Entries that could not be stored
        failed: usize,
    },
    Sitemap {
        urls_found: usize,
        created: usize,
        skipped_too_long: usize,
    },
}

impl PollReport {
    pub fn summary(&self) -> String {
        match *self {
            PollReport::Feed {
                new_articles,
                updated_articles,
                ..
            } => format!(
                "Fetched {} new and {} updated articles",
                new_articles, updated_articles
            ),
            PollReport::Sitemap {
                urls_found,
                created,
                skipped_too_long,
            } => {
                let mut msg = format!(
                    "Found {} URLs in sitemap, created {} new articles",
                    urls_found, created
                );
                if skipped_too_long > 0 {
                    msg.push_str(&format!(
                        " (skipped {} URLs due to length)",
                        skipped_too_long
                    ));
                }
                msg
            }
        }
    }

    fn outcome(&self) -> FetchOutcome {
        let (new_articles, updated_articles) = match *self {
            PollReport::Feed {
                new_articles,
                updated_articles,
                ..
            } => (new_articles, updated_articles),
            PollReport::Sitemap { created, .. } => (created, 0),
        };
        FetchOutcome {
            success: true,
            new_articles: i64::try_from(new_articles).unwrap_or(i64::MAX),
            updated_articles: i64::try_from(updated_articles).unwrap_or(i64::MAX),
            error_message: None,
        }
    }
}

/// Result of a full-content backfill attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    NotFound,
    /// Left untouched, no request made
    AlreadyHasContent,
    Fetched,
    /// Page unreachable, not HTML, or nothing extractable
    NoContent,
}

impl BackfillOutcome {
    pub fn summary(&self, article_id: i64) -> String {
        match self {
            BackfillOutcome::NotFound => format!("Article with ID {} not found", article_id),
            BackfillOutcome::AlreadyHasContent => "Article already has content".to_owned(),
            BackfillOutcome::Fetched => "Content fetched successfully".to_owned(),
            BackfillOutcome::NoContent => "Could not fetch content".to_owned(),
        }
    }
}

/// Polls feeds into the store and backfills article bodies.
#[derive(Clone)]
pub struct FetchPipeline {
    db: Database,
    client: HttpClient,
    sitemaps: SitemapExpander,
    settings: PipelineConfig,
    sitemap_max_depth: usize,
}

impl FetchPipeline {
    pub fn new(
        db: Database,
        client: HttpClient,
        settings: PipelineConfig,
        sitemap_max_depth: usize,
    ) -> Self {
        Self {
            sitemaps: SitemapExpander::new(client.clone()),
            db,
            client,
            settings,
            sitemap_max_depth,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Polls one feed.
    ///
    /// A fetch log is opened first and is always closed, whether the poll
    /// succeeds, fails, or panics. The feed's health is updated with the
    /// outcome, which may trip the circuit breaker.
    pub async fn poll_feed(&self, feed: &Feed) -> Result<PollReport, PipelineError> {
        let log_id = self.db.open_fetch_log(feed.id).await?;

        let result = AssertUnwindSafe(self.run_poll(feed))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(panic))));

        let error_message = result.as_ref().err().map(ToString::to_string);
        let checked = match &error_message {
            None => Ok(()),
            Some(msg) => Err(msg.as_str()),
        };
        match self
            .db
            .mark_feed_checked(feed.id, checked, self.settings.circuit_breaker_threshold)
            .await
        {
            Ok(health) if feed.active && !health.active => {
                tracing::warn!(
                    feed_id = feed.id,
                    url = %feed.feed_url,
                    failures = health.error_count,
                    "Feed deactivated after consecutive failures"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(feed_id = feed.id, error = %e, "Failed to record feed health");
            }
        }

        let outcome = match &result {
            Ok(report) => report.outcome(),
            Err(e) => FetchOutcome {
                success: false,
                error_message: Some(e.to_string()),
                ..FetchOutcome::default()
            },
        };
        if let Err(e) = self.db.close_fetch_log(log_id, &outcome).await {
            tracing::warn!(feed_id = feed.id, log_id = log_id, error = %e, "Failed to close fetch log");
        }

        match &result {
            Ok(report) => tracing::info!(feed_id = feed.id, url = %feed.feed_url, "{}", report.summary()),
            Err(e) => tracing::warn!(feed_id = feed.id, url = %feed.feed_url, error = %e, "Feed poll failed"),
        }
        result
    }

    async fn run_poll(&self, feed: &Feed) -> Result<PollReport, PipelineError> {
        match feed.feed_type {
            FeedType::Rss | FeedType::Atom => self.poll_syndication(feed).await,
            FeedType::Sitemap => self.poll_sitemap(feed).await,
        }
    }

    async fn poll_syndication(&self, feed: &Feed) -> Result<PollReport, PipelineError> {
        let response = self.client.get(&feed.feed_url, RequestProfile::Feed).await?;
        let parsed = parse_feed(&feed.feed_url, &response.body);
        if !parsed.success {
            return Err(PipelineError::Parse(
                parsed.error.unwrap_or_else(|| "unknown parse failure".to_owned()),
            ));
        }

        if let Some(title) = parsed.feed_info.title.as_deref() {
            if let Err(e) = self.db.set_feed_title_if_missing(feed.id, title).await {
                tracing::debug!(feed_id = feed.id, error = %e, "Could not store feed title");
            }
        }

        let mut new_articles = 0;
        let mut updated_articles = 0;
        let mut cross_posted = 0;
        let mut failed = 0;

        for article in &parsed.articles {
            match self.db.reconcile_article(feed.id, article).await {
                Ok(Reconciliation::Created(_)) => new_articles += 1,
                Ok(Reconciliation::Updated(id)) => {
                    updated_articles += 1;
                    tracing::debug!(article_id = id, url = %article.url, "Updated article");
                }
                Ok(Reconciliation::Unchanged(_)) => {}
                Ok(Reconciliation::CrossPosted {
                    article_id,
                    edge_added,
                }) => {
                    if edge_added {
                        cross_posted += 1;
                        tracing::info!(
                            article_id = article_id,
                            feed_id = feed.id,
                            "Article also found in another feed"
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        feed_id = feed.id,
                        url = %article.url,
                        error = %e,
                        "Skipping article that could not be stored"
                    );
                }
            }
        }

        Ok(PollReport::Feed {
            new_articles,
            updated_articles,
            cross_posted,
            failed,
        })
    }

    async fn poll_sitemap(&self, feed: &Feed) -> Result<PollReport, PipelineError> {
        let urls = self
            .sitemaps
            .collect_page_urls(&feed.feed_url, self.sitemap_max_depth)
            .await?;
        tracing::info!(feed_id = feed.id, urls = urls.len(), "Harvested sitemap URLs");

        let summary = format!("Article from sitemap: {}", feed.feed_url);
        let published = self
            .settings
            .stamp_sitemap_stubs
            .then(|| chrono::Utc::now().timestamp());

        let mut created = 0;
        let mut skipped_too_long = 0;
        for url in &urls {
            if url.chars().count() > self.settings.max_url_length {
                skipped_too_long += 1;
                tracing::warn!(
                    feed_id = feed.id,
                    url = %url.chars().take(100).collect::<String>(),
                    "Skipping sitemap URL that is too long"
                );
                continue;
            }

            let title = title_from_url(url, self.settings.max_title_length);
            match self
                .db
                .create_stub_article(feed.id, url, &title, &summary, published)
                .await
            {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(feed_id = feed.id, url = %url, error = %e, "Failed to create stub article");
                }
            }
        }

        Ok(PollReport::Sitemap {
            urls_found: urls.len(),
            created,
            skipped_too_long,
        })
    }

    /// Fetches an article's page and stores its extracted body text.
    ///
    /// Articles that already have content are returned untouched without any
    /// request. Unreachable pages, non-HTML responses and pages with nothing
    /// extractable all leave the article unchanged.
    pub async fn fetch_full_content(&self, article_id: i64) -> Result<BackfillOutcome, PipelineError> {
        let Some(article) = self.db.get_article(article_id).await? else {
            return Ok(BackfillOutcome::NotFound);
        };
        if article.has_content() {
            tracing::debug!(article_id = article_id, "Article already has content, skipping");
            return Ok(BackfillOutcome::AlreadyHasContent);
        }

        let html = match self.client.get_html(&article.url).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(article_id = article_id, url = %article.url, error = %e, "Could not fetch article page");
                return Ok(BackfillOutcome::NoContent);
            }
        };

        let Some(content) = extract_main_content(&html) else {
            tracing::warn!(article_id = article_id, url = %article.url, "No main content found");
            return Ok(BackfillOutcome::NoContent);
        };

        // Stub titles are raw URL slugs; give them a readable form
        let slug_title = title_from_url(&article.url, self.settings.max_title_length);
        let title = (article.title == slug_title && !article.title.contains("://"))
            .then(|| humanize_slug(&article.title))
            .filter(|t| !t.is_empty());

        self.db
            .set_article_content(article_id, &content, title.as_deref())
            .await?;
        tracing::info!(article_id = article_id, chars = content.len(), "Stored article content");
        Ok(BackfillOutcome::Fetched)
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
