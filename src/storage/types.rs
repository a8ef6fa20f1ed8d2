use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening the store
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Feed Type
// ============================================================================

/// Kind of document a feed URL serves. Stored as upper-case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedType {
    #[default]
    Rss,
    Atom,
    Sitemap,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Rss => "RSS",
            FeedType::Atom => "ATOM",
            FeedType::Sitemap => "SITEMAP",
        }
    }

    /// Classifies a feed from its URL and (optionally) the response content type.
    ///
    /// `atom` anywhere wins, then `sitemap` in the URL, otherwise RSS.
    pub fn classify(url: &str, content_type: Option<&str>) -> Self {
        let url = url.to_ascii_lowercase();
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        if url.contains("atom") || content_type.contains("atom") {
            FeedType::Atom
        } else if url.contains("sitemap") {
            FeedType::Sitemap
        } else {
            FeedType::Rss
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown feed type: {0}")]
pub struct UnknownFeedType(pub String);

impl FromStr for FeedType {
    type Err = UnknownFeedType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RSS" => Ok(FeedType::Rss),
            "ATOM" => Ok(FeedType::Atom),
            "SITEMAP" => Ok(FeedType::Sitemap),
            _ => Err(UnknownFeedType(s.to_owned())),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Website {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub active: bool,
    pub created_at: i64,
}

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub website_id: i64,
    pub feed_url: String,
    pub feed_type: FeedType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_checked: Option<i64>,
    pub last_successful_fetch: Option<i64>,
    pub active: bool,
    /// Consecutive failed polls (circuit breaker)
    pub error_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl Feed {
    /// Title for display and logging, falling back to the URL.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.feed_url)
    }
}

/// Feed fields supplied on creation
#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub feed_url: String,
    pub feed_type: FeedType,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Article data from database
///
/// `url` is unique across the whole store. `feed_id` is the primary
/// (owning) feed; other feeds that carried the same URL are recorded as
/// edges in `article_feeds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    /// `None` when the source carried no usable date (e.g. sitemap stubs)
    pub published_date: Option<i64>,
    pub fetched_at: i64,
    pub updated_at: i64,
    pub content_hash: String,
    /// JSON snapshot of the source entry
    pub raw_data: Option<String>,
    pub tags: Vec<String>,
}

impl Article {
    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// Represents a parsed article from a feed, ready for reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<i64>,
    pub tags: Vec<String>,
    pub content_hash: String,
    pub raw_data: Option<serde_json::Value>,
}

/// Outcome of reconciling one parsed article against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No article had this URL; a new one now belongs to the polling feed.
    Created(i64),
    /// Same feed, different content hash; content fields were rewritten.
    Updated(i64),
    /// Same feed, same hash.
    Unchanged(i64),
    /// The URL belongs to another feed. `edge_added` is false when the
    /// polling feed was already recorded as an additional feed.
    CrossPosted { article_id: i64, edge_added: bool },
}

impl Reconciliation {
    pub fn article_id(&self) -> i64 {
        match *self {
            Reconciliation::Created(id)
            | Reconciliation::Updated(id)
            | Reconciliation::Unchanged(id) => id,
            Reconciliation::CrossPosted { article_id, .. } => article_id,
        }
    }
}

/// Health of a feed after a poll was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedHealth {
    pub error_count: i64,
    pub active: bool,
}

/// One fetch attempt. Immutable once `completed_at` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: bool,
    pub new_articles: i64,
    pub updated_articles: i64,
    pub error_message: Option<String>,
}

/// Final counters written when a fetch log is closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub success: bool,
    pub new_articles: i64,
    pub updated_articles: i64,
    pub error_message: Option<String>,
}

/// New-article count for one feed over a time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedArticleCount {
    pub feed_id: i64,
    pub feed_url: String,
    pub feed_title: Option<String>,
    pub website_name: String,
    pub count: i64,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WebsiteRow {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub active: bool,
    pub created_at: i64,
}

impl WebsiteRow {
    pub(crate) fn into_website(self) -> Website {
        Website {
            id: self.id,
            url: self.url,
            name: self.name,
            active: self.active,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub website_id: i64,
    pub feed_url: String,
    pub feed_type: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_checked: Option<i64>,
    pub last_successful_fetch: Option<i64>,
    pub active: bool,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        let feed_type = self.feed_type.parse().unwrap_or_else(|e| {
            tracing::warn!(feed_id = self.id, error = %e, "Stored feed type invalid, treating as RSS");
            FeedType::Rss
        });
        Feed {
            id: self.id,
            website_id: self.website_id,
            feed_url: self.feed_url,
            feed_type,
            title: self.title,
            description: self.description,
            last_checked: self.last_checked,
            last_successful_fetch: self.last_successful_fetch,
            active: self.active,
            error_count: self.error_count,
            last_error: self.last_error,
            created_at: self.created_at,
        }
    }
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<i64>,
    pub fetched_at: i64,
    pub updated_at: i64,
    pub content_hash: String,
    pub raw_data: Option<String>,
    pub tags: Option<String>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        let tags = self
            .tags
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();
        Article {
            id: self.id,
            feed_id: self.feed_id,
            url: self.url,
            title: self.title,
            content: self.content,
            summary: self.summary,
            author: self.author,
            published_date: self.published_date,
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            content_hash: self.content_hash,
            raw_data: self.raw_data,
            tags,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FetchLogRow {
    pub id: i64,
    pub feed_id: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: bool,
    pub new_articles: i64,
    pub updated_articles: i64,
    pub error_message: Option<String>,
}

impl FetchLogRow {
    pub(crate) fn into_fetch_log(self) -> FetchLog {
        FetchLog {
            id: self.id,
            feed_id: self.feed_id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            success: self.success,
            new_articles: self.new_articles,
            updated_articles: self.updated_articles,
            error_message: self.error_message,
        }
    }
}
