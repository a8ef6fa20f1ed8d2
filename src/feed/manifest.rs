//! Bulk feed registration from a JSON manifest.
//!
//! A manifest lists the feeds of one website:
//!
//! ```json
//! [
//!   {"url": "https://example.com/rss/tv", "name": "TV", "type": "RSS"},
//!   {"url": "example.com/sitemap.xml", "type": "sitemap"}
//! ]
//! ```
//!
//! `name` and `type` are optional. Unknown types fall back to RSS.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::storage::{Database, FeedType, NewFeed, Website};
use crate::util::{normalize_site_url, strip_control_chars, with_scheme_of};

/// SEC: manifests are read whole into memory
const MAX_MANIFEST_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manifest too large: {0} bytes")]
    TooLarge(u64),

    #[error("Manifest contains no feeds")]
    Empty,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub feed_type: Option<String>,
}

impl ManifestEntry {
    fn feed_type(&self) -> FeedType {
        self.feed_type
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default()
    }

    fn name(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(|n| strip_control_chars(n.trim()).into_owned())
            .filter(|n| !n.is_empty())
    }
}

/// Parses a manifest from a JSON string.
pub fn parse_manifest(json: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(json)?;
    if entries.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(entries)
}

/// Reads and parses a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_MANIFEST_SIZE {
        return Err(ManifestError::TooLarge(size));
    }
    parse_manifest(&std::fs::read_to_string(path)?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub created: usize,
    /// Existing feeds that had no title and took the manifest name
    pub updated: usize,
    pub skipped: usize,
    /// Entries without a URL or that failed to store
    pub invalid: usize,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub website: Website,
    pub website_created: bool,
    pub counts: ImportCounts,
}

impl ImportReport {
    pub fn summary(&self) -> String {
        format!(
            "Summary: {} created, {} updated, {} skipped, {} invalid",
            self.counts.created, self.counts.updated, self.counts.skipped, self.counts.invalid
        )
    }
}

/// Registers every manifest feed under one website, creating the website
/// if needed.
///
/// Feed URLs without a scheme take the website's. Entries that cannot be
/// stored are counted as invalid and do not stop the import.
pub async fn import_feeds(
    db: &Database,
    website_url: &str,
    website_name: &str,
    entries: &[ManifestEntry],
) -> Result<ImportReport> {
    let website_url = normalize_site_url(website_url);
    let (website, website_created) = db.get_or_create_website(&website_url, website_name).await?;
    if website_created {
        tracing::info!(website = %website.name, "Created website");
    }

    let mut counts = ImportCounts::default();
    for entry in entries {
        let Some(raw_url) = entry.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
            tracing::warn!(entry = ?entry, "Manifest entry has no URL");
            counts.invalid += 1;
            continue;
        };

        let feed_url = with_scheme_of(raw_url, &website.url);
        let name = entry.name();
        let new_feed = NewFeed {
            feed_url: feed_url.clone(),
            feed_type: entry.feed_type(),
            description: name.as_ref().map(|n| format!("{} - {}", website_name, n)),
            title: name.clone(),
        };

        match db.get_or_create_feed(website.id, &new_feed).await {
            Ok((_, true)) => {
                counts.created += 1;
                tracing::info!(url = %feed_url, "Added feed");
            }
            Ok((feed, false)) => {
                let renamed = match name.as_deref() {
                    Some(n) => db.set_feed_title_if_missing(feed.id, n).await?,
                    None => false,
                };
                if renamed {
                    counts.updated += 1;
                    tracing::info!(url = %feed_url, "Named existing feed");
                } else {
                    counts.skipped += 1;
                    tracing::debug!(url = %feed_url, "Feed already registered");
                }
            }
            Err(e) => {
                counts.invalid += 1;
                tracing::warn!(url = %feed_url, error = %e, "Failed to add feed");
            }
        }
    }

    Ok(ImportReport {
        website,
        website_created,
        counts,
    })
}
