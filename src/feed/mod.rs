//! Feed acquisition: discovery, parsing, sitemap expansion and polling.
//!
//! - [`parser`] turns RSS/Atom/JSON feed bytes into [`ParsedArticle`](crate::storage::ParsedArticle)s
//!   using `feed-rs`, resolving entry URLs against the feed URL
//! - [`sitemap`] parses sitemap XML with `quick-xml` and resolves nested
//!   indexes up to a depth limit
//! - [`discovery`] probes a website for feeds and sitemaps
//! - [`fetcher`] polls one feed into the store and backfills article bodies
//! - [`manifest`] registers feeds in bulk from a JSON list
//!
//! # Example
//!
//! ```ignore
//! let pipeline = FetchPipeline::new(db, client, config.pipeline, config.discovery.sitemap_max_depth);
//! let report = pipeline.poll_feed(&feed).await?;
//! println!("{}", report.summary());
//! ```

mod discovery;
mod fetcher;
mod manifest;
mod parser;
mod sitemap;

pub use discovery::{
    DiscoveredFeed, DiscoveredSitemap, DiscoveryResult, FeedDiscoverer, COMMON_FEED_PATHS,
    SITEMAP_PATHS,
};
pub use fetcher::{BackfillOutcome, FetchPipeline, PipelineError, PollReport};
pub(crate) use fetcher::panic_message;
pub use manifest::{
    import_feeds, load_manifest, parse_manifest, ImportCounts, ImportReport, ManifestEntry,
    ManifestError,
};
pub use parser::{content_hash, parse_feed, FeedInfo, FeedParseResult};
pub use sitemap::{
    parse_sitemap, LeafKind, SitemapDocument, SitemapError, SitemapExpander, SitemapLeaf,
    DEFAULT_MAX_DEPTH,
};
