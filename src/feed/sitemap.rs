use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashSet;
use thiserror::Error;

use crate::http::{FetchError, HttpClient, RequestProfile};

/// Default nesting limit for sitemap indexes
pub const DEFAULT_MAX_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("Failed to fetch sitemap: {0}")]
    Fetch(#[from] FetchError),

    #[error("XML parse error: {0}")]
    Xml(String),

    /// Well-formed XML whose root is neither `<urlset>` nor `<sitemapindex>`
    #[error("Document is not a sitemap")]
    NotASitemap,
}

/// A parsed sitemap document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    /// `<sitemapindex>`: locations of further sitemaps
    Index(Vec<String>),
    /// `<urlset>`: page locations
    UrlSet(Vec<String>),
}

/// One entry of an expanded sitemap tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapLeaf {
    pub url: String,
    pub depth: usize,
    pub kind: LeafKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafKind {
    /// A `<urlset>` with this many page URLs
    UrlSet { url_count: usize },
    /// Reached the depth limit; left unexpanded
    DepthLimited,
    /// Fetch or parse failed; kept so discovery still reports it
    Unreachable { reason: String },
}

/// Parses sitemap XML, matching elements by local name so both the
/// `http://www.sitemaps.org/schemas/sitemap/0.9` namespace (prefixed or
/// default) and un-namespaced documents are accepted.
pub fn parse_sitemap(bytes: &[u8]) -> Result<SitemapDocument, SitemapError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut root: Option<Vec<u8>> = None;
    let mut sitemap_locs = Vec::new();
    let mut page_locs = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if root.is_none() {
                    root = Some(name.clone());
                }
                stack.push(name);
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SitemapError::Xml(e.to_string()))?
                    .trim()
                    .to_string();
                push_loc(&stack, text, &mut sitemap_locs, &mut page_locs);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).trim().to_string();
                push_loc(&stack, text, &mut sitemap_locs, &mut page_locs);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SitemapError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    match root.as_deref() {
        Some(b"sitemapindex") => Ok(SitemapDocument::Index(sitemap_locs)),
        Some(b"urlset") => Ok(SitemapDocument::UrlSet(page_locs)),
        _ => Err(SitemapError::NotASitemap),
    }
}

fn push_loc(stack: &[Vec<u8>], text: String, sitemaps: &mut Vec<String>, pages: &mut Vec<String>) {
    if text.is_empty() || stack.last().map(Vec::as_slice) != Some(b"loc".as_slice()) {
        return;
    }
    match stack.len().checked_sub(2).and_then(|i| stack.get(i)).map(Vec::as_slice) {
        Some(b"sitemap") => sitemaps.push(text),
        Some(b"url") => pages.push(text),
        _ => {}
    }
}

/// Resolves sitemap indexes into leaf sitemaps and page URLs.
#[derive(Clone)]
pub struct SitemapExpander {
    client: HttpClient,
}

impl SitemapExpander {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub async fn fetch_document(&self, url: &str) -> Result<SitemapDocument, SitemapError> {
        let response = self.client.get(url, RequestProfile::Feed).await?;
        parse_sitemap(&response.body)
    }

    /// Expands `url` into its leaf sitemaps, following nested indexes up to
    /// `max_depth` levels.
    ///
    /// Never fails: a document that cannot be fetched or parsed becomes an
    /// `Unreachable` leaf, and a sitemap at the depth limit is returned
    /// unexpanded. Every URL is fetched at most once; an index that is
    /// referenced again (a cycle) is returned unexpanded as well. Leaves are
    /// deduplicated by URL, first occurrence wins.
    pub async fn expand(&self, url: &str, max_depth: usize) -> Vec<SitemapLeaf> {
        let mut leaves = Vec::new();
        let mut fetched = HashSet::new();
        let mut recorded = HashSet::new();
        // Depth-first in document order: children are pushed in reverse
        let mut pending = vec![(url.to_owned(), 0usize)];

        while let Some((current, depth)) = pending.pop() {
            if recorded.contains(&current) {
                continue;
            }
            let kind = if depth >= max_depth {
                tracing::debug!(url = %current, depth = depth, "Sitemap depth limit reached");
                LeafKind::DepthLimited
            } else if !fetched.insert(current.clone()) {
                tracing::debug!(url = %current, depth = depth, "Sitemap index already expanded");
                LeafKind::DepthLimited
            } else {
                match self.fetch_document(&current).await {
                    Ok(SitemapDocument::Index(children)) => {
                        tracing::debug!(
                            url = %current,
                            children = children.len(),
                            "Expanding sitemap index"
                        );
                        pending.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
                        continue;
                    }
                    Ok(SitemapDocument::UrlSet(pages)) => LeafKind::UrlSet {
                        url_count: pages.len(),
                    },
                    Err(e) => {
                        tracing::warn!(url = %current, error = %e, "Sitemap unreachable, keeping placeholder");
                        LeafKind::Unreachable {
                            reason: e.to_string(),
                        }
                    }
                }
            };

            recorded.insert(current.clone());
            leaves.push(SitemapLeaf {
                url: current,
                depth,
                kind,
            });
        }

        leaves
    }

    /// Collects page URLs from a sitemap, descending through indexes up to
    /// `max_depth` levels.
    ///
    /// Fails only when the root document cannot be fetched or parsed; broken
    /// child sitemaps are logged and skipped. URLs are deduplicated in order.
    pub async fn collect_page_urls(
        &self,
        url: &str,
        max_depth: usize,
    ) -> Result<Vec<String>, SitemapError> {
        let mut pages = Vec::new();
        let mut pending = match self.fetch_document(url).await? {
            SitemapDocument::UrlSet(locs) => {
                pages.extend(locs);
                Vec::new()
            }
            SitemapDocument::Index(children) => {
                children.into_iter().rev().map(|c| (c, 1usize)).collect()
            }
        };

        let mut visited = HashSet::from([url.to_owned()]);
        while let Some((child, depth)) = pending.pop() {
            if !visited.insert(child.clone()) {
                continue;
            }
            if depth >= max_depth {
                tracing::debug!(url = %child, depth = depth, "Skipping sitemap beyond depth limit");
                continue;
            }
            match self.fetch_document(&child).await {
                Ok(SitemapDocument::UrlSet(locs)) => pages.extend(locs),
                Ok(SitemapDocument::Index(children)) => {
                    pending.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
                }
                Err(e) => {
                    tracing::warn!(url = %child, error = %e, "Skipping unreachable child sitemap");
                }
            }
        }

        let mut seen = HashSet::new();
        pages.retain(|p| seen.insert(p.clone()));
        Ok(pages)
    }
}
