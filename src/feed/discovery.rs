use futures::future::join_all;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::time::Duration;

use super::parser::{parse_feed, FeedInfo};
use super::sitemap::{LeafKind, SitemapExpander};
use crate::config::DiscoveryConfig;
use crate::http::{HttpClient, RequestProfile};
use crate::storage::FeedType;
use crate::util::{resolve_url, strip_control_chars};

/// Well-known feed locations probed on every site
pub const COMMON_FEED_PATHS: [&str; 13] = [
    "/rss",
    "/rss.xml",
    "/feed",
    "/feed.xml",
    "/feeds",
    "/atom",
    "/atom.xml",
    "/index.rss",
    "/index.xml",
    "/blog/rss",
    "/blog/feed",
    "/news/rss",
    "/news/feed",
];

/// Well-known sitemap locations probed with HEAD
pub const SITEMAP_PATHS: [&str; 4] = [
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemap",
    "/sitemaps.xml",
];

/// `<link type=..>` values that mark a feed
const FEED_MIME_TYPES: [&str; 5] = [
    "application/rss+xml",
    "application/atom+xml",
    "application/rdf+xml",
    "application/feed+json",
    "text/xml",
];

const ROBOTS_SITEMAP_TITLE: &str = "Sitemap from robots.txt";

/// A feed candidate found on a site
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFeed {
    pub url: String,
    pub feed_type: FeedType,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A leaf sitemap found on a site, after index expansion
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSitemap {
    pub url: String,
    pub title: String,
    pub kind: LeafKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResult {
    pub feeds: Vec<DiscoveredFeed>,
    pub sitemaps: Vec<DiscoveredSitemap>,
}

#[derive(Debug, Clone)]
struct SitemapCandidate {
    url: String,
    title: String,
}

/// Finds the feeds and sitemaps a website publishes.
///
/// Every probe is speculative: failures are logged at debug level and
/// simply contribute nothing.
#[derive(Clone)]
pub struct FeedDiscoverer {
    client: HttpClient,
    sitemaps: SitemapExpander,
    timeout: Duration,
    sitemap_max_depth: usize,
}

impl FeedDiscoverer {
    pub fn new(client: HttpClient, config: &DiscoveryConfig) -> Self {
        Self {
            sitemaps: SitemapExpander::new(client.clone()),
            client,
            timeout: config.timeout(),
            sitemap_max_depth: config.sitemap_max_depth,
        }
    }

    /// Runs all four probes against `base_url` and merges the results.
    ///
    /// Feeds and sitemaps are each deduplicated by URL; the first probe to
    /// report a URL wins (HTML links, then common paths; robots.txt, then
    /// common sitemap paths).
    pub async fn discover_all(&self, base_url: &str) -> DiscoveryResult {
        let base = base_url.trim_end_matches('/');

        let (html_feeds, path_feeds, robots_sitemaps, path_sitemaps) = tokio::join!(
            self.discover_from_html(base),
            self.check_common_paths(base),
            self.sitemaps_from_robots(base),
            self.check_sitemap_paths(base),
        );

        let mut seen = HashSet::new();
        let feeds: Vec<DiscoveredFeed> = html_feeds
            .into_iter()
            .chain(path_feeds)
            .filter(|f| seen.insert(f.url.clone()))
            .collect();

        let mut seen = HashSet::new();
        let candidates: Vec<SitemapCandidate> = robots_sitemaps
            .into_iter()
            .chain(path_sitemaps)
            .filter(|s| seen.insert(s.url.clone()))
            .collect();

        let mut seen = HashSet::new();
        let mut sitemaps = Vec::new();
        for candidate in candidates {
            for leaf in self
                .sitemaps
                .expand(&candidate.url, self.sitemap_max_depth)
                .await
            {
                if seen.insert(leaf.url.clone()) {
                    sitemaps.push(DiscoveredSitemap {
                        url: leaf.url,
                        title: candidate.title.clone(),
                        kind: leaf.kind,
                    });
                }
            }
        }

        tracing::info!(
            url = %base,
            feeds = feeds.len(),
            sitemaps = sitemaps.len(),
            "Discovery finished"
        );
        DiscoveryResult { feeds, sitemaps }
    }

    /// Re-fetches and parses a feed. Returns its metadata when the document
    /// has entries or a feed header.
    pub async fn validate_feed(&self, feed_url: &str) -> Option<FeedInfo> {
        let response = match self
            .client
            .get_with_timeout(feed_url, RequestProfile::Feed, self.timeout)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url = %feed_url, error = %e, "Feed validation fetch failed");
                return None;
            }
        };

        let parsed = parse_feed(feed_url, &response.body);
        if parsed.is_feed() {
            Some(parsed.feed_info)
        } else {
            tracing::warn!(url = %feed_url, error = ?parsed.error, "Document is not a feed");
            None
        }
    }

    async fn discover_from_html(&self, base: &str) -> Vec<DiscoveredFeed> {
        match self.client.get(base, RequestProfile::Page).await {
            Ok(response) => {
                let feeds = feed_links_in_html(&response.text(), base);
                for feed in &feeds {
                    tracing::info!(url = %feed.url, "Found feed link in HTML");
                }
                feeds
            }
            Err(e) => {
                tracing::warn!(url = %base, error = %e, "Could not fetch site HTML");
                Vec::new()
            }
        }
    }

    async fn check_common_paths(&self, base: &str) -> Vec<DiscoveredFeed> {
        let probes = COMMON_FEED_PATHS.iter().filter_map(|path| {
            let url = resolve_url(path, base)?;
            Some(self.probe_feed(url))
        });
        join_all(probes).await.into_iter().flatten().collect()
    }

    async fn probe_feed(&self, url: String) -> Option<DiscoveredFeed> {
        if !self.client.exists(&url, self.timeout).await {
            return None;
        }

        let response = match self
            .client
            .get_with_timeout(&url, RequestProfile::Feed, self.timeout)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Common path probe failed");
                return None;
            }
        };

        let parsed = parse_feed(&url, &response.body);
        if !parsed.is_feed() {
            tracing::debug!(url = %url, "Common path is not a feed");
            return None;
        }

        tracing::info!(url = %url, "Found feed at common path");
        let info = parsed.feed_info;
        Some(DiscoveredFeed {
            feed_type: info
                .kind
                .unwrap_or_else(|| FeedType::classify(&url, response.content_type.as_deref())),
            url,
            title: info.title,
            description: info.description,
        })
    }

    async fn sitemaps_from_robots(&self, base: &str) -> Vec<SitemapCandidate> {
        let Some(robots_url) = resolve_url("/robots.txt", base) else {
            return Vec::new();
        };
        match self
            .client
            .get_with_timeout(&robots_url, RequestProfile::Feed, self.timeout)
            .await
        {
            Ok(response) => sitemap_lines(&response.text(), base)
                .into_iter()
                .map(|url| {
                    tracing::info!(url = %url, "Found sitemap in robots.txt");
                    SitemapCandidate {
                        url,
                        title: ROBOTS_SITEMAP_TITLE.to_owned(),
                    }
                })
                .collect(),
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "No robots.txt");
                Vec::new()
            }
        }
    }

    async fn check_sitemap_paths(&self, base: &str) -> Vec<SitemapCandidate> {
        let probes = SITEMAP_PATHS.iter().filter_map(|path| {
            let url = resolve_url(path, base)?;
            Some(async move {
                self.client
                    .exists(&url, self.timeout)
                    .await
                    .then(|| SitemapCandidate {
                        url,
                        title: format!("Sitemap at {}", path),
                    })
            })
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}

/// Collects `<link>` elements whose `type` is a feed MIME type, in document
/// order. Relative hrefs resolve against `base`.
fn feed_links_in_html(html: &str, base: &str) -> Vec<DiscoveredFeed> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("link[href][type]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    document
        .select(&selector)
        .filter_map(|link| {
            let el = link.value();
            let mime = el.attr("type")?.trim().to_ascii_lowercase();
            if !FEED_MIME_TYPES.contains(&mime.as_str()) {
                return None;
            }
            let url = resolve_url(el.attr("href")?, base)?;
            let title = el
                .attr("title")
                .map(|t| strip_control_chars(t.trim()).into_owned())
                .filter(|t| !t.is_empty());
            Some(DiscoveredFeed {
                feed_type: FeedType::classify(&url, Some(&mime)),
                url,
                title,
                description: None,
            })
        })
        .filter(|f| seen.insert(f.url.clone()))
        .collect()
}

/// `Sitemap:` directives from a robots.txt body, resolved against `base`.
fn sitemap_lines(robots: &str, base: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if !key.trim().eq_ignore_ascii_case("sitemap") {
                return None;
            }
            resolve_url(value.trim(), base)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpClientConfig, RateLimiter};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Site News</title><link>https://example.com</link>
<description>All the news</description>
<item><title>One</title><link>https://example.com/one</link></item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"><title>Atom Side</title><id>urn:x</id>
<updated>2024-01-01T00:00:00Z</updated>
<entry><title>A</title><id>urn:a</id><link href="https://example.com/a"/>
<updated>2024-01-01T00:00:00Z</updated></entry></feed>"#;

    fn discoverer() -> FeedDiscoverer {
        let client = HttpClient::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                max_retries: 0,
                ..HttpClientConfig::default()
            },
            Arc::new(RateLimiter::new(Duration::ZERO, 16)),
        )
        .unwrap();
        FeedDiscoverer::new(client, &DiscoveryConfig::default())
    }

    async fn serve(server: &MockServer, at: &str, body: &str, content_type: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, content_type),
            )
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[test]
    fn test_feed_links_in_html() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" title="Main" href="/rss.xml">
            <link rel="alternate" type="application/atom+xml" href="https://cdn.example.com/atom">
            <link rel="stylesheet" type="text/css" href="/style.css">
            <link rel="alternate" type="application/rss+xml" href="/rss.xml">
        </head></html>"#;
        let feeds = feed_links_in_html(html, "https://example.com/blog/");
        assert_eq!(
            feeds,
            vec![
                DiscoveredFeed {
                    url: "https://example.com/rss.xml".into(),
                    feed_type: FeedType::Rss,
                    title: Some("Main".into()),
                    description: None,
                },
                DiscoveredFeed {
                    url: "https://cdn.example.com/atom".into(),
                    feed_type: FeedType::Atom,
                    title: None,
                    description: None,
                },
            ]
        );
    }

    #[test]
    fn test_sitemap_lines_case_insensitive_and_relative() {
        let robots = "User-agent: *\nDisallow: /admin\nSitemap: https://example.com/a.xml\nSITEMAP: /b.xml\n# sitemap: ignored";
        assert_eq!(
            sitemap_lines(robots, "https://example.com"),
            vec!["https://example.com/a.xml", "https://example.com/b.xml"]
        );
    }

    #[tokio::test]
    async fn test_discover_all_merges_probes() {
        let server = MockServer::start().await;
        let base = server.uri();
        let html = format!(
            r#"<html><head><link rel="alternate" type="application/rss+xml" href="{base}/rss"></head></html>"#
        );
        serve(&server, "/", &html, "text/html").await;
        serve(&server, "/rss", RSS, "application/rss+xml").await;
        serve(&server, "/atom.xml", ATOM, "application/atom+xml").await;
        serve(
            &server,
            "/robots.txt",
            &format!("Sitemap: {base}/sitemap.xml\n"),
            "text/plain",
        )
        .await;
        serve(
            &server,
            "/sitemap.xml",
            r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"><url><loc>https://example.com/p</loc></url></urlset>"#,
            "application/xml",
        )
        .await;

        let result = discoverer().discover_all(&base).await;

        let urls: Vec<_> = result.feeds.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, vec![format!("{base}/rss"), format!("{base}/atom.xml")]);
        assert_eq!(result.feeds[1].feed_type, FeedType::Atom);
        assert_eq!(result.feeds[1].title.as_deref(), Some("Atom Side"));

        assert_eq!(result.sitemaps.len(), 1);
        assert_eq!(result.sitemaps[0].url, format!("{base}/sitemap.xml"));
        assert_eq!(result.sitemaps[0].title, "Sitemap from robots.txt");
        assert_eq!(result.sitemaps[0].kind, LeafKind::UrlSet { url_count: 1 });
    }

    #[tokio::test]
    async fn test_common_path_that_is_not_a_feed_is_ignored() {
        let server = MockServer::start().await;
        serve(&server, "/feed", "<html><body>Not here</body></html>", "text/html").await;

        let result = discoverer().discover_all(&server.uri()).await;
        assert!(result.feeds.is_empty());
        assert!(result.sitemaps.is_empty());
    }

    #[tokio::test]
    async fn test_sitemap_path_probe_titles_by_path() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/sitemap_index.xml",
            "<sitemapindex></sitemapindex>",
            "application/xml",
        )
        .await;
        Mock::given(method("HEAD"))
            .and(path("/sitemaps.xml"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let result = discoverer().discover_all(&server.uri()).await;
        // The empty index expands to nothing; the HEAD-only sitemap is kept
        // as an unreachable placeholder.
        assert_eq!(result.sitemaps.len(), 1);
        assert_eq!(result.sitemaps[0].title, "Sitemap at /sitemaps.xml");
        assert!(matches!(result.sitemaps[0].kind, LeafKind::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_validate_feed() {
        let server = MockServer::start().await;
        serve(&server, "/rss", RSS, "application/rss+xml").await;
        serve(&server, "/page", "<html><body>hello</body></html>", "text/html").await;

        let d = discoverer();
        let info = d.validate_feed(&format!("{}/rss", server.uri())).await.unwrap();
        assert_eq!(info.title.as_deref(), Some("Site News"));
        assert_eq!(info.description.as_deref(), Some("All the news"));

        assert!(d.validate_feed(&format!("{}/page", server.uri())).await.is_none());
        assert!(d.validate_feed(&format!("{}/missing", server.uri())).await.is_none());
    }
}
