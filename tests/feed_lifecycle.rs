//! Integration tests for the feed lifecycle: register, poll, cross-post,
//! update, backfill.
//!
//! Each test runs against its own in-memory SQLite database and a local
//! mock HTTP server.

use feedharvest::config::Config;
use feedharvest::storage::{Database, FeedType, NewFeed};
use feedharvest::tasks::Harvester;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> Config {
    let mut config = Config::default();
    config.http.timeout_secs = 5;
    config.http.max_retries = 0;
    config.rate_limit.min_interval_ms = 0;
    config
}

async fn test_harvester() -> Harvester {
    let db = Database::open(":memory:").await.unwrap();
    Harvester::new(db, &test_config()).unwrap()
}

fn rss(items: &[(&str, &str, Option<&str>)]) -> String {
    let items: String = items
        .iter()
        .map(|(title, link, desc)| match desc {
            Some(d) => format!(
                "<item><title>{}</title><link>{}</link><description>{}</description></item>",
                title, link, d
            ),
            None => format!("<item><title>{}</title><link>{}</link></item>", title, link),
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Feed</title>
<link>https://example.com</link>{}</channel></rss>"#,
        items
    )
}

fn feed_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_raw(body, "application/rss+xml")
}

async fn add_feed(db: &Database, website_id: i64, url: String) -> i64 {
    db.get_or_create_feed(
        website_id,
        &NewFeed {
            feed_url: url,
            feed_type: FeedType::Rss,
            ..NewFeed::default()
        },
    )
    .await
    .unwrap()
    .0
    .id
}

// ============================================================================
// Cross-posting
// ============================================================================

#[tokio::test]
async fn test_shared_url_creates_one_article_with_one_edge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tv.xml"))
        .respond_with(feed_response(rss(&[
            ("Shared story", "https://example.com/shared", Some("same everywhere")),
            ("TV only", "https://example.com/tv-only", Some("tv")),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/film.xml"))
        .respond_with(feed_response(rss(&[
            ("Shared story", "https://example.com/shared", Some("same everywhere")),
            ("Film only", "https://example.com/film-only", Some("film")),
        ])))
        .mount(&server)
        .await;

    let harvester = test_harvester().await;
    let db = harvester.database().clone();
    let (site, _) = db
        .get_or_create_website("https://example.com", "Example")
        .await
        .unwrap();
    let tv = add_feed(&db, site.id, format!("{}/tv.xml", server.uri())).await;
    let film = add_feed(&db, site.id, format!("{}/film.xml", server.uri())).await;

    assert_eq!(
        harvester.fetch_feed_content(tv).await,
        "Fetched 2 new and 0 updated articles"
    );
    assert_eq!(
        harvester.fetch_feed_content(film).await,
        "Fetched 1 new and 0 updated articles"
    );
    // Polling again changes nothing, including the edge set
    harvester.fetch_feed_content(film).await;
    harvester.fetch_feed_content(tv).await;

    let shared = db
        .get_article_by_url("https://example.com/shared")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shared.feed_id, tv);
    assert_eq!(db.get_additional_feed_ids(shared.id).await.unwrap(), vec![film]);
    assert_eq!(db.count_articles_for_feed(tv).await.unwrap(), 2);
    assert_eq!(db.count_articles_for_feed(film).await.unwrap(), 1);
}

// ============================================================================
// Change detection
// ============================================================================

#[tokio::test]
async fn test_changed_entry_is_updated_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(feed_response(rss(&[(
            "Story",
            "https://example.com/story",
            Some("first draft"),
        )])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(feed_response(rss(&[(
            "Story",
            "https://example.com/story",
            Some("corrected text"),
        )])))
        .mount(&server)
        .await;

    let harvester = test_harvester().await;
    let db = harvester.database().clone();
    let (site, _) = db
        .get_or_create_website("https://example.com", "Example")
        .await
        .unwrap();
    let feed = add_feed(&db, site.id, format!("{}/feed.xml", server.uri())).await;

    assert_eq!(
        harvester.fetch_feed_content(feed).await,
        "Fetched 1 new and 0 updated articles"
    );
    let before = db
        .get_article_by_url("https://example.com/story")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        harvester.fetch_feed_content(feed).await,
        "Fetched 0 new and 1 updated articles"
    );
    assert_eq!(
        harvester.fetch_feed_content(feed).await,
        "Fetched 0 new and 0 updated articles"
    );

    let after = db
        .get_article_by_url("https://example.com/story")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.content.as_deref(), Some("corrected text"));
    assert_ne!(after.content_hash, before.content_hash);

    let logs = db.get_fetch_logs_for_feed(feed).await.unwrap();
    let updated: Vec<i64> = logs.iter().map(|l| l.updated_articles).collect();
    assert_eq!(updated, vec![0, 1, 0]);
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn test_backfilled_content_survives_next_poll() {
    let server = MockServer::start().await;
    let page_url = format!("{}/posts/quiet-entry", server.uri());
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(feed_response(rss(&[("Quiet entry", &page_url, None)])))
        .mount(&server)
        .await;
    let paragraph = "A full paragraph of article text that easily clears every threshold. ";
    let html = format!(
        "<html><body><header>Site</header><article><h2>Heading</h2><p>{p}{p}</p><p>{p}{p}</p></article><footer>(c)</footer></body></html>",
        p = paragraph
    );
    Mock::given(method("GET"))
        .and(path("/posts/quiet-entry"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(html, "text/html"),
        )
        .mount(&server)
        .await;

    let harvester = test_harvester().await;
    let db = harvester.database().clone();
    let (site, _) = db
        .get_or_create_website("https://example.com", "Example")
        .await
        .unwrap();
    let feed = add_feed(&db, site.id, format!("{}/feed.xml", server.uri())).await;

    harvester.fetch_feed_content(feed).await;
    let article = db.get_article_by_url(&page_url).await.unwrap().unwrap();
    assert!(!article.has_content());

    assert_eq!(
        harvester.fetch_article_full_content(article.id).await,
        "Content fetched successfully"
    );
    assert_eq!(
        harvester.fetch_article_full_content(article.id).await,
        "Article already has content"
    );

    assert_eq!(
        harvester.fetch_feed_content(feed).await,
        "Fetched 0 new and 0 updated articles"
    );
    let article = db.get_article(article.id).await.unwrap().unwrap();
    let content = article.content.unwrap();
    assert!(content.contains("clears every threshold"));
    assert!(!content.contains("(c)"));
    // The feed title is kept; only slug-derived titles are humanized
    assert_eq!(article.title, "Quiet entry");
}

#[tokio::test]
async fn test_backfill_batch_prefers_sitemap_stubs() {
    let server = MockServer::start().await;
    let body = format!(
        r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
<url><loc>{0}/guides/getting-started</loc></url>
<url><loc>{0}/guides/missing-page</loc></url></urlset>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body, "application/xml"),
        )
        .mount(&server)
        .await;
    let text = "Getting started means reading this long and helpful paragraph first. ";
    let html = format!(
        "<html><body><main><p>{t}{t}</p><p>{t}{t}</p></main></body></html>",
        t = text
    );
    Mock::given(method("GET"))
        .and(path("/guides/getting-started"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html"))
        .mount(&server)
        .await;

    let harvester = test_harvester().await;
    let db = harvester.database().clone();
    let (site, _) = db
        .get_or_create_website(&server.uri(), "Docs")
        .await
        .unwrap();
    let (sitemap, _) = db
        .get_or_create_feed(
            site.id,
            &NewFeed {
                feed_url: format!("{}/sitemap.xml", server.uri()),
                feed_type: FeedType::Sitemap,
                ..NewFeed::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        harvester.fetch_feed_content(sitemap.id).await,
        "Found 2 URLs in sitemap, created 2 new articles"
    );

    let summary = harvester
        .backfill_missing_content(10, Some("Docs"))
        .await
        .unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let guide = db
        .get_article_by_url(&format!("{}/guides/getting-started", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guide.title, "Getting Started");
    assert!(guide.has_content());

    let remaining = db.get_articles_missing_content(10, None).await.unwrap();
    assert_eq!(remaining.len(), 1);
}
