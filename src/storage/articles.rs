use anyhow::Result;

use super::schema::Database;
use super::types::{Article, ArticleDbRow, FeedArticleCount, ParsedArticle, Reconciliation};
use crate::feed::content_hash;

/// Maximum number of articles returned by a single backfill query
const MAX_BACKFILL_BATCH: i64 = 1000;

impl Database {
    // ========================================================================
    // Article Reconciliation
    // ========================================================================

    /// Reconciles one parsed article against the store, keyed by URL.
    ///
    /// Runs in a single transaction whose first statement is the insert, so
    /// the write lock is taken before anything is read and two pollers
    /// carrying the same URL cannot both create it.
    ///
    /// - URL unknown: insert, owned by `feed_id`.
    /// - URL owned by `feed_id`: rewrite content fields when the feed's
    ///   payload hash changed.
    /// - URL owned by another feed: record `feed_id` as an additional feed
    ///   (idempotent). Content stays with the owning feed.
    ///
    /// Change detection compares against the hash of what the feed last
    /// delivered (`source_hash`), so content backfilled from the article page
    /// is not overwritten by the feed's shorter summary on the next poll.
    pub async fn reconcile_article(
        &self,
        feed_id: i64,
        article: &ParsedArticle,
    ) -> Result<Reconciliation> {
        let now = chrono::Utc::now().timestamp();
        let tags = serde_json::to_string(&article.tags)?;
        let raw_data = article.raw_data.as_ref().map(|v| v.to_string());

        let mut tx = self.pool.begin().await?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO articles (feed_id, url, title, content, summary, author, published_date,
                                  fetched_at, updated_at, content_hash, source_hash, raw_data, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING RETURNING id
        "#,
        )
        .bind(feed_id)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.summary)
        .bind(&article.author)
        .bind(article.published_date)
        .bind(now)
        .bind(now)
        .bind(&article.content_hash)
        .bind(&article.content_hash)
        .bind(&raw_data)
        .bind(&tags)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id,)) = inserted {
            tx.commit().await?;
            return Ok(Reconciliation::Created(id));
        }

        let (id, owner_feed_id, source_hash): (i64, i64, String) =
            sqlx::query_as("SELECT id, feed_id, source_hash FROM articles WHERE url = ?")
                .bind(&article.url)
                .fetch_one(&mut *tx)
                .await?;

        let outcome = if owner_feed_id != feed_id {
            let result =
                sqlx::query("INSERT OR IGNORE INTO article_feeds (article_id, feed_id) VALUES (?, ?)")
                    .bind(id)
                    .bind(feed_id)
                    .execute(&mut *tx)
                    .await?;
            Reconciliation::CrossPosted {
                article_id: id,
                edge_added: result.rows_affected() > 0,
            }
        } else if source_hash == article.content_hash {
            Reconciliation::Unchanged(id)
        } else {
            sqlx::query(
                r#"
                UPDATE articles
                SET title = ?, content = ?, summary = ?,
                    author = COALESCE(?, author),
                    published_date = COALESCE(?, published_date),
                    updated_at = ?, content_hash = ?, source_hash = ?,
                    raw_data = ?, tags = ?
                WHERE id = ?
            "#,
            )
            .bind(&article.title)
            .bind(&article.content)
            .bind(&article.summary)
            .bind(&article.author)
            .bind(article.published_date)
            .bind(now)
            .bind(&article.content_hash)
            .bind(&article.content_hash)
            .bind(&raw_data)
            .bind(&tags)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            Reconciliation::Updated(id)
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Creates a content-less stub for a sitemap URL.
    ///
    /// Returns `None` without touching anything when the URL already exists
    /// (whichever feed owns it).
    pub async fn create_stub_article(
        &self,
        feed_id: i64,
        url: &str,
        title: &str,
        summary: &str,
        published_date: Option<i64>,
    ) -> Result<Option<i64>> {
        let now = chrono::Utc::now().timestamp();
        let hash = content_hash(title, None, Some(summary));
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO articles (feed_id, url, title, summary, published_date,
                                  fetched_at, updated_at, content_hash, source_hash, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '[]')
            ON CONFLICT(url) DO NOTHING RETURNING id
        "#,
        )
        .bind(feed_id)
        .bind(url)
        .bind(title)
        .bind(summary)
        .bind(published_date)
        .bind(now)
        .bind(now)
        .bind(&hash)
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.map(|(id,)| id))
    }

    /// Stores backfilled body text, optionally replacing the title, and
    /// recomputes the content hash over the resulting fields.
    pub async fn set_article_content(
        &self,
        article_id: i64,
        content: &str,
        title: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let (current_title, summary): (String, Option<String>) =
            sqlx::query_as("SELECT title, summary FROM articles WHERE id = ?")
                .bind(article_id)
                .fetch_one(&mut *tx)
                .await?;

        let title = title.unwrap_or(&current_title);
        let hash = content_hash(title, Some(content), summary.as_deref());

        sqlx::query(
            "UPDATE articles SET title = ?, content = ?, content_hash = ?, updated_at = ? WHERE id = ?",
        )
        .bind(title)
        .bind(content)
        .bind(&hash)
        .bind(now)
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleDbRow>(
            r#"
            SELECT id, feed_id, url, title, content, summary, author, published_date,
                   fetched_at, updated_at, content_hash, raw_data, tags
            FROM articles
            WHERE id = ?
        "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ArticleDbRow::into_article))
    }

    pub async fn get_article_by_url(&self, url: &str) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleDbRow>(
            r#"
            SELECT id, feed_id, url, title, content, summary, author, published_date,
                   fetched_at, updated_at, content_hash, raw_data, tags
            FROM articles
            WHERE url = ?
        "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Feeds (other than the owner) the article has also appeared in.
    pub async fn get_additional_feed_ids(&self, article_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT feed_id FROM article_feeds WHERE article_id = ? ORDER BY feed_id",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Number of articles owned by `feed_id`.
    pub async fn count_articles_for_feed(&self, feed_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Articles without body text, sitemap stubs first, newest first within
    /// each group. `website_filter` matches website name or URL.
    pub async fn get_articles_missing_content(
        &self,
        limit: i64,
        website_filter: Option<&str>,
    ) -> Result<Vec<Article>> {
        let limit = limit.clamp(0, MAX_BACKFILL_BATCH);
        let pattern = website_filter.map(|f| format!("%{}%", f));
        let rows = sqlx::query_as::<_, ArticleDbRow>(
            r#"
            SELECT a.id, a.feed_id, a.url, a.title, a.content, a.summary, a.author,
                   a.published_date, a.fetched_at, a.updated_at, a.content_hash,
                   a.raw_data, a.tags
            FROM articles a
            JOIN feeds f ON f.id = a.feed_id
            JOIN websites w ON w.id = f.website_id
            WHERE (a.content IS NULL OR TRIM(a.content) = '')
              AND (?1 IS NULL OR w.name LIKE ?1 OR w.url LIKE ?1)
            ORDER BY CASE WHEN f.feed_type = 'SITEMAP' THEN 0 ELSE 1 END,
                     a.fetched_at DESC, a.id DESC
            LIMIT ?2
        "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Per-feed counts of articles first fetched at or after `since`.
    /// Feeds with no new articles are omitted.
    pub async fn recent_article_counts(
        &self,
        since: i64,
        website_filter: Option<&str>,
    ) -> Result<Vec<FeedArticleCount>> {
        let pattern = website_filter.map(|f| format!("%{}%", f));
        let rows: Vec<(i64, String, Option<String>, String, i64)> = sqlx::query_as(
            r#"
            SELECT f.id, f.feed_url, f.title, w.name, COUNT(a.id) AS new_count
            FROM feeds f
            JOIN websites w ON w.id = f.website_id
            JOIN articles a ON a.feed_id = f.id
            WHERE a.fetched_at >= ?1
              AND (?2 IS NULL OR w.name LIKE ?2 OR w.url LIKE ?2)
            GROUP BY f.id
            ORDER BY new_count DESC, f.id
        "#,
        )
        .bind(since)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(feed_id, feed_url, feed_title, website_name, count)| FeedArticleCount {
                feed_id,
                feed_url,
                feed_title,
                website_name,
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::content_hash;
    use crate::storage::{Database, FeedType, NewFeed, ParsedArticle, Reconciliation};
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let (website, _) = db
            .get_or_create_website("https://example.com", "Example")
            .await
            .unwrap();
        let (a, _) = db
            .get_or_create_feed(website.id, &feed("https://example.com/rss", FeedType::Rss))
            .await
            .unwrap();
        let (b, _) = db
            .get_or_create_feed(website.id, &feed("https://example.com/atom", FeedType::Atom))
            .await
            .unwrap();
        (db, a.id, b.id)
    }

    fn feed(url: &str, feed_type: FeedType) -> NewFeed {
        NewFeed {
            feed_url: url.to_string(),
            feed_type,
            title: None,
            description: None,
        }
    }

    fn parsed(url: &str, title: &str, content: &str) -> ParsedArticle {
        ParsedArticle {
            url: url.to_string(),
            title: title.to_string(),
            content: Some(content.to_string()),
            summary: Some("summary".to_string()),
            author: Some("Ann Author".to_string()),
            published_date: Some(1_704_067_200),
            tags: vec!["rust".to_string()],
            content_hash: content_hash(title, Some(content), Some("summary")),
            raw_data: Some(serde_json::json!({"id": url})),
        }
    }

    #[tokio::test]
    async fn test_reconcile_creates_then_unchanged() {
        let (db, feed_a, _) = setup().await;
        let article = parsed("https://example.com/p/1", "Title", "Body");

        let first = db.reconcile_article(feed_a, &article).await.unwrap();
        assert!(matches!(first, Reconciliation::Created(_)));

        let second = db.reconcile_article(feed_a, &article).await.unwrap();
        assert_eq!(second, Reconciliation::Unchanged(first.article_id()));

        let stored = db.get_article(first.article_id()).await.unwrap().unwrap();
        assert_eq!(stored.tags, vec!["rust".to_string()]);
        assert_eq!(stored.content_hash, article.content_hash);
    }

    #[tokio::test]
    async fn test_reconcile_updates_changed_content() {
        let (db, feed_a, _) = setup().await;
        let created = db
            .reconcile_article(feed_a, &parsed("https://example.com/p/1", "Title", "Body"))
            .await
            .unwrap();

        let changed = parsed("https://example.com/p/1", "Title v2", "Body v2");
        let outcome = db.reconcile_article(feed_a, &changed).await.unwrap();
        assert_eq!(outcome, Reconciliation::Updated(created.article_id()));

        let stored = db.get_article(created.article_id()).await.unwrap().unwrap();
        assert_eq!(stored.title, "Title v2");
        assert_eq!(stored.content.as_deref(), Some("Body v2"));
        assert_eq!(stored.content_hash, changed.content_hash);
    }

    #[tokio::test]
    async fn test_cross_posted_article_adds_single_edge() {
        let (db, feed_a, feed_b) = setup().await;
        let article = parsed("https://example.com/shared", "Shared", "Body");

        let created = db.reconcile_article(feed_a, &article).await.unwrap();
        let id = created.article_id();

        let first = db.reconcile_article(feed_b, &article).await.unwrap();
        assert_eq!(
            first,
            Reconciliation::CrossPosted {
                article_id: id,
                edge_added: true
            }
        );
        let again = db.reconcile_article(feed_b, &article).await.unwrap();
        assert_eq!(
            again,
            Reconciliation::CrossPosted {
                article_id: id,
                edge_added: false
            }
        );

        assert_eq!(db.get_additional_feed_ids(id).await.unwrap(), vec![feed_b]);
        assert_eq!(db.count_articles_for_feed(feed_a).await.unwrap(), 1);
        assert_eq!(db.count_articles_for_feed(feed_b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cross_posted_with_different_content_keeps_owner_content() {
        let (db, feed_a, feed_b) = setup().await;
        let created = db
            .reconcile_article(feed_a, &parsed("https://example.com/shared", "Original", "A"))
            .await
            .unwrap();
        db.reconcile_article(feed_b, &parsed("https://example.com/shared", "Other", "B"))
            .await
            .unwrap();

        let stored = db.get_article(created.article_id()).await.unwrap().unwrap();
        assert_eq!(stored.title, "Original");
        assert_eq!(stored.feed_id, feed_a);
    }

    #[tokio::test]
    async fn test_backfilled_content_survives_unchanged_poll() {
        let (db, feed_a, _) = setup().await;
        let article = parsed("https://example.com/p/1", "Title", "Short teaser");
        let id = db.reconcile_article(feed_a, &article).await.unwrap().article_id();

        db.set_article_content(id, "Full body text", None).await.unwrap();
        let outcome = db.reconcile_article(feed_a, &article).await.unwrap();
        assert_eq!(outcome, Reconciliation::Unchanged(id));

        let stored = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("Full body text"));
        assert_eq!(
            stored.content_hash,
            content_hash("Title", Some("Full body text"), Some("summary"))
        );
    }

    #[tokio::test]
    async fn test_create_stub_skips_existing_url() {
        let (db, feed_a, feed_b) = setup().await;
        let first = db
            .create_stub_article(feed_a, "https://example.com/x", "x", "stub", None)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = db
            .create_stub_article(feed_b, "https://example.com/x", "x", "stub", None)
            .await
            .unwrap();
        assert!(second.is_none());

        let stub = db.get_article_by_url("https://example.com/x").await.unwrap().unwrap();
        assert!(!stub.has_content());
        assert!(stub.published_date.is_none());
        assert_eq!(stub.content_hash, content_hash("x", None, Some("stub")));
    }

    #[tokio::test]
    async fn test_set_article_content_recomputes_hash_and_title() {
        let (db, feed_a, _) = setup().await;
        let id = db
            .create_stub_article(feed_a, "https://example.com/my-post", "my-post", "stub", None)
            .await
            .unwrap()
            .unwrap();

        db.set_article_content(id, "Body", Some("My Post")).await.unwrap();

        let stored = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "My Post");
        assert_eq!(stored.content_hash, content_hash("My Post", Some("Body"), Some("stub")));
        assert!(stored.updated_at >= stored.fetched_at);
    }

    #[tokio::test]
    async fn test_missing_content_orders_sitemap_first() {
        let db = Database::open(":memory:").await.unwrap();
        let (site, _) = db
            .get_or_create_website("https://example.com", "Example")
            .await
            .unwrap();
        let (rss, _) = db
            .get_or_create_feed(site.id, &feed("https://example.com/rss", FeedType::Rss))
            .await
            .unwrap();
        let (sitemap, _) = db
            .get_or_create_feed(site.id, &feed("https://example.com/sitemap.xml", FeedType::Sitemap))
            .await
            .unwrap();

        let mut no_body = parsed("https://example.com/rss-item", "RSS item", "");
        no_body.content = None;
        db.reconcile_article(rss.id, &no_body).await.unwrap();
        db.reconcile_article(rss.id, &parsed("https://example.com/full", "Full", "Body"))
            .await
            .unwrap();
        db.create_stub_article(sitemap.id, "https://example.com/stub", "stub", "s", None)
            .await
            .unwrap();

        let missing = db.get_articles_missing_content(10, None).await.unwrap();
        let urls: Vec<_> = missing.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/stub", "https://example.com/rss-item"]);

        let filtered = db
            .get_articles_missing_content(10, Some("nomatch"))
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_recent_article_counts() {
        let (db, feed_a, feed_b) = setup().await;
        db.reconcile_article(feed_a, &parsed("https://example.com/1", "1", "a"))
            .await
            .unwrap();
        db.reconcile_article(feed_a, &parsed("https://example.com/2", "2", "b"))
            .await
            .unwrap();
        db.reconcile_article(feed_b, &parsed("https://example.com/3", "3", "c"))
            .await
            .unwrap();

        let counts = db.recent_article_counts(0, None).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].feed_id, feed_a);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].website_name, "Example");

        let future = chrono::Utc::now().timestamp() + 3600;
        assert!(db.recent_article_counts(future, None).await.unwrap().is_empty());
    }
}
