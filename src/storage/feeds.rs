use anyhow::Result;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FeedHealth, NewFeed};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Returns the feed with `feed.feed_url`, creating it under `website_id`
    /// when missing. The boolean is true when a new row was inserted.
    ///
    /// An existing feed keeps its website, type and metadata.
    pub async fn get_or_create_feed(&self, website_id: i64, feed: &NewFeed) -> Result<(Feed, bool)> {
        let now = chrono::Utc::now().timestamp();
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO feeds (website_id, feed_url, feed_type, title, description, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_url) DO NOTHING RETURNING id
        "#,
        )
        .bind(website_id)
        .bind(&feed.feed_url)
        .bind(feed.feed_type.as_str())
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let stored = self
            .get_feed_by_url(&feed.feed_url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Feed {} vanished after insert", feed.feed_url))?;

        Ok((stored, inserted.is_some()))
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT id, website_id, feed_url, feed_type, title, description, last_checked,
                   last_successful_fetch, active, error_count, last_error, created_at
            FROM feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    pub async fn get_feed_by_url(&self, feed_url: &str) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT id, website_id, feed_url, feed_type, title, description, last_checked,
                   last_successful_fetch, active, error_count, last_error, created_at
            FROM feeds
            WHERE feed_url = ?
        "#,
        )
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    pub async fn get_feeds_for_website(&self, website_id: i64) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT id, website_id, feed_url, feed_type, title, description, last_checked,
                   last_successful_fetch, active, error_count, last_error, created_at
            FROM feeds
            WHERE website_id = ?
            ORDER BY id
        "#,
        )
        .bind(website_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// IDs of active feeds, optionally restricted to websites whose name or
    /// URL contains `website_filter`.
    pub async fn get_active_feed_ids(&self, website_filter: Option<&str>) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = match website_filter {
            Some(filter) => {
                let pattern = format!("%{}%", filter);
                sqlx::query_as(
                    r#"
                    SELECT f.id FROM feeds f
                    JOIN websites w ON w.id = f.website_id
                    WHERE f.active = 1 AND (w.name LIKE ? OR w.url LIKE ?)
                    ORDER BY f.id
                "#,
                )
                .bind(&pattern)
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT id FROM feeds WHERE active = 1 ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Fills in title/description from the feed document. Existing values
    /// are only replaced by non-empty ones.
    pub async fn update_feed_metadata(
        &self,
        feed_id: i64,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        sqlx::query(
            r#"
            UPDATE feeds
            SET title = COALESCE(?, title),
                description = COALESCE(?, description)
            WHERE id = ?
        "#,
        )
        .bind(title)
        .bind(description)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the title only when the feed has none. Returns true if it changed.
    pub async fn set_feed_title_if_missing(&self, feed_id: i64, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feeds SET title = ? WHERE id = ? AND (title IS NULL OR title = '')",
        )
        .bind(title)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_feed_active(&self, feed_id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET active = ? WHERE id = ?")
            .bind(active)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Circuit Breaker Operations
    // ========================================================================

    /// Default number of consecutive failures after which a feed is deactivated
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    /// Records the outcome of a poll in one atomic UPDATE.
    ///
    /// - `Ok`: stamps `last_checked` and `last_successful_fetch`, resets
    ///   `error_count` to 0 and clears `last_error`. `active` is untouched,
    ///   so a tripped feed is never reactivated here.
    /// - `Err(msg)`: stamps `last_checked`, increments `error_count`, stores
    ///   `msg`, and deactivates the feed once the count reaches `threshold`.
    pub async fn mark_feed_checked(
        &self,
        feed_id: i64,
        outcome: Result<(), &str>,
        threshold: i64,
    ) -> Result<FeedHealth, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let (error_count, active): (i64, bool) = match outcome {
            Ok(()) => {
                sqlx::query_as(
                    r#"
                    UPDATE feeds
                    SET last_checked = ?, last_successful_fetch = ?,
                        error_count = 0, last_error = NULL
                    WHERE id = ?
                    RETURNING error_count, active
                "#,
                )
                .bind(now)
                .bind(now)
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?
            }
            Err(message) => {
                // SET expressions all see the pre-update row
                sqlx::query_as(
                    r#"
                    UPDATE feeds
                    SET last_checked = ?,
                        error_count = error_count + 1,
                        last_error = ?,
                        active = CASE WHEN error_count + 1 >= ? THEN 0 ELSE active END
                    WHERE id = ?
                    RETURNING error_count, active
                "#,
                )
                .bind(now)
                .bind(message)
                .bind(threshold)
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(FeedHealth {
            error_count,
            active,
        })
    }
}
