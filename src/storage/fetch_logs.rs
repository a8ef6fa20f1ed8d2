use anyhow::Result;

use super::schema::Database;
use super::types::{FetchLog, FetchLogRow, FetchOutcome};

impl Database {
    // ========================================================================
    // Fetch Log Operations
    // ========================================================================

    /// Opens an audit record for a fetch attempt starting now.
    pub async fn open_fetch_log(&self, feed_id: i64) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO fetch_logs (feed_id, started_at) VALUES (?, ?) RETURNING id")
                .bind(feed_id)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    /// Closes an open log with its final counters.
    ///
    /// A log that is already closed is left untouched; returns false in that case.
    pub async fn close_fetch_log(&self, log_id: i64, outcome: &FetchOutcome) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE fetch_logs
            SET completed_at = ?, success = ?, new_articles = ?,
                updated_articles = ?, error_message = ?
            WHERE id = ? AND completed_at IS NULL
        "#,
        )
        .bind(now)
        .bind(outcome.success)
        .bind(outcome.new_articles)
        .bind(outcome.updated_articles)
        .bind(&outcome.error_message)
        .bind(log_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_fetch_log(&self, log_id: i64) -> Result<Option<FetchLog>> {
        let row = sqlx::query_as::<_, FetchLogRow>(
            r#"
            SELECT id, feed_id, started_at, completed_at, success, new_articles,
                   updated_articles, error_message
            FROM fetch_logs
            WHERE id = ?
        "#,
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FetchLogRow::into_fetch_log))
    }

    /// Logs for a feed, most recent first.
    pub async fn get_fetch_logs_for_feed(&self, feed_id: i64) -> Result<Vec<FetchLog>> {
        let rows = sqlx::query_as::<_, FetchLogRow>(
            r#"
            SELECT id, feed_id, started_at, completed_at, success, new_articles,
                   updated_articles, error_message
            FROM fetch_logs
            WHERE feed_id = ?
            ORDER BY started_at DESC, id DESC
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FetchLogRow::into_fetch_log).collect())
    }

    /// Number of logs that were opened but never closed.
    pub async fn count_open_fetch_logs(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fetch_logs WHERE completed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Deletes logs started before `cutoff` (unix seconds). Returns the count.
    pub async fn delete_fetch_logs_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fetch_logs WHERE started_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
