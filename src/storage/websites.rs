use anyhow::Result;

use super::schema::Database;
use super::types::{Website, WebsiteRow};

impl Database {
    // ========================================================================
    // Website Operations
    // ========================================================================

    /// Returns the website with this URL, creating it when missing.
    ///
    /// The boolean is true when a new row was inserted.
    pub async fn get_or_create_website(&self, url: &str, name: &str) -> Result<(Website, bool)> {
        let now = chrono::Utc::now().timestamp();
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO websites (url, name, active, created_at) VALUES (?, ?, 1, ?)
             ON CONFLICT(url) DO NOTHING RETURNING id",
        )
        .bind(url)
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let website = self
            .get_website_by_url(url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Website {} vanished after insert", url))?;

        Ok((website, inserted.is_some()))
    }

    pub async fn get_website(&self, website_id: i64) -> Result<Option<Website>> {
        let row = sqlx::query_as::<_, WebsiteRow>(
            "SELECT id, url, name, active, created_at FROM websites WHERE id = ?",
        )
        .bind(website_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(WebsiteRow::into_website))
    }

    pub async fn get_website_by_url(&self, url: &str) -> Result<Option<Website>> {
        let row = sqlx::query_as::<_, WebsiteRow>(
            "SELECT id, url, name, active, created_at FROM websites WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(WebsiteRow::into_website))
    }

    /// Active websites, oldest first.
    pub async fn get_active_websites(&self) -> Result<Vec<Website>> {
        let rows = sqlx::query_as::<_, WebsiteRow>(
            "SELECT id, url, name, active, created_at FROM websites WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WebsiteRow::into_website).collect())
    }

    /// Websites whose name or URL contains `filter` (case-insensitive).
    pub async fn find_websites(&self, filter: &str) -> Result<Vec<Website>> {
        let pattern = format!("%{}%", filter);
        let rows = sqlx::query_as::<_, WebsiteRow>(
            r#"
            SELECT id, url, name, active, created_at FROM websites
            WHERE name LIKE ? OR url LIKE ?
            ORDER BY id
        "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WebsiteRow::into_website).collect())
    }

    pub async fn set_website_active(&self, website_id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE websites SET active = ? WHERE id = ?")
            .bind(active)
            .bind(website_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    #[tokio::test]
    async fn test_get_or_create_website_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();

        let (first, created) = db
            .get_or_create_website("https://example.com", "Example")
            .await
            .unwrap();
        assert!(created);
        assert!(first.active);

        let (second, created) = db
            .get_or_create_website("https://example.com", "Other Name")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Example");
    }

    #[tokio::test]
    async fn test_active_websites_excludes_inactive() {
        let db = Database::open(":memory:").await.unwrap();
        let (a, _) = db.get_or_create_website("https://a.com", "A").await.unwrap();
        let (b, _) = db.get_or_create_website("https://b.com", "B").await.unwrap();
        db.set_website_active(a.id, false).await.unwrap();

        let active = db.get_active_websites().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
    }

    #[tokio::test]
    async fn test_find_websites_matches_name_or_url() {
        let db = Database::open(":memory:").await.unwrap();
        db.get_or_create_website("https://news.example.com", "Daily News")
            .await
            .unwrap();
        db.get_or_create_website("https://blog.other.org", "Other Blog")
            .await
            .unwrap();

        assert_eq!(db.find_websites("daily").await.unwrap().len(), 1);
        assert_eq!(db.find_websites("other.org").await.unwrap().len(), 1);
        assert_eq!(db.find_websites("missing").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_website() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.get_website(42).await.unwrap().is_none());
    }
}
