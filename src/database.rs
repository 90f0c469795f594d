use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{AppError, AppResult};
use crate::models::{
    post_id_from_raw, post_id_to_raw, MediaId, MediaItem, MediaUploadState, Post, PostId,
};
use crate::store::{MediaStore, PostStore};

/// SQLite-backed persistence for posts and media.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database in the user data directory.
    pub async fn open_default() -> AppResult<Self> {
        let db_path = default_database_path()?;
        log::info!("Database path: {}", db_path.display());
        Self::open(&format!("sqlite:{}", db_path.display())).await
    }

    pub async fn open(database_url: &str) -> AppResult<Self> {
        log::info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory database.
    pub async fn in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                content TEXT NOT NULL,
                is_local_draft BOOLEAN NOT NULL DEFAULT TRUE,
                is_locally_changed BOOLEAN NOT NULL DEFAULT FALSE,
                last_modified TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id INTEGER PRIMARY KEY,
                local_post_id INTEGER NOT NULL DEFAULT 0,
                source_uri TEXT NOT NULL,
                remote_url TEXT,
                upload_state TEXT NOT NULL DEFAULT 'QUEUED',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_post ON media(local_post_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_state ON media(upload_state)")
            .execute(&self.pool)
            .await?;

        log::info!("Database schema ready");
        Ok(())
    }

    /// Media that were queued or mid-transfer when the process last stopped.
    pub async fn unfinished_media(&self) -> AppResult<Vec<MediaItem>> {
        let rows = sqlx::query(
            "SELECT id, local_post_id, source_uri, remote_url, upload_state FROM media \
             WHERE upload_state IN ('QUEUED', 'UPLOADING') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(media_from_row).collect()
    }

    pub async fn posts_with_local_changes(&self) -> AppResult<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT id, content, is_local_draft, is_locally_changed, last_modified FROM posts \
             WHERE is_locally_changed = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(post_from_row).collect()
    }
}

fn default_database_path() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::Config("Could not find data directory".to_string()))?
        .join("Post Upload Service");

    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir.join("uploads.db"))
}

fn post_from_row(row: &SqliteRow) -> AppResult<Post> {
    Ok(Post {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        is_local_draft: row.try_get("is_local_draft")?,
        is_locally_changed: row.try_get("is_locally_changed")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn media_from_row(row: &SqliteRow) -> AppResult<MediaItem> {
    let state_text: String = row.try_get("upload_state")?;
    let upload_state = MediaUploadState::from_str(&state_text).map_err(|e| {
        AppError::Database(sqlx::Error::Decode(
            format!("media.upload_state: {}", e).into(),
        ))
    })?;

    Ok(MediaItem {
        id: row.try_get("id")?,
        local_post_id: post_id_from_raw(row.try_get("local_post_id")?),
        source_uri: row.try_get("source_uri")?,
        remote_url: row.try_get("remote_url")?,
        upload_state,
    })
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn get_post(&self, id: PostId) -> AppResult<Option<Post>> {
        let row = sqlx::query(
            "SELECT id, content, is_local_draft, is_locally_changed, last_modified FROM posts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn update_post(&self, post: &Post) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, content, is_local_draft, is_locally_changed, last_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                is_local_draft = excluded.is_local_draft,
                is_locally_changed = excluded.is_locally_changed,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(post.id)
        .bind(&post.content)
        .bind(post.is_local_draft)
        .bind(post.is_locally_changed)
        .bind(post.last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_post(
        &self,
        post: &Post,
        expected_last_modified: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET content = ?, is_local_draft = ?, is_locally_changed = ?, last_modified = ?
            WHERE id = ? AND last_modified = ?
            "#,
        )
        .bind(&post.content)
        .bind(post.is_local_draft)
        .bind(post.is_locally_changed)
        .bind(post.last_modified)
        .bind(post.id)
        .bind(expected_last_modified)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_post(post.id).await? {
            Some(stored) => Err(AppError::rewrite_conflict(
                post.id,
                format!(
                    "stored copy modified at {} (expected {})",
                    stored.last_modified, expected_last_modified
                ),
            )),
            None => Err(AppError::not_found(format!("post {}", post.id))),
        }
    }
}

#[async_trait]
impl MediaStore for SqliteStore {
    async fn get_media(&self, id: MediaId) -> AppResult<Option<MediaItem>> {
        let row = sqlx::query(
            "SELECT id, local_post_id, source_uri, remote_url, upload_state FROM media WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(media_from_row).transpose()
    }

    async fn update_media(&self, media: &MediaItem) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO media (id, local_post_id, source_uri, remote_url, upload_state)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                local_post_id = excluded.local_post_id,
                source_uri = excluded.source_uri,
                remote_url = excluded.remote_url,
                upload_state = excluded.upload_state,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(media.id)
        .bind(post_id_to_raw(media.local_post_id))
        .bind(&media.source_uri)
        .bind(&media.remote_url)
        .bind(media.upload_state.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn media_for_post(&self, post_id: PostId) -> AppResult<Vec<MediaItem>> {
        let rows = sqlx::query(
            "SELECT id, local_post_id, source_uri, remote_url, upload_state FROM media \
             WHERE local_post_id = ? ORDER BY id",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(media_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_round_trip_and_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        let post = Post::new(3, "<p>hello</p>");
        store.update_post(&post).await.unwrap();

        let loaded = store.get_post(3).await.unwrap().unwrap();
        assert_eq!(loaded, post);

        let mut merged = loaded.clone();
        merged.content = "<p>merged</p>".to_string();
        merged.mark_content_changed();
        store.replace_post(&merged, loaded.last_modified).await.unwrap();

        // Second writer still holds the old timestamp.
        let mut stale = loaded.clone();
        stale.content = "<p>stale</p>".to_string();
        let result = store.replace_post(&stale, loaded.last_modified).await;
        assert!(matches!(result, Err(AppError::RewriteConflict { post_id: 3, .. })));

        let stored = store.get_post(3).await.unwrap().unwrap();
        assert_eq!(stored.content, "<p>merged</p>");
    }

    #[tokio::test]
    async fn test_unfinished_media_reconstruction() {
        let store = SqliteStore::in_memory().await.unwrap();

        let queued = MediaItem::new(1, Some(10), "a.png");
        let mut uploading = MediaItem::new(2, Some(10), "b.png");
        uploading.upload_state = MediaUploadState::Uploading;
        let mut done = MediaItem::new(3, None, "c.png");
        done.upload_state = MediaUploadState::Completed;
        done.remote_url = Some("https://cdn.example.com/c.png".to_string());

        for item in [&queued, &uploading, &done] {
            store.update_media(item).await.unwrap();
        }

        let unfinished = store.unfinished_media().await.unwrap();
        assert_eq!(unfinished, vec![queued, uploading]);

        let loaded = store.get_media(3).await.unwrap().unwrap();
        assert_eq!(loaded.local_post_id, None);
        assert_eq!(loaded.remote_url.as_deref(), Some("https://cdn.example.com/c.png"));
    }

    #[tokio::test]
    async fn test_unknown_state_text_is_a_decode_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO media (id, source_uri, upload_state) VALUES (5, 'x.png', 'paused')")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(matches!(store.get_media(5).await, Err(AppError::Database(_))));
    }
}
