//! Persistence seams for posts and media.
//!
//! The store is the system of record for [`Post`] and [`MediaItem`] outside
//! the active pipeline. The coordinator only keeps transient working copies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{AppError, AppResult};
use crate::models::{MediaId, MediaItem, Post, PostId};

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post(&self, id: PostId) -> AppResult<Option<Post>>;

    /// Insert or overwrite a post unconditionally.
    async fn update_post(&self, post: &Post) -> AppResult<()>;

    /// Overwrite a post only if its stored `last_modified` still equals
    /// `expected_last_modified`; otherwise fail with `RewriteConflict`.
    async fn replace_post(
        &self,
        post: &Post,
        expected_last_modified: DateTime<Utc>,
    ) -> AppResult<()>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn get_media(&self, id: MediaId) -> AppResult<Option<MediaItem>>;

    /// Insert or overwrite a media record.
    async fn update_media(&self, media: &MediaItem) -> AppResult<()>;

    async fn media_for_post(&self, post_id: PostId) -> AppResult<Vec<MediaItem>>;
}

/// Everything the coordinator needs from persistence.
pub trait UploadStore: PostStore + MediaStore {}

impl<T: PostStore + MediaStore> UploadStore for T {}

/// HashMap-backed store. All data is lost when the store is dropped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    posts: Arc<RwLock<HashMap<PostId, Post>>>,
    media: Arc<RwLock<HashMap<MediaId, MediaItem>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for InMemoryStore {
    async fn get_post(&self, id: PostId) -> AppResult<Option<Post>> {
        Ok(self.posts.read().await.get(&id).cloned())
    }

    async fn update_post(&self, post: &Post) -> AppResult<()> {
        self.posts.write().await.insert(post.id, post.clone());
        Ok(())
    }

    async fn replace_post(
        &self,
        post: &Post,
        expected_last_modified: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut posts = self.posts.write().await;
        let stored = posts
            .get_mut(&post.id)
            .ok_or_else(|| AppError::not_found(format!("post {}", post.id)))?;

        if stored.last_modified != expected_last_modified {
            return Err(AppError::rewrite_conflict(
                post.id,
                format!(
                    "stored copy modified at {} (expected {})",
                    stored.last_modified, expected_last_modified
                ),
            ));
        }

        *stored = post.clone();
        Ok(())
    }
}

#[async_trait]
impl MediaStore for InMemoryStore {
    async fn get_media(&self, id: MediaId) -> AppResult<Option<MediaItem>> {
        Ok(self.media.read().await.get(&id).cloned())
    }

    async fn update_media(&self, media: &MediaItem) -> AppResult<()> {
        self.media.write().await.insert(media.id, media.clone());
        Ok(())
    }

    async fn media_for_post(&self, post_id: PostId) -> AppResult<Vec<MediaItem>> {
        let media = self.media.read().await;
        let mut items: Vec<MediaItem> = media
            .values()
            .filter(|item| item.belongs_to(post_id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_replace_post_detects_concurrent_edit() {
        let store = InMemoryStore::new();
        let post = Post::new(1, "original");
        store.update_post(&post).await.unwrap();

        let mut edited = post.clone();
        edited.content = "edited elsewhere".to_string();
        edited.last_modified = post.last_modified + Duration::seconds(5);
        store.update_post(&edited).await.unwrap();

        let mut merged = post.clone();
        merged.content = "merged".to_string();
        let result = store.replace_post(&merged, post.last_modified).await;
        assert!(matches!(result, Err(AppError::RewriteConflict { post_id: 1, .. })));

        let stored = store.get_post(1).await.unwrap().unwrap();
        assert_eq!(stored.content, "edited elsewhere");
    }

    #[tokio::test]
    async fn test_replace_missing_post_is_not_found() {
        let store = InMemoryStore::new();
        let post = Post::new(9, "x");
        let result = store.replace_post(&post, post.last_modified).await;
        assert!(matches!(result, Err(AppError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_media_for_post_filters_by_owner() {
        let store = InMemoryStore::new();
        store.update_media(&MediaItem::new(2, Some(1), "b.png")).await.unwrap();
        store.update_media(&MediaItem::new(1, Some(1), "a.png")).await.unwrap();
        store.update_media(&MediaItem::new(3, None, "c.png")).await.unwrap();

        let ids: Vec<_> = store
            .media_for_post(1)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
