use std::collections::{HashMap, HashSet};

use crate::errors::AppResult;
use crate::models::{MediaItem, Post, PostId};
use crate::rewriter::PostContentRewriter;

/// Completed media buffered per post, in completion order, until the batch
/// is merged into the post content.
#[derive(Debug, Default)]
pub struct CompletedMediaAggregator {
    by_post: HashMap<PostId, Vec<MediaItem>>,
}

impl CompletedMediaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a completed item. Unattached media and repeated ids are ignored.
    pub fn add_completed(&mut self, media: MediaItem) -> bool {
        let Some(post_id) = media.local_post_id else {
            return false;
        };

        let batch = self.by_post.entry(post_id).or_default();
        if batch.iter().any(|m| m.id == media.id) {
            log::debug!("Media {} already buffered for post {}", media.id, post_id);
            return false;
        }

        batch.push(media);
        true
    }

    /// Remove and return the whole batch for a post.
    pub fn drain(&mut self, post_id: PostId) -> Vec<MediaItem> {
        self.by_post.remove(&post_id).unwrap_or_default()
    }

    /// Put a batch back after a failed merge. The restored items go ahead of
    /// anything buffered since the drain.
    pub fn restore(&mut self, post_id: PostId, batch: Vec<MediaItem>) {
        if batch.is_empty() {
            return;
        }

        let newer = self.by_post.remove(&post_id).unwrap_or_default();
        let mut seen: HashSet<_> = batch.iter().map(|m| m.id).collect();
        let mut merged = batch;
        merged.extend(newer.into_iter().filter(|m| seen.insert(m.id)));

        log::debug!("Restored {} completed media for post {}", merged.len(), post_id);
        self.by_post.insert(post_id, merged);
    }

    pub fn len_for(&self, post_id: PostId) -> usize {
        self.by_post.get(&post_id).map_or(0, Vec::len)
    }

    pub fn pending_posts(&self) -> Vec<PostId> {
        let mut posts: Vec<PostId> = self.by_post.keys().copied().collect();
        posts.sort_unstable();
        posts
    }

    pub fn total(&self) -> usize {
        self.by_post.values().map(Vec::len).sum()
    }
}

/// Substitute every media URL of `batch` into the post content, in batch
/// order. The first rewriter error aborts the whole batch.
pub fn apply_completed_media(
    mut post: Post,
    batch: &[MediaItem],
    rewriter: &dyn PostContentRewriter,
) -> AppResult<Post> {
    if batch.is_empty() {
        return Ok(post);
    }

    let mut content = post.content.clone();
    for media in batch {
        let Some(url) = media.remote_url.as_deref() else {
            log::warn!("Completed media {} has no remote URL, skipping", media.id);
            continue;
        };
        content = rewriter.replace(&content, media.id, url)?;
    }

    post.content = content;
    post.mark_content_changed();
    Ok(post)
}
