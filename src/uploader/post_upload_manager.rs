use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{MediaId, Post, PostId, PostUploadState};

use super::dependency_tracker::{EnqueueDecision, PostDependencyTracker};

/// Drives posts from enqueue to a finished upload, one transfer per post.
///
/// Holds the transient working copy of each live post; the store stays the
/// system of record.
#[derive(Debug)]
pub struct PostUploadManager {
    tracker: PostDependencyTracker,
    working: HashMap<PostId, Post>,
    ready_queue: VecDeque<PostId>,
    uploading: HashSet<PostId>,
    pool_size: usize,
    legacy_mode: bool,
}

impl PostUploadManager {
    pub fn new(pool_size: usize, legacy_mode: bool) -> Self {
        Self {
            tracker: PostDependencyTracker::new(),
            working: HashMap::new(),
            ready_queue: VecDeque::new(),
            uploading: HashSet::new(),
            pool_size: pool_size.max(1),
            legacy_mode,
        }
    }

    /// Enqueue a post. A no-op while the post is waiting, ready or uploading.
    ///
    /// In legacy mode the media gate is skipped and the post is ready at once.
    pub fn upload_post(&mut self, post: Post, has_pending_media: bool) -> EnqueueDecision {
        if self.is_post_uploading_or_queued(post.id) {
            log::debug!("Post {} already queued, ignoring enqueue", post.id);
            return EnqueueDecision::AlreadyQueued;
        }

        let gated = has_pending_media && !self.legacy_mode;
        if has_pending_media && self.legacy_mode {
            log::info!(
                "Legacy mode: uploading post {} without waiting for media",
                post.id
            );
        }

        let decision = self.tracker.enqueue(post.id, gated);
        self.working.insert(post.id, post);
        decision
    }

    /// See [`PostDependencyTracker::resolve_if_ready`].
    pub fn resolve_dependencies(&mut self, post_id: PostId, has_pending_media: bool) -> bool {
        self.tracker.resolve_if_ready(post_id, has_pending_media)
    }

    pub fn working_copy(&self, post_id: PostId) -> Option<&Post> {
        self.working.get(&post_id)
    }

    /// Queue a READY post (with its merged content) for the post pool.
    /// Returns false if the post was cancelled in the meantime.
    pub fn hand_off(&mut self, post: Post) -> bool {
        if self.tracker.state(post.id) != PostUploadState::Ready {
            return false;
        }
        if !self.ready_queue.contains(&post.id) {
            self.ready_queue.push_back(post.id);
        }
        self.working.insert(post.id, post);
        true
    }

    /// READY -> UPLOADING for as many posts as the pool allows.
    pub fn take_startable(&mut self) -> Vec<Post> {
        let mut started = Vec::new();

        while self.uploading.len() < self.pool_size {
            let Some(post_id) = self.ready_queue.pop_front() else {
                break;
            };
            if self
                .tracker
                .transition(post_id, PostUploadState::Uploading)
                .is_err()
            {
                log::warn!("Post {} left the ready queue in an unexpected state", post_id);
                continue;
            }
            let Some(post) = self.working.get(&post_id) else {
                log::warn!("Post {} has no working copy", post_id);
                continue;
            };

            self.uploading.insert(post_id);
            started.push(post.clone());
        }

        started
    }

    /// Record the end of a post transfer. Returns the working copy.
    pub fn finish(&mut self, post_id: PostId, success: bool) -> Option<Post> {
        if !self.uploading.remove(&post_id) {
            log::warn!("Upload result for post {} which is not uploading", post_id);
            return None;
        }

        let next = if success {
            PostUploadState::Done
        } else {
            PostUploadState::Failed
        };
        if let Err(e) = self.tracker.transition(post_id, next) {
            log::warn!("{}", e);
        }
        self.working.remove(&post_id)
    }

    /// Cancel a waiting or ready post. Returns false once its upload started.
    pub fn cancel_queued_post_upload(&mut self, post_id: PostId) -> bool {
        if !self.tracker.cancel(post_id) {
            return false;
        }
        self.ready_queue.retain(|id| *id != post_id);
        self.working.remove(&post_id);
        true
    }

    /// Cancel every waiting or ready post.
    pub fn cancel_all_queued(&mut self) -> Vec<PostId> {
        self.tracker
            .active_posts()
            .into_iter()
            .filter(|post_id| self.cancel_queued_post_upload(*post_id))
            .collect()
    }

    pub fn record_unresolved(&mut self, post_id: PostId, media_id: MediaId) {
        self.tracker.record_unresolved(post_id, media_id);
    }

    pub fn clear_unresolved(&mut self, post_id: PostId, media_id: MediaId) {
        self.tracker.clear_unresolved(post_id, media_id);
    }

    pub fn take_unresolved(&mut self, post_id: PostId) -> Vec<MediaId> {
        self.tracker.take_unresolved(post_id)
    }

    pub fn state(&self, post_id: PostId) -> PostUploadState {
        self.tracker.state(post_id)
    }

    pub fn is_post_uploading(&self, post_id: PostId) -> bool {
        self.tracker.state(post_id) == PostUploadState::Uploading
    }

    pub fn is_post_uploading_or_queued(&self, post_id: PostId) -> bool {
        self.tracker.state(post_id).is_uploading_or_queued()
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn ready_count(&self) -> usize {
        self.tracker.count_in(PostUploadState::Ready)
    }

    pub fn uploading_count(&self) -> usize {
        self.uploading.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tracker.active_posts().is_empty()
    }
}
