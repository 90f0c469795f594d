//! Post-level state machine and the set of posts waiting on media.
//!
//! A post enters the pending set when it is enqueued while its media are
//! still QUEUED or UPLOADING, and leaves it exactly once: either when the
//! completion that empties its media resolves it, or when it is cancelled.
//!
//! Posts without a live pipeline (finished posts, or posts that only have
//! unresolved-media notes) are remembered up to a fixed history; the oldest
//! are forgotten and read as `New` again.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::{AppError, AppResult};
use crate::models::{MediaId, PostId, PostUploadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDecision {
    /// The post already has a live pipeline; nothing changed.
    AlreadyQueued,
    WaitingForMedia,
    Ready,
}

/// Idle posts kept before the oldest is forgotten.
pub const DEFAULT_RETAINED_POSTS: usize = 1024;

#[derive(Debug)]
pub struct PostDependencyTracker {
    states: HashMap<PostId, PostUploadState>,
    pending: HashSet<PostId>,
    unresolved: HashMap<PostId, Vec<MediaId>>,
    retired: VecDeque<PostId>,
    retain_limit: usize,
}

impl Default for PostDependencyTracker {
    fn default() -> Self {
        Self::with_retain_limit(DEFAULT_RETAINED_POSTS)
    }
}

impl PostDependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retain_limit(retain_limit: usize) -> Self {
        Self {
            states: HashMap::new(),
            pending: HashSet::new(),
            unresolved: HashMap::new(),
            retired: VecDeque::new(),
            retain_limit: retain_limit.max(1),
        }
    }

    /// Current state; posts never seen are `New`.
    pub fn state(&self, post_id: PostId) -> PostUploadState {
        self.states
            .get(&post_id)
            .copied()
            .unwrap_or(PostUploadState::New)
    }

    /// Start a pipeline for the post. A post in a terminal state starts over
    /// from `New`.
    pub fn enqueue(&mut self, post_id: PostId, has_pending_media: bool) -> EnqueueDecision {
        if self.state(post_id).is_uploading_or_queued() {
            return EnqueueDecision::AlreadyQueued;
        }

        self.states.insert(post_id, PostUploadState::New);

        if has_pending_media {
            self.set_state(post_id, PostUploadState::WaitingForMedia);
            self.pending.insert(post_id);
            EnqueueDecision::WaitingForMedia
        } else {
            self.set_state(post_id, PostUploadState::Ready);
            EnqueueDecision::Ready
        }
    }

    /// Move a waiting post to READY once it has no pending media.
    ///
    /// Returns true for exactly one caller per wait: removal from the pending
    /// set is the check-and-transition.
    pub fn resolve_if_ready(&mut self, post_id: PostId, has_pending_media: bool) -> bool {
        if has_pending_media || !self.pending.remove(&post_id) {
            return false;
        }

        self.set_state(post_id, PostUploadState::Ready);
        true
    }

    /// Validated transition for the upload leg (READY onward).
    pub fn transition(&mut self, post_id: PostId, next: PostUploadState) -> AppResult<()> {
        let current = self.state(post_id);
        if !current.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "illegal post {} transition {} -> {}",
                post_id, current, next
            )));
        }

        self.set_state(post_id, next);
        Ok(())
    }

    /// Cancel a post that is waiting or ready. Returns false once the
    /// post's own upload has started or the post is not queued.
    pub fn cancel(&mut self, post_id: PostId) -> bool {
        match self.state(post_id) {
            PostUploadState::WaitingForMedia | PostUploadState::Ready => {
                self.pending.remove(&post_id);
                self.set_state(post_id, PostUploadState::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Note a media of the post that failed or was cancelled; its
    /// placeholder will stay in the content.
    pub fn record_unresolved(&mut self, post_id: PostId, media_id: MediaId) {
        let ids = self.unresolved.entry(post_id).or_default();
        if !ids.contains(&media_id) {
            ids.push(media_id);
        }
        if !self.state(post_id).is_uploading_or_queued() {
            self.retire(post_id);
        }
    }

    /// A media that was reported unresolved has since completed.
    pub fn clear_unresolved(&mut self, post_id: PostId, media_id: MediaId) {
        if let Some(ids) = self.unresolved.get_mut(&post_id) {
            ids.retain(|id| *id != media_id);
            if ids.is_empty() {
                self.unresolved.remove(&post_id);
            }
        }
    }

    pub fn take_unresolved(&mut self, post_id: PostId) -> Vec<MediaId> {
        self.unresolved.remove(&post_id).unwrap_or_default()
    }

    pub fn is_pending(&self, post_id: PostId) -> bool {
        self.pending.contains(&post_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn count_in(&self, state: PostUploadState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    /// Posts with a live pipeline (waiting, ready or uploading).
    pub fn active_posts(&self) -> Vec<PostId> {
        let mut posts: Vec<PostId> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_uploading_or_queued())
            .map(|(id, _)| *id)
            .collect();
        posts.sort_unstable();
        posts
    }

    fn set_state(&mut self, post_id: PostId, next: PostUploadState) {
        let previous = self.states.insert(post_id, next);
        log::debug!(
            "Post {} {} -> {}",
            post_id,
            previous.unwrap_or(PostUploadState::New),
            next
        );
        if next.is_terminal() {
            self.retire(post_id);
        }
    }

    /// Remember an idle post, forgetting the oldest ones past the limit.
    /// Posts that went live again since being retired are skipped.
    fn retire(&mut self, post_id: PostId) {
        self.retired.retain(|id| *id != post_id);
        self.retired.push_back(post_id);

        while self.retired.len() > self.retain_limit {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            if self.state(oldest).is_uploading_or_queued() {
                continue;
            }
            log::debug!("Forgetting finished post {}", oldest);
            self.states.remove(&oldest);
            self.unresolved.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_without_media_is_ready() {
        let mut tracker = PostDependencyTracker::new();
        assert_eq!(tracker.enqueue(1, false), EnqueueDecision::Ready);
        assert_eq!(tracker.state(1), PostUploadState::Ready);
        assert!(!tracker.is_pending(1));
    }

    #[test]
    fn test_enqueue_is_idempotent_while_live() {
        let mut tracker = PostDependencyTracker::new();
        assert_eq!(tracker.enqueue(1, true), EnqueueDecision::WaitingForMedia);
        assert_eq!(tracker.enqueue(1, true), EnqueueDecision::AlreadyQueued);
        assert_eq!(tracker.enqueue(1, false), EnqueueDecision::AlreadyQueued);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_resolution_fires_exactly_once_for_every_completion_order() {
        // Each permutation of three completions; only the last one resolves.
        let orders = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];

        for order in orders {
            let mut tracker = PostDependencyTracker::new();
            let mut remaining: HashSet<MediaId> = [1, 2, 3].into_iter().collect();
            tracker.enqueue(7, true);

            let mut resolutions = Vec::new();
            for media_id in order {
                remaining.remove(&media_id);
                if tracker.resolve_if_ready(7, !remaining.is_empty()) {
                    resolutions.push(media_id);
                }
                // A racing duplicate check after the fact never fires again.
                assert!(!tracker.resolve_if_ready(7, !remaining.is_empty()));
            }

            assert_eq!(resolutions, vec![order[2]], "order {:?}", order);
            assert_eq!(tracker.state(7), PostUploadState::Ready);
        }
    }

    #[test]
    fn test_cancel_waiting_post_blocks_later_resolution() {
        let mut tracker = PostDependencyTracker::new();
        tracker.enqueue(4, true);

        assert!(tracker.cancel(4));
        assert!(!tracker.is_pending(4));
        assert!(!tracker.resolve_if_ready(4, false));
        assert_eq!(tracker.state(4), PostUploadState::Cancelled);
    }

    #[test]
    fn test_cancel_after_upload_started_is_refused() {
        let mut tracker = PostDependencyTracker::new();
        tracker.enqueue(2, false);
        tracker.transition(2, PostUploadState::Uploading).unwrap();

        assert!(!tracker.cancel(2));
        assert!(!tracker.cancel(99));
        assert_eq!(tracker.state(2), PostUploadState::Uploading);
    }

    #[test]
    fn test_illegal_transition_is_an_error() {
        let mut tracker = PostDependencyTracker::new();
        tracker.enqueue(3, true);

        let result = tracker.transition(3, PostUploadState::Done);
        assert!(matches!(result, Err(AppError::Internal(_))));
        assert_eq!(tracker.state(3), PostUploadState::WaitingForMedia);
    }

    #[test]
    fn test_terminal_post_can_be_enqueued_again() {
        let mut tracker = PostDependencyTracker::new();
        tracker.enqueue(5, false);
        tracker.transition(5, PostUploadState::Uploading).unwrap();
        tracker.transition(5, PostUploadState::Failed).unwrap();

        assert_eq!(tracker.enqueue(5, false), EnqueueDecision::Ready);
    }

    #[test]
    fn test_unresolved_media_are_collected_once() {
        let mut tracker = PostDependencyTracker::new();
        tracker.record_unresolved(1, 10);
        tracker.record_unresolved(1, 10);
        tracker.record_unresolved(1, 11);
        tracker.clear_unresolved(1, 11);

        assert_eq!(tracker.take_unresolved(1), vec![10]);
        assert!(tracker.take_unresolved(1).is_empty());
    }

    #[test]
    fn test_finished_posts_are_forgotten_past_the_limit() {
        let mut tracker = PostDependencyTracker::with_retain_limit(2);
        for post_id in 1..=4 {
            tracker.enqueue(post_id, false);
            tracker.transition(post_id, PostUploadState::Uploading).unwrap();
            tracker.transition(post_id, PostUploadState::Done).unwrap();
        }
        tracker.enqueue(5, true);

        assert_eq!(tracker.states.len(), 3);
        assert_eq!(tracker.state(1), PostUploadState::New);
        assert_eq!(tracker.state(2), PostUploadState::New);
        assert_eq!(tracker.state(3), PostUploadState::Done);
        assert_eq!(tracker.state(4), PostUploadState::Done);
        assert_eq!(tracker.state(5), PostUploadState::WaitingForMedia);
    }

    #[test]
    fn test_live_posts_survive_eviction() {
        let mut tracker = PostDependencyTracker::with_retain_limit(1);
        tracker.enqueue(1, false);
        assert!(tracker.cancel(1));
        // Back in the pipeline before its history entry is evicted.
        tracker.enqueue(1, true);

        tracker.enqueue(2, false);
        assert!(tracker.cancel(2));

        assert_eq!(tracker.state(1), PostUploadState::WaitingForMedia);
        assert!(tracker.is_pending(1));
        assert_eq!(tracker.state(2), PostUploadState::Cancelled);
    }

    #[test]
    fn test_notes_for_posts_never_enqueued_are_bounded() {
        let mut tracker = PostDependencyTracker::with_retain_limit(2);
        for post_id in 1..=5 {
            tracker.record_unresolved(post_id, post_id * 10);
        }

        assert!(tracker.take_unresolved(1).is_empty());
        assert!(tracker.take_unresolved(3).is_empty());
        assert_eq!(tracker.take_unresolved(4), vec![40]);
        assert_eq!(tracker.take_unresolved(5), vec![50]);
    }
}
