use std::collections::{HashMap, VecDeque};

use crate::errors::{AppError, AppResult};
use crate::models::{MediaId, MediaItem, MediaUploadState, PostId, UploadOutcome};
use crate::store::MediaStore;

use super::progress_tracker::{notify_media_started, NotificationSink};
use super::retry::{with_backoff, RetryConfig};
use super::transport::UploadTransport;

/// Bookkeeping for media transfers.
///
/// Only QUEUED and UPLOADING items are tracked here; an item leaves the
/// manager as soon as it reaches a terminal state. Transfers themselves run
/// on worker tasks (see [`perform_media_upload`]); this type only decides
/// which items may start and records how they ended.
#[derive(Debug)]
pub struct MediaUploadManager {
    items: HashMap<MediaId, MediaItem>,
    queue: VecDeque<MediaId>,
    pool_size: usize,
    in_flight: usize,
}

impl MediaUploadManager {
    pub fn new(pool_size: usize) -> Self {
        Self {
            items: HashMap::new(),
            queue: VecDeque::new(),
            pool_size: pool_size.max(1),
            in_flight: 0,
        }
    }

    /// Register new items as QUEUED. Items whose id is already queued or
    /// uploading are skipped. Returns the ids actually registered.
    ///
    /// Registered items count as pending immediately but are not eligible to
    /// start until [`admit`](Self::admit) is called for them.
    pub fn upload_media(&mut self, items: Vec<MediaItem>) -> Vec<MediaId> {
        let mut registered = Vec::new();

        for mut item in items {
            if self.items.contains_key(&item.id) {
                log::debug!("Media {} already queued or uploading, skipping", item.id);
                continue;
            }

            // A finished item enqueued again starts a fresh lifecycle.
            if item.upload_state.is_terminal() {
                log::debug!("Media {} re-enqueued after {}", item.id, item.upload_state);
            }
            item.upload_state = MediaUploadState::Queued;
            item.remote_url = None;
            registered.push(item.id);
            self.items.insert(item.id, item);
        }

        registered
    }

    /// Make registered items eligible for the worker pool, in the given order.
    pub fn admit(&mut self, ids: &[MediaId]) {
        for id in ids {
            let queued = matches!(
                self.items.get(id),
                Some(item) if item.upload_state == MediaUploadState::Queued
            );
            if queued && !self.queue.contains(id) {
                self.queue.push_back(*id);
            }
        }
    }

    pub fn get(&self, media_id: MediaId) -> Option<&MediaItem> {
        self.items.get(&media_id)
    }

    pub fn has_pending_media_uploads_for_post(&self, post_id: PostId) -> bool {
        self.items.values().any(|item| item.is_pending_for(post_id))
    }

    pub fn pending_count_for_post(&self, post_id: PostId) -> usize {
        self.items
            .values()
            .filter(|item| item.is_pending_for(post_id))
            .count()
    }

    /// Move queued items to UPLOADING while pool slots are free.
    pub fn take_startable(&mut self) -> Vec<MediaItem> {
        let mut started = Vec::new();

        while self.in_flight < self.pool_size {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            if transition(item, MediaUploadState::Uploading).is_err() {
                continue;
            }

            self.in_flight += 1;
            started.push(item.clone());
        }

        started
    }

    /// Record the end of a transfer that was started by
    /// [`take_startable`](Self::take_startable). Returns the item in its
    /// terminal state, or `None` if the id is not uploading.
    pub fn finish(
        &mut self,
        media_id: MediaId,
        outcome: UploadOutcome,
        remote_url: Option<String>,
    ) -> Option<MediaItem> {
        let uploading = matches!(
            self.items.get(&media_id),
            Some(item) if item.upload_state == MediaUploadState::Uploading
        );
        if !uploading {
            log::warn!("Completion for media {} which is not uploading", media_id);
            return None;
        }

        let mut item = self.items.remove(&media_id)?;
        self.in_flight = self.in_flight.saturating_sub(1);

        transition(&mut item, outcome.terminal_state()).ok()?;
        if outcome == UploadOutcome::Success {
            item.remote_url = remote_url;
        }
        Some(item)
    }

    /// Cancel an item that has not started yet. In-flight transfers are not
    /// preempted and return `None`.
    pub fn cancel(&mut self, media_id: MediaId) -> Option<MediaItem> {
        match self.items.get(&media_id) {
            Some(item) if item.upload_state == MediaUploadState::Queued => {}
            Some(_) => {
                log::debug!("Media {} already uploading, cannot cancel", media_id);
                return None;
            }
            None => return None,
        }

        let mut item = self.items.remove(&media_id)?;
        self.queue.retain(|id| *id != media_id);
        transition(&mut item, MediaUploadState::Cancelled).ok()?;
        Some(item)
    }

    /// Cancel every item that has not started.
    pub fn cancel_all_queued(&mut self) -> Vec<MediaItem> {
        let mut ids: Vec<MediaId> = self
            .items
            .values()
            .filter(|item| item.upload_state == MediaUploadState::Queued)
            .map(|item| item.id)
            .collect();
        ids.sort_unstable();

        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }

    pub fn queued_count(&self) -> usize {
        self.items.len() - self.in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.items.is_empty()
    }
}

/// Move an item along its lifecycle, refusing any step the state machine
/// does not allow.
fn transition(item: &mut MediaItem, next: MediaUploadState) -> AppResult<()> {
    if !item.upload_state.can_transition_to(next) {
        log::warn!(
            "Refusing media {} transition {} -> {}",
            item.id,
            item.upload_state,
            next
        );
        return Err(AppError::Internal(format!(
            "illegal media transition {} -> {} for media {}",
            item.upload_state, next, item.id
        )));
    }

    log::debug!("Media {} {} -> {}", item.id, item.upload_state, next);
    item.upload_state = next;
    Ok(())
}

/// Run one media transfer to its natural end.
///
/// Persists the UPLOADING state, then calls the transport with transient
/// retries. Returns the remote URL; the caller owns the terminal transition.
pub async fn perform_media_upload<S>(
    transport: &dyn UploadTransport,
    retry: &RetryConfig,
    store: &S,
    notifier: &dyn NotificationSink,
    item: &MediaItem,
) -> AppResult<String>
where
    S: MediaStore + ?Sized,
{
    if let Err(e) = store.update_media(item).await {
        log::warn!("Failed to persist UPLOADING for media {}: {}", item.id, e);
    }
    notify_media_started(notifier, item);

    let label = format!("media {}", item.id);
    with_backoff(retry, &label, move || transport.upload_media(item)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(pool_size: usize, items: Vec<MediaItem>) -> MediaUploadManager {
        let mut manager = MediaUploadManager::new(pool_size);
        let ids = manager.upload_media(items);
        manager.admit(&ids);
        manager
    }

    #[test]
    fn test_duplicate_ids_are_not_queued_twice() {
        let mut manager = manager_with(2, vec![MediaItem::new(1, Some(10), "a.png")]);

        let again = manager.upload_media(vec![
            MediaItem::new(1, Some(10), "a.png"),
            MediaItem::new(2, Some(10), "b.png"),
        ]);
        assert_eq!(again, vec![2]);
        manager.admit(&[1, 2]);

        let started: Vec<_> = manager.take_startable().into_iter().map(|m| m.id).collect();
        assert_eq!(started, vec![1, 2]);
        assert!(manager.take_startable().is_empty());

        // Still uploading, so a re-enqueue is ignored.
        assert!(manager
            .upload_media(vec![MediaItem::new(1, Some(10), "a.png")])
            .is_empty());
    }

    #[test]
    fn test_pool_size_bounds_concurrent_transfers() {
        let items = (1..=5).map(|id| MediaItem::new(id, Some(1), "x.png")).collect();
        let mut manager = manager_with(2, items);

        assert_eq!(manager.take_startable().len(), 2);
        assert_eq!(manager.in_flight(), 2);
        assert_eq!(manager.queued_count(), 3);

        manager.finish(1, UploadOutcome::Success, Some("https://cdn/1".into()));
        let next: Vec<_> = manager.take_startable().into_iter().map(|m| m.id).collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn test_pending_tracks_post_until_terminal() {
        let mut manager = manager_with(
            1,
            vec![
                MediaItem::new(1, Some(7), "a.png"),
                MediaItem::new(2, Some(8), "b.png"),
            ],
        );
        assert!(manager.has_pending_media_uploads_for_post(7));
        assert_eq!(manager.pending_count_for_post(7), 1);

        manager.take_startable();
        let done = manager
            .finish(1, UploadOutcome::Failure, None)
            .expect("media 1 was uploading");
        assert_eq!(done.upload_state, MediaUploadState::Failed);
        assert!(!manager.has_pending_media_uploads_for_post(7));
        assert!(manager.has_pending_media_uploads_for_post(8));
    }

    #[test]
    fn test_registered_but_unadmitted_items_count_as_pending() {
        let mut manager = MediaUploadManager::new(1);
        manager.upload_media(vec![MediaItem::new(4, Some(2), "a.png")]);

        assert!(manager.has_pending_media_uploads_for_post(2));
        assert!(manager.take_startable().is_empty());
    }

    #[test]
    fn test_cancel_only_affects_queued_items() {
        let mut manager = manager_with(
            1,
            vec![
                MediaItem::new(1, Some(3), "a.png"),
                MediaItem::new(2, Some(3), "b.png"),
            ],
        );
        manager.take_startable();

        assert!(manager.cancel(1).is_none());
        let cancelled = manager.cancel(2).expect("media 2 was queued");
        assert_eq!(cancelled.upload_state, MediaUploadState::Cancelled);
        assert!(manager.cancel(2).is_none());

        manager.finish(1, UploadOutcome::Success, Some("https://cdn/1".into()));
        assert!(manager.take_startable().is_empty());
        assert!(manager.is_idle());
    }

    #[test]
    fn test_illegal_media_transitions_are_refused() {
        let mut item = MediaItem::new(1, Some(1), "a.png");
        assert!(transition(&mut item, MediaUploadState::Completed).is_err());
        assert_eq!(item.upload_state, MediaUploadState::Queued);

        transition(&mut item, MediaUploadState::Uploading).unwrap();
        transition(&mut item, MediaUploadState::Failed).unwrap();
        assert!(matches!(
            transition(&mut item, MediaUploadState::Uploading),
            Err(AppError::Internal(_))
        ));
        assert_eq!(item.upload_state, MediaUploadState::Failed);
    }

    #[test]
    fn test_failed_item_can_be_enqueued_again() {
        let mut manager = manager_with(1, vec![MediaItem::new(1, Some(4), "a.png")]);
        manager.take_startable();
        let failed = manager.finish(1, UploadOutcome::Failure, None).unwrap();
        assert!(!manager.has_pending_media_uploads_for_post(4));

        assert_eq!(manager.upload_media(vec![failed]), vec![1]);
        assert_eq!(
            manager.get(1).map(|item| item.upload_state),
            Some(MediaUploadState::Queued)
        );
        assert!(manager.has_pending_media_uploads_for_post(4));
    }

    #[test]
    fn test_aborted_transfer_finishes_cancelled() {
        let mut manager = manager_with(1, vec![MediaItem::new(1, Some(4), "a.png")]);
        manager.take_startable();

        let aborted = manager.finish(1, UploadOutcome::Cancelled, None).unwrap();
        assert_eq!(aborted.upload_state, MediaUploadState::Cancelled);
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn test_finish_for_unknown_media_is_ignored() {
        let mut manager = manager_with(1, vec![MediaItem::new(1, None, "a.png")]);
        assert!(manager.finish(1, UploadOutcome::Success, None).is_none());
        assert!(manager.finish(99, UploadOutcome::Success, None).is_none());
    }
}
