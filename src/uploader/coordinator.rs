//! The long-lived coordinator task and the handle callers use to talk to it.
//!
//! All upload bookkeeping lives in one [`UploadBook`] behind a mutex. Callers
//! mutate it synchronously through [`CoordinatorHandle`]; worker tasks only
//! report results over the event channel, and the coordinator loop applies
//! them one event at a time. The lock is never held across an await.
//!
//! Store I/O happens on the loop between book updates, never under the lock,
//! so handle calls and queries never wait on the store. A slow store does
//! delay the next event. Merges have to stay on the loop: a batch is read,
//! rewritten and replaced against the `last_modified` it was read with, and
//! the outcome decides whether the batch is restored for a retry. Media
//! state writes stay there too so the persisted state never trails the idle
//! signal.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::errors::{safe_state_read, safe_state_update, AppError, AppResult};
use crate::models::{MediaId, MediaItem, Post, PostId, PostUploadState, UploadOutcome};
use crate::rewriter::PostContentRewriter;
use crate::store::UploadStore;

use super::completed_media::{apply_completed_media, CompletedMediaAggregator};
use super::dependency_tracker::EnqueueDecision;
use super::media_upload_manager::{perform_media_upload, MediaUploadManager};
use super::post_upload_manager::PostUploadManager;
use super::progress_tracker::*;
use super::retry::{with_backoff, RetryConfig};
use super::transport::UploadTransport;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub media_pool_size: usize,
    pub post_pool_size: usize,
    pub legacy_mode: bool,
    pub retry: RetryConfig,
    pub merge_retry_delay: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            media_pool_size: 3,
            post_pool_size: 1,
            legacy_mode: false,
            retry: RetryConfig::default(),
            merge_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Counts for hosts that display progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSnapshot {
    pub queued_media: usize,
    pub uploading_media: usize,
    pub pending_posts: usize,
    pub ready_posts: usize,
    pub uploading_posts: usize,
    pub buffered_media: usize,
}

struct UploadBook {
    media: MediaUploadManager,
    completed: CompletedMediaAggregator,
    posts: PostUploadManager,
    accepting: bool,
}

impl UploadBook {
    fn is_idle(&self) -> bool {
        self.media.is_idle() && self.posts.is_idle()
    }

    /// A post whose buffered completions can be merged on their own: it has
    /// no pending media and no live pipeline to take the batch.
    fn merge_eligible(&self, post_id: PostId) -> bool {
        self.completed.len_for(post_id) > 0
            && !self.media.has_pending_media_uploads_for_post(post_id)
            && !self.posts.is_post_uploading_or_queued(post_id)
    }
}

enum CoordinatorEvent {
    MediaQueued(Vec<MediaId>),
    MediaTransferFinished {
        media_id: MediaId,
        result: AppResult<String>,
    },
    MediaCancelled(MediaItem),
    PostReady(PostId),
    PostCancelled(PostId),
    PostTransferFinished {
        post_id: PostId,
        result: AppResult<()>,
    },
    MergeRetry(PostId),
    Shutdown(oneshot::Sender<()>),
}

/// What a media completion means for its post.
enum PostStep {
    Dispatch,
    MergeOnly,
    Waiting(usize),
    Nothing,
}

pub struct Coordinator;

impl Coordinator {
    /// Spawn the coordinator loop on the current tokio runtime.
    pub fn start(
        settings: CoordinatorSettings,
        transport: Arc<dyn UploadTransport>,
        store: Arc<dyn UploadStore>,
        rewriter: Arc<dyn PostContentRewriter>,
        notifier: Arc<dyn NotificationSink>,
    ) -> CoordinatorHandle {
        let book = Arc::new(Mutex::new(UploadBook {
            media: MediaUploadManager::new(settings.media_pool_size),
            completed: CompletedMediaAggregator::new(),
            posts: PostUploadManager::new(settings.post_pool_size, settings.legacy_mode),
            accepting: true,
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (idle_tx, _) = watch::channel(true);
        let idle = Arc::new(idle_tx);

        log::info!(
            "Starting upload coordinator (media pool {}, post pool {}, legacy mode {})",
            settings.media_pool_size,
            settings.post_pool_size,
            settings.legacy_mode
        );

        let coordinator_loop = CoordinatorLoop {
            settings,
            transport,
            store,
            rewriter,
            notifier: Arc::clone(&notifier),
            book: Arc::clone(&book),
            events: events_tx.clone(),
            idle: Arc::clone(&idle),
            scheduled_merges: HashSet::new(),
            merge_attempts: HashMap::new(),
            shutdown_reply: None,
        };
        let task = tokio::spawn(coordinator_loop.run(events_rx));

        CoordinatorHandle {
            inner: Arc::new(HandleInner {
                book,
                events: events_tx,
                idle,
                notifier,
                task: Mutex::new(Some(task)),
            }),
        }
    }
}

struct HandleInner {
    book: Arc<Mutex<UploadBook>>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    idle: Arc<watch::Sender<bool>>,
    notifier: Arc<dyn NotificationSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable entry point into a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<HandleInner>,
}

impl CoordinatorHandle {
    /// Queue media for upload. Ids already queued or uploading are skipped.
    pub fn enqueue_media(&self, items: Vec<MediaItem>) {
        let idle = &self.inner.idle;
        let ids = safe_state_update(&self.inner.book, "enqueue media", |book| {
            if !book.accepting {
                log::warn!("Coordinator is shutting down, ignoring {} media", items.len());
                return Vec::new();
            }
            let ids = book.media.upload_media(items);
            if !ids.is_empty() {
                idle.send_replace(false);
            }
            ids
        });

        if !ids.is_empty() {
            log::info!("Queued {} media for upload", ids.len());
            self.send(CoordinatorEvent::MediaQueued(ids));
        }
    }

    /// Queue a post for upload. A post that is already waiting, ready or
    /// uploading is left alone.
    pub fn enqueue_post(&self, post: Post) {
        let post_id = post.id;
        let idle = &self.inner.idle;
        let decision = safe_state_update(&self.inner.book, "enqueue post", |book| {
            if !book.accepting {
                log::warn!("Coordinator is shutting down, ignoring post {}", post_id);
                return None;
            }
            let has_pending = book.media.has_pending_media_uploads_for_post(post_id);
            let decision = book.posts.upload_post(post, has_pending);
            if decision != EnqueueDecision::AlreadyQueued {
                idle.send_replace(false);
            }
            Some((decision, book.media.pending_count_for_post(post_id)))
        });

        match decision {
            Some((EnqueueDecision::Ready, _)) => {
                log::info!("Post {} ready for upload", post_id);
                self.send(CoordinatorEvent::PostReady(post_id));
            }
            Some((EnqueueDecision::WaitingForMedia, remaining)) => {
                log::info!("Post {} waiting for {} media upload(s)", post_id, remaining);
                notify_post_waiting(self.inner.notifier.as_ref(), post_id, remaining);
            }
            Some((EnqueueDecision::AlreadyQueued, _)) => {
                log::debug!("Post {} is already uploading or queued", post_id);
            }
            None => {}
        }
    }

    /// Cancel a post that has not started its own upload. Its media keep
    /// uploading.
    pub fn cancel_post(&self, post_id: PostId) -> bool {
        let cancelled = safe_state_update(&self.inner.book, "cancel post", |book| {
            book.posts.cancel_queued_post_upload(post_id)
        });

        if cancelled {
            log::info!("Cancelled queued upload of post {}", post_id);
            notify_post_cancelled(self.inner.notifier.as_ref(), post_id);
            self.send(CoordinatorEvent::PostCancelled(post_id));
        }
        cancelled
    }

    /// Cancel a media item that has not started transferring.
    pub fn cancel_media(&self, media_id: MediaId) -> bool {
        let cancelled = safe_state_update(&self.inner.book, "cancel media", |book| {
            book.media.cancel(media_id)
        });

        match cancelled {
            Some(item) => {
                log::info!("Cancelled queued media {}", media_id);
                self.send(CoordinatorEvent::MediaCancelled(item));
                true
            }
            None => false,
        }
    }

    pub fn is_post_uploading(&self, post_id: PostId) -> bool {
        safe_state_read(&self.inner.book, "is post uploading", |book| {
            book.posts.is_post_uploading(post_id)
        })
    }

    pub fn is_post_uploading_or_queued(&self, post_id: PostId) -> bool {
        safe_state_read(&self.inner.book, "is post uploading or queued", |book| {
            book.posts.is_post_uploading_or_queued(post_id)
        })
    }

    pub fn has_pending_media_uploads_for_post(&self, post_id: PostId) -> bool {
        safe_state_read(&self.inner.book, "pending media for post", |book| {
            book.media.has_pending_media_uploads_for_post(post_id)
        })
    }

    pub fn post_state(&self, post_id: PostId) -> PostUploadState {
        safe_state_read(&self.inner.book, "post state", |book| book.posts.state(post_id))
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        safe_state_read(&self.inner.book, "snapshot", |book| UploadSnapshot {
            queued_media: book.media.queued_count(),
            uploading_media: book.media.in_flight(),
            pending_posts: book.posts.pending_count(),
            ready_posts: book.posts.ready_count(),
            uploading_posts: book.posts.uploading_count(),
            buffered_media: book.completed.total(),
        })
    }

    /// Resolve once no media is active, no post is waiting, ready or
    /// uploading, and no merge is outstanding.
    pub async fn wait_until_idle(&self) -> AppResult<()> {
        let mut idle = self.inner.idle.subscribe();
        idle.wait_for(|is_idle| *is_idle)
            .await
            .map_err(|_| AppError::Internal("coordinator idle signal closed".to_string()))?;
        Ok(())
    }

    /// Stop accepting work, cancel what has not started, let in-flight
    /// transfers finish, merge every buffered completion and stop the loop.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(CoordinatorEvent::Shutdown(reply_tx))
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        let task = safe_state_update(&self.inner.task, "take coordinator task", Option::take);
        if let Some(task) = task {
            task.await
                .map_err(|e| AppError::Internal(format!("coordinator task failed: {}", e)))?;
        }
        Ok(())
    }

    fn send(&self, event: CoordinatorEvent) {
        if self.inner.events.send(event).is_err() {
            log::warn!("Coordinator loop is not running; event dropped");
        }
    }
}

struct CoordinatorLoop {
    settings: CoordinatorSettings,
    transport: Arc<dyn UploadTransport>,
    store: Arc<dyn UploadStore>,
    rewriter: Arc<dyn PostContentRewriter>,
    notifier: Arc<dyn NotificationSink>,
    book: Arc<Mutex<UploadBook>>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    idle: Arc<watch::Sender<bool>>,
    scheduled_merges: HashSet<PostId>,
    merge_attempts: HashMap<PostId, u32>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl CoordinatorLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            self.start_transfers();

            if self.shutdown_reply.is_some() && self.transfers_settled() {
                self.final_drain().await;
                if let Some(reply) = self.shutdown_reply.take() {
                    let _ = reply.send(());
                }
                break;
            }

            self.publish_idle();
        }

        self.idle.send_replace(true);
        log::info!("Upload coordinator stopped");
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::MediaQueued(ids) => self.on_media_queued(ids).await,
            CoordinatorEvent::MediaTransferFinished { media_id, result } => {
                self.on_media_transfer_finished(media_id, result).await
            }
            CoordinatorEvent::MediaCancelled(item) => self.on_media_cancelled(item).await,
            CoordinatorEvent::PostReady(post_id) => self.dispatch_ready(post_id).await,
            CoordinatorEvent::PostCancelled(post_id) => {
                self.merge_attempts.remove(&post_id);
                self.merge_if_eligible(post_id).await;
            }
            CoordinatorEvent::PostTransferFinished { post_id, result } => {
                self.on_post_transfer_finished(post_id, result).await
            }
            CoordinatorEvent::MergeRetry(post_id) => {
                self.scheduled_merges.remove(&post_id);
                self.merge_if_eligible(post_id).await;
            }
            CoordinatorEvent::Shutdown(reply) => self.begin_shutdown(reply).await,
        }
    }

    async fn on_media_queued(&mut self, ids: Vec<MediaId>) {
        // Persist QUEUED before the item becomes eligible to start, so the
        // worker's UPLOADING write always lands after it.
        let items: Vec<MediaItem> = safe_state_read(&self.book, "read queued media", |book| {
            ids.iter()
                .filter_map(|id| book.media.get(*id).cloned())
                .collect()
        });

        for item in &items {
            if let Err(e) = self.store.update_media(item).await {
                log::warn!("Failed to persist QUEUED for media {}: {}", item.id, e);
            }
        }

        safe_state_update(&self.book, "admit media", |book| book.media.admit(&ids));
    }

    async fn on_media_transfer_finished(&mut self, media_id: MediaId, result: AppResult<String>) {
        let (outcome, remote_url, error) = match result {
            Ok(url) => (UploadOutcome::Success, Some(url), None),
            Err(e) if e.is_cancellation() => {
                log::info!("Media {} transfer aborted: {}", media_id, e);
                (UploadOutcome::Cancelled, None, Some(e))
            }
            Err(e) => {
                log::error!("Media {} upload failed: {}", media_id, e);
                (UploadOutcome::Failure, None, Some(e))
            }
        };

        let item = safe_state_update(&self.book, "finish media", |book| {
            book.media.finish(media_id, outcome, remote_url)
        });

        match item {
            Some(item) => self.on_media_terminal(item, outcome, error.as_ref()).await,
            None => log::warn!("Dropping completion for unknown media {}", media_id),
        }
    }

    async fn on_media_cancelled(&mut self, item: MediaItem) {
        let reason = AppError::cancelled(format!("media {} before upload started", item.id));
        self.on_media_terminal(item, UploadOutcome::Cancelled, Some(&reason))
            .await;
    }

    async fn on_media_terminal(
        &mut self,
        item: MediaItem,
        outcome: UploadOutcome,
        error: Option<&AppError>,
    ) {
        if let Err(e) = self.store.update_media(&item).await {
            log::warn!(
                "Failed to persist {} for media {}: {}",
                item.upload_state,
                item.id,
                e
            );
        }
        notify_media_finished(self.notifier.as_ref(), &item, outcome, error);

        let Some(post_id) = item.local_post_id else {
            return;
        };
        let media_id = item.id;

        let step = safe_state_update(&self.book, "media completion", |book| {
            if outcome == UploadOutcome::Success {
                book.completed.add_completed(item);
                book.posts.clear_unresolved(post_id, media_id);
            } else {
                book.posts.record_unresolved(post_id, media_id);
            }

            let has_pending = book.media.has_pending_media_uploads_for_post(post_id);
            if book.posts.resolve_dependencies(post_id, has_pending) {
                PostStep::Dispatch
            } else if book.merge_eligible(post_id) {
                PostStep::MergeOnly
            } else if has_pending && book.posts.state(post_id) == PostUploadState::WaitingForMedia {
                PostStep::Waiting(book.media.pending_count_for_post(post_id))
            } else {
                PostStep::Nothing
            }
        });

        match step {
            PostStep::Dispatch => {
                log::info!("All media for post {} resolved", post_id);
                self.dispatch_ready(post_id).await;
            }
            PostStep::MergeOnly => self.merge_only(post_id).await,
            PostStep::Waiting(remaining) => {
                notify_post_waiting(self.notifier.as_ref(), post_id, remaining)
            }
            PostStep::Nothing => {}
        }
    }

    /// Merge buffered media into a READY post and queue it for upload.
    async fn dispatch_ready(&mut self, post_id: PostId) {
        let working = safe_state_read(&self.book, "read ready post", |book| {
            if book.posts.state(post_id) == PostUploadState::Ready {
                book.posts.working_copy(post_id).cloned()
            } else {
                None
            }
        });
        let Some(working) = working else {
            log::debug!("Post {} is no longer ready, skipping dispatch", post_id);
            return;
        };

        match self.drain_and_apply(post_id, Some(working.clone())).await {
            Ok(merged) => {
                self.merge_attempts.remove(&post_id);
                self.hand_off(merged.unwrap_or(working));
            }
            Err(e) => {
                if e.is_conflict() {
                    notify_merge_conflict(self.notifier.as_ref(), post_id, &e);
                }
                if self.note_merge_failure(post_id) {
                    log::warn!("Merge for post {} failed, retrying: {}", post_id, e);
                    self.schedule(CoordinatorEvent::PostReady(post_id));
                } else {
                    // The batch stays buffered and is merged after the upload.
                    log::error!(
                        "Giving up merging media into post {} before upload: {}",
                        post_id,
                        e
                    );
                    self.merge_attempts.remove(&post_id);
                    self.hand_off(working);
                }
            }
        }
    }

    fn hand_off(&mut self, post: Post) {
        let post_id = post.id;
        let unresolved = safe_state_update(&self.book, "hand off post", |book| {
            book.posts
                .hand_off(post)
                .then(|| book.posts.take_unresolved(post_id))
        });

        match unresolved {
            Some(unresolved) => {
                log::info!("Post {} queued for upload", post_id);
                for media_id in unresolved {
                    log::warn!(
                        "Post {} goes out with unresolved media {}",
                        post_id,
                        media_id
                    );
                    notify_post_unresolved_media(self.notifier.as_ref(), post_id, media_id);
                }
            }
            None => log::info!("Post {} was cancelled while merging media", post_id),
        }
    }

    async fn merge_if_eligible(&mut self, post_id: PostId) {
        let eligible = safe_state_read(&self.book, "merge eligibility", |book| {
            book.merge_eligible(post_id)
        });
        if eligible {
            self.merge_only(post_id).await;
        }
    }

    /// Merge buffered media into the stored post outside of an upload.
    async fn merge_only(&mut self, post_id: PostId) {
        match self.drain_and_apply(post_id, None).await {
            Ok(Some(_)) => {
                self.merge_attempts.remove(&post_id);
                log::info!("Merged completed media into stored post {}", post_id);
            }
            Ok(None) => {
                self.merge_attempts.remove(&post_id);
                log::warn!(
                    "Completed media reference unknown post {}; dropping them",
                    post_id
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    notify_merge_conflict(self.notifier.as_ref(), post_id, &e);
                }
                if self.note_merge_failure(post_id) {
                    log::warn!("Merge for post {} failed, retrying: {}", post_id, e);
                    self.scheduled_merges.insert(post_id);
                    self.schedule(CoordinatorEvent::MergeRetry(post_id));
                } else {
                    log::error!(
                        "Giving up merging media into post {} for now: {}",
                        post_id,
                        e
                    );
                    self.merge_attempts.remove(&post_id);
                }
            }
        }
    }

    /// Drain the post's batch and write it into the latest stored copy.
    ///
    /// `fallback` is used when the store has no record of the post. Returns
    /// `Ok(None)` for a post known nowhere. On error the batch is put back.
    async fn drain_and_apply(
        &self,
        post_id: PostId,
        fallback: Option<Post>,
    ) -> AppResult<Option<Post>> {
        let batch = safe_state_update(&self.book, "drain completed media", |book| {
            book.completed.drain(post_id)
        });

        let result = self.apply_batch(post_id, &batch, fallback).await;
        if result.is_err() {
            safe_state_update(&self.book, "restore completed media", |book| {
                book.completed.restore(post_id, batch)
            });
        }
        result
    }

    async fn apply_batch(
        &self,
        post_id: PostId,
        batch: &[MediaItem],
        fallback: Option<Post>,
    ) -> AppResult<Option<Post>> {
        let (base, stored) = match self.store.get_post(post_id).await? {
            Some(post) => (post, true),
            None => match fallback {
                Some(post) => (post, false),
                None => return Ok(None),
            },
        };

        if batch.is_empty() {
            if !stored {
                self.store.update_post(&base).await?;
            }
            return Ok(Some(base));
        }

        let expected = base.last_modified;
        let merged = apply_completed_media(base, batch, self.rewriter.as_ref())?;
        if stored {
            self.store.replace_post(&merged, expected).await?;
        } else {
            self.store.update_post(&merged).await?;
        }

        log::debug!("Applied {} media to post {}", batch.len(), post_id);
        Ok(Some(merged))
    }

    async fn on_post_transfer_finished(&mut self, post_id: PostId, result: AppResult<()>) {
        let uploaded = safe_state_update(&self.book, "finish post", |book| {
            book.posts.finish(post_id, result.is_ok())
        });
        let Some(uploaded) = uploaded else {
            log::warn!("Dropping upload result for unknown post {}", post_id);
            return;
        };

        let latest = match self.store.get_post(post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => uploaded.clone(),
            Err(e) => {
                log::warn!("Could not reload post {}: {}", post_id, e);
                uploaded.clone()
            }
        };

        match result {
            Ok(()) => {
                log::info!("Post {} uploaded", post_id);
                let mut post = latest;
                if post.last_modified == uploaded.last_modified {
                    post.mark_uploaded();
                } else {
                    // Edited during the upload; the server has an older copy.
                    post.is_local_draft = false;
                    post.is_locally_changed = true;
                }
                self.persist_post(&post).await;
                notify_post_succeeded(self.notifier.as_ref(), post_id);
            }
            Err(e) => {
                log::error!("Post {} upload failed: {}", post_id, e);
                let mut post = latest;
                post.revert_to_local_draft();
                self.persist_post(&post).await;
                notify_post_failed(self.notifier.as_ref(), post_id, &e);
            }
        }

        self.merge_if_eligible(post_id).await;
    }

    async fn persist_post(&self, post: &Post) {
        if let Err(e) = self.store.update_post(post).await {
            log::error!("Failed to persist post {}: {}", post.id, e);
        }
    }

    /// Count a failed merge; true while the retry budget lasts.
    fn note_merge_failure(&mut self, post_id: PostId) -> bool {
        let attempts = self.merge_attempts.entry(post_id).or_insert(0);
        *attempts += 1;
        *attempts <= self.settings.retry.max_retries
    }

    fn schedule(&self, event: CoordinatorEvent) {
        let events = self.events.clone();
        let delay = self.settings.merge_retry_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn start_transfers(&self) {
        let (media, posts) = safe_state_update(&self.book, "start transfers", |book| {
            (book.media.take_startable(), book.posts.take_startable())
        });

        for item in media {
            self.spawn_media_upload(item);
        }
        for post in posts {
            log::info!("Uploading post {}", post.id);
            notify_post_started(self.notifier.as_ref(), &post);
            self.spawn_post_upload(post);
        }
    }

    fn spawn_media_upload(&self, item: MediaItem) {
        let transport = Arc::clone(&self.transport);
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let retry = self.settings.retry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = perform_media_upload(
                transport.as_ref(),
                &retry,
                store.as_ref(),
                notifier.as_ref(),
                &item,
            )
            .await;
            let _ = events.send(CoordinatorEvent::MediaTransferFinished {
                media_id: item.id,
                result,
            });
        });
    }

    fn spawn_post_upload(&self, post: Post) {
        let transport = Arc::clone(&self.transport);
        let retry = self.settings.retry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let label = format!("post {}", post.id);
            let transport = transport.as_ref();
            let post_ref = &post;
            let result =
                with_backoff(&retry, &label, move || transport.upload_post(post_ref)).await;
            let _ = events.send(CoordinatorEvent::PostTransferFinished {
                post_id: post.id,
                result,
            });
        });
    }

    async fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        log::info!("Upload coordinator shutting down");

        let (media, posts) = safe_state_update(&self.book, "begin shutdown", |book| {
            book.accepting = false;
            (book.media.cancel_all_queued(), book.posts.cancel_all_queued())
        });

        for post_id in posts {
            log::info!("Cancelled queued upload of post {} for shutdown", post_id);
            notify_post_cancelled(self.notifier.as_ref(), post_id);
        }
        for item in media {
            self.on_media_cancelled(item).await;
        }

        self.shutdown_reply = Some(reply);
    }

    fn transfers_settled(&self) -> bool {
        safe_state_read(&self.book, "transfers settled", |book| {
            book.media.in_flight() == 0 && book.posts.uploading_count() == 0
        })
    }

    /// Merge every remaining buffered batch, retrying conflicts.
    async fn final_drain(&mut self) {
        let posts = safe_state_read(&self.book, "final drain", |book| {
            book.completed.pending_posts()
        });
        let attempts = self.settings.retry.max_retries + 1;

        for post_id in posts {
            for attempt in 1..=attempts {
                match self.drain_and_apply(post_id, None).await {
                    Ok(Some(_)) => {
                        log::info!("Final merge for post {} applied", post_id);
                        break;
                    }
                    Ok(None) => {
                        log::warn!(
                            "Completed media reference unknown post {}; dropping them",
                            post_id
                        );
                        break;
                    }
                    Err(e) if attempt < attempts => {
                        log::warn!(
                            "Final merge for post {} failed (attempt {}): {}",
                            post_id,
                            attempt,
                            e
                        );
                        sleep(self.settings.merge_retry_delay).await;
                    }
                    Err(e) => {
                        log::error!("Completed media for post {} left unmerged: {}", post_id, e);
                        notify_merge_conflict(self.notifier.as_ref(), post_id, &e);
                    }
                }
            }
        }
    }

    fn publish_idle(&self) {
        let merges_scheduled = !self.scheduled_merges.is_empty();
        let idle = &self.idle;
        safe_state_read(&self.book, "publish idle", |book| {
            idle.send_replace(book.is_idle() && !merges_scheduled);
        });
    }
}
