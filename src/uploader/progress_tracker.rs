//! Upload notifications for whatever renders progress to the user.
//!
//! The core only emits; sinks must never block the caller.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::AppError;
use crate::models::{MediaId, MediaItem, Post, PostId, UploadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum NotificationTarget {
    Post(PostId),
    Media(MediaId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Started,
    Progress,
    Succeeded,
    Failed,
    Cancelled,
    Warning,
}

/// Machine-readable reason attached to failures and warnings, enough to
/// drive a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    TransientNetwork,
    PermanentMedia,
    UnresolvedMedia,
    RewriteConflict,
    PostUpload,
    Cancelled,
}

impl ReasonCode {
    pub fn for_error(error: &AppError) -> Self {
        match error {
            AppError::Network(_) | AppError::TransientNetwork { .. } => {
                ReasonCode::TransientNetwork
            }
            AppError::RewriteConflict { .. } => ReasonCode::RewriteConflict,
            AppError::PostUpload { .. } => ReasonCode::PostUpload,
            AppError::Cancelled { .. } => ReasonCode::Cancelled,
            _ => ReasonCode::PermanentMedia,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationDetail {
    pub reason: Option<ReasonCode>,
    pub media_id: Option<MediaId>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadNotification {
    pub target: NotificationTarget,
    pub phase: UploadPhase,
    pub detail: NotificationDetail,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: UploadNotification);
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: UploadNotification) {
        let detail = &notification.detail;
        match notification.phase {
            UploadPhase::Failed => log::error!(
                "{:?} failed ({:?}): {}",
                notification.target,
                detail.reason,
                detail.message.as_deref().unwrap_or("no detail")
            ),
            UploadPhase::Warning => log::warn!(
                "{:?} warning ({:?}, media {:?}): {}",
                notification.target,
                detail.reason,
                detail.media_id,
                detail.message.as_deref().unwrap_or("no detail")
            ),
            phase => log::info!("{:?} {:?}", notification.target, phase),
        }
    }
}

/// Forwards notifications over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<UploadNotification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: UploadNotification) {
        if self.sender.send(notification).is_err() {
            log::debug!("Notification receiver dropped (non-critical)");
        }
    }
}

fn emit(
    sink: &dyn NotificationSink,
    target: NotificationTarget,
    phase: UploadPhase,
    detail: NotificationDetail,
) {
    sink.notify(UploadNotification {
        target,
        phase,
        detail,
    });
}

pub fn notify_media_started(sink: &dyn NotificationSink, media: &MediaItem) {
    emit(
        sink,
        NotificationTarget::Media(media.id),
        UploadPhase::Started,
        NotificationDetail::default(),
    );
}

pub fn notify_media_finished(
    sink: &dyn NotificationSink,
    media: &MediaItem,
    outcome: UploadOutcome,
    error: Option<&AppError>,
) {
    let target = NotificationTarget::Media(media.id);
    match outcome {
        UploadOutcome::Success => emit(
            sink,
            target,
            UploadPhase::Succeeded,
            NotificationDetail {
                message: media.remote_url.clone(),
                ..Default::default()
            },
        ),
        UploadOutcome::Failure => emit(
            sink,
            target,
            UploadPhase::Failed,
            NotificationDetail {
                reason: Some(error.map_or(ReasonCode::PermanentMedia, ReasonCode::for_error)),
                media_id: Some(media.id),
                message: error.map(|e| e.to_string()),
            },
        ),
        UploadOutcome::Cancelled => emit(
            sink,
            target,
            UploadPhase::Cancelled,
            NotificationDetail {
                reason: Some(ReasonCode::Cancelled),
                media_id: Some(media.id),
                message: error.map(|e| e.to_string()),
            },
        ),
    }
}

/// A post is still waiting on `remaining` media uploads.
pub fn notify_post_waiting(sink: &dyn NotificationSink, post_id: PostId, remaining: usize) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Progress,
        NotificationDetail {
            message: Some(format!("waiting for {} media upload(s)", remaining)),
            ..Default::default()
        },
    );
}

/// A post is going out with a placeholder that will never resolve.
pub fn notify_post_unresolved_media(
    sink: &dyn NotificationSink,
    post_id: PostId,
    media_id: MediaId,
) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Warning,
        NotificationDetail {
            reason: Some(ReasonCode::UnresolvedMedia),
            media_id: Some(media_id),
            message: Some(format!(
                "media {} did not upload; placeholder left in content",
                media_id
            )),
        },
    );
}

pub fn notify_post_started(sink: &dyn NotificationSink, post: &Post) {
    emit(
        sink,
        NotificationTarget::Post(post.id),
        UploadPhase::Started,
        NotificationDetail::default(),
    );
}

pub fn notify_post_succeeded(sink: &dyn NotificationSink, post_id: PostId) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Succeeded,
        NotificationDetail::default(),
    );
}

pub fn notify_post_failed(sink: &dyn NotificationSink, post_id: PostId, error: &AppError) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Failed,
        NotificationDetail {
            reason: Some(ReasonCode::PostUpload),
            media_id: None,
            message: Some(error.to_string()),
        },
    );
}

pub fn notify_post_cancelled(sink: &dyn NotificationSink, post_id: PostId) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Cancelled,
        NotificationDetail {
            reason: Some(ReasonCode::Cancelled),
            ..Default::default()
        },
    );
}

pub fn notify_merge_conflict(sink: &dyn NotificationSink, post_id: PostId, error: &AppError) {
    emit(
        sink,
        NotificationTarget::Post(post_id),
        UploadPhase::Warning,
        NotificationDetail {
            reason: Some(ReasonCode::RewriteConflict),
            media_id: None,
            message: Some(error.to_string()),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_reason_and_media_id() {
        let (sink, mut rx) = ChannelNotifier::new();
        let media = MediaItem::new(4, Some(1), "a.png");
        let error = AppError::transient("HTTP 503");

        notify_media_finished(&sink, &media, UploadOutcome::Failure, Some(&error));

        let n = rx.try_recv().unwrap();
        assert_eq!(n.target, NotificationTarget::Media(4));
        assert_eq!(n.phase, UploadPhase::Failed);
        assert_eq!(n.detail.reason, Some(ReasonCode::TransientNetwork));
        assert_eq!(n.detail.media_id, Some(4));
    }

    #[test]
    fn test_closed_receiver_does_not_panic() {
        let (sink, rx) = ChannelNotifier::new();
        drop(rx);
        notify_post_succeeded(&sink, 9);
    }

    #[test]
    fn test_notification_serializes_for_ui() {
        let n = UploadNotification {
            target: NotificationTarget::Post(3),
            phase: UploadPhase::Warning,
            detail: NotificationDetail {
                reason: Some(ReasonCode::UnresolvedMedia),
                media_id: Some(8),
                message: None,
            },
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["target"]["kind"], "post");
        assert_eq!(json["target"]["id"], 3);
        assert_eq!(json["phase"], "warning");
        assert_eq!(json["detail"]["reason"], "unresolved_media");
    }
}
