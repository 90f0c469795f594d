use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

pub type PostId = i64;
pub type MediaId = i64;

/// Upload lifecycle of a single media item.
///
/// `Queued -> Uploading -> {Completed, Failed, Cancelled}` is the normal path;
/// a queued item that never started may also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaUploadState {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl MediaUploadState {
    pub fn is_pending(self) -> bool {
        matches!(self, MediaUploadState::Queued | MediaUploadState::Uploading)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    pub fn can_transition_to(self, next: MediaUploadState) -> bool {
        use MediaUploadState::*;
        matches!(
            (self, next),
            (Queued, Uploading) | (Queued, Cancelled) | (Uploading, Completed | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaUploadState::Queued => "QUEUED",
            MediaUploadState::Uploading => "UPLOADING",
            MediaUploadState::Completed => "COMPLETED",
            MediaUploadState::Failed => "FAILED",
            MediaUploadState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for MediaUploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaUploadState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(MediaUploadState::Queued),
            "UPLOADING" => Ok(MediaUploadState::Uploading),
            "COMPLETED" => Ok(MediaUploadState::Completed),
            "FAILED" => Ok(MediaUploadState::Failed),
            "CANCELLED" => Ok(MediaUploadState::Cancelled),
            other => Err(AppError::validation(
                "upload_state",
                &format!("Unknown media upload state '{}'", other),
            )),
        }
    }
}

/// How a media transfer ended, as reported on the completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Failure,
    Cancelled,
}

impl UploadOutcome {
    pub fn terminal_state(self) -> MediaUploadState {
        match self {
            UploadOutcome::Success => MediaUploadState::Completed,
            UploadOutcome::Failure => MediaUploadState::Failed,
            UploadOutcome::Cancelled => MediaUploadState::Cancelled,
        }
    }
}

fn default_upload_state() -> MediaUploadState {
    MediaUploadState::Queued
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaId,
    /// Owning post; `None` for media not attached to any post.
    #[serde(default)]
    pub local_post_id: Option<PostId>,
    pub source_uri: String,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_upload_state")]
    pub upload_state: MediaUploadState,
}

impl MediaItem {
    pub fn new(id: MediaId, local_post_id: Option<PostId>, source_uri: impl Into<String>) -> Self {
        Self {
            id,
            local_post_id,
            source_uri: source_uri.into(),
            remote_url: None,
            upload_state: MediaUploadState::Queued,
        }
    }

    pub fn belongs_to(&self, post_id: PostId) -> bool {
        self.local_post_id == Some(post_id)
    }

    /// Still QUEUED or UPLOADING on behalf of `post_id`.
    pub fn is_pending_for(&self, post_id: PostId) -> bool {
        self.belongs_to(post_id) && self.upload_state.is_pending()
    }
}

/// Persisted stores encode "no post" as 0.
pub fn post_id_from_raw(raw: i64) -> Option<PostId> {
    if raw == 0 {
        None
    } else {
        Some(raw)
    }
}

pub fn post_id_to_raw(post_id: Option<PostId>) -> i64 {
    post_id.unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub content: String,
    #[serde(default)]
    pub is_local_draft: bool,
    #[serde(default)]
    pub is_locally_changed: bool,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
}

impl Post {
    pub fn new(id: PostId, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            is_local_draft: true,
            is_locally_changed: false,
            last_modified: Utc::now(),
        }
    }

    /// Record a local content edit. Drafts that never reached the server stay
    /// plain drafts; published posts are flagged as locally changed.
    pub fn mark_content_changed(&mut self) {
        if !self.is_local_draft {
            self.is_locally_changed = true;
        }
        self.last_modified = Utc::now();
    }

    /// Put a post whose upload failed back into an editable local state.
    /// Content is left as is, including any unresolved placeholders.
    pub fn revert_to_local_draft(&mut self) {
        self.is_locally_changed = true;
        self.last_modified = Utc::now();
    }

    pub fn mark_uploaded(&mut self) {
        self.is_local_draft = false;
        self.is_locally_changed = false;
    }
}

/// Post-level pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostUploadState {
    New,
    WaitingForMedia,
    Ready,
    Uploading,
    Done,
    Failed,
    Cancelled,
}

impl PostUploadState {
    pub fn is_uploading_or_queued(self) -> bool {
        matches!(
            self,
            PostUploadState::WaitingForMedia | PostUploadState::Ready | PostUploadState::Uploading
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PostUploadState::Done | PostUploadState::Failed | PostUploadState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: PostUploadState) -> bool {
        use PostUploadState::*;
        matches!(
            (self, next),
            (New, WaitingForMedia | Ready | Cancelled)
                | (WaitingForMedia, Ready | Cancelled)
                | (Ready, Uploading | Cancelled)
                | (Uploading, Done | Failed)
        )
    }
}

impl fmt::Display for PostUploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PostUploadState::New => "NEW",
            PostUploadState::WaitingForMedia => "WAITING_FOR_MEDIA",
            PostUploadState::Ready => "READY",
            PostUploadState::Uploading => "UPLOADING",
            PostUploadState::Done => "DONE",
            PostUploadState::Failed => "FAILED",
            PostUploadState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_state_paths() {
        use MediaUploadState::*;
        assert!(Queued.can_transition_to(Uploading));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Uploading));
    }

    #[test]
    fn test_media_state_text_round_trip() {
        for state in [
            MediaUploadState::Queued,
            MediaUploadState::Uploading,
            MediaUploadState::Completed,
            MediaUploadState::Failed,
            MediaUploadState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<MediaUploadState>().unwrap(), state);
        }
        assert!("uploading".parse::<MediaUploadState>().is_err());
    }

    #[test]
    fn test_queued_or_uploading_states() {
        use PostUploadState::*;
        let queued: Vec<_> = [New, WaitingForMedia, Ready, Uploading, Done, Failed, Cancelled]
            .into_iter()
            .filter(|s| s.is_uploading_or_queued())
            .collect();
        assert_eq!(queued, vec![WaitingForMedia, Ready, Uploading]);
        assert!(!Uploading.can_transition_to(Cancelled));
        assert!(WaitingForMedia.can_transition_to(Cancelled));
    }

    #[test]
    fn test_content_change_flags() {
        let mut draft = Post::new(1, "text");
        draft.mark_content_changed();
        assert!(!draft.is_locally_changed);

        let mut published = Post::new(2, "text");
        published.is_local_draft = false;
        published.mark_content_changed();
        assert!(published.is_locally_changed);
    }

    #[test]
    fn test_unattached_post_id_encoding() {
        assert_eq!(post_id_from_raw(0), None);
        assert_eq!(post_id_from_raw(12), Some(12));
        assert_eq!(post_id_to_raw(None), 0);
    }
}
