use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::models::{MediaId, PostId};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transient network error: {reason}")]
    TransientNetwork {
        reason: String,
        /// Server-requested wait before the next attempt.
        retry_after: Option<Duration>,
    },

    #[error("Media {media_id} failed permanently: {reason}")]
    PermanentMedia { media_id: MediaId, reason: String },

    #[error("Post {post_id} changed while applying media: {reason}")]
    RewriteConflict { post_id: PostId, reason: String },

    #[error("Post {post_id} upload failed: {reason}")]
    PostUpload { post_id: PostId, reason: String },

    #[error("Upload cancelled: {what}")]
    Cancelled { what: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::transient_after(reason, None)
    }

    pub fn transient_after(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::TransientNetwork {
            reason: reason.into(),
            retry_after,
        }
    }

    pub fn permanent_media(media_id: MediaId, reason: impl Into<String>) -> Self {
        Self::PermanentMedia {
            media_id,
            reason: reason.into(),
        }
    }

    pub fn rewrite_conflict(post_id: PostId, reason: impl Into<String>) -> Self {
        Self::RewriteConflict {
            post_id,
            reason: reason.into(),
        }
    }

    pub fn post_upload(post_id: PostId, reason: impl Into<String>) -> Self {
        Self::PostUpload {
            post_id,
            reason: reason.into(),
        }
    }

    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled { what: what.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Network(_) | AppError::TransientNetwork { .. }
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::PermanentMedia { .. }
                | AppError::PostUpload { .. }
                | AppError::Validation { .. }
                | AppError::NotFound { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::RewriteConflict { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::TransientNetwork { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Mutate shared upload state, recovering the guard if a previous holder panicked.
pub fn safe_state_update<T, R, F>(state: &Mutex<T>, operation: &str, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    let mut guard = match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!(
                "Upload state lock poisoned during {} (recovering)",
                operation
            );
            poisoned.into_inner()
        }
    };
    f(&mut guard)
}

pub fn safe_state_read<T, R, F>(state: &Mutex<T>, operation: &str, f: F) -> R
where
    F: FnOnce(&T) -> R,
{
    let guard = match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!(
                "Upload state lock poisoned during {} (recovering)",
                operation
            );
            poisoned.into_inner()
        }
    };
    f(&guard)
}
