// Main uploader module - coordinates media and post uploads
//
// Media transfers run on a worker pool; posts wait for their media, get the
// final URLs merged into their content and are then uploaded themselves.

pub mod completed_media;
pub mod coordinator;
pub mod dependency_tracker;
pub mod media_upload_manager;
pub mod post_upload_manager;
pub mod progress_tracker;
pub mod retry;
pub mod transport;

pub use completed_media::{apply_completed_media, CompletedMediaAggregator};
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorSettings, UploadSnapshot};
pub use dependency_tracker::{EnqueueDecision, PostDependencyTracker};
pub use media_upload_manager::MediaUploadManager;
pub use post_upload_manager::PostUploadManager;
pub use progress_tracker::{
    ChannelNotifier, LogNotifier, NotificationDetail, NotificationSink, NotificationTarget,
    ReasonCode, UploadNotification, UploadPhase,
};
pub use retry::{with_backoff, RetryConfig};
pub use transport::{HttpTransport, UploadTransport};
