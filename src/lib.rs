//! Coordinates media uploads and the posts that reference them.
//!
//! A post is held until every media it owns has left the QUEUED/UPLOADING
//! states, the final media URLs are merged into its content exactly once, and
//! only then is the post uploaded. See [`uploader::Coordinator`].

pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod rewriter;
pub mod store;
pub mod uploader;

pub use errors::{AppError, AppResult};
pub use models::{
    MediaId, MediaItem, MediaUploadState, Post, PostId, PostUploadState, UploadOutcome,
};
pub use rewriter::{PlaceholderRewriter, PostContentRewriter};
pub use store::{InMemoryStore, MediaStore, PostStore, UploadStore};
pub use uploader::{Coordinator, CoordinatorHandle, CoordinatorSettings};
