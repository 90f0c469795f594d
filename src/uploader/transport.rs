use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{multipart, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::{MediaItem, Post};

/// Byte-level transfer of media and post content to the remote site.
///
/// Implementations make a single attempt; retries belong to the caller.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Upload the media file and return its final remote URL.
    async fn upload_media(&self, media: &MediaItem) -> AppResult<String>;

    async fn upload_post(&self, post: &Post) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct PostPayload<'a> {
    id: i64,
    content: &'a str,
}

/// REST transport: `POST {base}/media` (multipart) and `POST {base}/posts/{id}` (JSON).
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn build_media_form(&self, media: &MediaItem) -> AppResult<multipart::Form> {
        let path = local_path(&media.source_uri);
        let file_contents = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::permanent_media(
                    media.id,
                    format!("source file not found: {}", path),
                ));
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let filename = Path::new(path)
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let part = multipart::Part::bytes(file_contents)
            .file_name(filename)
            .mime_str(mime_type_for(path))?;

        let mut form = multipart::Form::new().part("file", part);
        if let Some(post_id) = media.local_post_id {
            form = form.text("post_id", post_id.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload_media(&self, media: &MediaItem) -> AppResult<String> {
        let form = self.build_media_form(media).await?;
        let url = format!("{}/media", self.base_url);
        log::debug!("Uploading media {} to {}", media.id, url);

        let response = self.client.post(&url).multipart(form).send().await?;
        let status = response.status();

        if status.is_success() {
            let body: MediaUploadResponse = response.json().await?;
            return Ok(body.url);
        }

        let headers = response.headers().clone();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status, &headers, &error_text, |reason| {
            AppError::permanent_media(media.id, reason)
        }))
    }

    async fn upload_post(&self, post: &Post) -> AppResult<()> {
        let url = format!("{}/posts/{}", self.base_url, post.id);
        log::debug!("Uploading post {} to {}", post.id, url);

        let response = self
            .client
            .post(&url)
            .json(&PostPayload {
                id: post.id,
                content: &post.content,
            })
            .send()
            .await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let headers = response.headers().clone();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status, &headers, &error_text, |reason| {
            AppError::post_upload(post.id, reason)
        }))
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Map a non-success status to a transient error or to the caller's
/// permanent error. A 429 keeps the server's requested wait.
pub fn classify_status<F>(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    permanent: F,
) -> AppError
where
    F: FnOnce(String) -> AppError,
{
    let snippet: String = body.chars().take(300).collect();
    let reason = format!("HTTP {}: {}", status, snippet);
    if !should_retry_status(status) {
        return permanent(reason);
    }

    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        extract_retry_after(headers, body)
    } else {
        None
    };
    AppError::transient_after(reason, retry_after)
}

/// Seconds from the `Retry-After` header, or a `retry_after` field in a JSON body.
fn extract_retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());

    let seconds = from_header.or_else(|| {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()?
            .get("retry_after")?
            .as_f64()
    })?;

    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

fn local_path(source_uri: &str) -> &str {
    source_uri.strip_prefix("file://").unwrap_or(source_uri)
}

fn mime_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}
