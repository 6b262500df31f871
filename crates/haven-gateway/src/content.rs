//! Attachment uploads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use haven_room::adapters::ContentStore;
use haven_room::error::UploadError;
use haven_types::api::UploadResponse;

/// Keeps uploads in memory under `memory://content/<id>` URLs.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    objects: Arc<RwLock<HashMap<String, (Bytes, String)>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every upload answers 503.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub async fn get(&self, url: &str) -> Option<(Bytes, String)> {
        self.objects.read().await.get(url).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upload(&self, bytes: Bytes, content_type: &str) -> Result<String, UploadError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(UploadError::Status { status: 503 });
        }
        let url = format!("memory://content/{}", Uuid::new_v4());
        debug!("Stored {} bytes ({}) at {}", bytes.len(), content_type, url);
        self.objects
            .write()
            .await
            .insert(url.clone(), (bytes, content_type.to_string()));
        Ok(url)
    }
}

/// Uploads to a content server: `POST {base}/uploads` with the raw bytes,
/// answered by `{"url": "..."}`.
#[derive(Clone)]
pub struct HttpContentStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpContentStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every upload.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn upload(&self, bytes: Bytes, content_type: &str) -> Result<String, UploadError> {
        let mut req = self
            .client
            .post(format!("{}/uploads", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!("Upload to {} failed ({})", self.base_url, status);
            return Err(UploadError::Status {
                status: status.as_u16(),
            });
        }

        let body: UploadResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        if body.url.is_empty() {
            return Err(UploadError::MissingUrl);
        }
        Ok(body.url)
    }
}
