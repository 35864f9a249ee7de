//! Object store adapters for message attachments and profile pictures.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod local;

pub use http::HttpObjectStore;
pub use local::LocalObjectStore;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaBackend {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConfig {
    pub backend: MediaBackend,
    /// Directory the local backend writes into.
    pub base_dir: String,
    /// Prefix for the permanent URLs handed back to clients.
    pub public_base_url: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            backend: MediaBackend::Local,
            base_dir: "data/media".to_string(),
            public_base_url: "http://localhost:8080/media".to_string(),
            endpoint: String::new(),
            bucket: String::new(),
            access_key: None,
            secret_key: None,
        }
    }
}

pub fn validate_config(cfg: &MediaConfig) -> Result<()> {
    if cfg.public_base_url.trim().is_empty() {
        anyhow::bail!("media.public_base_url must be set");
    }
    match cfg.backend {
        MediaBackend::Local => {
            if cfg.base_dir.trim().is_empty() {
                anyhow::bail!("media.base_dir must be set for the local backend");
            }
        }
        MediaBackend::Http => {
            if cfg.endpoint.is_empty() || cfg.bucket.is_empty() {
                anyhow::bail!("media configuration is incomplete");
            }
        }
    }
    Ok(())
}

/// Build the configured store.
pub async fn object_store_from_config(cfg: &MediaConfig) -> Result<Arc<dyn ObjectStore>> {
    validate_config(cfg)?;
    let store: Arc<dyn ObjectStore> = match cfg.backend {
        MediaBackend::Local => {
            Arc::new(LocalObjectStore::new(&cfg.base_dir, &cfg.public_base_url).await?)
        }
        MediaBackend::Http => Arc::new(HttpObjectStore::new(cfg)?),
    };
    Ok(store)
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store rejected upload with status {status}")]
    Rejected { status: u16 },
    #[error("object store i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Empty | UploadError::TooLarge { .. } => false,
            UploadError::Rejected { status } => *status >= 500 || *status == 429,
            UploadError::Timeout(_) | UploadError::Unavailable(_) | UploadError::Io(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    Fill,
    Limit,
}

impl CropMode {
    fn as_str(&self) -> &'static str {
        match self {
            CropMode::Fill => "fill",
            CropMode::Limit => "limit",
        }
    }
}

/// Hints passed to the store; backends that cannot transform ignore them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: Option<CropMode>,
}

impl TransformOptions {
    pub fn none() -> Self {
        Self::default()
    }

    /// Bounded box for chat images.
    pub fn chat_attachment() -> Self {
        Self {
            width: Some(2048),
            height: Some(2048),
            crop: Some(CropMode::Limit),
        }
    }

    /// Square crop for avatars.
    pub fn avatar() -> Self {
        Self {
            width: Some(256),
            height: Some(256),
            crop: Some(CropMode::Fill),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(width) = self.width {
            pairs.push(("w", width.to_string()));
        }
        if let Some(height) = self.height {
            pairs.push(("h", height.to_string()));
        }
        if let Some(crop) = self.crop {
            pairs.push(("crop", crop.as_str().to_string()));
        }
        pairs
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `folder` and return a permanent URL.
    async fn upload(
        &self,
        bytes: &[u8],
        folder: &str,
        transform: &TransformOptions,
    ) -> Result<String, UploadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::WebP => "webp",
        }
    }
}

/// Detect the accepted image formats from their magic bytes.
pub fn sniff_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(ImageFormat::WebP)
    } else {
        None
    }
}

/// Object name for a new blob: random id plus the sniffed extension.
pub(crate) fn object_name(bytes: &[u8]) -> String {
    let extension = sniff_image_format(bytes)
        .map(|format| format.extension())
        .unwrap_or("bin");
    format!("{}.{extension}", uuid::Uuid::new_v4())
}

pub(crate) fn join_url(base: &str, folder: &str, name: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), folder.trim_matches('/'), name)
}
