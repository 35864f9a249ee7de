use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    join_url, object_name, sniff_image_format, MediaConfig, ObjectStore, TransformOptions,
    UploadError,
};

/// Uploads with `PUT {endpoint}/{bucket}/{folder}/{name}`.
///
/// If the store answers with `{"url": ...}` that URL is returned, otherwise
/// the object is addressed below `public_base_url`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    public_base_url: String,
    access_key: Option<String>,
    secret_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

impl HttpObjectStore {
    pub fn new(cfg: &MediaConfig) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.clone(),
            public_base_url: cfg.public_base_url.clone(),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
        })
    }

    fn object_url(&self, folder: &str, name: &str) -> String {
        join_url(&format!("{}/{}", self.endpoint, self.bucket), folder, name)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        bytes: &[u8],
        folder: &str,
        transform: &TransformOptions,
    ) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }

        let name = object_name(bytes);
        let content_type = sniff_image_format(bytes)
            .map(|format| format.content_type())
            .unwrap_or("application/octet-stream");

        let mut request = self
            .client
            .put(self.object_url(folder, &name))
            .query(&transform.query_pairs())
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        if let Some(access_key) = &self.access_key {
            request = request.basic_auth(access_key, self.secret_key.as_ref());
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                UploadError::Timeout(std::time::Duration::ZERO)
            } else {
                UploadError::Unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }

        let fallback = join_url(&self.public_base_url, folder, &name);
        if status == StatusCode::NO_CONTENT {
            return Ok(fallback);
        }
        let url = response
            .json::<UploadResponse>()
            .await
            .ok()
            .and_then(|body| body.url)
            .unwrap_or(fallback);

        debug!(folder, name = %name, size = bytes.len(), "uploaded blob to object store");
        Ok(url)
    }
}
