use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{join_url, object_name, ObjectStore, TransformOptions, UploadError};

/// Writes blobs below a directory and serves them from `public_base_url`.
/// Transform hints are not applied.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub async fn new(
        base_dir: impl AsRef<Path>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, UploadError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            public_base_url: public_base_url.into(),
        })
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf, UploadError> {
        let mut path = self.base_dir.clone();
        for component in Path::new(folder).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(UploadError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("folder '{folder}' escapes the media directory"),
                    )))
                }
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        bytes: &[u8],
        folder: &str,
        transform: &TransformOptions,
    ) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        let dir = self.folder_path(folder)?;
        fs::create_dir_all(&dir).await?;

        let name = object_name(bytes);
        fs::write(dir.join(&name), bytes).await?;

        debug!(folder, name = %name, size = bytes.len(), ?transform, "stored blob locally");
        Ok(join_url(&self.public_base_url, folder, &name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_blob_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost/media")
            .await
            .unwrap();

        let png = b"\x89PNG\r\n\x1a\nrest-of-image";
        let url = store
            .upload(png, "chat_messages", &TransformOptions::none())
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost/media/chat_messages/"));
        assert!(url.ends_with(".png"));
        let name = url.rsplit('/').next().unwrap();
        let stored = std::fs::read(dir.path().join("chat_messages").join(name)).unwrap();
        assert_eq!(stored, png);
    }

    #[tokio::test]
    async fn rejects_empty_payload_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost/media")
            .await
            .unwrap();

        assert!(matches!(
            store.upload(b"", "chat_messages", &TransformOptions::none()).await,
            Err(UploadError::Empty)
        ));
        assert!(store
            .upload(b"GIF89a", "../outside", &TransformOptions::none())
            .await
            .is_err());
    }
}
