//! 本地磁盘上的语音文件存储。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use application::blob::{BlobError, BlobStore, BlobUpload, StoredBlob};
use async_trait::async_trait;
use config::StorageConfig;
use tracing::{debug, info};
use uuid::Uuid;

/// 统一保存为 mp3，对外以 `audio/mpeg` 提供。
pub const STORED_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    max_bytes: usize,
}

impl LocalBlobStore {
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        max_bytes: usize,
    ) -> Result<Self, BlobError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| BlobError::storage(format!("create {}: {err}", root.display())))?;
        Ok(Self {
            root,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self, BlobError> {
        Self::new(
            config.blob_dir.clone(),
            config.public_base_url.clone(),
            config.max_upload_bytes,
        )
        .await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, blob_ref: &str) -> Result<PathBuf, BlobError> {
        let valid = !blob_ref.is_empty()
            && !blob_ref.contains(['/', '\\'])
            && blob_ref != "."
            && blob_ref != "..";
        if !valid {
            return Err(BlobError::storage(format!("invalid blob name `{blob_ref}`")));
        }
        Ok(self.root.join(blob_ref))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        if !upload.mime_type.starts_with("audio/") {
            return Err(BlobError::UnsupportedMediaType(upload.mime_type));
        }
        if upload.bytes.is_empty() {
            return Err(BlobError::Empty);
        }
        if upload.bytes.len() > self.max_bytes {
            return Err(BlobError::TooLarge {
                size: upload.bytes.len(),
                limit: self.max_bytes,
            });
        }

        let blob_ref = format!("{}_{}.mp3", upload.owner, Uuid::new_v4());
        let path = self.path_for(&blob_ref)?;
        tokio::fs::write(&path, &upload.bytes)
            .await
            .map_err(|err| BlobError::storage(format!("write {}: {err}", path.display())))?;

        info!(
            owner = %upload.owner,
            blob = %blob_ref,
            size = upload.bytes.len(),
            "voice blob stored"
        );
        Ok(StoredBlob {
            url: format!("{}/{}", self.public_base_url, blob_ref),
            size: upload.bytes.len() as u64,
            blob_ref,
        })
    }

    async fn delete(&self, blob_ref: &str) -> Result<(), BlobError> {
        let path = self.path_for(blob_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(blob = blob_ref, "voice blob deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::storage(format!(
                "delete {}: {err}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    async fn store(dir: &tempfile::TempDir) -> LocalBlobStore {
        LocalBlobStore::new(dir.path().join("uploads"), "http://localhost:8080/uploads/", 16)
            .await
            .unwrap()
    }

    fn upload(owner: UserId, bytes: &[u8], mime_type: &str) -> BlobUpload {
        BlobUpload {
            owner,
            bytes: bytes.to_vec(),
            mime_type: mime_type.to_string(),
        }
    }

    #[tokio::test]
    async fn stores_audio_under_owner_prefixed_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let owner = UserId::generate();

        let stored = store.upload(upload(owner, b"ID3abc", "audio/webm")).await.unwrap();

        assert!(stored.blob_ref.starts_with(&format!("{owner}_")));
        assert!(stored.blob_ref.ends_with(".mp3"));
        assert_eq!(
            stored.url,
            format!("http://localhost:8080/uploads/{}", stored.blob_ref)
        );
        assert_eq!(stored.size, 6);
        let written = tokio::fs::read(store.root().join(&stored.blob_ref)).await.unwrap();
        assert_eq!(written, b"ID3abc");
    }

    #[tokio::test]
    async fn rejects_non_audio_empty_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let owner = UserId::generate();

        assert!(matches!(
            store.upload(upload(owner, b"png", "image/png")).await,
            Err(BlobError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            store.upload(upload(owner, b"", "audio/mpeg")).await,
            Err(BlobError::Empty)
        ));
        assert!(matches!(
            store.upload(upload(owner, &[0u8; 17], "audio/mpeg")).await,
            Err(BlobError::TooLarge { size: 17, limit: 16 })
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let stored = store
            .upload(upload(UserId::generate(), b"abc", "audio/mpeg"))
            .await
            .unwrap();

        store.delete(&stored.blob_ref).await.unwrap();
        store.delete(&stored.blob_ref).await.unwrap();
        assert!(!store.root().join(&stored.blob_ref).exists());
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        assert!(store.delete("../secret").await.is_err());
        assert!(store.delete("..").await.is_err());
    }
}
