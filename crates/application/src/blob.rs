//! 语音文件的 blob 存储抽象。

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

/// 一次上传请求。
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub owner: UserId,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// 上传完成后的存储位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub blob_ref: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),
    #[error("audio file is empty")]
    Empty,
    #[error("audio file too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("blob storage failure: {0}")]
    Storage(String),
}

impl BlobError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// 由调用方输入导致、可以直接提示给用户的错误。
    pub fn is_client_error(&self) -> bool {
        !matches!(self, BlobError::Storage(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError>;
    async fn delete(&self, blob_ref: &str) -> Result<(), BlobError>;
}
