//! Remote storage used for the shared participant list and for snapshots.
//!
//! The provider has no partial-update primitive: a file is always replaced
//! as a whole, so every change to the participant list re-uploads the full
//! collection.

pub mod yandex;

use async_trait::async_trait;
use bytes::Bytes;

pub use yandex::YandexDisk;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("remote storage returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("remote storage request timed out")]
    Timeout,

    #[error("remote storage request failed: {0}")]
    Transport(String),

    #[error("unexpected remote storage response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderStatus {
    Created,
    AlreadyExists,
}

/// Operations are bounded by the implementation's timeout and are safe to
/// repeat; uploads with `overwrite` replace the previous content.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn exists(&self, token: &str, path: &str) -> Result<bool, RemoteError>;

    async fn create_folder(&self, token: &str, path: &str) -> Result<FolderStatus, RemoteError>;

    async fn upload_handle(
        &self,
        token: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<String, RemoteError>;

    async fn put_bytes(&self, url: &str, body: Bytes) -> Result<(), RemoteError>;

    async fn download_handle(&self, token: &str, path: &str) -> Result<String, RemoteError>;

    async fn get_bytes(&self, url: &str) -> Result<Bytes, RemoteError>;

    /// Replaces the file at `path`.
    async fn upload(&self, token: &str, path: &str, body: Bytes) -> Result<(), RemoteError> {
        let url = self.upload_handle(token, path, true).await?;
        self.put_bytes(&url, body).await
    }

    async fn download(&self, token: &str, path: &str) -> Result<Bytes, RemoteError> {
        let url = self.download_handle(token, path).await?;
        self.get_bytes(&url).await
    }
}

/// Token shortened for log output.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 9 {
        return "***".into();
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
