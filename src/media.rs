use crate::error::StoreResult;
use crate::models::UploadedMedia;
use crate::store::{MediaHost, Progress};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest::{digest, SHA256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Stores uploads as files named after their content digest.
#[derive(Clone, Debug)]
pub struct LocalMediaHost {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaHost {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        LocalMediaHost {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Content-addressed id: the same bytes always map to the same file.
    pub fn media_id(bytes: &[u8]) -> String {
        let hash = digest(&SHA256, bytes);
        URL_SAFE_NO_PAD.encode(&hash.as_ref()[..18])
    }
}

#[async_trait]
impl MediaHost for LocalMediaHost {
    async fn upload(&self, bytes: &[u8], progress: Progress<'_>) -> StoreResult<UploadedMedia> {
        let id = Self::media_id(bytes);
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.root.join(&id);
        let mut file = tokio::fs::File::create(&path).await?;
        let total = bytes.len().max(1) as f32;
        let mut written = 0usize;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            file.write_all(chunk).await?;
            written += chunk.len();
            if let Some(report) = progress {
                report(written as f32 / total * 100.0);
            }
        }
        file.flush().await?;

        if let Some(report) = progress {
            report(100.0);
        }
        log::debug!("Stored {} bytes of media as {}", bytes.len(), path.display());

        Ok(UploadedMedia {
            url: format!("{}/{id}", self.base_url),
            id,
            size: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("chat-receipts-media-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_upload_writes_file_and_reports_progress() {
        let root = temp_root();
        let host = LocalMediaHost::new(&root, "https://media.example.com/");
        let bytes = vec![7u8; CHUNK_SIZE * 2 + 10];

        let seen = Mutex::new(Vec::new());
        let report = |p: f32| seen.lock().unwrap().push(p);
        let uploaded = host.upload(&bytes, Some(&report)).await.unwrap();

        assert_eq!(uploaded.size, bytes.len() as u64);
        assert_eq!(uploaded.url, format!("https://media.example.com/{}", uploaded.id));
        assert_eq!(tokio::fs::read(root.join(&uploaded.id)).await.unwrap(), bytes);

        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_same_bytes_same_id() {
        assert_eq!(LocalMediaHost::media_id(b"photo"), LocalMediaHost::media_id(b"photo"));
        assert_ne!(LocalMediaHost::media_id(b"photo"), LocalMediaHost::media_id(b"video"));
        assert_eq!(LocalMediaHost::media_id(b"photo").len(), 24);
    }
}
