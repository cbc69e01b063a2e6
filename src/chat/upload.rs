use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;
use crate::protocol::chat::MediaItem;

/// Client-side size gate, matching the server's per-file limit. Oversized
/// files are rejected before any bytes leave the process.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Large attachments take a while on residential uplinks.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// A file picked for sending, fully buffered.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file exceeds the {MAX_UPLOAD_BYTES} byte limit")]
    TooLarge,
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload rejected with status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("upload response missing file url")]
    MissingUrl,
}

/// Per-file result of a batch upload. One failed file never aborts the batch.
#[derive(Debug)]
pub enum UploadOutcome {
    Uploaded(MediaItem),
    Failed { name: String, reason: UploadError },
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    file_url: Option<String>,
}

#[async_trait]
trait UploadBackend: Send + Sync {
    async fn upload(
        &self,
        file: &OutgoingFile,
        consultation_id: &str,
        sender_id: &str,
        sender_type: &str,
    ) -> Result<String, UploadError>;
}

struct ReqwestUploadBackend {
    client: reqwest::Client,
    url: String,
}

impl ReqwestUploadBackend {
    fn new(config: &Config) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: config.upload_url(),
        })
    }
}

#[async_trait]
impl UploadBackend for ReqwestUploadBackend {
    async fn upload(
        &self,
        file: &OutgoingFile,
        consultation_id: &str,
        sender_id: &str,
        sender_type: &str,
    ) -> Result<String, UploadError> {
        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.name.clone())
            .mime_str(&file.mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("consultation_id", consultation_id.to_string())
            .text("sender_id", sender_id.to_string())
            .text("sender_type", sender_type.to_string());

        let response = self.client.post(&self.url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(UploadError::HttpStatus(response.status()));
        }
        let payload = response.json::<UploadResponse>().await?;
        payload.file_url.ok_or(UploadError::MissingUrl)
    }
}

/// Uploads chat attachments out-of-band over HTTP; the resulting urls ride on
/// the chat message as [`MediaItem`]s.
pub struct FileUploader {
    backend: Arc<dyn UploadBackend>,
}

impl FileUploader {
    pub fn new(config: &Config) -> Result<Self, UploadError> {
        Ok(Self {
            backend: Arc::new(ReqwestUploadBackend::new(config)?),
        })
    }

    #[cfg(test)]
    fn with_backend(backend: Arc<dyn UploadBackend>) -> Self {
        Self { backend }
    }

    /// Upload one file, enforcing the size gate first.
    pub async fn upload(
        &self,
        file: &OutgoingFile,
        consultation_id: &str,
        sender_id: &str,
        sender_type: &str,
    ) -> Result<MediaItem, UploadError> {
        if file.bytes.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(UploadError::TooLarge);
        }
        let url = self
            .backend
            .upload(file, consultation_id, sender_id, sender_type)
            .await?;
        Ok(MediaItem {
            name: file.name.clone(),
            mime: file.mime.clone(),
            size: file.bytes.len() as u64,
            data: None,
            url: Some(url),
        })
    }

    /// Upload a batch, one outcome per file in input order. Failures are
    /// reported per file so the rest of the batch still goes out.
    pub async fn upload_all(
        &self,
        files: &[OutgoingFile],
        consultation_id: &str,
        sender_id: &str,
        sender_type: &str,
    ) -> Vec<UploadOutcome> {
        let uploads = files
            .iter()
            .map(|file| async move {
                match self.upload(file, consultation_id, sender_id, sender_type).await {
                    Ok(item) => UploadOutcome::Uploaded(item),
                    Err(reason) => {
                        tracing::warn!(
                            target: "televisit::chat",
                            file = %file.name,
                            error = %reason,
                            "attachment upload failed"
                        );
                        UploadOutcome::Failed {
                            name: file.name.clone(),
                            reason,
                        }
                    }
                }
            })
            .collect::<Vec<_>>();
        futures_util::future::join_all(uploads).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingBackend {
        calls: AtomicUsize,
        fail_name: Option<String>,
    }

    impl RecordingBackend {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_name: None,
            })
        }

        fn failing_on(name: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_name: Some(name.to_string()),
            })
        }
    }

    #[async_trait]
    impl UploadBackend for RecordingBackend {
        async fn upload(
            &self,
            file: &OutgoingFile,
            _consultation_id: &str,
            _sender_id: &str,
            _sender_type: &str,
        ) -> Result<String, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_name.as_deref() == Some(file.name.as_str()) {
                return Err(UploadError::MissingUrl);
            }
            Ok(format!("https://files.example/{}", file.name))
        }
    }

    fn file(name: &str, size: usize) -> OutgoingFile {
        OutgoingFile {
            name: name.into(),
            mime: "application/pdf".into(),
            bytes: vec![0u8; size],
        }
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_without_a_request() {
        let backend = RecordingBackend::ok();
        let uploader = FileUploader::with_backend(backend.clone());

        let big = file("scan.pdf", (MAX_UPLOAD_BYTES + 1) as usize);
        let err = uploader.upload(&big, "c-1", "u-1", "patient").await.unwrap_err();

        assert!(matches!(err, UploadError::TooLarge));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_returns_media_item_with_server_url() {
        let uploader = FileUploader::with_backend(RecordingBackend::ok());
        let item = uploader
            .upload(&file("notes.pdf", 128), "c-1", "u-1", "patient")
            .await
            .unwrap();

        assert_eq!(item.name, "notes.pdf");
        assert_eq!(item.size, 128);
        assert_eq!(item.url.as_deref(), Some("https://files.example/notes.pdf"));
        assert!(item.data.is_none());
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let uploader = FileUploader::with_backend(RecordingBackend::failing_on("bad.pdf"));
        let files = vec![file("a.pdf", 8), file("bad.pdf", 8), file("b.pdf", 8)];

        let outcomes = uploader.upload_all(&files, "c-1", "u-1", "doctor").await;

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], UploadOutcome::Uploaded(_)));
        assert!(matches!(&outcomes[1], UploadOutcome::Failed { name, .. } if name == "bad.pdf"));
        assert!(matches!(outcomes[2], UploadOutcome::Uploaded(_)));
    }
}
