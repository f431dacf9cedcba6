//! Upload of finished recordings to the storage service
//!
//! The recording is posted as a multipart form, streamed from disk since a
//! recording has no size cap. A 2xx answer deletes the local file; any other
//! outcome leaves it in place.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Body;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use watchsec_core::config::AgentConfig;
use watchsec_core::time::to_rfc3339;

use super::writer::FinishedRecording;
use crate::error::UploadError;

/// Posts recordings to the storage endpoint
#[derive(Debug, Clone)]
pub struct RecordingUploader {
    client: reqwest::Client,
    url: String,
}

impl RecordingUploader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, UploadError> {
        Self::new(config.upload_url(), config.recording.upload_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post one recording. The file is left untouched.
    pub async fn upload(&self, recording: &FinishedRecording) -> Result<(), UploadError> {
        let file = tokio::fs::File::open(&recording.path).await?;
        let size = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, size)
            .file_name(recording.file_name())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("agentId", recording.agent_id.to_string())
            .text(
                "durationSeconds",
                format!("{:.3}", recording.duration.as_secs_f64()),
            )
            .text("startTime", to_rfc3339(recording.started_at))
            .part("file", part);

        tracing::debug!("Uploading {} ({} bytes) to {}", recording.file_name(), size, self.url);
        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    /// Upload and delete the local file on success
    pub async fn deliver(&self, recording: FinishedRecording) -> Result<(), UploadError> {
        match self.upload(&recording).await {
            Ok(()) => {
                tracing::info!(
                    "Uploaded recording {} ({} frames, {:.1}s)",
                    recording.file_name(),
                    recording.frames,
                    recording.duration.as_secs_f64()
                );
                if let Err(e) = tokio::fs::remove_file(&recording.path).await {
                    tracing::warn!("Failed to remove {:?}: {}", recording.path, e);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Upload of {} failed, keeping it at {:?}: {}",
                    recording.file_name(),
                    recording.path,
                    e
                );
                Err(e)
            }
        }
    }

    /// Deliver in the background
    pub fn spawn(self: &Arc<Self>, recording: FinishedRecording) -> JoinHandle<()> {
        let uploader = Arc::clone(self);
        tokio::spawn(async move {
            let _ = uploader.deliver(recording).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::{DefaultBodyLimit, Multipart, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;

    use watchsec_protocol::AgentId;

    use crate::recording::RecordingWriter;

    #[derive(Clone)]
    struct Storage {
        status: StatusCode,
        fields: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn upload_session(State(storage): State<Storage>, mut multipart: Multipart) -> StatusCode {
        while let Ok(Some(field)) = multipart.next_field().await {
            let name = field.name().unwrap_or_default().to_string();
            let value = if name == "file" {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let len = field.bytes().await.unwrap().len();
                format!("{}:{}", file_name, len)
            } else {
                field.text().await.unwrap()
            };
            storage.fields.lock().unwrap().push((name, value));
        }
        storage.status
    }

    async fn storage_server(status: StatusCode) -> (String, Storage) {
        let storage = Storage {
            status,
            fields: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/api/remote/upload-session", post(upload_session))
            .layer(DefaultBodyLimit::disable())
            .with_state(storage.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api/remote/upload-session", addr), storage)
    }

    async fn recording(dir: &std::path::Path) -> FinishedRecording {
        let mut writer = RecordingWriter::create(dir, AgentId::new("A1"), 10).await.unwrap();
        writer.append(1, Bytes::from_static(&[0xFF, 0xD8, 0xFF])).await.unwrap();
        writer.append(2, Bytes::from_static(&[0xFF, 0xD8, 0xFE])).await.unwrap();
        writer.finish().await.unwrap()
    }

    fn field(storage: &Storage, name: &str) -> Option<String> {
        storage
            .fields
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    #[tokio::test]
    async fn test_accepted_upload_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let finished = recording(dir.path()).await;
        let size = tokio::fs::metadata(&finished.path).await.unwrap().len();
        let (url, storage) = storage_server(StatusCode::OK).await;

        let uploader = RecordingUploader::new(url, Duration::from_secs(5)).unwrap();
        uploader.deliver(finished.clone()).await.unwrap();

        assert!(!finished.path.exists());
        assert_eq!(field(&storage, "agentId").as_deref(), Some("A1"));
        assert!(field(&storage, "startTime").unwrap().ends_with('Z'));
        let duration: f64 = field(&storage, "durationSeconds").unwrap().parse().unwrap();
        assert!(duration >= 0.0);
        assert_eq!(
            field(&storage, "file").unwrap(),
            format!("{}:{}", finished.file_name(), size)
        );
    }

    #[tokio::test]
    async fn test_large_recording_is_sent_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordingWriter::create(dir.path(), AgentId::new("A1"), 10).await.unwrap();
        let frame = Bytes::from(vec![0xAB; 1024 * 1024]);
        for n in 0..6 {
            writer.append(n, frame.clone()).await.unwrap();
        }
        let finished = writer.finish().await.unwrap();
        let size = tokio::fs::metadata(&finished.path).await.unwrap().len();
        assert!(size > 6 * 1024 * 1024);
        let (url, storage) = storage_server(StatusCode::OK).await;

        let uploader = RecordingUploader::new(url, Duration::from_secs(10)).unwrap();
        uploader.deliver(finished.clone()).await.unwrap();

        assert_eq!(
            field(&storage, "file").unwrap(),
            format!("{}:{}", finished.file_name(), size)
        );
        assert!(!finished.path.exists());
    }

    #[tokio::test]
    async fn test_rejected_upload_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let finished = recording(dir.path()).await;
        let (url, _storage) = storage_server(StatusCode::INTERNAL_SERVER_ERROR).await;

        let uploader = RecordingUploader::new(url, Duration::from_secs(5)).unwrap();
        let result = uploader.deliver(finished.clone()).await;

        assert!(matches!(result, Err(UploadError::Rejected { status: 500, .. })));
        assert!(finished.path.exists());
    }

    #[tokio::test]
    async fn test_unreachable_storage_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let finished = recording(dir.path()).await;
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uploader =
            RecordingUploader::new(format!("http://{}/upload", addr), Duration::from_secs(2)).unwrap();
        let result = uploader.deliver(finished.clone()).await;

        assert!(matches!(result, Err(UploadError::Http(_))));
        assert!(finished.path.exists());
    }

    #[tokio::test]
    async fn test_default_url_derived_from_hub() {
        let mut config = AgentConfig::default();
        config.hub_url = "wss://hub.example.com".to_string();
        let uploader = RecordingUploader::from_config(&config).unwrap();
        assert_eq!(uploader.url(), "https://hub.example.com/api/remote/upload-session");
    }
}
