//! Session recording
//!
//! Recording runs independently of the live stream: it keeps capturing
//! after every viewer has left, until a stop command arrives.

mod uploader;
mod writer;

use std::path::{Path, PathBuf};

use watchsec_protocol::AgentId;

use crate::capture::CapturedFrame;
use crate::error::RecordingError;

pub use uploader::RecordingUploader;
pub use writer::{FinishedRecording, RecordingWriter, RECORDING_EXTENSION};

/// Owns at most one open recording
pub struct Recorder {
    directory: PathBuf,
    agent_id: AgentId,
    frame_rate: u32,
    active: Option<RecordingWriter>,
}

impl Recorder {
    pub fn new(directory: impl Into<PathBuf>, agent_id: AgentId, frame_rate: u32) -> Self {
        Self {
            directory: directory.into(),
            agent_id,
            frame_rate,
            active: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open a new recording file and return its path
    pub async fn start(&mut self) -> Result<PathBuf, RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }
        let writer = RecordingWriter::create(&self.directory, self.agent_id.clone(), self.frame_rate).await?;
        let path = writer.path().to_path_buf();
        tracing::info!("Recording started: {:?}", path);
        self.active = Some(writer);
        Ok(path)
    }

    /// Append a frame to the open recording, if any.
    ///
    /// Write failures are logged; the recording stays open.
    pub async fn append(&mut self, frame: &CapturedFrame) {
        let Some(writer) = self.active.as_mut() else {
            return;
        };
        if let Err(e) = writer.append(frame.captured_at, frame.payload.clone()).await {
            tracing::warn!("Failed to append frame to {:?}: {}", writer.path(), e);
        }
    }

    /// Close the open recording. All frames are on disk when this returns.
    pub async fn stop(&mut self) -> Result<FinishedRecording, RecordingError> {
        let writer = self.active.take().ok_or(RecordingError::NotRecording)?;
        let finished = writer.finish().await?;
        tracing::info!(
            "Recording stopped: {:?} ({} frames)",
            finished.path,
            finished.frames
        );
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(captured_at: u64) -> CapturedFrame {
        CapturedFrame {
            payload: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]),
            captured_at,
            width: 4,
            height: 4,
        }
    }

    #[tokio::test]
    async fn test_start_append_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path(), AgentId::new("A1"), 10);

        // Frames before start are ignored
        recorder.append(&frame(1)).await;

        let path = recorder.start().await.unwrap();
        assert!(recorder.is_recording());
        recorder.append(&frame(2)).await;
        recorder.append(&frame(3)).await;

        let finished = recorder.stop().await.unwrap();
        assert!(!recorder.is_recording());
        assert_eq!(finished.path, path);
        assert_eq!(finished.frames, 2);
        assert_eq!(finished.frame_rate, 10);
        assert!(tokio::fs::metadata(&path).await.unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path(), AgentId::new("A1"), 10);

        recorder.start().await.unwrap();
        assert!(matches!(
            recorder.start().await,
            Err(RecordingError::AlreadyRecording)
        ));
        assert!(recorder.is_recording());
    }

    #[tokio::test]
    async fn test_stop_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path(), AgentId::new("A1"), 10);
        assert!(matches!(
            recorder.stop().await,
            Err(RecordingError::NotRecording)
        ));
    }
}
