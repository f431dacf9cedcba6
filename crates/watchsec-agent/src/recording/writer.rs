//! Recording file writer
//!
//! A recording is the sequence of encoded frames written through
//! [`RecordingCodec`]. Sequence numbers restart at 1 for every recording.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::fs::{File, OpenOptions};
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;

use watchsec_core::time::{current_time_millis, file_stamp};
use watchsec_protocol::{AgentId, RecordingCodec, StreamFrame};

use crate::error::RecordingError;

/// File extension of recordings
pub const RECORDING_EXTENSION: &str = "wsrec";

/// Name collisions tolerated before giving up
const MAX_NAME_ATTEMPTS: u32 = 100;

/// A closed recording, ready for upload
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    pub path: PathBuf,
    pub agent_id: AgentId,
    /// Start time in ms since the Unix epoch
    pub started_at: u64,
    /// Close time in ms since the Unix epoch
    pub ended_at: u64,
    pub duration: Duration,
    /// Capture rate the frames were taken at
    pub frame_rate: u32,
    pub frames: u64,
}

impl FinishedRecording {
    /// File name without the directory
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// An open recording
pub struct RecordingWriter {
    path: PathBuf,
    agent_id: AgentId,
    started_at: u64,
    started: Instant,
    frame_rate: u32,
    frames: u64,
    sink: FramedWrite<File, RecordingCodec>,
}

impl RecordingWriter {
    /// Create a new recording file in `directory` for frames captured at
    /// `frame_rate`
    pub async fn create(
        directory: &Path,
        agent_id: AgentId,
        frame_rate: u32,
    ) -> Result<Self, RecordingError> {
        tokio::fs::create_dir_all(directory).await?;

        let started_at = current_time_millis();
        let stamp = file_stamp(started_at);
        let mut attempt = 0;
        let (path, file) = loop {
            let name = match attempt {
                0 => format!("session_{}.{}", stamp, RECORDING_EXTENSION),
                n => format!("session_{}_{}.{}", stamp, n, RECORDING_EXTENSION),
            };
            let path = directory.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Self {
            path,
            agent_id,
            started_at,
            started: Instant::now(),
            frame_rate,
            frames: 0,
            sink: FramedWrite::new(file, RecordingCodec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one frame. Writes are buffered until `finish`.
    pub async fn append(&mut self, captured_at: u64, payload: Bytes) -> Result<(), RecordingError> {
        self.frames += 1;
        let frame = StreamFrame::new(self.agent_id.clone(), self.frames, captured_at, payload);
        self.sink.feed(frame).await?;
        Ok(())
    }

    /// Flush, sync and close the file
    pub async fn finish(mut self) -> Result<FinishedRecording, RecordingError> {
        self.sink.flush().await?;
        let file = self.sink.into_inner();
        file.sync_all().await?;
        drop(file);

        Ok(FinishedRecording {
            path: self.path,
            agent_id: self.agent_id,
            started_at: self.started_at,
            ended_at: current_time_millis(),
            duration: self.started.elapsed(),
            frame_rate: self.frame_rate,
            frames: self.frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_finish_flushes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordingWriter::create(dir.path(), AgentId::new("A1"), 10)
            .await
            .unwrap();
        for i in 0..3u8 {
            writer
                .append(1_000 + i as u64, Bytes::from(vec![0xFF, 0xD8, i]))
                .await
                .unwrap();
        }
        let finished = writer.finish().await.unwrap();
        assert_eq!(finished.frames, 3);
        assert!(finished.file_name().starts_with("session_"));
        assert!(finished.file_name().ends_with(".wsrec"));

        let file = File::open(&finished.path).await.unwrap();
        let frames: Vec<StreamFrame> = FramedRead::new(file, RecordingCodec::new())
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(frames[2].payload.as_ref(), &[0xFF, 0xD8, 2]);
        assert_eq!(frames[0].agent_id, AgentId::new("A1"));
    }

    #[tokio::test]
    async fn test_finish_records_rate_and_end_time() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RecordingWriter::create(dir.path(), AgentId::new("A1"), 5)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let finished = writer.finish().await.unwrap();

        assert_eq!(finished.frame_rate, 5);
        assert!(finished.ended_at >= finished.started_at + 20);
        assert!(finished.duration >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = RecordingWriter::create(dir.path(), AgentId::new("A1"), 10)
            .await
            .unwrap();
        let b = RecordingWriter::create(dir.path(), AgentId::new("A1"), 10)
            .await
            .unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let writer = RecordingWriter::create(&nested, AgentId::new("A1"), 10)
            .await
            .unwrap();
        let finished = writer.finish().await.unwrap();
        assert_eq!(finished.frames, 0);
        assert!(finished.path.starts_with(&nested));
        assert_eq!(tokio::fs::metadata(&finished.path).await.unwrap().len(), 0);
    }
}
