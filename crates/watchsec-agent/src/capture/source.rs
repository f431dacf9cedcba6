//! Blocking capture loop
//!
//! Runs on a dedicated blocking thread at the configured cadence while the
//! [`StreamGate`] asks for frames. Frames are handed to the async side over
//! a bounded channel; when it is full the newest frame is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use watchsec_core::time::current_time_millis;

use super::encode::FrameEncoder;
use super::CapturedFrame;
use crate::error::CaptureError;
use crate::platform::{Backend, ScreenSource};
use crate::stream::StreamGate;

/// Counters kept by the capture loop
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl CaptureStats {
    /// Frames captured and encoded
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer was busy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Iterations that failed to capture or encode
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Everything the capture thread needs
pub struct CaptureLoop {
    pub backend: Arc<dyn Backend>,
    pub encoder: FrameEncoder,
    pub interval: Duration,
    pub gate: Arc<StreamGate>,
    pub stats: Arc<CaptureStats>,
}

impl CaptureLoop {
    /// Spawn the loop on a blocking thread.
    ///
    /// Uses a `CancellationToken` for shutdown; the token is checked once
    /// per frame interval.
    pub fn spawn(
        self,
        tx: mpsc::Sender<CapturedFrame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run(tx, cancel))
    }

    fn run(self, tx: mpsc::Sender<CapturedFrame>, cancel: CancellationToken) {
        let mut source: Option<Box<dyn ScreenSource>> = None;
        let mut last_error: Option<String> = None;

        tracing::debug!("Capture loop started ({:?} interval)", self.interval);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();

            if self.gate.is_capturing() {
                match self.capture_one(&mut source) {
                    Ok(frame) => {
                        self.stats.captured.fetch_add(1, Ordering::Relaxed);
                        if last_error.take().is_some() {
                            tracing::info!("Screen capture recovered");
                        }
                        match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::trace!("Frame consumer busy, dropped newest frame");
                            }
                            Err(TrySendError::Closed(_)) => {
                                tracing::debug!("Frame channel closed");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        let message = e.to_string();
                        if last_error.as_deref() != Some(message.as_str()) {
                            tracing::warn!("Screen capture failed: {}", message);
                        } else {
                            tracing::trace!("Screen capture failed: {}", message);
                        }
                        last_error = Some(message);
                        // Reopen the display on the next attempt
                        source = None;
                    }
                }
            }

            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        tracing::debug!("Capture loop exiting");
    }

    fn capture_one(
        &self,
        source: &mut Option<Box<dyn ScreenSource>>,
    ) -> Result<CapturedFrame, CaptureError> {
        let screen = match source {
            Some(screen) => screen,
            None => source.insert(self.backend.open_screen()?),
        };

        let captured_at = current_time_millis();
        let image = screen.capture()?;
        let payload = self.encoder.encode(&image)?;

        Ok(CapturedFrame {
            payload,
            captured_at,
            width: image.width(),
            height: image.height(),
        })
    }
}
