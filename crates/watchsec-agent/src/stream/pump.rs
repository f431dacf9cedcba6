//! Frame pump: fans captured frames out to the recorder and live paths
//!
//! The relay path never waits: the hub connection keeps only the newest
//! frame. Direct links share a single timeout of one frame interval, and a
//! frame that cannot be delivered in time is dropped, never queued. Frames
//! go over direct links in pieces no larger than the link's message size.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use watchsec_protocol::{split_frame, AgentId, StreamFrame};

use super::StreamGate;
use crate::capture::CapturedFrame;
use crate::hub::HubSender;
use crate::negotiator::{DirectPaths, PeerLink};
use crate::recording::Recorder;

/// Delivers captured frames
pub struct FramePump {
    pub agent_id: AgentId,
    pub gate: Arc<StreamGate>,
    /// Sender of the current hub connection, if any
    pub hub: watch::Receiver<Option<HubSender>>,
    pub paths: DirectPaths,
    pub recorder: Arc<Mutex<Recorder>>,
    /// Per-frame send timeout
    pub send_timeout: Duration,
}

impl FramePump {
    /// Run until cancelled or the capture side hangs up
    pub async fn run(self, mut frames: mpsc::Receiver<CapturedFrame>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.deliver(frame).await;
        }
        tracing::debug!("Frame pump exiting");
    }

    /// Deliver one frame. Returns the number of live paths it reached.
    pub async fn deliver(&self, frame: CapturedFrame) -> usize {
        if self.gate.is_recording() {
            self.recorder.lock().await.append(&frame).await;
        }
        if !self.gate.is_live() {
            return 0;
        }

        let sequence = self.gate.next_sequence();
        let encoded = match StreamFrame::new(
            self.agent_id.clone(),
            sequence,
            frame.captured_at,
            frame.payload,
        )
        .to_bytes()
        {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Dropping frame {}: {}", sequence, e);
                return 0;
            }
        };

        let mut delivered = 0;
        if self.gate.relays() {
            let hub = self.hub.borrow().clone();
            if let Some(hub) = hub {
                match hub.send_frame(encoded.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::trace!("Relay send failed: {}", e),
                }
            }
        }

        let sends: Vec<_> = self
            .paths
            .open_links()
            .into_iter()
            .map(|(viewer_id, link)| {
                let encoded = encoded.clone();
                async move {
                    match send_pieces(link.as_ref(), sequence, &encoded).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::debug!("Direct send to {} failed: {}", viewer_id, e);
                            false
                        }
                    }
                }
            })
            .collect();
        if sends.is_empty() {
            return delivered;
        }
        match tokio::time::timeout(self.send_timeout, join_all(sends)).await {
            Ok(results) => delivered + results.into_iter().filter(|sent| *sent).count(),
            Err(_) => {
                tracing::debug!("Frame {} dropped: send exceeded {:?}", sequence, self.send_timeout);
                delivered
            }
        }
    }
}

/// Send an encoded frame over a peer link in pieces that fit its messages
async fn send_pieces(link: &dyn PeerLink, sequence: u64, encoded: &Bytes) -> anyhow::Result<()> {
    for piece in split_frame(sequence, encoded, link.max_message_size())? {
        link.send_message(piece).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tokio_tungstenite::tungstenite::Message;

    use watchsec_protocol::{ConnectionId, Transport};

    use crate::hub::Outbound;
    use crate::negotiator::fake::{FakeLink, FAKE_MAX_MESSAGE};
    use crate::stream::StreamController;

    struct Harness {
        pump: FramePump,
        controller: StreamController,
        hub_rx: Outbound,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(StreamGate::new());
        let (sender, hub_rx) = HubSender::channel(8);
        let (_hub_tx, hub) = watch::channel(Some(sender));
        let pump = FramePump {
            agent_id: AgentId::new("A1"),
            gate: Arc::clone(&gate),
            hub,
            paths: DirectPaths::new(),
            recorder: Arc::new(Mutex::new(Recorder::new(dir.path(), AgentId::new("A1"), 10))),
            send_timeout: Duration::from_millis(100),
        };
        Harness {
            pump,
            controller: StreamController::new(gate, Duration::from_secs(120)),
            hub_rx,
            _dir: dir,
        }
    }

    fn frame(n: u8) -> CapturedFrame {
        CapturedFrame {
            payload: Bytes::from(vec![0xFF, 0xD8, n]),
            captured_at: 1_700_000_000_000 + n as u64,
            width: 4,
            height: 4,
        }
    }

    fn relayed(rx: &mut Outbound) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(msg) = rx.try_next() {
            match msg {
                Message::Binary(data) => frames.push(StreamFrame::decode(Bytes::from(data)).unwrap()),
                other => panic!("unexpected message {:?}", other),
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_relays_numbered_frames() {
        let mut h = harness();
        h.controller.start();

        for n in 0..3 {
            assert_eq!(h.pump.deliver(frame(n)).await, 1);
            let frames = relayed(&mut h.hub_rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].sequence, n as u64 + 1);
            assert_eq!(frames[0].agent_id, AgentId::new("A1"));
            assert_eq!(frames[0].payload.as_ref(), &[0xFF, 0xD8, n]);
        }
    }

    #[tokio::test]
    async fn test_idle_sends_nothing() {
        let mut h = harness();
        assert_eq!(h.pump.deliver(frame(0)).await, 0);
        assert!(relayed(&mut h.hub_rx).is_empty());
    }

    #[tokio::test]
    async fn test_stalled_hub_keeps_newest_frame() {
        let mut h = harness();
        h.controller.start();

        // Nothing drains the hub connection; delivery still never waits
        for n in 0..5 {
            assert_eq!(h.pump.deliver(frame(n)).await, 1);
        }

        let frames = relayed(&mut h.hub_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 5);
    }

    #[tokio::test]
    async fn test_peer_to_peer_bypasses_hub() {
        let mut h = harness();
        let link = Arc::new(FakeLink::default());
        link.open.store(true, Ordering::SeqCst);
        h.pump.paths.insert(ConnectionId::new(7), link.clone());

        h.controller.start();
        h.controller.set_transport(Transport::PeerToPeer);
        assert_eq!(h.pump.deliver(frame(0)).await, 1);
        assert!(relayed(&mut h.hub_rx).is_empty());
        assert_eq!(link.frames().len(), 1);

        // Relayed viewers and direct viewers both get the frame
        h.controller.set_transport(Transport::Relayed);
        assert_eq!(h.pump.deliver(frame(1)).await, 2);
        assert_eq!(relayed(&mut h.hub_rx).len(), 1);
        assert_eq!(link.frames().len(), 2);
    }

    #[tokio::test]
    async fn test_recording_continues_without_viewers() {
        let mut h = harness();
        let path = h.pump.recorder.lock().await.start().await.unwrap();
        h.pump.gate.set_recording(true);

        assert_eq!(h.pump.deliver(frame(0)).await, 0);
        assert_eq!(h.pump.deliver(frame(1)).await, 0);
        assert!(relayed(&mut h.hub_rx).is_empty());

        let finished = h.pump.recorder.lock().await.stop().await.unwrap();
        assert_eq!(finished.path, path);
        assert_eq!(finished.frames, 2);
    }

    #[tokio::test]
    async fn test_large_frame_fits_direct_link() {
        let mut h = harness();
        let link = Arc::new(FakeLink::default());
        link.open.store(true, Ordering::SeqCst);
        h.pump.paths.insert(ConnectionId::new(7), link.clone());
        h.controller.start();
        h.controller.set_transport(Transport::PeerToPeer);

        // A 1080p JPEG is routinely well past one data channel message
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 253) as u8).collect();
        let big = CapturedFrame {
            payload: Bytes::from(payload.clone()),
            captured_at: 1_700_000_000_000,
            width: 1920,
            height: 1080,
        };
        assert_eq!(h.pump.deliver(big).await, 1);
        assert!(link.message_count() > 1);

        let frames = link.frames();
        assert_eq!(frames.len(), 1);
        let decoded = StreamFrame::decode(frames[0].clone()).unwrap();
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        assert!(link
            .messages
            .lock()
            .unwrap()
            .iter()
            .all(|msg| msg.len() <= FAKE_MAX_MESSAGE));
    }

    #[tokio::test]
    async fn test_oversized_message_fails_only_that_link() {
        let mut h = harness();
        let tiny = Arc::new(FakeLink::default());
        tiny.open.store(true, Ordering::SeqCst);
        // Too small for even a piece header
        tiny.max_message.store(8, Ordering::SeqCst);
        let normal = Arc::new(FakeLink::default());
        normal.open.store(true, Ordering::SeqCst);
        h.pump.paths.insert(ConnectionId::new(1), tiny.clone());
        h.pump.paths.insert(ConnectionId::new(2), normal.clone());
        h.controller.start();
        h.controller.set_transport(Transport::PeerToPeer);

        assert_eq!(h.pump.deliver(frame(0)).await, 1);
        assert_eq!(tiny.message_count(), 0);
        assert_eq!(normal.frames().len(), 1);
    }
}
