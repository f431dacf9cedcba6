//! Live stream state shared by the capture thread, frame pump and event loop
//!
//! The [`StreamGate`] holds the flags the capture thread polls without
//! locking. The [`StreamController`] is owned by the event loop and is the
//! only writer of the live flags.

mod pump;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use watchsec_protocol::Transport;

pub use pump::FramePump;

/// Lock-free stream flags
#[derive(Debug, Default)]
pub struct StreamGate {
    live: AtomicBool,
    recording: AtomicBool,
    relay: AtomicBool,
    sequence: AtomicU64,
}

impl StreamGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether frames are needed for a viewer or a recording
    pub fn is_capturing(&self) -> bool {
        self.is_live() || self.is_recording()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Whether live frames go through the hub
    pub fn relays(&self) -> bool {
        self.relay.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Release);
    }

    /// Sequence number for the next live frame, starting at 1
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn open_live(&self) {
        self.sequence.store(0, Ordering::Release);
        self.live.store(true, Ordering::Release);
    }

    fn close_live(&self) {
        self.live.store(false, Ordering::Release);
        self.relay.store(false, Ordering::Release);
    }

    fn set_relay(&self, on: bool) {
        self.relay.store(on, Ordering::Release);
    }
}

/// Live session lifecycle and transport choice
pub struct StreamController {
    gate: Arc<StreamGate>,
    max_session: Duration,
    deadline: Option<Instant>,
    transport: Transport,
}

impl StreamController {
    pub fn new(gate: Arc<StreamGate>, max_session: Duration) -> Self {
        Self {
            gate,
            max_session,
            deadline: None,
            transport: Transport::None,
        }
    }

    /// Start the live stream, or extend it if it is already running.
    ///
    /// Returns true if a new session started (sequence numbers restart).
    pub fn start(&mut self) -> bool {
        let started = self.deadline.is_none();
        if started {
            self.gate.open_live();
        }
        self.deadline = Some(Instant::now() + self.max_session);
        self.refresh_relay();
        started
    }

    /// End the live stream. Returns true if one was running.
    pub fn stop(&mut self) -> bool {
        let was_live = self.deadline.take().is_some();
        self.transport = Transport::None;
        self.gate.close_live();
        was_live
    }

    /// When the running session ends on its own
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_live(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Apply the transport the hub selected
    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
        self.refresh_relay();
    }

    fn refresh_relay(&self) {
        self.gate
            .set_relay(self.deadline.is_some() && self.transport != Transport::PeerToPeer);
    }
}
