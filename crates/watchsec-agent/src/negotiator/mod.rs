//! Agent side of the peer-to-peer negotiation
//!
//! One negotiation runs per viewer. The [`PeerNegotiator`] drives the shared
//! state machine from `watchsec_core::negotiation` and turns link events
//! into the control messages the hub expects. Links that reach `Connected`
//! are published in [`DirectPaths`], where the frame pump picks them up.
//!
//! Every link is created under a [`LinkKey`] whose generation is bumped on
//! renegotiation, so late events from a replaced link are ignored.

mod rtc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use watchsec_core::{NegotiationEvent, NegotiationState};
use watchsec_protocol::{AgentMessage, ConnectionId, ControlCommand, IceCandidate};

use crate::error::PeerError;

pub use rtc::{parse_peer_command, WebRtcPeerFactory, WebRtcPeerLink, FRAME_CHANNEL_LABEL};

/// Reason reported when the negotiation window elapses
pub const TIMEOUT_REASON: &str = "negotiation timed out";

/// Reason reported when peer-to-peer is turned off
pub const DISABLED_REASON: &str = "peer-to-peer disabled";

/// Identifies one link attempt for a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub viewer_id: ConnectionId,
    pub generation: u64,
}

/// Events raised by peer links
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate to trickle to the viewer
    LocalCandidate { key: LinkKey, candidate: IceCandidate },
    /// The data channel is open
    Connected { key: LinkKey },
    /// The link failed or dropped
    Failed { key: LinkKey, reason: String },
    /// The viewer sent a command over the data channel
    Command { key: LinkKey, command: ControlCommand },
}

/// A direct connection to one viewer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce the local offer SDP
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Apply the viewer's answer SDP
    async fn apply_answer(&self, sdp: String) -> Result<(), PeerError>;

    /// Add a remote ICE candidate
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Send one binary message; at most [`PeerLink::max_message_size`] bytes
    async fn send_message(&self, message: Bytes) -> Result<(), PeerError>;

    /// Largest message the channel accepts
    fn max_message_size(&self) -> usize;

    /// Whether frames can be sent
    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Creates peer links
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        key: LinkKey,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}

/// Connected links, shared with the frame pump
#[derive(Clone, Default)]
pub struct DirectPaths {
    links: Arc<DashMap<ConnectionId, Arc<dyn PeerLink>>>,
}

impl DirectPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, viewer_id: ConnectionId) -> bool {
        self.links.contains_key(&viewer_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links whose data channel is currently open
    pub fn open_links(&self) -> Vec<(ConnectionId, Arc<dyn PeerLink>)> {
        self.links
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    pub(crate) fn insert(&self, viewer_id: ConnectionId, link: Arc<dyn PeerLink>) {
        self.links.insert(viewer_id, link);
    }

    fn remove(&self, viewer_id: ConnectionId) {
        self.links.remove(&viewer_id);
    }

    fn clear(&self) {
        self.links.clear();
    }
}

struct Slot {
    generation: u64,
    state: NegotiationState,
    link: Arc<dyn PeerLink>,
    started: Instant,
}

/// Per-viewer negotiations of one agent
pub struct PeerNegotiator {
    factory: Option<Arc<dyn PeerFactory>>,
    timeout: Duration,
    slots: HashMap<ConnectionId, Slot>,
    paths: DirectPaths,
    events: mpsc::Sender<PeerEvent>,
    generation: u64,
}

impl PeerNegotiator {
    /// `factory` is `None` when peer-to-peer is disabled
    pub fn new(
        factory: Option<Arc<dyn PeerFactory>>,
        timeout: Duration,
        paths: DirectPaths,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            timeout,
            slots: HashMap::new(),
            paths,
            events,
            generation: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.factory.is_some()
    }

    pub fn paths(&self) -> &DirectPaths {
        &self.paths
    }

    /// Current state of a viewer's negotiation
    pub fn state(&self, viewer_id: ConnectionId) -> NegotiationState {
        self.slots
            .get(&viewer_id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Begin negotiating with a viewer, replacing any earlier attempt.
    ///
    /// Returns the offer, or an immediate failure report.
    pub async fn start(&mut self, viewer_id: ConnectionId) -> AgentMessage {
        self.remove(viewer_id).await;

        let Some(factory) = self.factory.clone() else {
            return AgentMessage::PeerFailed {
                viewer_id,
                reason: DISABLED_REASON.to_string(),
            };
        };

        self.generation += 1;
        let key = LinkKey {
            viewer_id,
            generation: self.generation,
        };

        let link = match factory.create(key, self.events.clone()).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Failed to create peer link for {}: {}", viewer_id, e);
                return AgentMessage::PeerFailed {
                    viewer_id,
                    reason: e.to_string(),
                };
            }
        };

        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("Failed to create offer for {}: {}", viewer_id, e);
                link.close().await;
                return AgentMessage::PeerFailed {
                    viewer_id,
                    reason: e.to_string(),
                };
            }
        };

        let state = match NegotiationState::Idle.apply(NegotiationEvent::OfferSent) {
            Ok(state) => state,
            Err(e) => {
                link.close().await;
                return AgentMessage::PeerFailed {
                    viewer_id,
                    reason: e.to_string(),
                };
            }
        };

        tracing::debug!("Offer created for {} (generation {})", viewer_id, key.generation);
        self.slots.insert(
            viewer_id,
            Slot {
                generation: key.generation,
                state,
                link,
                started: Instant::now(),
            },
        );
        AgentMessage::Offer { viewer_id, sdp }
    }

    /// Apply the viewer's answer
    pub async fn answer(&mut self, viewer_id: ConnectionId, sdp: String) -> Option<AgentMessage> {
        let Some(slot) = self.slots.get_mut(&viewer_id) else {
            tracing::debug!("Answer from {} without a negotiation", viewer_id);
            return None;
        };

        let result = match slot.state.apply(NegotiationEvent::AnswerReceived) {
            Ok(next) => {
                slot.state = next;
                slot.link.apply_answer(sdp).await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => None,
            Err(e) => self.fail(viewer_id, e.to_string()).await,
        }
    }

    /// Add a candidate trickled by the viewer
    pub async fn remote_candidate(&mut self, viewer_id: ConnectionId, candidate: IceCandidate) {
        let Some(slot) = self.slots.get(&viewer_id) else {
            tracing::debug!("Candidate from {} without a negotiation", viewer_id);
            return;
        };
        if !slot.state.accepts_candidates() {
            tracing::debug!("Dropping candidate from {} in state {:?}", viewer_id, slot.state);
            return;
        }
        if let Err(e) = slot.link.add_candidate(candidate).await {
            tracing::debug!("Ignoring candidate from {}: {}", viewer_id, e);
        }
    }

    /// A local candidate was gathered
    pub fn local_candidate(&self, key: LinkKey, candidate: IceCandidate) -> Option<AgentMessage> {
        let slot = self.current(key)?;
        if !slot.state.accepts_candidates() {
            return None;
        }
        Some(AgentMessage::Candidate {
            viewer_id: key.viewer_id,
            candidate,
        })
    }

    /// The link's data channel opened
    pub async fn connected(&mut self, key: LinkKey) -> Option<AgentMessage> {
        let slot = self.current_mut(key)?;
        match slot.state.apply(NegotiationEvent::PeerConnected) {
            Ok(next) => {
                slot.state = next;
                let link = Arc::clone(&slot.link);
                self.paths.insert(key.viewer_id, link);
                tracing::info!("Direct path to {} established", key.viewer_id);
                Some(AgentMessage::PeerConnected {
                    viewer_id: key.viewer_id,
                })
            }
            Err(e) => self.fail(key.viewer_id, e.to_string()).await,
        }
    }

    /// The link reported a failure
    pub async fn link_failed(&mut self, key: LinkKey, reason: String) -> Option<AgentMessage> {
        self.current(key)?;
        self.fail(key.viewer_id, reason).await
    }

    /// The hub reported a failure for a viewer; nothing is sent back
    pub async fn hub_failed(&mut self, viewer_id: ConnectionId, reason: &str) {
        if self.slots.contains_key(&viewer_id) {
            tracing::info!("Peer path to {} failed on the far side: {}", viewer_id, reason);
        }
        self.remove(viewer_id).await;
    }

    /// Drop everything held for a viewer
    pub async fn remove(&mut self, viewer_id: ConnectionId) {
        self.paths.remove(viewer_id);
        if let Some(slot) = self.slots.remove(&viewer_id) {
            slot.link.close().await;
        }
    }

    /// Drop every negotiation and direct path
    pub async fn close_all(&mut self) {
        self.paths.clear();
        for (_, slot) in self.slots.drain() {
            slot.link.close().await;
        }
    }

    /// Fail negotiations that are still pending after the window
    pub async fn expire(&mut self) -> Vec<AgentMessage> {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.state.is_pending() && now.duration_since(slot.started) >= self.timeout
            })
            .map(|(viewer_id, _)| *viewer_id)
            .collect();

        let mut reports = Vec::with_capacity(expired.len());
        for viewer_id in expired {
            tracing::info!("Peer negotiation with {} timed out", viewer_id);
            if let Some(report) = self.fail(viewer_id, TIMEOUT_REASON.to_string()).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn fail(&mut self, viewer_id: ConnectionId, reason: String) -> Option<AgentMessage> {
        let slot = self.slots.remove(&viewer_id)?;
        self.paths.remove(viewer_id);
        slot.link.close().await;
        tracing::debug!("Peer path to {} failed: {}", viewer_id, reason);
        Some(AgentMessage::PeerFailed { viewer_id, reason })
    }

    fn current(&self, key: LinkKey) -> Option<&Slot> {
        self.slots
            .get(&key.viewer_id)
            .filter(|slot| slot.generation == key.generation)
    }

    fn current_mut(&mut self, key: LinkKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(&key.viewer_id)
            .filter(|slot| slot.generation == key.generation)
    }
}
