//! Signaling broker
//!
//! Tracks the in-progress peer negotiation of each agent. The broker only
//! validates and records; routing the messages is the coordinator's job.

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use watchsec_core::{NegotiationError, NegotiationEvent, NegotiationState};
use watchsec_protocol::{AgentId, ConnectionId, IceCandidate};

/// Which side produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Agent,
    Viewer,
}

/// Errors for signaling messages that do not fit the current exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("No negotiation in progress for agent {0}")]
    NoExchange(AgentId),

    #[error("Agent {agent_id} is negotiating with {expected}, not {actual}")]
    WrongViewer {
        agent_id: AgentId,
        expected: ConnectionId,
        actual: ConnectionId,
    },

    #[error("Agent {agent_id} does not take candidates in state {state:?}")]
    CandidateRejected {
        agent_id: AgentId,
        state: NegotiationState,
    },

    #[error(transparent)]
    Transition(#[from] NegotiationError),
}

/// One agent's in-progress negotiation with one viewer
#[derive(Debug, Clone)]
pub struct SignalingExchange {
    /// Viewer that requested the session
    pub viewer: ConnectionId,
    /// Agent's session description
    pub offer: Option<String>,
    /// Viewer's session description
    pub answer: Option<String>,
    /// Candidates from both sides, in arrival order
    pub candidates: Vec<(CandidateOrigin, IceCandidate)>,
    /// Where the negotiation stands
    pub state: NegotiationState,
    /// When the hub asked the agent for a session
    pub started_at: Instant,
}

impl SignalingExchange {
    fn new(viewer: ConnectionId) -> Self {
        Self {
            viewer,
            offer: None,
            answer: None,
            candidates: Vec::new(),
            state: NegotiationState::Idle,
            started_at: Instant::now(),
        }
    }
}

/// Pending negotiations, one per agent
#[derive(Debug, Default)]
pub struct SignalingBroker {
    exchanges: DashMap<AgentId, SignalingExchange>,
}

impl SignalingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a negotiation between an agent and a viewer.
    ///
    /// Replaces any pending negotiation for the agent; returns the viewer
    /// of the replaced one if it was someone else.
    pub fn begin(&self, agent_id: &AgentId, viewer: ConnectionId) -> Option<ConnectionId> {
        let previous = self
            .exchanges
            .insert(agent_id.clone(), SignalingExchange::new(viewer));
        tracing::debug!(agent = %agent_id, conn = %viewer, "Negotiation opened");
        previous
            .map(|exchange| exchange.viewer)
            .filter(|previous| *previous != viewer)
    }

    /// Record the agent's offer
    pub fn offer(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
        sdp: &str,
    ) -> Result<(), SignalingError> {
        self.advance(agent_id, viewer, NegotiationEvent::OfferSent, |exchange| {
            exchange.offer = Some(sdp.to_string());
        })
    }

    /// Record the viewer's answer
    pub fn answer(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
        sdp: &str,
    ) -> Result<(), SignalingError> {
        self.advance(agent_id, viewer, NegotiationEvent::AnswerReceived, |exchange| {
            exchange.answer = Some(sdp.to_string());
        })
    }

    /// Append a candidate from either side
    pub fn candidate(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
        origin: CandidateOrigin,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let mut exchange = self.exchange_for(agent_id, viewer)?;
        if !exchange.state.accepts_candidates() {
            return Err(SignalingError::CandidateRejected {
                agent_id: agent_id.clone(),
                state: exchange.state,
            });
        }
        exchange.candidates.push((origin, candidate.clone()));
        Ok(())
    }

    /// The agent reports the direct path is up; closes the exchange
    pub fn connect(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
    ) -> Result<SignalingExchange, SignalingError> {
        self.advance(agent_id, viewer, NegotiationEvent::PeerConnected, |_| {})?;
        self.exchanges
            .remove(agent_id)
            .map(|(_, exchange)| exchange)
            .ok_or_else(|| SignalingError::NoExchange(agent_id.clone()))
    }

    /// Either side gave up; closes the exchange.
    ///
    /// Unlike the other steps this is accepted from any state, so an agent
    /// that cannot negotiate at all may fail before offering.
    pub fn fail(&self, agent_id: &AgentId, viewer: ConnectionId) -> Option<SignalingExchange> {
        self.exchanges
            .remove_if(agent_id, |_, exchange| exchange.viewer == viewer)
            .map(|(_, mut exchange)| {
                exchange.state = NegotiationState::Failed;
                exchange
            })
    }

    /// Close every exchange older than the negotiation window.
    ///
    /// Returns the (agent, viewer) pairs that timed out.
    pub fn expire(&self, window: Duration) -> Vec<(AgentId, ConnectionId)> {
        let now = Instant::now();
        let stale: Vec<AgentId> = self
            .exchanges
            .iter()
            .filter(|entry| now.duration_since(entry.started_at) >= window)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::new();
        for agent_id in stale {
            if let Some((agent_id, exchange)) = self.exchanges.remove_if(&agent_id, |_, exchange| {
                now.duration_since(exchange.started_at) >= window
            }) {
                tracing::info!(
                    agent = %agent_id,
                    conn = %exchange.viewer,
                    state = ?exchange.state,
                    candidates = exchange.candidates.len(),
                    "Negotiation timed out"
                );
                expired.push((agent_id, exchange.viewer));
            }
        }
        expired
    }

    /// Drop the agent's exchange (agent gone or reconnected)
    pub fn remove_agent(&self, agent_id: &AgentId) -> Option<ConnectionId> {
        self.exchanges
            .remove(agent_id)
            .map(|(_, exchange)| exchange.viewer)
    }

    /// Drop the exchange a viewer holds with one agent
    pub fn abandon(&self, agent_id: &AgentId, viewer: ConnectionId) -> bool {
        self.exchanges
            .remove_if(agent_id, |_, exchange| exchange.viewer == viewer)
            .is_some()
    }

    /// Drop every exchange a viewer holds
    pub fn abandon_viewer(&self, viewer: ConnectionId) -> Vec<AgentId> {
        let agents: Vec<AgentId> = self
            .exchanges
            .iter()
            .filter(|entry| entry.viewer == viewer)
            .map(|entry| entry.key().clone())
            .collect();
        agents
            .into_iter()
            .filter(|agent_id| self.abandon(agent_id, viewer))
            .collect()
    }

    /// Current state of an agent's negotiation
    pub fn state(&self, agent_id: &AgentId) -> Option<NegotiationState> {
        self.exchanges.get(agent_id).map(|exchange| exchange.state)
    }

    /// Snapshot of an agent's exchange
    pub fn exchange(&self, agent_id: &AgentId) -> Option<SignalingExchange> {
        self.exchanges.get(agent_id).map(|exchange| exchange.clone())
    }

    /// Number of negotiations in progress
    pub fn pending_count(&self) -> usize {
        self.exchanges.len()
    }

    fn exchange_for(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, AgentId, SignalingExchange>, SignalingError> {
        let exchange = self
            .exchanges
            .get_mut(agent_id)
            .ok_or_else(|| SignalingError::NoExchange(agent_id.clone()))?;
        if exchange.viewer != viewer {
            return Err(SignalingError::WrongViewer {
                agent_id: agent_id.clone(),
                expected: exchange.viewer,
                actual: viewer,
            });
        }
        Ok(exchange)
    }

    fn advance(
        &self,
        agent_id: &AgentId,
        viewer: ConnectionId,
        event: NegotiationEvent,
        record: impl FnOnce(&mut SignalingExchange),
    ) -> Result<(), SignalingError> {
        let mut exchange = self.exchange_for(agent_id, viewer)?;
        exchange.state = exchange.state.apply(event)?;
        record(&mut *exchange);
        Ok(())
    }
}
