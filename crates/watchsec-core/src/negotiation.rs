//! Transport negotiation state machine
//!
//! ```text
//!            OfferSent          AnswerReceived        PeerConnected
//!   Idle ─────────────▶ Offered ──────────────▶ Answered ─────────────▶ Connected
//!                          │                       │
//!                          └── Failed / TimedOut ──┴──────────────────▶ Failed
//! ```
//!
//! `Reset` returns Connected/Failed to Idle when the live session ends.
//! `OfferSent` is accepted from every state: a new viewer starting a session
//! restarts negotiation for the agent.
//!
//! Both the agent and the hub drive their copy of the machine through
//! [`NegotiationState::apply`].

use serde::{Deserialize, Serialize};

use watchsec_protocol::Transport;

use crate::error::NegotiationError;

/// State of one agent's peer-to-peer negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    #[default]
    Idle,
    Offered,
    Answered,
    Connected,
    Failed,
}

/// Input to the negotiation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationEvent {
    /// The agent produced an offer
    OfferSent,
    /// The viewer's answer arrived
    AnswerReceived,
    /// The direct path is up
    PeerConnected,
    /// Either side reported failure
    Failed,
    /// The negotiation window elapsed
    TimedOut,
    /// The live session ended
    Reset,
}

impl NegotiationState {
    /// Apply an event, returning the next state
    pub fn apply(self, event: NegotiationEvent) -> Result<Self, NegotiationError> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let next = match (self, event) {
            (_, E::OfferSent) => S::Offered,
            (S::Offered, E::AnswerReceived) => S::Answered,
            (S::Answered, E::PeerConnected) => S::Connected,
            (S::Offered | S::Answered, E::Failed | E::TimedOut) => S::Failed,
            (S::Idle | S::Connected | S::Failed, E::Reset) => S::Idle,
            (from, event) => return Err(NegotiationError::IllegalTransition { from, event }),
        };
        Ok(next)
    }

    /// Whether the negotiation window is running in this state
    pub fn is_pending(&self) -> bool {
        matches!(self, NegotiationState::Offered | NegotiationState::Answered)
    }

    /// Whether negotiation has finished, successfully or not
    pub fn is_settled(&self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Failed)
    }

    /// Whether ICE candidates may still be exchanged
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            NegotiationState::Offered | NegotiationState::Answered | NegotiationState::Connected
        )
    }

    /// Transport implied by a settled negotiation
    pub fn transport(&self) -> Option<Transport> {
        match self {
            NegotiationState::Connected => Some(Transport::PeerToPeer),
            NegotiationState::Failed => Some(Transport::Relayed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationEvent as E;
    use NegotiationState as S;

    #[test]
    fn test_happy_path() {
        let state = S::Idle
            .apply(E::OfferSent)
            .and_then(|s| s.apply(E::AnswerReceived))
            .and_then(|s| s.apply(E::PeerConnected))
            .unwrap();
        assert_eq!(state, S::Connected);
        assert_eq!(state.transport(), Some(Transport::PeerToPeer));
    }

    #[test]
    fn test_timeout_falls_back_to_relay() {
        let offered = S::Idle.apply(E::OfferSent).unwrap();
        let failed = offered.apply(E::TimedOut).unwrap();
        assert_eq!(failed, S::Failed);
        assert_eq!(failed.transport(), Some(Transport::Relayed));

        let answered = offered.apply(E::AnswerReceived).unwrap();
        assert_eq!(answered.apply(E::Failed).unwrap(), S::Failed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(S::Idle.apply(E::AnswerReceived).is_err());
        assert!(S::Offered.apply(E::PeerConnected).is_err());
        assert!(S::Connected.apply(E::TimedOut).is_err());
        assert!(S::Idle.apply(E::Failed).is_err());
        assert!(S::Offered.apply(E::Reset).is_err());
    }

    #[test]
    fn test_renegotiation_restarts_from_settled_states() {
        assert_eq!(S::Connected.apply(E::OfferSent).unwrap(), S::Offered);
        assert_eq!(S::Failed.apply(E::OfferSent).unwrap(), S::Offered);
        assert_eq!(S::Answered.apply(E::OfferSent).unwrap(), S::Offered);
    }

    #[test]
    fn test_reset_after_session() {
        assert_eq!(S::Connected.apply(E::Reset).unwrap(), S::Idle);
        assert_eq!(S::Failed.apply(E::Reset).unwrap(), S::Idle);
        assert_eq!(S::Idle.apply(E::Reset).unwrap(), S::Idle);
    }

    #[test]
    fn test_state_predicates() {
        assert!(S::Offered.is_pending());
        assert!(S::Answered.is_pending());
        assert!(!S::Connected.is_pending());
        assert!(S::Failed.is_settled());
        assert!(!S::Idle.accepts_candidates());
        assert!(S::Connected.accepts_candidates());
        assert_eq!(S::Offered.transport(), None);
    }
}
