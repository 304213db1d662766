//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallState {
    /// Negotiating a transport path.
    #[default]
    Initializing,
    /// A transport path is established and carrying media.
    Connected,
    /// Terminal: no path could be established or the path was lost.
    Failed,
}

impl CallState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Events that move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// The first transport negotiation succeeded.
    PathEstablished,
    /// Every candidate path was exhausted.
    NegotiationFailed,
    /// The active path died and could not be replaced.
    TransportLost,
}

/// Tracks the state of one session and enforces the allowed edges.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: CallState,
    connected_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    /// Apply a transition, returning the new state.
    ///
    /// Only Initializing→Connected, Initializing→Failed and Connected→Failed
    /// exist. Anything else leaves the state untouched and returns an error.
    pub fn apply(&mut self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let new_state = match (self.state, transition) {
            (CallState::Initializing, CallTransition::PathEstablished) => {
                self.connected_at = Some(Utc::now());
                CallState::Connected
            }
            (
                CallState::Initializing | CallState::Connected,
                CallTransition::NegotiationFailed | CallTransition::TransportLost,
            ) => {
                self.failed_at = Some(Utc::now());
                CallState::Failed
            }
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: current,
                    attempted,
                });
            }
        };
        self.state = new_state;
        Ok(new_state)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: CallState,
    pub attempted: CallTransition,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {:?}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Initializing → Connected → Failed
    #[test]
    fn test_connect_then_lose_transport() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(machine.state(), CallState::Initializing);

        assert_eq!(
            machine.apply(CallTransition::PathEstablished).unwrap(),
            CallState::Connected
        );
        assert!(machine.connected_at().is_some());

        assert_eq!(
            machine.apply(CallTransition::TransportLost).unwrap(),
            CallState::Failed
        );
        assert!(machine.failed_at().is_some());
    }

    #[test]
    fn test_negotiation_failure_from_initializing() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(
            machine.apply(CallTransition::NegotiationFailed).unwrap(),
            CallState::Failed
        );
        assert!(machine.connected_at().is_none());
    }

    #[test]
    fn test_second_path_established_is_rejected() {
        let mut machine = SessionStateMachine::new();
        machine.apply(CallTransition::PathEstablished).unwrap();

        let err = machine.apply(CallTransition::PathEstablished).unwrap_err();
        assert_eq!(err.current_state, CallState::Connected);
        assert_eq!(machine.state(), CallState::Connected);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut machine = SessionStateMachine::new();
        machine.apply(CallTransition::NegotiationFailed).unwrap();
        assert!(machine.state().is_terminal());

        for transition in [
            CallTransition::PathEstablished,
            CallTransition::NegotiationFailed,
            CallTransition::TransportLost,
        ] {
            assert!(machine.apply(transition).is_err());
            assert_eq!(machine.state(), CallState::Failed);
        }
    }
}
