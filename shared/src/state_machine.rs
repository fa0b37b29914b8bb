//! Link State Machine
//!
//! Defines the valid connection state transitions of a display link.

use std::fmt;

/// Connectivity of the single display link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connect attempt started
    ConnectRequested,
    /// The transport reported an established link
    ConnectSucceeded,
    /// The connect attempt failed or was abandoned
    ConnectFailed,
    /// The link dropped without being asked to
    LinkDropped,
    /// Explicit teardown by the application
    DisconnectRequested,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ConnectionState),
    /// Event left the state as it was (idempotent teardown)
    Unchanged(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The state machine guarding a single display link
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
    connections: u64,
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Number of links established over the lifetime of this machine
    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        if self.current_state == ConnectionState::Disconnected
            && event == LinkEvent::DisconnectRequested
        {
            return TransitionResult::Unchanged(self.current_state);
        }

        match self.get_next_state(event) {
            Some(state) => {
                if state == ConnectionState::Connected {
                    self.connections += 1;
                }
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.current_state, event) {
            (Disconnected, ConnectRequested) => Some(Connecting),

            (Connecting, ConnectSucceeded) => Some(Connected),
            (Connecting, ConnectFailed) => Some(Disconnected),
            // Abandoned attempt torn down by the application
            (Connecting, DisconnectRequested) => Some(Disconnected),

            (Connected, LinkDropped) => Some(Disconnected),
            (Connected, DisconnectRequested) => Some(Disconnected),

            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
    )
}
