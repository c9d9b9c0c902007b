//! Session state machine for patchsync.
//!
//! This module provides a pure, side-effect-free state machine for a watch
//! session. The state machine takes events as input and produces a new state
//! plus a list of actions to execute.
//!
//! The actual I/O (connecting, timers, plugin hooks) is performed by
//! sync-client, not by this module. This enables instant unit testing
//! without transport mocks.

/// Session state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not bound to any object.
    #[default]
    Idle,
    /// Bound to an object; mutations are diffed and either sent or queued.
    Watching(LinkState),
}

/// Transport sub-state of [`SessionState::Watching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The transport is up; patches go straight out.
    Connected,
    /// The transport is down; patches go to the offline queue.
    Disconnected,
}

impl SessionState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        use LinkState::{Connected, Disconnected};

        match (self, event) {
            // From Idle
            (Self::Idle, Event::WatchRequested) => {
                (Self::Watching(Disconnected), vec![Action::Connect])
            }

            // From Watching(Disconnected)
            (Self::Watching(Disconnected), Event::ConnectSucceeded) => (
                Self::Watching(Connected),
                vec![
                    Action::StartReceiving,
                    Action::FlushQueue,
                    Action::EmitEvent(SessionEvent::Connected),
                ],
            ),
            (Self::Watching(Disconnected), Event::ConnectFailed { error }) => (
                Self::Watching(Disconnected),
                vec![Action::EmitEvent(SessionEvent::ConnectFailed { error })],
            ),
            (Self::Watching(Disconnected), Event::ReconnectRequested) => {
                (Self::Watching(Disconnected), vec![Action::Connect])
            }

            // From Watching(Connected)
            (Self::Watching(Connected), Event::ConnectionLost { reason }) => (
                Self::Watching(Disconnected),
                vec![Action::EmitEvent(SessionEvent::Disconnected { reason })],
            ),

            // Unwatch ends the session from either sub-state
            (Self::Watching(link), Event::UnwatchRequested) => {
                let mut actions = vec![
                    Action::CancelTimers,
                    Action::DestroyPlugins,
                    Action::Disconnect,
                    Action::ResetBaseline,
                ];
                if link == Connected {
                    actions.push(Action::EmitEvent(SessionEvent::Disconnected {
                        reason: "unwatched".into(),
                    }));
                }
                (Self::Idle, actions)
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a session is active.
    pub fn is_watching(&self) -> bool {
        matches!(self, Self::Watching(_))
    }

    /// Check if the transport is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Watching(LinkState::Connected))
    }
}

/// Events that can occur in the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `watch` was called.
    WatchRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The transport dropped or a send found it disconnected.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Caller asked to retry the connection.
    ReconnectRequested,
    /// `unwatch` was called.
    UnwatchRequested,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Initiate transport connection.
    Connect,
    /// Start the receive loop.
    StartReceiving,
    /// Replay the offline queue.
    FlushQueue,
    /// Cancel debounce/throttle timers.
    CancelTimers,
    /// Run `on_destroy` on every plugin.
    DestroyPlugins,
    /// Disconnect the transport.
    Disconnect,
    /// Clear the diff baseline.
    ResetBaseline,
    /// Emit an event to the application.
    EmitEvent(SessionEvent),
}

/// Lifecycle events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport connected.
    Connected,
    /// Transport disconnected.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Connection attempt failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
}
