use std::fmt;

/// Lifecycle of the single logical connection to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Transition table. `None` means the event does not move the machine.
    pub(crate) fn next(self, event: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;
        use Transition::*;

        match (self, event) {
            (Disconnected | Failed, Connect) => Some(Connecting),
            (Disconnected, RetryDue) => Some(Connecting),
            (Connecting, Opened) => Some(Connected),
            (Connecting, AttemptFailed) => Some(Disconnected),
            (Connected, Closed) => Some(Disconnected),
            (Disconnected | Connecting, RetriesExhausted) => Some(Failed),
            (Connecting | Connected | Failed, Disconnect) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Connect,
    RetryDue,
    Opened,
    AttemptFailed,
    Closed,
    RetriesExhausted,
    Disconnect,
}
