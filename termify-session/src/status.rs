use serde::Serialize;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    /// Initial state, and the state after an explicit stop
    Stopped,
    /// Channel open in progress
    Starting,
    /// Channel open, output pumping
    Running,
    /// Channel ended without a stop request
    Crashed,
}

impl SessionStatus {
    /// A channel exists or is being opened.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Opened,
    OpenFailed,
    Stop,
    ChannelClosed,
}

/// Pure transition function for the session lifecycle.
///
/// Returns the next status, or `None` when the transition does not apply in
/// `current` and the status must stay as it is.
pub fn next(current: SessionStatus, transition: Transition) -> Option<SessionStatus> {
    use SessionStatus::*;
    use Transition::*;

    match (current, transition) {
        (Stopped | Crashed, Start) => Some(Starting),
        (Starting, Opened) => Some(Running),
        (Starting, OpenFailed) => Some(Crashed),
        (Starting | Running | Crashed, Stop) => Some(Stopped),
        (Running, ChannelClosed) => Some(Crashed),
        _ => None,
    }
}
