use serde::{Deserialize, Serialize};

/// Recording session state machine.
///
/// State transitions:
/// ```text
/// idle → starting → recording → stopping → stopped
///           ↓           ↓          ↓
///         failed      failed     failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Recording => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn is_recording(self) -> bool {
        self == Self::Recording
    }

    /// Whether `next` is a legal successor. Transitions only move forward;
    /// `Failed` is reachable from every active state and is terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => self != Self::Idle,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a recording left the `Recording` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured maximum duration elapsed.
    DurationElapsed,
    /// The cancellation token was triggered programmatically.
    Cancelled,
    /// A process signal (SIGINT, SIGTERM, Ctrl+C) requested the stop.
    Signal(i32),
    /// `stop()` was called directly on the session.
    Requested,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DurationElapsed => f.write_str("duration elapsed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Signal(sig) => write!(f, "signal {}", sig),
            Self::Requested => f.write_str("stop requested"),
        }
    }
}
