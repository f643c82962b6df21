use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    WaitingForIdentity,
    Ready,
    WaitingToRegenerate,
    Regenerating,
    Disconnecting,
    Disconnected,
    Restoring,
    Invalid,
}

/// The outcome of validating a state transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Allowed,
    Rejected,
    /// Rejected, but expected during normal operation and not worth
    /// reporting.
    Skipped,
}

pub const ALL_STATES: [State; 8] = [
    State::WaitingForIdentity,
    State::Ready,
    State::WaitingToRegenerate,
    State::Regenerating,
    State::Disconnecting,
    State::Disconnected,
    State::Restoring,
    State::Invalid,
];

// === impl State ===

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForIdentity => "waiting-for-identity",
            Self::Ready => "ready",
            Self::WaitingToRegenerate => "waiting-to-regenerate",
            Self::Regenerating => "regenerating",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Restoring => "restoring",
            Self::Invalid => "invalid",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Invalid)
    }

    /// Whether endpoints in this state are counted by the state gauge.
    pub(crate) fn is_counted(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a transition requested by any caller holding the endpoint lock.
pub(crate) fn transition(from: Option<State>, to: State) -> Transition {
    use State::*;

    let allowed = match from {
        None => matches!(to, WaitingForIdentity | Restoring),
        Some(WaitingForIdentity) => matches!(to, Ready | Disconnecting | Invalid),
        Some(Ready) => matches!(
            to,
            WaitingForIdentity | Disconnecting | WaitingToRegenerate | Restoring
        ),
        Some(Disconnecting) => matches!(to, Disconnected),
        Some(Disconnected) | Some(Invalid) => false,
        Some(WaitingToRegenerate) => match to {
            Disconnecting | Restoring => true,
            // A build is already queued; re-queueing or resetting identity
            // would break it.
            WaitingForIdentity | WaitingToRegenerate => return Transition::Skipped,
            _ => false,
        },
        Some(Regenerating) => matches!(
            to,
            WaitingForIdentity | Disconnecting | WaitingToRegenerate | Restoring
        ),
        Some(Restoring) => matches!(to, Disconnecting | Restoring),
    };

    if allowed {
        Transition::Allowed
    } else {
        Transition::Rejected
    }
}

/// Validates a transition requested by the builder, which holds the build
/// lock in addition to the endpoint lock.
pub(crate) fn builder_transition(from: Option<State>, to: State) -> Transition {
    use State::*;

    match (from, to) {
        (Some(WaitingToRegenerate | Restoring), Regenerating) => Transition::Allowed,
        // Another build was queued while this one ran.
        (Some(WaitingToRegenerate | Restoring), Ready) => Transition::Skipped,
        (Some(Regenerating), Ready) => Transition::Allowed,
        _ => Transition::Rejected,
    }
}
