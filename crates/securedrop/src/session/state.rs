//! Session states

use crate::signaling::SessionDescription;

/// User-visible state of the single SecureDrop session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session
    #[default]
    Idle,

    /// Offer sent to `target_id`, awaiting an answer
    Waiting { target_id: String },

    /// Offer received from `from_id`, awaiting a local decision
    Confirm {
        from_id: String,
        sdp: SessionDescription,
    },

    /// Session established with `peer_id`
    Chat { peer_id: String },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// The other member of the session, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SessionState::Idle => None,
            SessionState::Waiting { target_id } => Some(target_id),
            SessionState::Confirm { from_id, .. } => Some(from_id),
            SessionState::Chat { peer_id } => Some(peer_id),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Waiting { .. } => "waiting",
            SessionState::Confirm { .. } => "confirm",
            SessionState::Chat { .. } => "chat",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer_id() {
            Some(peer) => write!(f, "{}({})", self.name(), peer),
            None => f.write_str(self.name()),
        }
    }
}
