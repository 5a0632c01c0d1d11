//! Session and viewer lifecycle states

use crate::peer::PeerState;
use std::fmt;

/// Lifecycle of a [`MasterConnection`](super::MasterConnection)
///
/// `Idle -> Connecting -> Open -> Closed`. `Closed` is terminal, a new
/// instance is needed to broadcast again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Idle,
    /// Setup sequence in progress
    Connecting,
    /// Signaling open, accepting viewers
    Open,
    Closed,
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MasterState::Idle => "idle",
            MasterState::Connecting => "connecting",
            MasterState::Open => "open",
            MasterState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-viewer negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Offer received, ICE in progress
    Negotiating,
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    Failed,
    Closed,
}

impl From<PeerState> for ViewerState {
    fn from(state: PeerState) -> Self {
        match state {
            PeerState::New | PeerState::Connecting => ViewerState::Negotiating,
            PeerState::Connected => ViewerState::Connected,
            PeerState::Disconnected => ViewerState::Disconnected,
            PeerState::Failed => ViewerState::Failed,
            PeerState::Closed => ViewerState::Closed,
        }
    }
}
