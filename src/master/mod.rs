//! Broadcast master connection
//!
//! Manages one broadcast session end to end:
//! - Channel creation and lookup on the signaling backend
//! - Local capture and preview
//! - One peer connection and data channel per viewer
//! - Optional server side media ingestion
//! - A shared stats poll and text fan-out to every viewer
//!
//! The session state is owned by a single actor task ([`session`]); the
//! [`MasterConnection`] handle drives it through commands.

pub mod connection;
mod session;
pub mod state;
mod stats;

#[cfg(test)]
mod fakes;

pub use connection::{MasterConnection, MasterConnectionBuilder};
pub use session::SessionSnapshot;
pub use state::{MasterState, ViewerState};

use crate::media::MediaError;
use crate::peer::{ConnectionStats, DataChannelMessage, WebRTCError};
use crate::signaling::SignalingError;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Master connection errors
#[derive(Debug)]
pub enum MasterError {
    Signaling(SignalingError),
    WebRTC(WebRTCError),
    Media(MediaError),
    /// Operation not allowed in the current lifecycle state
    InvalidState(String),
    /// Ingestion requested but the channel has no storage configured
    StorageDisabled,
    /// Storage is enabled but no ingestion stream is associated
    MissingStreamId,
    /// Channel name was empty
    EmptyName,
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterError::Signaling(e) => write!(f, "Signaling error: {}", e),
            MasterError::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            MasterError::Media(e) => write!(f, "Media error: {}", e),
            MasterError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            MasterError::StorageDisabled => write!(f, "Media storage is not enabled for this channel"),
            MasterError::MissingStreamId => write!(f, "No ingestion stream is associated with this channel"),
            MasterError::EmptyName => write!(f, "Channel name must not be empty"),
        }
    }
}

impl Error for MasterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MasterError::Signaling(e) => Some(e),
            MasterError::WebRTC(e) => Some(e),
            MasterError::Media(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SignalingError> for MasterError {
    fn from(e: SignalingError) -> Self {
        MasterError::Signaling(e)
    }
}

impl From<WebRTCError> for MasterError {
    fn from(e: WebRTCError) -> Self {
        MasterError::WebRTC(e)
    }
}

impl From<MediaError> for MasterError {
    fn from(e: MediaError) -> Self {
        MasterError::Media(e)
    }
}

/// Outcome of a channel creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCreation {
    Created { channel_id: String },
    /// Name already in use, the broadcast can still be started on it
    AlreadyExists,
    Failed(String),
}

/// Status notifications for the surrounding application
#[derive(Debug, Clone, PartialEq)]
pub enum MasterEvent {
    ChannelCreated { channel_id: String },
    ChannelAlreadyExists { name: String },
    ChannelCreateFailed(String),
    BroadcastStarted { channel_id: String },
    BroadcastFailed(String),
    BroadcastStopped,
    StopFailed(String),
    ViewerStateChanged { viewer_id: String, state: ViewerState },
    StorageSessionJoined,
    StorageSessionFailed(String),
    SignalingClosed,
    SignalingError(String),
}

/// Stats callback, invoked once per viewer on every stats tick
pub type StatsCallback = Arc<dyn Fn(&ConnectionStats) + Send + Sync>;

/// Inbound data channel message callback
pub type MessageCallback = Arc<dyn Fn(&DataChannelMessage) + Send + Sync>;

/// Status event callback
pub type EventCallback = Arc<dyn Fn(&MasterEvent) + Send + Sync>;
