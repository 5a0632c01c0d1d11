//! Per-viewer peer connection primitive
//!
//! This module defines the narrow interface the broadcast master drives for
//! every remote viewer:
//! - SDP offer/answer application
//! - ICE candidate exchange
//! - Reliable ordered data channels
//! - Connection statistics
//!
//! The production implementation over webrtc-rs lives in [`rtc`].

pub mod rtc;

pub use rtc::RtcPeerFactory;

use crate::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation or teardown failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Media track error
    MediaError(String),
    /// Statistics collection failed
    StatsError(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::StatsError(msg) => write!(f, "Stats error: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

/// SDP type carried next to the session description text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in its browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate type (`host`, `srflx`, `relay`, ...) parsed from the candidate line
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        parts.by_ref().find(|p| *p == "typ")?;
        parts.next()
    }
}

/// ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether the connection can still carry traffic
    pub fn is_open(&self) -> bool {
        !matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// Track received from a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Inbound data channel message
#[derive(Debug, Clone)]
pub struct DataChannelMessage {
    pub viewer_id: String,
    pub label: String,
    pub is_string: bool,
    pub data: Bytes,
}

impl DataChannelMessage {
    /// Message payload as text, lossy for binary messages
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Connection statistics for one viewer, gathered on each stats tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub viewer_id: String,
    /// Number of reports returned by the peer connection
    pub report_count: usize,
    /// `local:remote` ids of the nominated candidate pair
    pub selected_pair: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Current round trip time in seconds on the nominated pair
    pub round_trip_time: Option<f64>,
}

/// Events produced by a peer connection, tagged with the viewer they belong to
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged { viewer_id: String, state: PeerState },
    /// `None` signals that candidate gathering has completed
    IceCandidate { viewer_id: String, candidate: Option<IceCandidate> },
    Track { viewer_id: String, track: RemoteTrack },
    Message(DataChannelMessage),
}

impl PeerEvent {
    pub fn viewer_id(&self) -> &str {
        match self {
            PeerEvent::StateChanged { viewer_id, .. } => viewer_id,
            PeerEvent::IceCandidate { viewer_id, .. } => viewer_id,
            PeerEvent::Track { viewer_id, .. } => viewer_id,
            PeerEvent::Message(msg) => &msg.viewer_id,
        }
    }
}

/// Sending half of the peer event stream handed to one peer connection.
/// Every event it sends is tagged with the link it was created for, so
/// events of a replaced connection can be told apart from its successor's.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    link: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(link: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { link, tx }
    }

    pub fn link(&self) -> u64 {
        self.link
    }

    /// False once the receiving session is gone
    pub fn send(&self, event: PeerEvent) -> bool {
        self.tx.send((self.link, event)).is_ok()
    }
}

/// Creates one peer connection per viewer
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection for `viewer_id`. Every callback of the
    /// underlying primitive is forwarded into `events`.
    async fn create(
        &self,
        viewer_id: &str,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create a reliable ordered data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, WebRTCError>;

    /// Send a local track to the viewer
    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError>;

    /// Create an answer that receives both audio and video
    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError>;

    async fn stats(&self) -> Result<ConnectionStats, WebRTCError>;

    fn state(&self) -> PeerState;

    async fn close(&self) -> Result<(), WebRTCError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<(), WebRTCError>;

    async fn close(&self) -> Result<(), WebRTCError>;
}
