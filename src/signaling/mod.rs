//! Signaling service integration
//!
//! Two ports separate the master from any particular cloud SDK:
//! - [`SignalingBackend`]: the control plane (channel create/describe,
//!   endpoint and ICE server resolution, storage configuration)
//! - [`SignalingClient`]: the per-session signaling connection carrying
//!   offers, answers and candidates keyed by viewer id
//!
//! The HTTP and WebSocket implementations live in [`http`] and [`websocket`],
//! sharing the wire codec in [`message`].

pub mod http;
pub mod message;
pub mod websocket;

pub use http::HttpBackend;
pub use websocket::WsSignalingClient;

use crate::peer::{IceCandidate, IceServer, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Debug)]
pub enum SignalingError {
    /// Channel name already in use
    AlreadyExists,
    /// Channel does not exist
    NotFound,
    /// Backend did not return an endpoint for a requested protocol
    MissingEndpoint(Protocol),
    /// Control plane request failed
    RequestFailed(String),
    /// Signaling connection could not be established
    ConnectionFailed(String),
    /// Malformed signaling message
    ProtocolError(String),
    /// Connection already closed
    Closed,
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::AlreadyExists => write!(f, "Signaling channel already exists"),
            SignalingError::NotFound => write!(f, "Signaling channel not found"),
            SignalingError::MissingEndpoint(p) => write!(f, "No endpoint returned for protocol {}", p),
            SignalingError::RequestFailed(msg) => write!(f, "Request failed: {}", msg),
            SignalingError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            SignalingError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            SignalingError::Closed => write!(f, "Signaling connection closed"),
        }
    }
}

impl Error for SignalingError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Master,
    Viewer,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Master => "MASTER",
            ChannelRole::Viewer => "VIEWER",
        }
    }
}

/// Negotiation transports an endpoint can be resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Signaling WebSocket
    Wss,
    /// Control requests such as ICE server config
    Https,
    /// Media ingestion
    Webrtc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Wss => "WSS",
            Protocol::Https => "HTTPS",
            Protocol::Webrtc => "WEBRTC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WSS" => Some(Protocol::Wss),
            "HTTPS" => Some(Protocol::Https),
            "WEBRTC" => Some(Protocol::Webrtc),
            _ => None,
        }
    }

    /// Transports to resolve for a broadcast, ingestion adds `Webrtc`
    pub fn for_session(enable_media_ingestion: bool) -> Vec<Protocol> {
        let mut protocols = vec![Protocol::Wss, Protocol::Https];
        if enable_media_ingestion {
            protocols.push(Protocol::Webrtc);
        }
        protocols
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved endpoint per protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints(HashMap<Protocol, String>);

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, protocol: Protocol, url: impl Into<String>) {
        self.0.insert(protocol, url.into());
    }

    pub fn get(&self, protocol: Protocol) -> Result<&str, SignalingError> {
        self.0
            .get(&protocol)
            .map(String::as_str)
            .ok_or(SignalingError::MissingEndpoint(protocol))
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.0.contains_key(&protocol)
    }
}

impl FromIterator<(Protocol, String)> for Endpoints {
    fn from_iter<I: IntoIterator<Item = (Protocol, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStorageConfig {
    pub enabled: bool,
    pub stream_id: Option<String>,
}

/// Parameters that bind a signaling connection to one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingClientConfig {
    pub channel_id: String,
    pub wss_endpoint: String,
    pub region: String,
    pub role: ChannelRole,
    /// Required for viewers, unused by the master
    pub client_id: Option<String>,
}

/// Inbound signaling events
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Open,
    SdpOffer { offer: SessionDescription, viewer_id: String },
    IceCandidate { candidate: IceCandidate, viewer_id: String },
    Close,
    Error(String),
}

/// Signaling control plane
#[async_trait]
pub trait SignalingBackend: Send + Sync {
    /// Region the backend is bound to
    fn region(&self) -> &str;

    async fn create_signaling_channel(&self, name: &str) -> Result<(), SignalingError>;

    async fn describe_signaling_channel(&self, name: &str) -> Result<ChannelInfo, SignalingError>;

    async fn describe_media_storage_configuration(&self, channel_id: &str) -> Result<MediaStorageConfig, SignalingError>;

    async fn get_signaling_channel_endpoints(
        &self,
        channel_id: &str,
        role: ChannelRole,
        protocols: &[Protocol],
    ) -> Result<Endpoints, SignalingError>;

    async fn get_ice_server_config(&self, channel_id: &str, https_endpoint: &str) -> Result<Vec<IceServer>, SignalingError>;

    /// Build the signaling connection for a channel. It is opened separately.
    async fn connect(&self, config: SignalingClientConfig) -> Result<Box<dyn SignalingClient>, SignalingError>;

    async fn storage_client(&self, webrtc_endpoint: &str) -> Result<Arc<dyn MediaStorageClient>, SignalingError>;
}

/// Signaling connection of one broadcast session
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Open the connection. The first event delivered is [`SignalingEvent::Open`].
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

    async fn send_sdp_answer(&self, answer: &SessionDescription, viewer_id: &str) -> Result<(), SignalingError>;

    async fn send_ice_candidate(&self, candidate: &IceCandidate, viewer_id: &str) -> Result<(), SignalingError>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> Result<(), SignalingError>;
}

/// Server side media recording
#[async_trait]
pub trait MediaStorageClient: Send + Sync {
    async fn join_storage_session(&self, channel_id: &str) -> Result<(), SignalingError>;
}
