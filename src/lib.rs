//! webrtc-master - WebRTC broadcast master
//!
//! Bootstraps a signaling channel, captures local media and negotiates one
//! peer connection with every viewer that joins, with a reliable data channel
//! per viewer for text messages.

pub mod config;
pub mod master;
pub mod media;
pub mod peer;
pub mod signaling;

// Re-exports
pub use config::{AnswerPolicy, Config, MasterConfig};
pub use master::{
    ChannelCreation, MasterConnection, MasterError, MasterEvent, MasterState, SessionSnapshot, ViewerState,
};
pub use media::{CaptureConstraints, LocalMediaStream, MediaCapture, VideoView};
pub use peer::{ConnectionStats, DataChannelMessage, PeerConnectionFactory, RtcPeerFactory};
pub use signaling::{HttpBackend, SignalingBackend};
