//! webrtc-rs backed peer connections
//!
//! Handles the creation and lifecycle of RTCPeerConnection instances, one per
//! viewer, and forwards their callbacks as [`PeerEvent`]s.

use super::{
    ConnectionStats, DataChannel, DataChannelMessage, IceCandidate, IceServer, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender, PeerState, RemoteTrack, SdpKind, SessionDescription,
    WebRTCError,
};
use crate::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RtcMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// Creates webrtc-rs peer connections with default codecs and interceptors
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        viewer_id: &str,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        let peer = RtcPeer {
            viewer_id: viewer_id.to_string(),
            pc: Arc::new(peer_connection),
            events,
        };
        peer.setup_callbacks();

        info!("Created peer connection for viewer {}", viewer_id);
        Ok(Arc::new(peer))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, WebRTCError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(WebRTCError::SdpError("Rollback descriptions are not supported".to_string()))
        }
    };
    parsed.map_err(|e| WebRTCError::SdpError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Answer,
    };
    SessionDescription { kind, sdp: desc.sdp }
}

/// Forward message events of a data channel into the peer event stream
fn forward_messages(channel: &Arc<RTCDataChannel>, viewer_id: String, events: PeerEventSender) {
    let label = channel.label().to_string();
    channel.on_message(Box::new(move |msg: RtcMessage| {
        let message = DataChannelMessage {
            viewer_id: viewer_id.clone(),
            label: label.clone(),
            is_string: msg.is_string,
            data: msg.data,
        };
        let _ = events.send(PeerEvent::Message(message));
        Box::pin(async {})
    }));
}

/// A single viewer's RTCPeerConnection
pub struct RtcPeer {
    viewer_id: String,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

impl RtcPeer {
    fn setup_callbacks(&self) {
        let viewer_id = self.viewer_id.clone();
        let events = self.events.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = events.send(PeerEvent::StateChanged {
                viewer_id: viewer_id.clone(),
                state: state.into(),
            });
            Box::pin(async {})
        }));

        let viewer_id = self.viewer_id.clone();
        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            let candidate = match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => Some(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Some(Err(e)) => {
                    warn!("Viewer {}: failed to serialize local candidate: {}", viewer_id, e);
                    None
                }
                None => Some(None),
            };
            if let Some(candidate) = candidate {
                let _ = events.send(PeerEvent::IceCandidate {
                    viewer_id: viewer_id.clone(),
                    candidate,
                });
            }
            Box::pin(async {})
        }));

        let viewer_id = self.viewer_id.clone();
        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: track.kind().into(),
                };
                let _ = events.send(PeerEvent::Track {
                    viewer_id: viewer_id.clone(),
                    track: remote,
                });
                Box::pin(async {})
            },
        ));

        // Channels opened by the viewer deliver inbound messages the same way
        let viewer_id = self.viewer_id.clone();
        let events = self.events.clone();
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!("Viewer {} opened data channel {}", viewer_id, channel.label());
            forward_messages(&channel, viewer_id.clone(), events.clone());
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, WebRTCError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Failed to create data channel: {}", e)))?;

        forward_messages(&channel, self.viewer_id.clone(), self.events.clone());

        Ok(Arc::new(RtcDataChannel {
            label: label.to_string(),
            channel,
        }))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.rtp().clone();
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<ConnectionStats, WebRTCError> {
        let report = self.pc.get_stats().await;
        let mut stats = ConnectionStats {
            viewer_id: self.viewer_id.clone(),
            report_count: report.reports.len(),
            ..Default::default()
        };

        for (_, value) in report.reports {
            if let StatsReportType::CandidatePair(pair) = value {
                if pair.nominated {
                    stats.selected_pair = Some(format!(
                        "{}:{}",
                        pair.local_candidate_id, pair.remote_candidate_id
                    ));
                    stats.bytes_sent = pair.bytes_sent as u64;
                    stats.bytes_received = pair.bytes_received as u64;
                    stats.round_trip_time = Some(pair.current_round_trip_time as f64);
                }
            }
        }

        Ok(stats)
    }

    fn state(&self) -> PeerState {
        self.pc.connection_state().into()
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.pc
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}

/// Reliable ordered data channel to one viewer
pub struct RtcDataChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), WebRTCError> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| WebRTCError::DataChannelError(format!("Send failed: {}", e)))
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.channel
            .close()
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Close failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_peer_state_from_rtc_state() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::New), PeerState::New);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Failed), PeerState::Failed);
    }

    #[test]
    fn test_ice_server_conversion() {
        let server = IceServer {
            urls: vec!["turn:turn.example.com:443?transport=tcp".to_string()],
            username: Some("user".to_string()),
            credential: None,
        };
        let rtc = to_rtc_ice_server(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "user");
        assert!(rtc.credential.is_empty());
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription { kind: SdpKind::Rollback, sdp: String::new() };
        assert!(to_rtc_description(desc).is_err());
    }

    #[tokio::test]
    async fn test_factory_creates_peer_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = RtcPeerFactory::new();
        let peer = factory.create("viewer-1", &[], PeerEventSender::new(1, tx)).await.unwrap();
        assert_eq!(peer.state(), PeerState::New);
        let channel = peer.create_data_channel("kvsDataChannel").await.unwrap();
        assert_eq!(channel.label(), "kvsDataChannel");
        peer.close().await.unwrap();
    }
}
