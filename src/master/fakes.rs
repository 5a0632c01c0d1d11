//! In-memory implementations of every port, for master tests

use crate::media::{CaptureConstraints, LocalMediaStream, LocalTrack, MediaCapture, MediaError, TrackKind, VideoView};
use crate::peer::{
    ConnectionStats, DataChannel, DataChannelMessage, IceCandidate, IceServer, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerEventSender, PeerState, SessionDescription, WebRTCError,
};
use crate::signaling::{
    ChannelInfo, ChannelRole, Endpoints, MediaStorageClient, MediaStorageConfig, Protocol, SignalingBackend,
    SignalingClient, SignalingClientConfig, SignalingError, SignalingEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct FakeBackend {
    channels: Mutex<HashMap<String, String>>,
    storage_config: Mutex<MediaStorageConfig>,
    create_failure: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    protocols: Mutex<Vec<Protocol>>,
    pub signaling: Arc<FakeSignaling>,
    pub storage: Arc<FakeStorage>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            storage_config: Mutex::new(MediaStorageConfig::default()),
            create_failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            protocols: Mutex::new(Vec::new()),
            signaling: Arc::new(FakeSignaling::default()),
            storage: Arc::new(FakeStorage::default()),
        }
    }

    pub fn with_channel(name: &str) -> Self {
        let backend = Self::new();
        backend.channels.lock().insert(name.to_string(), channel_arn(name));
        backend
    }

    pub fn describe_channel(&self, name: &str) -> Option<String> {
        self.channels.lock().get(name).cloned()
    }

    pub fn fail_create(&self, reason: &str) {
        *self.create_failure.lock() = Some(reason.to_string());
    }

    pub fn set_storage(&self, enabled: bool, stream_id: Option<&str>) {
        *self.storage_config.lock() = MediaStorageConfig {
            enabled,
            stream_id: stream_id.map(str::to_string),
        };
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn requested_protocols(&self) -> Vec<Protocol> {
        self.protocols.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

fn channel_arn(name: &str) -> String {
    format!("arn:aws:kinesisvideo:us-west-2:123456789012:channel/{}/1", name)
}

#[async_trait]
impl SignalingBackend for FakeBackend {
    fn region(&self) -> &str {
        "us-west-2"
    }

    async fn create_signaling_channel(&self, name: &str) -> Result<(), SignalingError> {
        self.record("create");
        if let Some(reason) = self.create_failure.lock().clone() {
            return Err(SignalingError::RequestFailed(reason));
        }
        let mut channels = self.channels.lock();
        if channels.contains_key(name) {
            return Err(SignalingError::AlreadyExists);
        }
        channels.insert(name.to_string(), channel_arn(name));
        Ok(())
    }

    async fn describe_signaling_channel(&self, name: &str) -> Result<ChannelInfo, SignalingError> {
        self.record("describe");
        let channel_id = self.describe_channel(name).ok_or(SignalingError::NotFound)?;
        Ok(ChannelInfo {
            channel_id,
            name: name.to_string(),
            status: "ACTIVE".to_string(),
        })
    }

    async fn describe_media_storage_configuration(&self, _channel_id: &str) -> Result<MediaStorageConfig, SignalingError> {
        self.record("storage_config");
        Ok(self.storage_config.lock().clone())
    }

    async fn get_signaling_channel_endpoints(
        &self,
        _channel_id: &str,
        _role: ChannelRole,
        protocols: &[Protocol],
    ) -> Result<Endpoints, SignalingError> {
        self.record("endpoints");
        *self.protocols.lock() = protocols.to_vec();
        Ok(protocols
            .iter()
            .map(|p| {
                let url = match p {
                    Protocol::Wss => "wss://signaling.fake",
                    Protocol::Https => "https://signaling.fake",
                    Protocol::Webrtc => "https://webrtc.fake",
                };
                (*p, url.to_string())
            })
            .collect())
    }

    async fn get_ice_server_config(&self, _channel_id: &str, _https_endpoint: &str) -> Result<Vec<IceServer>, SignalingError> {
        self.record("ice");
        Ok(vec![IceServer {
            urls: vec!["turn:turn.fake:443?transport=udp".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        }])
    }

    async fn connect(&self, _config: SignalingClientConfig) -> Result<Box<dyn SignalingClient>, SignalingError> {
        self.record("connect");
        Ok(Box::new(FakeSignalingClient {
            shared: self.signaling.clone(),
        }))
    }

    async fn storage_client(&self, _webrtc_endpoint: &str) -> Result<Arc<dyn MediaStorageClient>, SignalingError> {
        self.record("storage_client");
        Ok(self.storage.clone())
    }
}

/// Recorder shared between the test and the signaling client it hands out
#[derive(Default)]
pub(crate) struct FakeSignaling {
    sender: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    answers: Mutex<Vec<(String, SessionDescription)>>,
    candidates: Mutex<Vec<(String, IceCandidate)>>,
    opened: AtomicBool,
    closed: AtomicBool,
    fail_open: AtomicBool,
    fail_close: AtomicBool,
}

impl FakeSignaling {
    /// Deliver an inbound event as if it came from the service
    pub fn emit(&self, event: SignalingEvent) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn answers(&self) -> Vec<(String, SessionDescription)> {
        self.answers.lock().clone()
    }

    pub fn candidates(&self) -> Vec<(String, IceCandidate)> {
        self.candidates.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

struct FakeSignalingClient {
    shared: Arc<FakeSignaling>,
}

#[async_trait]
impl SignalingClient for FakeSignalingClient {
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionFailed("refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SignalingEvent::Open);
        *self.shared.sender.lock() = Some(tx);
        self.shared.opened.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send_sdp_answer(&self, answer: &SessionDescription, viewer_id: &str) -> Result<(), SignalingError> {
        self.shared.answers.lock().push((viewer_id.to_string(), answer.clone()));
        Ok(())
    }

    async fn send_ice_candidate(&self, candidate: &IceCandidate, viewer_id: &str) -> Result<(), SignalingError> {
        self.shared.candidates.lock().push((viewer_id.to_string(), candidate.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        if self.shared.fail_close.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionFailed("close failed".to_string()));
        }
        self.shared.sender.lock().take();
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeStorage {
    joins: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeStorage {
    pub fn joins(&self) -> Vec<String> {
        self.joins.lock().clone()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaStorageClient for FakeStorage {
    async fn join_storage_session(&self, channel_id: &str) -> Result<(), SignalingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignalingError::RequestFailed("storage unavailable".to_string()));
        }
        self.joins.lock().push(channel_id.to_string());
        Ok(())
    }
}

pub(crate) struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    ice_servers: Mutex<HashMap<String, Vec<IceServer>>>,
    failing_sends: Mutex<HashSet<String>>,
    failing_creates: Mutex<HashSet<String>>,
    failing_channels: Mutex<HashSet<String>>,
    failing_negotiations: Mutex<HashSet<String>>,
    gathered: Vec<IceCandidate>,
}

impl FakePeerFactory {
    /// Peers whose gathering completes with no candidates
    pub fn new() -> Self {
        Self::with_gathered(Vec::new())
    }

    /// Peers that emit `gathered` once the local description is set
    pub fn with_gathered(gathered: Vec<IceCandidate>) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(HashMap::new()),
            failing_sends: Mutex::new(HashSet::new()),
            failing_creates: Mutex::new(HashSet::new()),
            failing_channels: Mutex::new(HashSet::new()),
            failing_negotiations: Mutex::new(HashSet::new()),
            gathered,
        }
    }

    pub fn fail_sends_for(&self, viewer_id: &str) {
        self.failing_sends.lock().insert(viewer_id.to_string());
    }

    /// `create` fails for `viewer_id` without producing a peer
    pub fn fail_create_for(&self, viewer_id: &str) {
        self.failing_creates.lock().insert(viewer_id.to_string());
    }

    /// Peers for `viewer_id` refuse to open a data channel
    pub fn fail_data_channel_for(&self, viewer_id: &str) {
        self.failing_channels.lock().insert(viewer_id.to_string());
    }

    /// Peers for `viewer_id` reject the remote offer
    pub fn fail_negotiation_for(&self, viewer_id: &str) {
        self.failing_negotiations.lock().insert(viewer_id.to_string());
    }

    /// Every peer created for `viewer_id`, oldest first
    pub fn peers_for(&self, viewer_id: &str) -> Vec<Arc<FakePeer>> {
        self.peers.lock().iter().filter(|p| p.viewer_id == viewer_id).cloned().collect()
    }

    /// Most recent peer created for `viewer_id`
    pub fn peer(&self, viewer_id: &str) -> Option<Arc<FakePeer>> {
        self.peers.lock().iter().rev().find(|p| p.viewer_id == viewer_id).cloned()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn ice_servers_for(&self, viewer_id: &str) -> Option<Vec<IceServer>> {
        self.ice_servers.lock().get(viewer_id).cloned()
    }

    /// `(viewer, text)` for every delivered message
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        let peers = self.peers.lock();
        peers
            .iter()
            .flat_map(|peer| {
                let channels = peer.channels.lock();
                channels
                    .iter()
                    .flat_map(|c| c.sent.lock().clone())
                    .map(|text| (peer.viewer_id.clone(), text))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn all_channels_closed(&self) -> bool {
        self.peers
            .lock()
            .iter()
            .all(|p| p.channels.lock().iter().all(|c| c.closed.load(Ordering::SeqCst)))
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        viewer_id: &str,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        if self.failing_creates.lock().contains(viewer_id) {
            return Err(WebRTCError::ConnectionFailed("no transport".to_string()));
        }
        self.ice_servers.lock().insert(viewer_id.to_string(), ice_servers.to_vec());
        let peer = Arc::new(FakePeer {
            viewer_id: viewer_id.to_string(),
            events,
            state: Mutex::new(PeerState::New),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gathered: self.gathered.clone(),
            fail_sends: self.failing_sends.lock().contains(viewer_id),
            fail_channel: self.failing_channels.lock().contains(viewer_id),
            fail_negotiation: self.failing_negotiations.lock().contains(viewer_id),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub(crate) struct FakePeer {
    viewer_id: String,
    events: PeerEventSender,
    state: Mutex<PeerState>,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    closed: AtomicBool,
    gathered: Vec<IceCandidate>,
    fail_sends: bool,
    fail_channel: bool,
    fail_negotiation: bool,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        self.events.send(event);
    }

    pub fn receive_text(&self, label: &str, text: &str) {
        self.emit(PeerEvent::Message(DataChannelMessage {
            viewer_id: self.viewer_id.clone(),
            label: label.to_string(),
            is_string: true,
            data: Bytes::from(text.to_string()),
        }));
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> bool {
        self.channels.lock().iter().all(|c| c.closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, WebRTCError> {
        if self.fail_channel {
            return Err(WebRTCError::DataChannelError("sctp unavailable".to_string()));
        }
        let channel = Arc::new(FakeDataChannel {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            fail: self.fail_sends,
            closed: AtomicBool::new(false),
        });
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError> {
        self.tracks.lock().push(track.id().to_string());
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        if self.fail_negotiation {
            return Err(WebRTCError::SdpError("malformed offer".to_string()));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        if self.remote.lock().is_none() {
            return Err(WebRTCError::SdpError("no remote description".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-for-{}", self.viewer_id)))
    }

    /// Gathering completes synchronously: candidates then the `None` signal
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        *self.local.lock() = Some(desc);
        for candidate in &self.gathered {
            self.emit(PeerEvent::IceCandidate {
                viewer_id: self.viewer_id.clone(),
                candidate: Some(candidate.clone()),
            });
        }
        self.emit(PeerEvent::IceCandidate {
            viewer_id: self.viewer_id.clone(),
            candidate: None,
        });
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<ConnectionStats, WebRTCError> {
        Ok(ConnectionStats {
            viewer_id: self.viewer_id.clone(),
            report_count: 1,
            ..Default::default()
        })
    }

    fn state(&self) -> PeerState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = PeerState::Closed;
        Ok(())
    }
}

pub(crate) struct FakeDataChannel {
    label: String,
    sent: Mutex<Vec<String>>,
    fail: bool,
    closed: AtomicBool,
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), WebRTCError> {
        if self.fail {
            return Err(WebRTCError::DataChannelError("channel not open".to_string()));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeCapture {
    count: AtomicUsize,
    failing: AtomicBool,
    constraints: Mutex<Option<CaptureConstraints>>,
    stopped: Arc<AtomicBool>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            constraints: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        *self.constraints.lock()
    }

    pub fn stream_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn capture(&self, constraints: CaptureConstraints) -> Result<LocalMediaStream, MediaError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.constraints.lock() = Some(constraints);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable("no camera".to_string()));
        }

        let stopped = self.stopped.clone();
        let tracks = vec![
            LocalTrack::for_kind(TrackKind::Audio, "local"),
            LocalTrack::for_kind(TrackKind::Video, "local"),
        ];
        Ok(LocalMediaStream::new("local", tracks).with_stop_hook(move || {
            stopped.store(true, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
pub(crate) struct FakeView {
    attached: Mutex<Option<String>>,
}

impl FakeView {
    pub fn is_attached(&self) -> bool {
        self.attached.lock().is_some()
    }
}

impl VideoView for FakeView {
    fn attach(&self, stream: &LocalMediaStream) {
        *self.attached.lock() = Some(stream.id().to_string());
    }

    fn detach(&self) {
        self.attached.lock().take();
    }
}
