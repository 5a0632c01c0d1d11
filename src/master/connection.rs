//! MasterConnection handle
//!
//! Public control surface of a broadcast. One instance serves one broadcast
//! attempt: it can be started once and is `Closed` after stop.

use super::session::{Command, Session, SessionCallbacks, SessionResources, SessionSnapshot};
use super::{ChannelCreation, EventCallback, MasterError, MasterEvent, MasterState, MessageCallback, StatsCallback};
use crate::config::MasterConfig;
use crate::media::{CaptureConstraints, MediaCapture, MediaError, VideoView};
use crate::peer::{IceServer, PeerConnectionFactory, RtcPeerFactory};
use crate::signaling::http::kvs_stun_url;
use crate::signaling::{
    ChannelRole, Protocol, SignalingBackend, SignalingClient, SignalingClientConfig, SignalingError, SignalingEvent,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct SessionHandle {
    channel_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Connecting,
    Open(SessionHandle),
    Closed,
}

/// Builder for [`MasterConnection`]
pub struct MasterConnectionBuilder {
    backend: Arc<dyn SignalingBackend>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    media_capture: Option<Arc<dyn MediaCapture>>,
    config: MasterConfig,
    on_event: Option<EventCallback>,
}

impl MasterConnectionBuilder {
    /// Peer connection factory, webrtc-rs when not set
    pub fn peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Local capture. Starting without one fails with [`MediaError::FeatureDisabled`].
    pub fn media_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.media_capture = Some(capture);
        self
    }

    pub fn config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn build(self) -> MasterConnection {
        MasterConnection {
            backend: self.backend,
            peer_factory: self.peer_factory.unwrap_or_else(|| Arc::new(RtcPeerFactory::new())),
            media_capture: self.media_capture,
            config: self.config,
            on_event: self.on_event,
            lifecycle: Lifecycle::Idle,
        }
    }
}

/// Broadcast master connection
pub struct MasterConnection {
    backend: Arc<dyn SignalingBackend>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    media_capture: Option<Arc<dyn MediaCapture>>,
    config: MasterConfig,
    on_event: Option<EventCallback>,
    lifecycle: Lifecycle,
}

impl MasterConnection {
    pub fn builder(backend: Arc<dyn SignalingBackend>) -> MasterConnectionBuilder {
        MasterConnectionBuilder {
            backend,
            peer_factory: None,
            media_capture: None,
            config: MasterConfig::default(),
            on_event: None,
        }
    }

    pub fn state(&self) -> MasterState {
        match self.lifecycle {
            Lifecycle::Idle => MasterState::Idle,
            Lifecycle::Connecting => MasterState::Connecting,
            Lifecycle::Open(_) => MasterState::Open,
            Lifecycle::Closed => MasterState::Closed,
        }
    }

    /// Channel id of the running broadcast
    pub fn channel_id(&self) -> Option<&str> {
        match &self.lifecycle {
            Lifecycle::Open(handle) => Some(&handle.channel_id),
            _ => None,
        }
    }

    fn emit(&self, event: MasterEvent) {
        if let Some(cb) = &self.on_event {
            cb(&event);
        }
    }

    /// Create a signaling channel named `name` and resolve its id.
    /// Independent of any running broadcast.
    pub async fn create_signaling_channel(&self, name: &str) -> ChannelCreation {
        let result = match self.try_create_channel(name).await {
            Ok(channel_id) => ChannelCreation::Created { channel_id },
            Err(MasterError::Signaling(SignalingError::AlreadyExists)) => ChannelCreation::AlreadyExists,
            Err(e) => ChannelCreation::Failed(e.to_string()),
        };

        match &result {
            ChannelCreation::Created { channel_id } => {
                info!("Signaling channel {} created: {}", name, channel_id);
                self.emit(MasterEvent::ChannelCreated { channel_id: channel_id.clone() });
            }
            ChannelCreation::AlreadyExists => {
                info!("Signaling channel {} already exists", name);
                self.emit(MasterEvent::ChannelAlreadyExists { name: name.to_string() });
            }
            ChannelCreation::Failed(e) => {
                error!("Failed to create signaling channel {}: {}", name, e);
                self.emit(MasterEvent::ChannelCreateFailed(e.clone()));
            }
        }
        result
    }

    async fn try_create_channel(&self, name: &str) -> Result<String, MasterError> {
        if name.trim().is_empty() {
            return Err(MasterError::EmptyName);
        }
        self.backend.create_signaling_channel(name).await?;
        let info = self.backend.describe_signaling_channel(name).await?;
        Ok(info.channel_id)
    }

    /// Start broadcasting on `channel_name`. Returns true once the signaling
    /// connection is open.
    pub async fn start_master(
        &mut self,
        view: Arc<dyn VideoView>,
        channel_name: &str,
        use_widescreen: bool,
        enable_media_ingestion: bool,
        on_stats: StatsCallback,
        on_message: MessageCallback,
    ) -> bool {
        match self
            .try_start(view, channel_name, use_widescreen, enable_media_ingestion, on_stats, on_message)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Could not start broadcast on {}: {}", channel_name, e);
                self.emit(MasterEvent::BroadcastFailed(e.to_string()));
                false
            }
        }
    }

    pub async fn try_start(
        &mut self,
        view: Arc<dyn VideoView>,
        channel_name: &str,
        use_widescreen: bool,
        enable_media_ingestion: bool,
        on_stats: StatsCallback,
        on_message: MessageCallback,
    ) -> Result<(), MasterError> {
        if !matches!(self.lifecycle, Lifecycle::Idle) {
            return Err(MasterError::InvalidState(format!(
                "broadcast can only be started once, instance is {}",
                self.state()
            )));
        }

        self.lifecycle = Lifecycle::Connecting;
        // Failed attempts are terminal as well
        let (resources, events) = match self
            .establish(view, channel_name, use_widescreen, enable_media_ingestion)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.lifecycle = Lifecycle::Closed;
                return Err(e);
            }
        };

        let channel_id = resources.channel_id.clone();
        let callbacks = SessionCallbacks {
            on_stats,
            on_message,
            on_event: self.on_event.clone(),
        };
        let (commands, task) = Session::spawn(
            resources,
            events,
            callbacks,
            self.config.clone(),
            self.peer_factory.clone(),
        );

        info!("Broadcast started on {} ({})", channel_name, channel_id);
        self.emit(MasterEvent::BroadcastStarted { channel_id: channel_id.clone() });
        self.lifecycle = Lifecycle::Open(SessionHandle { channel_id, commands, task });
        Ok(())
    }

    /// Setup sequence. Nothing is left behind on failure.
    async fn establish(
        &self,
        view: Arc<dyn VideoView>,
        channel_name: &str,
        use_widescreen: bool,
        enable_media_ingestion: bool,
    ) -> Result<(SessionResources, mpsc::UnboundedReceiver<SignalingEvent>), MasterError> {
        if channel_name.trim().is_empty() {
            return Err(MasterError::EmptyName);
        }

        let channel = self.backend.describe_signaling_channel(channel_name).await?;
        let channel_id = channel.channel_id;
        let protocols = Protocol::for_session(enable_media_ingestion);

        // Storage precondition is checked before anything is acquired
        let ingestion_stream_id = if enable_media_ingestion {
            let storage = self.backend.describe_media_storage_configuration(&channel_id).await?;
            if !storage.enabled {
                return Err(MasterError::StorageDisabled);
            }
            Some(storage.stream_id.ok_or(MasterError::MissingStreamId)?)
        } else {
            None
        };

        let endpoints = self
            .backend
            .get_signaling_channel_endpoints(&channel_id, ChannelRole::Master, &protocols)
            .await?;

        let mut signaling = self
            .backend
            .connect(SignalingClientConfig {
                channel_id: channel_id.clone(),
                wss_endpoint: endpoints.get(Protocol::Wss)?.to_string(),
                region: self.backend.region().to_string(),
                role: ChannelRole::Master,
                client_id: None,
            })
            .await?;

        let acquired = async {
            let storage = if enable_media_ingestion {
                Some(self.backend.storage_client(endpoints.get(Protocol::Webrtc)?).await?)
            } else {
                None
            };

            let servers = self
                .backend
                .get_ice_server_config(&channel_id, endpoints.get(Protocol::Https)?)
                .await?;
            let ice_servers = with_stun_relay(servers, self.backend.region());

            let capture = self.media_capture.as_ref().ok_or(MediaError::FeatureDisabled)?;
            let stream = capture.capture(CaptureConstraints::for_profile(use_widescreen)).await?;
            Ok::<_, MasterError>((storage, ice_servers, stream))
        }
        .await;

        let (storage, ice_servers, stream) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                discard(signaling.as_mut()).await;
                return Err(e);
            }
        };

        view.attach(&stream);

        let events = match signaling.open().await {
            Ok(events) => events,
            Err(e) => {
                stream.stop();
                view.detach();
                discard(signaling.as_mut()).await;
                return Err(e.into());
            }
        };

        Ok((
            SessionResources {
                channel_id,
                ingestion_stream_id,
                ice_servers,
                signaling,
                storage,
                local_stream: Some(stream),
                view,
            },
            events,
        ))
    }

    /// Stop the broadcast and release every session resource
    pub async fn stop_master(&mut self) -> bool {
        match self.try_stop().await {
            Ok(()) => {
                self.emit(MasterEvent::BroadcastStopped);
                true
            }
            Err(e) => {
                error!("Could not stop broadcast: {}", e);
                self.emit(MasterEvent::StopFailed(e.to_string()));
                false
            }
        }
    }

    pub async fn try_stop(&mut self) -> Result<(), MasterError> {
        let handle = match std::mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Open(handle) => handle,
            Lifecycle::Closed => return Ok(()),
            Lifecycle::Idle | Lifecycle::Connecting => {
                info!("Stopping a broadcast that never started");
                return Ok(());
            }
        };

        let (reply, result) = oneshot::channel();
        if handle.commands.send(Command::Stop(reply)).is_err() {
            warn!("Session for {} already exited", handle.channel_id);
            return Ok(());
        }

        let result = result.await.unwrap_or(Ok(()));
        if let Err(e) = handle.task.await {
            warn!("Session task for {} ended abnormally: {}", handle.channel_id, e);
        }
        info!("Broadcast on {} stopped", handle.channel_id);
        result
    }

    /// Send `message` to every viewer. True if at least one viewer got it.
    pub async fn send_master_message(&self, message: &str) -> bool {
        if message.is_empty() {
            warn!("Refusing to send an empty message");
            return false;
        }
        let Lifecycle::Open(handle) = &self.lifecycle else {
            warn!("No broadcast running, message dropped");
            return false;
        };

        let (reply, delivered) = oneshot::channel();
        let command = Command::Send {
            message: message.to_string(),
            reply,
        };
        if handle.commands.send(command).is_err() {
            return false;
        }
        delivered.await.unwrap_or(false)
    }

    /// Current session contents, `None` unless the broadcast is open
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let Lifecycle::Open(handle) = &self.lifecycle else {
            return None;
        };
        let (reply, snapshot) = oneshot::channel();
        handle.commands.send(Command::Snapshot(reply)).ok()?;
        snapshot.await.ok()
    }
}

async fn discard(signaling: &mut dyn SignalingClient) {
    if let Err(e) = signaling.close().await {
        warn!("Failed to discard signaling connection: {}", e);
    }
}

/// Prepend the backend's STUN relay unless it is already listed
fn with_stun_relay(mut servers: Vec<IceServer>, region: &str) -> Vec<IceServer> {
    let stun = kvs_stun_url(region);
    if !servers.iter().any(|s| s.urls.iter().any(|u| *u == stun)) {
        servers.insert(0, IceServer::stun(stun));
    }
    servers
}
