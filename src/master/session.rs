//! Broadcast session actor
//!
//! One task owns every per-session resource. Signaling events, peer events,
//! stats ticks and control commands arrive through channels and are handled
//! one at a time, so negotiation for a viewer runs to completion before the
//! next event is looked at.
//!
//! Commands are polled first so a stop is never held back by event traffic.
//! `Send` and `Snapshot` handle every event already queued before they run.

use super::stats::StatsTimer;
use super::{EventCallback, MasterError, MasterEvent, MessageCallback, StatsCallback, ViewerState};
use crate::config::MasterConfig;
use crate::media::{LocalMediaStream, VideoView};
use crate::peer::{
    DataChannel, IceCandidate, IceServer, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender,
    RemoteTrack, SessionDescription, WebRTCError,
};
use crate::signaling::{MediaStorageClient, SignalingClient, SignalingEvent};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Control commands from the [`MasterConnection`](super::MasterConnection) handle
pub(crate) enum Command {
    Send { message: String, reply: oneshot::Sender<bool> },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Stop(oneshot::Sender<Result<(), MasterError>>),
}

/// Point in time view of a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub channel_id: String,
    /// Viewers holding a peer connection, sorted
    pub peer_viewers: Vec<String>,
    /// Viewers holding a data channel, sorted. A link always owns both its
    /// peer connection and its channel, so this equals `peer_viewers`.
    pub channel_viewers: Vec<String>,
    pub viewer_states: BTreeMap<String, ViewerState>,
    /// Stats poll timers created over the session
    pub stats_timers_created: usize,
    pub stats_timer_active: bool,
    pub remote_tracks: usize,
    pub has_local_stream: bool,
    pub ingestion_stream_id: Option<String>,
}

/// Everything the setup sequence acquired for the session
pub(crate) struct SessionResources {
    pub channel_id: String,
    pub ingestion_stream_id: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub signaling: Box<dyn SignalingClient>,
    pub storage: Option<Arc<dyn MediaStorageClient>>,
    pub local_stream: Option<LocalMediaStream>,
    pub view: Arc<dyn VideoView>,
}

pub(crate) struct SessionCallbacks {
    pub on_stats: StatsCallback,
    pub on_message: MessageCallback,
    pub on_event: Option<EventCallback>,
}

/// Peer connection and data channel of one viewer
struct ViewerLink {
    /// Tag carried by every event of this peer connection
    link: u64,
    peer: Arc<dyn PeerConnection>,
    channel: Arc<dyn DataChannel>,
    state: ViewerState,
}

pub(crate) struct Session {
    resources: SessionResources,
    callbacks: SessionCallbacks,
    config: MasterConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    viewers: HashMap<String, ViewerLink>,
    remote_tracks: Vec<RemoteTrack>,
    stats_timer: Option<StatsTimer>,
    stats_timers_created: usize,
    next_link: u64,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    tick_tx: mpsc::UnboundedSender<()>,
}

/// Receiving ends of the event sources
struct Inbox {
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    signaling_live: bool,
    peer: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    ticks: mpsc::UnboundedReceiver<()>,
}

impl Session {
    /// Spawn the actor. It runs until it receives [`Command::Stop`] or every
    /// command sender is dropped, releasing all resources in both cases.
    pub(crate) fn spawn(
        resources: SessionResources,
        signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        callbacks: SessionCallbacks,
        config: MasterConfig,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (mpsc::UnboundedSender<Command>, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let session = Session {
            resources,
            callbacks,
            config,
            factory,
            viewers: HashMap::new(),
            remote_tracks: Vec::new(),
            stats_timer: None,
            stats_timers_created: 0,
            next_link: 0,
            peer_tx,
            tick_tx,
        };

        let inbox = Inbox {
            signaling: signaling_events,
            signaling_live: true,
            peer: peer_rx,
            ticks: tick_rx,
        };
        let task = tokio::spawn(session.run(inbox, cmd_rx));
        (cmd_tx, task)
    }

    async fn run(mut self, mut inbox: Inbox, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        let _ = reply.send(self.teardown().await);
                        return;
                    }
                    Some(Command::Send { message, reply }) => {
                        self.drain(&mut inbox).await;
                        let _ = reply.send(self.fan_out(&message).await);
                    }
                    Some(Command::Snapshot(reply)) => {
                        self.drain(&mut inbox).await;
                        let _ = reply.send(self.snapshot());
                    }
                    None => {
                        warn!("Master handle dropped without stop, tearing down {}", self.resources.channel_id);
                        if let Err(e) = self.teardown().await {
                            error!("Teardown failed: {}", e);
                        }
                        return;
                    }
                },
                event = inbox.signaling.recv(), if inbox.signaling_live => match event {
                    Some(event) => self.handle_signaling(event).await,
                    None => self.signaling_ended(&mut inbox),
                },
                Some((link, event)) = inbox.peer.recv() => self.handle_peer(link, event).await,
                Some(()) = inbox.ticks.recv() => self.poll_stats().await,
            }
        }
    }

    /// Handle everything already queued, signaling before peer events
    async fn drain(&mut self, inbox: &mut Inbox) {
        loop {
            if inbox.signaling_live {
                match inbox.signaling.try_recv() {
                    Ok(event) => {
                        self.handle_signaling(event).await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => self.signaling_ended(inbox),
                    Err(TryRecvError::Empty) => {}
                }
            }
            if let Ok((link, event)) = inbox.peer.try_recv() {
                self.handle_peer(link, event).await;
                continue;
            }
            if inbox.ticks.try_recv().is_ok() {
                self.poll_stats().await;
                continue;
            }
            break;
        }
    }

    fn signaling_ended(&self, inbox: &mut Inbox) {
        debug!("Signaling event stream ended for {}", self.resources.channel_id);
        inbox.signaling_live = false;
    }

    fn emit(&self, event: MasterEvent) {
        if let Some(cb) = &self.callbacks.on_event {
            cb(&event);
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => self.on_open(),
            SignalingEvent::SdpOffer { offer, viewer_id } => self.on_offer(viewer_id, offer).await,
            SignalingEvent::IceCandidate { candidate, viewer_id } => self.on_remote_candidate(&viewer_id, candidate).await,
            SignalingEvent::Close => {
                info!("Signaling connection closed for {}", self.resources.channel_id);
                self.emit(MasterEvent::SignalingClosed);
            }
            SignalingEvent::Error(e) => {
                warn!("Signaling error on {}: {}", self.resources.channel_id, e);
                self.emit(MasterEvent::SignalingError(e));
            }
        }
    }

    fn on_open(&self) {
        info!("Signaling open for {}", self.resources.channel_id);

        let (Some(storage), Some(stream_id)) = (&self.resources.storage, &self.resources.ingestion_stream_id) else {
            return;
        };

        let storage = storage.clone();
        let channel_id = self.resources.channel_id.clone();
        let stream_id = stream_id.clone();
        let on_event = self.callbacks.on_event.clone();

        // The broadcast continues without recording if the join fails
        tokio::spawn(async move {
            let event = match storage.join_storage_session(&channel_id).await {
                Ok(()) => {
                    info!("Joined storage session for stream {}", stream_id);
                    MasterEvent::StorageSessionJoined
                }
                Err(e) => {
                    warn!("Failed to join storage session for {}: {}", stream_id, e);
                    MasterEvent::StorageSessionFailed(e.to_string())
                }
            };
            if let Some(cb) = on_event {
                cb(&event);
            }
        });
    }

    async fn on_offer(&mut self, viewer_id: String, offer: SessionDescription) {
        info!("SDP offer from viewer {}", viewer_id);

        // Renegotiation replaces the previous connection
        if let Some(old) = self.viewers.remove(&viewer_id) {
            info!("Replacing existing connection for viewer {}", viewer_id);
            let _ = close_link(&viewer_id, &old).await;
        }

        self.next_link += 1;
        let link = self.next_link;
        let peer = match self
            .factory
            .create(
                &viewer_id,
                &self.resources.ice_servers,
                PeerEventSender::new(link, self.peer_tx.clone()),
            )
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Viewer {}: failed to create peer connection: {}", viewer_id, e);
                return;
            }
        };

        let channel = match peer.create_data_channel(&self.config.data_channel_label).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Viewer {}: failed to create data channel: {}", viewer_id, e);
                let _ = peer.close().await;
                return;
            }
        };

        self.viewers.insert(
            viewer_id.clone(),
            ViewerLink {
                link,
                peer: peer.clone(),
                channel,
                state: ViewerState::Negotiating,
            },
        );
        self.emit(MasterEvent::ViewerStateChanged {
            viewer_id: viewer_id.clone(),
            state: ViewerState::Negotiating,
        });

        if self.stats_timer.is_none() {
            self.stats_timer = Some(StatsTimer::spawn(self.config.stats_interval(), self.tick_tx.clone()));
            self.stats_timers_created += 1;
        }

        if let Some(stream) = &self.resources.local_stream {
            for track in stream.tracks() {
                if let Err(e) = peer.add_track(track).await {
                    warn!("Viewer {}: failed to add {} track: {}", viewer_id, track.kind(), e);
                }
            }
        }

        match self.answer(&peer, offer).await {
            Ok(answer) => {
                if self.config.answer_policy.sends_immediate() {
                    if let Err(e) = self.resources.signaling.send_sdp_answer(&answer, &viewer_id).await {
                        warn!("Viewer {}: failed to send SDP answer: {}", viewer_id, e);
                    } else {
                        debug!("Sent SDP answer to viewer {}", viewer_id);
                    }
                }
            }
            Err(e) => {
                warn!("Viewer {}: negotiation failed: {}", viewer_id, e);
                if let Some(failed) = self.viewers.remove(&viewer_id) {
                    let _ = close_link(&viewer_id, &failed).await;
                }
            }
        }
    }

    async fn answer(&self, peer: &Arc<dyn PeerConnection>, offer: SessionDescription) -> Result<SessionDescription, WebRTCError> {
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn on_remote_candidate(&self, viewer_id: &str, candidate: IceCandidate) {
        let Some(link) = self.viewers.get(viewer_id) else {
            warn!("ICE candidate for unknown viewer {}, ignoring", viewer_id);
            return;
        };
        if let Err(e) = link.peer.add_ice_candidate(candidate).await {
            warn!("Viewer {}: failed to add remote candidate: {}", viewer_id, e);
        }
    }

    async fn handle_peer(&mut self, link: u64, event: PeerEvent) {
        let viewer_id = event.viewer_id().to_string();
        match self.viewers.get(&viewer_id) {
            Some(current) if current.link == link => {}
            Some(_) => {
                debug!("Dropping event of a replaced connection for viewer {}", viewer_id);
                return;
            }
            None => {
                debug!("Dropping peer event for departed viewer {}", viewer_id);
                return;
            }
        }

        match event {
            PeerEvent::StateChanged { state, .. } => {
                let state = ViewerState::from(state);
                if let Some(link) = self.viewers.get_mut(&viewer_id) {
                    if link.state == state {
                        return;
                    }
                    link.state = state;
                }
                info!("Viewer {} is now {:?}", viewer_id, state);
                self.emit(MasterEvent::ViewerStateChanged { viewer_id, state });
            }
            PeerEvent::IceCandidate { candidate: Some(candidate), .. } => {
                if !self.config.answer_policy.trickles() {
                    return;
                }
                debug!("Local candidate for viewer {}: {:?}", viewer_id, candidate.candidate_type());
                if let Err(e) = self.resources.signaling.send_ice_candidate(&candidate, &viewer_id).await {
                    warn!("Viewer {}: failed to send ICE candidate: {}", viewer_id, e);
                }
            }
            PeerEvent::IceCandidate { candidate: None, .. } => {
                if !self.config.answer_policy.sends_on_complete() {
                    return;
                }
                let Some(link) = self.viewers.get(&viewer_id) else { return };
                match link.peer.local_description().await {
                    Some(desc) => {
                        if let Err(e) = self.resources.signaling.send_sdp_answer(&desc, &viewer_id).await {
                            warn!("Viewer {}: failed to send final SDP answer: {}", viewer_id, e);
                        } else {
                            debug!("Sent final SDP answer to viewer {}", viewer_id);
                        }
                    }
                    None => warn!("Viewer {}: gathering completed without a local description", viewer_id),
                }
            }
            PeerEvent::Track { track, .. } => {
                info!("Viewer {} sent {} track {}", viewer_id, track.kind, track.id);
                self.remote_tracks.push(track);
            }
            PeerEvent::Message(message) => {
                (self.callbacks.on_message)(&message);
            }
        }
    }

    async fn poll_stats(&self) {
        for (viewer_id, link) in &self.viewers {
            if !link.peer.state().is_open() {
                continue;
            }
            match link.peer.stats().await {
                Ok(stats) => (self.callbacks.on_stats)(&stats),
                Err(e) => warn!("Viewer {}: failed to gather stats: {}", viewer_id, e),
            }
        }
    }

    async fn fan_out(&self, message: &str) -> bool {
        if message.is_empty() || self.viewers.is_empty() {
            return false;
        }

        let mut delivered = 0;
        for (viewer_id, link) in &self.viewers {
            if !link.peer.state().is_open() {
                continue;
            }
            match link.channel.send_text(message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Viewer {}: failed to send message: {}", viewer_id, e),
            }
        }
        debug!("Message delivered to {}/{} viewers", delivered, self.viewers.len());
        delivered > 0
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut peer_viewers: Vec<String> = self.viewers.keys().cloned().collect();
        peer_viewers.sort();
        let channel_viewers = peer_viewers.clone();

        SessionSnapshot {
            channel_id: self.resources.channel_id.clone(),
            peer_viewers,
            channel_viewers,
            viewer_states: self.viewers.iter().map(|(id, link)| (id.clone(), link.state)).collect(),
            stats_timers_created: self.stats_timers_created,
            stats_timer_active: self.stats_timer.is_some(),
            remote_tracks: self.remote_tracks.len(),
            has_local_stream: self.resources.local_stream.is_some(),
            ingestion_stream_id: self.resources.ingestion_stream_id.clone(),
        }
    }

    /// Release every resource. All steps run; the first failure is returned.
    async fn teardown(&mut self) -> Result<(), MasterError> {
        let mut first_error: Option<MasterError> = None;

        if let Err(e) = self.resources.signaling.close().await {
            warn!("Failed to close signaling connection: {}", e);
            first_error = Some(e.into());
        }

        for (viewer_id, link) in self.viewers.drain() {
            if let Err(e) = close_link(&viewer_id, &link).await {
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
        }

        if let Some(stream) = self.resources.local_stream.take() {
            stream.stop();
        }

        // Closing a peer connection ends its remote tracks
        if !self.remote_tracks.is_empty() {
            debug!("Dropping {} remote track records, their peers are closed", self.remote_tracks.len());
            self.remote_tracks.clear();
        }

        if let Some(timer) = self.stats_timer.take() {
            timer.cancel();
        }

        self.resources.view.detach();

        info!("Session for {} torn down", self.resources.channel_id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Close the data channel and peer connection of one viewer
async fn close_link(viewer_id: &str, link: &ViewerLink) -> Result<(), WebRTCError> {
    let channel_result = link.channel.close().await;
    let peer_result = link.peer.close().await;
    if let Err(e) = &channel_result {
        warn!("Viewer {}: failed to close data channel: {}", viewer_id, e);
    }
    if let Err(e) = &peer_result {
        warn!("Viewer {}: failed to close peer connection: {}", viewer_id, e);
    }
    channel_result.and(peer_result)
}
