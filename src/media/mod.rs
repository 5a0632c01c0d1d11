//! Local media capture
//!
//! The broadcast master captures one camera/microphone stream per session,
//! renders it into a preview view and adds its tracks to every viewer's peer
//! connection. Capture and preview sit behind [`MediaCapture`] and
//! [`VideoView`]; the GStreamer implementation is in [`gst_capture`].

#[cfg(feature = "gstreamer")]
pub mod gst_capture;

#[cfg(feature = "gstreamer")]
pub use gst_capture::GstCapture;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Media capture errors
#[derive(Debug)]
pub enum MediaError {
    /// Capture pipeline could not be built or started
    CaptureFailed(String),
    /// Camera or microphone not present or busy
    DeviceUnavailable(String),
    /// Capture support was not compiled in
    FeatureDisabled,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::CaptureFailed(msg) => write!(f, "Capture failed: {}", msg),
            MediaError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            MediaError::FeatureDisabled => write!(f, "Media capture feature is not enabled"),
        }
    }
}

impl Error for MediaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Capture request derived from the broadcast resolution profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    /// Ideal video width
    pub width: u32,
    /// Ideal video height
    pub height: u32,
}

impl CaptureConstraints {
    pub fn for_profile(use_widescreen: bool) -> Self {
        let (width, height) = if use_widescreen { (1280, 720) } else { (640, 480) };
        Self { audio: true, width, height }
    }
}

/// One captured track, written as RTP into a webrtc-rs local track
pub struct LocalTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticRTP>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, rtp: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            kind,
            rtp,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a VP8 video or Opus audio track bound to `stream_id`
    pub fn for_kind(kind: TrackKind, stream_id: &str) -> Self {
        let capability = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        let rtp = TrackLocalStaticRTP::new(
            capability,
            format!("{}-{}", kind, uuid::Uuid::new_v4()),
            stream_id.to_string(),
        );
        Self::new(kind, Arc::new(rtp))
    }

    pub fn id(&self) -> &str {
        self.rtp.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtp(&self) -> &Arc<TrackLocalStaticRTP> {
        &self.rtp
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag observed by the producer feeding this track
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Captured local stream owned by one broadcast session
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
    on_stop: Mutex<Option<StopHook>>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            on_stop: Mutex::new(None),
        }
    }

    /// Run `hook` once when the stream is stopped, e.g. to tear down a pipeline
    pub fn with_stop_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_stop.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Stop every track. Safe to call more than once.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(hook) = self.on_stop.lock().take() {
            hook();
        }
        debug!("Stopped local stream {} ({} tracks)", self.id, self.tracks.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Platform camera/microphone capture
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, constraints: CaptureConstraints) -> Result<LocalMediaStream, MediaError>;
}

/// Local preview sink
pub trait VideoView: Send + Sync {
    fn attach(&self, stream: &LocalMediaStream);

    fn detach(&self);
}
