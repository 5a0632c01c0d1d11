//! GStreamer camera and microphone capture
//!
//! Builds one live pipeline per track:
//! - Video: source -> videoconvert -> videoscale -> caps -> vp8enc -> rtpvp8pay -> appsink
//! - Audio: source -> audioconvert -> audioresample -> opusenc -> rtpopuspay -> appsink
//!
//! A blocking pull loop per pipeline writes the RTP packets into the
//! track's `TrackLocalStaticRTP`.

use super::{CaptureConstraints, LocalMediaStream, LocalTrack, MediaCapture, MediaError, TrackKind};
use crate::config::CaptureConfig;
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

const VIDEO_PAYLOAD_TYPE: u32 = 96;
const AUDIO_PAYLOAD_TYPE: u32 = 111;
const PULL_TIMEOUT_MS: u64 = 100;

/// Camera/microphone capture through GStreamer
pub struct GstCapture {
    config: CaptureConfig,
}

impl GstCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    fn make(name: &str) -> Result<gst::Element, MediaError> {
        gst::ElementFactory::make(name)
            .build()
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to create {}: {}", name, e)))
    }

    fn rtp_sink(name: &str) -> gst_app::AppSink {
        gst_app::AppSink::builder()
            .name(name)
            .sync(false)
            .max_buffers(0)
            .drop(false)
            .build()
    }

    fn video_pipeline(&self, constraints: &CaptureConstraints) -> Result<(gst::Pipeline, gst_app::AppSink), MediaError> {
        let pipeline = gst::Pipeline::new();

        let source = Self::make(&self.config.video_source)?;
        let convert = Self::make("videoconvert")?;
        let scale = Self::make("videoscale")?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("width", constraints.width as i32)
            .field("height", constraints.height as i32)
            .field("framerate", gst::Fraction::new(self.config.framerate as i32, 1))
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to create capsfilter: {}", e)))?;

        // Realtime deadline keeps encoder latency low
        let encoder = gst::ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("target-bitrate", (self.config.video_bitrate_kbps * 1000) as i32)
            .build()
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to create vp8enc: {}", e)))?;

        let payloader = gst::ElementFactory::make("rtpvp8pay")
            .property("pt", VIDEO_PAYLOAD_TYPE)
            .build()
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to create rtpvp8pay: {}", e)))?;

        let appsink = Self::rtp_sink("videosink");

        pipeline
            .add_many([&source, &convert, &scale, &capsfilter, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to add video elements: {}", e)))?;
        gst::Element::link_many([&source, &convert, &scale, &capsfilter, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to link video elements: {}", e)))?;

        Ok((pipeline, appsink))
    }

    fn audio_pipeline(&self) -> Result<(gst::Pipeline, gst_app::AppSink), MediaError> {
        let pipeline = gst::Pipeline::new();

        let source = Self::make(&self.config.audio_source)?;
        let convert = Self::make("audioconvert")?;
        let resample = Self::make("audioresample")?;
        let encoder = Self::make("opusenc")?;
        let payloader = gst::ElementFactory::make("rtpopuspay")
            .property("pt", AUDIO_PAYLOAD_TYPE)
            .build()
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to create rtpopuspay: {}", e)))?;

        let appsink = Self::rtp_sink("audiosink");

        pipeline
            .add_many([&source, &convert, &resample, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to add audio elements: {}", e)))?;
        gst::Element::link_many([&source, &convert, &resample, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| MediaError::CaptureFailed(format!("Failed to link audio elements: {}", e)))?;

        Ok((pipeline, appsink))
    }
}

/// Pull RTP packets from `appsink` until `stop` is set
fn spawn_pull_loop(appsink: gst_app::AppSink, rtp: Arc<TrackLocalStaticRTP>, stop: Arc<AtomicBool>, kind: TrackKind) {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut packets: u64 = 0;
        while !stop.load(Ordering::SeqCst) {
            let sample = match appsink.try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS)) {
                Some(sample) => sample,
                None => {
                    if appsink.is_eos() {
                        warn!("{} capture reached end of stream", kind);
                        break;
                    }
                    continue;
                }
            };
            let Some(buffer) = sample.buffer() else { continue };
            let Ok(map) = buffer.map_readable() else { continue };

            if let Err(e) = handle.block_on(rtp.write(map.as_slice())) {
                debug!("{} track write failed: {}", kind, e);
            }
            packets += 1;
        }
        debug!("{} pull loop exited after {} packets", kind, packets);
    });
}

fn start(pipeline: &gst::Pipeline, kind: TrackKind) -> Result<(), MediaError> {
    pipeline
        .set_state(gst::State::Playing)
        .map(|_| ())
        .map_err(|e| MediaError::DeviceUnavailable(format!("Failed to start {} capture: {}", kind, e)))
}

#[async_trait]
impl MediaCapture for GstCapture {
    async fn capture(&self, constraints: CaptureConstraints) -> Result<LocalMediaStream, MediaError> {
        gst::init().map_err(|e| MediaError::CaptureFailed(format!("GStreamer init failed: {}", e)))?;

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut pipelines = Vec::new();
        let mut tracks = Vec::new();

        let (video, video_sink) = self.video_pipeline(&constraints)?;
        pipelines.push((video, video_sink, TrackKind::Video));

        if constraints.audio {
            let (audio, audio_sink) = self.audio_pipeline()?;
            pipelines.push((audio, audio_sink, TrackKind::Audio));
        }

        // Both pipelines must start; a partial stream is a capture failure
        for (pipeline, _, kind) in &pipelines {
            if let Err(e) = start(pipeline, *kind) {
                for (p, _, _) in &pipelines {
                    let _ = p.set_state(gst::State::Null);
                }
                return Err(e);
            }
        }

        let mut handles = Vec::new();
        for (pipeline, appsink, kind) in pipelines {
            let track = LocalTrack::for_kind(kind, &stream_id);
            spawn_pull_loop(appsink, track.rtp().clone(), track.stop_flag(), kind);
            tracks.push(track);
            handles.push(pipeline);
        }

        info!(
            "Capturing {}x{}@{} from {} ({} tracks)",
            constraints.width,
            constraints.height,
            self.config.framerate,
            self.config.video_source,
            tracks.len()
        );

        Ok(LocalMediaStream::new(stream_id, tracks).with_stop_hook(move || {
            for pipeline in handles {
                if let Err(e) = pipeline.set_state(gst::State::Null) {
                    warn!("Failed to stop capture pipeline: {}", e);
                }
            }
        }))
    }
}
