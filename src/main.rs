//! webrtc-master - Main entry point
//!
//! Creates signaling channels and broadcasts the local camera and microphone
//! to every viewer that joins.

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use webrtc_master::media::{LocalMediaStream, MediaCapture, VideoView};
use webrtc_master::{
    ChannelCreation, Config, ConnectionStats, DataChannelMessage, HttpBackend, MasterConnection, MasterEvent,
    RtcPeerFactory,
};

/// Preview sink that only logs, there is no local display
struct LogView;

impl VideoView for LogView {
    fn attach(&self, stream: &LocalMediaStream) {
        info!("Local preview attached to stream {} ({} tracks)", stream.id(), stream.tracks().len());
    }

    fn detach(&self) {
        info!("Local preview detached");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("WEBRTC_MASTER_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("webrtc-master v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    if let Some(region) = &args.region {
        config.backend.region = region.clone();
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    info!("Signaling control plane: {} ({})", config.backend.control_plane_url, config.backend.region);

    match args.command {
        Command::CreateChannel { name } => {
            let master = MasterConnection::builder(backend)
                .config(config.master.clone())
                .on_event(Arc::new(log_event))
                .build();
            match master.create_signaling_channel(&name).await {
                ChannelCreation::Created { channel_id } => println!("{}", channel_id),
                ChannelCreation::AlreadyExists => println!("channel {} already exists", name),
                ChannelCreation::Failed(e) => return Err(e.into()),
            }
        }
        Command::Broadcast { name, standard, ingest } => {
            let use_widescreen = config.master.use_widescreen && !standard;
            let enable_media_ingestion = config.master.enable_media_ingestion || ingest;
            run_broadcast(config, backend, &name, use_widescreen, enable_media_ingestion).await?;
        }
    }

    Ok(())
}

fn log_event(event: &MasterEvent) {
    match event {
        MasterEvent::BroadcastFailed(_) | MasterEvent::StopFailed(_) | MasterEvent::ChannelCreateFailed(_) => {
            error!("{:?}", event)
        }
        MasterEvent::StorageSessionFailed(_) | MasterEvent::SignalingError(_) => warn!("{:?}", event),
        _ => info!("{:?}", event),
    }
}

#[cfg(feature = "gstreamer")]
fn media_capture(config: &Config) -> Result<Arc<dyn MediaCapture>, Box<dyn std::error::Error>> {
    Ok(Arc::new(webrtc_master::media::GstCapture::new(config.capture.clone())))
}

#[cfg(not(feature = "gstreamer"))]
fn media_capture(_config: &Config) -> Result<Arc<dyn MediaCapture>, Box<dyn std::error::Error>> {
    Err("broadcast requires the gstreamer feature".into())
}

async fn run_broadcast(
    config: Config,
    backend: Arc<HttpBackend>,
    name: &str,
    use_widescreen: bool,
    enable_media_ingestion: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let capture = media_capture(&config)?;

    let mut master = MasterConnection::builder(backend)
        .peer_factory(Arc::new(RtcPeerFactory::new()))
        .media_capture(capture)
        .config(config.master.clone())
        .on_event(Arc::new(log_event))
        .build();

    let started = master
        .start_master(
            Arc::new(LogView),
            name,
            use_widescreen,
            enable_media_ingestion,
            Arc::new(|stats: &ConnectionStats| {
                info!(
                    "stats viewer={} pair={:?} sent={} recv={} rtt={:?}",
                    stats.viewer_id, stats.selected_pair, stats.bytes_sent, stats.bytes_received, stats.round_trip_time
                );
            }),
            Arc::new(|msg: &DataChannelMessage| {
                info!("[{}] {}", msg.viewer_id, msg.text());
            }),
        )
        .await;
    if !started {
        return Err(format!("could not start broadcast on {}", name).into());
    }
    info!("Broadcasting on {}; type a line to message viewers, Ctrl-C to stop", name);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if !master.send_master_message(line).await {
                        warn!("No viewer received the message");
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    if !master.stop_master().await {
        return Err("could not stop broadcast".into());
    }
    Ok(())
}
