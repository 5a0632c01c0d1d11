use clap::{Parser, Subcommand};
use std::path::PathBuf;

use webrtc_master::config;

#[derive(Parser, Debug)]
#[command(name = "webrtc-master")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "WebRTC broadcast master over a cloud signaling channel", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/webrtc-master.toml")]
    pub config: PathBuf,

    /// Signaling service region, overrides the config file
    #[arg(long)]
    pub region: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a signaling channel for a broadcast name
    CreateChannel {
        /// Channel name
        name: String,
    },

    /// Broadcast the local camera and microphone on an existing channel
    Broadcast {
        /// Channel name
        name: String,

        /// Capture at 640x480 instead of 1280x720
        #[arg(long, action)]
        standard: bool,

        /// Record the broadcast through the channel's media storage
        #[arg(long, action)]
        ingest: bool,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
