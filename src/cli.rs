use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mediaferry")]
#[command(author, version, about = "Progressive media streaming and frame caching")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve ranged reads through the interception layer
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory or http(s) base URL ranges are fetched from
        #[arg(long)]
        source: Option<String>,
    },

    /// Load an MP4 progressively and display its tracks and segments
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rasterize an animation into compressed frames
    Cache {
        /// Animation file or http(s) URL
        #[arg(required = true)]
        animation: String,

        /// Frame side in pixels
        #[arg(short, long, default_value = "64")]
        width: u16,

        /// Directory to write compressed frames to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
