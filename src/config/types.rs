use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub intercept: InterceptConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Progressive container loader tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    /// Window size while looking for the movie header.
    #[serde(default = "default_probe_chunk")]
    pub probe_chunk_size: u64,

    /// Upper bound for an enlarged probe window.
    #[serde(default = "default_max_chunk")]
    pub max_chunk_size: u64,

    /// Window size once the demuxer is ready.
    #[serde(default = "default_stream_chunk")]
    pub stream_chunk_size: u64,

    /// Per-fetch timeout (0 disables it).
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Consecutive probe steps without progress before giving up.
    #[serde(default = "default_max_stalled_probes")]
    pub max_stalled_probes: u32,

    /// Target duration of planned segments.
    #[serde(default = "default_target_segment")]
    pub target_segment_secs: f64,
}

fn default_probe_chunk() -> u64 {
    4096
}
fn default_max_chunk() -> u64 {
    512 * 1024
}
fn default_stream_chunk() -> u64 {
    512 * 1024
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_stalled_probes() -> u32 {
    8
}
fn default_target_segment() -> f64 {
    mediaferry_media::segments::DEFAULT_TARGET_DURATION_SECS
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            probe_chunk_size: default_probe_chunk(),
            max_chunk_size: default_max_chunk(),
            stream_chunk_size: default_stream_chunk(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_stalled_probes: default_max_stalled_probes(),
            target_segment_secs: default_target_segment(),
        }
    }
}

impl LoaderConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }
}

/// Range request interception settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptConfig {
    /// Requested range starts are aligned down to a multiple of this.
    #[serde(default = "default_align")]
    pub align: u64,

    /// How long a held request waits for its data (0 waits forever).
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,

    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    #[serde(default = "default_profiles_prefix")]
    pub profiles_prefix: String,

    /// Base URL unrecognized requests are proxied to.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Where announced ranges are fetched from: a directory or an http(s)
    /// base URL. Defaults to the working directory.
    #[serde(default)]
    pub source: Option<String>,
}

fn default_align() -> u64 {
    512 * 1024
}
fn default_pending_timeout() -> u64 {
    60
}
fn default_stream_prefix() -> String {
    "/stream/".to_string()
}
fn default_profiles_prefix() -> String {
    "/profiles/".to_string()
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            align: default_align(),
            pending_timeout_secs: default_pending_timeout(),
            stream_prefix: default_stream_prefix(),
            profiles_prefix: default_profiles_prefix(),
            upstream: None,
            source: None,
        }
    }
}

impl InterceptConfig {
    pub fn pending_timeout(&self) -> Option<Duration> {
        (self.pending_timeout_secs > 0).then(|| Duration::from_secs(self.pending_timeout_secs))
    }
}

/// Frame cache worker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Version byte written into every compressed frame.
    #[serde(default = "default_format_version")]
    pub format_version: u8,

    /// Largest accepted frame side.
    #[serde(default = "default_max_width")]
    pub max_width: u16,

    /// Frame rate assumed for animations that report none.
    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: u8,
}

fn default_format_version() -> u8 {
    mediaferry_media::FORMAT_VERSION
}
fn default_max_width() -> u16 {
    512
}
fn default_frame_rate() -> u8 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            format_version: default_format_version(),
            max_width: default_max_width(),
            default_frame_rate: default_frame_rate(),
        }
    }
}
