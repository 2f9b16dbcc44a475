mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./config.toml",
        "./mediaferry.toml",
        "~/.config/mediaferry/config.toml",
        "/etc/mediaferry/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    let loader = &config.loader;
    if loader.probe_chunk_size < 8 {
        anyhow::bail!("loader.probe_chunk_size must hold at least one atom header");
    }
    if loader.max_chunk_size < loader.probe_chunk_size {
        anyhow::bail!(
            "loader.max_chunk_size ({}) is smaller than loader.probe_chunk_size ({})",
            loader.max_chunk_size,
            loader.probe_chunk_size
        );
    }
    if loader.stream_chunk_size == 0 {
        anyhow::bail!("loader.stream_chunk_size cannot be 0");
    }
    if loader.target_segment_secs.is_nan() || loader.target_segment_secs <= 0.0 {
        anyhow::bail!("loader.target_segment_secs must be positive");
    }

    let intercept = &config.intercept;
    if intercept.align == 0 {
        anyhow::bail!("intercept.align cannot be 0");
    }
    for (name, prefix) in [
        ("stream_prefix", &intercept.stream_prefix),
        ("profiles_prefix", &intercept.profiles_prefix),
    ] {
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            anyhow::bail!("intercept.{} must start and end with '/': {:?}", name, prefix);
        }
    }
    if intercept.stream_prefix == intercept.profiles_prefix {
        anyhow::bail!("intercept.stream_prefix and intercept.profiles_prefix must differ");
    }
    if let Some(upstream) = &intercept.upstream {
        if !upstream.starts_with("http://") && !upstream.starts_with("https://") {
            anyhow::bail!("intercept.upstream must be an http(s) URL: {}", upstream);
        }
    }

    if config.worker.max_width == 0 {
        anyhow::bail!("worker.max_width cannot be 0");
    }
    if config.worker.max_width > 256 {
        tracing::warn!(
            max_width = config.worker.max_width,
            "Frames wider than 256 may exceed the 65536 color palette"
        );
    }

    Ok(())
}
