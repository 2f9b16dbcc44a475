mod cli;

use mediaferry::{
    config,
    server,
    streaming::{FetchOptions, FileRangeSource, ProgressiveLoader, StreamEvent},
    worker::{FrameCacheClient, FrameCacheWorker, WorkerMessage},
};
use mediaferry_common::{StickerId, StreamId};
use mediaferry_media::codec::rgba_from_pixels;
use mediaferry_media::{MovieInfo, SegmentInfo};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediaferry=trace,mediaferry_media=trace,mediaferry_common=debug,tower_http=debug"
                .to_string()
        } else {
            "mediaferry=info,mediaferry_media=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { host, port, source } => {
            let mut config = config::load_config_or_default(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if source.is_some() {
                config.intercept.source = source;
            }
            config::validate_config(&config)?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(server::start_server(config))
        }
        Commands::Probe { file, json } => {
            let config = config::load_config_or_default(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, &config))
        }
        Commands::Cache {
            animation,
            width,
            output,
        } => {
            let config = config::load_config_or_default(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cache_animation(&animation, width, output.as_deref(), &config))
        }
        Commands::Validate { file } => {
            let path = file.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mediaferry {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Default)]
struct ProbeSummary {
    info: Option<MovieInfo>,
    segments: Vec<SegmentInfo>,
    delivered: usize,
    delivered_bytes: usize,
    error: Option<String>,
}

impl ProbeSummary {
    fn record(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StreamInitialize { info, segments, .. } => {
                self.info = Some(info);
                self.segments = segments;
            }
            StreamEvent::StreamSegment { segment, .. } => {
                self.delivered += 1;
                self.delivered_bytes += segment.data.len();
            }
            StreamEvent::StreamError { message, .. } => self.error = Some(message),
        }
    }
}

async fn probe_file(file: &Path, json: bool, config: &config::Config) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let loader = ProgressiveLoader::new(Arc::new(FileRangeSource::new()), config.loader.clone());
    let mut events = loader.subscribe();
    let mut handle = loader
        .start(
            StreamId::new(),
            file.to_string_lossy().to_string(),
            FetchOptions::default(),
        )
        .await?;

    let mut summary = ProbeSummary::default();
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => summary.record(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Probe fell behind the loader");
                }
                Err(RecvError::Closed) => break,
            },
            finished = &mut handle => {
                finished?;
                while let Ok(event) = events.try_recv() {
                    summary.record(event);
                }
                break;
            }
        }
    }

    if let Some(error) = summary.error {
        anyhow::bail!("Probe failed: {}", error);
    }
    let Some(info) = summary.info else {
        anyhow::bail!("No movie header found in {:?}", file);
    };

    if json {
        let value = serde_json::json!({
            "file": file,
            "info": info,
            "segments": summary.segments,
            "delivered_segments": summary.delivered,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Timescale: {}", info.timescale);
    let secs = info.duration_secs as u64;
    println!(
        "Duration: {:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    );

    println!("\nTracks: {}", info.tracks.len());
    for (i, track) in info.tracks.iter().enumerate() {
        print!(
            "  [{}] #{} {} {}",
            i,
            track.track_id,
            track.kind,
            track.codec.as_deref().unwrap_or("unknown")
        );
        if let (Some(w), Some(h)) = (track.width, track.height) {
            print!(" {}x{}", w, h);
        }
        if let Some(rate) = track.sample_rate {
            print!(" {} Hz", rate);
        }
        if let Some(channels) = track.channels {
            print!(" {}ch", channels);
        }
        println!(", {} samples", track.sample_count);
    }

    println!("\nSegments: {}", summary.segments.len());
    for segment in &summary.segments {
        println!(
            "  [{}] {:.3}s +{:.3}s bytes {}-{} ({} bytes)",
            segment.index,
            segment.start_time_secs,
            segment.duration_secs,
            segment.byte_range.0,
            segment.byte_range.1,
            segment.byte_len()
        );
    }
    println!(
        "\nDelivered: {} segments, {} bytes",
        summary.delivered, summary.delivered_bytes
    );

    Ok(())
}

async fn cache_animation(
    animation: &str,
    width: u16,
    output: Option<&Path>,
    config: &config::Config,
) -> Result<()> {
    if let Some(dir) = output {
        std::fs::create_dir_all(dir)?;
    }

    let (client, _driver) =
        FrameCacheClient::start(FrameCacheWorker::with_image_loader(config.worker.clone()));
    let id = StickerId::new();
    let mut messages = client.subscribe();
    let mut frames = Box::pin(client.frame_stream(id.clone()));
    client.cache_sticker(id.clone(), animation, width)?;

    let raw_len = usize::from(width) * usize::from(width) * 4;
    let mut compressed = 0usize;
    let mut count = 0usize;
    while let Some(frame) = frames.next().await {
        count += 1;
        compressed += frame.data.len();
        println!(
            "frame {:>4}/{}: {} bytes",
            frame.frame, frame.header.total_frames, frame.data.len()
        );
        if let Some(dir) = output {
            let path = dir.join(format!("frame_{:04}.bin", frame.frame));
            tokio::fs::write(&path, &frame.data).await?;
            write_preview(&dir.join(format!("frame_{:04}.png", frame.frame)), &frame.data)?;
        }
    }

    // The frame stream ends on either outcome; find out which.
    loop {
        match messages.recv().await {
            Ok(WorkerMessage::CacheFailed { id: failed, error }) if failed == id => {
                anyhow::bail!("Caching failed: {}", error);
            }
            Ok(WorkerMessage::CacheComplete { id: done }) if done == id => break,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => anyhow::bail!("Frame cache worker stopped"),
        }
    }

    let raw = raw_len * count;
    println!(
        "\n{} frames, {} bytes compressed ({} raw, {:.1}%)",
        count,
        compressed,
        raw,
        if raw == 0 {
            0.0
        } else {
            compressed as f64 * 100.0 / raw as f64
        }
    );
    Ok(())
}

/// Decode a compressed frame and save it as a PNG next to the raw output.
fn write_preview(path: &Path, data: &[u8]) -> Result<()> {
    let decoded = mediaferry_media::decompress(data)?;
    let width = u32::from(decoded.header.width);
    let rgba = rgba_from_pixels(&decoded.pixels);
    let image = image::RgbaImage::from_raw(width, width, rgba)
        .ok_or_else(|| anyhow::anyhow!("Frame does not fill a {}x{} image", width, width))?;
    image.save(path)?;
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!(
                "  Loader: probe {} / max {} / stream {} bytes",
                config.loader.probe_chunk_size,
                config.loader.max_chunk_size,
                config.loader.stream_chunk_size
            );
            println!(
                "  Intercept: {} and {} (align {})",
                config.intercept.stream_prefix,
                config.intercept.profiles_prefix,
                config.intercept.align
            );
            println!(
                "  Upstream: {}",
                config.intercept.upstream.as_deref().unwrap_or("none")
            );
            println!("  Worker max width: {}", config.worker.max_width);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
