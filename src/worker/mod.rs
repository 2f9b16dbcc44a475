//! Frame cache worker.
//!
//! The worker receives [`WorkerRequest`]s, rasterizes each animation frame
//! by frame, compresses every frame with the range codec and streams the
//! results back as [`WorkerMessage`]s. It renders one animation at a time;
//! [`FrameCacheClient`] queues requests so only one is ever handed to it.

mod animation;
mod client;
mod messages;

pub use animation::{
    decode, Animation, AnimationError, AnimationLoader, FrameAnimation, ImageAnimationLoader,
};
pub use client::{CachedFrame, FrameCacheClient};
pub use messages::{WorkerMessage, WorkerRequest};

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mediaferry_common::StickerId;
use mediaferry_media::codec::pixels_from_rgba;
use mediaferry_media::{compress, FrameHeader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;

/// Background rasterizer.
pub struct FrameCacheWorker {
    loader: Arc<dyn AnimationLoader>,
    config: WorkerConfig,
}

impl FrameCacheWorker {
    pub fn new(loader: Arc<dyn AnimationLoader>, config: WorkerConfig) -> Self {
        Self { loader, config }
    }

    /// Worker backed by [`ImageAnimationLoader`].
    pub fn with_image_loader(config: WorkerConfig) -> Self {
        let loader = ImageAnimationLoader::new(config.default_frame_rate);
        Self::new(Arc::new(loader), config)
    }

    /// Run on a background task, returning its request and message ends.
    pub fn spawn(
        self,
    ) -> (
        mpsc::UnboundedSender<WorkerRequest>,
        mpsc::UnboundedReceiver<WorkerMessage>,
        JoinHandle<()>,
    ) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(request_rx, message_tx));
        (request_tx, message_rx, handle)
    }

    /// Handle requests until the request channel closes.
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        messages: mpsc::UnboundedSender<WorkerMessage>,
    ) {
        while let Some(request) = requests.recv().await {
            match request {
                WorkerRequest::CacheSticker { id, src, width } => {
                    let reply = match self.cache_sticker(&id, &src, width, &messages).await {
                        Ok(frames) => {
                            tracing::info!(sticker_id = %id, src = %src, width, frames, "Sticker cached");
                            WorkerMessage::CacheComplete { id }
                        }
                        Err(e) => {
                            tracing::warn!(sticker_id = %id, src = %src, error = %e, "Sticker caching failed");
                            WorkerMessage::CacheFailed {
                                id,
                                error: format!("{:#}", e),
                            }
                        }
                    };
                    if messages.send(reply).is_err() {
                        break;
                    }
                }
                WorkerRequest::Unknown => {
                    tracing::debug!("Ignoring unrecognized worker request");
                }
            }
        }
        tracing::debug!("Frame cache worker stopped");
    }

    async fn cache_sticker(
        &self,
        id: &StickerId,
        src: &str,
        width: u16,
        messages: &mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<u16> {
        if width == 0 || width > self.config.max_width {
            bail!(
                "width {} outside 1..={}",
                width,
                self.config.max_width
            );
        }

        let animation = self
            .loader
            .load(src)
            .await
            .with_context(|| format!("Failed to load animation {}", src))?;

        let version = self.config.format_version;
        let id = id.clone();
        let messages = messages.clone();
        tokio::task::spawn_blocking(move || render_all(animation, id, width, version, &messages))
            .await
            .context("Render task panicked")?
    }
}

/// Render, compress and send every frame in order.
fn render_all(
    mut animation: Box<dyn Animation>,
    id: StickerId,
    width: u16,
    version: u8,
    messages: &mpsc::UnboundedSender<WorkerMessage>,
) -> Result<u16> {
    let frame_rate = animation.frame_rate();
    let total_frames = (frame_rate * animation.duration_secs())
        .round()
        .clamp(0.0, f64::from(u16::MAX)) as u16;
    let header = FrameHeader {
        version,
        total_frames,
        frame_rate: frame_rate.round().clamp(0.0, f64::from(u8::MAX)) as u8,
        width,
    };

    for frame in 0..total_frames {
        let rgba = animation.render(f64::from(frame) / frame_rate, u32::from(width))?;
        let pixels = pixels_from_rgba(&rgba);
        let data = compress(&pixels, &header)
            .with_context(|| format!("Failed to compress frame {}", frame))?;

        tracing::trace!(sticker_id = %id, frame, bytes = data.len(), "Frame cached");
        messages
            .send(WorkerMessage::CachedFrame {
                id: id.clone(),
                frame,
                data,
                header,
            })
            .map_err(|_| anyhow::anyhow!("Frame consumer went away"))?;
    }

    Ok(total_frames)
}
