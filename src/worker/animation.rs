//! Animation decoding for the frame cache worker.
//!
//! An [`AnimationLoader`] turns a source (path or URL) into an [`Animation`]
//! that can be rendered at any point in time. [`ImageAnimationLoader`] covers
//! GIF, APNG and animated WebP through the `image` crate; still images load
//! as single-frame animations.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, Frame, ImageFormat, RgbaImage};

/// Connection timeout for remote animations
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Delays shorter than this are treated as this long, as browsers do.
const MIN_FRAME_DELAY_SECS: f64 = 0.02;

#[derive(Debug, thiserror::Error)]
pub enum AnimationError {
    #[error("failed to fetch {src}: {message}")]
    Fetch { src: String, message: String },

    #[error("failed to read {src}: {source}")]
    Io {
        src: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode animation: {0}")]
    Decode(#[from] image::ImageError),

    #[error("animation has no frames")]
    Empty,
}

pub type Result<T> = std::result::Result<T, AnimationError>;

/// A decoded animation that can be sampled at any time.
pub trait Animation: Send {
    /// Frames per second the animation should be sampled at.
    fn frame_rate(&self) -> f64;

    fn duration_secs(&self) -> f64;

    /// Render the picture shown at `time_secs` into a `width`x`width` RGBA
    /// buffer.
    fn render(&mut self, time_secs: f64, width: u32) -> Result<Vec<u8>>;
}

/// Fetches and decodes animations.
#[async_trait]
pub trait AnimationLoader: Send + Sync {
    async fn load(&self, src: &str) -> Result<Box<dyn Animation>>;
}

/// Animation held as fully composited RGBA frames.
pub struct FrameAnimation {
    frames: Vec<RgbaImage>,
    /// Start time of each frame.
    starts: Vec<f64>,
    duration_secs: f64,
    frame_rate: f64,
}

impl FrameAnimation {
    /// Build from frames and their display durations in seconds.
    ///
    /// The frame rate is derived from the average delay; `fallback_rate` is
    /// used when the delays carry no timing.
    pub fn new(frames: Vec<(RgbaImage, f64)>, fallback_rate: f64) -> Result<Self> {
        if frames.is_empty() {
            return Err(AnimationError::Empty);
        }

        let count = frames.len();
        let timed = frames.iter().any(|(_, delay)| *delay > 0.0);
        let mut starts = Vec::with_capacity(count);
        let mut images = Vec::with_capacity(count);
        let mut elapsed = 0.0;
        for (image, delay) in frames {
            starts.push(elapsed);
            images.push(image);
            elapsed += if timed {
                delay.max(MIN_FRAME_DELAY_SECS)
            } else {
                1.0 / fallback_rate
            };
        }

        let frame_rate = if timed && count > 1 {
            (count as f64 / elapsed).round().clamp(1.0, f64::from(u8::MAX))
        } else {
            fallback_rate
        };
        let duration_secs = if count == 1 { 1.0 / frame_rate } else { elapsed };

        Ok(Self {
            frames: images,
            starts,
            duration_secs,
            frame_rate,
        })
    }

    fn frame_at(&self, time_secs: f64) -> &RgbaImage {
        let index = self
            .starts
            .partition_point(|start| *start <= time_secs)
            .saturating_sub(1);
        &self.frames[index.min(self.frames.len() - 1)]
    }
}

impl Animation for FrameAnimation {
    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    fn render(&mut self, time_secs: f64, width: u32) -> Result<Vec<u8>> {
        let frame = self.frame_at(time_secs);
        let rendered = if frame.width() == width && frame.height() == width {
            frame.clone()
        } else {
            image::imageops::resize(frame, width, width, FilterType::Triangle)
        };
        Ok(rendered.into_raw())
    }
}

/// Loads animations from local paths or http(s) URLs.
#[derive(Debug, Clone)]
pub struct ImageAnimationLoader {
    client: reqwest::Client,
    default_frame_rate: f64,
}

impl ImageAnimationLoader {
    pub fn new(default_frame_rate: u8) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            default_frame_rate: f64::from(default_frame_rate.max(1)),
        }
    }

    async fn fetch(&self, src: &str) -> Result<Vec<u8>> {
        if src.starts_with("http://") || src.starts_with("https://") {
            let fetch_error = |e: reqwest::Error| AnimationError::Fetch {
                src: src.to_string(),
                message: e.to_string(),
            };
            let response = self
                .client
                .get(src)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(fetch_error)?;
            Ok(response.bytes().await.map_err(fetch_error)?.to_vec())
        } else {
            tokio::fs::read(src).await.map_err(|source| AnimationError::Io {
                src: src.to_string(),
                source,
            })
        }
    }
}

#[async_trait]
impl AnimationLoader for ImageAnimationLoader {
    async fn load(&self, src: &str) -> Result<Box<dyn Animation>> {
        let data = self.fetch(src).await?;
        let fallback = self.default_frame_rate;

        // Decoding is CPU bound.
        let animation = tokio::task::spawn_blocking(move || decode(data, fallback))
            .await
            .map_err(|e| AnimationError::Fetch {
                src: src.to_string(),
                message: format!("decode task failed: {}", e),
            })??;

        tracing::debug!(
            src,
            frame_rate = animation.frame_rate(),
            duration_secs = animation.duration_secs(),
            "Animation decoded"
        );
        Ok(Box::new(animation))
    }
}

/// Decode an encoded image into composited frames.
pub fn decode(data: Vec<u8>, fallback_rate: f64) -> Result<FrameAnimation> {
    let format = image::guess_format(&data)?;
    let frames = match format {
        ImageFormat::Gif => collect(GifDecoder::new(Cursor::new(data))?)?,
        ImageFormat::Png => {
            let decoder = PngDecoder::new(Cursor::new(&data[..]))?;
            if decoder.is_apng()? {
                collect(decoder.apng()?)?
            } else {
                still(&data)?
            }
        }
        ImageFormat::WebP => {
            let decoder = WebPDecoder::new(Cursor::new(&data[..]))?;
            if decoder.has_animation() {
                collect(decoder)?
            } else {
                still(&data)?
            }
        }
        _ => still(&data)?,
    };
    FrameAnimation::new(frames, fallback_rate)
}

fn collect<'a>(decoder: impl AnimationDecoder<'a>) -> Result<Vec<(RgbaImage, f64)>> {
    Ok(decoder
        .into_frames()
        .collect_frames()?
        .into_iter()
        .map(|frame| {
            let delay = frame_delay_secs(&frame);
            (frame.into_buffer(), delay)
        })
        .collect())
}

fn still(data: &[u8]) -> Result<Vec<(RgbaImage, f64)>> {
    Ok(vec![(image::load_from_memory(data)?.to_rgba8(), 0.0)])
}

fn frame_delay_secs(frame: &Frame) -> f64 {
    let (numer, denom) = frame.delay().numer_denom_ms();
    if denom == 0 {
        0.0
    } else {
        f64::from(numer) / f64::from(denom) / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgba};

    fn solid(side: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(side, side, Rgba(color))
    }

    fn gif(frames: &[[u8; 4]], delay_ms: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            let frames = frames.iter().map(|color| {
                Frame::from_parts(
                    solid(4, *color),
                    0,
                    0,
                    Delay::from_numer_denom_ms(delay_ms, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }
        out
    }

    #[test]
    fn test_frame_rate_from_delays() {
        let frames = vec![
            (solid(2, [255, 0, 0, 255]), 0.1),
            (solid(2, [0, 255, 0, 255]), 0.1),
            (solid(2, [0, 0, 255, 255]), 0.1),
        ];
        let animation = FrameAnimation::new(frames, 30.0).unwrap();
        assert_eq!(animation.frame_rate(), 10.0);
        assert!((animation.duration_secs() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_untimed_frames_use_fallback_rate() {
        let frames = vec![(solid(1, [0; 4]), 0.0), (solid(1, [1; 4]), 0.0)];
        let animation = FrameAnimation::new(frames, 25.0).unwrap();
        assert_eq!(animation.frame_rate(), 25.0);
        assert!((animation.duration_secs() - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_render_samples_by_time_and_scales() {
        let frames = vec![
            (solid(2, [255, 0, 0, 255]), 0.5),
            (solid(2, [0, 0, 255, 255]), 0.5),
        ];
        let mut animation = FrameAnimation::new(frames, 30.0).unwrap();

        let first = animation.render(0.25, 4).unwrap();
        assert_eq!(first.len(), 4 * 4 * 4);
        assert_eq!(&first[..4], &[255, 0, 0, 255]);

        let second = animation.render(0.75, 4).unwrap();
        assert_eq!(&second[..4], &[0, 0, 255, 255]);

        // Past the end holds the last frame.
        let late = animation.render(10.0, 2).unwrap();
        assert_eq!(&late[..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_empty_animation_is_rejected() {
        assert!(matches!(
            FrameAnimation::new(Vec::new(), 30.0),
            Err(AnimationError::Empty)
        ));
    }

    #[test]
    fn test_decode_gif() {
        let data = gif(&[[255, 0, 0, 255], [0, 255, 0, 255]], 100);
        let animation = decode(data, 30.0).unwrap();
        assert_eq!(animation.frame_rate(), 10.0);
        assert!((animation.duration_secs() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_decode_still_png() {
        let mut data = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(solid(3, [9, 9, 9, 255]))
            .write_to(&mut data, ImageFormat::Png)
            .unwrap();
        let animation = decode(data.into_inner(), 30.0).unwrap();
        assert_eq!(animation.frame_rate(), 30.0);
        assert!((animation.frame_rate() * animation.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(b"definitely not an image".to_vec(), 30.0).is_err());
    }

    #[tokio::test]
    async fn test_loader_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.gif");
        std::fs::write(&path, gif(&[[1, 2, 3, 255]; 3], 50)).unwrap();

        let loader = ImageAnimationLoader::new(30);
        let animation = loader.load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(animation.frame_rate(), 20.0);

        let missing = loader.load("/no/such/sticker.gif").await;
        assert!(matches!(missing, Err(AnimationError::Io { .. })));
    }
}
