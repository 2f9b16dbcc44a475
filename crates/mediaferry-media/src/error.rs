//! Error types for mediaferry-media.

use std::io;
use thiserror::Error;

/// Result type for mediaferry-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mediaferry-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid MP4 file structure.
    #[error("Invalid MP4: {0}")]
    InvalidMp4(String),

    /// Missing required atom in MP4 file.
    #[error("Missing required atom: {0}")]
    MissingAtom(&'static str),

    /// Buffer too small for operation.
    #[error("Buffer underflow: need {need} bytes, have {have}")]
    BufferUnderflow { need: usize, have: usize },

    /// Pixel buffer does not hold `width * width` pixels.
    #[error("Pixel count mismatch: expected {expected}, got {actual}")]
    PixelCountMismatch { expected: usize, actual: usize },

    /// More distinct colors than 2-byte palette indices can address.
    #[error("Palette overflow: frame has more than {max} distinct colors")]
    PaletteOverflow { max: usize },

    /// Compressed frame ended before all fields or pixels were read.
    #[error("Truncated frame: need {need} bytes at offset {offset}")]
    Truncated { offset: usize, need: usize },

    /// A run record points past the end of the palette.
    #[error("Palette index {index} out of range (palette size {palette_size})")]
    PaletteIndexOutOfRange { index: u16, palette_size: usize },

    /// Run records expand to more pixels than `width * width`.
    #[error("Run at offset {offset} expands past {expected} pixels")]
    PixelOverflow { offset: usize, expected: usize },

    /// A run record with length zero.
    #[error("Empty run at offset {offset}")]
    EmptyRun { offset: usize },

    /// The demuxer could not make sense of the appended data.
    #[error("Demux error: {0}")]
    Demux(String),
}

impl Error {
    /// Create an invalid MP4 error.
    pub fn invalid_mp4(msg: impl Into<String>) -> Self {
        Self::InvalidMp4(msg.into())
    }

    /// Create a demux error.
    pub fn demux(msg: impl Into<String>) -> Self {
        Self::Demux(msg.into())
    }

    /// Whether this error came from decoding a malformed compressed frame.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::PaletteIndexOutOfRange { .. }
                | Self::PixelOverflow { .. }
                | Self::EmptyRun { .. }
        )
    }
}
