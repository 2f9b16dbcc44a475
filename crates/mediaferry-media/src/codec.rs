//! Run-length + palette codec for cached animation frames.
//!
//! Layout (all multi-byte integers big-endian):
//!
//! ```text
//! version:u8 | total_frames:u16 | frame_rate:u8 | width:u16 | palette_size:u16
//! palette_size x color:u32
//! (palette_index:u16, run_length:u8)*
//! ```
//!
//! Frames are square: the runs expand to exactly `width * width` pixels.
//! Palette indices are assigned in order of first appearance, and runs are
//! capped at 255 pixels.
//!
//! The size field cannot hold 65536. A frame with exactly 65536 colors is
//! written with `palette_size = 0`, which is never produced otherwise for a
//! non-empty frame, and decoded back as 65536. Frames with more colors than
//! 16-bit indices can address are rejected with [`Error::PaletteOverflow`].

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Format version written by the frame cache worker.
pub const FORMAT_VERSION: u8 = 1;

/// Header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest palette 16-bit indices can address.
pub const MAX_PALETTE: usize = 1 << 16;

/// Longest run a single record can describe.
pub const MAX_RUN: usize = u8::MAX as usize;

const RECORD_LEN: usize = 3;

/// Per-frame header carried in front of the palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameHeader {
    pub version: u8,
    pub total_frames: u16,
    pub frame_rate: u8,
    /// Side length of the square frame.
    pub width: u16,
}

impl FrameHeader {
    /// Number of pixels in a frame with this header.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.width as usize
    }
}

/// A decompressed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    /// Row-major 32-bit pixels.
    pub pixels: Vec<u32>,
}

/// Compress a square frame of `header.width * header.width` pixels.
pub fn compress(pixels: &[u32], header: &FrameHeader) -> Result<Bytes> {
    let expected = header.pixel_count();
    if pixels.len() != expected {
        return Err(Error::PixelCountMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    let mut palette: Vec<u32> = Vec::new();
    let mut indices: HashMap<u32, u16> = HashMap::new();
    let mut runs = BytesMut::with_capacity(expected / 4 * RECORD_LEN);

    let mut push_run = |color: u32, run: usize| -> Result<()> {
        let index = match indices.get(&color) {
            Some(&i) => i,
            None => {
                if palette.len() == MAX_PALETTE {
                    return Err(Error::PaletteOverflow { max: MAX_PALETTE });
                }
                let i = palette.len() as u16;
                palette.push(color);
                indices.insert(color, i);
                i
            }
        };
        runs.put_u16(index);
        runs.put_u8(run as u8);
        Ok(())
    };

    if let Some((&first, rest)) = pixels.split_first() {
        let mut current = first;
        let mut run = 1usize;
        for &pixel in rest {
            if pixel == current && run < MAX_RUN {
                run += 1;
            } else {
                push_run(current, run)?;
                current = pixel;
                run = 1;
            }
        }
        push_run(current, run)?;
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + palette.len() * 4 + runs.len());
    out.put_u8(header.version);
    out.put_u16(header.total_frames);
    out.put_u8(header.frame_rate);
    out.put_u16(header.width);
    // 65536 wraps to 0; see module docs.
    out.put_u16(palette.len() as u16);
    for color in &palette {
        out.put_u32(*color);
    }
    out.put_slice(&runs);

    Ok(out.freeze())
}

/// Decompress a frame produced by [`compress`] (or any compliant encoder).
pub fn decompress(data: &[u8]) -> Result<DecodedFrame> {
    let mut buf = data;
    need(buf, data, HEADER_LEN)?;

    let header = FrameHeader {
        version: buf.get_u8(),
        total_frames: buf.get_u16(),
        frame_rate: buf.get_u8(),
        width: buf.get_u16(),
    };
    let expected = header.pixel_count();

    let palette_size = match buf.get_u16() as usize {
        0 if expected > 0 => MAX_PALETTE,
        n => n,
    };

    need(buf, data, palette_size * 4)?;
    let palette: Vec<u32> = (0..palette_size).map(|_| buf.get_u32()).collect();

    let mut pixels = Vec::with_capacity(expected);
    while pixels.len() < expected {
        let offset = data.len() - buf.remaining();
        need(buf, data, RECORD_LEN)?;

        let index = buf.get_u16();
        let run = buf.get_u8() as usize;

        let color = *palette
            .get(index as usize)
            .ok_or(Error::PaletteIndexOutOfRange {
                index,
                palette_size,
            })?;
        if run == 0 {
            return Err(Error::EmptyRun { offset });
        }
        if pixels.len() + run > expected {
            return Err(Error::PixelOverflow { offset, expected });
        }
        pixels.extend(std::iter::repeat(color).take(run));
    }

    Ok(DecodedFrame { header, pixels })
}

/// Pack RGBA bytes into big-endian `0xRRGGBBAA` pixels.
pub fn pixels_from_rgba(rgba: &[u8]) -> Vec<u32> {
    rgba.chunks_exact(4)
        .map(|p| u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
        .collect()
}

/// Unpack `0xRRGGBBAA` pixels into RGBA bytes.
pub fn rgba_from_pixels(pixels: &[u32]) -> Vec<u8> {
    pixels.iter().flat_map(|p| p.to_be_bytes()).collect()
}

fn need(buf: &[u8], data: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Truncated {
            offset: data.len() - buf.remaining(),
            need: n,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(width: u16) -> FrameHeader {
        FrameHeader {
            version: FORMAT_VERSION,
            total_frames: 60,
            frame_rate: 30,
            width,
        }
    }

    /// Deterministic xorshift pixels.
    fn noise(len: usize, mut seed: u32) -> Vec<u32> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_widths() {
        for width in [1u16, 2, 64, 256] {
            let n = width as usize * width as usize;
            let cases = [
                noise(n, 0x9e37_79b9),
                vec![0xff00_00ff; n],
                (0..n).map(|i| if (i / 7) % 2 == 0 { 0 } else { u32::MAX }).collect(),
            ];
            for pixels in cases {
                let encoded = compress(&pixels, &header(width)).unwrap();
                let decoded = decompress(&encoded).unwrap();
                assert_eq!(decoded.header, header(width));
                assert_eq!(decoded.pixels, pixels);
            }
        }
    }

    #[test]
    fn test_header_extremes_roundtrip() {
        for (total_frames, frame_rate) in [(0u16, 0u8), (u16::MAX, u8::MAX), (1, 60)] {
            let h = FrameHeader {
                version: 7,
                total_frames,
                frame_rate,
                width: 2,
            };
            let decoded = decompress(&compress(&[1, 2, 3, 4], &h).unwrap()).unwrap();
            assert_eq!(decoded.header, h);
        }
    }

    #[test]
    fn test_uniform_frame_splits_runs() {
        let encoded = compress(&vec![42u32; 64 * 64], &header(64)).unwrap();
        let records = (64 * 64 + MAX_RUN - 1) / MAX_RUN;
        assert_eq!(records, 17);
        assert_eq!(encoded.len(), HEADER_LEN + 4 + records * RECORD_LEN);

        // palette_size == 1
        assert_eq!(&encoded[6..8], &[0, 1]);
        // every record references index 0
        for record in encoded[HEADER_LEN + 4..].chunks(RECORD_LEN) {
            assert_eq!(&record[..2], &[0, 0]);
        }
    }

    #[test]
    fn test_byte_layout() {
        let h = FrameHeader {
            version: 1,
            total_frames: 0x0102,
            frame_rate: 24,
            width: 2,
        };
        let encoded = compress(&[0xAABBCCDD, 0xAABBCCDD, 0x11223344, 0xAABBCCDD], &h).unwrap();
        assert_eq!(
            &encoded[..],
            &[
                1, 0x01, 0x02, 24, 0, 2, 0, 2, // header
                0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44, // palette
                0, 0, 2, 0, 1, 1, 0, 0, 1, // runs
            ]
        );
    }

    #[test]
    fn test_full_palette_roundtrip() {
        let pixels: Vec<u32> = (0..65536u32).map(|i| i.wrapping_mul(2654435761)).collect();
        let encoded = compress(&pixels, &header(256)).unwrap();
        assert_eq!(&encoded[6..8], &[0, 0]);
        assert_eq!(decompress(&encoded).unwrap().pixels, pixels);
    }

    #[test]
    fn test_palette_overflow_is_rejected() {
        let pixels: Vec<u32> = (0..257u32 * 257).collect();
        let err = compress(&pixels, &header(257)).unwrap_err();
        assert!(matches!(err, Error::PaletteOverflow { max: MAX_PALETTE }));
    }

    #[test]
    fn test_pixel_count_mismatch() {
        let err = compress(&[1, 2, 3], &header(2)).unwrap_err();
        assert!(matches!(
            err,
            Error::PixelCountMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_empty_frame() {
        let encoded = compress(&[], &header(0)).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert!(decompress(&encoded).unwrap().pixels.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_palette_index() {
        let mut encoded = compress(&[5, 5, 5, 5], &header(2)).unwrap().to_vec();
        // first record index -> 1, palette has one entry
        encoded[HEADER_LEN + 4 + 1] = 1;
        let err = decompress(&encoded).unwrap_err();
        assert!(matches!(
            err,
            Error::PaletteIndexOutOfRange {
                index: 1,
                palette_size: 1
            }
        ));
        assert!(err.is_malformed_frame());
    }

    #[test]
    fn test_decode_rejects_pixel_overflow() {
        let mut encoded = compress(&[5, 5, 5, 5], &header(2)).unwrap().to_vec();
        encoded[HEADER_LEN + 4 + 2] = 5;
        assert!(matches!(
            decompress(&encoded),
            Err(Error::PixelOverflow { expected: 4, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncation_and_empty_runs() {
        let encoded = compress(&[1, 2, 3, 4], &header(2)).unwrap();
        assert!(matches!(
            decompress(&encoded[..5]),
            Err(Error::Truncated { offset: 0, need: 8 })
        ));
        assert!(matches!(
            decompress(&encoded[..encoded.len() - 1]),
            Err(Error::Truncated { .. })
        ));

        let mut zero_run = encoded.to_vec();
        zero_run[HEADER_LEN + 16 + 2] = 0;
        assert!(matches!(decompress(&zero_run), Err(Error::EmptyRun { .. })));
    }

    #[test]
    fn test_rgba_packing() {
        let rgba = [1, 2, 3, 4, 250, 251, 252, 253];
        let pixels = pixels_from_rgba(&rgba);
        assert_eq!(pixels, vec![0x01020304, 0xFAFBFCFD]);
        assert_eq!(rgba_from_pixels(&pixels), rgba.to_vec());
    }
}
