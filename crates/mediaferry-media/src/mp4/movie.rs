//! Movie metadata parsing from a complete `moov` atom.

use super::scan::scan_nested;
use super::{Atom, AtomType, HandlerType, SampleTableBuilder, TrackInfo};
use crate::{Error, Result};

/// Maximum accepted `moov` size (64 MB) to bound memory on malformed input.
pub const MAX_MOOV_SIZE: u64 = 64 * 1024 * 1024;

/// Parsed movie metadata with resolved sample tables.
#[derive(Debug, Clone)]
pub struct Movie {
    /// Movie timescale (time units per second).
    pub timescale: u32,
    /// Duration in movie timescale units.
    pub duration: u64,
    /// All tracks in file order.
    pub tracks: Vec<TrackInfo>,
}

/// Summary of one track, as reported to playback consumers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackSummary {
    pub track_id: u32,
    pub kind: String,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub sample_count: usize,
    pub duration_secs: f64,
}

/// Summary of a movie, as reported to playback consumers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MovieInfo {
    pub timescale: u32,
    pub duration_secs: f64,
    pub tracks: Vec<TrackSummary>,
}

impl Movie {
    /// Parse a complete `moov` atom located at absolute `moov_offset`.
    pub fn parse(moov_bytes: &[u8], moov_offset: u64) -> Result<Self> {
        if moov_bytes.len() as u64 > MAX_MOOV_SIZE {
            return Err(Error::invalid_mp4(format!(
                "moov size {} exceeds maximum {}",
                moov_bytes.len(),
                MAX_MOOV_SIZE
            )));
        }

        let top = scan_nested(moov_bytes, moov_offset);
        let moov = top
            .into_iter()
            .next()
            .filter(|a| a.atom_type == AtomType::MOOV)
            .ok_or(Error::MissingAtom("moov"))?;
        if moov.length > moov_bytes.len() as u64 {
            return Err(Error::BufferUnderflow {
                need: moov.length as usize,
                have: moov_bytes.len(),
            });
        }

        let bytes = MoovBytes {
            bytes: moov_bytes,
            offset: moov_offset,
        };

        let mut movie = Movie {
            timescale: 1000,
            duration: 0,
            tracks: Vec::new(),
        };

        if let Some(mvhd) = moov.child(AtomType::MVHD) {
            let data = bytes.body(mvhd);
            let (ts_at, dur_at, wide) = if data.first() == Some(&1) {
                (20, 24, true)
            } else {
                (12, 16, false)
            };
            if let Some(ts) = be_u32(data, ts_at) {
                movie.timescale = ts;
            }
            movie.duration = if wide {
                be_u64(data, dur_at).unwrap_or(0)
            } else {
                be_u32(data, dur_at).unwrap_or(0) as u64
            };
        }

        for trak in moov.children_of(AtomType::TRAK) {
            movie.tracks.push(parse_trak(trak, &bytes)?);
        }

        if movie.tracks.is_empty() {
            return Err(Error::MissingAtom("trak"));
        }

        Ok(movie)
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }

    /// First video track, if any.
    pub fn video_track(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.handler_type.is_video())
    }

    /// First audio track, if any.
    pub fn audio_track(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.handler_type.is_audio())
    }

    /// The track segments are planned on: video if present, else the first track.
    pub fn primary_track(&self) -> Option<&TrackInfo> {
        self.video_track().or_else(|| self.tracks.first())
    }

    /// Consumer-facing summary.
    pub fn info(&self) -> MovieInfo {
        MovieInfo {
            timescale: self.timescale,
            duration_secs: self.duration_secs(),
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackSummary {
                    track_id: t.track_id,
                    kind: t.handler_type.name().to_string(),
                    codec: t.codec.map(|c| c.to_string()),
                    width: t.width,
                    height: t.height,
                    sample_rate: t.sample_rate,
                    channels: t.channels,
                    sample_count: t.sample_table.len(),
                    duration_secs: t.duration_secs(),
                })
                .collect(),
        }
    }
}

/// The bytes of a complete `moov`, addressed by absolute file offsets.
struct MoovBytes<'a> {
    bytes: &'a [u8],
    offset: u64,
}

impl<'a> MoovBytes<'a> {
    /// Body of a descendant atom (everything after its header).
    fn body(&self, atom: &Atom) -> &'a [u8] {
        let start = atom.data_offset().saturating_sub(self.offset) as usize;
        let end = (atom.end().saturating_sub(self.offset) as usize).min(self.bytes.len());
        &self.bytes[start.min(end)..end]
    }
}

fn parse_trak(trak: &Atom, bytes: &MoovBytes<'_>) -> Result<TrackInfo> {
    let mut track = TrackInfo::new(0);

    if let Some(tkhd) = trak.child(AtomType::TKHD) {
        let data = bytes.body(tkhd);
        let (id_at, size_at) = if data.first() == Some(&1) { (20, 84) } else { (12, 76) };
        if let Some(id) = be_u32(data, id_at) {
            track.track_id = id;
        }
        if let (Some(w), Some(h)) = (be_u32(data, size_at), be_u32(data, size_at + 4)) {
            // 16.16 fixed point
            if w > 0 && h > 0 {
                track.width = Some(w >> 16);
                track.height = Some(h >> 16);
            }
        }
    }

    let Some(mdia) = trak.child(AtomType::MDIA) else {
        return Ok(track);
    };

    if let Some(mdhd) = mdia.child(AtomType::MDHD) {
        let data = bytes.body(mdhd);
        if data.first() == Some(&1) {
            track.timescale = be_u32(data, 20).unwrap_or(1);
            track.duration = be_u64(data, 24).unwrap_or(0);
        } else {
            track.timescale = be_u32(data, 12).unwrap_or(1);
            track.duration = be_u32(data, 16).unwrap_or(0) as u64;
        }
    }

    if let Some(hdlr) = mdia.child(AtomType::HDLR) {
        let data = bytes.body(hdlr);
        if let Some(kind) = data.get(8..12) {
            track.handler_type = HandlerType::from_bytes([kind[0], kind[1], kind[2], kind[3]]);
        }
    }

    let Some(stbl) = mdia
        .child(AtomType::MINF)
        .and_then(|minf| minf.child(AtomType::STBL))
    else {
        return Ok(track);
    };

    let mut builder = SampleTableBuilder::new();
    for child in &stbl.children {
        let data = bytes.body(child);
        match child.atom_type {
            AtomType::STTS => {
                builder.stts(table(data, 8, |e| Some((be_u32(e, 0)?, be_u32(e, 4)?))));
            }
            AtomType::STSS => {
                builder.sync_samples(table(data, 4, |e| be_u32(e, 0)));
            }
            AtomType::STSC => {
                builder.stsc(table(data, 12, |e| Some((be_u32(e, 0)?, be_u32(e, 4)?))));
            }
            AtomType::STSZ => {
                let uniform = be_u32(data, 4).unwrap_or(0);
                let count = be_u32(data, 8).unwrap_or(0);
                let sizes = if uniform == 0 {
                    data.get(12..)
                        .unwrap_or(&[])
                        .chunks_exact(4)
                        .take(count as usize)
                        .filter_map(|e| be_u32(e, 0))
                        .collect()
                } else {
                    Vec::new()
                };
                builder.stsz(uniform, count, sizes);
            }
            AtomType::STCO => {
                builder.chunk_offsets(table(data, 4, |e| be_u32(e, 0).map(u64::from)));
            }
            AtomType::CO64 => {
                builder.chunk_offsets(table(data, 8, |e| be_u64(e, 0)));
            }
            AtomType::CTTS => {
                builder.ctts(table(data, 8, |e| {
                    Some((be_u32(e, 0)?, be_u32(e, 4)? as i32))
                }));
            }
            AtomType::STSD => parse_stsd(data, &mut track),
            _ => {}
        }
    }
    track.sample_table = builder.build()?;

    Ok(track)
}

/// Read the first sample description: codec code plus audio parameters.
fn parse_stsd(data: &[u8], track: &mut TrackInfo) {
    // version/flags(4) entry_count(4) then the first entry's box header
    if let Some(code) = data.get(12..16) {
        track.codec = Some(AtomType::from_bytes([code[0], code[1], code[2], code[3]]));
    }

    if track.handler_type.is_audio() {
        // AudioSampleEntry: channelCount at 32, sampleRate (16.16) at 40
        if let (Some(ch), Some(rate)) = (be_u16(data, 32), be_u32(data, 40)) {
            track.channels = Some(ch);
            track.sample_rate = Some(rate >> 16);
        }
    }
}

/// Parse a full-box table: version/flags, entry count, then fixed-size entries.
fn table<T>(data: &[u8], entry_size: usize, parse: impl Fn(&[u8]) -> Option<T>) -> Vec<T> {
    let count = be_u32(data, 4).unwrap_or(0) as usize;
    data.get(8..)
        .unwrap_or(&[])
        .chunks_exact(entry_size)
        .take(count)
        .filter_map(parse)
        .collect()
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    let b = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    let b = data.get(at..at + 8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    Some(u64::from_be_bytes(out))
}
