//! Incremental demuxing of progressively fetched MP4 data.
//!
//! A [`Demuxer`] receives byte windows in the order the loader fetches them
//! and answers with the next file offset it needs. [`Mp4Demuxer`] walks the
//! top-level atoms until it holds a complete `moov`, plans keyframe-aligned
//! segments, and then hands out each segment's bytes as soon as its whole
//! byte range has arrived.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::mp4::{AtomType, Movie, MovieInfo, ATOM_HEADER_SIZE, LARGE_ATOM_HEADER_SIZE};
use crate::segments::{SegmentInfo, SegmentPlanner};
use crate::{Error, Result};

/// A planned segment together with its bytes.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub info: SegmentInfo,
    pub data: Bytes,
}

/// Something the demuxer produced while consuming data.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// Metadata parsing completed; segments can be requested.
    Ready {
        info: MovieInfo,
        segments: Vec<SegmentInfo>,
    },
    /// One segment's bytes are complete.
    Segment(MediaSegment),
}

/// Incremental container parser driven by the progressive loader.
pub trait Demuxer: Send {
    /// Append bytes that start at absolute `file_offset`.
    ///
    /// Returns the next offset the demuxer needs data from, or `None` when
    /// it needs nothing more.
    fn append_buffer(&mut self, data: &[u8], file_offset: u64) -> Result<Option<u64>>;

    /// Whether metadata has been parsed and segments are being produced.
    fn is_ready(&self) -> bool;

    /// Reposition to the segment containing `time_secs`.
    ///
    /// Returns the offset to continue fetching from, or `None` if seeking is
    /// not possible yet.
    fn seek(&mut self, time_secs: f64) -> Option<u64>;

    /// Take the events produced since the last call, in order.
    fn drain_events(&mut self) -> Vec<DemuxEvent>;
}

/// [`Demuxer`] for progressive (non-fragmented) MP4 files.
pub struct Mp4Demuxer {
    total_size: Option<u64>,
    planner: SegmentPlanner,
    /// Contiguous bytes starting at `buffer_start`.
    buffer: BytesMut,
    buffer_start: u64,
    /// Next top-level atom offset while looking for `moov`.
    cursor: u64,
    movie: Option<Movie>,
    segments: Vec<SegmentInfo>,
    next_segment: usize,
    events: VecDeque<DemuxEvent>,
}

impl Mp4Demuxer {
    /// Create a demuxer for a file of `total_size` bytes, if known.
    pub fn new(total_size: Option<u64>) -> Self {
        Self {
            total_size,
            planner: SegmentPlanner::new(),
            buffer: BytesMut::new(),
            buffer_start: 0,
            cursor: 0,
            movie: None,
            segments: Vec::new(),
            next_segment: 0,
            events: VecDeque::new(),
        }
    }

    /// Use a custom segment planner.
    pub fn with_planner(mut self, planner: SegmentPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Parsed movie, once ready.
    pub fn movie(&self) -> Option<&Movie> {
        self.movie.as_ref()
    }

    /// Planned segments, once ready.
    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    fn buffer_end(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    /// Merge a new window into the contiguous buffer.
    fn merge(&mut self, data: &[u8], file_offset: u64) {
        let end = self.buffer_end();
        if self.buffer.is_empty() || file_offset < self.buffer_start || file_offset > end {
            self.buffer.clear();
            self.buffer.extend_from_slice(data);
            self.buffer_start = file_offset;
            return;
        }

        let overlap = (end - file_offset) as usize;
        if data.len() > overlap {
            self.buffer.extend_from_slice(&data[overlap..]);
        }
    }

    /// Drop buffered bytes before `offset`.
    fn discard_before(&mut self, offset: u64) {
        if offset <= self.buffer_start {
            return;
        }
        let n = ((offset - self.buffer_start) as usize).min(self.buffer.len());
        let _ = self.buffer.split_to(n);
        self.buffer_start += n as u64;
    }

    /// Walk top-level atoms until `moov` is complete.
    fn probe(&mut self) -> Result<Option<u64>> {
        loop {
            if let Some(total) = self.total_size {
                if total.saturating_sub(self.cursor) < ATOM_HEADER_SIZE {
                    return Err(Error::MissingAtom("moov"));
                }
            }

            let end = self.buffer_end();
            if self.cursor < self.buffer_start || self.cursor >= end {
                return Ok(Some(self.cursor));
            }

            let rel = (self.cursor - self.buffer_start) as usize;
            let header = &self.buffer[rel..];
            if (header.len() as u64) < ATOM_HEADER_SIZE {
                return Ok(Some(end));
            }

            let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let atom_type = AtomType::from_bytes([header[4], header[5], header[6], header[7]]);
            let length = match size {
                0 => match self.total_size {
                    Some(total) => total - self.cursor,
                    None => {
                        return Err(Error::demux(format!(
                            "{} at {} extends to end of unknown-length stream",
                            atom_type, self.cursor
                        )))
                    }
                },
                1 => {
                    if (header.len() as u64) < LARGE_ATOM_HEADER_SIZE {
                        return Ok(Some(end));
                    }
                    let mut ext = [0u8; 8];
                    ext.copy_from_slice(&header[8..16]);
                    u64::from_be_bytes(ext)
                }
                n => n,
            };
            if length < ATOM_HEADER_SIZE {
                return Err(Error::invalid_mp4(format!(
                    "{} at {} has invalid size {}",
                    atom_type, self.cursor, length
                )));
            }

            let atom_end = self.cursor.checked_add(length).ok_or_else(|| {
                Error::invalid_mp4(format!(
                    "{} at {} has size {} past the end of any file",
                    atom_type, self.cursor, length
                ))
            })?;

            if atom_type == AtomType::MOOV {
                if atom_end > end {
                    return Ok(Some(end));
                }
                let moov_start = self.cursor;
                let movie = Movie::parse(&self.buffer[rel..rel + length as usize], moov_start)?;
                self.cursor = atom_end;
                self.on_movie(movie);
                return self.emit_segments();
            }

            tracing::trace!(atom = %atom_type, offset = self.cursor, length, "Skipping atom");
            self.cursor = atom_end;
            self.discard_before(self.cursor);
        }
    }

    fn on_movie(&mut self, movie: Movie) {
        let segments = self.planner.plan(&movie);
        tracing::debug!(
            tracks = movie.tracks.len(),
            segments = segments.len(),
            duration_secs = movie.duration_secs(),
            "Movie metadata parsed"
        );
        self.events.push_back(DemuxEvent::Ready {
            info: movie.info(),
            segments: segments.clone(),
        });
        self.segments = segments;
        self.next_segment = 0;
        self.movie = Some(movie);
    }

    /// Emit every segment whose bytes are fully buffered, in order.
    fn emit_segments(&mut self) -> Result<Option<u64>> {
        while let Some(segment) = self.segments.get(self.next_segment) {
            let (start, end) = segment.byte_range;
            let buffer_end = self.buffer_end();

            if start < self.buffer_start || start > buffer_end {
                return Ok(Some(start));
            }
            if end > buffer_end {
                self.discard_before(start);
                return Ok(Some(self.buffer_end()));
            }

            let from = (start - self.buffer_start) as usize;
            let to = (end - self.buffer_start) as usize;
            let data = Bytes::copy_from_slice(&self.buffer[from..to]);
            self.events.push_back(DemuxEvent::Segment(MediaSegment {
                info: segment.clone(),
                data,
            }));
            self.next_segment += 1;
        }

        Ok(None)
    }
}

impl Demuxer for Mp4Demuxer {
    fn append_buffer(&mut self, data: &[u8], file_offset: u64) -> Result<Option<u64>> {
        self.merge(data, file_offset);
        if self.movie.is_none() {
            self.probe()
        } else {
            self.emit_segments()
        }
    }

    fn is_ready(&self) -> bool {
        self.movie.is_some()
    }

    fn seek(&mut self, time_secs: f64) -> Option<u64> {
        if self.segments.is_empty() {
            return None;
        }
        let index = self
            .segments
            .iter()
            .position(|s| s.contains_time(time_secs))
            .unwrap_or(if time_secs <= 0.0 {
                0
            } else {
                self.segments.len() - 1
            });
        self.next_segment = index;
        Some(self.segments[index].byte_range.0)
    }

    fn drain_events(&mut self) -> Vec<DemuxEvent> {
        self.events.drain(..).collect()
    }
}
