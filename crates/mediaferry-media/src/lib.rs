//! Mediaferry-Media: MP4 atom scanning, incremental demuxing and the frame codec
//!
//! This crate holds the byte-level pieces of mediaferry. Nothing here does
//! I/O; callers feed it buffers they fetched themselves.
//!
//! # Modules
//!
//! - `mp4` - Atom scanning over partial windows and `moov` parsing
//! - `segments` - Keyframe-aligned segment planning
//! - `demux` - Incremental demuxer fed by the progressive loader
//! - `codec` - RLE + palette compression of square animation frames
//!
//! # Architecture
//!
//! The progressive loader fetches a file in windows. Each window is scanned
//! for top-level atoms with [`mp4::scan_atoms`] so the loader knows whether the
//! `moov` atom is complete, then appended to a [`Demuxer`]:
//!
//! 1. The demuxer walks top-level atoms until it holds the whole `moov`
//! 2. Sample tables are resolved from stts/stsz/stss/stsc/stco
//! 3. Segments are planned on keyframe boundaries
//! 4. Each segment is emitted once all of its bytes have arrived

pub mod codec;
pub mod demux;
pub mod error;
pub mod mp4;
pub mod segments;

pub use codec::{compress, decompress, DecodedFrame, FrameHeader, FORMAT_VERSION};
pub use demux::{DemuxEvent, Demuxer, MediaSegment, Mp4Demuxer};
pub use error::{Error, Result};
pub use mp4::{Atom, AtomType, Movie, MovieInfo};
pub use segments::{SegmentInfo, SegmentPlanner};
