//! MP4 container parsing.
//!
//! Atoms are discovered incrementally with [`scan_atoms`] while bytes
//! arrive; once a complete `moov` is available, [`Movie::parse`] resolves
//! the track sample tables the demuxer plans segments from.

mod atoms;
mod movie;
mod sample_table;
pub mod scan;

pub use atoms::{Atom, AtomType, HandlerType, TrackInfo, ATOM_HEADER_SIZE, LARGE_ATOM_HEADER_SIZE};
pub use movie::{Movie, MovieInfo, TrackSummary, MAX_MOOV_SIZE};
pub use sample_table::{SampleEntry, SampleTable, SampleTableBuilder, MAX_SAMPLES};
pub use scan::{scan_atoms, scan_nested, ScanOutcome, ScanStop};

#[cfg(test)]
pub(crate) use movie::tests::{boxed, build_moov};
