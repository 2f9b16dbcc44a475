//! MP4 atom definitions.

use super::SampleTable;

/// Size of a compact atom header (32-bit length + 4CC).
pub const ATOM_HEADER_SIZE: u64 = 8;

/// Size of an atom header carrying a 64-bit `largesize`.
pub const LARGE_ATOM_HEADER_SIZE: u64 = 16;

/// Four-character atom type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const MVEX: Self = Self(*b"mvex");
    pub const MOOF: Self = Self(*b"moof");
    pub const TRAF: Self = Self(*b"traf");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const UDTA: Self = Self(*b"udta");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether atoms of this type hold child atoms directly after their header.
    pub fn is_container(&self) -> bool {
        matches!(
            *self,
            Self::MOOV
                | Self::TRAK
                | Self::EDTS
                | Self::MDIA
                | Self::MINF
                | Self::STBL
                | Self::UDTA
                | Self::MVEX
                | Self::MOOF
                | Self::TRAF
        )
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An atom discovered in a container, positioned by absolute file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    /// Atom type code.
    pub atom_type: AtomType,
    /// Absolute file offset of the atom header.
    pub offset: u64,
    /// Total atom length including the header.
    pub length: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
    /// Child atoms, filled in only by the nested scan.
    pub children: Vec<Atom>,
}

impl Atom {
    /// Create an atom without children.
    pub fn new(atom_type: AtomType, offset: u64, length: u64, header_size: u8) -> Self {
        Self {
            atom_type,
            offset,
            length,
            header_size,
            children: Vec::new(),
        }
    }

    /// Absolute offset one past the last byte of this atom.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Absolute offset where the atom body starts.
    pub fn data_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Get the data size (length - header).
    pub fn data_size(&self) -> u64 {
        self.length.saturating_sub(self.header_size as u64)
    }

    /// Check if this atom contains child atoms.
    pub fn is_container(&self) -> bool {
        self.atom_type.is_container()
    }

    /// Whether the whole atom lies inside a window of `len` bytes at `window_start`.
    pub fn is_within(&self, window_start: u64, len: u64) -> bool {
        self.offset >= window_start && self.end() <= window_start.saturating_add(len)
    }

    /// First direct child of the given type.
    pub fn child(&self, atom_type: AtomType) -> Option<&Atom> {
        self.children.iter().find(|c| c.atom_type == atom_type)
    }

    /// All direct children of the given type.
    pub fn children_of(&self, atom_type: AtomType) -> impl Iterator<Item = &Atom> {
        self.children.iter().filter(move |c| c.atom_type == atom_type)
    }
}

/// Handler type for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    Hint,
    Meta,
    Text,
    Unknown([u8; 4]),
}

impl HandlerType {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        match &bytes {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            b"hint" => Self::Hint,
            b"meta" => Self::Meta,
            b"text" => Self::Text,
            _ => Self::Unknown(bytes),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio)
    }

    /// Short lowercase name used in stream notifications.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Hint => "hint",
            Self::Meta => "meta",
            Self::Text => "text",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Track information extracted from trak atom.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track ID.
    pub track_id: u32,
    /// Handler type (video/audio/etc).
    pub handler_type: HandlerType,
    /// Track duration in media timescale.
    pub duration: u64,
    /// Media timescale (samples per second for this track).
    pub timescale: u32,
    /// Sample table with all sample info.
    pub sample_table: SampleTable,
    /// Sample entry code of the first sample description (avc1, mp4a, ...).
    pub codec: Option<AtomType>,
    /// Width (for video tracks).
    pub width: Option<u32>,
    /// Height (for video tracks).
    pub height: Option<u32>,
    /// Sample rate (for audio tracks).
    pub sample_rate: Option<u32>,
    /// Channel count (for audio tracks).
    pub channels: Option<u16>,
}

impl TrackInfo {
    /// Create empty track info.
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            handler_type: HandlerType::Unknown([0; 4]),
            duration: 0,
            timescale: 1,
            sample_table: SampleTable::default(),
            codec: None,
            width: None,
            height: None,
            sample_rate: None,
            channels: None,
        }
    }

    /// Get duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_bounds() {
        let atom = Atom::new(AtomType::MOOV, 100, 50, 8);
        assert_eq!(atom.end(), 150);
        assert_eq!(atom.data_offset(), 108);
        assert_eq!(atom.data_size(), 42);
        assert!(atom.is_within(100, 50));
        assert!(atom.is_within(0, 4096));
        assert!(!atom.is_within(0, 149));
        assert!(!atom.is_within(101, 4096));
    }

    #[test]
    fn test_container_types() {
        assert!(AtomType::MOOV.is_container());
        assert!(AtomType::STBL.is_container());
        assert!(!AtomType::MDAT.is_container());
        assert!(!AtomType::STSD.is_container());
        assert_eq!(AtomType::FTYP.to_string(), "ftyp");
        assert_eq!(AtomType([0xff, 0, 0, 0]).as_str(), "????");
    }

    #[test]
    fn test_handler_names() {
        assert_eq!(HandlerType::from_bytes(*b"vide").name(), "video");
        assert_eq!(HandlerType::from_bytes(*b"soun").name(), "audio");
        assert_eq!(HandlerType::from_bytes(*b"xxxx").name(), "unknown");
    }
}
