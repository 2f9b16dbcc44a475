//! Incremental atom scanning over fetched byte windows.
//!
//! The progressive loader never holds a whole file. Each fetched window is
//! scanned starting from where the previous scan left off, so atoms are
//! discovered in file order and appended to a per-stream list exactly once.

use super::atoms::{Atom, AtomType, ATOM_HEADER_SIZE, LARGE_ATOM_HEADER_SIZE};

/// Why a scan of one buffer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Fewer than one header of bytes remain; fetch further and continue.
    Exhausted,
    /// An atom header declared a length of 0 (or less than its own header).
    /// The size cannot be determined from this buffer; retry from `offset`
    /// once more data is available.
    Degenerate { offset: u64 },
    /// The resume position lies before the buffer start, so this buffer
    /// cannot continue the scan.
    Unaligned { resume_at: u64 },
}

/// Result of scanning one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// The last atom fully or partially observed so far.
    pub last: Option<Atom>,
    /// Why scanning this buffer ended.
    pub stop: ScanStop,
}

/// Raw header fields read at one position.
struct Header {
    atom_type: AtomType,
    length: u64,
    header_size: u8,
}

/// Read an atom header from the start of `data`.
///
/// Returns `None` when not enough bytes are present for the header.
fn read_header(data: &[u8]) -> Option<Header> {
    if (data.len() as u64) < ATOM_HEADER_SIZE {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let atom_type = AtomType::from_bytes([data[4], data[5], data[6], data[7]]);

    if size == 1 {
        if (data.len() as u64) < LARGE_ATOM_HEADER_SIZE {
            return None;
        }
        let mut ext = [0u8; 8];
        ext.copy_from_slice(&data[8..16]);
        return Some(Header {
            atom_type,
            length: u64::from_be_bytes(ext),
            header_size: LARGE_ATOM_HEADER_SIZE as u8,
        });
    }

    Some(Header {
        atom_type,
        length: size,
        header_size: ATOM_HEADER_SIZE as u8,
    })
}

/// Scan top-level atoms in `buf`, which starts at absolute `base_offset`.
///
/// Scanning resumes at the end of the last atom already in `atoms` (or at
/// `base_offset` when none are known). Newly found atoms are appended; an
/// atom at an offset that is already known is never appended twice, so
/// scanning the same buffer again is a no-op.
pub fn scan_atoms(buf: &[u8], base_offset: u64, atoms: &mut Vec<Atom>) -> ScanOutcome {
    let resume_at = atoms.last().map(Atom::end).unwrap_or(base_offset);

    if resume_at < base_offset {
        return ScanOutcome {
            last: atoms.last().cloned(),
            stop: ScanStop::Unaligned { resume_at },
        };
    }

    let buf_len = buf.len() as u64;
    let mut pos = resume_at - base_offset;

    let stop = loop {
        if pos >= buf_len {
            break ScanStop::Exhausted;
        }

        let header = match read_header(&buf[pos as usize..]) {
            Some(h) => h,
            None => break ScanStop::Exhausted,
        };

        let offset = base_offset + pos;
        if header.length < header.header_size as u64 {
            break ScanStop::Degenerate { offset };
        }

        atoms.push(Atom::new(
            header.atom_type,
            offset,
            header.length,
            header.header_size,
        ));

        pos = pos.saturating_add(header.length);
    };

    if let ScanStop::Degenerate { offset } = stop {
        tracing::debug!(offset, "Atom with undeterminable size, scan paused");
    }

    ScanOutcome {
        last: atoms.last().cloned(),
        stop,
    }
}

/// Scan `buf` recursively, descending into container atoms.
///
/// The top level may end with a partially observed atom (returned without
/// children). Inside a container, a child that claims more bytes than its
/// parent has left stops the scan of that container.
pub fn scan_nested(buf: &[u8], base_offset: u64) -> Vec<Atom> {
    scan_level(buf, 0, buf.len(), base_offset, true)
}

fn scan_level(buf: &[u8], start: usize, end: usize, base: u64, top: bool) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut pos = start;

    while pos < end {
        let header = match read_header(&buf[pos..end]) {
            Some(h) => h,
            None => break,
        };

        if header.length < header.header_size as u64 {
            break;
        }

        let remaining = (end - pos) as u64;
        let mut atom = Atom::new(
            header.atom_type,
            base + pos as u64,
            header.length,
            header.header_size,
        );

        if header.length > remaining {
            if top {
                atoms.push(atom);
            }
            break;
        }

        let atom_end = pos + header.length as usize;
        if atom.is_container() {
            atom.children = scan_level(
                buf,
                pos + header.header_size as usize,
                atom_end,
                base,
                false,
            );
        }

        atoms.push(atom);
        pos = atom_end;
    }

    atoms
}
