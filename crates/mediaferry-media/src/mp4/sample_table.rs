//! MP4 sample table resolution.
//!
//! The `stbl` boxes describe samples indirectly:
//! - stts: decode durations, run-length coded
//! - stss: sync samples (keyframes), 1-based
//! - stsc: sample-to-chunk runs
//! - stsz: sample sizes (or one uniform size)
//! - stco/co64: chunk offsets
//! - ctts: composition offsets
//!
//! [`SampleTableBuilder`] flattens them into one [`SampleEntry`] per sample.

use std::collections::HashSet;

use super::MAX_MOOV_SIZE;
use crate::{Error, Result};

/// Most samples one track may declare: as many as a `stsz` size table
/// filling the largest accepted `moov` could list.
pub const MAX_SAMPLES: u64 = MAX_MOOV_SIZE / 4;

/// A resolved sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    /// Sample index (0-based).
    pub index: u32,
    /// Absolute file offset of the sample data.
    pub offset: u64,
    /// Sample size in bytes.
    pub size: u32,
    /// Decode timestamp in media timescale.
    pub dts: u64,
    /// Composition time offset.
    pub cts_offset: i32,
    /// Whether this sample is a sync sample.
    pub is_keyframe: bool,
}

impl SampleEntry {
    /// Presentation timestamp, clamped at zero.
    pub fn pts(&self) -> u64 {
        (self.dts as i64 + self.cts_offset as i64).max(0) as u64
    }

    /// Absolute offset one past the sample data.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size as u64)
    }
}

/// Flattened samples of one track.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    /// All resolved samples, in decode order.
    pub samples: Vec<SampleEntry>,
}

impl SampleTable {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the table has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get sample by index.
    pub fn get(&self, index: u32) -> Option<&SampleEntry> {
        self.samples.get(index as usize)
    }

    /// Indices of all keyframes.
    pub fn keyframe_indices(&self) -> Vec<u32> {
        self.samples
            .iter()
            .filter(|s| s.is_keyframe)
            .map(|s| s.index)
            .collect()
    }

    /// Smallest byte range covering the samples in `start..end`.
    pub fn byte_span(&self, start: u32, end: u32) -> Option<(u64, u64)> {
        let slice = self.samples.get(start as usize..end as usize)?;
        let first = slice.iter().map(|s| s.offset).min()?;
        let last = slice.iter().map(SampleEntry::end).max()?;
        Some((first, last))
    }
}

/// Collects raw `stbl` entries and resolves them into a [`SampleTable`].
#[derive(Debug, Default)]
pub struct SampleTableBuilder {
    /// (sample_count, delta)
    stts: Vec<(u32, u32)>,
    /// 1-based sync sample numbers.
    sync_samples: Option<Vec<u32>>,
    /// (first_chunk, samples_per_chunk)
    stsc: Vec<(u32, u32)>,
    uniform_size: u32,
    sizes: Vec<u32>,
    sample_count: u32,
    chunk_offsets: Vec<u64>,
    /// (sample_count, offset)
    ctts: Vec<(u32, i32)>,
}

impl SampleTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stts(&mut self, entries: Vec<(u32, u32)>) -> &mut Self {
        self.stts = entries;
        self
    }

    pub fn sync_samples(&mut self, samples: Vec<u32>) -> &mut Self {
        self.sync_samples = Some(samples);
        self
    }

    pub fn stsc(&mut self, entries: Vec<(u32, u32)>) -> &mut Self {
        self.stsc = entries;
        self
    }

    /// Set sample sizes. With a non-zero `uniform_size`, `sizes` is ignored
    /// and `sample_count` samples share that size.
    pub fn stsz(&mut self, uniform_size: u32, sample_count: u32, sizes: Vec<u32>) -> &mut Self {
        self.uniform_size = uniform_size;
        self.sample_count = sample_count;
        self.sizes = sizes;
        self
    }

    pub fn chunk_offsets(&mut self, offsets: Vec<u64>) -> &mut Self {
        self.chunk_offsets = offsets;
        self
    }

    pub fn ctts(&mut self, entries: Vec<(u32, i32)>) -> &mut Self {
        self.ctts = entries;
        self
    }

    /// Resolve every sample's offset, size, timing and sync flag.
    ///
    /// A uniform-size `stsz` only carries a count, so that count must fit in
    /// what `stsc`/`stco` describe and stay under [`MAX_SAMPLES`].
    pub fn build(&self) -> Result<SampleTable> {
        let count = if self.uniform_size > 0 {
            let declared = u64::from(self.sample_count);
            let described = self.described_samples();
            if declared > described.min(MAX_SAMPLES) {
                return Err(Error::invalid_mp4(format!(
                    "stsz declares {} samples, chunk tables describe {}",
                    declared, described
                )));
            }
            declared as usize
        } else {
            self.sizes.len()
        };
        if count == 0 {
            return Ok(SampleTable::default());
        }

        let size_of = |i: usize| {
            if self.uniform_size > 0 {
                self.uniform_size
            } else {
                self.sizes[i]
            }
        };

        let offsets = self.resolve_offsets(count, size_of);
        let dts = expand_runs(&self.stts, count);
        let cts = expand_values(&self.ctts, count);
        let sync: Option<HashSet<u32>> = self
            .sync_samples
            .as_ref()
            .map(|s| s.iter().copied().collect());

        let samples = (0..count)
            .map(|i| SampleEntry {
                index: i as u32,
                offset: offsets[i],
                size: size_of(i),
                dts: dts[i],
                cts_offset: cts[i],
                // No stss means every sample is a sync sample.
                is_keyframe: sync
                    .as_ref()
                    .map(|s| s.contains(&(i as u32 + 1)))
                    .unwrap_or(true),
            })
            .collect();

        Ok(SampleTable { samples })
    }

    /// Number of samples the chunk tables account for.
    fn described_samples(&self) -> u64 {
        let chunk_end = self.chunk_offsets.len() as u64 + 1;
        self.stsc
            .iter()
            .enumerate()
            .map(|(i, &(first_chunk, per_chunk))| {
                let next_first = self
                    .stsc
                    .get(i + 1)
                    .map(|e| u64::from(e.0))
                    .unwrap_or(chunk_end)
                    .min(chunk_end);
                next_first
                    .saturating_sub(u64::from(first_chunk.max(1)))
                    .saturating_mul(u64::from(per_chunk))
            })
            .fold(0, u64::saturating_add)
    }

    fn resolve_offsets(&self, count: usize, size_of: impl Fn(usize) -> u32) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(count);
        let chunk_count = self.chunk_offsets.len() as u32;
        let mut sample = 0usize;

        for (i, &(first_chunk, per_chunk)) in self.stsc.iter().enumerate() {
            let next_first = self
                .stsc
                .get(i + 1)
                .map(|e| e.0)
                .unwrap_or(chunk_count + 1);

            for chunk in first_chunk.max(1)..next_first.min(chunk_count + 1) {
                let mut pos = self.chunk_offsets[(chunk - 1) as usize];
                for _ in 0..per_chunk {
                    if sample >= count {
                        return offsets;
                    }
                    offsets.push(pos);
                    pos = pos.saturating_add(size_of(sample) as u64);
                    sample += 1;
                }
            }
        }

        // Samples not described by stsc keep running on from the last one.
        while offsets.len() < count {
            let next = match offsets.last() {
                Some(&last) => last.saturating_add(size_of(offsets.len() - 1) as u64),
                None => self.chunk_offsets.first().copied().unwrap_or(0),
            };
            offsets.push(next);
        }

        offsets
    }
}

/// Expand (count, delta) runs into absolute decode times.
fn expand_runs(runs: &[(u32, u32)], count: usize) -> Vec<u64> {
    let mut out = Vec::with_capacity(count);
    let mut time = 0u64;
    let mut last_delta = 1u32;

    for &(n, delta) in runs {
        last_delta = delta;
        for _ in 0..n {
            if out.len() == count {
                return out;
            }
            out.push(time);
            time += delta as u64;
        }
    }

    while out.len() < count {
        out.push(time);
        time += last_delta as u64;
    }
    out
}

/// Expand (count, value) runs, padding with zero.
fn expand_values(runs: &[(u32, i32)], count: usize) -> Vec<i32> {
    let mut out: Vec<i32> = runs
        .iter()
        .flat_map(|&(n, v)| std::iter::repeat(v).take(n as usize))
        .take(count)
        .collect();
    out.resize(count, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_entry_pts() {
        let sample = SampleEntry {
            index: 0,
            offset: 100,
            size: 1000,
            dts: 100,
            cts_offset: -200,
            is_keyframe: true,
        };
        assert_eq!(sample.pts(), 0);
        assert_eq!(sample.end(), 1100);
    }

    #[test]
    fn test_sample_table_builder() {
        let table = SampleTableBuilder::new()
            .stts(vec![(3, 1000)])
            .sync_samples(vec![1])
            .stsc(vec![(1, 3)])
            .stsz(0, 3, vec![100, 200, 150])
            .chunk_offsets(vec![1000])
            .build()
            .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.samples[0].offset, 1000);
        assert_eq!(table.samples[1].offset, 1100);
        assert_eq!(table.samples[2].offset, 1300);
        assert_eq!(table.samples[2].dts, 2000);
        assert!(table.samples[0].is_keyframe);
        assert!(!table.samples[1].is_keyframe);
        assert_eq!(table.byte_span(0, 3), Some((1000, 1450)));
    }

    #[test]
    fn test_uniform_size_across_chunks() {
        let table = SampleTableBuilder::new()
            .stts(vec![(4, 512)])
            .stsc(vec![(1, 2)])
            .stsz(10, 4, vec![])
            .chunk_offsets(vec![0, 500])
            .build()
            .unwrap();

        let offsets: Vec<u64> = table.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 10, 500, 510]);
        assert!(table.samples.iter().all(|s| s.is_keyframe));
        assert_eq!(table.keyframe_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_table() {
        let table = SampleTableBuilder::new().build().unwrap();
        assert!(table.is_empty());
        assert_eq!(table.byte_span(0, 1), None);
    }

    #[test]
    fn test_uniform_count_beyond_chunk_tables_is_rejected() {
        let err = SampleTableBuilder::new()
            .stts(vec![(3, 1000)])
            .stsc(vec![(1, 3)])
            .stsz(1, u32::MAX, vec![])
            .chunk_offsets(vec![1000])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMp4(_)));
    }

    #[test]
    fn test_uniform_count_bounded_even_when_described() {
        let result = SampleTableBuilder::new()
            .stsc(vec![(1, u32::MAX)])
            .stsz(1, u32::MAX, vec![])
            .chunk_offsets(vec![0])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_offsets_saturate_near_end_of_range() {
        let table = SampleTableBuilder::new()
            .stsc(vec![(1, 2)])
            .stsz(0, 2, vec![10, 10])
            .chunk_offsets(vec![u64::MAX - 5])
            .build()
            .unwrap();
        assert_eq!(table.samples[1].offset, u64::MAX);
        assert_eq!(table.samples[1].end(), u64::MAX);
    }
}
