//! Keyframe-aligned segment planning.
//!
//! Once the movie header is parsed, the demuxer splits the primary track
//! into independently playable segments. Each segment starts on a keyframe
//! and spans at least the target duration (except the last one). Its byte
//! range covers the primary track's samples plus any samples of the other
//! tracks that decode within the same time window, so interleaved audio is
//! delivered with the video it belongs to.

use crate::mp4::{Movie, SampleTable, TrackInfo};

/// Default target segment duration in seconds.
pub const DEFAULT_TARGET_DURATION_SECS: f64 = 2.0;

/// One planned segment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentInfo {
    /// Segment index (0-based).
    pub index: u32,
    /// First primary-track sample in the segment.
    pub start_sample: u32,
    /// One past the last primary-track sample.
    pub end_sample: u32,
    /// Start time in seconds.
    pub start_time_secs: f64,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Absolute byte range `[start, end)` holding the segment's samples.
    pub byte_range: (u64, u64),
}

impl SegmentInfo {
    /// Whether `time_secs` falls inside this segment.
    pub fn contains_time(&self, time_secs: f64) -> bool {
        time_secs >= self.start_time_secs && time_secs < self.start_time_secs + self.duration_secs
    }

    /// Number of bytes in the segment's range.
    pub fn byte_len(&self) -> u64 {
        self.byte_range.1.saturating_sub(self.byte_range.0)
    }
}

/// Builder for keyframe-aligned segment plans.
pub struct SegmentPlanner {
    target_duration_secs: f64,
}

impl SegmentPlanner {
    /// Create a planner with the default target duration.
    pub fn new() -> Self {
        Self {
            target_duration_secs: DEFAULT_TARGET_DURATION_SECS,
        }
    }

    /// Set target segment duration in seconds.
    pub fn target_duration(mut self, secs: f64) -> Self {
        self.target_duration_secs = secs;
        self
    }

    /// Plan segments for a movie.
    pub fn plan(&self, movie: &Movie) -> Vec<SegmentInfo> {
        let Some(primary) = movie.primary_track() else {
            return Vec::new();
        };
        let table = &primary.sample_table;
        if table.is_empty() || primary.timescale == 0 {
            return Vec::new();
        }

        let timescale = primary.timescale as f64;
        let track_end = table
            .samples
            .last()
            .map(|s| s.dts)
            .unwrap_or(0)
            .max(primary.duration);
        let target_ticks = (self.target_duration_secs * timescale) as u64;

        let boundaries = self.boundaries(table, target_ticks);
        let others: Vec<&TrackInfo> = movie
            .tracks
            .iter()
            .filter(|t| t.track_id != primary.track_id && t.timescale > 0)
            .collect();

        boundaries
            .windows(2)
            .enumerate()
            .filter_map(|(index, w)| {
                let (start, end) = (w[0], w[1]);
                let start_dts = table.get(start)?.dts;
                let end_dts = table.get(end).map(|s| s.dts).unwrap_or(track_end);
                let start_secs = start_dts as f64 / timescale;
                let end_secs = end_dts as f64 / timescale;

                let mut range = table.byte_span(start, end)?;
                for track in &others {
                    if let Some((s, e)) = span_in_window(track, start_secs, end_secs) {
                        range = (range.0.min(s), range.1.max(e));
                    }
                }

                Some(SegmentInfo {
                    index: index as u32,
                    start_sample: start,
                    end_sample: end,
                    start_time_secs: start_secs,
                    duration_secs: (end_secs - start_secs).max(0.0),
                    byte_range: range,
                })
            })
            .collect()
    }

    /// Sample indices where segments start, plus the sample count at the end.
    fn boundaries(&self, table: &SampleTable, target_ticks: u64) -> Vec<u32> {
        let mut boundaries = vec![0u32];
        let mut segment_start = table.samples[0].dts;

        for sample in table.samples.iter().skip(1) {
            if sample.is_keyframe && sample.dts.saturating_sub(segment_start) >= target_ticks {
                boundaries.push(sample.index);
                segment_start = sample.dts;
            }
        }

        boundaries.push(table.len() as u32);
        boundaries
    }
}

impl Default for SegmentPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte span of a track's samples decoding within `[start, end)` seconds.
fn span_in_window(track: &TrackInfo, start_secs: f64, end_secs: f64) -> Option<(u64, u64)> {
    let timescale = track.timescale as f64;
    track
        .sample_table
        .samples
        .iter()
        .filter(|s| {
            let t = s.dts as f64 / timescale;
            t >= start_secs && t < end_secs
        })
        .fold(None, |acc, s| match acc {
            None => Some((s.offset, s.end())),
            Some((lo, hi)) => Some((lo.min(s.offset), hi.max(s.end()))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::build_moov;

    #[test]
    fn test_segments_split_on_keyframes() {
        // 6 samples of 1s each, keyframes at samples 0, 2, 4.
        let moov = build_moov(1000, &[10, 20, 30, 40, 50, 60], &[1, 3, 5]);
        let movie = Movie::parse(&moov, 0).unwrap();

        let segments = SegmentPlanner::new().target_duration(2.0).plan(&movie);
        assert_eq!(segments.len(), 3);

        assert_eq!(segments[0].start_sample, 0);
        assert_eq!(segments[0].end_sample, 2);
        assert_eq!(segments[0].byte_range, (1000, 1030));
        assert!((segments[0].duration_secs - 2.0).abs() < 1e-9);

        assert_eq!(segments[1].byte_range, (1030, 1100));
        assert!((segments[1].start_time_secs - 2.0).abs() < 1e-9);

        assert_eq!(segments[2].byte_range, (1100, 1210));
        assert!((segments[2].duration_secs - 2.0).abs() < 1e-9);
        assert!(segments[2].contains_time(5.5));
        assert!(!segments[2].contains_time(6.0));
    }

    #[test]
    fn test_short_keyframe_gaps_are_merged() {
        let moov = build_moov(0, &[1, 1, 1, 1], &[1, 2, 3, 4]);
        let movie = Movie::parse(&moov, 0).unwrap();

        let segments = SegmentPlanner::new().target_duration(3.0).plan(&movie);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].end_sample, 3);
        assert_eq!(segments[1].byte_len(), 1);
    }
}
