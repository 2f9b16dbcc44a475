//! Progressive container loader.
//!
//! For each stream the loader runs one fetch loop that moves through three
//! phases:
//!
//! - **Probing**: small windows at the current offset are scanned for
//!   top-level atoms. When the `moov` atom is seen but does not fit in the
//!   window, the window grows to the next power of two above the atom size
//!   (capped) and the same offset is fetched again.
//! - **Transition**: probed bytes are appended to the demuxer, which reports
//!   the next offset it needs. If only a few trailing bytes of the file are
//!   left, a zero-padding buffer is appended to make it finalize.
//! - **Streaming**: once the demuxer is ready, large windows are fetched
//!   at whatever offset the demuxer asks for, until it needs nothing more or
//!   the end of the file is reached.
//!
//! There is only ever one fetch in flight per stream and offsets are
//! appended to the demuxer in the order they are fetched. The session's
//! `active` flag is checked before each fetch; a fetch that finishes after
//! the session was deactivated is discarded.

use std::sync::Arc;

use bytes::Bytes;
use mediaferry_common::{Error, Result, StreamId};
use mediaferry_media::mp4::{scan_atoms, AtomType, ScanStop};
use mediaferry_media::{
    DemuxEvent, Demuxer, MediaSegment, MovieInfo, Mp4Demuxer, SegmentInfo, SegmentPlanner,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::session::{StreamRegistry, StreamSession};
use super::source::{FetchOptions, RangeSource};
use crate::config::LoaderConfig;

/// Capacity of the stream event channel.
const EVENT_CAPACITY: usize = 256;

/// Trailing bytes that are zero-padded instead of fetched.
const PADDING_THRESHOLD: u64 = 8;

/// Notification published to playback consumers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Metadata parsing completed. Sent once per session.
    StreamInitialize {
        id: StreamId,
        info: MovieInfo,
        segments: Vec<SegmentInfo>,
    },
    /// One segment is available. Sent in segment order.
    StreamSegment { id: StreamId, segment: MediaSegment },
    /// A fetch or demux problem. Demux errors leave the session running;
    /// fetch errors and an exhausted stall budget stop it.
    StreamError { id: StreamId, message: String },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &StreamId {
        match self {
            Self::StreamInitialize { id, .. }
            | Self::StreamSegment { id, .. }
            | Self::StreamError { id, .. } => id,
        }
    }
}

/// Creates a demuxer for a stream of the given total size.
pub type DemuxerFactory = Arc<dyn Fn(Option<u64>) -> Box<dyn Demuxer> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Probing { limit: u64 },
    Streaming,
}

/// What the loop does after handling one window.
enum Step {
    Continue { offset: u64, phase: Phase },
    Finished,
}

/// Drives progressive playback for any number of streams.
#[derive(Clone)]
pub struct ProgressiveLoader {
    source: Arc<dyn RangeSource>,
    registry: StreamRegistry,
    config: LoaderConfig,
    events: broadcast::Sender<StreamEvent>,
    make_demuxer: DemuxerFactory,
}

impl ProgressiveLoader {
    /// Create a loader that demuxes with [`Mp4Demuxer`].
    pub fn new(source: Arc<dyn RangeSource>, config: LoaderConfig) -> Self {
        let target = config.target_segment_secs;
        let make_demuxer: DemuxerFactory = Arc::new(move |total| {
            Box::new(
                Mp4Demuxer::new(total)
                    .with_planner(SegmentPlanner::new().target_duration(target)),
            )
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            source,
            registry: StreamRegistry::new(),
            config,
            events,
            make_demuxer,
        }
    }

    /// Use a different demuxer implementation.
    pub fn with_demuxer_factory(mut self, factory: DemuxerFactory) -> Self {
        self.make_demuxer = factory;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Start playback of `location` under `id`.
    ///
    /// Any session already registered under `id` is revoked. The returned
    /// handle resolves when the fetch loop stops.
    pub async fn start(
        &self,
        id: StreamId,
        location: impl Into<String>,
        mut options: FetchOptions,
    ) -> Result<JoinHandle<()>> {
        let location = location.into();
        if options.total_size.is_none() {
            options.total_size = self.source.total_size(&location, &options).await?;
        }

        let demuxer = (self.make_demuxer)(options.total_size);
        let session = Arc::new(StreamSession::new(id.clone(), location, options, demuxer));
        session.activate();
        self.registry.insert(Arc::clone(&session));

        tracing::info!(
            stream_id = %id,
            location = %session.location,
            total_size = ?session.options.total_size,
            "Starting progressive load"
        );

        let loader = self.clone();
        let phase = Phase::Probing {
            limit: self.config.probe_chunk_size,
        };
        Ok(tokio::spawn(async move { loader.drive(session, 0, phase).await }))
    }

    /// Seek a stream to `time_secs`.
    ///
    /// Returns the offset streaming continues from, or `None` if the demuxer
    /// cannot seek yet. A loop that already finished is restarted.
    pub fn seek(&self, id: &StreamId, time_secs: f64) -> Result<Option<u64>> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| Error::not_found(format!("stream {}", id)))?;

        let Some(offset) = session.with_demuxer(|d| d.seek(time_secs)).flatten() else {
            tracing::debug!(stream_id = %id, time_secs, "Seek ignored, demuxer not ready");
            return Ok(None);
        };

        session.set_pending_seek(offset);
        tracing::debug!(stream_id = %id, time_secs, offset, "Seek requested");

        if session.activate() {
            let loader = self.clone();
            tokio::spawn(async move { loader.drive(session, offset, Phase::Streaming).await });
        }
        Ok(Some(offset))
    }

    /// Stop a stream and forget its session.
    pub fn revoke(&self, id: &StreamId) -> bool {
        self.registry.remove(id).is_some()
    }

    async fn drive(&self, session: Arc<StreamSession>, mut offset: u64, mut phase: Phase) {
        let mut stalled = 0u32;

        loop {
            if !session.is_active() {
                tracing::debug!(stream_id = %session.id, offset, "Session inactive, stopping");
                return;
            }
            if let Some(seek_to) = session.take_pending_seek() {
                offset = seek_to;
                phase = Phase::Streaming;
            }

            let limit = match phase {
                Phase::Probing { limit } => limit,
                Phase::Streaming => self.config.stream_chunk_size,
            };

            let data = match self.fetch(&session, offset, limit).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(stream_id = %session.id, offset, limit, error = %e, "Fetch failed");
                    self.fail(&session, format!("fetch at {} failed: {}", offset, e));
                    return;
                }
            };

            if !session.is_active() {
                tracing::debug!(stream_id = %session.id, offset, "Discarding fetch after deactivation");
                return;
            }
            session.record_fetch(data.len());
            let fetched = data.len() as u64;

            let step = match phase {
                Phase::Probing { limit } => self.probe_step(&session, offset, limit, data),
                Phase::Streaming => self.stream_step(&session, offset, data),
            };
            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    // Skip past the window and keep going.
                    tracing::warn!(stream_id = %session.id, offset, error = %e, "Demuxer error");
                    self.report(&session, e.to_string());
                    self.advance(&session, offset, offset + fetched, phase)
                }
            };

            match step {
                Step::Continue {
                    offset: next,
                    phase: next_phase,
                } => {
                    let progressed = next != offset || next_phase != phase;
                    if progressed || matches!(next_phase, Phase::Streaming) {
                        stalled = 0;
                    } else {
                        stalled += 1;
                        if stalled > self.config.max_stalled_probes {
                            self.fail(
                                &session,
                                format!("no progress after {} probes at offset {}", stalled, offset),
                            );
                            return;
                        }
                    }
                    offset = next;
                    phase = next_phase;
                }
                Step::Finished => {
                    session.deactivate();
                    // A seek that raced with the end of the loop restarts it.
                    if session.has_pending_seek() && session.activate() {
                        continue;
                    }
                    let (fetches, bytes) = session.fetch_stats();
                    tracing::info!(stream_id = %session.id, fetches, bytes, "Progressive load finished");
                    return;
                }
            }
        }
    }

    async fn fetch(&self, session: &StreamSession, offset: u64, limit: u64) -> Result<Bytes> {
        tracing::trace!(stream_id = %session.id, offset, limit, "Fetching range");
        let request = self
            .source
            .get_part(&session.location, offset, limit, &session.options);

        match self.config.fetch_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| Error::timeout(format!("range {}+{}", offset, limit)))?,
            None => request.await,
        }
    }

    fn probe_step(
        &self,
        session: &StreamSession,
        offset: u64,
        limit: u64,
        data: Bytes,
    ) -> mediaferry_media::Result<Step> {
        let window_end = offset + data.len() as u64;

        let moov = session.with_atoms(|atoms| {
            let outcome = scan_atoms(&data, offset, atoms);
            if let ScanStop::Degenerate { offset: at } = outcome.stop {
                tracing::debug!(stream_id = %session.id, offset = at, "Degenerate atom while probing");
            }
            atoms.iter().find(|a| a.atom_type == AtomType::MOOV).cloned()
        });

        // Refetch the same offset with a window large enough for the movie header.
        if let Some(moov) = moov {
            let truncated = moov.end() > window_end && data.len() as u64 == limit;
            let grown = (moov.length + 8)
                .next_power_of_two()
                .min(self.config.max_chunk_size);
            if truncated && grown > limit {
                tracing::debug!(
                    stream_id = %session.id,
                    offset,
                    moov_length = moov.length,
                    limit = grown,
                    "Movie header exceeds probe window, refetching"
                );
                return Ok(Step::Continue {
                    offset,
                    phase: Phase::Probing { limit: grown },
                });
            }
        }

        let Some(next) = self.append(session, &data, offset)? else {
            return Ok(Step::Finished);
        };
        let ready = session.with_demuxer(|d| d.is_ready()).unwrap_or(false);

        if ready {
            tracing::debug!(stream_id = %session.id, next, "Demuxer ready, streaming");
            return Ok(self.advance(session, offset, next, Phase::Streaming));
        }
        if data.is_empty() {
            return Ok(Step::Finished);
        }
        Ok(Step::Continue {
            offset: next,
            phase: Phase::Probing { limit },
        })
    }

    fn stream_step(
        &self,
        session: &StreamSession,
        offset: u64,
        data: Bytes,
    ) -> mediaferry_media::Result<Step> {
        if data.is_empty() {
            return Ok(Step::Finished);
        }
        match self.append(session, &data, offset)? {
            Some(next) => Ok(self.advance(session, offset, next, Phase::Streaming)),
            None => Ok(Step::Finished),
        }
    }

    fn advance(&self, session: &StreamSession, offset: u64, next: u64, phase: Phase) -> Step {
        let past_end = session.options.total_size.is_some_and(|total| next >= total);
        if next == offset || past_end {
            Step::Finished
        } else {
            Step::Continue {
                offset: next,
                phase,
            }
        }
    }

    /// Append a window to the demuxer and publish what it produced.
    ///
    /// Returns the next offset the demuxer wants.
    fn append(
        &self,
        session: &StreamSession,
        data: &[u8],
        offset: u64,
    ) -> mediaferry_media::Result<Option<u64>> {
        let total = session.options.total_size;
        let result = session.with_demuxer(|demuxer| {
            let mut next = demuxer.append_buffer(data, offset)?;

            // Feed zeros for the last few bytes so the demuxer can finalize.
            if let (Some(n), Some(total)) = (next, total) {
                let remaining = total.saturating_sub(n);
                if remaining > 0 && remaining <= PADDING_THRESHOLD {
                    tracing::trace!(offset = n, remaining, "Padding stream tail");
                    next = demuxer.append_buffer(&vec![0u8; remaining as usize], n)?;
                }
            }

            Ok::<_, mediaferry_media::Error>((next, demuxer.drain_events()))
        });

        let Some(result) = result else {
            // Revoked while we were fetching.
            return Ok(None);
        };
        let (next, events) = result?;
        self.publish(session, events);
        Ok(next)
    }

    fn publish(&self, session: &StreamSession, events: Vec<DemuxEvent>) {
        for event in events {
            let event = match event {
                DemuxEvent::Ready { info, segments } => {
                    tracing::info!(
                        stream_id = %session.id,
                        tracks = info.tracks.len(),
                        segments = segments.len(),
                        duration_secs = info.duration_secs,
                        "Stream initialized"
                    );
                    StreamEvent::StreamInitialize {
                        id: session.id.clone(),
                        info,
                        segments,
                    }
                }
                DemuxEvent::Segment(segment) => {
                    tracing::trace!(stream_id = %session.id, index = segment.info.index, "Segment ready");
                    StreamEvent::StreamSegment {
                        id: session.id.clone(),
                        segment,
                    }
                }
            };
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn fail(&self, session: &StreamSession, message: String) {
        session.deactivate();
        self.report(session, message);
    }

    fn report(&self, session: &StreamSession, message: String) {
        let _ = self.events.send(StreamEvent::StreamError {
            id: session.id.clone(),
            message,
        });
    }
}
