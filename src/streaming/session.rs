//! Stream sessions and the registry that owns them.
//!
//! One [`StreamSession`] exists per playback id. The [`StreamRegistry`] is the
//! only place sessions are inserted or removed; registering an id that is
//! already present supersedes the previous session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mediaferry_common::StreamId;
use mediaferry_media::{Atom, Demuxer};
use parking_lot::Mutex;

use super::source::FetchOptions;

/// State of one progressive playback.
pub struct StreamSession {
    pub id: StreamId,
    pub location: String,
    pub options: FetchOptions,
    /// Top-level atoms discovered so far; append-only.
    atoms: Mutex<Vec<Atom>>,
    /// `None` once the session has been revoked.
    demuxer: Mutex<Option<Box<dyn Demuxer>>>,
    /// Whether the fetch loop is running.
    active: AtomicBool,
    pending_seek: Mutex<Option<u64>>,
    fetches: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl StreamSession {
    pub fn new(
        id: StreamId,
        location: impl Into<String>,
        options: FetchOptions,
        demuxer: Box<dyn Demuxer>,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            options,
            atoms: Mutex::new(Vec::new()),
            demuxer: Mutex::new(Some(demuxer)),
            active: AtomicBool::new(false),
            pending_seek: Mutex::new(None),
            fetches: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the session active. Returns `false` if it already was, or if it
    /// has been revoked.
    pub fn activate(&self) -> bool {
        !self.is_revoked()
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Stop the session for good and drop its demuxer.
    pub fn revoke(&self) {
        self.deactivate();
        self.demuxer.lock().take();
    }

    pub fn is_revoked(&self) -> bool {
        self.demuxer.lock().is_none()
    }

    /// Run `f` against the demuxer, unless the session was revoked.
    pub fn with_demuxer<R>(&self, f: impl FnOnce(&mut dyn Demuxer) -> R) -> Option<R> {
        let mut guard = self.demuxer.lock();
        guard.as_mut().map(|demuxer| f(demuxer.as_mut()))
    }

    /// Run `f` against the discovered atom list.
    pub fn with_atoms<R>(&self, f: impl FnOnce(&mut Vec<Atom>) -> R) -> R {
        f(&mut self.atoms.lock())
    }

    /// Snapshot of the discovered atoms.
    pub fn atoms(&self) -> Vec<Atom> {
        self.atoms.lock().clone()
    }

    pub fn set_pending_seek(&self, offset: u64) {
        *self.pending_seek.lock() = Some(offset);
    }

    pub fn take_pending_seek(&self) -> Option<u64> {
        self.pending_seek.lock().take()
    }

    pub fn has_pending_seek(&self) -> bool {
        self.pending_seek.lock().is_some()
    }

    pub(crate) fn record_fetch(&self, len: usize) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Number of completed fetches and bytes received.
    pub fn fetch_stats(&self) -> (u64, u64) {
        (
            self.fetches.load(Ordering::Relaxed),
            self.bytes_fetched.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("active", &self.is_active())
            .field("atoms", &self.atoms.lock().len())
            .finish()
    }
}

/// Thread-safe map from stream id to its session.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    sessions: Arc<DashMap<StreamId, Arc<StreamSession>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, revoking and returning any session it supersedes.
    pub fn insert(&self, session: Arc<StreamSession>) -> Option<Arc<StreamSession>> {
        let id = session.id.clone();
        let previous = self.sessions.insert(id.clone(), session);
        if let Some(old) = &previous {
            old.revoke();
            tracing::info!(stream_id = %id, "Superseded existing stream session");
        }
        previous
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<StreamSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove and revoke a session.
    pub fn remove(&self, id: &StreamId) -> Option<Arc<StreamSession>> {
        let (_, session) = self.sessions.remove(id)?;
        session.revoke();
        let (fetches, bytes) = session.fetch_stats();
        tracing::info!(stream_id = %id, fetches, bytes, "Removed stream session");
        Some(session)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaferry_media::Mp4Demuxer;

    fn session(id: &str) -> Arc<StreamSession> {
        Arc::new(StreamSession::new(
            StreamId::from(id),
            "clip.mp4",
            FetchOptions::with_total_size(100),
            Box::new(Mp4Demuxer::new(Some(100))),
        ))
    }

    #[test]
    fn test_activate_is_exclusive() {
        let s = session("a");
        assert!(s.activate());
        assert!(!s.activate());
        s.deactivate();
        assert!(s.activate());
    }

    #[test]
    fn test_revoked_session_cannot_restart() {
        let s = session("a");
        s.revoke();
        assert!(s.is_revoked());
        assert!(!s.activate());
        assert!(s.with_demuxer(|d| d.is_ready()).is_none());
    }

    #[test]
    fn test_insert_supersedes() {
        let registry = StreamRegistry::new();
        let first = session("a");
        assert!(first.activate());
        assert!(registry.insert(first.clone()).is_none());

        let second = session("a");
        let old = registry.insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&old, &first));
        assert!(first.is_revoked());
        assert!(!first.is_active());
        assert!(!second.is_revoked());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_revokes() {
        let registry = StreamRegistry::new();
        let s = session("b");
        registry.insert(s.clone());
        assert_eq!(registry.ids(), vec![StreamId::from("b")]);

        registry.remove(&StreamId::from("b")).unwrap();
        assert!(s.is_revoked());
        assert!(registry.is_empty());
        assert!(registry.remove(&StreamId::from("b")).is_none());
    }

    #[test]
    fn test_pending_seek_is_taken_once() {
        let s = session("c");
        s.set_pending_seek(42);
        assert!(s.has_pending_seek());
        assert_eq!(s.take_pending_seek(), Some(42));
        assert_eq!(s.take_pending_seek(), None);
    }
}
