//! Progressive loader integration tests against real MP4 files on disk.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mediaferry::config::LoaderConfig;
use mediaferry::streaming::{FetchOptions, FileRangeSource, ProgressiveLoader, StreamEvent};
use mediaferry_common::StreamId;
use tempfile::tempdir;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Collect events for `id` until the expected number of segments arrived.
async fn collect(
    events: &mut broadcast::Receiver<StreamEvent>,
    id: &StreamId,
    segments: usize,
) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    let mut seen = 0;
    while seen < segments {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for stream events")
            .expect("event channel closed");
        if event.stream_id() != id {
            continue;
        }
        if let StreamEvent::StreamError { message, .. } = &event {
            panic!("stream failed: {}", message);
        }
        if matches!(event, StreamEvent::StreamSegment { .. }) {
            seen += 1;
        }
        out.push(event);
    }
    out
}

fn check_segments(events: &[StreamEvent], file: &[u8], expected: usize) {
    let StreamEvent::StreamInitialize { info, segments, .. } = &events[0] else {
        panic!("expected initialize first, got {:?}", events[0]);
    };
    assert_eq!(info.tracks.len(), 1);
    assert_eq!(info.tracks[0].kind, "video");
    assert_eq!(segments.len(), expected);

    let delivered: Vec<_> = events[1..]
        .iter()
        .map(|e| match e {
            StreamEvent::StreamSegment { segment, .. } => segment,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(delivered.len(), expected);

    for (index, segment) in delivered.iter().enumerate() {
        assert_eq!(segment.info.index as usize, index);
        let (start, end) = segment.info.byte_range;
        assert_eq!(&segment.data[..], &file[start as usize..end as usize]);
    }
}

#[tokio::test]
async fn test_faststart_file_in_one_probe() {
    let dir = tempdir().unwrap();
    let file = common::faststart_mp4(6, 100);
    let path = common::write_fixture(dir.path(), "clip.mp4", &file);

    let loader = ProgressiveLoader::new(Arc::new(FileRangeSource::new()), LoaderConfig::default());
    let mut events = loader.subscribe();
    let id = StreamId::from("faststart");

    let handle = loader
        .start(id.clone(), path.to_str().unwrap(), FetchOptions::default())
        .await
        .unwrap();

    let received = collect(&mut events, &id, 3).await;
    handle.await.unwrap();

    check_segments(&received, &file, 3);
    let session = loader.registry().get(&id).unwrap();
    assert!(!session.is_active());
    assert_eq!(session.fetch_stats().0, 1);
}

#[tokio::test]
async fn test_movie_header_after_media_data() {
    let dir = tempdir().unwrap();
    let file = common::moov_at_end_mp4(8, 100_000);
    let path = common::write_fixture(dir.path(), "tail.mp4", &file);

    let loader = ProgressiveLoader::new(Arc::new(FileRangeSource::new()), LoaderConfig::default());
    let mut events = loader.subscribe();
    let id = StreamId::from("tail");

    let handle = loader
        .start(id.clone(), path.to_str().unwrap(), FetchOptions::default())
        .await
        .unwrap();

    let received = collect(&mut events, &id, 4).await;
    handle.await.unwrap();

    check_segments(&received, &file, 4);

    let session = loader.registry().get(&id).unwrap();
    let atoms = session.atoms();
    let kinds: Vec<String> = atoms.iter().map(|a| a.atom_type.to_string()).collect();
    assert_eq!(kinds, vec!["ftyp", "mdat", "moov"]);
}

#[tokio::test]
async fn test_missing_file_fails_to_start() {
    let loader = ProgressiveLoader::new(Arc::new(FileRangeSource::new()), LoaderConfig::default());
    let result = loader
        .start(
            StreamId::from("missing"),
            "/definitely/not/here.mp4",
            FetchOptions::default(),
        )
        .await;
    assert!(result.is_err());
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_restart_supersedes_previous_session() {
    let dir = tempdir().unwrap();
    let file = common::faststart_mp4(4, 100);
    let path = common::write_fixture(dir.path(), "again.mp4", &file);

    let loader = ProgressiveLoader::new(Arc::new(FileRangeSource::new()), LoaderConfig::default());
    let id = StreamId::from("again");

    let first = loader
        .start(id.clone(), path.to_str().unwrap(), FetchOptions::default())
        .await
        .unwrap();
    first.await.unwrap();
    let old = loader.registry().get(&id).unwrap();

    let mut events = loader.subscribe();
    let second = loader
        .start(id.clone(), path.to_str().unwrap(), FetchOptions::default())
        .await
        .unwrap();
    let received = collect(&mut events, &id, 2).await;
    second.await.unwrap();

    assert!(old.is_revoked());
    assert_eq!(loader.registry().len(), 1);
    check_segments(&received, &file, 2);
}
