//! Caller side of the frame cache worker.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use mediaferry_common::{Result, StickerId};
use mediaferry_media::FrameHeader;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{FrameCacheWorker, WorkerMessage, WorkerRequest};
use crate::queue::{Completion, TaskQueue};

/// Capacity of the message broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// A compressed frame received from the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFrame {
    pub frame: u16,
    pub header: FrameHeader,
    pub data: Bytes,
}

#[derive(Debug)]
struct CacheJob {
    id: StickerId,
    src: String,
    width: u16,
}

/// Queues sticker cache requests so the worker renders one at a time, and
/// collects the frames it sends back.
#[derive(Clone)]
pub struct FrameCacheClient {
    queue: TaskQueue<CacheJob>,
    frames: Arc<DashMap<StickerId, Vec<CachedFrame>>>,
    events: broadcast::Sender<WorkerMessage>,
}

impl FrameCacheClient {
    /// Connect to a worker through its request and message channels.
    pub fn connect(
        requests: mpsc::UnboundedSender<WorkerRequest>,
        messages: mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> (Self, JoinHandle<()>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let client = Self {
            queue: TaskQueue::new(),
            frames: Arc::new(DashMap::new()),
            events,
        };
        let driver = tokio::spawn(client.clone().drive(requests, messages));
        (client, driver)
    }

    /// Spawn `worker` and connect to it.
    pub fn start(worker: FrameCacheWorker) -> (Self, JoinHandle<()>) {
        let (requests, messages, _worker) = worker.spawn();
        Self::connect(requests, messages)
    }

    /// Queue a sticker for caching.
    pub fn cache_sticker(&self, id: StickerId, src: impl Into<String>, width: u16) -> Result<()> {
        let src = src.into();
        tracing::debug!(sticker_id = %id, src = %src, width, "Queueing sticker");
        self.queue.register(CacheJob { id, src, width })
    }

    /// Drop a queued request. A request already handed to the worker runs
    /// to completion.
    pub fn cancel(&self, id: &StickerId) -> bool {
        !self.queue.filter(|job| job.id == *id).is_empty()
    }

    /// Frames received so far for `id`, in order.
    pub fn frames(&self, id: &StickerId) -> Vec<CachedFrame> {
        self.frames
            .get(id)
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    /// Forget the frames cached for `id`.
    pub fn evict(&self, id: &StickerId) -> bool {
        self.frames.remove(id).is_some()
    }

    /// Every message the worker sends.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.events.subscribe()
    }

    /// Frames of `id` as they arrive, ending after the last one.
    ///
    /// Only frames received after the call are yielded; use
    /// [`frames`](Self::frames) for those already cached.
    pub fn frame_stream(&self, id: StickerId) -> impl Stream<Item = CachedFrame> {
        stream::unfold(Some(self.subscribe()), move |receiver| {
            let id = id.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(WorkerMessage::CachedFrame {
                            id: frame_id,
                            frame,
                            data,
                            header,
                        }) if frame_id == id => {
                            let frame = CachedFrame {
                                frame,
                                header,
                                data,
                            };
                            return Some((frame, Some(receiver)));
                        }
                        Ok(message) if message.is_terminal() && *message.sticker_id() == id => {
                            return None;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(sticker_id = %id, skipped, "Frame stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
    }

    /// Stop taking requests. Queued requests are dropped.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    async fn drive(
        self,
        requests: mpsc::UnboundedSender<WorkerRequest>,
        mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        let mut in_flight: Option<(StickerId, Completion)> = None;

        loop {
            tokio::select! {
                next = self.queue.next() => {
                    let Some((job, done)) = next else { break };
                    tracing::debug!(sticker_id = %job.id, "Sending sticker to worker");
                    self.frames.insert(job.id.clone(), Vec::new());
                    let request = WorkerRequest::CacheSticker {
                        id: job.id.clone(),
                        src: job.src,
                        width: job.width,
                    };
                    if requests.send(request).is_err() {
                        tracing::warn!("Frame cache worker is gone");
                        break;
                    }
                    in_flight = Some((job.id, done));
                }
                message = messages.recv() => {
                    let Some(message) = message else { break };
                    self.record(&message);

                    let finished = in_flight
                        .as_ref()
                        .is_some_and(|(id, _)| message.is_terminal() && message.sticker_id() == id);
                    if finished {
                        if let Some((_, done)) = in_flight.take() {
                            done.complete();
                        }
                    }
                    // No subscribers is fine.
                    let _ = self.events.send(message);
                }
            }
        }
        tracing::debug!("Frame cache client stopped");
    }

    fn record(&self, message: &WorkerMessage) {
        match message {
            WorkerMessage::CachedFrame {
                id,
                frame,
                data,
                header,
            } => {
                self.frames.entry(id.clone()).or_default().push(CachedFrame {
                    frame: *frame,
                    header: *header,
                    data: data.clone(),
                });
            }
            WorkerMessage::CacheFailed { id, error } => {
                tracing::warn!(sticker_id = %id, error = %error, "Worker failed to cache sticker");
            }
            WorkerMessage::CacheComplete { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::tests::SolidLoader;
    use futures::StreamExt;
    use std::time::Duration;

    fn client() -> FrameCacheClient {
        let worker = FrameCacheWorker::new(Arc::new(SolidLoader), WorkerConfig::default());
        FrameCacheClient::start(worker).0
    }

    async fn wait_terminal(rx: &mut broadcast::Receiver<WorkerMessage>) -> WorkerMessage {
        loop {
            let message = rx.recv().await.unwrap();
            if message.is_terminal() {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_requests_are_served_one_at_a_time() {
        let client = client();
        let mut events = client.subscribe();

        client.cache_sticker(StickerId::from("a"), "3", 2).unwrap();
        client.cache_sticker(StickerId::from("b"), "2", 2).unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            let message = events.recv().await.unwrap();
            order.push(message.sticker_id().as_str().to_string());
        }
        // All of "a" comes before anything of "b".
        assert_eq!(order, vec!["a", "a", "a", "a", "b"]);
        assert!(wait_terminal(&mut events).await.sticker_id().as_str() == "b");

        let frames = client.frames(&StickerId::from("a"));
        assert_eq!(
            frames.iter().map(|f| f.frame).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(client.frames(&StickerId::from("b")).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_releases_queue() {
        let client = client();
        let mut events = client.subscribe();

        client.cache_sticker(StickerId::from("bad"), "??", 2).unwrap();
        client.cache_sticker(StickerId::from("good"), "1", 2).unwrap();

        let first = wait_terminal(&mut events).await;
        assert!(matches!(first, WorkerMessage::CacheFailed { .. }));
        let second = wait_terminal(&mut events).await;
        assert_eq!(
            second,
            WorkerMessage::CacheComplete {
                id: StickerId::from("good")
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        // A worker that never answers keeps the first request in flight.
        let (requests, _worker_rx) = mpsc::unbounded_channel();
        let (_worker_tx, messages) = mpsc::unbounded_channel();
        let (client, _driver) = FrameCacheClient::connect(requests, messages);

        client.cache_sticker(StickerId::from("first"), "1", 2).unwrap();
        client.cache_sticker(StickerId::from("second"), "1", 2).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.pending(), 1);
        assert!(client.cancel(&StickerId::from("second")));
        assert!(!client.cancel(&StickerId::from("first")));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let client = client();
        let stream = client.frame_stream(StickerId::from("s"));
        client.cache_sticker(StickerId::from("s"), "4", 1).unwrap();

        let frames: Vec<CachedFrame> = stream.collect().await;
        assert_eq!(frames.len(), 4);
        assert!(frames.windows(2).all(|w| w[0].frame < w[1].frame));
        assert_eq!(frames[0].header.total_frames, 4);
    }
}
