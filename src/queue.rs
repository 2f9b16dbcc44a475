//! Single-concurrency task queue.
//!
//! [`TaskQueue`] hands out one task at a time. The consumer receives each
//! task together with a [`Completion`]; the next task is only released once
//! that completion is signalled (explicitly or by dropping it). An optional
//! comparator keeps queued tasks ordered; a task that is already in flight
//! is never preempted by a later registration.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = TaskQueue::with_ordering(|a: &Job, b: &Job| b.priority.cmp(&a.priority));
//! queue.register(job)?;
//! queue.run(|job, done| async move {
//!     worker.send(job).await;
//!     // `done` is completed later, when the worker reports back.
//!     pending.insert(job.id, done);
//! }).await;
//! ```

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use mediaferry_common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Handle to a shared single-concurrency queue.
pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    compare: Option<Comparator<T>>,
}

struct State<T> {
    queue: VecDeque<T>,
    in_flight: bool,
    closed: bool,
}

/// Releases the in-flight slot exactly once.
///
/// Dropping a `Completion` without calling [`complete`](Self::complete)
/// releases the slot as well, so a consumer that fails halfway cannot wedge
/// the queue.
pub struct Completion {
    slot: Option<Arc<dyn Slot>>,
}

trait Slot: Send + Sync {
    fn release(&self);
}

impl<T: Send> Slot for Inner<T> {
    fn release(&self) {
        self.state.lock().in_flight = false;
        self.notify.notify_waiters();
    }
}

impl Completion {
    /// Signal that the in-flight task is finished.
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.slot.is_some())
            .finish()
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    /// Create a FIFO queue.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue that keeps tasks sorted by `compare`.
    ///
    /// Tasks comparing equal keep their registration order.
    pub fn with_ordering<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(compare)))
    }

    fn build(compare: Option<Comparator<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    in_flight: false,
                    closed: false,
                }),
                notify: Notify::new(),
                compare,
            }),
        }
    }

    /// Enqueue a task and wake the driver.
    pub fn register(&self, task: T) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed("task queue"));
            }

            let position = match &self.inner.compare {
                Some(compare) => state
                    .queue
                    .iter()
                    .position(|queued| compare(&task, queued) == Ordering::Less)
                    .unwrap_or(state.queue.len()),
                None => state.queue.len(),
            };
            state.queue.insert(position, task);
            tracing::trace!(position, queued = state.queue.len(), "Task registered");
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next task.
    ///
    /// Resolves once nothing is in flight and a task is queued. Returns
    /// `None` after [`close`](Self::close).
    pub async fn next(&self) -> Option<(T, Completion)> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return None;
                }
                if !state.in_flight {
                    if let Some(task) = state.queue.pop_front() {
                        state.in_flight = true;
                        let slot: Arc<dyn Slot> = self.inner.clone();
                        return Some((task, Completion { slot: Some(slot) }));
                    }
                }
            }

            notified.await;
        }
    }

    /// Remove queued tasks matching `predicate`; the in-flight task is unaffected.
    pub fn filter<F>(&self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut state = self.inner.state.lock();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for task in state.queue.drain(..) {
            if predicate(&task) {
                removed.push(task);
            } else {
                kept.push_back(task);
            }
        }
        state.queue = kept;
        removed
    }

    /// Stop handing out tasks. Queued tasks are dropped.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Number of queued (not yet started) tasks.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a task is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    /// Drive `process` with one task at a time until the queue is closed.
    ///
    /// `process` may return before the task is done; the next task is only
    /// started once the [`Completion`] it received is signalled.
    pub async fn run<F, Fut>(&self, mut process: F)
    where
        F: FnMut(T, Completion) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some((task, completion)) = self.next().await {
            process(task, completion).await;
        }
        tracing::debug!("Task queue closed");
    }
}

impl<T: Send + 'static> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    struct Job {
        name: &'static str,
        priority: u8,
    }

    fn job(name: &'static str, priority: u8) -> Job {
        Job { name, priority }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        for n in 0..3 {
            queue.register(n).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (task, done) = queue.next().await.unwrap();
            seen.push(task);
            done.complete();
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_priority_order_and_single_flight() {
        let queue = TaskQueue::with_ordering(|a: &Job, b: &Job| b.priority.cmp(&a.priority));
        queue.register(job("A", 5)).unwrap();
        queue.register(job("B", 9)).unwrap();
        queue.register(job("C", 1)).unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let driver = {
            let queue = queue.clone();
            let active = active.clone();
            let overlaps = overlaps.clone();
            tokio::spawn(async move {
                queue
                    .run(move |job, done| {
                        if active.fetch_add(1, AtomicOrdering::SeqCst) != 0 {
                            overlaps.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                        started_tx.send((job, done)).ok();
                        async {}
                    })
                    .await
            })
        };

        let mut order = Vec::new();
        for _ in 0..3 {
            let (job, done) = started_rx.recv().await.unwrap();
            order.push(job.name);

            // Nothing else starts while this one is held.
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(started_rx.try_recv().is_err());

            active.fetch_sub(1, AtomicOrdering::SeqCst);
            done.complete();
        }

        assert_eq!(order, vec!["B", "A", "C"]);
        assert_eq!(overlaps.load(AtomicOrdering::SeqCst), 0);

        queue.close();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_equal_priority_is_stable() {
        let queue = TaskQueue::with_ordering(|a: &Job, b: &Job| b.priority.cmp(&a.priority));
        queue.register(job("first", 1)).unwrap();
        queue.register(job("second", 1)).unwrap();
        queue.register(job("urgent", 2)).unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            let (j, done) = queue.next().await.unwrap();
            names.push(j.name);
            done.complete();
        }
        assert_eq!(names, vec!["urgent", "first", "second"]);
    }

    #[tokio::test]
    async fn test_no_preemption() {
        let queue = TaskQueue::with_ordering(|a: &Job, b: &Job| b.priority.cmp(&a.priority));
        queue.register(job("low", 0)).unwrap();
        let (running, done) = queue.next().await.unwrap();
        assert_eq!(running.name, "low");

        queue.register(job("high", 9)).unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), queue.next()).await;
        assert!(pending.is_err());

        done.complete();
        let (next, _done) = queue.next().await.unwrap();
        assert_eq!(next.name, "high");
    }

    #[tokio::test]
    async fn test_dropped_completion_releases_slot() {
        let queue = TaskQueue::new();
        queue.register(1).unwrap();
        queue.register(2).unwrap();

        let (_, done) = queue.next().await.unwrap();
        assert!(queue.is_busy());
        drop(done);
        assert!(!queue.is_busy());

        let (task, _) = queue.next().await.unwrap();
        assert_eq!(task, 2);
    }

    #[tokio::test]
    async fn test_filter_keeps_in_flight_task() {
        let queue = TaskQueue::new();
        for n in 0..5 {
            queue.register(n).unwrap();
        }
        let (running, done) = queue.next().await.unwrap();

        let removed = queue.filter(|n| n % 2 == 0);
        assert_eq!(removed, vec![2, 4]);
        assert_eq!(queue.len(), 2);
        assert_eq!(running, 0);
        assert!(queue.is_busy());

        done.complete();
        let (next, _) = queue.next().await.unwrap();
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn test_close_wakes_driver() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap());
        assert!(matches!(queue.register(1), Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn test_register_wakes_waiting_driver() {
        let queue = TaskQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.map(|(t, _)| t) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.register("late").unwrap();
        assert_eq!(waiter.await.unwrap(), Some("late"));
    }
}
