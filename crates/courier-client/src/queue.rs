// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! In-memory FIFO of mutating requests issued while offline.
//!
//! The queue only buffers; replay is driven by
//! [`RequestGateway::on_connectivity_restored`][crate::RequestGateway::on_connectivity_restored]
//! so replayed requests go through the same timeout and retry policy as live
//! ones. Entries are never reordered and are removed only by replay,
//! [`OfflineQueue::clear`], or drop-oldest eviction when a capacity is set.
//!
//! The queue is not persisted: queued mutations are lost with the process.

use crate::{
    Error,
    transport::{RequestDescriptor, Response},
};
use log::{debug, warn};
use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};
use tokio::sync::oneshot;

type Responder = oneshot::Sender<Result<Response, Error>>;

/// A parked request and the channel settling its original caller.
#[derive(Debug)]
pub struct QueuedRequest {
    descriptor: RequestDescriptor,
    responder: Responder,
}

impl QueuedRequest {
    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Settles the original caller with the replay outcome.
    pub(crate) fn settle(self, outcome: Result<Response, Error>) {
        if self.responder.send(outcome).is_err() {
            debug!("Caller of {} stopped waiting", self.descriptor);
        }
    }
}

/// Outcome of a queued request, available once it has been replayed.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Response, Error>>,
}

impl Future for PendingResponse {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::QueueCleared)))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedRequest>,
    draining: bool,
}

#[derive(Debug, Default)]
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    max_len: Option<usize>,
}

impl OfflineQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `max_len` requests. When full, the oldest entry
    /// is evicted and its caller settles with [`Error::QueueCleared`].
    pub fn with_max_len(max_len: usize) -> Self {
        OfflineQueue {
            max_len: Some(max_len.max(1)),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `descriptor` and returns the future of its eventual replay.
    pub fn enqueue(&self, descriptor: RequestDescriptor) -> PendingResponse {
        self.push(self.lock(), descriptor)
    }

    /// Appends `descriptor` only while entries wait or a drain runs. The
    /// check and the append happen under the lock a drain pops under, so an
    /// accepted entry is always seen by that drain or left for the next one.
    /// Hands the descriptor back when the queue is idle.
    pub(crate) fn enqueue_if_busy(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<PendingResponse, RequestDescriptor> {
        let state = self.lock();
        if !state.draining && state.pending.is_empty() {
            return Err(descriptor);
        }
        Ok(self.push(state, descriptor))
    }

    fn push(
        &self,
        mut state: MutexGuard<'_, QueueState>,
        descriptor: RequestDescriptor,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let evicted = match self.max_len {
            Some(max_len) if state.pending.len() >= max_len => state.pending.pop_front(),
            _ => None,
        };
        state.pending.push_back(QueuedRequest {
            descriptor,
            responder: tx,
        });
        debug!("Offline queue holds {} request(s)", state.pending.len());
        drop(state);

        if let Some(evicted) = evicted {
            warn!("Offline queue full, dropping {}", evicted.descriptor);
            evicted.settle(Err(Error::QueueCleared));
        }

        PendingResponse { rx }
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// True while entries wait or a drain runs. New mutating calls must queue
    /// behind them.
    pub fn is_busy(&self) -> bool {
        let state = self.lock();
        state.draining || !state.pending.is_empty()
    }

    /// Snapshot of the queued descriptors in replay order.
    pub fn pending(&self) -> Vec<RequestDescriptor> {
        self.lock()
            .pending
            .iter()
            .map(|queued| queued.descriptor.clone())
            .collect()
    }

    /// Drops every queued request, settling each caller with
    /// [`Error::QueueCleared`]. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<_> = self.lock().pending.drain(..).collect();
        let count = removed.len();
        for queued in removed {
            queued.settle(Err(Error::QueueCleared));
        }
        if count > 0 {
            warn!("Cleared {} queued request(s)", count);
        }
        count
    }

    /// Marks a drain as started. Returns false when one is already running.
    pub(crate) fn begin_drain(&self) -> bool {
        let mut state = self.lock();
        if state.draining {
            return false;
        }
        state.draining = true;
        true
    }

    /// Pops the head for replay, ending the drain when the queue is empty.
    pub(crate) fn next_for_replay(&self) -> Option<QueuedRequest> {
        let mut state = self.lock();
        let next = state.pending.pop_front();
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    /// Puts a request whose replay hit the network back at the head and ends
    /// the drain.
    pub(crate) fn requeue_front(&self, queued: QueuedRequest) {
        let mut state = self.lock();
        state.pending.push_front(queued);
        state.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn post(path: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            format!("https://chat.example{}", path),
            Method::POST,
            None,
            BTreeMap::new(),
        )
    }

    fn endpoints(queue: &OfflineQueue) -> Vec<String> {
        queue
            .pending()
            .iter()
            .map(|d| d.endpoint().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_fifo_replay_order() {
        let queue = OfflineQueue::new();
        let a = queue.enqueue(post("/a"));
        let _b = queue.enqueue(post("/b"));
        let _c = queue.enqueue(post("/c"));
        assert_eq!(queue.len(), 3);

        assert!(queue.begin_drain());
        assert!(!queue.begin_drain());
        assert!(queue.is_busy());

        let head = queue.next_for_replay().unwrap();
        assert_eq!(head.descriptor().endpoint(), "https://chat.example/a");
        head.settle(Ok(Response::from_json(json!({"sent": true}))));
        assert_eq!(a.await.unwrap().json::<serde_json::Value>().unwrap()["sent"], true);

        assert_eq!(
            endpoints(&queue),
            vec!["https://chat.example/b", "https://chat.example/c"]
        );
    }

    #[tokio::test]
    async fn test_drain_ends_when_empty() {
        let queue = OfflineQueue::new();
        let _a = queue.enqueue(post("/a"));
        assert!(queue.begin_drain());
        assert!(queue.next_for_replay().is_some());
        assert!(queue.is_draining());
        assert!(queue.next_for_replay().is_none());
        assert!(!queue.is_draining());
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn test_enqueue_if_busy_joins_running_drain() {
        let queue = OfflineQueue::new();
        assert!(queue.enqueue_if_busy(post("/idle")).is_err());

        let _a = queue.enqueue(post("/a"));
        assert!(queue.begin_drain());
        assert!(queue.next_for_replay().is_some());

        // drain still running with nothing left: the entry joins it
        assert!(queue.enqueue_if_busy(post("/b")).is_ok());
        let next = queue.next_for_replay().unwrap();
        assert_eq!(next.descriptor().endpoint(), "https://chat.example/b");

        assert!(queue.next_for_replay().is_none());
        assert!(queue.enqueue_if_busy(post("/c")).is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_if_busy_behind_stalled_entries() {
        let queue = OfflineQueue::new();
        let _a = queue.enqueue(post("/a"));
        assert!(queue.begin_drain());
        let head = queue.next_for_replay().unwrap();
        queue.requeue_front(head);

        assert!(queue.enqueue_if_busy(post("/b")).is_ok());
        assert_eq!(
            endpoints(&queue),
            vec!["https://chat.example/a", "https://chat.example/b"]
        );
    }

    #[tokio::test]
    async fn test_requeue_front_keeps_order() {
        let queue = OfflineQueue::new();
        let _a = queue.enqueue(post("/a"));
        let _b = queue.enqueue(post("/b"));

        assert!(queue.begin_drain());
        let head = queue.next_for_replay().unwrap();
        queue.requeue_front(head);

        assert!(!queue.is_draining());
        assert_eq!(
            endpoints(&queue),
            vec!["https://chat.example/a", "https://chat.example/b"]
        );
    }

    #[tokio::test]
    async fn test_clear_settles_callers() {
        let queue = OfflineQueue::new();
        let a = queue.enqueue(post("/a"));
        let b = queue.enqueue(post("/b"));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(matches!(a.await, Err(Error::QueueCleared)));
        assert!(matches!(b.await, Err(Error::QueueCleared)));
        assert_eq!(queue.clear(), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_oldest() {
        let queue = OfflineQueue::with_max_len(2);
        let a = queue.enqueue(post("/a"));
        let _b = queue.enqueue(post("/b"));
        let _c = queue.enqueue(post("/c"));

        assert!(matches!(a.await, Err(Error::QueueCleared)));
        assert_eq!(
            endpoints(&queue),
            vec!["https://chat.example/b", "https://chat.example/c"]
        );
    }
}
