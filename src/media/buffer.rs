//! # Audio Buffer Management
//!
//! Each connection owns two bounded chunk queues with the same capacity and
//! opposite overflow policies:
//!
//! - [`OutboundAudio`] (application → network) **evicts the oldest** queued
//!   chunk when full. Audio played to a caller is live speech, so the newest
//!   synthesized audio wins and the queue behaves as a sliding window over the
//!   most recent `capacity` chunks.
//! - [`InboundAudio`] (network → application) **drops the newest** chunk when
//!   full. The application drains caller audio at its own pace (e.g. into a
//!   speech recognizer) and must never see already-buffered audio evicted or
//!   reordered underneath it.
//!
//! Neither blocks on write. Both report end-of-stream to readers once closed
//! and drained, and `close()` wakes every reader blocked on an empty queue.
//!
//! ## Rust Concepts Used:
//! - **`parking_lot::Mutex`**: short critical sections, no lock poisoning
//! - **`tokio::sync::Notify`**: async wakeups without holding the lock
//! - **Atomics**: drop/evict counters readable without locking

use crate::media::error::{StreamError, StreamResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Default number of chunks each direction can hold.
pub const DEFAULT_CAPACITY: usize = 100;

/// Outcome of offering a chunk to the inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// The queue was full and the offered chunk was discarded.
    Dropped,
    /// The queue is closed; the chunk was discarded.
    Closed,
}

/// FIFO storage plus the wakeup used by readers.
struct ChunkQueue {
    inner: Mutex<QueueState>,
    readable: Notify,
    capacity: usize,
}

struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

impl ChunkQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueState {
                chunks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Notify::new(),
            capacity,
        }
    }

    async fn read(&self) -> Option<Vec<u8>> {
        loop {
            // Register interest before checking: a push stores a permit and
            // close() wakes every future created before it.
            let notified = self.readable.notified();
            {
                let mut state = self.inner.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn try_read(&self) -> Option<Vec<u8>> {
        self.inner.lock().chunks.pop_front()
    }

    /// Returns false if this call did not change anything.
    fn close(&self) -> bool {
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);
        self.readable.notify_waiters();
        true
    }

    fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Network → application queue. Overflow policy: drop the newest chunk.
pub struct InboundAudio {
    queue: ChunkQueue,
    dropped: AtomicU64,
}

impl InboundAudio {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ChunkQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a chunk received from the network. Never blocks.
    ///
    /// When the queue already holds `capacity` chunks the offered chunk is
    /// discarded and everything buffered so far is left untouched.
    pub fn push(&self, chunk: Vec<u8>) -> Admission {
        let mut state = self.queue.inner.lock();
        if state.closed {
            return Admission::Closed;
        }
        if state.chunks.len() >= self.queue.capacity {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Admission::Dropped;
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.queue.readable.notify_one();
        Admission::Queued
    }

    /// Wait for the next chunk; `None` once closed and drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.queue.read().await
    }

    pub fn try_read(&self) -> Option<Vec<u8>> {
        self.queue.try_read()
    }

    pub fn close(&self) -> bool {
        self.queue.close()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of chunks discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Application → network queue. Overflow policy: evict the oldest chunk.
pub struct OutboundAudio {
    queue: ChunkQueue,
    evicted: AtomicU64,
}

impl OutboundAudio {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ChunkQueue::new(capacity),
            evicted: AtomicU64::new(0),
        }
    }

    /// Queue a chunk for the caller. Never blocks.
    ///
    /// A full queue first gives up its single oldest chunk to make room, so
    /// the queue always holds the newest `capacity` chunks. Fails with
    /// [`StreamError::Closed`] after `close()`.
    pub fn write(&self, chunk: Vec<u8>) -> StreamResult<()> {
        let mut state = self.queue.inner.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        if state.chunks.len() >= self.queue.capacity {
            state.chunks.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.queue.readable.notify_one();
        Ok(())
    }

    /// Wait for the next chunk to send; `None` once closed and drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.queue.read().await
    }

    pub fn try_read(&self) -> Option<Vec<u8>> {
        self.queue.try_read()
    }

    /// Discard everything queued but not yet sent (used by `clear`).
    pub fn discard_pending(&self) -> usize {
        let mut state = self.queue.inner.lock();
        let discarded = state.chunks.len();
        state.chunks.clear();
        discarded
    }

    pub fn close(&self) -> bool {
        self.queue.close()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of chunks evicted to make room for newer audio.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn drain_outbound(buffer: &OutboundAudio) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| buffer.try_read()).collect()
    }

    fn drain_inbound(buffer: &InboundAudio) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| buffer.try_read()).collect()
    }

    #[test]
    fn test_outbound_overflow_evicts_oldest() {
        let capacity = 4;
        let buffer = OutboundAudio::new(capacity);
        for i in 1..=(capacity as u8 + 1) {
            buffer.write(vec![i]).unwrap();
        }

        assert_eq!(buffer.len(), capacity);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(drain_outbound(&buffer), vec![vec![2], vec![3], vec![4], vec![5]]);
    }

    #[test]
    fn test_inbound_overflow_drops_newest() {
        let capacity = 4;
        let buffer = InboundAudio::new(capacity);
        for i in 1..=capacity as u8 {
            assert_eq!(buffer.push(vec![i]), Admission::Queued);
        }
        assert_eq!(buffer.push(vec![5]), Admission::Dropped);

        assert_eq!(buffer.dropped(), 1);
        assert_eq!(drain_inbound(&buffer), vec![vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_outbound_write_after_close_fails() {
        let buffer = OutboundAudio::new(2);
        assert!(buffer.close());
        assert!(!buffer.close());
        assert!(matches!(buffer.write(vec![1]), Err(StreamError::Closed)));
    }

    #[test]
    fn test_inbound_push_after_close_is_discarded() {
        let buffer = InboundAudio::new(2);
        buffer.close();
        assert_eq!(buffer.push(vec![1]), Admission::Closed);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_drains_then_reports_end_of_stream() {
        let buffer = InboundAudio::new(4);
        buffer.push(vec![1]);
        buffer.push(vec![2]);
        buffer.close();

        assert_eq!(buffer.read().await, Some(vec![1]));
        assert_eq!(buffer.read().await, Some(vec![2]));
        assert_eq!(buffer.read().await, None);
        assert_eq!(buffer.read().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_every_blocked_reader() {
        let buffer = Arc::new(InboundAudio::new(4));
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let buffer = buffer.clone();
                tokio::spawn(async move { buffer.read().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        for reader in readers {
            let chunk = tokio::time::timeout(Duration::from_secs(1), reader)
                .await
                .expect("reader stayed blocked after close")
                .unwrap();
            assert_eq!(chunk, None);
        }
    }

    #[tokio::test]
    async fn test_blocked_read_is_woken_by_close() {
        let buffer = Arc::new(OutboundAudio::new(4));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should be woken by close")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_blocked_read_receives_later_write() {
        let buffer = Arc::new(OutboundAudio::new(4));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.write(vec![9, 9]).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result, Some(vec![9, 9]));
    }

    #[test]
    fn test_discard_pending() {
        let buffer = OutboundAudio::new(4);
        buffer.write(vec![1]).unwrap();
        buffer.write(vec![2]).unwrap();
        assert_eq!(buffer.discard_pending(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.is_closed());
    }
}
