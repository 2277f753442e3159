//! Frame queue bridging the driver's delivery thread to the consumer

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use crate::capture::Frame;
use crate::error::PollError;

/// Bounded FIFO between the delivery context and the consumer.
///
/// Frames are pushed by the driver's own thread of control once per
/// completed image and popped by the consumer at its own pace. When the
/// queue is full the oldest frame is evicted to admit the new one: the
/// camera cannot be paused, so staleness is traded for bounded memory.
/// Eviction is silent; it only shows up in the counters.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    /// Maximum queued frames; zero means unbounded.
    capacity: usize,
    stats: CachePadded<Stats>,
}

struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Cumulative queue counters since construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    // A panicking pusher must not brick poll() or teardown.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivery context: append a frame, evicting the oldest one first if
    /// the queue is at capacity. Rejected once the queue is closed.
    ///
    /// Holds the lock only long enough to update the deque; nothing here
    /// may stall frame delivery.
    pub fn push(&self, frame: Frame) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            if self.capacity > 0 && inner.frames.len() == self.capacity {
                inner.frames.pop_front();
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camera_frames_dropped").increment(1);
            }
            inner.frames.push_back(frame);
        }
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_frames_delivered").increment(1);
        self.available.notify_one();
        true
    }

    /// Consumer: remove and return the oldest frame, waiting up to
    /// `timeout` for one to arrive (indefinitely when `None`).
    ///
    /// Returns `TimedOut` on expiry and `StreamClosed` if the queue is
    /// closed while waiting. Frames already queued at close time are still
    /// handed out.
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Result<Frame, PollError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
            if inner.closed {
                return Err(PollError::StreamClosed);
            }
            inner = match deadline {
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PollError::TimedOut);
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Non-blocking variant of `pop_blocking`, same ordering.
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.lock().frames.pop_front()?;
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Reject all further pushes and wake every blocked consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame {
            data: Bytes::from(vec![tag; 8]),
            width: 4,
            height: 2,
            depth: 12,
            timestamp: tag as u64,
        }
    }

    #[test]
    fn bounded_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        for tag in [1, 2, 3] {
            assert!(queue.push(frame(tag)));
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().timestamp, 2);
        assert_eq!(queue.try_pop().unwrap().timestamp, 3);
        assert!(queue.try_pop().is_none());

        let stats = queue.stats();
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.popped, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn bounded_queue_retains_most_recent() {
        let queue = FrameQueue::new(3);
        for tag in 0..10 {
            queue.push(frame(tag));
        }

        assert_eq!(queue.len(), 3);
        for expected in [7, 8, 9] {
            assert_eq!(queue.try_pop().unwrap().timestamp, expected);
        }
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let queue = FrameQueue::new(0);
        for tag in 0..100 {
            queue.push(frame(tag));
        }

        assert_eq!(queue.len(), 100);
        assert_eq!(queue.stats().dropped, 0);
    }

    #[test]
    fn pops_preserve_push_order() {
        let queue = FrameQueue::new(0);
        for tag in 0..5 {
            queue.push(frame(tag));
        }

        for expected in 0..5 {
            let popped = queue.pop_blocking(Some(Duration::ZERO)).unwrap();
            assert_eq!(popped.timestamp, expected);
        }
    }

    #[test]
    fn empty_pop_times_out() {
        let queue = FrameQueue::new(2);
        assert_eq!(
            queue.pop_blocking(Some(Duration::ZERO)),
            Err(PollError::TimedOut)
        );
        assert_eq!(
            queue.pop_blocking(Some(Duration::from_millis(10))),
            Err(PollError::TimedOut)
        );
    }

    #[test]
    fn blocked_pop_sees_concurrent_push() {
        let queue = Arc::new(FrameQueue::new(2));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(frame(7));

        let frame = consumer.join().unwrap().unwrap();
        assert_eq!(frame.timestamp, 7);
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let queue = Arc::new(FrameQueue::new(2));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking(None))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(consumer.join().unwrap(), Err(PollError::StreamClosed));
    }

    #[test]
    fn push_after_close_is_rejected() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.close();

        assert!(!queue.push(frame(2)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().pushed, 1);
    }

    #[test]
    fn queued_frames_survive_close() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.close();

        assert_eq!(queue.pop_blocking(None).unwrap().timestamp, 1);
        assert_eq!(queue.pop_blocking(None), Err(PollError::StreamClosed));
    }
}
