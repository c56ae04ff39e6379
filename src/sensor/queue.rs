//! queue.rs
//! Bounded hand-off between the reader thread and the broadcast loop.
//!
//! Policy is drop-oldest: when full, the oldest sample is evicted to admit the
//! newest. This is live telemetry, so recency wins over completeness and the
//! producer never blocks on a slow consumer.

use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::sensor::packet::Sample;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub struct SampleQueue {
    queue: ArrayQueue<Sample>,
    // Only used to park the consumer; the queue itself is lock-free.
    gate: Mutex<()>,
    ready: Condvar,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            gate: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Non-blocking push. Returns `true` when an older sample was evicted.
    pub fn push(&self, sample: Sample) -> bool {
        let evicted = self.queue.force_push(sample).is_some();
        let _gate = self.gate.lock();
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<Sample> {
        self.queue.pop()
    }

    /// Blocks for at most `timeout` waiting for the next sample.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Sample> {
        if let Some(sample) = self.queue.pop() {
            return Some(sample);
        }
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        loop {
            // Re-checked under the gate so a push between pop and wait is not missed.
            if let Some(sample) = self.queue.pop() {
                return Some(sample);
            }
            if self.ready.wait_until(&mut gate, deadline).timed_out() {
                return self.queue.pop();
            }
        }
    }

    /// Discards everything pending; returns how many samples were dropped.
    pub fn flush(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
