//! A growable byte FIFO with asynchronous dequeue.
//!
//! One producer feeds bytes in with [`ByteRing::enqueue`]; one consumer
//! takes framed chunks out with [`ByteRing::dequeue_exact`], suspending
//! until enough bytes have arrived. Dropping a suspended dequeue leaves the
//! buffer untouched, so the wait can safely race a shutdown signal.

use std::pin::pin;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Capacity floor below which the ring never auto-shrinks.
pub const DEFAULT_AUTO_TRIM_MIN_CAPACITY: usize = 1024;

#[derive(Debug)]
struct RingState {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy the oldest `dst.len()` bytes out without removing them.
    fn copy_out(&self, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        let total = dst.len();
        let first = total.min(self.capacity() - self.head);
        dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        dst[first..].copy_from_slice(&self.buf[..total - first]);
    }

    fn pop_into(&mut self, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        self.copy_out(dst);
        self.head = (self.head + dst.len()) % self.capacity();
        self.len -= dst.len();
    }

    /// Move the live bytes into a fresh linear buffer of `new_capacity`.
    fn relayout(&mut self, new_capacity: usize) {
        let mut linear = vec![0u8; new_capacity];
        self.copy_out_into_prefix(&mut linear);
        self.buf = linear;
        self.head = 0;
    }

    fn copy_out_into_prefix(&self, dst: &mut [u8]) {
        let len = self.len;
        if len > 0 {
            let first = len.min(self.capacity() - self.head);
            dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
            dst[first..len].copy_from_slice(&self.buf[..len - first]);
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let needed = self.len + bytes.len();
        if needed > self.capacity() {
            self.relayout((self.capacity() * 2).max(needed));
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = bytes.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.len += bytes.len();
    }
}

#[derive(Debug)]
pub struct ByteRing {
    state: Mutex<RingState>,
    readable: Notify,
    auto_trim_min_capacity: usize,
}

impl ByteRing {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; initial_capacity],
                head: 0,
                len: 0,
            }),
            readable: Notify::new(),
            auto_trim_min_capacity: DEFAULT_AUTO_TRIM_MIN_CAPACITY,
        }
    }

    pub fn with_auto_trim_min_capacity(mut self, capacity: usize) -> Self {
        self.auto_trim_min_capacity = capacity.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().expect("byte ring lock poisoned")
    }

    /// Append bytes; never blocks. Capacity doubles (or grows to fit)
    /// when full, preserving FIFO order across the wrap-around.
    pub fn enqueue(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.lock().push(bytes);
        self.readable.notify_waiters();
    }

    /// Up to `max` of the oldest bytes, without removing them.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let state = self.lock();
        let mut out = vec![0u8; max.min(state.len)];
        state.copy_out(&mut out);
        out
    }

    /// Suspend until at least `count` bytes are buffered.
    pub async fn wait_for(&self, count: usize) {
        let mut notified = pin!(self.readable.notified());
        loop {
            notified.as_mut().enable();
            if self.lock().len >= count {
                return;
            }
            notified.as_mut().await;
            notified.set(self.readable.notified());
        }
    }

    /// Remove exactly `dst.len()` bytes, suspending until they are all
    /// buffered. Cancellation-safe: nothing is removed until the whole
    /// request can be satisfied in one atomic step.
    pub async fn dequeue_exact(&self, dst: &mut [u8]) {
        let mut notified = pin!(self.readable.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.len >= dst.len() {
                    state.pop_into(dst);
                    self.maybe_trim(&mut state, dst.len());
                    return;
                }
            }
            notified.as_mut().await;
            notified.set(self.readable.notified());
        }
    }

    /// Shrink a mostly idle ring after a dequeue: when the removed chunk
    /// fits in half the capacity and the ring is above its floor, drop
    /// back to the largest of chunk size, floor and what is still queued.
    fn maybe_trim(&self, state: &mut RingState, dequeued: usize) {
        let capacity = state.capacity();
        if capacity > self.auto_trim_min_capacity && dequeued <= capacity / 2 {
            let target = dequeued.max(self.auto_trim_min_capacity).max(state.len);
            if target < capacity {
                state.relayout(target);
            }
        }
    }
}
