//! Fixed-capacity byte queue shared by exactly two parties.
//!
//! The ring is the backpressure mechanism between a producer and a consumer.
//! What happens when a push does not fit is decided once, at construction,
//! by [`OverflowPolicy`]:
//!
//! - [`OverflowPolicy::Block`] parks the producer until the consumer frees
//!   space or `max_wait` elapses. Used for PTY output, where the reader
//!   thread simply stops reading the PTY while parked.
//! - [`OverflowPolicy::ShortWrite`] enqueues what fits and reports the count.
//!   Used for user input, where the caller retries the remainder.
//!
//! Bytes are never dropped or reordered: the concatenation of everything
//! popped is always a prefix of the concatenation of everything accepted.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Block { max_wait: Duration },
    ShortWrite,
}

#[derive(Default)]
struct RingState {
    bytes: VecDeque<u8>,
    closed: bool,
}

struct Shared {
    state: Mutex<RingState>,
    space: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Cloning yields another handle onto the same queue.
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RingState {
                    bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
                    closed: false,
                }),
                space: Condvar::new(),
                capacity,
                policy,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Bytes currently stored.
    pub fn occupied(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Enqueue `data`, returning how many leading bytes were accepted.
    ///
    /// Everything was accepted iff the return value equals `data.len()`.
    /// Under `Block`, the call waits for space up to `max_wait` in total.
    /// A closed ring accepts nothing.
    pub fn push(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let deadline = match self.shared.policy {
            OverflowPolicy::Block { max_wait } => Some(Instant::now() + max_wait),
            OverflowPolicy::ShortWrite => None,
        };

        let mut accepted = 0;
        let mut state = self.lock();
        loop {
            if state.closed {
                return accepted;
            }

            let room = self.shared.capacity - state.bytes.len();
            let take = room.min(data.len() - accepted);
            state.bytes.extend(&data[accepted..accepted + take]);
            accepted += take;

            if accepted == data.len() {
                return accepted;
            }

            let Some(deadline) = deadline else {
                return accepted;
            };
            let now = Instant::now();
            if now >= deadline {
                return accepted;
            }
            state = self
                .shared
                .space
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Dequeue up to `max` bytes from the front.
    pub fn pop(&self, max: usize) -> Vec<u8> {
        let mut state = self.lock();
        let n = max.min(state.bytes.len());
        let out: Vec<u8> = state.bytes.drain(..n).collect();
        drop(state);
        if n > 0 {
            self.shared.space.notify_all();
        }
        out
    }

    /// Copy up to `max` bytes from the front without dequeuing them.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let state = self.lock();
        let n = max.min(state.bytes.len());
        state.bytes.iter().take(n).copied().collect()
    }

    /// Drop `n` bytes from the front, typically after a successful `peek`.
    pub fn discard(&self, n: usize) {
        let mut state = self.lock();
        let n = n.min(state.bytes.len());
        state.bytes.drain(..n);
        drop(state);
        if n > 0 {
            self.shared.space.notify_all();
        }
    }

    /// Dequeue everything, in order.
    pub fn drain_all(&self) -> Vec<u8> {
        let mut state = self.lock();
        let out: Vec<u8> = state.bytes.drain(..).collect();
        drop(state);
        self.shared.space.notify_all();
        out
    }

    /// Stop accepting bytes and wake any parked producer. Stored bytes can
    /// still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed and fully drained: the stream has ended.
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.closed && state.bytes.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
