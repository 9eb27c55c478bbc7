//! Bounded blocking queue with an activation flag.
//!
//! The queue decouples producer and consumer stages and is the only data
//! hand-off point between them:
//!
//! - `pop` blocks (optionally with a timeout) until an item arrives
//! - `push` blocks when the queue is full (backpressure)
//! - `set_active(false, ..)` unblocks every waiter immediately, which is how
//!   flush and teardown interrupt a worker parked inside a pop

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A bounded, thread-safe FIFO shared between pipeline stages.
///
/// Cloning is cheap and shares the underlying queue.
pub struct BlockingQueue<T> {
    name: String,
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    active: bool,
    total_pushed: u64,
    total_popped: u64,
}

/// Counters describing queue activity.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Items currently held.
    pub current: usize,
    /// Total items accepted by `push`.
    pub total_pushed: u64,
    /// Total items handed out by `pop`.
    pub total_popped: u64,
}

impl<T> BlockingQueue<T> {
    /// Create an active queue holding at most `capacity` items.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    capacity,
                    active: true,
                    total_pushed: 0,
                    total_popped: 0,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// The queue's debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current number of items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    /// True if no items are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the queue accepts and delivers items.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    /// Activity counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().unwrap();
        QueueStats {
            current: state.items.len(),
            total_pushed: state.total_pushed,
            total_popped: state.total_popped,
        }
    }

    /// Activate or deactivate the queue.
    ///
    /// Deactivation wakes every blocked `push`/`pop` (they return
    /// [`Error::Inactive`] / `None`) and, when `clear` is set, discards all
    /// held items.
    pub fn set_active(&self, active: bool, clear: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.active = active;
        if clear {
            state.items.clear();
        }
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    /// Discard all held items without changing the activation flag.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.items.clear();
        self.inner.not_full.notify_all();
    }

    /// Push an item, blocking while the queue is full.
    ///
    /// Fails with [`Error::Inactive`] if the queue is (or becomes)
    /// deactivated.
    pub fn push(&self, item: T) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        while state.active && state.items.len() >= state.capacity {
            state = self.inner.not_full.wait(state).unwrap();
        }
        if !state.active {
            return Err(Error::Inactive);
        }
        state.items.push_back(item);
        state.total_pushed += 1;
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Push without blocking.
    ///
    /// Returns [`Error::Again`] when full, [`Error::Inactive`] when
    /// deactivated.
    pub fn try_push(&self, item: T) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.active {
            return Err(Error::Inactive);
        }
        if state.items.len() >= state.capacity {
            return Err(Error::Again);
        }
        state.items.push_back(item);
        state.total_pushed += 1;
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Pop an item, blocking until one is available.
    ///
    /// Returns `None` when the queue is deactivated while empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        while state.active && state.items.is_empty() {
            state = self.inner.not_empty.wait(state).unwrap();
        }
        self.take_front(&mut state)
    }

    /// Pop with a timeout.
    ///
    /// Returns `None` on timeout or deactivation. A short timeout keeps
    /// worker loops responsive to stop/flush issued from another thread.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while state.active && state.items.is_empty() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (s, result) = self.inner.not_empty.wait_timeout(state, remaining).unwrap();
            state = s;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
        self.take_front(&mut state)
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        self.take_front(&mut state)
    }

    fn take_front(&self, state: &mut QueueState<T>) -> Option<T> {
        let item = state.items.pop_front()?;
        state.total_popped += 1;
        self.inner.not_full.notify_one();
        Some(item)
    }
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("active", &self.is_active())
            .finish()
    }
}
