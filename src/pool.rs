//! Pre-allocated buffer pool for codec stages.
//!
//! The pool carves out a fixed set of equally sized [`FrameBuffer`]s at
//! construction time and hands them out for reuse. When a [`PooledBuffer`]
//! is dropped it returns to the pool; `detach()` severs the link so the
//! buffer can be handed downstream without ever coming back.
//!
//! Pools are rebuilt, not resized: renegotiated stream parameters change
//! buffer size and count, so each codec (re)configuration constructs a
//! fresh pool.

use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Supplies backing memory for pool buffers.
///
/// `None` from a plugin's `allocator()` means "use the framework default",
/// which is plain heap allocation.
pub trait BufferAllocator: Send + Sync {
    /// Allocate one empty buffer with at least `size` bytes of capacity.
    fn allocate(&self, size: usize) -> FrameBuffer;
}

/// Default allocator: heap-backed buffers.
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> FrameBuffer {
        FrameBuffer::with_capacity(size)
    }
}

/// Statistics about pool usage.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total buffers in the pool.
    pub capacity: usize,
    /// Currently available buffers.
    pub available: usize,
    /// Currently checked-out buffers.
    pub in_use: usize,
    /// Total number of acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for a buffer.
    pub waits: u64,
}

/// A bounded set of reusable buffers.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<FrameBuffer>>,
    available_cond: Condvar,
    buffer_size: usize,
    capacity: usize,
    in_use: AtomicUsize,
    acquisitions: AtomicU64,
    waits: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each, using
    /// the framework heap allocator.
    pub fn new(buffer_size: usize, count: usize) -> Arc<Self> {
        Self::with_allocator(buffer_size, count, &HeapAllocator)
    }

    /// Create a pool backed by a plugin-supplied allocator.
    pub fn with_allocator(
        buffer_size: usize,
        count: usize,
        allocator: &dyn BufferAllocator,
    ) -> Arc<Self> {
        let free = (0..count).map(|_| allocator.allocate(buffer_size)).collect();
        Arc::new(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available_cond: Condvar::new(),
                buffer_size,
                capacity: count,
                in_use: AtomicUsize::new(0),
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
            }),
        })
    }

    /// Try to acquire a buffer without blocking.
    ///
    /// Returns `None` when every buffer is checked out; the caller treats
    /// that as "try again later", not as a fatal condition.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let mut free = self.inner.free.lock().unwrap();
        let buf = free.pop()?;
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        Some(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Acquire a buffer, waiting up to `timeout` for one to free up.
    ///
    /// Fails with [`Error::PoolExhausted`] when the wait expires with every
    /// buffer still checked out.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledBuffer> {
        if let Some(buf) = self.try_acquire() {
            return Ok(buf);
        }
        self.inner.waits.fetch_add(1, Ordering::Relaxed);

        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.free.lock().unwrap();
        loop {
            if let Some(buf) = guard.pop() {
                self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
                self.inner.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledBuffer {
                    buf: Some(buf),
                    pool: Arc::clone(&self.inner),
                });
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::PoolExhausted);
            }
            let (g, result) = self
                .inner
                .available_cond
                .wait_timeout(guard, remaining)
                .unwrap();
            guard = g;
            if result.timed_out() && guard.is_empty() {
                return Err(Error::PoolExhausted);
            }
        }
    }

    /// Buffer size each pool entry was allocated with.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Usage counters.
    pub fn stats(&self) -> PoolStats {
        let in_use = self.inner.in_use.load(Ordering::Relaxed);
        PoolStats {
            capacity: self.inner.capacity,
            available: self.available(),
            in_use,
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
        }
    }
}

/// A buffer checked out from a [`BufferPool`].
///
/// Returns to the pool on drop unless detached.
pub struct PooledBuffer {
    buf: Option<FrameBuffer>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Access the underlying buffer.
    pub fn buffer(&self) -> &FrameBuffer {
        self.buf.as_ref().expect("pooled buffer already detached")
    }

    /// Access the underlying buffer mutably.
    pub fn buffer_mut(&mut self) -> &mut FrameBuffer {
        self.buf.as_mut().expect("pooled buffer already detached")
    }

    /// Detach the buffer from the pool.
    ///
    /// The buffer will not return on drop; use this when handing it to a
    /// downstream stage that takes ownership.
    pub fn detach(mut self) -> FrameBuffer {
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        self.buf.take().expect("pooled buffer already detached")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.reset();
            let mut free = self.pool.free.lock().unwrap();
            free.push(buf);
            self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
            self.pool.available_cond.notify_one();
        }
    }
}
