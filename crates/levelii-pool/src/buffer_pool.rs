//! Buffer pool for large, short-lived archive allocations.
//!
//! Archive downloads and their decompressed forms run to hundreds of
//! megabytes; allocating them per fetch churns the allocator and risks
//! fragmentation on long-running ingest nodes. The pool pre-reserves a
//! fixed set of buffers and hands them out as RAII guards.
//!
//! # Memory flow
//!
//! ```text
//! 1. BufferPool reserves `count` buffers of `capacity` bytes
//! 2. acquire() suspends until a buffer is free, returns PooledBuffer
//! 3. The caller clears/fills it (contents are NOT cleared on release)
//! 4. Dropping the guard pushes the buffer back and wakes one waiter
//! ```
//!
//! Replacing the pool during reconfiguration is safe: guards hold an
//! `Arc` to the pool internals, so an old pool stays valid until its
//! last outstanding guard drops, and a drop after the pool handle is
//! gone is a no-op beyond releasing memory.

use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

struct PoolInner {
    free: SegQueue<Vec<u8>>,
    semaphore: Semaphore,
    buffer_capacity: usize,
    count: usize,
    available: AtomicUsize,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
}

/// Pool of pre-reserved byte buffers.
///
/// Cloning is cheap; clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Reserve `count` buffers of `capacity` bytes each.
    ///
    /// Buffers are reserved, not zero-filled; a fresh buffer has length
    /// zero and `capacity` bytes of spare room.
    ///
    /// # Panics
    ///
    /// Panics if `count` or `capacity` is zero.
    #[must_use]
    pub fn new(count: usize, capacity: usize) -> Self {
        assert!(count > 0, "buffer count must be > 0");
        assert!(capacity > 0, "buffer capacity must be > 0");

        let free = SegQueue::new();
        for _ in 0..count {
            free.push(Vec::with_capacity(capacity));
        }

        info!(
            count,
            capacity_mb = capacity as f64 / (1024.0 * 1024.0),
            total_mb = (count * capacity) as f64 / (1024.0 * 1024.0),
            "buffer pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                free,
                semaphore: Semaphore::new(count),
                buffer_capacity: capacity,
                count,
                available: AtomicUsize::new(count),
                total_acquires: AtomicU64::new(0),
                total_releases: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a buffer, suspending until one is free.
    pub async fn acquire(&self) -> PooledBuffer {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .expect("pool semaphore is never closed");
        let buffer = self
            .inner
            .free
            .pop()
            .expect("permit held; a buffer must be free");

        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);

        // The permit is restored manually when the guard drops.
        std::mem::forget(permit);

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Acquire without waiting; `None` signals backpressure.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let permit = self.inner.semaphore.try_acquire().ok()?;
        let buffer = self.inner.free.pop()?;

        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        std::mem::forget(permit);

        Some(PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Total buffers owned by the pool.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.count
    }

    /// Reserved capacity of each buffer.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Lifetime acquire count.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Lifetime release count.
    #[must_use]
    pub fn total_releases(&self) -> u64 {
        self.inner.total_releases.load(Ordering::Relaxed)
    }
}

/// RAII guard for a pooled buffer.
///
/// Dereferences to the underlying `Vec<u8>`. The buffer returns to the
/// pool when the guard drops, on every exit path; ownership transfers
/// on move and the guard cannot be cloned. Contents are left as-is on
/// release, so callers that need a clean buffer call `clear()` after
/// acquiring.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buffer.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.free.push(buffer);
            self.pool.available.fetch_add(1, Ordering::Relaxed);
            self.pool.total_releases.fetch_add(1, Ordering::Relaxed);
            self.pool.semaphore.add_permits(1);
        }
    }
}
