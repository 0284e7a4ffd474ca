//! Fixed-size buffer pool.
//!
//! The pool hands out [`PooledBuffer`]s of a single size. A buffer is owned
//! by exactly one connection at a time and goes back to the free list when
//! that connection closes. Buffers coming off the free list are zero-filled
//! before they are handed out again, so no connection ever observes another
//! connection's bytes.
//!
//! Using a pool after [`BufferPool::destroy`] is a logic error in the caller;
//! it is reported as [`BufferPoolError::Destroyed`] rather than papered over.

use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::util::lock;

/// How many acquire/release operations pass between two counter log lines.
const LOG_INTERVAL: u64 = 1024;

/// Errors reported by the buffer pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferPoolError {
    /// The pool was destroyed and can no longer be used
    #[error("buffer pool destroyed")]
    Destroyed,

    /// A buffer of a different size was handed back
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever allocated by this pool
    pub allocated: usize,
    /// Buffers currently handed out
    pub in_use: usize,
    /// Buffers sitting on the free list
    pub free: usize,
}

/// A fixed-capacity byte buffer with a fill mark.
///
/// Bytes `[0, len)` are filled with data read from the wire; the rest is
/// spare room for the next read.
pub struct PooledBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl PooledBuffer {
    fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of filled bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when there is no spare room left.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// The filled part of the buffer.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The spare room after the filled part.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` more bytes of the spare room as filled.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare room.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.data.len() - self.len,
            "advance past buffer capacity"
        );
        self.len += n;
    }

    /// Appends as much of `src` as fits, returning the number of bytes copied.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Drops the first `consumed` filled bytes, moving the tail to the front.
    pub fn compact(&mut self, consumed: usize) {
        let consumed = consumed.min(self.len);
        self.data.copy_within(consumed..self.len, 0);
        self.len -= consumed;
    }

    /// Forgets all filled bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn zero(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<PooledBuffer>,
    allocated: usize,
    in_use: usize,
    operations: u64,
    destroyed: bool,
}

impl PoolState {
    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            in_use: self.in_use,
            free: self.free.len(),
        }
    }

    fn tick(&mut self, buffer_size: usize) {
        self.operations += 1;
        if self.operations % LOG_INTERVAL == 0 {
            debug!(
                buffer_size,
                in_use = self.in_use,
                allocated = self.allocated,
                free = self.free.len(),
                "Buffer pool counters"
            );
        }
    }
}

/// A thread-safe pool of equally sized buffers.
///
/// # Example
///
/// ```
/// use netframe::buffer::BufferPool;
///
/// let pool = BufferPool::new(4096);
/// let buf = pool.acquire().unwrap();
/// assert_eq!(buf.capacity(), 4096);
/// pool.release(buf).unwrap();
/// assert_eq!(pool.stats().free, 1);
/// ```
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates an empty pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Size of every buffer this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a zeroed buffer, allocating only when the free list is empty.
    pub fn acquire(&self) -> Result<PooledBuffer, BufferPoolError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(BufferPoolError::Destroyed);
        }

        let buffer = match state.free.pop() {
            Some(mut reused) => {
                reused.zero();
                reused
            }
            None => {
                state.allocated += 1;
                PooledBuffer::zeroed(self.buffer_size)
            }
        };

        state.in_use += 1;
        state.tick(self.buffer_size);
        Ok(buffer)
    }

    /// Puts a buffer back on the free list.
    pub fn release(&self, buffer: PooledBuffer) -> Result<(), BufferPoolError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(BufferPoolError::Destroyed);
        }
        if buffer.capacity() != self.buffer_size {
            return Err(BufferPoolError::SizeMismatch {
                expected: self.buffer_size,
                actual: buffer.capacity(),
            });
        }

        state.in_use = state.in_use.saturating_sub(1);
        state.free.push(buffer);
        state.tick(self.buffer_size);
        Ok(())
    }

    /// Drops every tracked buffer and poisons the pool for further use.
    pub fn destroy(&self) {
        let mut state = lock(&self.state);
        if state.destroyed {
            return;
        }
        debug!(
            in_use = state.in_use,
            allocated = state.allocated,
            "Destroying buffer pool"
        );
        state.free.clear();
        state.destroyed = true;
    }

    /// Returns true once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        lock(&self.state).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_acquire_returns_zeroed_buffer() {
        let pool = BufferPool::new(64);
        let mut buf = assert_ok!(pool.acquire());

        assert_eq!(buf.capacity(), 64);
        assert!(buf.is_empty());
        assert!(buf.spare_mut().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reused_buffer_is_zeroed() {
        let pool = BufferPool::new(16);

        let mut buf = pool.acquire().unwrap();
        buf.fill_from(b"dirty bytes here");
        assert!(buf.is_full());
        pool.release(buf).unwrap();

        let mut again = pool.acquire().unwrap();
        assert_eq!(again.len(), 0);
        assert!(again.spare_mut().iter().all(|&b| b == 0));

        // The free list was hit, not the allocator
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_allocates_only_on_miss() {
        let pool = BufferPool::new(8);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 2,
                in_use: 2,
                free: 0
            }
        );

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        let _c = pool.acquire().unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 2,
                in_use: 1,
                free: 1
            }
        );
    }

    #[test]
    fn test_destroyed_pool_rejects_use() {
        let pool = BufferPool::new(8);
        let buf = pool.acquire().unwrap();

        pool.destroy();
        assert!(pool.is_destroyed());

        assert_eq!(assert_err!(pool.acquire()), BufferPoolError::Destroyed);
        assert_eq!(assert_err!(pool.release(buf)), BufferPoolError::Destroyed);
        assert_eq!(pool.stats().free, 0);
    }

    #[test]
    fn test_release_rejects_foreign_buffer() {
        let small = BufferPool::new(8);
        let large = BufferPool::new(32);

        let buf = large.acquire().unwrap();
        let err = small.release(buf).unwrap_err();
        assert_eq!(
            err,
            BufferPoolError::SizeMismatch {
                expected: 8,
                actual: 32
            }
        );
    }

    #[test]
    fn test_compact_keeps_tail() {
        let pool = BufferPool::new(8);
        let mut buf = pool.acquire().unwrap();

        buf.fill_from(b"abcdef");
        buf.compact(4);
        assert_eq!(buf.filled(), b"ef");

        assert_eq!(buf.fill_from(b"0123456789"), 6);
        assert_eq!(buf.filled(), b"ef012345");
        assert!(buf.is_full());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(BufferPool::new(128));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let buf = pool.acquire().unwrap();
                        pool.release(buf).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, stats.allocated);
        assert!(stats.allocated <= 4);
    }
}
