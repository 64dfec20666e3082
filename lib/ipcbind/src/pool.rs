//! Pooled packet-buffer allocator. Buffers are recycled through the pool on
//! drop and are handed out without zeroing; the receive path overwrites the
//! full length before a buffer is exposed to decoding.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

const MAX_RETAINED: usize = 64;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
}

/// Shared pool of byte buffers used for inbound packets.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

/// A byte buffer leased from a `BufferPool`, or detached from any pool.
/// Returns its storage to the pool on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Weak<PoolShared>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Leases a buffer of exactly `len` bytes. The contents are
    /// uninitialized; callers must write the full length before reading.
    pub fn alloc(&self, len: usize) -> PooledBuf {
        let mut data = {
            let mut free = self.shared.free.lock().expect("buffer pool poisoned");
            free.pop().unwrap_or_else(Vec::new)
        };

        data.clear();
        data.reserve(len);

        // Invariant: every byte below `len` is overwritten by the reader
        // before the buffer leaves the transport layer.
        unsafe { data.set_len(len) };

        PooledBuf {
            data,
            pool: Arc::downgrade(&self.shared),
        }
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

impl PooledBuf {
    /// Wraps an already materialized buffer that will not be recycled.
    /// Used on the send side where packets are built in place.
    #[inline]
    pub fn detached(data: Vec<u8>) -> PooledBuf {
        PooledBuf {
            data,
            pool: Weak::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.upgrade() {
            let mut free = shared.free.lock().expect("buffer pool poisoned");

            if free.len() < MAX_RETAINED {
                let mut data = mem::replace(&mut self.data, Vec::new());
                data.clear();
                free.push(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_len() {
        let pool = BufferPool::new();
        let buf = pool.alloc(128);

        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn test_reclaim_and_reuse() {
        let pool = BufferPool::new();

        let mut buf = pool.alloc(64);
        buf[0] = 42;
        drop(buf);

        assert_eq!(pool.retained(), 1);

        let buf = pool.alloc(32);
        assert_eq!(buf.len(), 32);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_detached_is_not_reclaimed() {
        let pool = BufferPool::new();

        let buf = PooledBuf::detached(vec![1, 2, 3]);
        assert_eq!(&buf[..], &[1, 2, 3]);
        drop(buf);

        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let pool = BufferPool::new();

        let mut buf = pool.alloc(4);
        buf.copy_from_slice(&[9, 8, 7, 6]);

        assert_eq!(&buf[..], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_pool_survives_buffer() {
        let pool = BufferPool::new();
        let buf = pool.alloc(8);

        drop(pool);

        // Pool gone; the lease simply drops its storage.
        drop(buf);
    }
}
