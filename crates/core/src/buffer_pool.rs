//! Fixed-size byte-buffer recycling for the hot RTP read/write paths (§2).

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Typical MTU-sized packet.
pub const SMALL_BUFFER_SIZE: usize = 1500;
/// Largest RTP packet the stack will hand us (jumbo frames, fragmented NALs).
pub const LARGE_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Small,
    Large,
}

/// Two free lists, one per size class. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    small: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                small: Mutex::new(Vec::new()),
                large: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Borrow a buffer with at least `min_size` bytes of capacity. The buffer
    /// is returned to the pool on drop. Callers must not retain slices or
    /// copies of the buffer's contents past the `PooledBuffer`'s lifetime.
    pub fn acquire(&self, min_size: usize) -> PooledBuffer {
        let class = if min_size <= SMALL_BUFFER_SIZE {
            SizeClass::Small
        } else {
            SizeClass::Large
        };
        let cap = match class {
            SizeClass::Small => SMALL_BUFFER_SIZE,
            SizeClass::Large => LARGE_BUFFER_SIZE,
        };
        let free_list = match class {
            SizeClass::Small => &self.inner.small,
            SizeClass::Large => &self.inner.large,
        };
        let mut buf = free_list
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(cap));
        buf.clear();
        PooledBuffer {
            buf: Some(buf),
            class,
            pool: self.inner.clone(),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned to its size class's free
/// list on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    class: SizeClass,
    pool: Arc<Inner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let free_list = match self.class {
                SizeClass::Small => &self.pool.small,
                SizeClass::Large => &self.pool.large,
            };
            free_list.lock().expect("buffer pool mutex poisoned").push(buf);
        }
    }
}
