use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_BUFFER_CAPACITY: usize = 128;

/// Pool of reusable key buffers.
///
/// Buffers are loaned out as [`PooledBuffer`]s and go back to the pool when
/// the loan is dropped. At most `max_size` idle buffers are retained; extra
/// returns are simply freed.
#[derive(Clone)]
pub struct ByteBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    max_size: usize,
    on_loan: AtomicUsize,
}

impl ByteBufferPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_size)),
                max_size,
                on_loan: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow an empty buffer.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .inner
            .idle()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY));
        self.inner.on_loan.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.idle().len()
    }

    /// Buffers currently loaned out.
    pub fn on_loan(&self) -> usize {
        self.inner.on_loan.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    // The idle list stays valid if a holder panicked.
    fn idle(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ByteBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBufferPool")
            .field("max_size", &self.inner.max_size)
            .field("on_loan", &self.on_loan())
            .finish()
    }
}

/// A buffer on loan from a [`ByteBufferPool`].
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Replace the contents with `bytes`.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        let buf = &mut **self;
        buf.clear();
        buf.extend_from_slice(bytes);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        // Only `drop` takes the buffer.
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer used after release"),
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer used after release"),
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.on_loan.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut buffer) = self.buffer.take() {
            buffer.clear();
            let mut idle = self.pool.idle();
            if idle.len() < self.pool.max_size {
                idle.push(buffer);
            }
        }
    }
}
