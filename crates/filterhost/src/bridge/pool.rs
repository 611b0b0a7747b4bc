//! Reusable frame buffers.
//!
//! Each connection on the helper channel carries one request and one reply,
//! and a filter run can make hundreds of calls (progress reports, abort
//! polls). The server takes its read and write buffers from this pool and
//! hands them back when the connection closes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Framed, FramedParts};

use super::codec::FrameCodec;

/// Initial capacity of a freshly allocated buffer.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently parked in the pool.
    pub available: usize,
    /// Total number of acquisitions.
    pub acquisitions: u64,
    /// Acquisitions served from a parked buffer.
    pub reuses: u64,
}

/// A bounded stack of cleared `BytesMut` buffers.
///
/// Buffers that grew past `max_retained_capacity` (a large settings reply, for
/// instance) are dropped on release instead of pinning that memory.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    max_retained_capacity: usize,
    acquisitions: AtomicU64,
    reuses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8, 1024 * 1024)
    }
}

impl BufferPool {
    pub fn new(max_pooled: usize, max_retained_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_retained_capacity,
            acquisitions: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> BytesMut {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let parked = self.free.lock().ok().and_then(|mut free| free.pop());
        match parked {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained_capacity {
            tracing::trace!(capacity = buf.capacity(), "Dropping oversized frame buffer");
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock()
            && free.len() < self.max_pooled
        {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.free.lock().map(|free| free.len()).unwrap_or(0),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
        }
    }

    /// Wrap `io` in a frame transport whose buffers come from this pool.
    pub fn framed<T>(&self, io: T, codec: FrameCodec) -> Framed<T, FrameCodec>
    where
        T: AsyncRead + AsyncWrite,
    {
        let mut parts = FramedParts::new::<Bytes>(io, codec);
        parts.read_buf = self.acquire();
        parts.write_buf = self.acquire();
        Framed::from_parts(parts)
    }

    /// Tear down a transport created by [`BufferPool::framed`], returning its
    /// buffers to the pool. Any unread bytes are discarded.
    pub fn recycle<T>(&self, framed: Framed<T, FrameCodec>) {
        let parts = framed.into_parts();
        self.release(parts.read_buf);
        self.release(parts.write_buf);
    }
}
