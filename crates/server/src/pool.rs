//! Reusable buffer pool
//!
//! WebSocket payloads arrive in arbitrarily sized fragments. Renting
//! buffers from a shared pool and growing by doubling keeps allocation
//! churn at O(log n) per message with peak overhead bounded at 2x.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// Capacity handed out when no minimum is requested (4 KiB)
pub const DEFAULT_BUF_CAPACITY: usize = 4096;

/// Buffers above this capacity are dropped on release instead of retained
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// Free-list entries kept per buffer kind
const MAX_RETAINED_BUFFERS: usize = 64;

/// Global pool instance
static GLOBAL: LazyLock<Arc<BufferPool>> = LazyLock::new(BufferPool::new);

/// Thread-safe pool of reusable byte and text buffers
///
/// Rented buffers are returned automatically when the [`PooledBuf`] /
/// [`PooledText`] handle is dropped, so every exit path releases.
pub struct BufferPool {
    bytes: Mutex<Vec<Vec<u8>>>,
    texts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
}

impl BufferPool {
    /// Create a standalone pool (tests rent from their own instance)
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
            texts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// The process-wide pool
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    /// Rent a byte buffer with at least `min_capacity` bytes.
    ///
    /// Capacities are rounded up to a power of two; `min_capacity == 0`
    /// yields the 4 KiB default.
    pub fn rent(self: &Arc<Self>, min_capacity: usize) -> PooledBuf {
        let capacity = rounded_capacity(min_capacity);

        let data = {
            let mut free = self.bytes.lock();
            match free.iter().position(|buf| buf.len() >= capacity) {
                Some(at) => free.swap_remove(at),
                None => vec![0u8; capacity],
            }
        };

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data,
            pool: self.clone(),
        }
    }

    /// Rent an empty text buffer with at least `min_capacity` bytes
    pub fn rent_text(self: &Arc<Self>, min_capacity: usize) -> PooledText {
        let capacity = rounded_capacity(min_capacity);

        let text = {
            let mut free = self.texts.lock();
            match free.iter().position(|text| text.capacity() >= capacity) {
                Some(at) => free.swap_remove(at),
                None => String::with_capacity(capacity),
            }
        };

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        PooledText {
            text,
            pool: self.clone(),
        }
    }

    /// Double `buf`, preserving its first `used` bytes.
    ///
    /// Returns `buf` unchanged when its capacity already covers
    /// `used * 2`; otherwise the old buffer goes back to the pool and a
    /// larger one comes out.
    pub fn grow(self: &Arc<Self>, buf: PooledBuf, used: usize) -> PooledBuf {
        if buf.capacity() >= used.saturating_mul(2) {
            return buf;
        }

        let target = buf.capacity().max(used).saturating_mul(2);
        let mut grown = self.rent(target);
        grown[..used].copy_from_slice(&buf[..used]);
        grown
    }

    /// Number of buffers currently rented out
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn release_bytes(&self, data: Vec<u8>) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if data.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut free = self.bytes.lock();
        if free.len() < MAX_RETAINED_BUFFERS {
            free.push(data);
        }
    }

    fn release_text(&self, mut text: String) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if text.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        text.clear();
        let mut free = self.texts.lock();
        if free.len() < MAX_RETAINED_BUFFERS {
            free.push(text);
        }
    }
}

fn rounded_capacity(min_capacity: usize) -> usize {
    min_capacity
        .next_power_of_two()
        .max(DEFAULT_BUF_CAPACITY)
}

/// A byte buffer rented from a [`BufferPool`]
///
/// Dereferences to its full capacity; callers track how much of it they
/// have filled. Returned to the pool on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release_bytes(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A text buffer rented from a [`BufferPool`]
///
/// Dereferences to the decoded text. Returned to the pool on drop.
pub struct PooledText {
    text: String,
    pool: Arc<BufferPool>,
}

impl PooledText {
    pub(crate) fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
    }

    pub fn capacity(&self) -> usize {
        self.text.capacity()
    }
}

impl Deref for PooledText {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl Drop for PooledText {
    fn drop(&mut self) {
        self.pool.release_text(std::mem::take(&mut self.text));
    }
}

impl std::fmt::Debug for PooledText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledText").field("text", &self.text).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        let pool = BufferPool::new();
        let buf = pool.rent(0);
        assert_eq!(buf.capacity(), DEFAULT_BUF_CAPACITY);
    }

    #[test]
    fn test_power_of_two_rounding() {
        let pool = BufferPool::new();
        assert_eq!(pool.rent(5000).capacity(), 8192);
        assert_eq!(pool.rent(8192).capacity(), 8192);
        assert_eq!(pool.rent(100_000).capacity(), 131_072);
    }

    #[test]
    fn test_every_rent_is_released() {
        let pool = BufferPool::new();
        assert_eq!(pool.in_flight(), 0);

        let a = pool.rent(0);
        let b = pool.rent(10_000);
        let t = pool.rent_text(0);
        assert_eq!(pool.in_flight(), 3);

        drop(a);
        assert_eq!(pool.in_flight(), 2);
        drop(t);
        drop(b);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = BufferPool::new();
        drop(pool.rent(50_000));

        // The recycled buffer is larger than a fresh minimum would be
        let buf = pool.rent(0);
        assert_eq!(buf.capacity(), 65_536);
    }

    #[test]
    fn test_grow_doubles_and_preserves_prefix() {
        let pool = BufferPool::new();
        let mut buf = pool.rent(0);
        buf[..4].copy_from_slice(b"abcd");

        let grown = pool.grow(buf, DEFAULT_BUF_CAPACITY);
        assert!(grown.capacity() >= DEFAULT_BUF_CAPACITY * 2);
        assert_eq!(&grown[..4], b"abcd");
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_grow_is_noop_when_half_empty() {
        let pool = BufferPool::new();
        let buf = pool.rent(8192);
        let same = pool.grow(buf, 1000);
        assert_eq!(same.capacity(), 8192);
    }

    #[test]
    fn test_text_buffer_starts_empty_after_reuse() {
        let pool = BufferPool::new();
        let mut text = pool.rent_text(0);
        text.push_str("hello");
        drop(text);

        let text = pool.rent_text(0);
        assert!(text.is_empty());
        assert!(text.capacity() >= DEFAULT_BUF_CAPACITY);
    }
}
