//! Pool-backed growable byte buffer.
//!
//! `ArrayBuffer` keeps one contiguous allocation with an active region
//! `[active_start, active_end)` followed by writable tail space. Storage is
//! rented lazily from a shared `BufferPool` and handed back once drained.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use crate::error::Error;

/// Largest allocation an `ArrayBuffer` will request.
pub const MAX_CAPACITY: usize = i32::MAX as usize;

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Bounded free list of byte buffers shared between streams.
pub struct BufferPool {
    free: spin::Mutex<Vec<Vec<u8>>>,
    retain: usize,
    max_pooled_size: usize,
}

impl BufferPool {
    /// Keep at most `retain` buffers, each no larger than `max_pooled_size`.
    pub const fn new(retain: usize, max_pooled_size: usize) -> Self {
        Self {
            free: spin::Mutex::new(Vec::new()),
            retain,
            max_pooled_size,
        }
    }

    /// Borrow a zero-initialised or recycled buffer of at least `min` bytes.
    pub fn rent(&self, min: usize) -> Vec<u8> {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.len() >= min) {
            return free.swap_remove(pos);
        }
        drop(free);
        vec![0u8; min]
    }

    /// Return a buffer to the free list.
    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.is_empty() || buf.len() > self.max_pooled_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.retain {
            free.push(buf);
        }
    }

    /// Rent an empty vector that goes back to the pool when dropped.
    pub fn rent_scratch(&self, capacity: usize) -> Pooled<'_> {
        let mut buf = self.rent(capacity);
        buf.clear();
        Pooled { pool: self, buf }
    }

    /// Number of buffers currently on the free list.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16, 64 * 1024)
    }
}

/// Scratch vector borrowed from a `BufferPool`.
pub struct Pooled<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for Pooled<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for Pooled<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for Pooled<'_> {
    fn drop(&mut self) {
        let mut buf = core::mem::take(&mut self.buf);
        let cap = buf.capacity();
        buf.resize(cap, 0);
        self.pool.give_back(buf);
    }
}

// ---------------------------------------------------------------------------
// ArrayBuffer
// ---------------------------------------------------------------------------

/// Growable buffer with an active region and writable tail.
pub struct ArrayBuffer {
    bytes: Vec<u8>,
    active_start: usize,
    active_end: usize,
    pool: Arc<BufferPool>,
}

impl ArrayBuffer {
    /// Create an empty buffer; no storage is rented until first use.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            bytes: Vec::new(),
            active_start: 0,
            active_end: 0,
            pool,
        }
    }

    pub fn active_length(&self) -> usize {
        self.active_end - self.active_start
    }

    pub fn available_length(&self) -> usize {
        self.bytes.len() - self.active_end
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_start == self.active_end
    }

    pub fn active(&self) -> &[u8] {
        &self.bytes[self.active_start..self.active_end]
    }

    pub fn active_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.active_start..self.active_end]
    }

    pub fn available_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.active_end..]
    }

    /// Mark `n` bytes written into the tail as active.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.available_length());
        self.active_end += n.min(self.available_length());
    }

    /// Drop `n` bytes from the front of the active region.
    pub fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.active_length());
        if n >= self.active_length() {
            self.active_start = 0;
            self.active_end = 0;
        } else {
            self.active_start += n;
        }
    }

    /// Guarantee at least `n` writable bytes after the active region.
    pub fn ensure_available_space(&mut self, n: usize) -> Result<(), Error> {
        if n <= self.available_length() {
            return Ok(());
        }

        if self.bytes.is_empty() {
            if n > MAX_CAPACITY {
                return Err(Error::OutOfRange { requested: n });
            }
            self.bytes = self.pool.rent(n);
            self.active_start = 0;
            self.active_end = 0;
            return Ok(());
        }

        let active = self.active_length();
        if n <= self.active_start + self.available_length() {
            // enough slack once the discarded prefix is reclaimed
            self.bytes.copy_within(self.active_start..self.active_end, 0);
            self.active_start = 0;
            self.active_end = active;
            return Ok(());
        }

        let desired = active
            .checked_add(n)
            .filter(|&d| d <= MAX_CAPACITY)
            .ok_or(Error::OutOfRange { requested: n })?;
        let mut size = self.bytes.len().max(1);
        while size < desired {
            size = size.saturating_mul(2);
        }
        let size = size.min(MAX_CAPACITY);

        let mut grown = self.pool.rent(size);
        grown[..active].copy_from_slice(self.active());
        let old = core::mem::replace(&mut self.bytes, grown);
        self.pool.give_back(old);
        self.active_start = 0;
        self.active_end = active;
        Ok(())
    }

    /// Give the storage back to the pool. Only valid once drained.
    pub fn clear_and_return(&mut self) {
        debug_assert!(self.is_empty());
        self.active_start = 0;
        self.active_end = 0;
        let old = core::mem::take(&mut self.bytes);
        self.pool.give_back(old);
    }
}

impl Drop for ArrayBuffer {
    fn drop(&mut self) {
        let old = core::mem::take(&mut self.bytes);
        self.pool.give_back(old);
    }
}
