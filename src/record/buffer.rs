//! Inbound record buffer.
//!
//! One `ArrayBuffer` holds three zones back to back:
//!
//! ```text
//! [ decrypted plaintext | padding | ciphertext not yet decrypted ... ]
//! ```
//!
//! Decryption happens in place, so a record's plaintext never needs a
//! second copy before delivery.

use alloc::sync::Arc;

use crate::buf::{ArrayBuffer, BufferPool};
use crate::error::Error;

pub struct FrameBuffer {
    buffer: ArrayBuffer,
    decrypted_length: usize,
    decrypted_padding: usize,
}

impl FrameBuffer {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            buffer: ArrayBuffer::new(pool),
            decrypted_length: 0,
            decrypted_padding: 0,
        }
    }

    pub fn decrypted_length(&self) -> usize {
        self.decrypted_length
    }

    pub fn decrypted_padding(&self) -> usize {
        self.decrypted_padding
    }

    pub fn active_length(&self) -> usize {
        self.buffer.active_length()
    }

    /// Bytes available for frame parsing.
    pub fn encrypted_length(&self) -> usize {
        self.buffer.active_length() - self.decrypted_length - self.decrypted_padding
    }

    pub fn available_length(&self) -> usize {
        self.buffer.available_length()
    }

    pub fn decrypted(&self) -> &[u8] {
        &self.buffer.active()[..self.decrypted_length]
    }

    pub fn encrypted(&self) -> &[u8] {
        &self.buffer.active()[self.decrypted_length + self.decrypted_padding..]
    }

    pub fn encrypted_mut(&mut self) -> &mut [u8] {
        let skip = self.decrypted_length + self.decrypted_padding;
        &mut self.buffer.active_mut()[skip..]
    }

    pub fn available_mut(&mut self) -> &mut [u8] {
        self.buffer.available_mut()
    }

    pub fn commit(&mut self, n: usize) {
        self.buffer.commit(n);
    }

    pub fn ensure_available_space(&mut self, n: usize) -> Result<(), Error> {
        self.buffer.ensure_available_space(n)
    }

    /// Consume delivered plaintext. The padding goes with the last byte.
    pub fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.decrypted_length);
        let n = n.min(self.decrypted_length);
        self.decrypted_length -= n;
        self.buffer.discard(n);
        if self.decrypted_length == 0 {
            self.buffer.discard(self.decrypted_padding);
            self.decrypted_padding = 0;
        }
    }

    /// Skip a record that produced no plaintext.
    pub fn discard_encrypted(&mut self, n: usize) {
        debug_assert!(self.decrypted_length == 0 && self.decrypted_padding == 0);
        debug_assert!(n <= self.encrypted_length());
        self.buffer.discard(n);
    }

    /// Record the result of decrypting the frame at the start of the
    /// ciphertext zone: `count` plaintext bytes at `offset` within a frame of
    /// `frame_size` bytes.
    pub fn on_decrypted(&mut self, offset: usize, count: usize, frame_size: usize) {
        debug_assert!(self.decrypted_length == 0 && self.decrypted_padding == 0);
        debug_assert!(offset + count <= frame_size);
        if count > 0 {
            self.buffer.discard(offset);
            self.decrypted_length = count;
            self.decrypted_padding = frame_size - offset - count;
        } else {
            self.buffer.discard(frame_size);
        }
    }

    /// Hand the storage back to the pool if nothing is buffered.
    pub fn return_buffer(&mut self) {
        if self.buffer.is_empty() && self.buffer.capacity() > 0 {
            self.decrypted_length = 0;
            self.decrypted_padding = 0;
            self.buffer.clear_and_return();
        }
    }

    /// Drop everything buffered and hand the storage back.
    pub fn reset(&mut self) {
        self.decrypted_length = 0;
        self.decrypted_padding = 0;
        let active = self.buffer.active_length();
        self.buffer.discard(active);
        self.buffer.clear_and_return();
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}
