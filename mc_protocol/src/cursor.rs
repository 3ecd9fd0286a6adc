// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Producer/consumer cursor view over a [`RingBuffer`](crate::ring_buffer::RingBuffer).
//!
//! A stateless helper in the sense that every method is a pure function of
//! the ring and the two cursors; nothing here performs I/O. Both cursors
//! are wide (`u64`) monotonically non-decreasing counters, so they are
//! compared with wrapping arithmetic and never reduced modulo the ring
//! size directly -- only the derived pointers are.

use crate::ring_buffer::RingBuffer;

/// A read/write cursor pair layered over a ring buffer.
pub struct CursorView {
    ring: RingBuffer,
    read: u64,
    write: u64,
}

impl CursorView {
    pub fn new(ring: RingBuffer) -> Self {
        Self {
            ring,
            read: 0,
            write: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_len(&self) -> usize {
        (self.write.wrapping_sub(self.read)) as usize
    }

    /// Number of bytes available to write before catching up to `read`.
    pub fn writable_len(&self) -> usize {
        self.ring.size() - self.readable_len()
    }

    /// Pointer to the first readable byte, valid for `readable_len()`
    /// contiguous bytes.
    pub fn readable_ptr(&self) -> *mut u8 {
        // SAFETY: the ring guarantees a `size()`-byte contiguous window
        // starting at any offset, and `readable_len() <= size()`.
        unsafe { self.ring.ptr_at(self.read) }
    }

    /// Pointer to the first writable byte, valid for `writable_len()`
    /// contiguous bytes.
    pub fn writable_ptr(&self) -> *mut u8 {
        unsafe { self.ring.ptr_at(self.write) }
    }

    /// Borrow the readable region as a slice.
    pub fn readable_slice(&self) -> &[u8] {
        // SAFETY: readable_ptr() is valid for readable_len() bytes and no
        // mutable alias exists while this borrow is live (single-owner
        // model: the session exclusively owns its cursor view).
        unsafe { std::slice::from_raw_parts(self.readable_ptr(), self.readable_len()) }
    }

    /// Borrow the writable region as a mutable slice, for a completion
    /// handler to write received bytes into directly.
    pub fn writable_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.writable_ptr(), self.writable_len()) }
    }

    /// Advances the write cursor by `n` bytes (e.g. after a successful
    /// recv). Clamped to the writable length so the invariant
    /// `write - read <= size` never breaks.
    pub fn advance_write(&mut self, n: usize) {
        let n = n.min(self.writable_len());
        self.write = self.write.wrapping_add(n as u64);
    }

    /// Advances the read cursor by `n` bytes (e.g. after consuming a
    /// decoded packet). Clamped to the readable length.
    pub fn advance_read(&mut self, n: usize) {
        let n = n.min(self.readable_len());
        self.read = self.read.wrapping_add(n as u64);
    }

    pub fn ring_size(&self) -> usize {
        self.ring.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::RingBuffer;

    fn view() -> CursorView {
        CursorView::new(RingBuffer::alloc(1, 1).unwrap())
    }

    #[test]
    fn empty_view_has_full_writable_and_no_readable() {
        let v = view();
        assert_eq!(v.readable_len(), 0);
        assert_eq!(v.writable_len(), v.ring_size());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut v = view();
        let msg = b"hello, ring";
        v.writable_slice_mut()[..msg.len()].copy_from_slice(msg);
        v.advance_write(msg.len());

        assert_eq!(v.readable_len(), msg.len());
        assert_eq!(&v.readable_slice()[..msg.len()], msg);

        v.advance_read(msg.len());
        assert_eq!(v.readable_len(), 0);
        assert_eq!(v.writable_len(), v.ring_size());
    }

    #[test]
    fn straddling_read_matches_bytes_written_k_positions_back() {
        let mut v = view();
        let size = v.ring_size();

        // Fill to near the wrap boundary, then consume it all, so the next
        // write straddles the physical wrap point.
        let filler = vec![0xAAu8; size - 4];
        v.writable_slice_mut()[..filler.len()].copy_from_slice(&filler);
        v.advance_write(filler.len());
        v.advance_read(filler.len());

        let msg = b"wraps!!!"; // 8 bytes, straddles the boundary
        v.writable_slice_mut()[..msg.len()].copy_from_slice(msg);
        v.advance_write(msg.len());

        assert_eq!(&v.readable_slice()[..msg.len()], msg);
    }
}
