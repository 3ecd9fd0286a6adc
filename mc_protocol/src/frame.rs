// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Frame registry: the single heap-allocated record describing one
//! in-flight kernel operation.
//!
//! A frame's address is the opaque user-data word stashed on the kernel
//! submission; the completion handler recovers the frame from that word
//! and is responsible for releasing it exactly once. Frames are drawn
//! from a [`Pool`] rather than `Box`, so there is no per-frame heap
//! allocation on the submit/complete hot path.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pool::Pool;

/// Index of a row in the session table.
pub type SessionIndex = u32;

/// Generation counter of a session table row, bumped every release.
pub type Generation = u32;

/// A stable reference to a session row, validated against the table's
/// current generation at dispatch time rather than trusted as a raw
/// pointer. A completion for a torn-down session carries a stale handle
/// and is discarded instead of acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub index: SessionIndex,
    pub generation: Generation,
}

/// Remote address storage filled in-place by the kernel on completion of
/// an accept.
pub struct Accept {
    pub listen_fd: i32,
    pub addr: libc::sockaddr_storage,
    pub addr_len: libc::socklen_t,
}

pub struct Receive {
    pub fd: i32,
    pub buf_ptr: *mut u8,
    pub buf_len: usize,
    /// Bytes already captured by a prior short read into the same
    /// destination, when this receive resumes one.
    pub bytes_in: usize,
}

pub struct Send {
    pub fd: i32,
    /// The frame owns the buffer until the send completes fully.
    pub buf: Vec<u8>,
    pub bytes_out: usize,
}

pub struct Close {
    pub fd: i32,
}

pub enum FramePayload {
    Accept(Accept),
    Receive(Receive),
    Send(Send),
    Close(Close),
}

impl FramePayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FramePayload::Accept(_) => "accept",
            FramePayload::Receive(_) => "receive",
            FramePayload::Send(_) => "send",
            FramePayload::Close(_) => "close",
        }
    }
}

/// One in-flight I/O operation. `session` is absent for the
/// pre-assignment accept frame and for the server-socket close frame.
pub struct Frame {
    pub trace_id: u64,
    pub session: Option<SessionHandle>,
    pub payload: FramePayload,
}

impl Frame {
    /// Exposes the frame's address as an opaque `u64`, suitable for a
    /// kernel submission's user-data word.
    pub fn to_user_data(ptr: NonNull<Frame>) -> u64 {
        ptr.as_ptr().expose_provenance() as u64
    }

    /// Recovers a frame pointer from a user-data word previously produced
    /// by [`Frame::to_user_data`].
    ///
    /// # Safety
    ///
    /// `data` must be a value returned by `to_user_data` for a frame that
    /// has not yet been released.
    pub unsafe fn from_user_data(data: u64) -> NonNull<Frame> {
        let raw = std::ptr::with_exposed_provenance_mut::<Frame>(data as usize);
        NonNull::new_unchecked(raw)
    }
}

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Owns the pool that backs every frame in flight.
pub struct FrameRegistry {
    pool: Pool<Frame>,
}

impl FrameRegistry {
    pub fn with_capacity(min_elements: usize) -> std::io::Result<Self> {
        Ok(Self {
            pool: Pool::with_capacity(min_elements)?,
        })
    }

    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn create_accept(&mut self, listen_fd: i32) -> Option<NonNull<Frame>> {
        self.insert(
            None,
            FramePayload::Accept(Accept {
                listen_fd,
                // SAFETY: sockaddr_storage is valid when zeroed; the
                // kernel fills it in on completion.
                addr: unsafe { mem::zeroed() },
                addr_len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            }),
        )
    }

    pub fn create_receive(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf_ptr: *mut u8,
        buf_len: usize,
    ) -> Option<NonNull<Frame>> {
        self.insert(
            Some(session),
            FramePayload::Receive(Receive {
                fd,
                buf_ptr,
                buf_len,
                bytes_in: 0,
            }),
        )
    }

    /// Resumes a short read: the kernel is asked to fill the tail of
    /// `buf` starting at `offset`, while the frame remembers how many
    /// bytes were already captured.
    pub fn create_receive_offset(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf_ptr: *mut u8,
        buf_len: usize,
        offset: usize,
    ) -> Option<NonNull<Frame>> {
        self.insert(
            Some(session),
            FramePayload::Receive(Receive {
                fd,
                buf_ptr,
                buf_len,
                bytes_in: offset,
            }),
        )
    }

    pub fn create_send(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf: Vec<u8>,
    ) -> Option<NonNull<Frame>> {
        self.insert(
            Some(session),
            FramePayload::Send(Send {
                fd,
                buf,
                bytes_out: 0,
            }),
        )
    }

    /// A send continuation picks up where a prior partial send left off;
    /// `bytes_out` is preserved so the handler resubmits only the tail.
    pub fn create_send_continuation(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf: Vec<u8>,
        bytes_out: usize,
    ) -> Option<NonNull<Frame>> {
        self.insert(
            Some(session),
            FramePayload::Send(Send {
                fd,
                buf,
                bytes_out,
            }),
        )
    }

    pub fn create_close(&mut self, session: Option<SessionHandle>, fd: i32) -> Option<NonNull<Frame>> {
        self.insert(session, FramePayload::Close(Close { fd }))
    }

    /// Moves a frame's value out of its cell. The cell stays allocated
    /// from the pool's point of view until a matching [`Self::free_slot`]
    /// call; callers inspect or consume the returned `Frame` (e.g. match
    /// on its payload) before returning the cell.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this registry's `insert` and must not
    /// already have been taken or released.
    pub unsafe fn take(&mut self, ptr: NonNull<Frame>) -> Frame {
        ptr.as_ptr().read()
    }

    /// Returns a cell to the pool's free list. Pairs with [`Self::take`]:
    /// by the time this runs, the cell's value has already been moved out
    /// and will be dropped normally as the caller's local goes out of
    /// scope, so this only needs to thread the cell back onto the free
    /// list, not run a destructor.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this registry and must have already been
    /// passed to `take` (and not freed since).
    pub unsafe fn free_slot(&mut self, ptr: NonNull<Frame>) {
        self.pool.free(ptr);
    }

    /// Drops a frame's value in place and returns its cell to the pool,
    /// for callers with no use for the value itself (e.g. a submission
    /// that was never accepted by the kernel).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this registry and must not already have
    /// been taken or released.
    pub unsafe fn release(&mut self, ptr: NonNull<Frame>) {
        drop(self.take(ptr));
        self.free_slot(ptr);
    }

    fn insert(&mut self, session: Option<SessionHandle>, payload: FramePayload) -> Option<NonNull<Frame>> {
        let ptr = self.pool.alloc()?;
        let frame = Frame {
            trace_id: next_trace_id(),
            session,
            payload,
        };
        // SAFETY: `ptr` was just allocated from the pool and holds
        // uninitialised memory; `write` initialises it without dropping
        // whatever bit pattern was there before.
        unsafe {
            ptr.as_ptr().write(frame);
        }
        Some(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> SessionHandle {
        SessionHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn accept_frame_round_trips_through_user_data() {
        let mut reg = FrameRegistry::with_capacity(4).unwrap();
        let ptr = reg.create_accept(3).unwrap();
        let data = Frame::to_user_data(ptr);

        let recovered = unsafe { Frame::from_user_data(data) };
        assert_eq!(recovered, ptr);
        unsafe {
            assert!(matches!((*recovered.as_ptr()).payload, FramePayload::Accept(_)));
            reg.release(recovered);
        }
    }

    #[test]
    fn trace_ids_are_monotonic() {
        let mut reg = FrameRegistry::with_capacity(4).unwrap();
        let a = reg.create_accept(1).unwrap();
        let b = reg.create_accept(1).unwrap();
        unsafe {
            assert!((*a.as_ptr()).trace_id < (*b.as_ptr()).trace_id);
            reg.release(a);
            reg.release(b);
        }
    }

    #[test]
    fn release_drops_owned_send_buffer() {
        let mut reg = FrameRegistry::with_capacity(4).unwrap();
        let ptr = reg
            .create_send(handle(0), 4, vec![1, 2, 3, 4, 5])
            .unwrap();
        unsafe {
            reg.release(ptr);
        }
        // The pool cell is reusable immediately; no leaked allocation
        // tracking is observable here beyond the pool accounting.
        assert_eq!(reg.in_use(), 0);
    }

    #[test]
    fn receive_offset_preserves_bytes_in() {
        let mut reg = FrameRegistry::with_capacity(4).unwrap();
        let mut buf = [0u8; 16];
        let ptr = reg
            .create_receive_offset(handle(0), 5, buf.as_mut_ptr(), buf.len(), 3)
            .unwrap();
        unsafe {
            let FramePayload::Receive(r) = &(*ptr.as_ptr()).payload else {
                panic!("expected Receive payload");
            };
            assert_eq!(r.bytes_in, 3);
            reg.release(ptr);
        }
    }

    #[test]
    fn exhaustion_returns_none_without_leaking_state() {
        let mut reg = FrameRegistry::with_capacity(1).unwrap();
        let cap = {
            // drain the pool to its real (page-rounded) capacity
            let mut n = 0;
            while reg.create_close(None, 1).is_some() {
                n += 1;
            }
            n
        };
        assert!(cap >= 1);
        assert!(reg.create_close(None, 1).is_none());
    }
}
