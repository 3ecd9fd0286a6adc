// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Fixed-capacity session table.
//!
//! One row per connection. Rows are claimed by a first-free-row scan and
//! released back with a bumped generation counter, so a frame holding a
//! stale `(index, generation)` pair can be detected and ignored rather
//! than acted on (see [`crate::frame::SessionHandle`]).

use crate::cursor::CursorView;
use crate::frame::{Generation, SessionHandle, SessionIndex};
use crate::ring_buffer::RingBuffer;

const MAX_USERNAME_LEN: usize = 16;

/// Protocol lifecycle status of a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected = 0,
    Handshaking = 1,
    Authenticating = 2,
    Connected = 3,
    Disconnecting = 4,
}

/// One connection's state: socket, remote endpoint, protocol status, and
/// its private read ring.
pub struct Session {
    socket: i32,
    status: Status,
    remote_addr: u32,
    remote_port: u16,
    username: String,
    ring: Option<CursorView>,
    bytes_in: u64,
    bytes_out: u64,
    generation: Generation,
    /// Monotonic engine tick of the last activity, for the idle sweep.
    last_activity_tick: u64,
}

impl Session {
    fn empty() -> Self {
        Self {
            socket: 0,
            status: Status::Disconnected,
            remote_addr: 0,
            remote_port: 0,
            username: String::new(),
            ring: None,
            bytes_in: 0,
            bytes_out: 0,
            generation: 0,
            last_activity_tick: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.socket == 0
    }

    pub fn socket(&self) -> i32 {
        self.socket
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn remote_addr(&self) -> (u32, u16) {
        (self.remote_addr, self.remote_port)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Sets the username, truncating to the wire cap rather than
    /// panicking: the codec already rejects oversized names before this
    /// is ever called with client-controlled input longer than the cap.
    pub fn set_username(&mut self, name: &str) {
        let cut = name
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .take_while(|&end| end <= MAX_USERNAME_LEN)
            .last()
            .unwrap_or(0);
        self.username = name[..cut].to_string();
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn add_bytes_in(&mut self, n: usize) {
        self.bytes_in += n as u64;
    }

    pub fn add_bytes_out(&mut self, n: usize) {
        self.bytes_out += n as u64;
    }

    pub fn ring(&self) -> &CursorView {
        self.ring.as_ref().expect("session has no ring while free")
    }

    pub fn ring_mut(&mut self) -> &mut CursorView {
        self.ring.as_mut().expect("session has no ring while free")
    }

    pub fn last_activity_tick(&self) -> u64 {
        self.last_activity_tick
    }

    pub fn touch(&mut self, tick: u64) {
        self.last_activity_tick = tick;
    }
}

/// Fixed array of connection records, sized at startup.
pub struct SessionTable {
    rows: Vec<Session>,
}

impl SessionTable {
    pub fn with_capacity(max_connections: usize) -> Self {
        let mut rows = Vec::with_capacity(max_connections);
        rows.resize_with(max_connections, Session::empty);
        Self { rows }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    pub fn in_use(&self) -> usize {
        self.rows.iter().filter(|s| !s.is_free()).count()
    }

    /// Claims the first free row, giving it a fresh ring buffer and
    /// moving it to HANDSHAKING. Returns `None` if every row is taken
    /// (resource exhaustion, handled by the caller per the accept-path
    /// policy).
    pub fn claim(
        &mut self,
        socket: i32,
        remote_addr: u32,
        remote_port: u16,
        ring: RingBuffer,
        tick: u64,
    ) -> Option<SessionHandle> {
        let index = self.rows.iter().position(Session::is_free)?;
        let row = &mut self.rows[index];
        row.socket = socket;
        row.status = Status::Handshaking;
        row.remote_addr = remote_addr;
        row.remote_port = remote_port;
        row.username.clear();
        row.ring = Some(CursorView::new(ring));
        row.bytes_in = 0;
        row.bytes_out = 0;
        row.last_activity_tick = tick;

        Some(SessionHandle {
            index: index as SessionIndex,
            generation: row.generation,
        })
    }

    /// Validates a handle against the row's current generation, guarding
    /// against a completion that arrives after the row was already
    /// recycled for a new connection.
    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        let row = self.rows.get(handle.index as usize)?;
        (row.generation == handle.generation && !row.is_free()).then_some(row)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        let row = self.rows.get_mut(handle.index as usize)?;
        (row.generation == handle.generation && !row.is_free()).then_some(row)
    }

    /// Releases a row: drops its ring, bumps its generation so any
    /// in-flight frame referencing it becomes stale, and marks it free.
    pub fn release(&mut self, handle: SessionHandle) {
        let Some(row) = self.rows.get_mut(handle.index as usize) else {
            return;
        };
        if row.generation != handle.generation || row.is_free() {
            return;
        }

        row.socket = 0;
        row.status = Status::Disconnected;
        row.ring = None;
        row.username.clear();
        row.generation = row.generation.wrapping_add(1);
    }

    /// Iterates over every session row currently in use, yielding its
    /// handle alongside the row, for the idle-timeout sweep.
    pub fn iter_active(&self) -> impl Iterator<Item = (SessionHandle, &Session)> {
        self.rows.iter().enumerate().filter_map(|(i, row)| {
            (!row.is_free()).then(|| {
                (
                    SessionHandle {
                        index: i as SessionIndex,
                        generation: row.generation,
                    },
                    row,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> RingBuffer {
        RingBuffer::alloc(4096, 1).unwrap()
    }

    #[test]
    fn claim_finds_first_free_row() {
        let mut table = SessionTable::with_capacity(2);
        let a = table.claim(10, 0x7f000001, 1234, ring(), 0).unwrap();
        assert_eq!(a.index, 0);
        let b = table.claim(11, 0x7f000001, 1235, ring(), 0).unwrap();
        assert_eq!(b.index, 1);
        assert!(table.claim(12, 0x7f000001, 1236, ring(), 0).is_none());
    }

    #[test]
    fn release_bumps_generation_and_frees_row() {
        let mut table = SessionTable::with_capacity(1);
        let handle = table.claim(10, 1, 1, ring(), 0).unwrap();
        table.release(handle);

        assert!(table.get(handle).is_none());
        let reclaimed = table.claim(20, 2, 2, ring(), 0).unwrap();
        assert_eq!(reclaimed.index, handle.index);
        assert_ne!(reclaimed.generation, handle.generation);
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut table = SessionTable::with_capacity(1);
        let stale = table.claim(10, 1, 1, ring(), 0).unwrap();
        table.release(stale);
        let _fresh = table.claim(20, 2, 2, ring(), 0).unwrap();

        assert!(table.get(stale).is_none());
        assert!(table.get_mut(stale).is_none());
    }

    #[test]
    fn username_is_truncated_to_wire_cap() {
        let mut table = SessionTable::with_capacity(1);
        let handle = table.claim(10, 1, 1, ring(), 0).unwrap();
        let row = table.get_mut(handle).unwrap();
        row.set_username("this_name_is_definitely_too_long");
        assert!(row.username().len() <= MAX_USERNAME_LEN);
    }

    #[test]
    fn status_defaults_to_handshaking_on_claim() {
        let mut table = SessionTable::with_capacity(1);
        let handle = table.claim(10, 1, 1, ring(), 0).unwrap();
        assert_eq!(table.get(handle).unwrap().status(), Status::Handshaking);
    }
}
