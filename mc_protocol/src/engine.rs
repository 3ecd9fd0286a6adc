// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! The completion-based I/O engine: a single-threaded loop over an
//! `io_uring` submission/completion queue driving accept, recv, send,
//! and close operations.
//!
//! Every in-flight operation carries a [`Frame`] whose address is the
//! completion's opaque user-data word, drawn from [`FrameRegistry`] the
//! same way the reference crate's `RpcServer` ties an `Operation` to
//! each submission. Unlike the reference crate's buffer-group receive,
//! each session owns its own ring buffer (C2/C3) and receives are issued
//! directly against its writable span.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use io_uring::{cqueue, opcode, types, IoUring};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;

use crate::codec::{self, ClientPacket, DecodeOutcome, EncodeOutcome, ServerPacket};
use crate::frame::{Frame, FramePayload, FrameRegistry, SessionHandle};
use crate::ring_buffer::RingBuffer;
use crate::session::{SessionTable, Status};
use crate::state_machine::{self, Action};
use crate::{Config, GameplaySink};

/// Ticks (one per completion processed) a session may sit idle before
/// the sweep closes it. Set to `u64::MAX` to disable the sweep.
const IDLE_TIMEOUT_TICKS: u64 = 50_000;

/// Backing size of each session's ring buffer (rounded up to a page
/// multiple by [`RingBuffer::alloc`]).
const SESSION_RING_MIN_SIZE: usize = 64 * 1024;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// The I/O engine: owns the kernel queue, the frame pool, the session
/// table, and the caller's gameplay sink.
pub struct Engine<S: GameplaySink> {
    ring: IoUring,
    listener: TcpListener,
    frames: FrameRegistry,
    sessions: SessionTable,
    sink: S,
    tick: u64,
    idle_timeout_ticks: u64,
    session_ring_size: usize,
}

impl<S: GameplaySink> Engine<S> {
    pub fn new(config: &Config, sink: S) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let ring = IoUring::new(config.resolved_queue_depth())?;
        let listener = TcpListener::bind(&config.bind_addr)?;

        // SAFETY: installs a process-wide handler that only sets an
        // atomic flag; reinstallable and reentrant.
        unsafe {
            libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        }

        let mut engine = Self {
            ring,
            listener,
            frames: FrameRegistry::with_capacity(config.resolved_frame_pool_size())?,
            sessions: SessionTable::with_capacity(config.max_connections as usize),
            sink,
            tick: 0,
            idle_timeout_ticks: IDLE_TIMEOUT_TICKS,
            session_ring_size: SESSION_RING_MIN_SIZE,
        };

        engine.queue_accept();
        engine.submit()?;
        Ok(engine)
    }

    /// Runs the event loop until a SIGINT is observed. Each iteration
    /// submits pending operations, drains one completion (sleeping
    /// briefly if none are ready so the shutdown flag is still checked
    /// promptly), then sweeps idle sessions.
    pub fn run(&mut self) -> io::Result<()> {
        while !shutdown_requested() {
            self.submit()?;

            match self.ring.completion().next() {
                Some(cqe) => {
                    self.tick = self.tick.wrapping_add(1);
                    self.dispatch(cqe);
                }
                None => std::thread::sleep(Duration::from_micros(100)),
            }

            self.sweep_idle_sessions();
        }

        info!("shutdown requested; exiting main loop");
        Ok(())
    }

    fn submit(&mut self) -> io::Result<()> {
        match self.ring.submit() {
            Ok(_) => Ok(()),
            Err(e) => match Errno::from_raw(e.raw_os_error().unwrap_or(0)) {
                // The submission queue is momentarily full; the caller's
                // next loop iteration retries.
                Errno::EAGAIN => Ok(()),
                _ => Err(e),
            },
        }
    }

    // ---- submission primitives -------------------------------------

    fn queue_accept(&mut self) {
        let listen_fd = self.listener.as_raw_fd();
        let Some(frame) = self.frames.create_accept(listen_fd) else {
            error!("frame pool exhausted; cannot maintain a standing accept");
            return;
        };

        let (addr_ptr, addr_len_ptr) = unsafe {
            let FramePayload::Accept(ref mut a) = (*frame.as_ptr()).payload else {
                unreachable!("create_accept always produces an Accept payload")
            };
            (
                &mut a.addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut a.addr_len as *mut libc::socklen_t,
            )
        };

        let entry = opcode::Accept::new(types::Fd(listen_fd), addr_ptr, addr_len_ptr)
            .build()
            .user_data(Frame::to_user_data(frame));

        self.push_or_drop(entry, frame, None);
    }

    fn queue_recv(&mut self, session: SessionHandle, fd: i32, buf_ptr: *mut u8, buf_len: usize) {
        self.queue_recv_with(session, fd, buf_ptr, buf_len, None);
    }

    /// Resumes a receive for a session whose readable span still holds
    /// `pending` unconsumed bytes of a partially-seen packet. Under the
    /// ring-buffer pipeline the destination pointer is always the
    /// current writable span (the ring remembers position on its own);
    /// `pending` is carried purely as frame bookkeeping for tracing.
    fn queue_recv_offset(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf_ptr: *mut u8,
        buf_len: usize,
        pending: usize,
    ) {
        self.queue_recv_with(session, fd, buf_ptr, buf_len, Some(pending));
    }

    fn queue_recv_with(
        &mut self,
        session: SessionHandle,
        fd: i32,
        buf_ptr: *mut u8,
        buf_len: usize,
        pending: Option<usize>,
    ) {
        let created = match pending {
            None => self.frames.create_receive(session, fd, buf_ptr, buf_len),
            Some(p) => self
                .frames
                .create_receive_offset(session, fd, buf_ptr, buf_len, p),
        };
        let Some(frame) = created else {
            error!("frame pool exhausted; closing session {}", session.index);
            self.queue_close(Some(session), fd);
            return;
        };

        let entry = opcode::Recv::new(types::Fd(fd), buf_ptr, buf_len as u32)
            .build()
            .user_data(Frame::to_user_data(frame));

        self.push_or_drop(entry, frame, Some(session));
    }

    fn queue_send(&mut self, session: SessionHandle, fd: i32, buf: Vec<u8>) {
        self.queue_send_with(session, fd, buf, 0);
    }

    fn queue_send_continuation(&mut self, session: SessionHandle, fd: i32, buf: Vec<u8>, bytes_out: usize) {
        self.queue_send_with(session, fd, buf, bytes_out);
    }

    fn queue_send_with(&mut self, session: SessionHandle, fd: i32, buf: Vec<u8>, bytes_out: usize) {
        let created = if bytes_out == 0 {
            self.frames.create_send(session, fd, buf)
        } else {
            self.frames.create_send_continuation(session, fd, buf, bytes_out)
        };
        let Some(frame) = created else {
            error!("frame pool exhausted; closing session {}", session.index);
            self.queue_close(Some(session), fd);
            return;
        };

        let (ptr, len) = unsafe {
            let FramePayload::Send(ref s) = (*frame.as_ptr()).payload else {
                unreachable!("create_send always produces a Send payload")
            };
            (s.buf.as_ptr().add(s.bytes_out), (s.buf.len() - s.bytes_out) as u32)
        };

        let entry = opcode::Send::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(Frame::to_user_data(frame));

        self.push_or_drop(entry, frame, Some(session));
    }

    fn queue_close(&mut self, session: Option<SessionHandle>, fd: i32) {
        if let Some(handle) = session {
            if let Some(s) = self.sessions.get_mut(handle) {
                s.set_status(Status::Disconnecting);
            }
        }

        let Some(frame) = self.frames.create_close(session, fd) else {
            warn!("frame pool exhausted while closing fd {fd}; closing synchronously");
            self.close_synchronously(session, fd);
            return;
        };

        let entry = opcode::Close::new(types::Fd(fd))
            .build()
            .user_data(Frame::to_user_data(frame));

        self.push_or_drop(entry, frame, session);
    }

    fn close_synchronously(&mut self, session: Option<SessionHandle>, fd: i32) {
        unsafe {
            libc::close(fd);
        }
        if let Some(handle) = session {
            self.sessions.release(handle);
        }
    }

    /// Pushes a prepared submission; on a full queue, releases the frame
    /// and, for a receive, send, or close (each of which owns a session's
    /// fd), falls back to closing that fd synchronously rather than
    /// leaving a dangling frame, a leaked fd, or a session row pinned
    /// forever because its close never got submitted. A dropped accept is
    /// *not* treated as a reason to close the listening socket — the next
    /// completion's `handle_accept_completion` re-queues a fresh accept
    /// regardless.
    fn push_or_drop(
        &mut self,
        entry: io_uring::squeue::Entry,
        frame: std::ptr::NonNull<Frame>,
        session: Option<SessionHandle>,
    ) {
        let pushed = unsafe { self.ring.submission().push(&entry) };
        if pushed.is_err() {
            error!("submission queue full; dropping operation");
            let close_fd = unsafe {
                match &(*frame.as_ptr()).payload {
                    FramePayload::Receive(r) => Some(r.fd),
                    FramePayload::Send(s) => Some(s.fd),
                    FramePayload::Close(c) => Some(c.fd),
                    FramePayload::Accept(_) => None,
                }
            };
            unsafe {
                self.frames.release(frame);
            }
            if let Some(fd) = close_fd {
                self.close_synchronously(session, fd);
            }
        }
    }

    // ---- completion dispatch ----------------------------------------

    fn dispatch(&mut self, cqe: cqueue::Entry) {
        let ptr = unsafe { Frame::from_user_data(cqe.user_data()) };
        let frame = unsafe { self.frames.take(ptr) };
        let result = cqe.result();

        trace!(
            "completion trace_id={} kind={} result={}",
            frame.trace_id,
            frame.payload.kind_name(),
            result
        );

        match frame.payload {
            FramePayload::Accept(accept) => self.handle_accept_completion(result, accept),
            FramePayload::Receive(recv) => self.handle_receive_completion(result, frame.session, recv),
            FramePayload::Send(send) => self.handle_send_completion(result, frame.session, send),
            FramePayload::Close(close) => self.handle_close_completion(frame.session, close),
        }

        unsafe {
            self.frames.free_slot(ptr);
        }
    }

    fn handle_accept_completion(&mut self, result: i32, accept: crate::frame::Accept) {
        // The server always keeps exactly one outstanding accept.
        self.queue_accept();

        if result < 0 {
            warn!("accept failed: {}", Errno::from_raw(-result));
            return;
        }
        let fd = result;

        let ring = match RingBuffer::alloc(self.session_ring_size, 1) {
            Ok(ring) => ring,
            Err(e) => {
                warn!("failed to allocate session ring buffer: {e}; closing fd {fd}");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };

        let (remote_addr, remote_port) = sockaddr_to_ipv4(&accept.addr);

        let Some(handle) = self
            .sessions
            .claim(fd, remote_addr, remote_port, ring, self.tick)
        else {
            warn!("session table full; closing accepted fd {fd}");
            unsafe {
                libc::close(fd);
            }
            return;
        };

        info!(
            "session {} connected from {}:{}",
            handle.index,
            format_ipv4(remote_addr),
            remote_port
        );

        let (buf_ptr, buf_len) = {
            let session = self.sessions.get_mut(handle).expect("just claimed");
            (session.ring_mut().writable_ptr(), session.ring().writable_len())
        };
        self.queue_recv(handle, fd, buf_ptr, buf_len);
    }

    fn handle_receive_completion(
        &mut self,
        result: i32,
        session: Option<SessionHandle>,
        recv: crate::frame::Receive,
    ) {
        let Some(handle) = session else {
            warn!("receive completion with no session attached; dropping");
            return;
        };

        if result < 0 {
            if Errno::from_raw(-result) == Errno::EBADF {
                // Peer or server already tore this connection down.
                return;
            }
            warn!("session {}: recv error: {}", handle.index, Errno::from_raw(-result));
            self.queue_close(Some(handle), recv.fd);
            return;
        }

        if result == 0 {
            info!("session {}: orderly close (EOF)", handle.index);
            self.queue_close(Some(handle), recv.fd);
            return;
        }

        let n = result as usize;
        let tick = self.tick;
        match self.sessions.get_mut(handle) {
            Some(session) => {
                session.add_bytes_in(n);
                session.touch(tick);
                session.ring_mut().advance_write(n);
            }
            None => {
                warn!("recv completion for stale session {}; dropping", handle.index);
                return;
            }
        }

        self.drain_decode(handle, recv.fd);
    }

    /// Decodes as many packets as the readable span holds, dispatching
    /// each through the state machine, then either resumes a partial
    /// packet or queues a fresh recv once the span is empty.
    fn drain_decode(&mut self, handle: SessionHandle, fd: i32) {
        loop {
            let outcome = {
                let Some(session) = self.sessions.get_mut(handle) else {
                    return;
                };
                let readable = session.ring().readable_slice();
                if readable.is_empty() {
                    None
                } else {
                    Some(codec::decode_client_packet(readable))
                }
            };

            match outcome {
                None => break,
                Some(DecodeOutcome::Consumed(k, packet)) => {
                    let tick = self.tick;
                    if let Some(session) = self.sessions.get_mut(handle) {
                        session.ring_mut().advance_read(k);
                        session.touch(tick);
                    }
                    if !self.dispatch_packet(handle, fd, packet) {
                        return;
                    }
                }
                Some(DecodeOutcome::Need(k)) => {
                    debug!("session {}: need {k} more bytes to finish a packet", handle.index);
                    let (buf_ptr, buf_len, pending) = {
                        let Some(session) = self.sessions.get_mut(handle) else {
                            return;
                        };
                        (
                            session.ring_mut().writable_ptr(),
                            session.ring().writable_len(),
                            session.ring().readable_len(),
                        )
                    };
                    self.queue_recv_offset(handle, fd, buf_ptr, buf_len, pending);
                    return;
                }
                Some(DecodeOutcome::Invalid) => {
                    warn!("session {}: invalid packet; disconnecting", handle.index);
                    self.enqueue_reply(
                        handle,
                        fd,
                        ServerPacket::Disconnect {
                            message: "protocol error".to_string(),
                        },
                    );
                    self.queue_close(Some(handle), fd);
                    return;
                }
            }
        }

        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        let buf_ptr = session.ring_mut().writable_ptr();
        let buf_len = session.ring().writable_len();
        self.queue_recv(handle, fd, buf_ptr, buf_len);
    }

    /// Runs one decoded packet through the state machine. Returns
    /// `false` if the session was disconnected (the caller must stop
    /// decoding further bytes for it).
    fn dispatch_packet(&mut self, handle: SessionHandle, fd: i32, packet: ClientPacket) -> bool {
        let Some(session) = self.sessions.get_mut(handle) else {
            return false;
        };
        let action = state_machine::handle_client_packet(session, handle, packet, &mut self.sink);

        match action {
            Action::Reply(reply) => {
                self.enqueue_reply(handle, fd, reply);
                true
            }
            Action::Disconnect(reply) => {
                if let Some(reply) = reply {
                    self.enqueue_reply(handle, fd, reply);
                }
                self.queue_close(Some(handle), fd);
                false
            }
            Action::None => true,
        }
    }

    fn enqueue_reply(&mut self, handle: SessionHandle, fd: i32, packet: ServerPacket) {
        let size = codec::encoded_size(&packet);
        let mut buf = vec![0u8; size];
        match codec::encode(&packet, &mut buf) {
            EncodeOutcome::Written(_) => self.queue_send(handle, fd, buf),
            EncodeOutcome::Need(missing) => {
                error!("encoded_size underestimated a reply by {missing} bytes; dropping it");
            }
        }
    }

    fn handle_send_completion(
        &mut self,
        result: i32,
        session: Option<SessionHandle>,
        send: crate::frame::Send,
    ) {
        let Some(handle) = session else {
            warn!("send completion with no session attached; dropping");
            return;
        };

        if result < 0 {
            if Errno::from_raw(-result) != Errno::EBADF {
                warn!("session {}: send error: {}", handle.index, Errno::from_raw(-result));
            }
            self.queue_close(Some(handle), send.fd);
            return;
        }

        let n = result as usize;
        let bytes_out = send.bytes_out + n;
        let tick = self.tick;
        if let Some(session) = self.sessions.get_mut(handle) {
            session.add_bytes_out(n);
            session.touch(tick);
        }

        if bytes_out >= send.buf.len() {
            return;
        }

        self.queue_send_continuation(handle, send.fd, send.buf, bytes_out);
    }

    fn handle_close_completion(&mut self, session: Option<SessionHandle>, _close: crate::frame::Close) {
        let Some(handle) = session else {
            return; // server-socket close; nothing to release.
        };
        if self.sessions.get(handle).is_some() {
            info!("session {} closed", handle.index);
            self.sessions.release(handle);
        } else {
            debug!("close completion for an already-released session {}", handle.index);
        }
    }

    fn sweep_idle_sessions(&mut self) {
        if self.idle_timeout_ticks == u64::MAX {
            return;
        }
        let tick = self.tick;
        let threshold = self.idle_timeout_ticks;
        let stale: Vec<(SessionHandle, i32)> = self
            .sessions
            .iter_active()
            .filter(|(_, s)| tick.wrapping_sub(s.last_activity_tick()) > threshold)
            .map(|(h, s)| (h, s.socket()))
            .collect();

        for (handle, fd) in stale {
            info!("session {} idle for too long; closing", handle.index);
            self.queue_close(Some(handle), fd);
        }
    }
}

fn sockaddr_to_ipv4(storage: &libc::sockaddr_storage) -> (u32, u16) {
    if storage.ss_family as i32 != libc::AF_INET {
        return (0, 0);
    }
    // SAFETY: family check above confirms this is a sockaddr_in.
    let addr_in = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    let addr = u32::from_be(addr_in.sin_addr.s_addr);
    let port = u16::from_be(addr_in.sin_port);
    (addr, port)
}

fn format_ipv4(addr: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (addr >> 24) & 0xFF,
        (addr >> 16) & 0xFF,
        (addr >> 8) & 0xFF,
        addr & 0xFF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_to_ipv4_extracts_address_and_port() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_in = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 25565u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            std::ptr::write(
                &mut storage as *mut _ as *mut libc::sockaddr_in,
                addr_in,
            );
        }

        let (addr, port) = sockaddr_to_ipv4(&storage);
        assert_eq!(format_ipv4(addr), "127.0.0.1");
        assert_eq!(port, 25565);
    }

    #[test]
    fn non_inet_family_yields_zeroed_address() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(sockaddr_to_ipv4(&storage), (0, 0));
    }

    #[test]
    fn format_ipv4_renders_dotted_quad() {
        assert_eq!(format_ipv4(0x7F000001), "127.0.0.1");
        assert_eq!(format_ipv4(0), "0.0.0.0");
    }
}
