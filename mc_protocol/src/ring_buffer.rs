// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! The "magic" ring buffer: a page-mapped byte buffer whose address range
//! is virtually duplicated so any read or write of up to `size` bytes,
//! starting at any offset, is contiguous in virtual memory.
//!
//! The trick: create an anonymous, memory-file-backed object of `size`
//! bytes, then map it `count + 1` times back to back at consecutive
//! addresses. Every mapped slice aliases the same physical pages, so a
//! span that straddles the notional wrap point reads or writes the same
//! bytes you'd get from a flat, non-circular buffer twice as large.

use std::io;
use std::os::fd::AsRawFd;
use std::ptr;

/// A page-mapped ring buffer with aliased address space.
pub struct RingBuffer {
    base: *mut u8,
    size: usize,
    count: usize,
}

impl RingBuffer {
    /// Allocates a ring of at least `min_size` bytes (rounded up to a page
    /// multiple), repeated `count` times in the address space so that any
    /// window of `size` bytes starting anywhere in `[0, size*count)` is
    /// contiguous.
    ///
    /// `count` must be at least 1. Any reservation, file, truncate, or
    /// per-slice map failure unwinds everything mapped so far and returns
    /// an error; nothing is left half-mapped.
    pub fn alloc(min_size: usize, count: usize) -> io::Result<Self> {
        assert!(count >= 1, "ring buffer must be repeated at least once");

        let size = round_up(min_size.max(1), page_size());
        let fd = anon_file(size)?;

        let result = (|| -> io::Result<*mut u8> {
            // Reserve a region big enough for every repetition plus one
            // extra copy, matching the same "size*(count+1)" window used
            // for the magic-ness: any `size`-byte slice inside the first
            // `count` repetitions stays inside mapped memory even when it
            // straddles a repetition boundary.
            let region_len = size * (count + 1);
            let region = map(ptr::null_mut(), region_len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1)?;

            let mut mapped = 0usize;
            for slot in 0..=count {
                let addr = unsafe { region.add(slot * size) };
                match map_fixed(addr, size, fd.as_raw_fd()) {
                    Ok(_) => mapped += 1,
                    Err(e) => {
                        // Unwind everything mapped so far, including the
                        // placeholder reservation.
                        for done in 0..mapped {
                            let addr = unsafe { region.add(done * size) };
                            unsafe {
                                libc::munmap(addr as *mut libc::c_void, size);
                            }
                        }
                        unsafe {
                            libc::munmap(region as *mut libc::c_void, region_len);
                        }
                        return Err(e);
                    }
                }
            }

            Ok(region)
        })();

        // `fd` only needs to live long enough to back the mappings; each
        // mmap call takes its own reference to the underlying file.
        drop(fd);

        let base = result?;
        Ok(Self { base, size, count })
    }

    /// The size in bytes of one repetition of the ring.
    pub fn size(&self) -> usize {
        self.size
    }

    /// How many times the ring is repeated in the address space.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns a pointer to byte `offset mod size` of the ring, valid for
    /// up to `size` contiguous bytes regardless of `offset`.
    ///
    /// # Safety
    ///
    /// The caller must not read or write more than `self.size()` bytes
    /// starting from the returned pointer.
    pub unsafe fn ptr_at(&self, offset: u64) -> *mut u8 {
        let local = (offset % self.size as u64) as usize;
        self.base.add(local)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let region_len = self.size * (self.count + 1);
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, region_len);
        }
    }
}

// RingBuffer owns a set of aliased mappings exclusively; moving it between
// threads is fine as long as access is externally synchronized (it isn't
// `Sync`), matching the single-owner model described for the I/O engine.
unsafe impl Send for RingBuffer {}

fn map(addr: *mut u8, len: usize, flags: libc::c_int, fd: libc::c_int) -> io::Result<*mut u8> {
    // SAFETY: standard mmap invocation; failure is reported through the
    // return value, matching the posix mmap wrapper pattern.
    let ptr = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

fn map_fixed(addr: *mut u8, len: usize, fd: libc::c_int) -> io::Result<*mut u8> {
    map(addr, len, libc::MAP_SHARED | libc::MAP_FIXED, fd)
}

/// An anonymous, unlinked, size-truncated file descriptor to back the
/// aliased mappings.
struct AnonFile(std::os::fd::OwnedFd);

impl AsRawFd for AnonFile {
    fn as_raw_fd(&self) -> libc::c_int {
        self.0.as_raw_fd()
    }
}

fn anon_file(size: usize) -> io::Result<AnonFile> {
    const NAME: &[u8] = b"mc_protocol_ring\0";
    let raw = unsafe {
        libc::syscall(
            libc::SYS_memfd_create,
            NAME.as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }

    use std::os::fd::FromRawFd;
    // SAFETY: memfd_create just returned a fresh, valid fd.
    let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw as libc::c_int) };

    // SAFETY: fd is valid and owned here.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(AnonFile(fd))
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::slice;

    #[test]
    fn straddling_window_is_contiguous() {
        let ring = RingBuffer::alloc(1, 1).unwrap();
        let size = ring.size();

        // Write a marker straddling the wrap point.
        unsafe {
            let p = ring.ptr_at((size - 3) as u64);
            let window = slice::from_raw_parts_mut(p, 6);
            window.copy_from_slice(b"abcdef");
        }

        // Reading from the start should see the wrapped-around tail first.
        unsafe {
            let p = ring.ptr_at(0);
            let window = slice::from_raw_parts(p, 3);
            assert_eq!(window, b"def");
        }

        unsafe {
            let p = ring.ptr_at((size - 3) as u64);
            let window = slice::from_raw_parts(p, 6);
            assert_eq!(window, b"abcdef");
        }
    }

    #[test]
    fn size_rounds_up_to_page_multiple() {
        let ring = RingBuffer::alloc(1, 1).unwrap();
        assert_eq!(ring.size() % page_size(), 0);
        assert!(ring.size() >= page_size());
    }
}
