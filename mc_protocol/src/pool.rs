// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

//! Fixed-element pool allocator.
//!
//! Frames (see [`crate::frame`]) are allocated from a single contiguous
//! arena with an intrusive free-list threaded through the free cells, the
//! same way a slab allocator works: no per-cell header beyond the link
//! word, `O(1)` allocate and free, and no growth once the arena is full.
//!
//! The arena never shrinks or grows after construction, and it is not
//! thread-safe: it is meant to be owned exclusively by the single-threaded
//! I/O engine (see [`crate::engine`]).

use std::io;
use std::mem;
use std::ptr::NonNull;

/// One arena cell. While free, it holds the next link of the free list;
/// while allocated, it holds a live `T`. Union so that free cells cost
/// nothing beyond a single pointer write.
union Cell<T> {
    next: *mut Cell<T>,
    value: mem::ManuallyDrop<T>,
}

/// A fixed-capacity pool of `T`-sized cells, backed by one `mmap`'d,
/// page-aligned arena.
pub struct Pool<T> {
    base: NonNull<Cell<T>>,
    bytes: usize,
    capacity: usize,
    free_head: *mut Cell<T>,
    in_use: usize,
}

/// SAFETY requirement baked into the contract: cells must be at least
/// pointer-sized, since a free cell stores the free-list link in place.
const fn assert_cell_large_enough<T>() {
    assert!(mem::size_of::<Cell<T>>() >= mem::size_of::<*mut ()>());
}

impl<T> Pool<T> {
    /// Creates a pool with room for at least `min_elements` elements,
    /// rounded up so the backing arena occupies a whole number of pages.
    ///
    /// Returns an error if the reservation cannot be made; the caller
    /// never ends up with a null arena pointer.
    pub fn with_capacity(min_elements: usize) -> io::Result<Self> {
        assert_cell_large_enough::<T>();

        let cell_size = mem::size_of::<Cell<T>>();
        let page_size = page_size();
        let wanted_bytes = min_elements.max(1) * cell_size;
        let bytes = round_up(wanted_bytes, page_size);
        let capacity = bytes / cell_size;

        // SAFETY: anonymous, not file-backed; no aliasing requirement here
        // (unlike the ring buffer in `crate::ring_buffer`), so a plain
        // private mapping suffices.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = NonNull::new(addr as *mut Cell<T>).expect("mmap returned null on success");

        // Thread the free list through every cell, head at index 0.
        unsafe {
            for i in 0..capacity {
                let cell = base.as_ptr().add(i);
                let next = if i + 1 < capacity {
                    base.as_ptr().add(i + 1)
                } else {
                    std::ptr::null_mut()
                };
                (*cell).next = next;
            }
        }

        Ok(Self {
            base,
            bytes,
            capacity,
            free_head: base.as_ptr(),
            in_use: 0,
        })
    }

    /// Number of cells the arena holds in total.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cells currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Pops a cell off the free list. Returns `None` when the pool is
    /// exhausted; the caller must treat this as resource-exhaustion, never
    /// fabricate a frame from a null pointer.
    pub fn alloc(&mut self) -> Option<NonNull<T>> {
        if self.free_head.is_null() {
            return None;
        }

        // SAFETY: free_head always points at a live cell within the arena
        // while non-null; the free list is only ever mutated through
        // alloc/free.
        unsafe {
            let cell = self.free_head;
            self.free_head = (*cell).next;
            self.in_use += 1;
            Some(NonNull::new_unchecked(cell as *mut T))
        }
    }

    /// Pushes a cell back onto the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior `alloc()` on this pool and
    /// must not already have been freed. Double-free and foreign-free are
    /// undefined behaviour, same as the element it replaces in a systems
    /// implementation.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        let cell = ptr.as_ptr() as *mut Cell<T>;
        (*cell).next = self.free_head;
        self.free_head = cell;
        self.in_use -= 1;
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.bytes);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a real system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let mut pool: Pool<[u8; 64]> = Pool::with_capacity(4).unwrap();
        assert!(pool.capacity() >= 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.in_use(), 2);

        unsafe {
            pool.free(a);
        }
        assert_eq!(pool.in_use(), 1);

        let c = pool.alloc().unwrap();
        // LIFO free list: the just-freed cell comes back first.
        assert_eq!(a.as_ptr(), c.as_ptr());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool: Pool<[u8; 32]> = Pool::with_capacity(2).unwrap();
        let cap = pool.capacity();
        let mut allocated = Vec::new();
        for _ in 0..cap {
            allocated.push(pool.alloc().unwrap());
        }
        assert!(pool.alloc().is_none());

        unsafe {
            pool.free(allocated.pop().unwrap());
        }
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn randomized_alloc_free_sequence() {
        let mut pool: Pool<[u8; 16]> = Pool::with_capacity(8).unwrap();
        let cap = pool.capacity();
        let mut live: Vec<NonNull<[u8; 16]>> = Vec::new();
        let mut lcg: u64 = 0x2545F4914F6CDD1D;

        for _ in 0..500 {
            lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1);
            let want_alloc = (lcg >> 33) % 2 == 0;

            if want_alloc && live.len() < cap {
                if let Some(p) = pool.alloc() {
                    live.push(p);
                }
            } else if !live.is_empty() {
                let idx = (lcg >> 40) as usize % live.len();
                let p = live.remove(idx);
                unsafe {
                    pool.free(p);
                }
            }
        }

        assert_eq!(pool.in_use(), live.len());
        for p in live {
            unsafe {
                pool.free(p);
            }
        }
        assert_eq!(pool.in_use(), 0);
    }
}
