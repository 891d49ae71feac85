//! The arena: an anonymous OS mapping with a free-list allocator inside it.
//!
//! Invariants:
//! - the mapping never grows; every block ever issued lives inside it
//! - the running allocation total never exceeds the capacity
//! - a corrupted or doubly-freed block aborts the process immediately

use std::ptr::{self, NonNull};

use scriptbox_core::config::{CAPACITY_MAX, CAPACITY_MIN};

use crate::error::{ArenaError, Result};
use crate::tracking::PeakTracker;

const ALIGN: usize = 16;
const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const MAGIC_ALLOCATED: u32 = 0x51B0_A110;
const MAGIC_FREE: u32 = 0x51B0_F4EE;

/// Block header preceding every payload. Free blocks store the address-ordered
/// free-list link in the first payload word.
#[repr(C)]
struct Header {
    size: usize,
    state: u32,
    _pad: u32,
}

/// Capacity-bounded guest heap. Exclusively owned by one engine; accessed by
/// exactly one thread at a time.
pub struct Arena {
    base: *mut u8,
    capacity: usize,
    free_head: *mut Header,
    allocated: usize,
    peak: PeakTracker,
}

// The arena moves to the worker thread during monitored evaluation, but the
// concurrency contract guarantees a single thread touches it at a time.
unsafe impl Send for Arena {}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_capacity(capacity: usize, page: usize) -> usize {
    let partial = capacity & (page - 1);
    if partial != 0 {
        (capacity & !(page - 1)) + page
    } else {
        capacity
    }
}

fn align_up(size: usize) -> usize {
    ((size + ALIGN - 1) & !(ALIGN - 1)).max(ALIGN)
}

fn die(message: &str) -> ! {
    // Corruption of the guest heap is never recoverable; fail fast rather
    // than let a damaged allocator issue overlapping blocks.
    eprintln!("scriptbox arena: {message}");
    std::process::abort()
}

impl Arena {
    /// Reserve a zero-initialized anonymous mapping of the page-rounded
    /// capacity and carve the free-space allocator inside it.
    pub fn new(capacity: usize) -> Result<Arena> {
        let rounded = round_capacity(capacity, page_size());
        if !(CAPACITY_MIN..=CAPACITY_MAX).contains(&rounded) {
            return Err(ArenaError::InvalidCapacity {
                requested: capacity,
                rounded,
                min: CAPACITY_MIN,
                max: CAPACITY_MAX,
            });
        }

        // SAFETY: anonymous private mapping; no fd, no offset.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ArenaError::MapFailed {
                requested: capacity,
                rounded,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        let base = base as *mut u8;

        // One free block spanning the whole mapping.
        let head = base as *mut Header;
        // SAFETY: the mapping is at least CAPACITY_MIN bytes, far larger than
        // one header.
        unsafe {
            (*head).size = rounded - HEADER_SIZE;
            (*head).state = MAGIC_FREE;
            Self::set_next(head, ptr::null_mut());
        }

        Ok(Arena {
            base,
            capacity: rounded,
            free_head: head,
            allocated: 0,
            peak: PeakTracker::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Running allocation total (headers included). Never exceeds capacity.
    pub fn allocation(&self) -> usize {
        self.allocated
    }

    pub fn peak_allocation(&self) -> usize {
        self.peak.peak()
    }

    /// Allocate `size` bytes, or `None` when either ceiling layer refuses.
    /// The mapping is never extended on failure.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let need = align_up(size);
        if self.allocated + HEADER_SIZE + need > self.capacity {
            return None;
        }

        let mut prev: *mut Header = ptr::null_mut();
        let mut cur = self.free_head;
        // SAFETY: the free list only ever links headers inside the mapping.
        unsafe {
            while !cur.is_null() {
                let cur_size = (*cur).size;
                if cur_size >= need {
                    let next = Self::get_next(cur);
                    if cur_size - need >= HEADER_SIZE + ALIGN {
                        // Split off the tail as a new free block.
                        let rem = Self::payload(cur).add(need) as *mut Header;
                        (*rem).size = cur_size - need - HEADER_SIZE;
                        (*rem).state = MAGIC_FREE;
                        Self::set_next(rem, next);
                        (*cur).size = need;
                        self.relink(prev, rem);
                    } else {
                        self.relink(prev, next);
                    }
                    (*cur).state = MAGIC_ALLOCATED;
                    self.allocated += HEADER_SIZE + (*cur).size;
                    self.peak.record(self.allocated);
                    #[cfg(feature = "tracing")]
                    tracing::trace!(size, total = self.allocated, "arena alloc");
                    return Some(NonNull::new_unchecked(Self::payload(cur)));
                }
                prev = cur;
                cur = Self::get_next(cur);
            }
        }
        None
    }

    /// Grow or shrink a block, returning the (possibly moved) block or `None`
    /// on failure. On failure the original block is untouched and still owned
    /// by the caller.
    pub fn reallocate(&mut self, block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let header = self.check_block(block);
        let need = align_up(new_size);
        // SAFETY: check_block validated the header.
        unsafe {
            if need <= (*header).size {
                return Some(block);
            }
            let old_size = (*header).size;
            let fresh = self.allocate(new_size)?;
            ptr::copy_nonoverlapping(block.as_ptr(), fresh.as_ptr(), old_size);
            self.free(block);
            Some(fresh)
        }
    }

    /// Return a block to the free list, coalescing with adjacent free blocks.
    pub fn free(&mut self, block: NonNull<u8>) {
        let header = self.check_block(block);
        // SAFETY: check_block validated the header; the insertion walk stays
        // inside the mapping.
        unsafe {
            (*header).state = MAGIC_FREE;
            self.allocated -= HEADER_SIZE + (*header).size;

            let mut prev: *mut Header = ptr::null_mut();
            let mut cur = self.free_head;
            while !cur.is_null() && cur < header {
                prev = cur;
                cur = Self::get_next(cur);
            }

            // Merge forward into `cur` when contiguous.
            if !cur.is_null() && Self::payload(header).add((*header).size) == cur as *mut u8 {
                (*header).size += HEADER_SIZE + (*cur).size;
                Self::set_next(header, Self::get_next(cur));
            } else {
                Self::set_next(header, cur);
            }

            // Merge backward into `prev` when contiguous.
            if !prev.is_null() && Self::payload(prev).add((*prev).size) == header as *mut u8 {
                (*prev).size += HEADER_SIZE + (*header).size;
                Self::set_next(prev, Self::get_next(header));
            } else {
                self.relink(prev, header);
            }
        }
    }

    /// Validate a caller-supplied block pointer. Any inconsistency is fatal:
    /// a damaged heap must not keep running.
    fn check_block(&self, block: NonNull<u8>) -> *mut Header {
        let p = block.as_ptr();
        let lo = unsafe { self.base.add(HEADER_SIZE) };
        let hi = unsafe { self.base.add(self.capacity) };
        if p < lo || p >= hi || (p as usize) & (ALIGN - 1) != 0 {
            die("pointer outside arena");
        }
        let header = unsafe { p.sub(HEADER_SIZE) } as *mut Header;
        // SAFETY: in-range and aligned per the checks above.
        unsafe {
            match (*header).state {
                MAGIC_ALLOCATED => {
                    if (*header).size > self.capacity {
                        die("corrupted block header");
                    }
                    header
                }
                MAGIC_FREE => die("double free"),
                _ => die("corrupted block header"),
            }
        }
    }

    fn relink(&mut self, prev: *mut Header, target: *mut Header) {
        if prev.is_null() {
            self.free_head = target;
        } else {
            // SAFETY: prev is a live free-list header.
            unsafe { Self::set_next(prev, target) };
        }
    }

    unsafe fn payload(header: *mut Header) -> *mut u8 {
        (header as *mut u8).add(HEADER_SIZE)
    }

    unsafe fn get_next(header: *mut Header) -> *mut Header {
        *(Self::payload(header) as *const *mut Header)
    }

    unsafe fn set_next(header: *mut Header, next: *mut Header) {
        *(Self::payload(header) as *mut *mut Header) = next;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/capacity came from mmap in `new`. Every pointer the
        // arena ever issued is invalid past this point; the engine guarantees
        // nothing outlives it.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}
