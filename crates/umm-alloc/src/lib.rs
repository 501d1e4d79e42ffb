//! Embedded block allocator for fixed, pre-mapped memory regions.
//!
//! This crate provides [`UmmAlloc`], a `umm_malloc`-style allocator that
//! manages a single caller-provided contiguous buffer. It is designed for
//! cache-backed "software SRAM" regions: the buffer is carved into an array
//! of fixed-size blocks, and all bookkeeping lives inside the buffer itself
//! as *block indices*, never pointers, so the whole region stays relocatable
//! and the metadata overhead is bounded (one index pair per block).
//!
//! # Block layout
//!
//! Every block is 16 bytes: an 8-byte header holding the used-chain links
//! (`next`/`prev` block indices) and an 8-byte body. While a block is
//! allocated the body holds user data; while it is free the body is reused
//! for the free-list links.
//!
//! ```text
//! Block:
//! ┌───────────────────────────┬───────────────────────────┐
//! │ header: next, prev (u32)  │ body: user data, or       │
//! │ used-chain links          │ free-list next/prev (u32) │
//! └───────────────────────────┴───────────────────────────┘
//! ```
//!
//! The high bit of the header `next` index marks the block as free, which
//! halves the addressable block range but keeps the flag inside the existing
//! storage. Block 0 is a sentinel heading both the used chain and the free
//! list and is never handed to a caller; the last block is a zero-size
//! terminator.
//!
//! # Algorithm
//!
//! - **Allocation**: best-fit scan of the doubly-linked free list (smallest
//!   free run that satisfies the request), splitting oversize runs.
//! - **Deallocation**: freed blocks are coalesced with the following block
//!   first, then the preceding one, so three adjacent free runs always fold
//!   into one.
//! - **Reallocation**: grows in place when possible, otherwise assimilates
//!   the adjacent free run(s) in the cheapest combination (`memmove` when
//!   the start address changes), falling back to allocate-copy-free.
//!
//! Pointers handed back to [`UmmAlloc::free`] and [`UmmAlloc::realloc`] are
//! fully validated (range, block alignment, and an allocated-chain walk), so
//! a foreign or stale pointer is rejected without touching allocator state.
//!
//! # Thread safety
//!
//! [`UmmAlloc`] is `Send` but not `Sync`; concurrent access requires
//! external synchronization.

use core::{mem, ptr};

use snafu::{Snafu, ensure};

/// High bit of the header `next` index, marking a free block.
const FREELIST_MASK: u32 = 1 << (u32::BITS - 1);
/// Mask extracting the block index out of a header `next` field.
const BLOCKNO_MASK: u32 = !FREELIST_MASK;
/// Smallest viable heap: sentinel, one usable block, terminator.
const MIN_BLOCKS: usize = 3;
/// Usable block-count range is half the index range; the top bit is the
/// free flag.
const MAX_BLOCKS: usize = FREELIST_MASK as usize;

const BLOCK_SIZE: usize = mem::size_of::<Block>();
const HEADER_SIZE: usize = mem::size_of::<Links>();
const BODY_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;

/// Largest heap addressable with 32-bit block indices.
pub const UMM_MAX_HEAP_SIZE: usize = BLOCK_SIZE * MAX_BLOCKS;

/// A `next`/`prev` index pair. Used both for the used chain (header) and
/// the free list (body of a free block).
#[repr(C)]
#[derive(Clone, Copy)]
struct Links {
    next: u32,
    prev: u32,
}

#[repr(C)]
struct Block {
    header: Links,
    body: Links,
}

const _: () = assert!(mem::size_of::<Block>() == 16);
const _: () = assert!(mem::align_of::<Block>() == 4);

/// Errors reported by [`UmmAlloc::init`].
#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("backing memory pointer is null"))]
    NullMemory {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("backing memory is not aligned to {align} bytes"))]
    UnalignedMemory {
        align: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("heap size {size} exceeds the maximum {max} addressable with 32-bit indices"))]
    HeapTooLarge {
        size: usize,
        max: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("heap size {size} yields fewer than {min_blocks} blocks"))]
    HeapTooSmall {
        size: usize,
        min_blocks: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockStatus {
    BadBlock,
    Allocated,
    Free,
}

/// Block allocator over a single caller-provided memory region.
///
/// All allocator state other than the heap pointer and block count lives
/// inside the managed buffer itself, encoded as block indices. See the
/// crate-level documentation for the layout and algorithm.
pub struct UmmAlloc {
    heap: *mut Block,
    numblocks: u32,
}

unsafe impl Send for UmmAlloc {}

impl UmmAlloc {
    /// Takes ownership of `size` bytes at `memory` and formats them as an
    /// empty heap: block 0 as the sentinel, block 1 as one giant free run,
    /// and the last block as a zero-size terminator.
    ///
    /// # Errors
    ///
    /// Fails when `memory` is null or under-aligned, when `size` exceeds
    /// [`UMM_MAX_HEAP_SIZE`], or when fewer than 3 blocks fit.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `memory..memory + size` is valid,
    /// exclusively owned by this allocator, and outlives it.
    pub unsafe fn init(memory: *mut u8, size: usize) -> Result<Self, InitError> {
        log::trace!("umm init: memory={memory:p} size={size}");
        ensure!(!memory.is_null(), NullMemorySnafu);
        ensure!(
            memory.addr().is_multiple_of(mem::align_of::<Block>()),
            UnalignedMemorySnafu {
                align: mem::align_of::<Block>()
            }
        );
        ensure!(
            size <= UMM_MAX_HEAP_SIZE,
            HeapTooLargeSnafu {
                size,
                max: UMM_MAX_HEAP_SIZE
            }
        );
        let numblocks = size / BLOCK_SIZE;
        ensure!(
            numblocks >= MIN_BLOCKS,
            HeapTooSmallSnafu {
                size,
                min_blocks: MIN_BLOCKS
            }
        );

        log::debug!(
            "umm init: {numblocks} blocks of {BLOCK_SIZE} bytes (max heap {UMM_MAX_HEAP_SIZE})"
        );
        let mut this = Self {
            heap: memory.cast::<Block>(),
            #[expect(clippy::cast_possible_truncation, reason = "bounded by MAX_BLOCKS")]
            numblocks: numblocks as u32,
        };
        this.reset();
        Ok(this)
    }

    /// Resets the heap to its freshly-initialized state, discarding every
    /// outstanding allocation.
    pub fn clean(&mut self) {
        log::trace!("umm clean");
        self.reset();
    }

    /// Allocates `size` bytes, returning a pointer into the managed region,
    /// or `None` when `size` is zero or no free run is large enough.
    pub fn malloc(&mut self, size: usize) -> Option<*mut u8> {
        log::trace!("umm malloc: size={size}");
        if size == 0 {
            log::debug!("malloc of 0 bytes, nothing to do");
            return None;
        }
        let blocks = u32::try_from(Self::blocks_needed(size)).ok()?;

        // Best-fit scan: remember the smallest free run that satisfies the
        // request.
        let mut best: Option<(u32, u32)> = None;
        let mut cf = self.nfree(0);
        while cf != 0 {
            let run = (self.nblock(cf) & BLOCKNO_MASK) - cf;
            if run >= blocks && best.is_none_or(|(_, s)| run < s) {
                best = Some((cf, run));
            }
            cf = self.nfree(cf);
        }
        let Some((cf, run)) = best else {
            log::debug!("cannot allocate {blocks} blocks");
            return None;
        };

        if run == blocks {
            // Exact fit, take the whole run.
            log::debug!("allocating {blocks} blocks at {cf}, exact fit");
            self.disconnect_from_free_list(cf);
        } else {
            // Split off the prefix; the remainder stays free and replaces
            // `cf` in the free list.
            log::debug!("allocating {blocks} blocks at {cf}, splitting run of {run}");
            self.split_block(cf, blocks, FREELIST_MASK);
            let pf = self.pfree(cf);
            let nf = self.nfree(cf);
            self.set_nfree(pf, cf + blocks);
            self.set_pfree(cf + blocks, pf);
            self.set_pfree(nf, cf + blocks);
            self.set_nfree(cf + blocks, nf);
        }

        Some(self.data_ptr(cf))
    }

    /// Allocates a zero-filled buffer for `num` elements of `size` bytes.
    /// The multiplication is overflow-checked; overflow yields `None`.
    pub fn calloc(&mut self, num: usize, size: usize) -> Option<*mut u8> {
        log::trace!("umm calloc: num={num} size={size}");
        let Some(total) = num.checked_mul(size) else {
            log::error!("integer overflow in calloc({num}, {size})");
            return None;
        };
        let ptr = self.malloc(total)?;
        unsafe {
            ptr.write_bytes(0, total);
        }
        Some(ptr)
    }

    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// A null `ptr` behaves as [`malloc`](Self::malloc); `size == 0` behaves
    /// as [`free`](Self::free) and returns `None`. A pointer this allocator
    /// did not produce is rejected (`None`) without modifying any state.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        log::trace!("umm realloc: ptr={ptr:p} size={size}");
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return None;
        }
        if !self.check_pointer(ptr) {
            log::error!("realloc of invalid pointer {ptr:p}");
            return None;
        }

        let mut c = self.block_index_of(ptr);
        let blocks = u32::try_from(Self::blocks_needed(size)).ok()?;
        let mut block_size = self.nblock(c) - c;
        let cur_size = block_size as usize * BLOCK_SIZE - HEADER_SIZE;

        // Sizes of the adjacent runs, non-zero only when they are free.
        let next = self.nblock(c);
        let next_size = if self.nblock(next) & FREELIST_MASK != 0 {
            (self.nblock(next) & BLOCKNO_MASK) - next
        } else {
            0
        };
        let prev = self.pblock(c);
        let prev_size = if self.nblock(prev) & FREELIST_MASK != 0 {
            c - prev
        } else {
            0
        };
        log::debug!(
            "realloc: need {blocks} blocks, have {block_size} (next free {next_size}, prev free {prev_size})"
        );

        let mut ptr = ptr;
        if block_size >= blocks {
            // Same size or smaller, nothing to move.
        } else if block_size + next_size >= blocks {
            self.assimilate_up(c);
            block_size += next_size;
        } else if prev_size + block_size >= blocks {
            self.disconnect_from_free_list(self.pblock(c));
            c = self.assimilate_down(c, 0);
            unsafe {
                ptr::copy(ptr, self.data_ptr(c), cur_size);
            }
            ptr = self.data_ptr(c);
            block_size += prev_size;
        } else if prev_size + block_size + next_size >= blocks {
            self.assimilate_up(c);
            self.disconnect_from_free_list(self.pblock(c));
            c = self.assimilate_down(c, 0);
            unsafe {
                ptr::copy(ptr, self.data_ptr(c), cur_size);
            }
            ptr = self.data_ptr(c);
            block_size += prev_size + next_size;
        } else {
            let old = ptr;
            match self.malloc(size) {
                Some(fresh) => {
                    unsafe {
                        ptr::copy_nonoverlapping(old, fresh, cur_size);
                    }
                    self.free(old);
                    ptr = fresh;
                }
                None => {
                    log::debug!("realloc to {blocks} blocks failed, old block left intact");
                    return None;
                }
            }
            block_size = blocks;
        }

        // Return any surplus blocks gained while assimilating.
        if block_size > blocks {
            log::debug!("realloc: splitting off {} surplus blocks", block_size - blocks);
            self.split_block(c, blocks, 0);
            let surplus = self.data_ptr(c + blocks);
            self.free(surplus);
        }

        Some(ptr)
    }

    /// Releases the allocation at `ptr`, coalescing with adjacent free runs.
    ///
    /// A null pointer is a no-op. A pointer this allocator did not produce
    /// (including an already-freed one) is logged and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        log::trace!("umm free: ptr={ptr:p}");
        if ptr.is_null() {
            log::debug!("free of null pointer, nothing to do");
            return;
        }
        if !self.check_pointer(ptr) {
            log::error!("free of invalid pointer {ptr:p}");
            return;
        }

        let c = self.block_index_of(ptr);
        log::debug!("freeing block {c}");

        // Coalesce with the next run first, then the previous one, so three
        // adjacent free runs fold into a single block.
        self.assimilate_up(c);
        if self.nblock(self.pblock(c)) & FREELIST_MASK != 0 {
            let _ = self.assimilate_down(c, FREELIST_MASK);
        } else {
            // Previous block is allocated; push onto the free-list head.
            let head = self.nfree(0);
            self.set_pfree(head, c);
            self.set_nfree(c, head);
            self.set_pfree(c, 0);
            self.set_nfree(0, c);
            self.set_nblock(c, self.nblock(c) | FREELIST_MASK);
        }
    }

    /// Minimum number of blocks covering `size` bytes of user data. The
    /// first block contributes only its body; every further block is a whole
    /// block of capacity.
    fn blocks_needed(size: usize) -> usize {
        if size <= BODY_SIZE {
            return 1;
        }
        let rest = size - BODY_SIZE;
        1 + (rest - 1) / BLOCK_SIZE + 1
    }

    /// Formats the managed buffer as a blank heap.
    fn reset(&mut self) {
        let last = self.numblocks - 1;
        // Sentinel: heads both the used chain and the free list.
        self.set_nblock(0, 1);
        self.set_nfree(0, 1);
        self.set_pfree(0, 1);
        // One giant free run covering everything up to the terminator.
        self.set_nblock(1, last | FREELIST_MASK);
        self.set_nfree(1, 0);
        self.set_pblock(1, 0);
        self.set_pfree(1, 0);
        // Zero-size terminator.
        self.set_nblock(last, 0);
        self.set_pblock(last, 1);
    }

    /// Splits the run at `c` into `c..c + blocks` and `c + blocks..`, giving
    /// the tail `new_freemask` as its free flag. Free-list links are NOT
    /// touched here.
    fn split_block(&mut self, c: u32, blocks: u32, new_freemask: u32) {
        let next = self.nblock(c) & BLOCKNO_MASK;
        self.set_nblock(c + blocks, next | new_freemask);
        self.set_pblock(c + blocks, c);
        self.set_pblock(next, c + blocks);
        self.set_nblock(c, c + blocks);
    }

    fn disconnect_from_free_list(&mut self, c: u32) {
        let pf = self.pfree(c);
        let nf = self.nfree(c);
        self.set_nfree(pf, nf);
        self.set_pfree(nf, pf);
        self.set_nblock(c, self.nblock(c) & !FREELIST_MASK);
    }

    /// Merges the next run into `c` when it is free. `c`'s own header must
    /// not carry the free flag.
    fn assimilate_up(&mut self, c: u32) {
        let next = self.nblock(c);
        if self.nblock(next) & FREELIST_MASK != 0 {
            log::debug!("assimilating free block {next} upward into {c}");
            self.disconnect_from_free_list(next);
            let after = self.nblock(next) & BLOCKNO_MASK;
            self.set_pblock(after, c);
            self.set_nblock(c, after);
        }
    }

    /// Merges `c` into its (free) predecessor, returning the predecessor's
    /// index. `c`'s own header must not carry the free flag.
    fn assimilate_down(&mut self, c: u32, freemask: u32) -> u32 {
        let prev = self.pblock(c);
        let next = self.nblock(c);
        self.set_nblock(prev, next | freemask);
        self.set_pblock(next, prev);
        prev
    }

    /// Validates a caller-supplied pointer: in-heap, block-aligned, and
    /// present in the used chain as an allocated block. The chain walk is
    /// O(blocks), which is acceptable for cache-sized regions off the hot
    /// allocation path.
    fn check_pointer(&self, ptr: *mut u8) -> bool {
        self.ptr_in_heap(ptr)
            && self.ptr_is_block_aligned(ptr)
            && self.block_status(self.block_index_of(ptr)) == BlockStatus::Allocated
    }

    fn ptr_in_heap(&self, ptr: *mut u8) -> bool {
        let base = self.heap.addr();
        let ok = ptr.addr() >= base && ptr.addr() < base + self.numblocks as usize * BLOCK_SIZE;
        if !ok {
            log::error!("pointer {ptr:p} is out of heap bounds");
        }
        ok
    }

    fn ptr_is_block_aligned(&self, ptr: *mut u8) -> bool {
        let offset = ptr.addr() - self.heap.addr();
        let ok = offset >= HEADER_SIZE && (offset - HEADER_SIZE).is_multiple_of(BLOCK_SIZE);
        if !ok {
            log::error!("pointer {ptr:p} is not aligned with the block grid");
        }
        ok
    }

    /// Walks the used chain from the sentinel looking for `block`.
    fn block_status(&self, block: u32) -> BlockStatus {
        let mut cur = self.nblock(0) & BLOCKNO_MASK;
        while cur != 0 {
            if cur == block {
                return if self.nblock(cur) & FREELIST_MASK != 0 {
                    BlockStatus::Free
                } else {
                    BlockStatus::Allocated
                };
            }
            cur = self.nblock(cur) & BLOCKNO_MASK;
        }
        BlockStatus::BadBlock
    }

    fn block_index_of(&self, ptr: *mut u8) -> u32 {
        #[expect(clippy::cast_possible_truncation, reason = "bounded by numblocks")]
        let index = ((ptr.addr() - self.heap.addr()) / BLOCK_SIZE) as u32;
        index
    }

    fn data_ptr(&self, c: u32) -> *mut u8 {
        unsafe { (&raw mut (*self.block(c)).body).cast::<u8>() }
    }

    fn block(&self, c: u32) -> *mut Block {
        debug_assert!(c < self.numblocks);
        unsafe { self.heap.add(c as usize) }
    }

    fn nblock(&self, c: u32) -> u32 {
        unsafe { (*self.block(c)).header.next }
    }

    fn set_nblock(&mut self, c: u32, v: u32) {
        unsafe {
            (*self.block(c)).header.next = v;
        }
    }

    fn pblock(&self, c: u32) -> u32 {
        unsafe { (*self.block(c)).header.prev }
    }

    fn set_pblock(&mut self, c: u32, v: u32) {
        unsafe {
            (*self.block(c)).header.prev = v;
        }
    }

    fn nfree(&self, c: u32) -> u32 {
        unsafe { (*self.block(c)).body.next }
    }

    fn set_nfree(&mut self, c: u32, v: u32) {
        unsafe {
            (*self.block(c)).body.next = v;
        }
    }

    fn pfree(&self, c: u32) -> u32 {
        unsafe { (*self.block(c)).body.prev }
    }

    fn set_pfree(&mut self, c: u32, v: u32) {
        unsafe {
            (*self.block(c)).body.prev = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};

    use super::*;

    fn with_heap<F>(bytes: usize, test_fn: F)
    where
        F: FnOnce(&mut UmmAlloc),
    {
        unsafe {
            let layout = Layout::from_size_align(bytes, mem::align_of::<Block>()).unwrap();
            let memory = alloc(layout);
            memory.write_bytes(0x11, bytes);
            let mut umm = UmmAlloc::init(memory, bytes).unwrap();
            test_fn(&mut umm);
            dealloc(memory, layout);
        }
    }

    /// Bytes of the largest single allocation a fresh heap of `bytes` can
    /// serve: everything between the sentinel and the terminator.
    fn full_span(bytes: usize) -> usize {
        let usable_blocks = bytes / BLOCK_SIZE - 2;
        BODY_SIZE + (usable_blocks - 1) * BLOCK_SIZE
    }

    #[test]
    fn init_rejects_null() {
        let err = unsafe { UmmAlloc::init(ptr::null_mut(), 1024) };
        assert!(matches!(err, Err(InitError::NullMemory { .. })));
    }

    #[test]
    fn init_rejects_oversize_heap() {
        let mut buf = [0_u64; 8];
        let err = unsafe { UmmAlloc::init(buf.as_mut_ptr().cast(), UMM_MAX_HEAP_SIZE + 1) };
        assert!(matches!(err, Err(InitError::HeapTooLarge { .. })));
    }

    #[test]
    fn init_rejects_tiny_heap() {
        let mut buf = [0_u64; 8];
        let err = unsafe { UmmAlloc::init(buf.as_mut_ptr().cast(), 2 * BLOCK_SIZE) };
        assert!(matches!(err, Err(InitError::HeapTooSmall { .. })));
    }

    #[test]
    fn malloc_zero_returns_none() {
        with_heap(1024, |umm| {
            assert!(umm.malloc(0).is_none());
        });
    }

    #[test]
    fn malloc_and_free_roundtrip_reuses_block() {
        with_heap(1024, |umm| {
            let p1 = umm.malloc(100).unwrap();
            umm.free(p1);
            let p2 = umm.malloc(100).unwrap();
            assert_eq!(p1, p2);
        });
    }

    #[test]
    fn multiple_allocations_are_distinct_and_usable() {
        with_heap(1024, |umm| {
            let a = umm.malloc(40).unwrap();
            let b = umm.malloc(40).unwrap();
            let c = umm.malloc(40).unwrap();
            assert_ne!(a, b);
            assert_ne!(b, c);
            unsafe {
                a.write_bytes(0xaa, 40);
                b.write_bytes(0xbb, 40);
                c.write_bytes(0xcc, 40);
                for i in 0..40 {
                    assert_eq!(a.add(i).read(), 0xaa);
                    assert_eq!(b.add(i).read(), 0xbb);
                    assert_eq!(c.add(i).read(), 0xcc);
                }
            }
        });
    }

    #[test]
    fn calloc_zero_fills() {
        with_heap(1024, |umm| {
            let p = umm.malloc(64).unwrap();
            unsafe {
                p.write_bytes(0xff, 64);
            }
            umm.free(p);

            let p = umm.calloc(16, 4).unwrap();
            unsafe {
                for i in 0..64 {
                    assert_eq!(p.add(i).read(), 0);
                }
            }
        });
    }

    #[test]
    fn calloc_overflow_guard() {
        with_heap(1024, |umm| {
            assert!(umm.calloc(usize::MAX, usize::MAX).is_none());
            assert!(umm.calloc(usize::MAX, 2).is_none());
            // State must be untouched: the full span still allocates.
            assert!(umm.malloc(full_span(1024)).is_some());
        });
    }

    #[test]
    fn coalescing_merges_three_adjacent_runs() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            with_heap(1024, |umm| {
                let ptrs = [
                    umm.malloc(40).unwrap(),
                    umm.malloc(40).unwrap(),
                    umm.malloc(40).unwrap(),
                ];
                for i in order {
                    umm.free(ptrs[i]);
                }
                // All three spans coalesced back into the initial run, so
                // the whole heap is allocatable again.
                let p = umm.malloc(full_span(1024)).unwrap();
                assert_eq!(p, ptrs[0]);
            });
        }
    }

    #[test]
    fn allocate_entire_heap_and_exhaust() {
        with_heap(1024, |umm| {
            let span = full_span(1024);
            let p = umm.malloc(span).unwrap();
            assert!(umm.malloc(1).is_none());
            umm.free(p);
            assert!(umm.malloc(span).is_some());
        });
    }

    #[test]
    fn foreign_pointer_free_is_rejected() {
        with_heap(1024, |umm| {
            let baseline = umm.malloc(100).unwrap();
            umm.free(baseline);

            let mut outside = [0_u8; 16];
            umm.free(outside.as_mut_ptr());
            // Misaligned pointer inside the heap.
            let inside = umm.malloc(40).unwrap();
            umm.free(unsafe { inside.add(1) });
            umm.free(inside);

            // State unchanged: the same address comes back.
            assert_eq!(umm.malloc(100).unwrap(), baseline);
        });
    }

    #[test]
    fn double_free_is_rejected() {
        with_heap(1024, |umm| {
            let a = umm.malloc(40).unwrap();
            let b = umm.malloc(40).unwrap();
            umm.free(a);
            umm.free(a);
            umm.free(b);
            assert!(umm.malloc(full_span(1024)).is_some());
        });
    }

    #[test]
    fn foreign_pointer_realloc_is_rejected() {
        with_heap(1024, |umm| {
            let mut outside = [0_u8; 16];
            assert!(umm.realloc(outside.as_mut_ptr(), 64).is_none());
            assert!(umm.malloc(full_span(1024)).is_some());
        });
    }

    #[test]
    fn realloc_null_acts_as_malloc() {
        with_heap(1024, |umm| {
            let p = umm.realloc(ptr::null_mut(), 32).unwrap();
            umm.free(p);
        });
    }

    #[test]
    fn realloc_zero_acts_as_free() {
        with_heap(1024, |umm| {
            let p = umm.malloc(100).unwrap();
            assert!(umm.realloc(p, 0).is_none());
            assert!(umm.malloc(full_span(1024)).is_some());
        });
    }

    #[test]
    fn realloc_shrink_keeps_address_and_splits() {
        with_heap(1024, |umm| {
            let p = umm.malloc(200).unwrap();
            unsafe {
                p.write_bytes(0x5a, 200);
            }
            let q = umm.realloc(p, 40).unwrap();
            assert_eq!(p, q);
            unsafe {
                for i in 0..40 {
                    assert_eq!(q.add(i).read(), 0x5a);
                }
            }
            // The surplus blocks were returned to the free list.
            assert!(umm.malloc(100).is_some());
        });
    }

    #[test]
    fn realloc_grows_into_next_free_run() {
        with_heap(1024, |umm| {
            let a = umm.malloc(40).unwrap();
            let b = umm.malloc(40).unwrap();
            umm.free(b);
            unsafe {
                a.write_bytes(0x77, 40);
            }
            let grown = umm.realloc(a, 80).unwrap();
            assert_eq!(grown, a);
            unsafe {
                for i in 0..40 {
                    assert_eq!(grown.add(i).read(), 0x77);
                }
            }
        });
    }

    #[test]
    fn realloc_grows_into_prev_free_run_and_moves_data() {
        with_heap(1024, |umm| {
            let a = umm.malloc(40).unwrap();
            let b = umm.malloc(40).unwrap();
            let c = umm.malloc(40).unwrap();
            umm.free(a);
            unsafe {
                b.write_bytes(0x42, 40);
            }
            let grown = umm.realloc(b, 80).unwrap();
            assert_eq!(grown, a);
            unsafe {
                for i in 0..40 {
                    assert_eq!(grown.add(i).read(), 0x42);
                }
            }
            umm.free(grown);
            umm.free(c);
        });
    }

    #[test]
    fn realloc_relocates_when_neighbors_are_allocated() {
        with_heap(1024, |umm| {
            let a = umm.malloc(40).unwrap();
            let b = umm.malloc(40).unwrap();
            unsafe {
                a.write_bytes(0x33, 40);
            }
            let grown = umm.realloc(a, 200).unwrap();
            assert_ne!(grown, a);
            unsafe {
                for i in 0..40 {
                    assert_eq!(grown.add(i).read(), 0x33);
                }
            }
            umm.free(grown);
            umm.free(b);
        });
    }

    #[test]
    fn clean_discards_all_allocations() {
        with_heap(1024, |umm| {
            let _ = umm.malloc(40).unwrap();
            let _ = umm.malloc(40).unwrap();
            umm.clean();
            assert!(umm.malloc(full_span(1024)).is_some());
        });
    }
}
