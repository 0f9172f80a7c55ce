// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the page frame allocator (PFA): a bitmap tracking the
//! ownership of every 4 KiB physical page frame in the 4 GiB physical
//! address space.
//!
//! The PFA is the single source of truth for physical page ownership
//! (spec.md §3 invariants). It is process-wide state, guarded with
//! [`spin::Mutex`] and mutated only with interrupts disabled, in the
//! same style as [`storage::block::DEVICES`](../storage).

#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;

mod memory_map;

pub use memory_map::MemoryMapEntry;

use bitmap_index::Bitmap;
use lazy_static::lazy_static;
use pretty::Bytes;
use spin::Mutex;

/// The page size the PFA hands out frames in: 4 KiB.
///
pub const FRAME_SIZE: u32 = 4096;

/// The number of bytes in a 4 MiB large page, expressed in frames.
///
pub const FRAMES_PER_LARGE_PAGE: usize = 1024;

/// The total number of 4 KiB frames addressable in a 32-bit physical
/// address space: `4 GiB / 4 KiB = 1,048,576`.
///
pub const TOTAL_FRAMES: usize = 1_048_576;

/// A 4 KiB-aligned physical address.
///
pub type PhysAddr = u32;

lazy_static! {
    /// The kernel's process-wide page frame allocator.
    ///
    pub static ref PFA: Mutex<PageFrameAllocator> = Mutex::new(PageFrameAllocator::new());
}

/// Arbitrates ownership of physical memory in 4 KiB units, with a
/// large-page (4 MiB) allocation mode.
///
/// `PageFrameAllocator` owns a flat bitmap of [`TOTAL_FRAMES`] bits: bit
/// `n` set means frame `n` (at physical address `n * FRAME_SIZE`) is in
/// use. This mirrors the teacher's [`bitmap_index::Bitmap`]-backed
/// allocators, but as a single flat bitmap rather than a pool per
/// memory region, per spec.md §4.1.
///
pub struct PageFrameAllocator {
    bitmap: Bitmap,
    /// Frames permanently reserved by `initialise`: [0, 1 MiB) and the
    /// kernel's own physical image. `apply_memory_map` ORs these back in
    /// after recomputing availability from a loader-supplied map, so a
    /// map that (incorrectly) claims the kernel's own memory as
    /// available can never free it.
    reserved: Bitmap,
    last_alloc: usize,
    initialised: bool,
}

impl PageFrameAllocator {
    fn new() -> Self {
        PageFrameAllocator {
            bitmap: Bitmap::new_set(TOTAL_FRAMES),
            reserved: Bitmap::new_unset(TOTAL_FRAMES),
            last_alloc: 0,
            initialised: false,
        }
    }

    /// Performs the PFA's one-time initialisation: reserves [0, 1 MiB)
    /// for BIOS/hardware use, reserves the kernel's own physical image
    /// (rounded out to page boundaries), and marks every other frame
    /// free pending a call to [`apply_memory_map`](Self::apply_memory_map).
    ///
    /// Idempotent: subsequent calls are no-ops.
    ///
    pub fn initialise(&mut self, kernel_phys_start: PhysAddr, kernel_phys_end: PhysAddr) {
        if self.initialised {
            return;
        }

        self.bitmap = Bitmap::new_unset(TOTAL_FRAMES);
        self.reserved = Bitmap::new_unset(TOTAL_FRAMES);

        // [0, 1 MiB) is reserved for BIOS/hardware use.
        self.reserve_range(0, 0x10_0000);

        // The kernel's own physical image, rounded out to whole pages.
        let start = align_down(kernel_phys_start);
        let end = align_up(kernel_phys_end);
        self.reserve_range(start, end);

        // Frame 0 is never handed out: a zero physical address doubles
        // as a "no frame" sentinel elsewhere (ext2 block pointers,
        // MemFs's `addr: None`), per SPEC_FULL.md §4.1.
        self.reserve_range(0, FRAME_SIZE);

        self.bitmap_from_reserved();

        self.initialised = true;
    }

    fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = (start / FRAME_SIZE) as usize;
        let last = ((end.saturating_sub(1)) / FRAME_SIZE) as usize;
        if end <= start {
            return;
        }
        self.reserved.set_range(first, last - first + 1);
    }

    fn bitmap_from_reserved(&mut self) {
        for i in 0..TOTAL_FRAMES {
            if self.reserved.get(i) {
                self.bitmap.set(i);
            }
        }
    }

    /// Overlays a loader-supplied memory map onto the bitmap.
    ///
    /// Per spec.md §4.1: first clears the bitmap for every `available`
    /// region, then marks every non-available region used, then ORs in
    /// the permanently-reserved bits from [`initialise`](Self::initialise).
    /// This ordering is required because loader-supplied maps may list
    /// overlapping available and reserved entries for the same region;
    /// "non-available wins" and "kernel-reserved always wins" are both
    /// preserved by applying them last.
    ///
    /// Idempotent: applying the same entries twice leaves the bitmap
    /// unchanged.
    ///
    pub fn apply_memory_map(&mut self, entries: &[MemoryMapEntry]) {
        for entry in entries.iter().filter(|e| e.available) {
            self.clear_range_saturating(entry.base, entry.length);
        }
        for entry in entries.iter().filter(|e| !e.available) {
            self.set_range_saturating(entry.base, entry.length);
        }
        self.bitmap_from_reserved();
    }

    fn clear_range_saturating(&mut self, base: u64, length: u64) {
        let (first, count) = frame_range(base, length);
        for i in first..first + count {
            if i < TOTAL_FRAMES {
                self.bitmap.unset(i);
            }
        }
    }

    fn set_range_saturating(&mut self, base: u64, length: u64) {
        let (first, count) = frame_range(base, length);
        for i in first..first + count {
            if i < TOTAL_FRAMES {
                self.bitmap.set(i);
            }
        }
    }

    /// Allocates a single 4 KiB frame, or, if `large` is set, 1024
    /// contiguous frames aligned to a 4 MiB boundary.
    ///
    /// The search starts at `last_alloc + 1` (rounded up to a 4 MiB
    /// boundary for large allocations) and wraps around once. Returns
    /// `None` if no free frame (or aligned run, for large allocations)
    /// exists.
    ///
    pub fn allocate(&mut self, large: bool) -> Option<PhysAddr> {
        if large {
            return self.allocate_large();
        }

        let start = (self.last_alloc + 1) % TOTAL_FRAMES;
        for offset in 0..TOTAL_FRAMES {
            let i = (start + offset) % TOTAL_FRAMES;
            if !self.bitmap.get(i) {
                self.bitmap.set(i);
                self.last_alloc = i;
                return Some((i as u32) * FRAME_SIZE);
            }
        }

        None
    }

    fn allocate_large(&mut self) -> Option<PhysAddr> {
        let aligned_start = align_up_frames(self.last_alloc + 1, FRAMES_PER_LARGE_PAGE);
        let num_windows = TOTAL_FRAMES / FRAMES_PER_LARGE_PAGE;
        let start_window = aligned_start / FRAMES_PER_LARGE_PAGE;

        for offset in 0..num_windows {
            let window = (start_window + offset) % num_windows;
            let first = window * FRAMES_PER_LARGE_PAGE;
            if !self.bitmap.any_set_in_range(first, FRAMES_PER_LARGE_PAGE) {
                self.bitmap.set_range(first, FRAMES_PER_LARGE_PAGE);
                self.last_alloc = first;
                return Some((first as u32) * FRAME_SIZE);
            }
        }

        None
    }

    /// Frees the frame (or, if `large`, the 1024-frame large-page
    /// window) at `phys_addr`.
    ///
    /// Freeing a frame that was never allocated is a silent no-op: the
    /// caller is trusted, per spec.md §4.1.
    ///
    pub fn free(&mut self, phys_addr: PhysAddr, large: bool) {
        let first = (phys_addr / FRAME_SIZE) as usize;
        let count = if large { FRAMES_PER_LARGE_PAGE } else { 1 };
        if first + count > TOTAL_FRAMES {
            return;
        }
        self.bitmap.unset_range(first, count);
    }

    /// Returns whether `addr` (or, for `large`, any frame in its 4 MiB
    /// window) is currently allocated.
    ///
    pub fn check(&self, addr: PhysAddr, large: bool) -> bool {
        let first = (addr / FRAME_SIZE) as usize;
        if large {
            let window = first - (first % FRAMES_PER_LARGE_PAGE);
            self.bitmap.any_set_in_range(window, FRAMES_PER_LARGE_PAGE)
        } else {
            first < TOTAL_FRAMES && self.bitmap.get(first)
        }
    }

    /// Returns the number of frames currently free, for diagnostics.
    ///
    pub fn free_frames(&self) -> usize {
        self.bitmap.num_unset()
    }

    /// Logs the current allocator state to the serial console.
    ///
    pub fn debug(&self) {
        let free = self.free_frames() as u64 * FRAME_SIZE as u64;
        serial::println!("physmem: {} free of 4 GiB", Bytes::from_u64(free));
    }
}

const fn align_down(addr: PhysAddr) -> PhysAddr {
    addr & !(FRAME_SIZE - 1)
}

const fn align_up(addr: PhysAddr) -> PhysAddr {
    align_down(addr.wrapping_add(FRAME_SIZE - 1))
}

fn align_up_frames(frame: usize, align: usize) -> usize {
    (frame + align - 1) / align * align
}

fn frame_range(base: u64, length: u64) -> (usize, usize) {
    let frame_size = FRAME_SIZE as u64;
    let start = base / frame_size;
    let end = (base + length + frame_size - 1) / frame_size;
    (start as usize, (end - start) as usize)
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh() -> PageFrameAllocator {
        let mut pfa = PageFrameAllocator::new();
        pfa.initialise(0x0010_0000, 0x0020_0000);
        pfa
    }

    #[test]
    fn allocate_then_free_is_available_again() {
        let mut pfa = fresh();
        let before = pfa.free_frames();
        let frame = pfa.allocate(false).expect("frame available");
        assert!(pfa.check(frame, false));
        pfa.free(frame, false);
        assert!(!pfa.check(frame, false));
        assert_eq!(pfa.free_frames(), before);
    }

    #[test]
    fn allocate_never_returns_a_set_bit() {
        let mut pfa = fresh();
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..64 {
            let frame = pfa.allocate(false).unwrap();
            assert!(!seen.contains(&frame), "frame {frame:#x} allocated twice");
            seen.push(frame);
        }
    }

    #[test]
    fn large_allocation_is_aligned_and_marks_all_constituent_frames() {
        let mut pfa = fresh();
        let frame = pfa.allocate(true).expect("large frame available");
        assert_eq!(frame % (FRAMES_PER_LARGE_PAGE as u32 * FRAME_SIZE), 0);
        for i in 0..FRAMES_PER_LARGE_PAGE {
            assert!(pfa.bitmap.get((frame / FRAME_SIZE) as usize + i));
        }
    }

    #[test]
    fn apply_memory_map_is_idempotent() {
        let mut pfa = fresh();
        let entries = [
            MemoryMapEntry {
                base: 0x0040_0000,
                length: 0x0010_0000,
                available: true,
            },
            MemoryMapEntry {
                base: 0x0050_0000,
                length: 0x0010_0000,
                available: false,
            },
        ];

        pfa.apply_memory_map(&entries);
        let after_first = pfa.free_frames();
        pfa.apply_memory_map(&entries);
        assert_eq!(pfa.free_frames(), after_first);
    }

    #[test]
    fn apply_memory_map_cannot_free_kernel_memory() {
        let mut pfa = fresh();
        // A (buggy) loader claims the kernel's own range is available.
        let entries = [MemoryMapEntry {
            base: 0x0000_0000,
            length: 0x0100_0000,
            available: true,
        }];
        pfa.apply_memory_map(&entries);
        assert!(pfa.check(0x0010_0000, false));
    }

    #[test]
    fn frame_zero_is_never_allocated() {
        let mut pfa = fresh();
        for _ in 0..8 {
            let frame = pfa.allocate(false).unwrap();
            assert_ne!(frame, 0);
        }
    }

    #[test]
    fn initialise_is_idempotent() {
        let mut pfa = fresh();
        let before = pfa.free_frames();
        pfa.initialise(0x0030_0000, 0x0040_0000);
        assert_eq!(pfa.free_frames(), before);
    }
}
