// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! This crate contains various constants describing a [region of virtual
//! memory](VirtAddrRange) that is used for a prescribed purpose:
//!
//! - [`NULL_PAGE`]: The first virtual page, reserved so that null pointer
//!   dereferences fault.
//! - [`USERSPACE`]: The range available to userspace processes, `[0, KERNEL_VIRTUAL_BASE)`.
//! - [`KERNEL_SPACE`]: The range reserved for the kernel, `[KERNEL_VIRTUAL_BASE, 4 GiB)`.
//! - [`SCRATCH_PAGE`]: The single virtual page the PDT uses to bootstrap a
//!   freshly-allocated page table (see `PDT::allocate` in the `virtmem` crate).
//! - [`KERNEL_HEAP`]: The region backing the kernel's heap allocator.
//!
//! The memory layout is summarised below:
//!
//! | Region                  |    Start address |   Last address |      Size |
//! | ----------------------- | ----------------: | --------------: | --------: |
//! | [`NULL_PAGE`]           |             `0x0` |         `0xfff` |     4 KiB |
//! | [`USERSPACE`]           |          `0x1000` |  `0xbfff_ffff`  |   < 3 GiB |
//! | [`KERNEL_VIRTUAL_BASE`] |     `0xc000_0000` |               — |         — |
//! | [`KERNEL_HEAP`]         |     `0xc020_0000` |  `0xc027_ffff` |   512 KiB |
//! | [`SCRATCH_PAGE`]        |     `0xc02f_f000` |  `0xc02f_ffff` |     4 KiB |
//! | [`KERNEL_SPACE`]        |     `0xc000_0000` |  `0xffff_ffff` |     1 GiB |

#![no_std]

mod addr_range;

pub use crate::addr_range::VirtAddrRange;

/// The page size used throughout the 32-bit paging structures: 4 KiB.
///
pub const PAGE_SIZE: u32 = 4096;

/// The size of a large (4 MiB) page, mapped directly from a PDE.
///
pub const LARGE_PAGE_SIZE: u32 = 4 * 1024 * 1024;

/// The virtual address above which the kernel resides.
///
/// Every process's page descriptor table maps this address and above
/// identically to the canonical kernel mappings; user space spans
/// `[0, KERNEL_VIRTUAL_BASE)`.
///
pub const KERNEL_VIRTUAL_BASE: u32 = 0xc000_0000;

/// The first virtual page, which is reserved to ensure null pointer
/// dereferences cause a page fault rather than reading garbage.
///
pub const NULL_PAGE: VirtAddrRange = VirtAddrRange::new(0x0, 0xfff);

/// The range of virtual memory available to userspace processes.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(0x1000, KERNEL_VIRTUAL_BASE - 1);

/// The range of virtual memory reserved for the kernel.
///
/// Kernel-space PDEs are identical in every process's PDT.
///
pub const KERNEL_SPACE: VirtAddrRange = VirtAddrRange::new(KERNEL_VIRTUAL_BASE, 0xffff_ffff);

/// The region backing the kernel's heap allocator.
///
/// Starts a full 2 MiB above [`KERNEL_VIRTUAL_BASE`] rather than
/// immediately above it: `boot.s` identity-maps
/// `[__kernel_phys_start, __kernel_phys_end)` into this same 4 MiB PDE,
/// and that range's lower bound (1 MiB) would otherwise land inside
/// this region's first page, since the kernel image is loaded at 1 MiB
/// physically and linked with a matching virtual offset. The extra
/// MiB of headroom keeps this region clear of the image for any
/// realistic kernel size.
///
pub const KERNEL_HEAP: VirtAddrRange = VirtAddrRange::new(0xc020_0000, 0xc027_ffff);

/// The single virtual page reserved process-wide for the PDT to
/// temporarily map a freshly-allocated page table so its entries can
/// be initialised before it is linked into the owning PDT.
///
/// This page may not be used for any other purpose; attempts to map
/// over it through `PDT::allocate` are rejected.
///
pub const SCRATCH_PAGE: VirtAddrRange = VirtAddrRange::new(0xc02f_f000, 0xc02f_ffff);

/// A single virtual page reserved for the `multiboot` crate to
/// temporarily map whatever physical structure (the info block, a
/// string, a module) it is currently reading out of Multiboot data.
///
/// Distinct from [`SCRATCH_PAGE`], which is reserved for the PDT's own
/// internal bookkeeping.
///
pub const MULTIBOOT_WINDOW: VirtAddrRange = VirtAddrRange::new(0xc02f_e000, 0xc02f_efff);

/// The top of the initial kernel stack, one page below the scratch page.
///
pub const KERNEL_STACK_TOP: u32 = MULTIBOOT_WINDOW.start();

/// The top of the initial user stack window: one page immediately below
/// [`KERNEL_VIRTUAL_BASE`], per spec.md §4.7 "Launch" step 2.
///
pub const USER_STACK_TOP: u32 = KERNEL_VIRTUAL_BASE;

/// The largest permitted size of a process's user stack.
///
/// This is a generous default; `Process::set_user_stack` enforces it as
/// the upper bound on stack growth.
///
pub const MAX_USER_STACK: u32 = 8 * 1024 * 1024;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions_do_not_overlap() {
        let regions = [
            (NULL_PAGE, "null page"),
            (USERSPACE, "userspace"),
            (KERNEL_SPACE, "kernel space"),
        ];

        for (i, (r1, n1)) in regions.iter().enumerate() {
            for (j, (r2, n2)) in regions.iter().enumerate() {
                if i == j {
                    continue;
                }
                assert!(!r1.contains_addr(r2.start()), "{n1} overlaps with {n2}");
                assert!(!r1.contains_addr(r2.end()), "{n1} overlaps with {n2}");
            }
        }

        assert!(KERNEL_SPACE.contains(&KERNEL_HEAP));
        assert!(KERNEL_SPACE.contains(&SCRATCH_PAGE));
        assert!(KERNEL_SPACE.contains(&MULTIBOOT_WINDOW));
        assert!(!SCRATCH_PAGE.contains_addr(MULTIBOOT_WINDOW.start()));
    }

    #[test]
    fn userspace_ends_below_kernel() {
        assert_eq!(USERSPACE.end() + 1, KERNEL_VIRTUAL_BASE);
    }
}
