// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Maps and initialises the kernel's heap.

use crate::{Error, Flags, Pdt};
use linked_list_allocator::LockedHeap;
use memlayout::{KERNEL_HEAP, PAGE_SIZE};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Maps [`memlayout::KERNEL_HEAP`] page by page and hands the resulting
/// region to the global allocator.
///
/// Must be called exactly once, after the kernel's [`Pdt`] has been
/// loaded and its scratch page table reserved.
///
pub fn init_heap(kernel: &mut Pdt) -> Result<(), Error> {
    let mut virt = KERNEL_HEAP.start();
    let end = KERNEL_HEAP.start() + KERNEL_HEAP.size() as u32;
    while virt < end {
        kernel.allocate(virt, Flags::PRESENT | Flags::WRITABLE, false)?;
        virt += PAGE_SIZE;
    }

    unsafe {
        ALLOCATOR
            .lock()
            .init(KERNEL_HEAP.start() as *mut u8, KERNEL_HEAP.size() as usize);
    }

    Ok(())
}
