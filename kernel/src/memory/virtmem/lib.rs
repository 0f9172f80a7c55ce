// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements 32-bit two-level paging: the page descriptor table (PDT)
//! and its page tables (PTs), plus the kernel's heap allocator built on
//! top of them.
//!
//! Every process owns a [`Pdt`]: a 4 KiB directory of 1024 page
//! directory entries (PDEs), each either pointing at a 4 KiB-aligned
//! page table of 1024 page table entries (PTEs), or, if marked
//! [`Flags::LARGE`], mapping a 4 MiB region directly.
//!
//! Kernel-space PDEs (covering [`memlayout::KERNEL_SPACE`]) are
//! identical in every `Pdt`; only the user-space PDEs
//! (`[0, KERNEL_VIRTUAL_BASE)`) vary between processes.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod heap;

pub use heap::init_heap;

use bitflags::bitflags;
use memlayout::{KERNEL_VIRTUAL_BASE, PAGE_SIZE, SCRATCH_PAGE};
use physmem::PFA;

/// The index of the PDE that recursively maps the PDT into its own
/// address space: `entries[RECURSIVE_SLOT]` always points at the PDT's
/// own physical frame. This makes the currently-loaded PDT and its PTs
/// addressable at fixed virtual addresses without any other bookkeeping.
///
const RECURSIVE_SLOT: usize = 1023;

/// The virtual address at which the currently-loaded PDT is visible,
/// via the recursive mapping.
///
const RECURSIVE_PDT_ADDR: u32 = 0xffff_f000;

/// The virtual base address at which the currently-loaded PDT's page
/// tables are visible, via the recursive mapping: PT `i` is visible at
/// `RECURSIVE_PT_BASE + i * PAGE_SIZE`.
///
const RECURSIVE_PT_BASE: u32 = 0xffc0_0000;

bitflags! {
    /// Configuration bits stored in the low 12 bits of a PDE or PTE.
    ///
    pub struct Flags: u32 {
        /// The entry points at a valid frame (or page table).
        ///
        const PRESENT = 1 << 0;

        /// The mapped region can be written to. Without this bit, writes
        /// fault.
        ///
        const WRITABLE = 1 << 1;

        /// The mapped region is accessible from user mode (ring 3).
        /// Without this bit, only the kernel can access it.
        ///
        const USER_ACCESS = 1 << 2;

        /// Writes go straight to memory rather than through the cache.
        ///
        const WRITE_THROUGH = 1 << 3;

        /// The mapped region is never cached.
        ///
        const DISABLE_CACHING = 1 << 4;

        /// Set by the CPU the first time the entry is used for a
        /// translation.
        ///
        const ACCESSED = 1 << 5;

        /// Set by the CPU the first time the mapped region is written
        /// to. Only meaningful for PTEs.
        ///
        const DIRTY = 1 << 6;

        /// Only meaningful for PDEs: the entry maps a 4 MiB region
        /// directly, rather than pointing at a page table.
        ///
        const LARGE = 1 << 7;
    }
}

/// Describes why a paging operation could not be completed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Physical memory is exhausted.
    ///
    OutOfMemory,

    /// The requested virtual address is already mapped.
    ///
    AlreadyMapped,

    /// The requested virtual address is not mapped.
    ///
    NotMapped,

    /// The requested virtual address falls inside [`SCRATCH_PAGE`],
    /// which may never be mapped for any other purpose.
    ///
    ScratchPageReserved,
}

/// A page table: 1024 page table entries, each a 4 KiB-aligned physical
/// frame plus [`Flags`].
///
#[repr(C, align(4096))]
struct PageTable {
    entries: [u32; 1024],
}

impl PageTable {
    const fn empty() -> Self {
        PageTable { entries: [0; 1024] }
    }
}

/// A 32-bit two-level page descriptor table: the root of one process's
/// (or the kernel's) virtual address space.
///
/// `Pdt` stores only the physical address of its directory frame.
/// Reading or writing its entries (or those of its page tables) goes
/// through [`RECURSIVE_SLOT`] when this is the loaded PDT, or through
/// [`SCRATCH_PAGE`] otherwise.
///
pub struct Pdt {
    phys_addr: u32,
}

/// Returns whether `pdt_phys` is the directory currently loaded into
/// CR3.
///
fn is_loaded(pdt_phys: u32) -> bool {
    current_cr3() == pdt_phys
}

fn current_cr3() -> u32 {
    let cr3: u32;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3);
    }
    cr3 & !0xfff
}

fn load_cr3(pdt_phys: u32) {
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pdt_phys);
    }
}

fn invlpg(virt: u32) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt);
    }
}

impl Pdt {
    /// Allocates a fresh, zeroed directory frame and wraps it, with no
    /// kernel mappings installed yet.
    ///
    fn new_empty() -> Result<Pdt, Error> {
        let phys = PFA.lock().allocate(false).ok_or(Error::OutOfMemory)?;
        zero_frame(phys);
        Ok(Pdt { phys_addr: phys })
    }

    /// Builds the kernel's root PDT: a fresh directory, recursively
    /// mapped to itself, loaded into CR3.
    ///
    /// Must be called exactly once, early in boot, before any call to
    /// [`allocate`](Self::allocate) or [`map`](Self::map).
    ///
    pub fn new_kernel() -> Result<Pdt, Error> {
        let pdt = Self::new_empty()?;
        set_entry_raw(
            pdt.phys_addr,
            RECURSIVE_SLOT,
            pdt.phys_addr,
            Flags::PRESENT | Flags::WRITABLE,
        );
        pdt.load();
        Ok(pdt)
    }

    /// Wraps the directory already loaded into CR3, without allocating
    /// or modifying anything.
    ///
    /// Used once, at the very start of boot, to hand the page directory
    /// `boot.s` built in assembly (already recursively mapped at
    /// [`RECURSIVE_SLOT`], already active) over to Rust. Calling
    /// [`new_kernel`](Self::new_kernel) at that point would be unsound:
    /// building a second directory from scratch requires
    /// [`SCRATCH_PAGE`] to already be reachable through the *currently
    /// loaded* directory, which is exactly the chicken-and-egg problem
    /// the assembly trampoline exists to avoid.
    ///
    pub fn from_loaded() -> Pdt {
        Pdt {
            phys_addr: current_cr3(),
        }
    }

    /// Loads this directory into CR3, making it the active address
    /// space.
    ///
    pub fn load(&self) {
        load_cr3(self.phys_addr);
    }

    /// Returns the physical address of this PDT's directory frame.
    ///
    pub fn phys_addr(&self) -> u32 {
        self.phys_addr
    }

    /// Returns whether this is the PDT currently loaded into CR3.
    ///
    pub fn is_active(&self) -> bool {
        is_loaded(self.phys_addr)
    }

    /// Ensures `virt` is mapped, allocating a fresh physical frame (or,
    /// if `large`, a 4 MiB-aligned run of frames) to back it.
    ///
    /// Returns [`Error::AlreadyMapped`] if `virt` is already mapped, and
    /// [`Error::ScratchPageReserved`] if `virt` falls inside
    /// [`SCRATCH_PAGE`].
    ///
    pub fn allocate(&mut self, virt: u32, flags: Flags, large: bool) -> Result<(), Error> {
        if SCRATCH_PAGE.contains_addr(virt) {
            return Err(Error::ScratchPageReserved);
        }
        let frame = PFA.lock().allocate(large).ok_or(Error::OutOfMemory)?;
        match self.map(virt, frame, flags, large) {
            Ok(()) => Ok(()),
            Err(e) => {
                PFA.lock().free(frame, large);
                Err(e)
            }
        }
    }

    /// Maps `virt` to the caller-supplied physical address `phys`.
    ///
    /// Unlike [`allocate`](Self::allocate), the physical frame is not
    /// owned by the PDT: [`unmap`](Self::unmap) will not free it. This
    /// is used for MMIO windows and Multiboot module regions, where the
    /// backing memory is owned by something else.
    ///
    pub fn map(&mut self, virt: u32, phys: u32, flags: Flags, large: bool) -> Result<(), Error> {
        if SCRATCH_PAGE.contains_addr(virt) {
            return Err(Error::ScratchPageReserved);
        }

        let pd_index = pd_index(virt);

        if large {
            let existing = self.read_entry(pd_index);
            if existing & Flags::PRESENT.bits() != 0 {
                return Err(Error::AlreadyMapped);
            }
            self.write_entry(pd_index, phys, flags | Flags::PRESENT | Flags::LARGE);
            invlpg(virt);
            return Ok(());
        }

        let pt_phys = self.ensure_page_table(pd_index)?;
        let pt_index = pt_index(virt);

        self.with_foreign_table(pt_phys, |table| {
            if table.entries[pt_index] & Flags::PRESENT.bits() != 0 {
                return Err(Error::AlreadyMapped);
            }
            table.entries[pt_index] = (phys & !0xfff) | (flags | Flags::PRESENT).bits();
            Ok(())
        })?;
        invlpg(virt);
        Ok(())
    }

    /// Unmaps `virt`, returning its backing frame to the page frame
    /// allocator.
    ///
    pub fn unmap(&mut self, virt: u32) -> Result<(), Error> {
        self.unmap_inner(virt, true)
    }

    /// Like [`unmap`](Self::unmap), but never frees the backing frame,
    /// regardless of how it was mapped. Used to tear down windows
    /// installed with [`map`](Self::map), whose frames are owned
    /// elsewhere.
    ///
    pub fn unmap_external(&mut self, virt: u32) -> Result<(), Error> {
        self.unmap_inner(virt, false)
    }

    fn unmap_inner(&mut self, virt: u32, free_backing: bool) -> Result<(), Error> {
        let pd_index = pd_index(virt);
        let pde = self.read_entry(pd_index);
        if pde & Flags::PRESENT.bits() == 0 {
            return Err(Error::NotMapped);
        }

        if pde & Flags::LARGE.bits() != 0 {
            if free_backing {
                PFA.lock().free(pde & !0xfff, true);
            }
            self.write_entry(pd_index, 0, Flags::empty());
            invlpg(virt);
            return Ok(());
        }

        let pt_phys = pde & !0xfff;
        let pt_index = pt_index(virt);
        let freed = self.with_foreign_table(pt_phys, |table| {
            let entry = table.entries[pt_index];
            if entry & Flags::PRESENT.bits() == 0 {
                return Err(Error::NotMapped);
            }
            table.entries[pt_index] = 0;
            Ok(entry & !0xfff)
        })?;
        if free_backing {
            PFA.lock().free(freed, false);
        }
        invlpg(virt);
        Ok(())
    }

    /// Returns the physical address `virt` translates to, or `None` if
    /// it is not currently mapped.
    ///
    pub fn translate(&self, virt: u32) -> Option<u32> {
        let pd_index = pd_index(virt);
        let pde = self.read_entry(pd_index);
        if pde & Flags::PRESENT.bits() == 0 {
            return None;
        }
        if pde & Flags::LARGE.bits() != 0 {
            let base = pde & !(memlayout::LARGE_PAGE_SIZE - 1);
            return Some(base + (virt % memlayout::LARGE_PAGE_SIZE));
        }

        let pt_phys = pde & !0xfff;
        let pt_index = pt_index(virt);
        let pte = self
            .with_foreign_table(pt_phys, |table| Ok(table.entries[pt_index]))
            .ok()?;
        if pte & Flags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pte & !0xfff) + (virt % PAGE_SIZE))
    }

    /// Ensures a page table exists to back `pd_index`, allocating and
    /// zeroing one if necessary, and returns its physical address.
    ///
    fn ensure_page_table(&mut self, pd_index: usize) -> Result<u32, Error> {
        let existing = self.read_entry(pd_index);
        if existing & Flags::PRESENT.bits() != 0 {
            if existing & Flags::LARGE.bits() != 0 {
                return Err(Error::AlreadyMapped);
            }
            return Ok(existing & !0xfff);
        }

        let pt_phys = PFA.lock().allocate(false).ok_or(Error::OutOfMemory)?;
        zero_frame(pt_phys);
        self.write_entry(
            pd_index,
            pt_phys,
            Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESS,
        );
        Ok(pt_phys)
    }

    /// Reads PDE `index` from this directory.
    ///
    fn read_entry(&self, index: usize) -> u32 {
        if is_loaded(self.phys_addr) {
            let pdt = RECURSIVE_PDT_ADDR as *const u32;
            unsafe { pdt.add(index).read() }
        } else {
            with_scratch(self.phys_addr, |dir| dir.entries[index])
        }
    }

    /// Writes PDE `index` in this directory.
    ///
    fn write_entry(&self, index: usize, phys: u32, flags: Flags) {
        let value = (phys & !0xfff) | flags.bits();
        if is_loaded(self.phys_addr) {
            let pdt = RECURSIVE_PDT_ADDR as *mut u32;
            unsafe { pdt.add(index).write(value) };
        } else {
            with_scratch_mut(self.phys_addr, |dir| dir.entries[index] = value);
        }
    }

    /// Runs `f` with mutable access to the page table at `pt_phys`,
    /// using the recursive mapping if it belongs to the
    /// currently-loaded directory, or [`SCRATCH_PAGE`] otherwise.
    ///
    fn with_foreign_table<R>(
        &self,
        pt_phys: u32,
        f: impl FnOnce(&mut PageTable) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if is_loaded(self.phys_addr) {
            let pd_index = pd_index_for_pt(pt_phys);
            let table = (RECURSIVE_PT_BASE + (pd_index as u32) * PAGE_SIZE) as *mut PageTable;
            f(unsafe { &mut *table })
        } else {
            with_scratch_mut(pt_phys, f)
        }
    }

    /// Deep-copies this PDT's user-space mappings into a freshly
    /// allocated directory: every present user-space page is copied
    /// into a new physical frame with identical content, rather than
    /// shared or marked copy-on-write.
    ///
    /// Kernel-space PDEs are shared by value, not by reference: the
    /// new directory's kernel-space entries are bit-for-bit copies of
    /// this one's, since every process's kernel mappings agree.
    ///
    pub fn duplicate_user_space(&self) -> Result<Pdt, Error> {
        let child = Self::clone_kernel_space()?;
        for pd_index in 0..pd_index(KERNEL_VIRTUAL_BASE) {
            let pde = self.read_entry(pd_index);
            if pde & Flags::PRESENT.bits() == 0 {
                continue;
            }
            if pde & Flags::LARGE.bits() != 0 {
                let src_phys = pde & !(memlayout::LARGE_PAGE_SIZE - 1);
                let dst_phys = PFA.lock().allocate(true).ok_or(Error::OutOfMemory)?;
                copy_frame(src_phys, dst_phys, memlayout::LARGE_PAGE_SIZE);
                let flags = Flags::from_bits_truncate(pde & 0xfff);
                child.write_entry(pd_index, dst_phys, flags);
                continue;
            }

            let src_pt_phys = pde & !0xfff;
            let dst_pt_phys = PFA.lock().allocate(false).ok_or(Error::OutOfMemory)?;
            zero_frame(dst_pt_phys);
            let pde_flags = Flags::from_bits_truncate(pde & 0xfff);
            child.write_entry(pd_index, dst_pt_phys, pde_flags);

            for pt_index in 0..1024 {
                let pte = with_scratch(src_pt_phys, |t| t.entries[pt_index]);
                if pte & Flags::PRESENT.bits() == 0 {
                    continue;
                }
                let src_frame = pte & !0xfff;
                let dst_frame = PFA.lock().allocate(false).ok_or(Error::OutOfMemory)?;
                copy_frame(src_frame, dst_frame, PAGE_SIZE);
                let pte_flags = pte & 0xfff;
                with_scratch_mut(dst_pt_phys, |t| {
                    t.entries[pt_index] = (dst_frame & !0xfff) | pte_flags
                });
            }
        }
        Ok(child)
    }

    /// Builds a fresh directory with the kernel-space mappings but an
    /// empty user space, suitable for a process that has not yet had a
    /// binary loaded into it (or is being built up by `fork`).
    ///
    pub fn new_process() -> Result<Pdt, Error> {
        Self::clone_kernel_space()
    }

    /// Builds a fresh directory whose kernel-space PDEs are copied from
    /// the currently loaded directory, and whose user-space PDEs are
    /// all clear.
    ///
    fn clone_kernel_space() -> Result<Pdt, Error> {
        let child = Self::new_empty()?;
        set_entry_raw(
            child.phys_addr,
            RECURSIVE_SLOT,
            child.phys_addr,
            Flags::PRESENT | Flags::WRITABLE,
        );
        let kernel_pdt = Pdt { phys_addr: current_cr3() };
        for pd_index in pd_index(KERNEL_VIRTUAL_BASE)..RECURSIVE_SLOT {
            let pde = kernel_pdt.read_entry(pd_index);
            if pde != 0 {
                set_entry_raw(
                    child.phys_addr,
                    pd_index,
                    pde & !0xfff,
                    Flags::from_bits_truncate(pde & 0xfff),
                );
            }
        }
        Ok(child)
    }

    /// Replaces this directory's user-space PDEs with `other`'s,
    /// without touching kernel space. After this call,
    /// [`translate`](Self::translate) agrees between `self` and `other`
    /// for every user-space address.
    ///
    /// This does not take ownership of `other`'s frames: the caller is
    /// expected to discard `other`'s directory frame (not the user
    /// pages it pointed at, which now belong to `self`) afterwards.
    ///
    pub fn update_user_space(&mut self, other: &Pdt) {
        for pd_index in 0..pd_index(KERNEL_VIRTUAL_BASE) {
            let pde = other.read_entry(pd_index);
            self.write_entry(pd_index, pde & !0xfff, Flags::from_bits_truncate(pde & 0xfff));
        }
        if is_loaded(self.phys_addr) {
            self.load();
        }
    }

    /// Frees every user-space page and page table currently mapped,
    /// leaving kernel space untouched and the directory itself intact
    /// (and empty in its user half).
    ///
    pub fn clean_user_space(&mut self) {
        for pd_index in 0..pd_index(KERNEL_VIRTUAL_BASE) {
            let pde = self.read_entry(pd_index);
            if pde & Flags::PRESENT.bits() == 0 {
                continue;
            }
            if pde & Flags::LARGE.bits() != 0 {
                PFA.lock().free(pde & !(memlayout::LARGE_PAGE_SIZE - 1), true);
                self.write_entry(pd_index, 0, Flags::empty());
                continue;
            }
            let pt_phys = pde & !0xfff;
            for pt_index in 0..1024 {
                let pte = with_scratch(pt_phys, |t| t.entries[pt_index]);
                if pte & Flags::PRESENT.bits() != 0 {
                    PFA.lock().free(pte & !0xfff, false);
                }
            }
            PFA.lock().free(pt_phys, false);
            self.write_entry(pd_index, 0, Flags::empty());
        }
    }

    /// Consumes this directory: frees every user-space mapping (as
    /// [`clean_user_space`](Self::clean_user_space)) and then the
    /// directory's own frame.
    ///
    /// Must not be called on the directory currently loaded into CR3.
    ///
    pub fn free_user_space(mut self) {
        debug_assert!(!is_loaded(self.phys_addr));
        self.clean_user_space();
        PFA.lock().free(self.phys_addr, false);
    }
}

/// Returns the PDE index covering virtual address `virt`.
///
fn pd_index(virt: u32) -> usize {
    (virt >> 22) as usize
}

/// Returns the PTE index within its page table covering `virt`.
///
fn pt_index(virt: u32) -> usize {
    ((virt >> 12) & 0x3ff) as usize
}

/// Finds which PDE in the loaded directory points at `pt_phys`, so the
/// recursive mapping can expose it. Only valid while that directory is
/// the one loaded into CR3.
///
/// `boot.s` gives PDE 0 and PDE 768 distinct page tables precisely so
/// this scan never has to choose between two PDEs pointing at the same
/// physical table.
///
fn pd_index_for_pt(pt_phys: u32) -> usize {
    let pdt = RECURSIVE_PDT_ADDR as *const u32;
    for i in 0..RECURSIVE_SLOT {
        let entry = unsafe { pdt.add(i).read() };
        if entry & Flags::PRESENT.bits() != 0 && entry & !0xfff == pt_phys {
            return i;
        }
    }
    // Only called just after the owning PDE was installed; unreachable
    // in practice.
    0
}

/// Zeroes the 4 KiB frame at `phys`, via [`SCRATCH_PAGE`].
///
fn zero_frame(phys: u32) {
    with_scratch_mut(phys, |t| *t = PageTable::empty());
}

/// Copies `len` bytes from `src` to `dst`, both physical addresses, via
/// [`SCRATCH_PAGE`]. `len` must be a multiple of [`PAGE_SIZE`].
///
fn copy_frame(src: u32, dst: u32, len: u32) {
    let mut offset = 0;
    while offset < len {
        let chunk = with_scratch(src + offset, |t| {
            let bytes: &[u8; 4096] = unsafe { core::mem::transmute(t) };
            *bytes
        });
        with_scratch_mut(dst + offset, |t| {
            let bytes: &mut [u8; 4096] = unsafe { core::mem::transmute(t) };
            *bytes = chunk;
        });
        offset += PAGE_SIZE;
    }
}

/// Temporarily maps the physical frame `phys` at [`SCRATCH_PAGE`] in
/// the currently loaded directory, runs `f` against it, then unmaps it.
///
/// Every caller in this module reaches `with_scratch`/`with_scratch_mut`
/// from inside a `Pdt` method that also holds [`physmem::PFA`]'s lock,
/// which is what actually serialises use of the single scratch window.
///
fn with_scratch<R>(phys: u32, f: impl FnOnce(&PageTable) -> R) -> R {
    with_scratch_mut(phys, |t| f(t))
}

fn with_scratch_mut<R>(phys: u32, f: impl FnOnce(&mut PageTable) -> R) -> R {
    let scratch_virt = SCRATCH_PAGE.start();
    map_scratch(phys);
    invlpg(scratch_virt);
    let table = unsafe { &mut *(scratch_virt as *mut PageTable) };
    let result = f(table);
    unmap_scratch();
    invlpg(scratch_virt);
    result
}

/// Installs a PTE mapping [`SCRATCH_PAGE`]'s single page to `phys`, in
/// the kernel's permanent scratch page table (allocated once by
/// [`reserve_scratch_page_table`] during boot).
///
fn map_scratch(phys: u32) {
    let scratch_virt = SCRATCH_PAGE.start();
    let pd_index = pd_index(scratch_virt);
    let pt_index = pt_index(scratch_virt);
    let table = (RECURSIVE_PT_BASE + (pd_index as u32) * PAGE_SIZE) as *mut u32;
    unsafe {
        table
            .add(pt_index)
            .write((phys & !0xfff) | (Flags::PRESENT | Flags::WRITABLE).bits())
    };
}

fn unmap_scratch() {
    let scratch_virt = SCRATCH_PAGE.start();
    let pd_index = pd_index(scratch_virt);
    let pt_index = pt_index(scratch_virt);
    let table = (RECURSIVE_PT_BASE + (pd_index as u32) * PAGE_SIZE) as *mut u32;
    unsafe { table.add(pt_index).write(0) };
}

/// Allocates the page table backing [`SCRATCH_PAGE`] and installs its
/// PDE in the kernel's directory, without touching the scratch page
/// itself. Must run once during boot, after [`Pdt::from_loaded`] and
/// before any use of `with_scratch`/`with_scratch_mut`.
///
/// `boot.s` already installs a page table covering
/// [`memlayout::KERNEL_VIRTUAL_BASE`]'s 4 MiB region (which
/// [`SCRATCH_PAGE`] falls within), so in practice this only confirms
/// that table exists and returns its address; it does not allocate a
/// second one.
///
pub fn reserve_scratch_page_table(kernel: &mut Pdt) -> Result<(), Error> {
    let pd_index = pd_index(SCRATCH_PAGE.start());
    kernel.ensure_page_table(pd_index)?;
    Ok(())
}

/// Writes PDE `index` in the directory at physical address `pdt_phys`,
/// without requiring `pdt_phys` to be loaded or wrapped in a [`Pdt`].
///
/// Used while bootstrapping a fresh directory, before it has been
/// loaded or has any page tables of its own to route through.
///
fn set_entry_raw(pdt_phys: u32, index: usize, phys: u32, flags: Flags) {
    let value = (phys & !0xfff) | flags.bits();
    if is_loaded(pdt_phys) {
        let pdt = RECURSIVE_PDT_ADDR as *mut u32;
        unsafe { pdt.add(index).write(value) };
    } else {
        with_scratch_mut(pdt_phys, |dir| dir.entries[index] = value);
    }
}

#[cfg(test)]
mod test {
    // The bulk of `Pdt`'s behaviour depends on CR3 and raw memory
    // access and can't be exercised outside a running kernel; these
    // tests cover the pure index arithmetic.

    use super::*;

    #[test]
    fn pd_index_covers_4mib_regions() {
        assert_eq!(pd_index(0x0000_0000), 0);
        assert_eq!(pd_index(0x0040_0000), 1);
        assert_eq!(pd_index(KERNEL_VIRTUAL_BASE), 768);
    }

    #[test]
    fn pt_index_covers_4kib_pages() {
        assert_eq!(pt_index(0x0000_0000), 0);
        assert_eq!(pt_index(0x0000_1000), 1);
        assert_eq!(pt_index(0x0040_0000), 0);
    }
}
