// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's Global Descriptor Table and Task State Segment.
//!
//! The `x86_64` crate the original GDT module (see `examples/.../gdt.rs`
//! in the design ledger) builds its descriptors with only targets
//! 64-bit mode, so it's of no use on this 32-bit port: every descriptor
//! here is built by hand, the way a flat-memory-model 32-bit kernel
//! conventionally does it, with a single code and data segment per
//! privilege level (no segmentation beyond what `iret`/`ltr` require)
//! and one TSS used purely to supply `esp0`/`ss0` on a ring3-to-ring0
//! transition.

use core::arch::asm;
use lazy_static::lazy_static;
use process::Selectors;
use spin::Mutex;

const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_RING3: u8 = 3 << 5;
const ACCESS_DESCRIPTOR_TYPE: u8 = 1 << 4;
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const ACCESS_READ_WRITE: u8 = 1 << 1;
const ACCESS_TSS: u8 = 0x9;

const FLAGS_GRANULARITY_4K: u8 = 1 << 3;
const FLAGS_SIZE_32BIT: u8 = 1 << 2;

/// One 8-byte GDT entry, laid out exactly as the CPU expects it.
///
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Descriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl Descriptor {
    const fn null() -> Descriptor {
        Descriptor { limit_low: 0, base_low: 0, base_mid: 0, access: 0, limit_high_flags: 0, base_high: 0 }
    }

    /// A flat segment spanning all 4 GiB, with `access`/`flags` set by
    /// the caller per privilege level and segment kind.
    ///
    const fn flat(access: u8) -> Descriptor {
        Descriptor {
            limit_low: 0xffff,
            base_low: 0,
            base_mid: 0,
            access,
            limit_high_flags: 0xf | (FLAGS_GRANULARITY_4K << 4) | (FLAGS_SIZE_32BIT << 4),
            base_high: 0,
        }
    }

    fn tss(base: u32, limit: u32) -> Descriptor {
        Descriptor {
            limit_low: (limit & 0xffff) as u16,
            base_low: (base & 0xffff) as u16,
            base_mid: ((base >> 16) & 0xff) as u8,
            access: ACCESS_PRESENT | ACCESS_TSS,
            limit_high_flags: ((limit >> 16) & 0xf) as u8,
            base_high: ((base >> 24) & 0xff) as u8,
        }
    }
}

/// The Task State Segment: on this port, used only to hold `esp0`/`ss0`
/// so the CPU knows which kernel stack to switch to on a ring3-to-
/// ring0 interrupt or exception. No hardware task switching is used.
///
#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    _reserved: [u32; 23],
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Tss {
        Tss { link: 0, esp0: 0, ss0: 0, _reserved: [0; 23], iomap_base: core::mem::size_of::<Tss>() as u16 }
    }
}

const KERNEL_CS_INDEX: usize = 1;
const KERNEL_DS_INDEX: usize = 2;
const USER_CS_INDEX: usize = 3;
const USER_DS_INDEX: usize = 4;
const TSS_INDEX: usize = 5;
const GDT_ENTRIES: usize = 6;

#[repr(C, align(8))]
struct Table {
    entries: [Descriptor; GDT_ENTRIES],
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static mut GDT: Table = Table {
    entries: [
        Descriptor::null(),
        Descriptor::flat(ACCESS_PRESENT | ACCESS_DESCRIPTOR_TYPE | ACCESS_EXECUTABLE | ACCESS_READ_WRITE),
        Descriptor::flat(ACCESS_PRESENT | ACCESS_DESCRIPTOR_TYPE | ACCESS_READ_WRITE),
        Descriptor::flat(
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_DESCRIPTOR_TYPE | ACCESS_EXECUTABLE | ACCESS_READ_WRITE,
        ),
        Descriptor::flat(ACCESS_PRESENT | ACCESS_RING3 | ACCESS_DESCRIPTOR_TYPE | ACCESS_READ_WRITE),
        Descriptor::null(), // patched with the TSS descriptor in `init`.
    ],
};

lazy_static! {
    static ref TSS: Mutex<Tss> = Mutex::new(Tss::new());
}

fn selector(index: usize, ring: u8) -> u32 {
    ((index * core::mem::size_of::<Descriptor>()) as u32) | ring as u32
}

/// Returns the selector values `process::Process::launch`/`resume` need
/// to build an `iret` frame, without exposing the raw descriptor
/// table.
///
pub fn selectors() -> Selectors {
    Selectors {
        kernel_cs: selector(KERNEL_CS_INDEX, 0),
        kernel_ss: selector(KERNEL_DS_INDEX, 0),
        user_cs: selector(USER_CS_INDEX, 3),
        user_ss: selector(USER_DS_INDEX, 3),
    }
}

/// Updates the TSS's `esp0`, pointing at the kernel stack a ring3
/// process should be switched onto on its next interrupt or syscall.
///
/// Must be called whenever the active process changes, before control
/// returns to ring 3.
///
pub fn set_kernel_stack(esp0: u32) {
    let mut tss = TSS.lock();
    tss.esp0 = esp0;
    tss.ss0 = selector(KERNEL_DS_INDEX, 0) as u16 as u32;
}

/// Builds the GDT and TSS and loads both, plus the kernel's data
/// segment registers. Must run once, early in boot, before any
/// interrupt can fire and before the first process is launched.
///
pub fn init() {
    let tss_addr = {
        let tss = TSS.lock();
        &*tss as *const Tss as u32
    };
    let tss_limit = core::mem::size_of::<Tss>() as u32 - 1;

    unsafe {
        GDT.entries[TSS_INDEX] = Descriptor::tss(tss_addr, tss_limit);

        let pointer = DescriptorTablePointer {
            limit: (core::mem::size_of::<Table>() - 1) as u16,
            base: &GDT as *const Table as u32,
        };

        asm!("lgdt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));

        let kernel_cs = selector(KERNEL_CS_INDEX, 0);
        let kernel_ds = selector(KERNEL_DS_INDEX, 0);
        reload_segments(kernel_cs, kernel_ds);

        let tss_selector = selector(TSS_INDEX, 0) as u16;
        asm!("ltr {0:x}", in(reg) tss_selector, options(nostack, preserves_flags));
    }
}

/// Reloads `cs` via a far jump (the only way to change it outside an
/// interrupt return) and the remaining segment registers directly.
///
unsafe fn reload_segments(code_selector: u32, data_selector: u32) {
    asm!(
        "push {code_sel}",
        "lea {tmp}, [2f]",
        "push {tmp}",
        "retf",
        "2:",
        "mov ds, {data_sel:x}",
        "mov es, {data_sel:x}",
        "mov fs, {data_sel:x}",
        "mov gs, {data_sel:x}",
        "mov ss, {data_sel:x}",
        code_sel = in(reg) code_selector,
        data_sel = in(reg) data_selector,
        tmp = out(reg) _,
        options(nostack),
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn selector_encodes_index_and_ring() {
        assert_eq!(selector(1, 0), 0x08);
        assert_eq!(selector(3, 3), 0x1b);
    }

    #[test]
    fn selectors_match_gdt_layout() {
        let sel = selectors();
        assert_eq!(sel.kernel_cs, 0x08);
        assert_eq!(sel.kernel_ss, 0x10);
        assert_eq!(sel.user_cs, 0x1b);
        assert_eq!(sel.user_ss, 0x23);
    }
}
