// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Parses the Multiboot v1 information structure passed to the kernel
//! by its boot loader.
//!
//! The loader leaves a physical pointer to this data in `ebx` (with the
//! magic number `0x2BADB002` in `eax`). Every field beyond the flags
//! word is optional; [`Flags`] says which ones are actually present.
//! Pointer-shaped fields (`cmdline`, modules, symbol tables) are
//! physical addresses into memory the loader does not keep mapped, so
//! they are read out through [`memlayout::MULTIBOOT_WINDOW`] and, for
//! anything that needs to outlive the boot routine, copied onto the
//! kernel heap.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use memlayout::MULTIBOOT_WINDOW;
use physmem::MemoryMapEntry;
use virtmem::{Flags as MapFlags, Pdt};

bitflags! {
    /// Which optional parts of the Multiboot information are present,
    /// mirroring the bits of the structure's `flags` word.
    ///
    pub struct Flags: u32 {
        /// `mem_lower`/`mem_upper` are valid.
        const MEMORY = 1 << 0;

        /// `boot_device` is valid.
        const BOOT_DEVICE = 1 << 1;

        /// `cmdline` is valid.
        const CMDLINE = 1 << 2;

        /// `modules` is valid.
        const MODULES = 1 << 3;

        /// `aout_symbols` is valid. Mutually exclusive with `ELF_SYMBOLS`.
        const AOUT_SYMBOLS = 1 << 4;

        /// `elf_symbols` is valid. Mutually exclusive with `AOUT_SYMBOLS`.
        const ELF_SYMBOLS = 1 << 5;

        /// `memory_map` is valid.
        const MEMORY_MAP = 1 << 6;

        /// `drives` is valid.
        const DRIVES = 1 << 7;

        /// `config_table` is valid.
        const CONFIG_TABLE = 1 << 8;

        /// `boot_loader_name` is valid.
        const BOOT_LOADER_NAME = 1 << 9;

        /// `apm_table` is valid.
        const APM_TABLE = 1 << 10;

        /// `vbe` is valid.
        const VBE = 1 << 11;

        /// `framebuffer` is valid.
        const FRAMEBUFFER = 1 << 12;
    }
}

/// One entry of the BIOS-supplied memory map.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub base_addr: u64,
    pub length: u64,
    pub mem_type: MemoryType,
}

/// The kind of memory a [`MemoryMap`] entry describes.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Available,
    Acpi,
    Hibernate,
    Defective,
    Reserved,
}

impl MemoryType {
    fn from_u32(v: u32) -> MemoryType {
        match v {
            1 => MemoryType::Available,
            3 => MemoryType::Acpi,
            4 => MemoryType::Hibernate,
            5 => MemoryType::Defective,
            _ => MemoryType::Reserved,
        }
    }

    fn is_available(self) -> bool {
        matches!(self, MemoryType::Available)
    }
}

impl From<MemoryMap> for MemoryMapEntry {
    fn from(m: MemoryMap) -> MemoryMapEntry {
        MemoryMapEntry {
            base: m.base_addr,
            length: m.length,
            available: m.mem_type.is_available(),
        }
    }
}

/// Identifies the disk and partition the loader booted the kernel from,
/// in BIOS `int 0x13` terms.
///
/// Valid only if the partition bytes form a monotonically-disabled
/// sequence: once a byte is `0xff` ("no partition"), every byte after
/// it must be `0xff` too. A loader that set, say, `part1 = 0xff` but
/// `part2` to a real partition number produced a structure this kernel
/// refuses to trust.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootDevice {
    pub drive: u8,
    pub part1: u8,
    pub part2: u8,
    pub part3: u8,
}

impl BootDevice {
    fn is_monotonically_disabled(part1: u8, part2: u8, part3: u8) -> bool {
        let parts = [part1, part2, part3];
        let mut disabled = false;
        for p in parts {
            if disabled && p != 0xff {
                return false;
            }
            disabled |= p == 0xff;
        }
        true
    }
}

/// A module loaded alongside the kernel by the boot loader (for
/// example, an init ramdisk), with its content copied onto the heap.
///
#[derive(Clone, Debug)]
pub struct Module {
    pub data: Vec<u8>,
    pub string: String,
}

/// a.out-format symbol table location, present only when the kernel
/// was loaded from an a.out binary rather than ELF.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AoutSymbols {
    pub tab_size: u32,
    pub str_size: u32,
    pub addr: u32,
}

/// ELF section header table location, present only when the kernel was
/// loaded from an ELF binary.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfSymbols {
    pub num: u32,
    pub size: u32,
    pub addr: u32,
    pub shndx: u32,
}

/// A single recognised section header out of an [`ElfSymbols`] table,
/// with `sh_addr` corrected by [`remap_elf_sections`] so it can be
/// dereferenced directly from kernel space.
///
#[derive(Clone, Debug)]
pub struct SectionHeader {
    pub name_offset: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub addr: u32,
    pub size: u32,
}

/// One BIOS drive record out of the Multiboot `drives` list.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveRecord {
    pub drive_number: u8,
    pub drive_mode: u8,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
    pub ports: Vec<u16>,
}

/// The APM BIOS connection table, preserved verbatim for diagnostic use.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApmTable {
    pub version: u16,
    pub cseg: u16,
    pub offset: u32,
    pub cseg_16: u16,
    pub dseg: u16,
    pub flags: u16,
    pub cseg_len: u16,
    pub cseg_16_len: u16,
    pub dseg_len: u16,
}

/// The VBE BIOS tables, preserved verbatim for diagnostic use.
///
/// `control_info`/`mode_info` are the physical addresses of the 512-byte
/// and 256-byte VBE structures respectively; their content is not
/// otherwise interpreted by this kernel.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VbeInfo {
    pub control_info: u32,
    pub mode_info: u32,
    pub mode: u16,
    pub interface_seg: u16,
    pub interface_off: u16,
    pub interface_len: u16,
}

/// The linear graphics framebuffer the loader (or BIOS VBE mode set)
/// prepared, if any. `addr`/`pitch`/`width`/`height`/`bpp` are enough
/// to address any pixel directly.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framebuffer {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub fb_type: u8,
}

/// The outcome of unpacking the Multiboot information block.
///
#[derive(Clone, Debug, Default)]
pub struct MultibootInfo {
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: Option<BootDevice>,
    pub cmdline: Option<String>,
    pub modules: Vec<Module>,
    pub aout_symbols: Option<AoutSymbols>,
    pub elf_symbols: Option<ElfSymbols>,
    pub memory_map: Vec<MemoryMap>,
    pub drives: Vec<DriveRecord>,
    pub boot_loader_name: Option<String>,
    pub apm_table: Option<ApmTable>,
    pub vbe: Option<VbeInfo>,
    pub framebuffer: Option<Framebuffer>,
}

/// Describes why the Multiboot information block could not be parsed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// `eax` did not contain the Multiboot magic number.
    BadMagic,

    /// The flags word claimed both `AOUT_SYMBOLS` and `ELF_SYMBOLS`, or
    /// neither with `MODULES` implying one should be set; the loader
    /// did not honour the mutual-exclusion required by the spec.
    ConflictingSymbolTables,

    /// Mapping the information block (or something it points at)
    /// failed.
    MapFailed,
}

/// The magic value the loader leaves in `eax` on entry; the
/// architecture's entry stub passes it through as `magic`.
///
pub const MAGIC: u32 = 0x2BADB002;

/// Parses the Multiboot information structure at physical address
/// `info_phys`, given `magic` as read from `eax` at kernel entry.
///
/// `pdt` is used to temporarily map physical structures through
/// [`memlayout::MULTIBOOT_WINDOW`] while they are read; nothing from
/// the loader's physical memory is mapped permanently; module content
/// and strings are copied onto the heap.
///
pub fn parse(magic: u32, info_phys: u32, pdt: &mut Pdt) -> Result<MultibootInfo, Error> {
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }

    let header = read_phys(pdt, info_phys, 116)?;
    let flags = Flags::from_bits_truncate(u32::from_le_bytes(header[0..4].try_into().unwrap()));

    let mut info = MultibootInfo::default();

    if flags.contains(Flags::MEMORY) {
        info.mem_lower = u32::from_le_bytes(header[4..8].try_into().unwrap());
        info.mem_upper = u32::from_le_bytes(header[8..12].try_into().unwrap());
    }

    if flags.contains(Flags::BOOT_DEVICE) {
        let raw = &header[12..16];
        let (part1, part2, part3) = (raw[2], raw[1], raw[0]);
        if BootDevice::is_monotonically_disabled(part1, part2, part3) {
            info.boot_device = Some(BootDevice {
                drive: raw[3],
                part1,
                part2,
                part3,
            });
        } else {
            serial::println!("multiboot: boot_device partition bytes are not monotonically disabled, ignoring");
        }
    }

    if flags.contains(Flags::CMDLINE) {
        let addr = u32::from_le_bytes(header[16..20].try_into().unwrap());
        info.cmdline = Some(read_cstring(pdt, addr)?);
    }

    if flags.contains(Flags::MODULES) {
        let count = u32::from_le_bytes(header[20..24].try_into().unwrap());
        let mods_addr = u32::from_le_bytes(header[24..28].try_into().unwrap());
        info.modules = read_modules(pdt, mods_addr, count)?;
    }

    let has_aout = flags.contains(Flags::AOUT_SYMBOLS);
    let has_elf = flags.contains(Flags::ELF_SYMBOLS);
    if has_aout && has_elf {
        return Err(Error::ConflictingSymbolTables);
    }
    if has_aout {
        info.aout_symbols = Some(AoutSymbols {
            tab_size: u32::from_le_bytes(header[28..32].try_into().unwrap()),
            str_size: u32::from_le_bytes(header[32..36].try_into().unwrap()),
            addr: u32::from_le_bytes(header[36..40].try_into().unwrap()),
        });
    }
    if has_elf {
        info.elf_symbols = Some(ElfSymbols {
            num: u32::from_le_bytes(header[28..32].try_into().unwrap()),
            size: u32::from_le_bytes(header[32..36].try_into().unwrap()),
            addr: u32::from_le_bytes(header[36..40].try_into().unwrap()),
            shndx: u32::from_le_bytes(header[40..44].try_into().unwrap()),
        });
    }

    if flags.contains(Flags::MEMORY_MAP) {
        let length = u32::from_le_bytes(header[44..48].try_into().unwrap());
        let addr = u32::from_le_bytes(header[48..52].try_into().unwrap());
        info.memory_map = read_memory_map(pdt, addr, length)?;
    }

    if flags.contains(Flags::DRIVES) {
        let length = u32::from_le_bytes(header[52..56].try_into().unwrap());
        let addr = u32::from_le_bytes(header[56..60].try_into().unwrap());
        info.drives = read_drives(pdt, addr, length)?;
    }

    if flags.contains(Flags::BOOT_LOADER_NAME) {
        let addr = u32::from_le_bytes(header[64..68].try_into().unwrap());
        info.boot_loader_name = Some(read_cstring(pdt, addr)?);
    }

    if flags.contains(Flags::APM_TABLE) {
        let addr = u32::from_le_bytes(header[68..72].try_into().unwrap());
        let raw = read_phys(pdt, addr, 20)?;
        info.apm_table = Some(ApmTable {
            version: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            cseg: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            offset: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            cseg_16: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
            dseg: u16::from_le_bytes(raw[10..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            cseg_len: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
            cseg_16_len: u16::from_le_bytes(raw[16..18].try_into().unwrap()),
            dseg_len: u16::from_le_bytes(raw[18..20].try_into().unwrap()),
        });
    }

    if flags.contains(Flags::VBE) {
        info.vbe = Some(VbeInfo {
            control_info: u32::from_le_bytes(header[72..76].try_into().unwrap()),
            mode_info: u32::from_le_bytes(header[76..80].try_into().unwrap()),
            mode: u16::from_le_bytes(header[80..82].try_into().unwrap()),
            interface_seg: u16::from_le_bytes(header[82..84].try_into().unwrap()),
            interface_off: u16::from_le_bytes(header[84..86].try_into().unwrap()),
            interface_len: u16::from_le_bytes(header[86..88].try_into().unwrap()),
        });
    }

    if flags.contains(Flags::FRAMEBUFFER) {
        let addr = u64::from_le_bytes(header[88..96].try_into().unwrap());
        let pitch = u32::from_le_bytes(header[96..100].try_into().unwrap());
        let width = u32::from_le_bytes(header[100..104].try_into().unwrap());
        let height = u32::from_le_bytes(header[104..108].try_into().unwrap());
        let bpp = header[108];
        let fb_type = header[109];
        if width == 0 || height == 0 {
            serial::println!("multiboot: framebuffer table has zero dimensions, ignoring");
        } else {
            info.framebuffer = Some(Framebuffer {
                addr,
                pitch,
                width,
                height,
                bpp,
                fb_type,
            });
        }
    }

    Ok(info)
}

/// Reads the variable-length `drives` list: each record begins with
/// its own size in bytes (including the size field), so the list is
/// walked one record at a time until `length` bytes are consumed.
///
fn read_drives(pdt: &mut Pdt, addr: u32, length: u32) -> Result<Vec<DriveRecord>, Error> {
    let mut drives = Vec::new();
    let mut offset = 0u32;
    while offset < length {
        let record_addr = addr + offset;
        let head = read_phys(pdt, record_addr, 10)?;
        let size = u32::from_le_bytes(head[0..4].try_into().unwrap());
        if size < 10 {
            serial::println!("multiboot: drive record size {size} is too small, stopping");
            break;
        }
        let drive_number = head[4];
        let drive_mode = head[5];
        let cylinders = u16::from_le_bytes(head[6..8].try_into().unwrap());
        let heads = head[8];
        let sectors = head[9];

        let ports_bytes = size - 10;
        let raw_ports = read_phys(pdt, record_addr + 10, ports_bytes)?;
        let ports = raw_ports
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        drives.push(DriveRecord {
            drive_number,
            drive_mode,
            cylinders,
            heads,
            sectors,
            ports,
        });
        offset += size;
    }
    Ok(drives)
}

/// Remaps an ELF section header's `sh_addr` that the loader populated
/// with a kernel-image-relative virtual address onto the process-wide
/// [`memlayout::KERNEL_VIRTUAL_BASE`] convention, when it falls outside
/// the range the kernel's own page tables already cover.
///
/// GRUB loads `.symtab`/`.strtab`/`.shstrtab` at whatever physical
/// address was free at the time, and fills in `sh_addr` assuming an
/// identity mapping; this corrects that assumption back to the higher
/// half so the kernel can dereference the pointer directly once the
/// section is mapped.
///
pub fn remap_section_addr(sh_addr: u32, kernel_phys_base: u32) -> u32 {
    if sh_addr < memlayout::KERNEL_VIRTUAL_BASE {
        memlayout::KERNEL_VIRTUAL_BASE + (sh_addr.wrapping_sub(kernel_phys_base))
    } else {
        sh_addr
    }
}

/// Reads out the ELF section header table described by `elf_symbols`,
/// correcting every section's `sh_addr` so it can be dereferenced
/// directly once parsed.
///
/// For a section whose `sh_addr` already falls in [`memlayout::KERNEL_SPACE`]
/// nothing changes. For one outside it: if the address falls within
/// `[kernel_phys_base, kernel_phys_end)`, it was really an alias of the
/// kernel image and is rewritten with [`remap_section_addr`]. Otherwise
/// GRUB placed the section somewhere else in physical memory entirely
/// (this is the common case for `.symtab`/`.strtab`/`.shstrtab`); that
/// range is mapped, copied onto the heap through a throwaway `memfs`
/// file, and `sh_addr` rewritten to the heap copy.
///
pub fn remap_elf_sections(
    pdt: &mut Pdt,
    elf_symbols: &ElfSymbols,
    kernel_phys_base: u32,
    kernel_phys_end: u32,
) -> Result<Vec<SectionHeader>, Error> {
    let entry_size = elf_symbols.size.max(40);
    let mut sections = Vec::with_capacity(elf_symbols.num as usize);

    for i in 0..elf_symbols.num {
        let entry_addr = elf_symbols.addr + i * entry_size;
        let raw = read_phys(pdt, entry_addr, 40)?;
        let name_offset = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let sh_type = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let sh_flags = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let mut addr = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        let size = u32::from_le_bytes(raw[20..24].try_into().unwrap());

        if addr != 0 && !memlayout::KERNEL_SPACE.contains_addr(addr) {
            if addr >= kernel_phys_base && addr < kernel_phys_end {
                addr = remap_section_addr(addr, kernel_phys_base);
            } else if size > 0 {
                addr = copy_section_to_heap(pdt, addr, size)?;
            }
        }

        sections.push(SectionHeader {
            name_offset,
            sh_type,
            sh_flags,
            addr,
            size,
        });
    }

    Ok(sections)
}

/// Copies `len` bytes at physical address `phys` onto the heap and
/// returns a pointer to the copy, routing the copy through a
/// throwaway `memfs` file: the freshly-read bytes are adopted as an
/// external mapping, then read back out via the ordinary file API, so
/// the heap buffer this function hands back has gone through the same
/// path a file-backed Multiboot module would.
///
fn copy_section_to_heap(pdt: &mut Pdt, phys: u32, len: u32) -> Result<u32, Error> {
    let bytes = read_phys(pdt, phys, len)?;

    let fs = filesystem::memfs::MemFs::new();
    fs.create_mapping("multiboot-elf-section", bytes.as_ptr() as u32, bytes.len());
    let mut file = fs
        .fopen("multiboot-elf-section", filesystem::OpenMode::Read)
        .map_err(|_| Error::MapFailed)?;

    let mut copy = alloc::vec![0u8; bytes.len()];
    let mut read = 0;
    while read < copy.len() {
        let n = file.read(&mut copy[read..]).map_err(|_| Error::MapFailed)?;
        if n == 0 {
            break;
        }
        read += n;
    }
    fs.delete_mapping("multiboot-elf-section");
    drop(bytes);

    let leaked = alloc::boxed::Box::leak(copy.into_boxed_slice());
    Ok(leaked.as_ptr() as u32)
}

fn read_memory_map(pdt: &mut Pdt, addr: u32, length: u32) -> Result<Vec<MemoryMap>, Error> {
    let mut entries = Vec::new();
    let mut offset = 0u32;
    while offset < length {
        let entry_addr = addr + offset;
        let raw = read_phys(pdt, entry_addr, 24)?;
        let entry_size = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let base_addr = u64::from_le_bytes(raw[4..12].try_into().unwrap());
        let len = u64::from_le_bytes(raw[12..20].try_into().unwrap());
        let mem_type = u32::from_le_bytes(raw[20..24].try_into().unwrap());
        entries.push(MemoryMap {
            base_addr,
            length: len,
            mem_type: MemoryType::from_u32(mem_type),
        });
        // `entry_size` does not include itself.
        offset += entry_size + 4;
    }
    Ok(entries)
}

fn read_modules(pdt: &mut Pdt, addr: u32, count: u32) -> Result<Vec<Module>, Error> {
    let mut modules = Vec::new();
    for i in 0..count {
        let raw = read_phys(pdt, addr + i * 16, 16)?;
        let start = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let end = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let string_addr = u32::from_le_bytes(raw[8..12].try_into().unwrap());

        let data = read_phys(pdt, start, end.saturating_sub(start))?;
        let string = read_cstring(pdt, string_addr)?;
        modules.push(Module { data, string });
    }
    Ok(modules)
}

/// Reads a NUL-terminated string at physical address `addr`.
///
fn read_cstring(pdt: &mut Pdt, addr: u32) -> Result<String, Error> {
    let mut bytes = Vec::new();
    let mut offset = 0u32;
    loop {
        let chunk = read_phys(pdt, addr + offset, 1)?;
        if chunk[0] == 0 {
            break;
        }
        bytes.push(chunk[0]);
        offset += 1;
        if offset > 64 * 1024 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads `len` bytes starting at physical address `phys`, via
/// [`memlayout::MULTIBOOT_WINDOW`], one physical page at a time so a
/// read may freely cross page boundaries.
///
fn read_phys(pdt: &mut Pdt, phys: u32, len: u32) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(len as usize);
    let mut offset = 0u32;
    while offset < len {
        let cur = phys + offset;
        let page_phys = cur & !0xfff;
        let page_offset = cur - page_phys;
        let chunk_len = core::cmp::min(4096 - page_offset, len - offset);

        let window = MULTIBOOT_WINDOW.start();
        pdt.map(window, page_phys, MapFlags::PRESENT, false)
            .map_err(|_| Error::MapFailed)?;

        let src = (window + page_offset) as *const u8;
        let start = out.len();
        out.resize(start + chunk_len as usize, 0);
        unsafe {
            core::ptr::copy_nonoverlapping(src, out[start..].as_mut_ptr(), chunk_len as usize);
        }

        pdt.unmap_external(window).map_err(|_| Error::MapFailed)?;

        offset += chunk_len;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_type_classifies_available() {
        assert!(MemoryType::from_u32(1).is_available());
        assert!(!MemoryType::from_u32(2).is_available());
        assert!(!MemoryType::from_u32(5).is_available());
    }

    #[test]
    fn memory_map_entry_conversion_preserves_availability() {
        let m = MemoryMap {
            base_addr: 0x10_0000,
            length: 0x10_0000,
            mem_type: MemoryType::Available,
        };
        let converted: MemoryMapEntry = m.into();
        assert!(converted.available);
        assert_eq!(converted.base, 0x10_0000);
        assert_eq!(converted.length, 0x10_0000);
    }

    #[test]
    fn remap_section_addr_leaves_higher_half_alone() {
        let addr = memlayout::KERNEL_VIRTUAL_BASE + 0x1000;
        assert_eq!(remap_section_addr(addr, 0x0010_0000), addr);
    }

    #[test]
    fn boot_device_accepts_all_enabled() {
        assert!(BootDevice::is_monotonically_disabled(0, 0, 0));
    }

    #[test]
    fn boot_device_accepts_trailing_disabled() {
        assert!(BootDevice::is_monotonically_disabled(0, 0xff, 0xff));
    }

    #[test]
    fn boot_device_rejects_enabled_after_disabled() {
        assert!(!BootDevice::is_monotonically_disabled(0xff, 0, 0));
    }

    #[test]
    fn remap_section_addr_shifts_identity_mapped_addr() {
        let kernel_phys_base = 0x0010_0000;
        let remapped = remap_section_addr(kernel_phys_base + 0x2000, kernel_phys_base);
        assert_eq!(remapped, memlayout::KERNEL_VIRTUAL_BASE + 0x2000);
    }
}
