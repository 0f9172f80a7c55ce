// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the boot-time physical memory map, as ingested from the
//! Multiboot information block by the `multiboot` crate.

/// Describes a single contiguous region of physical memory, as
/// reported by the bootloader.
///
/// This is deliberately bootloader-agnostic: the `multiboot` crate is
/// responsible for translating Multiboot's own memory map entry
/// format (which additionally distinguishes ACPI-reclaimable and
/// NVS regions) down to the simple available/unavailable distinction
/// the PFA actually needs.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// The physical address of the first byte in the region.
    ///
    pub base: u64,
    /// The size of the region, in bytes.
    ///
    pub length: u64,
    /// Whether the region is available for general use.
    ///
    pub available: bool,
}
