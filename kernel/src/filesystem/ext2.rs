// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! An ext2 file system, grounded on `Ext.h`/`Ext.cpp` from the original
//! implementation. Superblock and inode byte layouts follow the
//! standard on-disk ext2 format (the same layout the original reads
//! field-by-field from a byte stream); directory-entry creation and
//! rename are not implemented, mirroring the original leaving
//! `Ext2FileSystem::rename` as an unfinished stub, but reading,
//! writing and truncating an existing file are implemented completely
//! (the original's `Ext2File::write` is itself an unfinished stub).

use crate::{Error, OpenMode};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitmap_index::Bitmap;
use spin::Mutex;
use storage::block;

/// The ext2 magic number, read at byte 56 of the superblock.
///
pub const SIGNATURE: u16 = 0xEF53;

/// Byte offset of the superblock from the start of the device.
///
pub const SUPERBLOCK_OFFSET: usize = 1024;

const COMPULSORY_SIZE: usize = 84;
const EXTENDED_SIZE: usize = 136;
const DISK_SIZE: usize = 1024;
const BGD_SIZE: usize = 32;
const INODE_READ_SIZE: usize = 128;
const ROOT_INODE: u32 = 2;

/// Required-feature bits (`s_feature_incompat`); a superblock with any
/// other bit set fails to mount at all.
///
pub const REQUIRED_COMPRESSION: u32 = 0x1;
pub const REQUIRED_DIRECTORIES_TYPE: u32 = 0x2;
pub const REQUIRED_JOURNAL_REPLAY: u32 = 0x4;
pub const REQUIRED_JOURNAL_DEVICE: u32 = 0x8;
pub const REQUIRED_SUPPORTED: u32 = REQUIRED_DIRECTORIES_TYPE;

/// Write-required-feature bits (`s_feature_ro_compat`); a superblock
/// with any other bit set mounts read-only rather than failing.
///
pub const WRITE_SPARSE: u32 = 0x1;
pub const WRITE_LARGE_FILE_SIZE: u32 = 0x2;
pub const WRITE_DIRECTORY_TREE: u32 = 0x4;
pub const WRITE_SUPPORTED: u32 = WRITE_LARGE_FILE_SIZE;

fn ru32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

fn ru16(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([b[o], b[o + 1]])
}

fn wu32(b: &mut [u8], o: usize, v: u32) {
    b[o..o + 4].copy_from_slice(&v.to_le_bytes());
}

fn wu16(b: &mut [u8], o: usize, v: u16) {
    b[o..o + 2].copy_from_slice(&v.to_le_bytes());
}

fn div_ceil(a: u32, b: u32) -> u32 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// The fixed fields of an ext2 superblock, grounded on `Ext2SuperBlock`
/// in the original. `raw` retains every byte as read from disk, so
/// fields this port doesn't model (timestamps, mount counters, last
/// mount path, ...) survive a read-modify-write unchanged; only the
/// fields this file system actually mutates are patched back in.
///
#[derive(Clone)]
pub struct SuperBlock {
    raw: Vec<u8>,
    pub no_inodes: u32,
    pub no_blocks: u32,
    pub reserved_blocks: u32,
    pub unalloc_blocks: u32,
    pub unalloc_inodes: u32,
    pub first_data_block: u32,
    pub block_size_shift: u32,
    pub fragment_size_shift: u32,
    pub blocks_per_group: u32,
    pub fragments_per_group: u32,
    pub inodes_per_group: u32,
    pub signature: u16,
    pub minor_version: u16,
    pub major_version: u32,
    pub reserved_uid: u16,
    pub reserved_gid: u16,
    pub first_usable_inode: u32,
    pub inode_size: u16,
    pub backup_block: u16,
    pub optional_features: u32,
    pub required_features: u32,
    pub write_features: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
}

impl SuperBlock {
    /// Block size in bytes: `1024 << block_size_shift`.
    ///
    pub fn block_size(&self) -> usize {
        1024usize << self.block_size_shift
    }

    fn from_bytes(buf: &[u8]) -> Result<SuperBlock, Error> {
        if buf.len() < COMPULSORY_SIZE {
            return Err(Error::Unsupported);
        }
        let signature = ru16(buf, 56);
        if signature != SIGNATURE {
            return Err(Error::Unsupported);
        }

        let major_version = ru32(buf, 76);
        let mut sb = SuperBlock {
            raw: vec![0u8; DISK_SIZE],
            no_inodes: ru32(buf, 0),
            no_blocks: ru32(buf, 4),
            reserved_blocks: ru32(buf, 8),
            unalloc_blocks: ru32(buf, 12),
            unalloc_inodes: ru32(buf, 16),
            first_data_block: ru32(buf, 20),
            block_size_shift: ru32(buf, 24),
            fragment_size_shift: ru32(buf, 28),
            blocks_per_group: ru32(buf, 32),
            fragments_per_group: ru32(buf, 36),
            inodes_per_group: ru32(buf, 40),
            signature,
            minor_version: ru16(buf, 62),
            major_version,
            reserved_uid: ru16(buf, 80),
            reserved_gid: ru16(buf, 82),
            first_usable_inode: 11,
            inode_size: 128,
            backup_block: 0,
            optional_features: 0,
            required_features: 0,
            write_features: 0,
            uuid: [0; 16],
            volume_name: [0; 16],
        };

        if major_version >= 1 {
            if buf.len() < EXTENDED_SIZE {
                return Err(Error::Unsupported);
            }
            sb.first_usable_inode = ru32(buf, 84);
            sb.inode_size = ru16(buf, 88);
            sb.backup_block = ru16(buf, 90);
            sb.optional_features = ru32(buf, 92);
            sb.required_features = ru32(buf, 96);
            sb.write_features = ru32(buf, 100);
            sb.uuid.copy_from_slice(&buf[104..120]);
            sb.volume_name.copy_from_slice(&buf[120..136]);
        }

        if sb.inode_size < 128 {
            return Err(Error::Unsupported);
        }

        let copy_len = buf.len().min(DISK_SIZE);
        sb.raw[..copy_len].copy_from_slice(&buf[..copy_len]);
        Ok(sb)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.raw.clone();
        wu32(&mut buf, 4, self.no_blocks);
        wu32(&mut buf, 12, self.unalloc_blocks);
        wu32(&mut buf, 16, self.unalloc_inodes);
        buf
    }
}

/// A block group descriptor, grounded on `BlockGroupDescriptor` in the
/// original. Like [`SuperBlock`], `raw` preserves every on-disk byte
/// this port doesn't name a field for.
///
#[derive(Clone)]
pub struct BlockGroupDescriptor {
    raw: [u8; BGD_SIZE],
    pub block_map: u32,
    pub inode_map: u32,
    pub inode_table: u32,
    pub unalloc_blocks: u16,
    pub unalloc_inodes: u16,
    pub dirs: u16,
}

impl BlockGroupDescriptor {
    fn from_bytes(buf: &[u8]) -> BlockGroupDescriptor {
        let mut raw = [0u8; BGD_SIZE];
        let copy_len = buf.len().min(BGD_SIZE);
        raw[..copy_len].copy_from_slice(&buf[..copy_len]);
        BlockGroupDescriptor {
            raw,
            block_map: ru32(buf, 0),
            inode_map: ru32(buf, 4),
            inode_table: ru32(buf, 8),
            unalloc_blocks: ru16(buf, 12),
            unalloc_inodes: ru16(buf, 14),
            dirs: ru16(buf, 16),
        }
    }

    fn to_bytes(&self) -> [u8; BGD_SIZE] {
        let mut buf = self.raw;
        wu16(&mut buf, 12, self.unalloc_blocks);
        wu16(&mut buf, 14, self.unalloc_inodes);
        buf
    }
}

/// The kind of file an inode describes, from the top nibble of its
/// type/permissions field, mirroring `Ext2Inode::Type` in the
/// original.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    File,
    SymLink,
    Socket,
    Unknown,
}

/// Returns the [`InodeType`] of an inode's type/permissions field.
///
pub fn inode_type(inode: &Inode) -> InodeType {
    match inode.type_perm & 0xF000 {
        0x1000 => InodeType::Fifo,
        0x2000 => InodeType::CharDevice,
        0x4000 => InodeType::Directory,
        0x6000 => InodeType::BlockDevice,
        0x8000 => InodeType::File,
        0xA000 => InodeType::SymLink,
        0xC000 => InodeType::Socket,
        _ => InodeType::Unknown,
    }
}

/// An ext2 inode, grounded on `Ext2Inode` in the original. Field order
/// and widths are preserved verbatim from the standard ext2 on-disk
/// layout, which the original reads through named accessor methods
/// over a raw byte buffer; this port parses straight into named
/// fields instead.
///
#[derive(Clone, Copy, Default)]
pub struct Inode {
    pub type_perm: u16,
    pub uid: u16,
    pub lower_size: u32,
    pub access_time: u32,
    pub creation_time: u32,
    pub mod_time: u32,
    pub del_time: u32,
    pub gid: u16,
    pub hard_links: u16,
    pub sectors: u32,
    pub flags: u32,
    pub os_1: u32,
    pub direct: [u32; 12],
    pub s_indirect: u32,
    pub d_indirect: u32,
    pub t_indirect: u32,
    pub gen_no: u32,
    pub file_acl: u32,
    pub upper_size: u32,
    pub frag_addr: u32,
    pub os_2: [u8; 12],
}

impl Inode {
    fn from_bytes(buf: &[u8]) -> Result<Inode, Error> {
        if buf.len() < INODE_READ_SIZE {
            return Err(Error::Unsupported);
        }
        let mut direct = [0u32; 12];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = ru32(buf, 40 + i * 4);
        }
        let mut os_2 = [0u8; 12];
        os_2.copy_from_slice(&buf[116..128]);
        Ok(Inode {
            type_perm: ru16(buf, 0),
            uid: ru16(buf, 2),
            lower_size: ru32(buf, 4),
            access_time: ru32(buf, 8),
            creation_time: ru32(buf, 12),
            mod_time: ru32(buf, 16),
            del_time: ru32(buf, 20),
            gid: ru16(buf, 24),
            hard_links: ru16(buf, 26),
            sectors: ru32(buf, 28),
            flags: ru32(buf, 32),
            os_1: ru32(buf, 36),
            direct,
            s_indirect: ru32(buf, 88),
            d_indirect: ru32(buf, 92),
            t_indirect: ru32(buf, 96),
            gen_no: ru32(buf, 100),
            file_acl: ru32(buf, 104),
            upper_size: ru32(buf, 108),
            frag_addr: ru32(buf, 112),
            os_2,
        })
    }

    fn to_bytes(&self) -> [u8; INODE_READ_SIZE] {
        let mut buf = [0u8; INODE_READ_SIZE];
        wu16(&mut buf, 0, self.type_perm);
        wu16(&mut buf, 2, self.uid);
        wu32(&mut buf, 4, self.lower_size);
        wu32(&mut buf, 8, self.access_time);
        wu32(&mut buf, 12, self.creation_time);
        wu32(&mut buf, 16, self.mod_time);
        wu32(&mut buf, 20, self.del_time);
        wu16(&mut buf, 24, self.gid);
        wu16(&mut buf, 26, self.hard_links);
        wu32(&mut buf, 28, self.sectors);
        wu32(&mut buf, 32, self.flags);
        wu32(&mut buf, 36, self.os_1);
        for (i, slot) in self.direct.iter().enumerate() {
            wu32(&mut buf, 40 + i * 4, *slot);
        }
        wu32(&mut buf, 88, self.s_indirect);
        wu32(&mut buf, 92, self.d_indirect);
        wu32(&mut buf, 96, self.t_indirect);
        wu32(&mut buf, 100, self.gen_no);
        wu32(&mut buf, 104, self.file_acl);
        wu32(&mut buf, 108, self.upper_size);
        wu32(&mut buf, 112, self.frag_addr);
        buf[116..128].copy_from_slice(&self.os_2);
        buf
    }
}

fn file_size(sb: &SuperBlock, inode: &Inode) -> u64 {
    let mut size: u64 = 0;
    if sb.write_features & WRITE_LARGE_FILE_SIZE != 0 && inode_type(inode) == InodeType::File {
        size = (inode.upper_size as u64) << 32;
    }
    size + inode.lower_size as u64
}

fn set_file_size(sb: &SuperBlock, inode: &mut Inode, size: u64) {
    inode.lower_size = size as u32;
    if sb.write_features & WRITE_LARGE_FILE_SIZE != 0 && inode_type(inode) == InodeType::File {
        inode.upper_size = (size >> 32) as u32;
    }
}

fn read_device(dev_name: &str, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
    let mut result = Err(Error::NotFound);
    block::iter(|dev| {
        if dev.name == dev_name {
            result = dev.device.read_bytes(offset, len).map_err(|_| Error::DeviceError);
        }
    });
    result
}

fn write_device(dev_name: &str, offset: usize, data: &[u8]) -> Result<(), Error> {
    let mut result = Err(Error::NotFound);
    block::iter(|dev| {
        if dev.name == dev_name {
            result = dev
                .device
                .write_bytes(offset, data)
                .map(|_| ())
                .map_err(|_| Error::DeviceError);
        }
    });
    result
}

fn block_to_byte(sb: &SuperBlock, block: u64) -> usize {
    (block * sb.block_size() as u64) as usize
}

fn bgdt_offset(sb: &SuperBlock) -> usize {
    let block_size = sb.block_size();
    let mut off = 0usize;
    while SUPERBLOCK_OFFSET + DISK_SIZE > off {
        off += block_size;
    }
    off
}

fn group_block_count(sb: &SuperBlock, group: u32) -> usize {
    let total_groups = div_ceil(sb.no_blocks, sb.blocks_per_group);
    if group + 1 == total_groups {
        (sb.no_blocks - sb.blocks_per_group * group) as usize
    } else {
        sb.blocks_per_group as usize
    }
}

fn bitmap_from_bytes(bytes: &[u8], num_bits: usize) -> Bitmap {
    let mut bm = Bitmap::new_unset(num_bits);
    for i in 0..num_bits {
        if bytes[i / 8] & (1 << (i % 8)) != 0 {
            bm.set(i);
        }
    }
    bm
}

fn bitmap_to_bytes(bm: &Bitmap, block_size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; block_size];
    for i in 0..bm.len() {
        if bm.get(i) {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// The mutable, shared state of a mounted ext2 file system: the
/// superblock, the block group descriptor table, and a dirty flag.
///
/// Block-bitmap writes happen immediately (they're the authoritative
/// record of allocation), but the superblock's and BGDT's free-space
/// counters are only persisted when the file system is dropped
/// (unmounted) — the explicit behaviour spec.md §9 calls for
/// completing in `Ext2FileSystem::deallocate`, extended here to
/// `allocate` for the same reason.
///
struct State {
    super_block: SuperBlock,
    bgdt: Vec<BlockGroupDescriptor>,
    dirty: bool,
}

fn allocate_block(dev_name: &str, state: &mut State) -> Result<u32, Error> {
    let block_size = state.super_block.block_size();
    for g in 0..state.bgdt.len() {
        if state.bgdt[g].unalloc_blocks == 0 {
            continue;
        }
        let group_blocks = group_block_count(&state.super_block, g as u32);
        let bitmap_bytes = read_device(
            dev_name,
            block_to_byte(&state.super_block, state.bgdt[g].block_map as u64),
            block_size,
        )?;
        let mut bm = bitmap_from_bytes(&bitmap_bytes, group_blocks);
        let i = match bm.next_unset() {
            Some(i) => i,
            None => continue,
        };
        bm.set(i);
        let new_bytes = bitmap_to_bytes(&bm, block_size);
        write_device(
            dev_name,
            block_to_byte(&state.super_block, state.bgdt[g].block_map as u64),
            &new_bytes,
        )?;

        state.bgdt[g].unalloc_blocks -= 1;
        state.super_block.unalloc_blocks -= 1;
        state.dirty = true;

        let block_no =
            g as u32 * state.super_block.blocks_per_group + state.super_block.first_data_block + i as u32;
        return Ok(block_no);
    }
    Err(Error::NoSpace)
}

/// Clears `block`'s bit in its block group's bitmap, increments the
/// group's and superblock's free-block counts, and marks the
/// superblock dirty for a flush at unmount — the complete
/// implementation spec.md §9 calls for of `Ext2FileSystem::deallocate`,
/// which the original leaves as an unfinished block-group-index
/// computation.
///
fn deallocate_block(dev_name: &str, state: &mut State, block: u32) -> Result<(), Error> {
    if block == 0 || block as u64 >= state.super_block.no_blocks as u64 {
        return Ok(());
    }
    if block < state.super_block.first_data_block {
        return Ok(());
    }
    let rel = block - state.super_block.first_data_block;
    let g = (rel / state.super_block.blocks_per_group) as usize;
    let i = (rel % state.super_block.blocks_per_group) as usize;
    if g >= state.bgdt.len() {
        return Ok(());
    }

    let block_size = state.super_block.block_size();
    let group_blocks = group_block_count(&state.super_block, g as u32);
    let bitmap_bytes = read_device(
        dev_name,
        block_to_byte(&state.super_block, state.bgdt[g].block_map as u64),
        block_size,
    )?;
    let mut bm = bitmap_from_bytes(&bitmap_bytes, group_blocks);
    if i >= bm.len() || !bm.get(i) {
        return Ok(());
    }
    bm.unset(i);
    let new_bytes = bitmap_to_bytes(&bm, block_size);
    write_device(
        dev_name,
        block_to_byte(&state.super_block, state.bgdt[g].block_map as u64),
        &new_bytes,
    )?;

    state.bgdt[g].unalloc_blocks += 1;
    state.super_block.unalloc_blocks += 1;
    state.dirty = true;
    Ok(())
}

fn zero_block(dev_name: &str, state: &State, block: u32) -> Result<(), Error> {
    let block_size = state.super_block.block_size();
    write_device(dev_name, block_to_byte(&state.super_block, block as u64), &vec![0u8; block_size])
}

/// Reads the block-pointer stored at `index` within the pointer table
/// at `table_block`, returning the sentinel `0` if `table_block`
/// itself is `0` (unallocated) — the same zero-propagates-upward
/// sentinel spec.md §4.5.3 describes for block lookup.
///
fn read_indexed(dev_name: &str, state: &State, table_block: u32, index: usize) -> Result<u32, Error> {
    if table_block == 0 {
        return Ok(0);
    }
    let bytes = read_device(
        dev_name,
        block_to_byte(&state.super_block, table_block as u64) + index * 4,
        4,
    )?;
    Ok(ru32(&bytes, 0))
}

/// Allocates the pointer-table block behind `ptr` if it isn't already
/// allocated, zero-filling it, and returns its block number.
///
fn ensure_pointer_block(dev_name: &str, state: &mut State, ptr: &mut u32) -> Result<u32, Error> {
    if *ptr == 0 {
        let block = allocate_block(dev_name, state)?;
        zero_block(dev_name, state, block)?;
        *ptr = block;
    }
    Ok(*ptr)
}

/// Reads the pointer at `index` within `table_block`, allocating and
/// zero-filling a fresh block (and writing its number into the table)
/// if that slot is still `0`.
///
fn ensure_indexed(dev_name: &str, state: &mut State, table_block: u32, index: usize) -> Result<u32, Error> {
    let existing = read_indexed(dev_name, state, table_block, index)?;
    if existing != 0 {
        return Ok(existing);
    }
    let block = allocate_block(dev_name, state)?;
    zero_block(dev_name, state, block)?;
    let bytes = block.to_le_bytes();
    write_device(
        dev_name,
        block_to_byte(&state.super_block, table_block as u64) + index * 4,
        &bytes,
    )?;
    Ok(block)
}

/// Translates a logical block index within a file to a physical block
/// address, per spec.md §4.5.3's direct/singly/doubly/triply indirect
/// scheme, without allocating anything (used by `read`).
///
fn lookup_block(dev_name: &str, state: &State, inode: &Inode, logical: u64) -> Result<u32, Error> {
    let k = state.super_block.block_size() as u64 / 4;

    if logical < 12 {
        return Ok(inode.direct[logical as usize]);
    }
    let mut l = logical - 12;

    if l < k {
        return read_indexed(dev_name, state, inode.s_indirect, l as usize);
    }
    l -= k;

    if l < k * k {
        let mid = read_indexed(dev_name, state, inode.d_indirect, (l / k) as usize)?;
        return read_indexed(dev_name, state, mid, (l % k) as usize);
    }
    l -= k * k;

    if l < k * k * k {
        let mid1 = read_indexed(dev_name, state, inode.t_indirect, (l / (k * k)) as usize)?;
        let mid2 = read_indexed(dev_name, state, mid1, ((l / k) % k) as usize)?;
        return read_indexed(dev_name, state, mid2, (l % k) as usize);
    }

    Ok(0)
}

/// Like [`lookup_block`], but allocates missing direct pointers and
/// indirect blocks along the way (used by `write` to grow a file).
///
fn ensure_block(dev_name: &str, state: &mut State, inode: &mut Inode, logical: u64) -> Result<u32, Error> {
    let k = state.super_block.block_size() as u64 / 4;

    if logical < 12 {
        let idx = logical as usize;
        if inode.direct[idx] == 0 {
            let block = allocate_block(dev_name, state)?;
            zero_block(dev_name, state, block)?;
            inode.direct[idx] = block;
        }
        return Ok(inode.direct[idx]);
    }
    let mut l = logical - 12;

    if l < k {
        let s = ensure_pointer_block(dev_name, state, &mut inode.s_indirect)?;
        return ensure_indexed(dev_name, state, s, l as usize);
    }
    l -= k;

    if l < k * k {
        let d = ensure_pointer_block(dev_name, state, &mut inode.d_indirect)?;
        let mid = ensure_indexed(dev_name, state, d, (l / k) as usize)?;
        return ensure_indexed(dev_name, state, mid, (l % k) as usize);
    }
    l -= k * k;

    if l < k * k * k {
        let t = ensure_pointer_block(dev_name, state, &mut inode.t_indirect)?;
        let mid1 = ensure_indexed(dev_name, state, t, (l / (k * k)) as usize)?;
        let mid2 = ensure_indexed(dev_name, state, mid1, ((l / k) % k) as usize)?;
        return ensure_indexed(dev_name, state, mid2, (l % k) as usize);
    }

    Err(Error::NoSpace)
}

/// Deallocates every block referenced (directly or indirectly) by
/// `block`, then deallocates `block` itself.
///
/// Grounded on `Ext2File::truncate_recursive`, but — per spec.md §9's
/// explicit instruction — walks every pointer unconditionally instead
/// of stopping at the first zero pointer, so sparse files with holes
/// followed by further data are fully freed.
///
fn truncate_block_tree(dev_name: &str, state: &mut State, block: u32, depth: u32) -> Result<(), Error> {
    if depth > 1 {
        let block_size = state.super_block.block_size();
        let k = block_size / 4;
        let data = read_device(dev_name, block_to_byte(&state.super_block, block as u64), block_size)?;
        for i in 0..k {
            let child = ru32(&data, i * 4);
            if child != 0 {
                truncate_block_tree(dev_name, state, child, depth - 1)?;
            }
        }
    }
    deallocate_block(dev_name, state, block)
}

fn truncate_indirect(dev_name: &str, state: &mut State, ptr: &mut u32, depth: u32) -> Result<(), Error> {
    if *ptr == 0 {
        return Ok(());
    }
    truncate_block_tree(dev_name, state, *ptr, depth)?;
    *ptr = 0;
    Ok(())
}

/// Reads a directory's entries, grounded on `Ext2Directory`'s
/// constructor in the original: each data block is its own
/// self-contained run of records, each padded to 4 bytes and skipped
/// over via its own record-size field; an inode index of `0` marks a
/// tombstone that still consumes its record space.
///
fn read_dir_entries(dev_name: &str, state: &State, inode: &Inode) -> Result<Vec<(u32, String)>, Error> {
    let has_file_type = state.super_block.required_features & REQUIRED_DIRECTORIES_TYPE != 0;
    let block_size = state.super_block.block_size() as u64;
    let size = file_size_for_dir(inode);
    let num_blocks = div_ceil_u64(size, block_size);

    let mut entries = Vec::new();
    for logical in 0..num_blocks {
        let block = lookup_block(dev_name, state, inode, logical)?;
        if block == 0 {
            break;
        }
        let buffer = read_device(dev_name, block_to_byte(&state.super_block, block as u64), block_size as usize)?;

        let mut off = 0usize;
        while off + 8 <= buffer.len() {
            let entry_inode = ru32(&buffer, off);
            let rec_len = ru16(&buffer, off + 2) as usize;
            if rec_len < 8 {
                break;
            }
            let name_length_low = buffer[off + 4];
            let name_length_high = buffer[off + 5];
            let name_length = if has_file_type {
                name_length_low as usize
            } else {
                name_length_low as usize + ((name_length_high as usize) << 8)
            };

            if entry_inode != 0 {
                let name_start = off + 8;
                let name_end = (name_start + name_length).min(buffer.len());
                let name = String::from_utf8_lossy(&buffer[name_start..name_end]).to_string();
                entries.push((entry_inode, name));
            }

            off += rec_len;
        }
    }
    Ok(entries)
}

fn file_size_for_dir(inode: &Inode) -> u64 {
    inode.lower_size as u64
}

fn div_ceil_u64(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

fn get_inode_by_index(dev_name: &str, state: &State, index: u32) -> Result<Inode, Error> {
    if index == 0 || index > state.super_block.no_inodes {
        return Err(Error::NotFound);
    }
    let group = (index - 1) / state.super_block.inodes_per_group;
    let offset = (index - 1) % state.super_block.inodes_per_group;
    let bgd = state.bgdt.get(group as usize).ok_or(Error::NotFound)?;
    let loc = block_to_byte(&state.super_block, bgd.inode_table as u64)
        + offset as usize * state.super_block.inode_size as usize;
    let bytes = read_device(dev_name, loc, INODE_READ_SIZE)?;
    Inode::from_bytes(&bytes)
}

fn update_inode_by_index(dev_name: &str, state: &State, index: u32, inode: &Inode) -> Result<(), Error> {
    if index == 0 || index > state.super_block.no_inodes {
        return Err(Error::InvalidArgument);
    }
    let group = (index - 1) / state.super_block.inodes_per_group;
    let offset = (index - 1) % state.super_block.inodes_per_group;
    let bgd = state.bgdt.get(group as usize).ok_or(Error::InvalidArgument)?;
    let inode_size = state.super_block.inode_size as usize;
    let loc = block_to_byte(&state.super_block, bgd.inode_table as u64) + offset as usize * inode_size;

    let mut buf = read_device(dev_name, loc, inode_size)?;
    let serialized = inode.to_bytes();
    buf[..INODE_READ_SIZE].copy_from_slice(&serialized);
    write_device(dev_name, loc, &buf)
}

/// Resolves an absolute path to an inode, grounded on
/// `Ext2FileSystem::get_inode(const klib::string&)` in the original:
/// names must start with `/`; consecutive separators collapse; a
/// trailing separator is equivalent to none.
///
fn get_inode_by_path(dev_name: &str, state: &State, name: &str) -> Result<(u32, Inode), Error> {
    if !name.starts_with('/') {
        return Err(Error::NotFound);
    }
    let bytes = name.as_bytes();
    let mut pos = 0usize;
    while pos < bytes.len() && bytes[pos] == b'/' {
        pos += 1;
    }

    let mut inode_index = ROOT_INODE;
    let mut dir_inode = get_inode_by_index(dev_name, state, inode_index)?;

    while pos < name.len() {
        let end_pos = name[pos..].find('/').map(|i| pos + i).unwrap_or(name.len());
        let current = &name[pos..end_pos];

        let entries = read_dir_entries(dev_name, state, &dir_inode)?;
        let found = entries.iter().find(|(_, n)| n == current).map(|(i, _)| *i);
        inode_index = match found {
            Some(i) if i != 0 => i,
            _ => return Err(Error::NotFound),
        };
        dir_inode = get_inode_by_index(dev_name, state, inode_index)?;

        pos = end_pos;
        while pos < bytes.len() && bytes[pos] == b'/' {
            pos += 1;
        }
    }

    Ok((inode_index, dir_inode))
}

/// A mounted ext2 file system, grounded on `Ext2FileSystem` in the
/// original.
///
pub struct Ext2Fs {
    dev_name: String,
    read_only: bool,
    state: Arc<Mutex<State>>,
}

impl Ext2Fs {
    /// Probes `dev_name` for an ext2 signature and, if found, mounts
    /// it: reads the superblock, validates its feature masks (the
    /// required set must be a subset of [`REQUIRED_SUPPORTED`], the
    /// write-required set a subset of [`WRITE_SUPPORTED`] or the mount
    /// becomes read-only), and reads the block group descriptor table.
    ///
    pub fn probe(dev_name: &str) -> Result<Ext2Fs, Error> {
        let sig_bytes = read_device(dev_name, SUPERBLOCK_OFFSET + 56, 2)?;
        if u16::from_le_bytes([sig_bytes[0], sig_bytes[1]]) != SIGNATURE {
            return Err(Error::Unsupported);
        }

        let sb_bytes = read_device(dev_name, SUPERBLOCK_OFFSET, DISK_SIZE)?;
        let super_block = SuperBlock::from_bytes(&sb_bytes)?;

        if super_block.required_features & !REQUIRED_SUPPORTED != 0 {
            return Err(Error::Unsupported);
        }
        let read_only = super_block.write_features & !WRITE_SUPPORTED != 0;

        let no_bg = div_ceil(super_block.no_blocks, super_block.blocks_per_group);
        let no_bg_by_inodes = div_ceil(super_block.no_inodes, super_block.inodes_per_group);
        if no_bg != no_bg_by_inodes {
            return Err(Error::Unsupported);
        }

        let bgdt_off = bgdt_offset(&super_block);
        let mut bgdt = Vec::with_capacity(no_bg as usize);
        for i in 0..no_bg {
            let bytes = read_device(dev_name, bgdt_off + i as usize * BGD_SIZE, BGD_SIZE)?;
            bgdt.push(BlockGroupDescriptor::from_bytes(&bytes));
        }

        Ok(Ext2Fs {
            dev_name: dev_name.to_string(),
            read_only,
            state: Arc::new(Mutex::new(State {
                super_block,
                bgdt,
                dirty: false,
            })),
        })
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().super_block.block_size()
    }

    pub fn block_to_byte(&self, block: u64) -> u64 {
        block * self.block_size() as u64
    }

    pub fn byte_to_block(&self, offset: u64) -> u64 {
        offset / self.block_size() as u64
    }

    pub fn diropen(&self, path: &str) -> Result<Vec<String>, Error> {
        let state = self.state.lock();
        let (_, inode) = get_inode_by_path(&self.dev_name, &state, path)?;
        if inode_type(&inode) != InodeType::Directory {
            return Err(Error::NotADirectory);
        }
        let entries = read_dir_entries(&self.dev_name, &state, &inode)?;
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }

    pub fn fopen(&self, path: &str, mode: OpenMode) -> Result<Ext2File, Error> {
        if self.read_only && mode.writable() {
            return Err(Error::NotPermitted);
        }

        let (index, inode) = {
            let state = self.state.lock();
            get_inode_by_path(&self.dev_name, &state, path)?
        };
        if inode_type(&inode) == InodeType::Directory {
            return Err(Error::IsADirectory);
        }

        let mut file = Ext2File {
            dev_name: self.dev_name.clone(),
            state: self.state.clone(),
            inode,
            inode_index: index,
            position: 0,
            mode,
        };

        if matches!(mode, OpenMode::Write | OpenMode::WriteRead) {
            file.truncate()?;
        }
        if matches!(mode, OpenMode::Append | OpenMode::AppendRead) {
            file.position = file.size();
        }

        Ok(file)
    }

    /// Directory-entry creation and removal aren't named operations
    /// in spec.md's ext2 component; failing cleanly here matches the
    /// original leaving the equivalent unlink path unimplemented.
    ///
    pub fn remove(&self, _path: &str) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::NotPermitted);
        }
        Err(Error::Unsupported)
    }

    /// `Ext2FileSystem::rename` is a `// TODO` stub in the original;
    /// preserved here as a clean failure rather than inventing a
    /// directory-entry rewrite scheme spec.md doesn't describe.
    ///
    pub fn rename(&self, _old: &str, _new: &str) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

/// An open handle on an ext2 file, grounded on `Ext2File` in the
/// original.
///
pub struct Ext2File {
    dev_name: String,
    state: Arc<Mutex<State>>,
    inode: Inode,
    inode_index: u32,
    position: u64,
    mode: OpenMode,
}

impl Ext2File {
    /// The file's current size in bytes.
    ///
    pub fn size(&self) -> u64 {
        file_size(&self.state.lock().super_block, &self.inode)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.mode.readable() {
            return Err(Error::NotPermitted);
        }

        let state = self.state.lock();
        let size = file_size(&state.super_block, &self.inode);
        if self.position >= size {
            return Ok(0);
        }

        let block_size = state.super_block.block_size() as u64;
        let to_read = (buf.len() as u64).min(size - self.position) as usize;
        let mut read = 0usize;
        while read < to_read {
            let logical = self.position / block_size;
            let within = (self.position % block_size) as usize;
            let block = lookup_block(&self.dev_name, &state, &self.inode, logical)?;
            let chunk = (block_size as usize - within).min(to_read - read);

            if block == 0 {
                for b in &mut buf[read..read + chunk] {
                    *b = 0;
                }
            } else {
                let data =
                    read_device(&self.dev_name, block_to_byte(&state.super_block, block as u64), block_size as usize)?;
                buf[read..read + chunk].copy_from_slice(&data[within..within + chunk]);
            }

            read += chunk;
            self.position += chunk as u64;
        }
        Ok(read)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if !self.mode.writable() {
            return Err(Error::NotPermitted);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if matches!(self.mode, OpenMode::Append | OpenMode::AppendRead) {
            self.position = self.size();
        }

        let mut state = self.state.lock();
        let block_size = state.super_block.block_size() as u64;

        let mut written = 0usize;
        while written < buf.len() {
            let logical = self.position / block_size;
            let within = (self.position % block_size) as usize;
            let block = ensure_block(&self.dev_name, &mut state, &mut self.inode, logical)?;
            let chunk = (block_size as usize - within).min(buf.len() - written);

            let mut data =
                read_device(&self.dev_name, block_to_byte(&state.super_block, block as u64), block_size as usize)?;
            data[within..within + chunk].copy_from_slice(&buf[written..written + chunk]);
            write_device(&self.dev_name, block_to_byte(&state.super_block, block as u64), &data)?;

            written += chunk;
            self.position += chunk as u64;
        }

        let new_size = file_size(&state.super_block, &self.inode).max(self.position);
        set_file_size(&state.super_block, &mut self.inode, new_size);
        self.inode.sectors = ((new_size + 511) / 512) as u32;
        update_inode_by_index(&self.dev_name, &state, self.inode_index, &self.inode)?;

        Ok(written)
    }

    pub fn seek(&mut self, pos: u64) -> Result<u64, Error> {
        self.position = pos;
        Ok(self.position)
    }

    /// Empties the file: walks direct, singly, doubly and triply
    /// indirect pointers unconditionally (spec.md §9's resolution of
    /// the original's early-stop bug), deallocating every non-zero
    /// block, zeroing the pointers, the size fields and the sector
    /// count, and persisting the updated inode.
    ///
    pub fn truncate(&mut self) -> Result<(), Error> {
        if !self.mode.writable() {
            return Err(Error::NotPermitted);
        }

        let mut state = self.state.lock();
        for ptr in self.inode.direct.iter_mut() {
            if *ptr != 0 {
                deallocate_block(&self.dev_name, &mut state, *ptr)?;
                *ptr = 0;
            }
        }
        truncate_indirect(&self.dev_name, &mut state, &mut self.inode.s_indirect, 1)?;
        truncate_indirect(&self.dev_name, &mut state, &mut self.inode.d_indirect, 2)?;
        truncate_indirect(&self.dev_name, &mut state, &mut self.inode.t_indirect, 3)?;

        self.inode.lower_size = 0;
        if inode_type(&self.inode) == InodeType::File {
            self.inode.upper_size = 0;
        }
        self.inode.sectors = 0;
        self.position = 0;

        update_inode_by_index(&self.dev_name, &state, self.inode_index, &self.inode)
    }
}

impl Drop for Ext2Fs {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.dirty {
            return;
        }

        let bgdt_off = bgdt_offset(&state.super_block);
        for (i, bgd) in state.bgdt.iter().enumerate() {
            let _ = write_device(&self.dev_name, bgdt_off + i * BGD_SIZE, &bgd.to_bytes());
        }
        let sb_bytes = state.super_block.to_bytes();
        let _ = write_device(&self.dev_name, SUPERBLOCK_OFFSET, &sb_bytes);
        state.dirty = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::boxed::Box;
    use storage::block::{Device, Operations};

    struct TestDevice {
        data: Vec<u8>,
    }

    impl Device for TestDevice {
        fn segment_size(&self) -> usize {
            1024
        }

        fn num_segments(&self) -> usize {
            self.data.len() / 1024
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }

        fn operations(&self) -> Operations {
            Operations::READ | Operations::WRITE | Operations::FLUSH
        }

        fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, block::Error> {
            let start = segment * 1024;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(buf.len())
        }

        fn write(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, block::Error> {
            let start = segment * 1024;
            self.data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self, _segment: usize) -> Result<(), block::Error> {
            Ok(())
        }
    }

    /// Builds a minimal 64 KiB, single-block-group ext2 image: block 0
    /// is the unused boot block, block 1 the superblock, block 2 the
    /// (one-entry) BGDT, block 3 the block bitmap, block 4 the inode
    /// bitmap, blocks 5-8 the 32-entry inode table, block 9 the root
    /// directory's sole data block (one entry, "greeting" -> inode 11,
    /// an empty regular file). Blocks 10-63 are free for test writes.
    fn make_image() -> Vec<u8> {
        const BLOCK_SIZE: usize = 1024;
        const TOTAL_BLOCKS: usize = 64;
        let mut img = vec![0u8; BLOCK_SIZE * TOTAL_BLOCKS];

        let sb = &mut img[1024..2048];
        wu32(sb, 0, 32); // no_inodes
        wu32(sb, 4, TOTAL_BLOCKS as u32); // no_blocks
        wu32(sb, 12, 55); // unalloc_blocks (64 - 9 used)
        wu32(sb, 16, 21); // unalloc_inodes (32 - 11 reserved)
        wu32(sb, 20, 1); // first_data_block
        wu32(sb, 24, 0); // block_size_shift -> 1024
        wu32(sb, 28, 0); // fragment_size_shift
        wu32(sb, 32, 64); // blocks_per_group
        wu32(sb, 36, 64); // fragments_per_group
        wu32(sb, 40, 32); // inodes_per_group
        wu16(sb, 56, SIGNATURE);
        wu32(sb, 76, 0); // major_version: no extended fields

        let bgdt = &mut img[2048..2048 + BGD_SIZE];
        wu32(bgdt, 0, 3); // block_map
        wu32(bgdt, 4, 4); // inode_map
        wu32(bgdt, 8, 5); // inode_table
        wu16(bgdt, 12, 55); // unalloc_blocks
        wu16(bgdt, 14, 21); // unalloc_inodes
        wu16(bgdt, 16, 1); // dirs

        // Block bitmap (block 3): bits 0-8 set, i.e. blocks 1-9 in use.
        img[3072] = 0xFF;
        img[3073] = 0x01;

        // Inode bitmap (block 4): bits 0-10 set, i.e. inodes 1-11 in use.
        img[4096] = 0xFF;
        img[4097] = 0x07;

        // Inode table starts at block 5 (byte 5120).
        let root = &mut img[5120 + 128..5120 + 256];
        wu16(root, 0, 0x4000); // directory
        wu16(root, 26, 2); // hard_links
        wu32(root, 4, BLOCK_SIZE as u32); // lower_size
        wu32(root, 40, 9); // direct[0] = block 9
        wu32(root, 28, 2); // sectors

        let file = &mut img[5120 + 1280..5120 + 1408];
        wu16(file, 0, 0x8000); // regular file
        wu16(file, 26, 1); // hard_links

        // Root directory data (block 9): one entry spanning the block.
        let entry = &mut img[9216..10240];
        wu32(entry, 0, 11); // inode
        wu16(entry, 4, 1024); // rec_len
        entry[6] = 8; // name_length_low
        entry[7] = 0; // name_length_high
        entry[8..16].copy_from_slice(b"greeting");

        img
    }

    fn mount(name: &str) -> Ext2Fs {
        block::add_device(name.to_string(), Box::new(TestDevice { data: make_image() }));
        Ext2Fs::probe(name).unwrap()
    }

    #[test]
    fn probe_reads_superblock_and_bgdt() {
        let fs = mount("ext2-test-a");
        let state = fs.state.lock();
        assert_eq!(state.super_block.signature, SIGNATURE);
        assert_eq!(state.super_block.no_blocks, 64);
        assert_eq!(state.bgdt.len(), 1);
        assert_eq!(state.bgdt[0].inode_table, 5);
    }

    #[test]
    fn path_resolution_requires_leading_slash() {
        let fs = mount("ext2-test-b");
        let state = fs.state.lock();
        assert!(get_inode_by_path("ext2-test-b", &state, "greeting").is_err());
        let (idx, inode) = get_inode_by_path("ext2-test-b", &state, "/greeting").unwrap();
        assert_eq!(idx, 11);
        assert_eq!(inode_type(&inode), InodeType::File);
    }

    #[test]
    fn diropen_lists_root_entries() {
        let fs = mount("ext2-test-c");
        let entries = fs.diropen("/").unwrap();
        assert_eq!(entries, alloc::vec!["greeting".to_string()]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let fs = mount("ext2-test-d");
        let mut f = fs.fopen("/greeting", OpenMode::WriteRead).unwrap();
        assert_eq!(f.write(b"hello world").unwrap(), 11);
        assert_eq!(f.size(), 11);

        f.seek(0).unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(f.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn truncate_zeroes_size_and_pointers() {
        let fs = mount("ext2-test-e");
        {
            let mut f = fs.fopen("/greeting", OpenMode::WriteRead).unwrap();
            f.write(b"some file content").unwrap();
        }

        let mut f = fs.fopen("/greeting", OpenMode::Write).unwrap();
        assert_eq!(f.size(), 0);
        assert_eq!(f.inode.direct, [0u32; 12]);
        assert_eq!(f.inode.sectors, 0);
        f.write(b"x").unwrap();
        assert_eq!(f.size(), 1);
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        block::add_device("ext2-test-f".to_string(), Box::new(TestDevice { data: make_image() }));
        let mut fs = Ext2Fs::probe("ext2-test-f").unwrap();
        fs.read_only = true;
        assert!(matches!(
            fs.fopen("/greeting", OpenMode::WriteRead),
            Err(Error::NotPermitted)
        ));
        assert!(fs.fopen("/greeting", OpenMode::Read).is_ok());
    }
}
