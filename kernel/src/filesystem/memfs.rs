// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A file system that exists only in memory, grounded on
//! `MemoryFileSystem.h`/`.cpp` from the original implementation.
//!
//! Every name maps to an inode: `{addr, size, link_count}`. Several
//! names may map to the same inode (hard links). An inode's memory is
//! either owned by this file system (allocated by [`MemFs::create_file`])
//! or merely adopted from elsewhere (`create_mapping` with an explicit
//! address) — used at boot to expose a loader-provided buffer, such as
//! a Multiboot module, as a file without copying it.

use crate::file_table;
use crate::{Error, OpenMode};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// The default size given to a file created implicitly by `fopen`
/// in a write mode when no file of that name yet exists.
///
const NEW_FILE_SIZE: usize = 1024;

enum Storage {
    /// Memory owned by this file system; freed when the inode's link
    /// count reaches zero and no file-table handle remains.
    Owned(Vec<u8>),
    /// Memory owned by someone else (a loader buffer). Never freed by
    /// `MemFs`; `reallocate_file`/`delete_file` on such an inode only
    /// ever drop the mapping, not the bytes.
    External { addr: u32, size: usize },
}

struct Inode {
    storage: Mutex<Storage>,
}

/// An in-memory file system, grounded on `MemoryFileSystem` in the
/// original implementation.
///
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<Inode>>>,
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs::new()
    }
}

impl MemFs {
    /// Returns a new, empty in-memory file system.
    ///
    pub fn new() -> Self {
        MemFs {
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Lists the names that have `prefix` as the matching path
    /// segment, stripping anything after the next `/`, mirroring
    /// `MemoryFileSystem::diropen`'s synthesised directory listing.
    ///
    pub fn diropen(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let prefix = prefix.trim_start_matches('/');
        let files = self.files.lock();

        let mut matches = Vec::new();
        for name in files.keys() {
            if !name.starts_with(prefix) {
                continue;
            }
            let mut rest = &name[prefix.len()..];
            rest = rest.trim_start_matches('/');
            let entry = match rest.find('/') {
                Some(i) => &rest[..i],
                None => rest,
            };
            if !entry.is_empty() && !matches.contains(&entry.to_string()) {
                matches.push(entry.to_string());
            }
        }
        Ok(matches)
    }

    /// Opens `name`, creating a new 1 KiB file if it doesn't exist and
    /// `mode` isn't a pure-read mode.
    ///
    pub fn fopen(&self, name: &str, mode: OpenMode) -> Result<MemFile, Error> {
        let name = name.trim_start_matches('/');
        if !self.files.lock().contains_key(name) {
            if matches!(mode, OpenMode::Read | OpenMode::ReadWrite) {
                return Err(Error::NotFound);
            }
            self.create_file(name, NEW_FILE_SIZE);
        }

        let inode = self.files.lock().get(name).ok_or(Error::NotFound)?.clone();
        let position = match mode {
            OpenMode::Append | OpenMode::AppendRead => {
                let storage = inode.storage.lock();
                storage_len(&storage) as u64
            }
            _ => 0,
        };
        if matches!(mode, OpenMode::Write | OpenMode::WriteRead) {
            self.reallocate_inode(&inode, 0);
        }

        Ok(MemFile {
            name: name.to_string(),
            inode,
            position,
            mode,
        })
    }

    /// Creates a new owned file of `sz` bytes, zero-initialised, with
    /// a single hard link. Does nothing if `name` already exists.
    ///
    pub fn create_file(&self, name: &str, sz: usize) {
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return;
        }
        files.insert(
            name.to_string(),
            Arc::new(Inode {
                storage: Mutex::new(Storage::Owned(vec![0u8; sz])),
            }),
        );
    }

    /// Adds a hard link `name` to an existing inode (identified by
    /// any of its current names), incrementing its link count.
    ///
    pub fn create_mapping_alias(&self, name: &str, existing: &str) -> Result<(), Error> {
        let mut files = self.files.lock();
        let inode = files.get(existing).ok_or(Error::NotFound)?.clone();
        files.insert(name.to_string(), inode);
        Ok(())
    }

    /// Adopts an externally-owned memory range as a new file, not
    /// managed by this file system's allocator.
    ///
    /// Grounded on `create_mapping(name, addr, sz)` in the original:
    /// used to expose loader buffers (Multiboot modules) as files
    /// during boot without copying them.
    ///
    pub fn create_mapping(&self, name: &str, addr: u32, sz: usize) {
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return;
        }
        files.insert(
            name.to_string(),
            Arc::new(Inode {
                storage: Mutex::new(Storage::External { addr, size: sz }),
            }),
        );
    }

    /// Decrements `name`'s link count (by dropping this name's Arc
    /// reference to its inode) and deletes the underlying memory iff
    /// the link count has reached zero and the file table reports no
    /// open handles for `name` (unless `ft_check` is false, for use
    /// before the file table exists during early boot).
    ///
    /// A link count reaching zero with an open handle remaining
    /// postpones the deletion: the open `MemFile` still holds its own
    /// `Arc` clone, so the inode's memory is only actually released
    /// once every handle is closed, regardless of when this map entry
    /// is removed.
    ///
    pub fn delete_file(&self, name: &str, ft_check: bool) {
        let mut files = self.files.lock();
        if !files.contains_key(name) {
            return;
        }
        if !ft_check || file_table::is_open(name) == 0 {
            files.remove(name);
        }
    }

    /// Equivalent to [`MemFs::delete_file`] with `ft_check` always
    /// enabled.
    ///
    pub fn delete_mapping(&self, name: &str) {
        self.delete_file(name, true);
    }

    /// Equivalent to `delete_file(name, true)`.
    ///
    pub fn unlink(&self, name: &str) -> Result<(), Error> {
        let name = name.trim_start_matches('/');
        if !self.files.lock().contains_key(name) {
            return Err(Error::NotFound);
        }
        self.delete_file(name, true);
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), Error> {
        let mut files = self.files.lock();
        let inode = files.remove(old).ok_or(Error::NotFound)?;
        files.insert(new.to_string(), inode);
        Ok(())
    }

    fn reallocate_inode(&self, inode: &Arc<Inode>, new_sz: usize) {
        let mut storage = inode.storage.lock();
        match &mut *storage {
            Storage::Owned(data) => {
                let mut new_data = vec![0u8; new_sz];
                let copy_len = data.len().min(new_sz);
                new_data[..copy_len].copy_from_slice(&data[..copy_len]);
                *data = new_data;
            }
            Storage::External { size, .. } => {
                // Reallocating an externally-owned mapping only changes
                // the size the file system reports; the bytes beyond
                // the original external buffer are undefined, matching
                // a loader buffer being "grown" without real backing.
                *size = new_sz;
            }
        }
    }

    /// Grows or shrinks `name`'s backing memory.
    ///
    pub fn reallocate_file(&self, name: &str, new_sz: usize) -> Result<(), Error> {
        let files = self.files.lock();
        let inode = files.get(name).ok_or(Error::NotFound)?;
        self.reallocate_inode(inode, new_sz);
        Ok(())
    }
}

fn storage_len(storage: &Storage) -> usize {
    match storage {
        Storage::Owned(data) => data.len(),
        Storage::External { size, .. } => *size,
    }
}

/// An open handle onto a `MemFs` file.
///
pub struct MemFile {
    name: String,
    inode: Arc<Inode>,
    position: u64,
    mode: OpenMode,
}

impl MemFile {
    /// The inode's size in bytes.
    ///
    pub fn size(&self) -> usize {
        storage_len(&self.inode.storage.lock())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.mode == OpenMode::Write {
            return Err(Error::NotPermitted);
        }

        let storage = self.inode.storage.lock();
        let data: &[u8] = match &*storage {
            Storage::Owned(data) => data,
            Storage::External { addr, size } => {
                // SAFETY: the caller of `create_mapping` guarantees
                // `addr..addr+size` is valid kernel-accessible memory
                // for the lifetime of the mapping.
                unsafe { core::slice::from_raw_parts(*addr as *const u8, *size) }
            }
        };

        let pos = self.position as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.position += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.mode == OpenMode::Read {
            return Err(Error::NotPermitted);
        }
        if matches!(self.mode, OpenMode::Append | OpenMode::AppendRead) {
            self.position = self.size() as u64;
        }

        let mut storage = self.inode.storage.lock();
        match &mut *storage {
            Storage::Owned(data) => {
                let pos = self.position as usize;
                if pos + buf.len() > data.len() {
                    data.resize(pos + buf.len(), 0);
                }
                data[pos..pos + buf.len()].copy_from_slice(buf);
                self.position += buf.len() as u64;
                Ok(buf.len())
            }
            Storage::External { addr, size } => {
                if self.position as usize + buf.len() > *size {
                    return Err(Error::NoSpace);
                }
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        (*addr as *mut u8).add(self.position as usize),
                        buf.len(),
                    );
                }
                self.position += buf.len() as u64;
                Ok(buf.len())
            }
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<u64, Error> {
        self.position = pos;
        Ok(self.position)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
impl MemFile {
    pub(crate) fn test_instance() -> Self {
        MemFile {
            name: "test".to_string(),
            inode: Arc::new(Inode {
                storage: Mutex::new(Storage::Owned(vec![0u8; 16])),
            }),
            position: 0,
            mode: OpenMode::ReadWrite,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_then_read_write_round_trips() {
        let fs = MemFs::new();
        let mut f = fs.fopen("greeting", OpenMode::WriteRead).unwrap();
        assert_eq!(f.write(b"hello").unwrap(), 5);
        f.seek(0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_mode_rejects_missing_file() {
        let fs = MemFs::new();
        assert!(matches!(fs.fopen("missing", OpenMode::Read), Err(Error::NotFound)));
    }

    #[test]
    fn write_mode_truncates_existing_file() {
        let fs = MemFs::new();
        fs.create_file("f", 32);
        {
            let mut f = fs.fopen("f", OpenMode::WriteRead).unwrap();
            f.write(b"0123456789").unwrap();
        }
        let mut f = fs.fopen("f", OpenMode::Write).unwrap();
        assert_eq!(f.size(), 0);
        f.write(b"x").unwrap();
        assert_eq!(f.size(), 1);
    }

    #[test]
    fn append_mode_always_writes_at_end() {
        let fs = MemFs::new();
        let mut f = fs.fopen("log", OpenMode::Append).unwrap();
        f.write(b"a").unwrap();
        f.seek(0).unwrap();
        f.write(b"b").unwrap();
        assert_eq!(f.size(), 2);
    }

    #[test]
    fn diropen_strips_past_next_separator() {
        let fs = MemFs::new();
        fs.create_file("bin/init", 1);
        fs.create_file("bin/sh", 1);
        fs.create_file("etc/passwd", 1);
        let mut entries = fs.diropen("bin").unwrap();
        entries.sort();
        assert_eq!(entries, vec!["init".to_string(), "sh".to_string()]);
    }

    #[test]
    fn create_mapping_exposes_external_memory_without_copying() {
        let fs = MemFs::new();
        let backing = vec![1u8, 2, 3, 4];
        fs.create_mapping("module0", backing.as_ptr() as u32, backing.len());
        let mut f = fs.fopen("module0", OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        f.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
