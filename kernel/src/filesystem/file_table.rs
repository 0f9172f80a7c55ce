// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel-global file table, keyed by opaque integer keys.
//!
//! Per-process file descriptor maps hold a small-int local fd mapping
//! into this table, rather than owning an `OpenFile` directly; this is
//! what lets `fork` share a single underlying file (and its seek
//! position) between parent and child by incrementing a reference
//! count instead of duplicating state.

use crate::OpenFile;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use interrupts::without_interrupts;
use spin::Mutex;

/// An opaque key identifying an entry in the file table.
///
pub type FileKey = u32;

struct Entry {
    name: String,
    file: OpenFile,
    ref_count: usize,
}

static TABLE: Mutex<BTreeMap<FileKey, Entry>> = Mutex::new(BTreeMap::new());
static NEXT_KEY: Mutex<FileKey> = Mutex::new(0);

/// Returned when an operation names a key with no corresponding
/// entry.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotOpen;

/// Registers `file`, opened from `name`, with an initial reference
/// count of one, returning the key it is now addressable by.
///
pub fn open(name: &str, file: OpenFile) -> FileKey {
    without_interrupts(|| {
        let mut next = NEXT_KEY.lock();
        let key = *next;
        *next = next.wrapping_add(1);
        TABLE.lock().insert(
            key,
            Entry {
                name: name.to_string(),
                file,
                ref_count: 1,
            },
        );
        key
    })
}

/// Decrements the reference count on `key`, removing the entry once
/// it reaches zero.
///
pub fn close(key: FileKey) -> Result<(), NotOpen> {
    without_interrupts(|| {
        let mut table = TABLE.lock();
        let entry = table.get_mut(&key).ok_or(NotOpen)?;
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            table.remove(&key);
        }
        Ok(())
    })
}

/// Increments the reference count on `key`, for use when `fork`
/// duplicates a file descriptor into the child's table.
///
pub fn copy(key: FileKey) -> Result<(), NotOpen> {
    without_interrupts(|| {
        let mut table = TABLE.lock();
        let entry = table.get_mut(&key).ok_or(NotOpen)?;
        entry.ref_count += 1;
        Ok(())
    })
}

/// Returns the number of open handles referencing `name`.
///
/// Used by `MemFs` to decide whether a zero-link-count inode's memory
/// can be released yet.
///
pub fn is_open(name: &str) -> usize {
    without_interrupts(|| TABLE.lock().values().filter(|e| e.name == name).count())
}

/// Runs `f` with mutable access to the file behind `key`.
///
pub fn with_file<R>(key: FileKey, f: impl FnOnce(&mut OpenFile) -> R) -> Option<R> {
    without_interrupts(|| TABLE.lock().get_mut(&key).map(|e| f(&mut e.file)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memfs::MemFile;

    fn dummy_file() -> OpenFile {
        OpenFile::Mem(MemFile::test_instance())
    }

    #[test]
    fn open_close_round_trips() {
        let key = open("/tmp/a", dummy_file());
        assert_eq!(is_open("/tmp/a"), 1);
        assert!(close(key).is_ok());
        assert_eq!(is_open("/tmp/a"), 0);
        assert_eq!(close(key), Err(NotOpen));
    }

    #[test]
    fn copy_keeps_entry_alive_until_every_close() {
        let key = open("/tmp/b", dummy_file());
        copy(key).unwrap();
        assert_eq!(is_open("/tmp/b"), 1);
        close(key).unwrap();
        assert_eq!(is_open("/tmp/b"), 1);
        close(key).unwrap();
        assert_eq!(is_open("/tmp/b"), 0);
    }
}
