// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's virtual file system layer: a mount table
//! mapping absolute-path prefixes to concrete file systems, plus the
//! process-wide open file table shared by every mounted file system.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod devfs;
pub mod ext2;
pub mod file_table;
pub mod memfs;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use interrupts::without_interrupts;
use spin::Mutex;

/// Describes an error encountered while operating on the virtual file
/// system or one of its concrete file systems.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No file, directory, or device exists at the given name.
    NotFound,

    /// The operation is not permitted on this kind of file.
    NotPermitted,

    /// An entry already exists where one is being created.
    AlreadyExists,

    /// An operation that requires a directory was given a file.
    NotADirectory,

    /// An operation that requires a file was given a directory.
    IsADirectory,

    /// The argument supplied (a path, a mode string, a size) is
    /// malformed.
    InvalidArgument,

    /// The underlying device or file system has no space left.
    NoSpace,

    /// The underlying block device returned an error.
    DeviceError,

    /// `rename` was asked to move a file across file systems.
    CrossDevice,

    /// No mount point matches the given path.
    NoMount,

    /// The named device is already mounted.
    AlreadyMounted,

    /// The on-disk file system carries a required feature this
    /// implementation does not support.
    Unsupported,
}

/// A file open mode, following the `r`, `r+`, `w`, `w+`, `a`, `a+`
/// grammar (each optionally suffixed with an ignored `b`).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`: read-only; fails if the file does not exist.
    Read,

    /// `r+`: read and write; fails if the file does not exist; does
    /// not truncate.
    ReadWrite,

    /// `w`: write-only; creates the file if missing; truncates if it
    /// already exists.
    Write,

    /// `w+`: read and write; creates the file if missing; truncates
    /// if it already exists.
    WriteRead,

    /// `a`: write-only, positioned at end-of-file; every write is
    /// made to append, regardless of an explicit seek.
    Append,

    /// `a+`: read and write, initially positioned at end-of-file.
    AppendRead,
}

impl OpenMode {
    /// Parses a mode string per spec.md §4.4's grammar. An optional
    /// trailing `b` is accepted and ignored.
    ///
    pub fn from_mode_str(s: &str) -> Result<OpenMode, Error> {
        let s = s.strip_suffix('b').unwrap_or(s);
        match s {
            "r" => Ok(OpenMode::Read),
            "r+" => Ok(OpenMode::ReadWrite),
            "w" => Ok(OpenMode::Write),
            "w+" => Ok(OpenMode::WriteRead),
            "a" => Ok(OpenMode::Append),
            "a+" => Ok(OpenMode::AppendRead),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Whether this mode permits reading.
    ///
    pub fn readable(self) -> bool {
        !matches!(self, OpenMode::Write | OpenMode::Append)
    }

    /// Whether this mode permits writing.
    ///
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// An open file handle, addressing whichever concrete file system it
/// was opened from.
///
pub enum OpenFile {
    Dev(devfs::DeviceFile),
    Mem(memfs::MemFile),
    Ext2(ext2::Ext2File),
}

impl OpenFile {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            OpenFile::Dev(f) => f.read(buf),
            OpenFile::Mem(f) => f.read(buf),
            OpenFile::Ext2(f) => f.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            OpenFile::Dev(f) => f.write(buf),
            OpenFile::Mem(f) => f.write(buf),
            OpenFile::Ext2(f) => f.write(buf),
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<u64, Error> {
        match self {
            OpenFile::Dev(f) => f.seek(pos),
            OpenFile::Mem(f) => f.seek(pos),
            OpenFile::Ext2(f) => f.seek(pos),
        }
    }
}

/// A mounted concrete file system, one of the closed set named in
/// spec.md's design notes (§9: "model these as variants {Dev, Mem,
/// Ext2} for file systems").
///
pub enum FileSystem {
    Dev(devfs::DevFs),
    Mem(memfs::MemFs),
    Ext2(ext2::Ext2Fs),
}

impl FileSystem {
    pub fn diropen(&self, path: &str) -> Result<Vec<String>, Error> {
        match self {
            FileSystem::Dev(fs) => fs.diropen(path),
            FileSystem::Mem(fs) => fs.diropen(path),
            FileSystem::Ext2(fs) => fs.diropen(path),
        }
    }

    pub fn fopen(&self, path: &str, mode: OpenMode) -> Result<OpenFile, Error> {
        match self {
            FileSystem::Dev(fs) => fs.fopen(path, mode).map(OpenFile::Dev),
            FileSystem::Mem(fs) => fs.fopen(path, mode).map(OpenFile::Mem),
            FileSystem::Ext2(fs) => fs.fopen(path, mode).map(OpenFile::Ext2),
        }
    }

    pub fn remove(&self, path: &str) -> Result<(), Error> {
        match self {
            FileSystem::Dev(fs) => fs.remove(path),
            FileSystem::Mem(fs) => fs.unlink(path),
            FileSystem::Ext2(fs) => fs.remove(path),
        }
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), Error> {
        match self {
            FileSystem::Dev(fs) => fs.rename(old, new),
            FileSystem::Mem(fs) => fs.rename(old, new),
            FileSystem::Ext2(fs) => fs.rename(old, new),
        }
    }
}

struct MountEntry {
    mount_point: String,
    fs: FileSystem,
    dev_name: Option<String>,
}

/// The process-wide mount table, mapping absolute-path prefixes to
/// [`FileSystem`] instances with longest-prefix-match lookup.
///
/// There is exactly one instance, analogous to
/// [`storage::block::DEVICES`]; every operation is exposed as a free
/// function guarded by [`without_interrupts`], matching that crate's
/// `add_device`/`iter` pattern.
///
static MOUNTS: Mutex<Vec<MountEntry>> = Mutex::new(Vec::new());

/// Finds the mount entry whose mount point is the longest prefix of
/// `path`, per spec.md §4.4. A mount point of `/` matches everything
/// and is therefore only ever the winner when no deeper mount does.
///
fn longest_prefix_match(path: &str, mounts: &[MountEntry]) -> Option<(usize, String)> {
    let mut best: Option<(usize, usize)> = None;
    for (i, m) in mounts.iter().enumerate() {
        let mp = m.mount_point.trim_end_matches('/');
        let matches = if mp.is_empty() {
            true
        } else {
            path == mp || path.starts_with(mp) && path.as_bytes().get(mp.len()) == Some(&b'/')
        };
        if !matches {
            continue;
        }
        let prefix_len = mp.len();
        if best.map_or(true, |(_, best_len)| prefix_len > best_len) {
            best = Some((i, prefix_len));
        }
    }
    best.map(|(i, len)| {
        let rest = &path[len..];
        let rel = if rest.is_empty() {
            "/".to_string()
        } else if rest.starts_with('/') {
            rest.to_string()
        } else {
            alloc::format!("/{rest}")
        };
        (i, rel)
    })
}

/// Runs `f` with the file system that `path` resolves to and the path
/// rewritten relative to that mount's root, per spec.md §4.4's
/// `lookup`.
///
pub fn with_lookup<R>(path: &str, f: impl FnOnce(&FileSystem, &str) -> R) -> Result<R, Error> {
    if !filepath::is_valid(path) {
        return Err(Error::InvalidArgument);
    }
    without_interrupts(|| {
        let mounts = MOUNTS.lock();
        let (idx, rel) = longest_prefix_match(path, &mounts).ok_or(Error::NoMount)?;
        Ok(f(&mounts[idx].fs, &rel))
    })
}

/// Resolves `path` to its mount-relative form, without performing any
/// operation on the underlying file system.
///
pub fn lookup(path: &str) -> Result<String, Error> {
    with_lookup(path, |_fs, rel| rel.to_string())
}

/// Lists the directory at `path`.
///
pub fn diropen(path: &str) -> Result<Vec<String>, Error> {
    with_lookup(path, |fs, rel| fs.diropen(rel))?
}

/// Opens the file at `path` in `mode`. Mode-specific actions (`w`/`w+`
/// truncation, `a`/`a+` seek-to-end) are applied by the concrete file
/// system's own `fopen`, as spec.md §4.4 describes.
///
pub fn fopen(path: &str, mode: OpenMode) -> Result<OpenFile, Error> {
    with_lookup(path, |fs, rel| fs.fopen(rel, mode))?
}

/// Removes the file at `path`.
///
pub fn remove(path: &str) -> Result<(), Error> {
    with_lookup(path, |fs, rel| fs.remove(rel))?
}

/// Renames `old` to `new`. Both must resolve to the same file system;
/// cross-file-system rename is not supported (spec.md §4.4).
///
pub fn rename(old: &str, new: &str) -> Result<(), Error> {
    without_interrupts(|| {
        let mounts = MOUNTS.lock();
        let (old_idx, old_rel) = longest_prefix_match(old, &mounts).ok_or(Error::NoMount)?;
        let (new_idx, new_rel) = longest_prefix_match(new, &mounts).ok_or(Error::NoMount)?;
        if old_idx != new_idx {
            return Err(Error::CrossDevice);
        }
        mounts[old_idx].fs.rename(&old_rel, &new_rel)
    })
}

/// Mounts the block device named `dev_name` (as seen under `/dev`) at
/// `mount_point`, probing it to determine its concrete file system
/// (see [`ext2::Ext2Fs::probe`]).
///
pub fn mount(mount_point: &str, dev_name: &str) -> Result<(), Error> {
    without_interrupts(|| {
        let mut mounts = MOUNTS.lock();
        if mounts.iter().any(|m| m.dev_name.as_deref() == Some(dev_name)) {
            return Err(Error::AlreadyMounted);
        }
        if !storage::block::exists(dev_name) {
            return Err(Error::NotFound);
        }
        let fs = ext2::Ext2Fs::probe(dev_name)?;
        mounts.push(MountEntry {
            mount_point: mount_point.to_string(),
            fs: FileSystem::Ext2(fs),
            dev_name: Some(dev_name.to_string()),
        });
        Ok(())
    })
}

/// Mounts a file system not backed by a block device (`DevFs`,
/// `MemFs`) at `mount_point`.
///
pub fn mount_virtual(mount_point: &str, fs: FileSystem) {
    without_interrupts(|| {
        MOUNTS.lock().push(MountEntry {
            mount_point: mount_point.to_string(),
            fs,
            dev_name: None,
        });
    });
}

/// Unmounts the file system named by `name`, which may be either a
/// mount point or a device name.
///
pub fn umount(name: &str) -> Result<(), Error> {
    without_interrupts(|| {
        let mut mounts = MOUNTS.lock();
        let idx = mounts
            .iter()
            .position(|m| m.mount_point == name || m.dev_name.as_deref() == Some(name))
            .ok_or(Error::NoMount)?;
        mounts.remove(idx);
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;

    #[test]
    fn open_mode_parses_every_grammar_entry() {
        assert_eq!(OpenMode::from_mode_str("r"), Ok(OpenMode::Read));
        assert_eq!(OpenMode::from_mode_str("r+"), Ok(OpenMode::ReadWrite));
        assert_eq!(OpenMode::from_mode_str("w"), Ok(OpenMode::Write));
        assert_eq!(OpenMode::from_mode_str("w+"), Ok(OpenMode::WriteRead));
        assert_eq!(OpenMode::from_mode_str("a"), Ok(OpenMode::Append));
        assert_eq!(OpenMode::from_mode_str("a+"), Ok(OpenMode::AppendRead));
        assert_eq!(OpenMode::from_mode_str("rb"), Ok(OpenMode::Read));
        assert_eq!(OpenMode::from_mode_str("w+b"), Ok(OpenMode::WriteRead));
        assert!(OpenMode::from_mode_str("x").is_err());
    }

    #[test]
    fn longest_prefix_mount_matches_spec_example() {
        let mounts = vec![
            MountEntry {
                mount_point: "/".to_string(),
                fs: FileSystem::Mem(memfs::MemFs::new()),
                dev_name: None,
            },
            MountEntry {
                mount_point: "/home".to_string(),
                fs: FileSystem::Mem(memfs::MemFs::new()),
                dev_name: None,
            },
            MountEntry {
                mount_point: "/home/user".to_string(),
                fs: FileSystem::Mem(memfs::MemFs::new()),
                dev_name: None,
            },
        ];

        let (idx, rel) = longest_prefix_match("/home/user/x", &mounts).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(rel, "/x");

        let (idx, rel) = longest_prefix_match("/home/other", &mounts).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(rel, "/other");

        let (idx, rel) = longest_prefix_match("/etc", &mounts).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(rel, "/etc");
    }

    #[test]
    fn lookup_without_root_mount_fails() {
        let mounts: Vec<MountEntry> = vec![MountEntry {
            mount_point: "/home".to_string(),
            fs: FileSystem::Mem(memfs::MemFs::new()),
            dev_name: None,
        }];
        assert!(longest_prefix_match("/etc", &mounts).is_none());
    }

    #[test]
    fn mount_virtual_then_fopen_round_trips() {
        mount_virtual("/tmp-test-a", FileSystem::Mem(memfs::MemFs::new()));
        let mut f = fopen("/tmp-test-a/greeting", OpenMode::WriteRead).unwrap();
        assert_eq!(f.write(b"hi").unwrap(), 2);
        f.seek(0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        umount("/tmp-test-a").unwrap();
    }

    #[test]
    fn rename_across_mounts_is_rejected() {
        mount_virtual("/tmp-test-b", FileSystem::Mem(memfs::MemFs::new()));
        mount_virtual("/tmp-test-c", FileSystem::Mem(memfs::MemFs::new()));
        assert_eq!(
            rename("/tmp-test-b/a", "/tmp-test-c/b"),
            Err(Error::CrossDevice)
        );
        umount("/tmp-test-b").unwrap();
        umount("/tmp-test-c").unwrap();
    }
}
