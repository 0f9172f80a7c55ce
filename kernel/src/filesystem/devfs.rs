// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The special `/dev` file system, grounded on `DevFileSystem.h`/`.cpp`
//! from the original implementation.
//!
//! Block devices (disks and their partitions) are whatever is
//! currently registered with [`storage::block`]; `DevFs` itself only
//! tracks the character devices (`tty`, `ttyS0`), since the keyboard
//! and additional serial-port drivers that would back further
//! character devices are out of scope here.

use crate::{Error, OpenMode};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use storage::block;

/// A kind of device exposed through `/dev`, mirroring the original's
/// `DeviceType` enumeration. Only the kinds this kernel can actually
/// name a device as are represented.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    AtaDisk,
    Cdrom,
    FloppyDisk,
    SerialPort,
    Console,
}

/// The `(type, prefix)` table device names are resolved against.
///
/// `AtaDisk` appears twice, exactly as it does in the original's
/// `type_to_prefix` table in `DevFileSystem.cpp`; the duplicate is
/// harmless (both entries map to `"sd"`) and is preserved here rather
/// than silently collapsed, per the decision recorded for this in
/// the design ledger.
///
const TYPE_PREFIXES: &[(DeviceType, &str)] = &[
    (DeviceType::AtaDisk, "sd"),
    (DeviceType::Cdrom, "sr"),
    (DeviceType::FloppyDisk, "fd"),
    (DeviceType::SerialPort, "ttyS"),
    (DeviceType::AtaDisk, "sd"),
    (DeviceType::Console, "tty"),
];

/// Returns the standard `/dev` prefix for a device type.
///
pub fn type_to_prefix(t: DeviceType) -> &'static str {
    TYPE_PREFIXES
        .iter()
        .find(|(ty, _)| *ty == t)
        .map(|(_, prefix)| *prefix)
        .expect("every DeviceType has a prefix entry")
}

/// Whether a device type is indexed by letter (`sda`, `sdb`, ...) as
/// opposed to by number (`ttyS0`, `ttyS1`, ...).
///
pub fn alpha_index(t: DeviceType) -> bool {
    matches!(t, DeviceType::AtaDisk | DeviceType::FloppyDisk)
}

/// Returns the next unused name for a device of type `t`, given the
/// set of names already in use.
///
pub fn next_device_name(t: DeviceType, existing: &[String]) -> String {
    let prefix = type_to_prefix(t);
    if alpha_index(t) {
        let mut suffix = String::from("a");
        while existing.iter().any(|n| n == &format!("{prefix}{suffix}")) {
            suffix = increment_alpha(&suffix);
        }
        format!("{prefix}{suffix}")
    } else {
        let mut i = 0usize;
        while existing.iter().any(|n| n == &format!("{prefix}{i}")) {
            i += 1;
        }
        format!("{prefix}{i}")
    }
}

fn increment_alpha(s: &str) -> String {
    let mut chars: Vec<u8> = s.bytes().collect();
    let mut i = chars.len();
    loop {
        if i == 0 {
            let mut out = vec![b'a'; chars.len() + 1];
            out[0] = b'a';
            return String::from_utf8(out).unwrap();
        }
        i -= 1;
        if chars[i] == b'z' {
            chars[i] = b'a';
            if i == 0 {
                let mut out = vec![b'a'];
                out.extend(chars);
                return String::from_utf8(out).unwrap();
            }
            continue;
        }
        chars[i] += 1;
        return String::from_utf8(chars).unwrap();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CharacterKind {
    Console,
    Serial0,
}

static CHARACTERS: Mutex<Vec<(String, CharacterKind)>> = Mutex::new(Vec::new());

/// The `/dev` file system.
///
pub struct DevFs;

impl Default for DevFs {
    fn default() -> Self {
        DevFs::new()
    }
}

impl DevFs {
    pub fn new() -> Self {
        DevFs
    }

    /// Registers `ttyS0`, the first serial port.
    ///
    /// Only COM1 is known to the kernel; a real driver enumerating
    /// every UART is out of scope.
    ///
    pub fn add_serial(&self) {
        register_character("ttyS0", CharacterKind::Serial0);
    }

    /// Registers `tty`, the system console.
    ///
    pub fn add_tty(&self) {
        register_character("tty", CharacterKind::Console);
    }

    /// Lists device names with `prefix` as a matching path segment,
    /// stripping anything past the next `/`.
    ///
    pub fn diropen(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let prefix = prefix.trim_start_matches('/');
        let mut names = Vec::new();
        block::iter(|dev| names.push(dev.name.clone()));
        for (name, _) in CHARACTERS.lock().iter() {
            names.push(name.clone());
        }

        let mut matches = Vec::new();
        for name in names {
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

    /// Opens the device named `name` for raw reading/writing.
    ///
    pub fn fopen(&self, name: &str, mode: OpenMode) -> Result<DeviceFile, Error> {
        let name = name.trim_start_matches('/');
        if block::exists(name) {
            return Ok(DeviceFile::Block(BlockFile::new(name, mode)));
        }
        if let Some(kind) = character_kind(name) {
            return Ok(DeviceFile::Character(CharacterFile::new(kind)));
        }
        Err(Error::NotFound)
    }

    /// Removing a device file doesn't make sense; always fails.
    /// Disconnecting a device is done through `umount` instead.
    ///
    pub fn remove(&self, _name: &str) -> Result<(), Error> {
        Err(Error::NotPermitted)
    }

    /// Device names follow fixed conventions and may not be renamed;
    /// this is a no-op success.
    ///
    pub fn rename(&self, _old: &str, _new: &str) -> Result<(), Error> {
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        1
    }
}

fn register_character(name: &str, kind: CharacterKind) {
    let mut chars = CHARACTERS.lock();
    if !chars.iter().any(|(n, _)| n == name) {
        chars.push((name.to_string(), kind));
    }
}

fn character_kind(name: &str) -> Option<CharacterKind> {
    CHARACTERS
        .lock()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, k)| *k)
}

/// An open handle on a `/dev` block device.
///
pub struct BlockFile {
    name: String,
    position: u64,
    mode: OpenMode,
}

impl BlockFile {
    fn new(name: &str, mode: OpenMode) -> Self {
        BlockFile {
            name: name.to_string(),
            position: 0,
            mode,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.mode == OpenMode::Write {
            return Err(Error::NotPermitted);
        }

        let mut result = Err(Error::NotFound);
        let position = self.position;
        block::iter(|dev| {
            if dev.name == self.name {
                result = dev
                    .device
                    .read_bytes(position as usize, buf.len())
                    .map_err(|_| Error::DeviceError);
            }
        });

        let data = result?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.mode == OpenMode::Read {
            return Err(Error::NotPermitted);
        }

        let mut result = Err(Error::NotFound);
        let position = self.position;
        block::iter(|dev| {
            if dev.name == self.name {
                result = dev
                    .device
                    .write_bytes(position as usize, buf)
                    .map_err(|_| Error::DeviceError);
            }
        });

        let written = result?;
        self.position += written as u64;
        Ok(written)
    }

    pub fn seek(&mut self, pos: u64) -> Result<u64, Error> {
        self.position = pos;
        Ok(self.position)
    }
}

/// An open handle on a `/dev` character device.
///
pub struct CharacterFile {
    kind: CharacterKind,
}

impl CharacterFile {
    fn new(kind: CharacterKind) -> Self {
        CharacterFile { kind }
    }

    /// Always reports end-of-file: no keyboard driver feeds the
    /// console, and the serial driver is output-only here.
    ///
    pub fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> {
        Ok(0)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let s = core::str::from_utf8(buf).map_err(|_| Error::InvalidArgument)?;
        match self.kind {
            CharacterKind::Console | CharacterKind::Serial0 => {
                serial::write_str(s).map_err(|_| Error::DeviceError)?;
            }
        }
        Ok(buf.len())
    }

    /// Character devices are not seekable; always reports position 0.
    ///
    pub fn seek(&mut self, _pos: u64) -> Result<u64, Error> {
        Ok(0)
    }
}

/// An open `/dev` file, either backed by a block device or a
/// character device.
///
pub enum DeviceFile {
    Block(BlockFile),
    Character(CharacterFile),
}

impl DeviceFile {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            DeviceFile::Block(f) => f.read(buf),
            DeviceFile::Character(f) => f.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            DeviceFile::Block(f) => f.write(buf),
            DeviceFile::Character(f) => f.write(buf),
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<u64, Error> {
        match self {
            DeviceFile::Block(f) => f.seek(pos),
            DeviceFile::Character(f) => f.seek(pos),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alpha_index_covers_disks_and_floppies() {
        assert!(alpha_index(DeviceType::AtaDisk));
        assert!(alpha_index(DeviceType::FloppyDisk));
        assert!(!alpha_index(DeviceType::SerialPort));
        assert!(!alpha_index(DeviceType::Console));
    }

    #[test]
    fn next_device_name_picks_lowest_unused_letter() {
        let existing = vec!["sda".to_string(), "sdb".to_string()];
        assert_eq!(next_device_name(DeviceType::AtaDisk, &existing), "sdc");
    }

    #[test]
    fn next_device_name_wraps_past_z() {
        let existing = vec!["sda".to_string(), "sdb".to_string()];
        let all: Vec<String> = (b'a'..=b'z')
            .map(|c| format!("sd{}", c as char))
            .collect();
        assert_eq!(next_device_name(DeviceType::AtaDisk, &all), "sdaa");
        let _ = existing;
    }

    #[test]
    fn next_device_name_picks_lowest_unused_digit() {
        let existing = vec!["ttyS0".to_string(), "ttyS2".to_string()];
        assert_eq!(next_device_name(DeviceType::SerialPort, &existing), "ttyS1");
    }

    #[test]
    fn fopen_unknown_device_fails() {
        let dev = DevFs::new();
        assert!(matches!(dev.fopen("nope", OpenMode::Read), Err(Error::NotFound)));
    }

    #[test]
    fn remove_always_fails() {
        let dev = DevFs::new();
        assert!(dev.remove("tty").is_err());
    }

    #[test]
    fn rename_always_succeeds_as_a_no_op() {
        let dev = DevFs::new();
        assert!(dev.rename("tty", "console").is_ok());
    }
}
