// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements block storage devices for the kernel.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use interrupts::without_interrupts;
use spin::Mutex;

/// A named, registered block storage device: the device itself plus
/// the name it is exposed under in `/dev` (e.g. `sda`, `sda1`).
///
pub struct NamedDevice {
    /// The device's name, as exposed by `DevFs`.
    ///
    pub name: String,
    /// The device implementation.
    ///
    pub device: Box<dyn Device + Send>,
}

/// The list of block storage devices.
///
static DEVICES: Mutex<Vec<NamedDevice>> = Mutex::new(Vec::new());

/// Registers a new block storage device under `name`.
///
pub fn add_device(name: String, device: Box<dyn Device + Send>) {
    without_interrupts(|| {
        let mut devices = DEVICES.lock();
        devices.push(NamedDevice { name, device });
    });
}

/// Iterate through the set of block storage devices,
/// calling f on each device.
///
pub fn iter<F>(mut f: F)
where
    F: FnMut(&mut NamedDevice),
{
    without_interrupts(|| {
        let mut devices = DEVICES.lock();
        for dev in devices.iter_mut() {
            f(dev);
        }
    });
}

/// Returns whether a device named `name` is already registered.
///
pub fn exists(name: &str) -> bool {
    let mut found = false;
    iter(|dev| {
        if dev.name == name {
            found = true;
        }
    });
    found
}

bitflags! {
    /// The list of operations that can be supported by
    /// a device.
    ///
    pub struct Operations: usize {
        /// Read data from a device.
        const READ = 1 << 0;

        /// Write data to a device.
        const WRITE = 1 << 1;

        /// Flush cached writes to a device.
        const FLUSH = 1 << 2;
    }
}

/// Describes an error encountered while operating
/// on the device.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The buffer passed to the driver was not
    /// appropriate for the operation.
    InvalidBuffer,

    /// The device encountered an error while performing
    /// the requested operation.
    DeviceError,

    /// The requested operation is not supported.
    NotSupported,

    /// The device returned an invalid response.
    BadResponse,
}

/// Represents a block storage device.
///
pub trait Device {
    /// Returns the number of bytes in each segment.
    ///
    fn segment_size(&self) -> usize;

    /// Returns the device capacity as a number of
    /// segments.
    //
    fn num_segments(&self) -> usize;

    /// Returns the device capacity in bytes.
    ///
    fn capacity(&self) -> usize;

    /// Returns the set of operations supported by the
    /// device.
    ///
    /// If an unsupported operation is attempted, it
    /// will return [`Error::NotSupported`].
    ///
    fn operations(&self) -> Operations;

    /// Populates a byte slice with data from the device.
    ///
    /// `segment` indicates from which segment the data
    /// should be read. The data read will start at the
    /// offset `segment` * [`segment_size`](Self::segment_size).
    ///
    /// Note that `buf` must have a length that is an exact
    /// multiple the [`segment_size`](Self::segment_size).
    ///
    /// `read` returns the number of bytes read.
    ///
    fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error>;

    /// Writes data from a byte slice to the device.
    ///
    /// `segment` indicates from which segment the data
    /// should be read. The data written will start at the
    /// offset `segment` * [`segment_size`](Self::segment_size).
    ///
    /// Note that `buf` must have a length that is an exact
    /// multiple the [`segment_size`](Self::segment_size).
    ///
    /// `write` returns the number of bytes written.
    ///
    /// If the device is read-only, calls to `write` will
    /// return [`Error::NotSupported`].
    ///
    fn write(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error>;

    /// Flush the buffered data at the given `segment`.
    ///
    /// `segment` indicates from which segment the data
    /// should be flushed. The data flushed will start at the
    /// offset `segment` * [`segment_size`](Self::segment_size).
    ///
    fn flush(&mut self, segment: usize) -> Result<(), Error>;

    /// Reads `len` bytes starting at byte offset `offset`, regardless
    /// of segment boundaries, by reading whole segments and copying
    /// out the requested slice.
    ///
    /// This is a convenience built on [`read`](Self::read) for callers
    /// (partition probing, ext2) that work in arbitrary byte ranges
    /// rather than whole segments.
    ///
    fn read_bytes(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let seg_size = self.segment_size();
        if seg_size == 0 {
            return Err(Error::DeviceError);
        }

        let first_segment = offset / seg_size;
        let last_byte = offset + len;
        let last_segment = (last_byte + seg_size - 1) / seg_size;
        let num_segments = last_segment - first_segment;

        let mut buf = alloc::vec![0u8; num_segments * seg_size];
        let mut read = 0;
        for i in 0..num_segments {
            let mut segment_buf = alloc::vec![0u8; seg_size];
            read += self.read(first_segment + i, &mut segment_buf)?;
            buf[i * seg_size..(i + 1) * seg_size].copy_from_slice(&segment_buf);
        }
        if read < len {
            return Err(Error::DeviceError);
        }

        let start = offset - first_segment * seg_size;
        Ok(buf[start..start + len].to_vec())
    }

    /// Writes `data` starting at byte offset `offset`, regardless of
    /// segment boundaries, by read-modify-writing whole segments.
    ///
    /// The same convenience as [`read_bytes`](Self::read_bytes), for
    /// the same callers.
    ///
    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize, Error> {
        let seg_size = self.segment_size();
        if seg_size == 0 {
            return Err(Error::DeviceError);
        }

        let mut written = 0;
        let mut pos = offset;
        while written < data.len() {
            let segment = pos / seg_size;
            let seg_offset = pos % seg_size;
            let chunk_len = (seg_size - seg_offset).min(data.len() - written);

            let mut buf = alloc::vec![0u8; seg_size];
            if chunk_len < seg_size {
                self.read(segment, &mut buf)?;
            }
            buf[seg_offset..seg_offset + chunk_len].copy_from_slice(&data[written..written + chunk_len]);
            self.write(segment, &mut buf)?;

            written += chunk_len;
            pos += chunk_len;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct MemDevice {
        data: Vec<u8>,
    }

    impl Device for MemDevice {
        fn segment_size(&self) -> usize {
            512
        }

        fn num_segments(&self) -> usize {
            self.data.len() / 512
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }

        fn operations(&self) -> Operations {
            Operations::READ | Operations::WRITE | Operations::FLUSH
        }

        fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
            let start = segment * 512;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(buf.len())
        }

        fn write(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
            let start = segment * 512;
            self.data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self, _segment: usize) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn read_bytes_crosses_segment_boundary() {
        let mut data = alloc::vec![0u8; 512 * 4];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut dev = MemDevice { data };

        let got = dev.read_bytes(500, 40).unwrap();
        let want: Vec<u8> = (500..540).map(|i| (i % 256) as u8).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn add_device_and_iter() {
        add_device(
            String::from("test0"),
            Box::new(MemDevice {
                data: alloc::vec![0u8; 512],
            }),
        );
        assert!(exists("test0"));
        assert!(!exists("test-missing"));
    }
}
