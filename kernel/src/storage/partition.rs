// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Parses MBR and GPT partition tables from a block device's first
//! sectors, grounded on `DiskPartition.cpp`/`.h` from the original
//! `stable_genius` kernel.
//!
//! `DevFs` probes every newly-registered disk with [`probe`], which
//! returns a list of [`Partition`] descriptors; each becomes a new
//! block device named `<disk><n>`, `n` 1-based, wrapping the parent
//! device with a byte offset (see [`PartitionDevice`]).

use super::block::{Device, Error, Operations};
use alloc::vec::Vec;

/// The Linux-filesystem GPT partition type GUID,
/// `0FC63DAF-8483-4772-8E79-3D69D8477DE4`, stored little-endian across
/// its first three fields as the UEFI specification lays it out on
/// disk.
///
pub const LINUX_DATA_GUID: [u8; 16] = [
    0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d, 0xe4,
];

const SECTOR_SIZE: usize = 512;

/// A single partition found on a disk, expressed as an LBA offset and
/// length in sectors.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// The LBA of the partition's first sector.
    ///
    pub start_lba: u64,
    /// The number of sectors in the partition.
    ///
    pub sectors: u64,
}

/// A single 16-byte MBR partition table entry.
///
/// Per spec.md §9's second ambiguous-behaviour bullet: the bootable
/// flag test (`0x80`) is a bitwise AND against the first byte, and a
/// missing bit is treated the same as an absent entry would be for
/// "not active" — this is preserved verbatim rather than "corrected"
/// to, say, an exact-equality test, since it matches the original's
/// `d[0] & 0x80`.
///
#[derive(Debug, Clone, Copy)]
pub struct MbrEntry {
    bootable: bool,
    system_id: u8,
    lba: u32,
    sectors: u32,
}

impl MbrEntry {
    /// Parses a 16-byte MBR partition table entry. Returns `None` if
    /// the entry is absent (system ID byte zero) or has a zero LBA or
    /// sector count, both of which the original treats as "not a real
    /// entry" rather than an error.
    ///
    fn parse(d: &[u8]) -> Option<Self> {
        let system_id = d[4];
        if system_id == 0 {
            return None;
        }

        let bootable = d[0] & 0x80 != 0;
        let lba = u32::from_le_bytes([d[8], d[9], d[10], d[11]]);
        let sectors = u32::from_le_bytes([d[12], d[13], d[14], d[15]]);
        if lba == 0 || sectors == 0 {
            return None;
        }

        Some(MbrEntry {
            bootable,
            system_id,
            lba,
            sectors,
        })
    }

    /// Whether the partition's bootable flag is set.
    ///
    pub fn bootable(&self) -> bool {
        self.bootable
    }

    /// The partition type byte (e.g. `0xEE` for a protective MBR).
    ///
    pub fn system_id(&self) -> u8 {
        self.system_id
    }
}

/// Reads and parses a disk's MBR (the first 512-byte sector), if the
/// `0x55 0xAA` signature is present at bytes 510/511.
///
fn read_mbr(dev: &mut dyn Device) -> Result<Option<Vec<MbrEntry>>, Error> {
    let sector = dev.read_bytes(0, SECTOR_SIZE)?;
    if sector[0x1fe] != 0x55 || sector[0x1ff] != 0xaa {
        return Ok(None);
    }

    let mut entries = Vec::new();
    for offset in (0x1be..=0x1ee).step_by(16) {
        if let Some(entry) = MbrEntry::parse(&sector[offset..offset + 16]) {
            entries.push(entry);
        }
    }
    Ok(Some(entries))
}

/// Whether an MBR's partition table is a protective MBR: exactly one
/// entry, with system ID `0xEE`.
///
fn is_protective_mbr(entries: &[MbrEntry]) -> bool {
    entries.len() == 1 && entries[0].system_id() == 0xee
}

/// A parsed GPT header, plus its partition table entries.
///
struct GptHeader {
    disk_uuid: [u8; 16],
    this_lba: u64,
    other_lba: u64,
    partition_table_lba: u64,
    num_entries: u32,
    entry_size: u32,
}

fn read_gpt_header(dev: &mut dyn Device, lba: u64) -> Result<Option<GptHeader>, Error> {
    let header = dev.read_bytes(lba as usize * SECTOR_SIZE, 92)?;
    if &header[0..8] != b"EFI PART" {
        return Ok(None);
    }

    let this_lba = u64::from_le_bytes(header[24..32].try_into().unwrap());
    let other_lba = u64::from_le_bytes(header[32..40].try_into().unwrap());
    let mut disk_uuid = [0u8; 16];
    disk_uuid.copy_from_slice(&header[56..72]);
    let partition_table_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
    let num_entries = u32::from_le_bytes(header[80..84].try_into().unwrap());
    let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap());

    Ok(Some(GptHeader {
        disk_uuid,
        this_lba,
        other_lba,
        partition_table_lba,
        num_entries,
        entry_size,
    }))
}

fn read_gpt_entries(
    dev: &mut dyn Device,
    header: &GptHeader,
) -> Result<Vec<Partition>, Error> {
    let mut partitions = Vec::new();
    let table_bytes = dev.read_bytes(
        header.partition_table_lba as usize * SECTOR_SIZE,
        header.num_entries as usize * header.entry_size as usize,
    )?;

    for i in 0..header.num_entries as usize {
        let entry = &table_bytes[i * header.entry_size as usize..][..header.entry_size as usize];
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|&b| b == 0) {
            continue;
        }

        let first_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let last_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());
        if first_lba == 0 || last_lba < first_lba {
            continue;
        }

        partitions.push(Partition {
            start_lba: first_lba,
            sectors: last_lba - first_lba + 1,
        });
    }

    Ok(partitions)
}

/// Probes a newly-registered disk for a partition table, following
/// spec.md §4.5.4: checks for an MBR signature, and if the sole
/// partition entry indicates a protective MBR (type `0xEE`), reads the
/// primary GPT header from LBA 1 and its backup from the LBA the
/// primary names, confirming they agree (disk UUID, and that each
/// names the other as its counterpart) before trusting the partition
/// table.
///
/// Returns an empty list if no partition table is found (the whole
/// disk is then exposed as a single unpartitioned device), or if the
/// GPT backup header is missing or inconsistent with the primary.
///
pub fn probe(dev: &mut dyn Device) -> Result<Vec<Partition>, Error> {
    let entries = match read_mbr(dev)? {
        Some(entries) => entries,
        None => return Ok(Vec::new()),
    };

    if !is_protective_mbr(&entries) {
        return Ok(entries
            .iter()
            .map(|e| Partition {
                start_lba: e.lba as u64,
                sectors: e.sectors as u64,
            })
            .collect());
    }

    let primary = match read_gpt_header(dev, 1)? {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };

    let backup = match read_gpt_header(dev, primary.other_lba)? {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };

    let consistent = primary.disk_uuid == backup.disk_uuid
        && primary.this_lba == backup.other_lba
        && primary.other_lba == backup.this_lba;
    if !consistent {
        return Ok(Vec::new());
    }

    read_gpt_entries(dev, &primary)
}

/// A block device wrapping another, offset by a fixed number of
/// sectors: the device exposed for a single partition.
///
/// Grounded on `PartitionDriver` in the original implementation, which
/// stores the underlying disk driver and a byte offset and applies it
/// to every read/write.
///
pub struct PartitionDevice<D: Device> {
    underlying: D,
    offset_segments: usize,
    num_segments: usize,
}

impl<D: Device> PartitionDevice<D> {
    /// Wraps `underlying`, restricting it to the sector range
    /// described by `partition`.
    ///
    pub fn new(underlying: D, partition: Partition) -> Self {
        PartitionDevice {
            underlying,
            offset_segments: partition.start_lba as usize,
            num_segments: partition.sectors as usize,
        }
    }
}

impl<D: Device> Device for PartitionDevice<D> {
    fn segment_size(&self) -> usize {
        self.underlying.segment_size()
    }

    fn num_segments(&self) -> usize {
        self.num_segments
    }

    fn capacity(&self) -> usize {
        self.num_segments * self.segment_size()
    }

    fn operations(&self) -> Operations {
        self.underlying.operations()
    }

    fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if segment >= self.num_segments {
            return Err(Error::InvalidBuffer);
        }
        self.underlying.read(self.offset_segments + segment, buf)
    }

    fn write(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if segment >= self.num_segments {
            return Err(Error::InvalidBuffer);
        }
        self.underlying.write(self.offset_segments + segment, buf)
    }

    fn flush(&mut self, segment: usize) -> Result<(), Error> {
        self.underlying.flush(self.offset_segments + segment)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;

    struct MemDevice {
        data: Vec<u8>,
    }

    impl Device for MemDevice {
        fn segment_size(&self) -> usize {
            SECTOR_SIZE
        }

        fn num_segments(&self) -> usize {
            self.data.len() / SECTOR_SIZE
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }

        fn operations(&self) -> Operations {
            Operations::READ | Operations::WRITE
        }

        fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
            let start = segment * SECTOR_SIZE;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(buf.len())
        }

        fn write(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
            let start = segment * SECTOR_SIZE;
            self.data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self, _segment: usize) -> Result<(), Error> {
            Ok(())
        }
    }

    fn mbr_with_one_entry(bootable: bool, start_lba: u32, sectors: u32, type_id: u8) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[0x1be] = if bootable { 0x80 } else { 0x00 };
        sector[0x1be + 4] = type_id;
        sector[0x1be + 8..0x1be + 12].copy_from_slice(&start_lba.to_le_bytes());
        sector[0x1be + 12..0x1be + 16].copy_from_slice(&sectors.to_le_bytes());
        sector[0x1fe] = 0x55;
        sector[0x1ff] = 0xaa;
        sector
    }

    #[test]
    fn no_signature_means_no_partitions() {
        let mut dev = MemDevice {
            data: vec![0u8; SECTOR_SIZE],
        };
        let partitions = probe(&mut dev).unwrap();
        assert!(partitions.is_empty());
    }

    #[test]
    fn single_mbr_partition_is_reported() {
        let mut dev = MemDevice {
            data: mbr_with_one_entry(true, 2048, 204800, 0x83),
        };
        let partitions = probe(&mut dev).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].start_lba, 2048);
        assert_eq!(partitions[0].sectors, 204800);
    }

    #[test]
    fn missing_bootable_flag_is_not_active() {
        let entry = MbrEntry::parse(&mbr_with_one_entry(false, 1, 1, 0x83)[0x1be..0x1ce]).unwrap();
        assert!(!entry.bootable());
    }

    #[test]
    fn zero_system_id_is_not_a_real_entry() {
        let sector = vec![0u8; 16];
        assert!(MbrEntry::parse(&sector).is_none());
    }

    #[test]
    fn partition_device_offsets_reads() {
        let mut data = vec![0u8; SECTOR_SIZE * 4];
        data[SECTOR_SIZE * 2] = 0xab;
        let underlying = MemDevice { data };
        let mut part = PartitionDevice::new(
            underlying,
            Partition {
                start_lba: 2,
                sectors: 2,
            },
        );

        let mut buf = vec![0u8; SECTOR_SIZE];
        part.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0xab);
    }
}
