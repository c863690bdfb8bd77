// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::Cursor;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use binread::{BinRead, BinReaderExt};
use time::OffsetDateTime;

use crate::errors::RawCopyResult;

pub const SECTOR_SIZE: usize = 512;
pub const MFT_RECORD: u64 = 0;
pub const ROOT_RECORD: u64 = 5;
pub const FILE_RECORD_SIGNATURE: &[u8; 4] = b"FILE";
pub const INDEX_RECORD_SIGNATURE: &[u8; 4] = b"INDX";
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
pub const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;
pub const MAXIMUM_CLUSTER_SIZE: u64 = 2 * 1024 * 1024;
pub const END_MARKER: [u8; 4] = [0xFF; 4];
pub const FILE_REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Name of the directory index holding `$FILE_NAME` keys.
pub const FILE_NAME_INDEX: &str = "$I30";

#[derive(Clone, Copy, BinRead)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub sector_size: u16,
    pub sectors_per_cluster: u8,
    pub reserved_0: [u8; 26],
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_lcn_mirror: u64,
    pub file_record_size_info: i8,
    pub reserved_1: [u8; 3],
    pub index_record_size_info: i8,
    pub reserved_2: [u8; 3],
    pub serial_number: u64,
    pub checksum: u32,
    pub boot_code: [u8; 426],
    pub end_marker: u16,
}

impl BootSector {
    /// `None` when the encoded size does not fit in 64 bits.
    pub fn cluster_size(&self) -> Option<u64> {
        // Values above 0x80 encode a power of two on 4K-sector disks.
        let sectors_per_cluster = if self.sectors_per_cluster > 0x80 {
            1u64.checked_shl(256 - self.sectors_per_cluster as u32)?
        } else {
            self.sectors_per_cluster as u64
        };
        sectors_per_cluster.checked_mul(self.sector_size as u64)
    }

    /// Decodes the file/index record size fields: positive values count
    /// clusters, negative ones are a power of two in bytes.
    pub fn record_size(info: i8, cluster_size: u64) -> Option<u64> {
        if info > 0 {
            (info as u64).checked_mul(cluster_size)
        } else {
            let shift = info.unsigned_abs() as u32;
            if shift >= 32 {
                return None;
            }
            Some(1u64 << shift)
        }
    }
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsFileRecordHeader {
    // Record
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_length: u16,
    pub logfile_sequence_number: u64,
    // File
    pub sequence_value: u16,
    pub link_count: u16,
    pub attributes_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_reference: u64,
    pub next_attribute_id: u16,
}

pub const FILE_RECORD_HEADER_SIZE: usize = 42;

#[repr(u16)]
pub enum NtfsFileFlags {
    InUse = 0x0001,
    IsDirectory = 0x0002,
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsAttributeHeader {
    pub type_id: u32,
    pub length: u32,
    pub is_non_resident: u8,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
}

pub const ATTRIBUTE_HEADER_SIZE: usize = 16;

#[repr(u16)]
pub enum NtfsAttributeFlags {
    CompressionMask = 0x00FF,
    Encrypted = 0x4000,
    Sparse = 0x8000,
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsResidentAttributeHeader {
    pub attribute_header: NtfsAttributeHeader,
    pub value_length: u32,
    pub value_offset: u16,
    pub indexed_flag: u8,
}

pub const RESIDENT_HEADER_SIZE: usize = 23;

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsNonResidentAttributeHeader {
    pub attribute_header: NtfsAttributeHeader,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub data_runs_offset: u16,
    pub compression_unit_exponent: u8,
    pub reserved: [u8; 5],
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

pub const NON_RESIDENT_HEADER_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsStandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_record_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

pub const STANDARD_INFORMATION_SIZE: usize = 36;

#[repr(u8)]
pub enum NtfsFileNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsFileNameHeader {
    pub parent_directory_reference: u64,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_record_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub file_attributes: u32,
    pub reparse_point_tag: u32,
    pub name_length: u8,
    pub namespace: u8,
}

pub const FILE_NAME_HEADER_SIZE: usize = 66;

#[repr(u32)]
pub enum NtfsFileNameFlags {
    ReadOnly = 0x0001,
    Hidden = 0x0002,
    System = 0x0004,
    ReparsePoint = 0x0400,
    IsDirectory = 0x1000_0000,
}

#[derive(Clone, Debug)]
pub struct NtfsFileName {
    pub header: NtfsFileNameHeader,
    pub name: String,
}

impl NtfsFileName {
    /// Decodes a `$FILE_NAME` value (also used as directory index key).
    pub fn parse(value: &[u8]) -> Option<Self> {
        let header: NtfsFileNameHeader = parse_le(value).ok()?;
        let end = FILE_NAME_HEADER_SIZE + header.name_length as usize * 2;
        let bytes = value.get(FILE_NAME_HEADER_SIZE..end)?;
        Some(NtfsFileName {
            header,
            name: utf16_le_to_string(bytes),
        })
    }

    pub fn parent(&self) -> u64 {
        self.header.parent_directory_reference & FILE_REFERENCE_MASK
    }

    pub fn is_dos_only(&self) -> bool {
        self.header.namespace == NtfsFileNamespace::Dos as u8
    }

    pub fn is_win32(&self) -> bool {
        self.header.namespace == NtfsFileNamespace::Win32 as u8
            || self.header.namespace == NtfsFileNamespace::Win32AndDos as u8
    }

    pub fn is_directory(&self) -> bool {
        self.header.file_attributes & NtfsFileNameFlags::IsDirectory as u32 != 0
    }
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsAttributeListEntry {
    pub type_id: u32,
    pub length: u16,
    pub name_length: u8,
    pub name_offset: u8,
    pub lowest_vcn: u64,
    pub base_reference: u64,
    pub attribute_id: u16,
}

pub const ATTRIBUTE_LIST_ENTRY_SIZE: usize = 26;

impl NtfsAttributeListEntry {
    pub fn reference(&self) -> u64 {
        self.base_reference & FILE_REFERENCE_MASK
    }
}

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsIndexRootHeader {
    pub attribute_type: u32,
    pub collation_rule: u32,
    pub index_record_size: u32,
    pub clusters_per_index_record: u8,
    pub reserved: [u8; 3],
}

pub const INDEX_ROOT_HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsIndexNodeHeader {
    pub entries_offset: u32,
    pub index_length: u32,
    pub allocated_size: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

pub const INDEX_NODE_HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsIndexRecordHeader {
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_length: u16,
    pub logfile_sequence_number: u64,
    pub vcn: u64,
}

pub const INDEX_RECORD_HEADER_SIZE: usize = 24;

#[derive(Clone, Copy, Debug, BinRead)]
pub struct NtfsIndexEntryHeader {
    pub file_reference: u64,
    pub length: u16,
    pub key_length: u16,
    pub flags: u16,
    pub reserved: u16,
}

pub const INDEX_ENTRY_HEADER_SIZE: usize = 16;

#[repr(u16)]
pub enum NtfsIndexEntryFlags {
    HasSubnode = 0x0001,
    Last = 0x0002,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum NtfsAttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    End = 0xFFFF_FFFF,
}

pub fn parse_le<T: BinRead>(data: &[u8]) -> RawCopyResult<T> {
    Ok(Cursor::new(data).read_le::<T>()?)
}

pub fn utf16_le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

pub fn ntfs_to_unix_time(src: u64) -> OffsetDateTime {
    let unix = src as i128 - EPOCH_DIFFERENCE as i128;
    OffsetDateTime::from_unix_timestamp_nanos(unix * 100).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn ntfs_to_system_time(src: u64) -> SystemTime {
    let delta = src.abs_diff(EPOCH_DIFFERENCE);
    let duration =
        Duration::from_secs(delta / 10_000_000) + Duration::from_nanos(delta % 10_000_000 * 100);
    let time = if src >= EPOCH_DIFFERENCE {
        UNIX_EPOCH.checked_add(duration)
    } else {
        UNIX_EPOCH.checked_sub(duration)
    };
    time.unwrap_or(UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_encodings() {
        assert_eq!(BootSector::record_size(-10, 4096), Some(1024));
        assert_eq!(BootSector::record_size(1, 4096), Some(4096));
        assert_eq!(BootSector::record_size(2, 512), Some(1024));
        assert_eq!(BootSector::record_size(-40, 4096), None);
    }

    #[test]
    fn ntfs_epoch_maps_to_unix_epoch() {
        assert_eq!(ntfs_to_unix_time(EPOCH_DIFFERENCE), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(ntfs_to_system_time(EPOCH_DIFFERENCE), UNIX_EPOCH);

        // 2022-01-01T00:00:00Z plus 1234567 hundred-nanosecond ticks
        let ticks = EPOCH_DIFFERENCE + 1_640_995_200 * 10_000_000 + 1_234_567;
        let expected = UNIX_EPOCH + Duration::new(1_640_995_200, 123_456_700);
        assert_eq!(ntfs_to_system_time(ticks), expected);
        assert_eq!(
            ntfs_to_unix_time(ticks).unix_timestamp_nanos(),
            1_640_995_200_123_456_700
        );
    }

    #[test]
    fn decodes_file_name_value() {
        let mut value = vec![0u8; FILE_NAME_HEADER_SIZE];
        value[..8].copy_from_slice(&(ROOT_RECORD | (5 << 48)).to_le_bytes());
        value[64] = 3;
        value[65] = NtfsFileNamespace::Win32 as u8;
        for unit in "abc".encode_utf16() {
            value.extend_from_slice(&unit.to_le_bytes());
        }

        let name = NtfsFileName::parse(&value).unwrap();
        assert_eq!(name.name, "abc");
        assert_eq!(name.parent(), ROOT_RECORD);
        assert!(name.is_win32());
        assert!(!name.is_directory());

        assert!(NtfsFileName::parse(&value[..FILE_NAME_HEADER_SIZE + 2]).is_none());
    }
}
