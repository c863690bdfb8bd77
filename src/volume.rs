// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use binread::BinReaderExt;
use tracing::{debug, info};

use crate::{
    api::*,
    errors::{RawCopyError, RawCopyResult},
    file::NtfsFile,
    mft::Mft,
    paged_reader::PagedReader,
    stream::{read_attribute_list, StreamLayout},
};

#[derive(Clone, Debug)]
pub struct Volume {
    /// Byte offset of the boot sector on the device.
    pub base_offset: u64,
    pub serial_number: u64,
    pub cluster_size: u64,
    pub volume_size: u64,
    pub file_record_size: u64,
    pub index_record_size: u64,
    pub mft_position: u64,
}

impl Volume {
    pub fn new<R>(reader: &mut R, base_offset: u64) -> RawCopyResult<Self>
    where
        R: Read + Seek,
    {
        reader.seek(SeekFrom::Start(base_offset))?;
        let boot_sector = reader.read_le::<BootSector>()?;

        let invalid = |details| RawCopyError::InvalidBootSector { details };

        if &boot_sector.oem_id != NTFS_OEM_ID {
            return Err(invalid("not an NTFS boot sector"));
        }
        let sector_size = boot_sector.sector_size as u64;
        if sector_size < SECTOR_SIZE as u64 || !sector_size.is_power_of_two() {
            return Err(invalid("unsupported sector size"));
        }

        let cluster_size = boot_sector
            .cluster_size()
            .filter(|size| *size > 0 && *size <= MAXIMUM_CLUSTER_SIZE)
            .ok_or(invalid("unsupported cluster size"))?;

        let file_record_size =
            BootSector::record_size(boot_sector.file_record_size_info, cluster_size)
                .filter(|size| *size >= SECTOR_SIZE as u64 && size.is_power_of_two())
                .ok_or(invalid("unsupported file record size"))?;
        let index_record_size =
            BootSector::record_size(boot_sector.index_record_size_info, cluster_size)
                .filter(|size| *size >= SECTOR_SIZE as u64 && size.is_power_of_two())
                .ok_or(invalid("unsupported index record size"))?;

        let volume_size = boot_sector
            .total_sectors
            .checked_mul(sector_size)
            .ok_or(invalid("volume size overflow"))?;
        let mft_position = boot_sector
            .mft_lcn
            .checked_mul(cluster_size)
            .filter(|position| *position < volume_size)
            .and_then(|position| position.checked_add(base_offset))
            .ok_or(invalid("MFT outside of the volume"))?;

        Ok(Volume {
            base_offset,
            serial_number: boot_sector.serial_number,
            cluster_size,
            volume_size,
            file_record_size,
            index_record_size,
            mft_position,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(cluster_size: u64, base_offset: u64) -> Self {
        Volume {
            base_offset,
            serial_number: 0,
            cluster_size,
            volume_size: u64::MAX,
            file_record_size: 1024,
            index_record_size: 4096,
            mft_position: 0,
        }
    }
}

/// Addressable view of an NTFS volume: locates records by number and
/// resolves paths from the root directory.
pub struct VolumeContext<R>
where
    R: Read + Seek,
{
    pub volume: Volume,
    pub(crate) reader: PagedReader<R>,
    mft: Mft,
}

impl<R> VolumeContext<R>
where
    R: Read + Seek,
{
    pub fn new(mut reader: PagedReader<R>, base_offset: u64) -> RawCopyResult<Self> {
        let volume = Volume::new(&mut reader, base_offset)?;
        info!(
            "NTFS volume {:016X}: cluster {} bytes, file record {} bytes, MFT at {:#x}",
            volume.serial_number, volume.cluster_size, volume.file_record_size, volume.mft_position
        );

        if reader.page_size() < volume.cluster_size {
            debug!(
                "Page size {} is smaller than the cluster size {}",
                reader.page_size(),
                volume.cluster_size
            );
        }

        let mft = Mft::load(&mut reader, &volume)?;
        Ok(VolumeContext {
            volume,
            reader,
            mft,
        })
    }

    pub fn max_record(&self) -> u64 {
        self.mft.max_record()
    }

    /// Reads the in-use file record `number` from the MFT.
    pub fn get_record(&mut self, number: u64) -> RawCopyResult<NtfsFile> {
        let record = self.mft.get_record(&mut self.reader, number)?;
        if !record.is_used() {
            return Err(RawCopyError::InvalidRecord {
                record: number,
                details: "record is not in use",
            });
        }
        Ok(record)
    }

    pub fn root_directory(&mut self) -> RawCopyResult<NtfsFile> {
        let root = self.get_record(ROOT_RECORD)?;
        if !root.is_directory() {
            return Err(RawCopyError::InvalidRecord {
                record: ROOT_RECORD,
                details: "root record is not a directory",
            });
        }
        Ok(root)
    }

    /// Extension records holding attributes of `attribute_type` for `record`.
    pub fn extension_records(
        &mut self,
        record: &NtfsFile,
        attribute_type: NtfsAttributeType,
    ) -> RawCopyResult<Vec<NtfsFile>> {
        let entries = read_attribute_list(&mut self.reader, &self.volume, record)?;

        let mut numbers: Vec<u64> = entries
            .iter()
            .filter(|entry| {
                entry.type_id == attribute_type as u32 && entry.reference() != record.number
            })
            .map(|entry| entry.reference())
            .collect();
        numbers.sort_unstable();
        numbers.dedup();

        let mut records = Vec::with_capacity(numbers.len());
        for number in numbers {
            let extension = self.get_record(number)?;
            if extension.base_record() != record.number {
                return Err(RawCopyError::InvalidRecord {
                    record: number,
                    details: "extension record belongs to another file",
                });
            }
            records.push(extension);
        }
        Ok(records)
    }

    /// Layout of attribute `attribute_type`/`name`, following the attribute list.
    pub fn attribute_layout(
        &mut self,
        record: &NtfsFile,
        attribute_type: NtfsAttributeType,
        name: &str,
    ) -> RawCopyResult<Option<StreamLayout>> {
        let extensions = self.extension_records(record, attribute_type)?;
        let mut records = vec![record];
        records.extend(extensions.iter());
        StreamLayout::assemble(&self.volume, &records, attribute_type, name)
    }

    pub fn best_file_name(&mut self, record: &NtfsFile) -> RawCopyResult<Option<NtfsFileName>> {
        if let Some(name) = record.get_best_file_name() {
            return Ok(Some(name));
        }
        let extensions = self.extension_records(record, NtfsAttributeType::FileName)?;
        Ok(extensions.iter().find_map(NtfsFile::get_best_file_name))
    }

    /// Path of `record` relative to the volume root, `/` separated.
    pub fn full_path(&mut self, record: &NtfsFile) -> RawCopyResult<String> {
        if record.number == ROOT_RECORD {
            return Ok(String::new());
        }

        let no_name = |number| RawCopyError::InvalidRecord {
            record: number,
            details: "record has no file name",
        };

        let mut components = Vec::new();
        let mut visited = HashSet::from([record.number]);
        let mut name = self
            .best_file_name(record)?
            .ok_or(no_name(record.number))?;

        loop {
            let parent = name.parent();
            components.push(name.name);
            if parent == ROOT_RECORD {
                break;
            }
            if !visited.insert(parent) {
                return Err(RawCopyError::InvalidRecord {
                    record: parent,
                    details: "directory loop in parent references",
                });
            }

            let parent_record = self.get_record(parent)?;
            name = self
                .best_file_name(&parent_record)?
                .ok_or(no_name(parent))?;
        }

        components.reverse();
        Ok(components.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_utils::{ImageBuilder, StreamData, TEST_CLUSTER_SIZE};

    fn context(image: Vec<u8>) -> VolumeContext<Cursor<Vec<u8>>> {
        let reader = PagedReader::new(Cursor::new(image), 4096, 16).unwrap();
        VolumeContext::new(reader, 0).unwrap()
    }

    #[test]
    fn reads_geometry_from_boot_sector() {
        let image = ImageBuilder::new().build();
        let mut reader = Cursor::new(image);
        let volume = Volume::new(&mut reader, 0).unwrap();

        assert_eq!(volume.cluster_size, TEST_CLUSTER_SIZE);
        assert_eq!(volume.file_record_size, 1024);
        assert_eq!(volume.index_record_size, 4096);
        assert_eq!(volume.mft_position, 4 * TEST_CLUSTER_SIZE);
    }

    #[test]
    fn rejects_non_ntfs_boot_sector() {
        let mut image = ImageBuilder::new().build();
        image[3..11].copy_from_slice(b"EXFAT   ");
        let mut reader = Cursor::new(image);
        assert!(matches!(
            Volume::new(&mut reader, 0),
            Err(RawCopyError::InvalidBootSector { .. })
        ));
    }

    #[test]
    fn rejects_oversized_cluster_encoding() {
        for encoded in [0x81u8, 0xC0, 0xCC, 0xEA] {
            let mut image = ImageBuilder::new().build();
            image[13] = encoded;
            if encoded == 0xCC {
                image[11..13].copy_from_slice(&4096u16.to_le_bytes());
            }
            let mut reader = Cursor::new(image);
            assert!(
                matches!(
                    Volume::new(&mut reader, 0),
                    Err(RawCopyError::InvalidBootSector { .. })
                ),
                "sectors per cluster {encoded:#x}"
            );
        }
    }

    #[test]
    fn honours_boot_sector_offset() {
        let mut builder = ImageBuilder::new();
        let file = builder.add_file(ROOT_RECORD, "a.txt", StreamData::Resident(b"a".to_vec()));
        let mut image = vec![0u8; 3 * 512];
        image.extend(builder.build());

        let reader = PagedReader::new(Cursor::new(image), 4096, 16).unwrap();
        let mut ctx = VolumeContext::new(reader, 3 * 512).unwrap();
        let record = ctx.get_record(file).unwrap();
        assert_eq!(ctx.full_path(&record).unwrap(), "a.txt");
    }

    #[test]
    fn fragmented_mft_reaches_high_records() {
        let mut builder = ImageBuilder::new();
        let mut last = 0;
        for i in 0..12 {
            last = builder.add_file(
                ROOT_RECORD,
                &format!("f{i}.txt"),
                StreamData::Resident(vec![i as u8]),
            );
        }
        let mut ctx = context(builder.build());

        // Records past the first MFT extent live in the second one.
        assert!(last >= 32);
        assert!(ctx.mft.layout.extents().len() >= 2);
        let record = ctx.get_record(last).unwrap();
        assert_eq!(ctx.full_path(&record).unwrap(), "f11.txt");
    }

    #[test]
    fn full_path_walks_parents() {
        let mut builder = ImageBuilder::new();
        let windows = builder.add_directory(ROOT_RECORD, "Windows");
        let system32 = builder.add_directory(windows, "System32");
        let file = builder.add_file(system32, "kernel32.dll", StreamData::Resident(vec![1]));
        let mut ctx = context(builder.build());

        let record = ctx.get_record(file).unwrap();
        assert_eq!(ctx.full_path(&record).unwrap(), "Windows/System32/kernel32.dll");
        let root = ctx.root_directory().unwrap();
        assert_eq!(ctx.full_path(&root).unwrap(), "");
    }

    #[test]
    fn unused_records_are_rejected() {
        let mut ctx = context(ImageBuilder::new().build());
        assert!(matches!(
            ctx.get_record(30),
            Err(RawCopyError::InvalidRecord { record: 30, .. })
        ));
        let beyond = ctx.max_record();
        assert!(ctx.get_record(beyond).is_err());
    }
}
