// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use tracing::{debug, info};

use crate::{
    api::*,
    errors::{RawCopyError, RawCopyResult},
    file::NtfsFile,
    paged_reader::ReadAt,
    stream::{read_attribute_list, StreamLayout},
    volume::Volume,
};

/// Locates file records through the run list of `$MFT` itself.
pub struct Mft {
    pub record_size: u64,
    pub layout: StreamLayout,
}

impl Mft {
    pub fn load<R>(reader: &mut R, volume: &Volume) -> RawCopyResult<Self>
    where
        R: ReadAt,
    {
        info!("Reading $MFT record at {:#x}", volume.mft_position);

        let mut data = vec![0u8; volume.file_record_size as usize];
        reader.read_exact_at(&mut data, volume.mft_position)?;
        let record = NtfsFile::new(MFT_RECORD, data)?;

        let base_layout = StreamLayout::assemble(volume, &[&record], NtfsAttributeType::Data, "")?
            .ok_or(RawCopyError::InvalidRecord {
                record: MFT_RECORD,
                details: "$MFT has no data attribute",
            })?;

        let mut mft = Mft {
            record_size: volume.file_record_size,
            layout: base_layout,
        };

        // A heavily fragmented $MFT keeps the rest of its run list in
        // extension records, which the first extent always covers.
        let mut numbers: Vec<u64> = read_attribute_list(reader, volume, &record)?
            .iter()
            .filter(|entry| {
                entry.type_id == NtfsAttributeType::Data as u32 && entry.reference() != MFT_RECORD
            })
            .map(|entry| entry.reference())
            .collect();
        numbers.sort_unstable();
        numbers.dedup();

        if !numbers.is_empty() {
            debug!("$MFT data continues in records {:?}", numbers);
            let mut extensions = Vec::with_capacity(numbers.len());
            for number in numbers {
                extensions.push(mft.get_record(reader, number)?);
            }

            let mut records = vec![&record];
            records.extend(extensions.iter());
            if let Some(layout) =
                StreamLayout::assemble(volume, &records, NtfsAttributeType::Data, "")?
            {
                mft.layout = layout;
            }
        }

        info!(
            "MFT holds {} records in {} extents",
            mft.max_record(),
            mft.layout.extents().len()
        );
        Ok(mft)
    }

    pub fn max_record(&self) -> u64 {
        self.layout.size() / self.record_size
    }

    pub fn get_record<R>(&self, reader: &mut R, number: u64) -> RawCopyResult<NtfsFile>
    where
        R: ReadAt,
    {
        if number >= self.max_record() {
            return Err(RawCopyError::InvalidRecord {
                record: number,
                details: "record number beyond the end of the MFT",
            });
        }

        let mut data = vec![0u8; self.record_size as usize];
        self.layout
            .read_exact_at(reader, &mut data, number * self.record_size)?;
        NtfsFile::new(number, data)
    }
}

/// Restores the sector tails that the update sequence array protects.
///
/// Used for both FILE and INDX records, which share the header prefix.
pub fn apply_fixups(data: &mut [u8]) -> Result<(), &'static str> {
    if data.len() < 8 {
        return Err("record too small");
    }

    let usn_start = u16::from_le_bytes([data[4], data[5]]) as usize;
    let usa_count = u16::from_le_bytes([data[6], data[7]]) as usize;
    if usa_count == 0 {
        return Err("empty update sequence array");
    }

    let usa_start = usn_start + 2;
    let usa_end = usn_start + usa_count * 2;
    if usa_end > data.len() || (usa_count - 1) * SECTOR_SIZE > data.len() {
        return Err("update sequence array out of bounds");
    }

    let usn = [data[usn_start], data[usn_start + 1]];

    let mut sector_off = SECTOR_SIZE - 2;
    for usa_off in (usa_start..usa_end).step_by(2) {
        if data[sector_off..sector_off + 2] != usn {
            return Err("update sequence mismatch");
        }

        let mut usa = [0u8; 2];
        usa.copy_from_slice(&data[usa_off..usa_off + 2]);
        data[sector_off..sector_off + 2].copy_from_slice(&usa);
        sector_off += SECTOR_SIZE;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protected_record() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[..4].copy_from_slice(FILE_RECORD_SIGNATURE);
        data[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        data[6..8].copy_from_slice(&3u16.to_le_bytes());
        // USN 0x0007, original tails 0xAABB and 0xCCDD
        data[0x30..0x32].copy_from_slice(&7u16.to_le_bytes());
        data[0x32..0x34].copy_from_slice(&[0xAA, 0xBB]);
        data[0x34..0x36].copy_from_slice(&[0xCC, 0xDD]);
        data[510..512].copy_from_slice(&7u16.to_le_bytes());
        data[1022..1024].copy_from_slice(&7u16.to_le_bytes());
        data
    }

    #[test]
    fn restores_sector_tails() {
        let mut data = protected_record();
        apply_fixups(&mut data).unwrap();
        assert_eq!(&data[510..512], &[0xAA, 0xBB]);
        assert_eq!(&data[1022..1024], &[0xCC, 0xDD]);
    }

    #[test]
    fn detects_torn_write() {
        let mut data = protected_record();
        data[1022] = 0;
        assert_eq!(apply_fixups(&mut data), Err("update sequence mismatch"));
    }

    #[test]
    fn rejects_oversized_array() {
        let mut data = protected_record();
        data[6..8].copy_from_slice(&4u16.to_le_bytes());
        assert!(apply_fixups(&mut data).is_err());
    }
}
