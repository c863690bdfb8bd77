// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::{Read, Seek};
use std::time::SystemTime;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

use crate::{
    api::{ntfs_to_system_time, ntfs_to_unix_time, NtfsAttributeType, NtfsStandardInformation},
    errors::{RawCopyError, RawCopyResult},
    file::NtfsFile,
    volume::VolumeContext,
};

/// Timestamps of a file record plus the logical size of the stream being
/// extracted. Times are raw NTFS ticks (100ns since 1601-01-01 UTC).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
    pub size: u64,
}

impl StandardInformation {
    pub fn new(raw: &NtfsStandardInformation, size: u64) -> Self {
        StandardInformation {
            creation_time: raw.creation_time,
            modification_time: raw.modification_time,
            mft_modification_time: raw.mft_record_modification_time,
            access_time: raw.access_time,
            file_attributes: raw.file_attributes,
            size,
        }
    }

    pub fn created(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.creation_time)
    }

    pub fn modified(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.modification_time)
    }

    pub fn mft_modified(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.mft_modification_time)
    }

    pub fn accessed(&self) -> OffsetDateTime {
        ntfs_to_unix_time(self.access_time)
    }

    pub fn accessed_system_time(&self) -> SystemTime {
        ntfs_to_system_time(self.access_time)
    }

    pub fn modified_system_time(&self) -> SystemTime {
        ntfs_to_system_time(self.modification_time)
    }

    pub fn log(&self, full_path: &str) {
        info!(
            "\n    File Path: {}\n    File CTime: {}\n    File MTime: {}\n    MFT MTime: {}\n    File ATime: {}\n    Size: {}",
            full_path,
            format_time(self.created()),
            format_time(self.modified()),
            format_time(self.mft_modified()),
            format_time(self.accessed()),
            self.size
        );
    }
}

fn format_time(time: OffsetDateTime) -> String {
    time.format(&Rfc3339).unwrap_or_else(|_| time.to_string())
}

impl<R> VolumeContext<R>
where
    R: Read + Seek,
{
    /// Reads `$STANDARD_INFORMATION` of `record`; the size is taken from the
    /// default data stream, or the named one when `stream` is given.
    pub fn standard_information(
        &mut self,
        record: &NtfsFile,
        stream: Option<&str>,
    ) -> RawCopyResult<StandardInformation> {
        let raw = record
            .attributes()
            .find_map(|attr| attr.as_standard_info())
            .ok_or(RawCopyError::MissingMetadata {
                record: record.number,
            })?;

        let size = self
            .attribute_layout(record, NtfsAttributeType::Data, stream.unwrap_or(""))?
            .map_or(0, |layout| layout.size());

        Ok(StandardInformation::new(&raw, size))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::api::{EPOCH_DIFFERENCE, ROOT_RECORD};
    use crate::paged_reader::PagedReader;
    use crate::test_utils::{default_times, Fragment, ImageBuilder, StreamData};

    #[test]
    fn reads_timestamps_and_stream_size() {
        let mut builder = ImageBuilder::new();
        let file = builder.add_file(
            ROOT_RECORD,
            "report.docx",
            StreamData::non_resident(vec![Fragment::Data(vec![7u8; 5000])]),
        );
        builder.add_stream(file, "Zone.Identifier", StreamData::Resident(vec![1u8; 26]));
        let reader = PagedReader::new(Cursor::new(builder.build()), 4096, 16).unwrap();
        let mut ctx = VolumeContext::new(reader, 0).unwrap();
        let record = ctx.get_record(file).unwrap();

        let info = ctx.standard_information(&record, None).unwrap();
        let [created, modified, mft_modified, accessed] = default_times(file);
        assert_eq!(info.creation_time, created);
        assert_eq!(info.modification_time, modified);
        assert_eq!(info.mft_modification_time, mft_modified);
        assert_eq!(info.access_time, accessed);
        assert_eq!(info.size, 5000);

        let ads = ctx
            .standard_information(&record, Some("Zone.Identifier"))
            .unwrap();
        assert_eq!(ads.size, 26);
    }

    #[test]
    fn converts_to_calendar_time() {
        let info = StandardInformation {
            // 2021-06-01T12:00:00Z
            creation_time: EPOCH_DIFFERENCE + 1_622_548_800 * 10_000_000,
            modification_time: EPOCH_DIFFERENCE,
            mft_modification_time: 0,
            access_time: EPOCH_DIFFERENCE,
            file_attributes: 0,
            size: 0,
        };
        assert_eq!(format_time(info.created()), "2021-06-01T12:00:00Z");
        assert_eq!(info.modified(), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(info.modified_system_time(), std::time::UNIX_EPOCH);
    }
}
