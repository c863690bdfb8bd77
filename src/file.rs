// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use crate::{
    api::*,
    attribute::NtfsAttribute,
    errors::{RawCopyError, RawCopyResult},
    mft::apply_fixups,
};

/// A file record read from the MFT, with update sequence fixups applied.
#[derive(Clone)]
pub struct NtfsFile {
    pub number: u64,
    pub header: NtfsFileRecordHeader,
    data: Vec<u8>,
}

impl NtfsFile {
    pub fn new(number: u64, mut data: Vec<u8>) -> RawCopyResult<Self> {
        let invalid = |details| RawCopyError::InvalidRecord {
            record: number,
            details,
        };

        if !Self::is_valid(&data) {
            return Err(invalid("not a valid FILE record"));
        }
        apply_fixups(&mut data).map_err(invalid)?;

        let header: NtfsFileRecordHeader = parse_le(&data)?;
        Ok(NtfsFile {
            number,
            header,
            data,
        })
    }

    /// Record number of the base record, for extension records.
    pub fn base_record(&self) -> u64 {
        self.header.base_reference & FILE_REFERENCE_MASK
    }

    pub fn is_valid(data: &[u8]) -> bool {
        if data.len() < FILE_RECORD_HEADER_SIZE {
            return false;
        }
        let header: NtfsFileRecordHeader = match parse_le(data) {
            Ok(header) => header,
            Err(_) => return false,
        };
        if &header.signature != FILE_RECORD_SIGNATURE {
            return false;
        }

        if header.update_sequence_length == 0 {
            return false;
        }

        if header.used_size as usize > data.len() {
            return false;
        }

        let usa_end =
            header.update_sequence_offset as usize + header.update_sequence_length as usize * 2;

        let usa_num = header.update_sequence_length as usize - 1;
        let sector_num = data.len() / SECTOR_SIZE;

        if usa_end > data.len() || usa_num > sector_num {
            return false;
        }

        if header.attributes_offset as usize >= header.used_size as usize {
            return false;
        }

        true
    }

    pub fn attributes(&self) -> Attributes<'_> {
        Attributes {
            data: &self.data,
            offset: self.header.attributes_offset as usize,
            used: usize::min(self.header.used_size as usize, self.data.len()),
        }
    }

    pub fn get_attribute(&self, attribute_type: NtfsAttributeType) -> Option<NtfsAttribute<'_>> {
        self.attributes().find(|attr| attr.is_type(attribute_type))
    }

    pub fn get_named_attribute(
        &self,
        attribute_type: NtfsAttributeType,
        name: &str,
    ) -> Option<NtfsAttribute<'_>> {
        self.attributes()
            .find(|attr| attr.is_type(attribute_type) && names_match(&attr.name(), name))
    }

    /// Prefers the Win32 name over the DOS 8.3 alias.
    pub fn get_best_file_name(&self) -> Option<NtfsFileName> {
        let mut best = None;

        for attr in self.attributes() {
            if let Some(name) = attr.as_name() {
                if name.is_win32() {
                    return Some(name);
                }
                if best.is_none() || !name.is_dos_only() {
                    best = Some(name);
                }
            }
        }

        best
    }

    pub fn is_used(&self) -> bool {
        self.header.flags & NtfsFileFlags::InUse as u16 != 0
    }

    pub fn is_directory(&self) -> bool {
        self.header.flags & NtfsFileFlags::IsDirectory as u16 != 0
    }
}

pub struct Attributes<'a> {
    data: &'a [u8],
    offset: usize,
    used: usize,
}

impl<'a> Iterator for Attributes<'a> {
    type Item = NtfsAttribute<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let slice = self.data.get(self.offset..self.used)?;
        if slice.len() < 4 || slice[..4] == END_MARKER {
            self.offset = self.used;
            return None;
        }

        let attr = match NtfsAttribute::new(slice) {
            Some(attr) => attr,
            None => {
                self.offset = self.used;
                return None;
            }
        };
        self.offset += attr.len();
        Some(attr)
    }
}

/// Case-insensitive comparison the way NTFS matches names.
pub fn names_match(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}

/// Parses the entries of an `$ATTRIBUTE_LIST` value.
pub fn parse_attribute_list(record: u64, value: &[u8]) -> RawCopyResult<Vec<NtfsAttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + ATTRIBUTE_LIST_ENTRY_SIZE <= value.len() {
        let entry: NtfsAttributeListEntry = parse_le(&value[offset..])?;
        let length = entry.length as usize;
        if length < ATTRIBUTE_LIST_ENTRY_SIZE || offset + length > value.len() {
            return Err(RawCopyError::InvalidRecord {
                record,
                details: "malformed attribute list entry",
            });
        }
        entries.push(entry);
        offset += length;
    }

    Ok(entries)
}
