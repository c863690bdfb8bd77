// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::HashSet;
use std::io::{Read, Seek};

use tracing::{debug, trace};

use crate::{
    api::*,
    errors::{RawCopyError, RawCopyResult},
    file::{names_match, NtfsFile},
    mft::apply_fixups,
    volume::VolumeContext,
};

/// One entry of a `$I30` B-tree node.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub file_reference: u64,
    /// `None` for the terminating entry of a node.
    pub name: Option<NtfsFileName>,
    /// VCN of the child node holding keys that sort before this one.
    pub subnode: Option<u64>,
}

impl IndexEntry {
    pub fn record(&self) -> u64 {
        self.file_reference & FILE_REFERENCE_MASK
    }
}

/// Parses the entries of an index node; `data` starts at the node header.
pub fn parse_index_node(data: &[u8], record: u64) -> RawCopyResult<Vec<IndexEntry>> {
    let invalid = |details| RawCopyError::InvalidIndex { record, details };

    if data.len() < INDEX_NODE_HEADER_SIZE {
        return Err(invalid("truncated index node header"));
    }
    let header: NtfsIndexNodeHeader = parse_le(data)?;
    let end = header.index_length as usize;
    if end > data.len() {
        return Err(invalid("index node exceeds its buffer"));
    }

    let mut entries = Vec::new();
    let mut offset = header.entries_offset as usize;
    loop {
        if offset + INDEX_ENTRY_HEADER_SIZE > end {
            return Err(invalid("index node has no last entry"));
        }
        let entry_header: NtfsIndexEntryHeader = parse_le(&data[offset..end])?;
        let length = entry_header.length as usize;
        if length < INDEX_ENTRY_HEADER_SIZE || offset + length > end {
            return Err(invalid("index entry out of bounds"));
        }
        let entry = &data[offset..offset + length];

        let subnode = if entry_header.flags & NtfsIndexEntryFlags::HasSubnode as u16 != 0 {
            if length < INDEX_ENTRY_HEADER_SIZE + 8 {
                return Err(invalid("index entry too short for a subnode"));
            }
            let mut vcn = [0u8; 8];
            vcn.copy_from_slice(&entry[length - 8..]);
            Some(u64::from_le_bytes(vcn))
        } else {
            None
        };

        let is_last = entry_header.flags & NtfsIndexEntryFlags::Last as u16 != 0;
        let name = if is_last || entry_header.key_length == 0 {
            None
        } else {
            let key_end = INDEX_ENTRY_HEADER_SIZE + entry_header.key_length as usize;
            let key = entry
                .get(INDEX_ENTRY_HEADER_SIZE..key_end)
                .ok_or(invalid("index key out of bounds"))?;
            Some(NtfsFileName::parse(key).ok_or(invalid("malformed file name key"))?)
        };

        entries.push(IndexEntry {
            file_reference: entry_header.file_reference,
            name,
            subnode,
        });

        if is_last {
            break;
        }
        offset += length;
    }

    Ok(entries)
}

/// Parses an `$INDEX_ROOT` value holding file name keys.
pub fn parse_index_root(
    value: &[u8],
    record: u64,
) -> RawCopyResult<(NtfsIndexRootHeader, Vec<IndexEntry>)> {
    if value.len() < INDEX_ROOT_HEADER_SIZE {
        return Err(RawCopyError::InvalidIndex {
            record,
            details: "truncated index root",
        });
    }
    let header: NtfsIndexRootHeader = parse_le(value)?;
    if header.attribute_type != NtfsAttributeType::FileName as u32 {
        return Err(RawCopyError::InvalidIndex {
            record,
            details: "index root is not keyed by file name",
        });
    }

    let entries = parse_index_node(&value[INDEX_ROOT_HEADER_SIZE..], record)?;
    Ok((header, entries))
}

/// Parses one INDX block of `$INDEX_ALLOCATION` read from `vcn`.
pub fn parse_index_record(
    mut data: Vec<u8>,
    record: u64,
    vcn: u64,
) -> RawCopyResult<Vec<IndexEntry>> {
    let invalid = |details| RawCopyError::InvalidIndex { record, details };

    if data.len() < INDEX_RECORD_HEADER_SIZE || &data[..4] != INDEX_RECORD_SIGNATURE {
        return Err(invalid("not a valid INDX record"));
    }
    apply_fixups(&mut data).map_err(invalid)?;

    let header: NtfsIndexRecordHeader = parse_le(&data)?;
    if header.vcn != vcn {
        return Err(invalid("INDX record VCN mismatch"));
    }

    parse_index_node(&data[INDEX_RECORD_HEADER_SIZE..], record)
}

/// Best match for a name among the keys seen so far, as full file references.
#[derive(Default)]
struct ChildMatch {
    exact: Option<u64>,
    folded: Option<u64>,
}

impl ChildMatch {
    fn scan(&mut self, entries: &[IndexEntry], name: &str, pending: &mut Vec<u64>) {
        for entry in entries {
            if let Some(vcn) = entry.subnode {
                pending.push(vcn);
            }
            let Some(key) = &entry.name else {
                continue;
            };
            if key.name == name {
                self.exact.get_or_insert(entry.file_reference);
            } else if names_match(&key.name, name) {
                self.folded.get_or_insert(entry.file_reference);
            }
        }
    }

    fn found(&self) -> Option<u64> {
        self.exact.or(self.folded)
    }
}

impl<R> VolumeContext<R>
where
    R: Read + Seek,
{
    /// Looks `name` up in the `$I30` index of `dir` and returns the record
    /// number it points at.
    pub fn find_child(&mut self, dir: &NtfsFile, name: &str) -> RawCopyResult<Option<u64>> {
        Ok(self
            .find_child_reference(dir, name)?
            .map(|reference| reference & FILE_REFERENCE_MASK))
    }

    /// Looks `name` up and returns the full file reference of the entry,
    /// sequence number included.
    ///
    /// Walks every node of the B-tree instead of relying on collation order,
    /// so names are matched case-insensitively against both long and DOS
    /// names. An exact-case match wins over a case-folded one.
    pub fn find_child_reference(
        &mut self,
        dir: &NtfsFile,
        name: &str,
    ) -> RawCopyResult<Option<u64>> {
        if !dir.is_directory() {
            return Ok(None);
        }
        let invalid = |details| RawCopyError::InvalidIndex {
            record: dir.number,
            details,
        };

        let root_layout = self
            .attribute_layout(dir, NtfsAttributeType::IndexRoot, FILE_NAME_INDEX)?
            .ok_or(invalid("directory has no index root"))?;
        let mut value = vec![0u8; root_layout.size() as usize];
        root_layout.read_exact_at(&mut self.reader, &mut value, 0)?;
        let (root_header, entries) = parse_index_root(&value, dir.number)?;

        let mut matched = ChildMatch::default();
        let mut pending = Vec::new();
        matched.scan(&entries, name, &mut pending);
        if pending.is_empty() || matched.exact.is_some() {
            return Ok(matched.found());
        }

        let allocation = self
            .attribute_layout(dir, NtfsAttributeType::IndexAllocation, FILE_NAME_INDEX)?
            .ok_or(invalid("index has subnodes but no allocation"))?;

        let block_size = match root_header.index_record_size as u64 {
            size if size >= SECTOR_SIZE as u64 && size.is_power_of_two() => size,
            _ => self.volume.index_record_size,
        };
        // Small index blocks are addressed in sectors rather than clusters.
        let vcn_unit = if block_size >= self.volume.cluster_size {
            self.volume.cluster_size
        } else {
            SECTOR_SIZE as u64
        };

        let mut visited = HashSet::new();
        while let Some(vcn) = pending.pop() {
            if !visited.insert(vcn) {
                return Err(invalid("index node referenced twice"));
            }
            let offset = vcn
                .checked_mul(vcn_unit)
                .filter(|offset| *offset < allocation.size())
                .ok_or(invalid("index subnode outside the allocation"))?;
            trace!("Reading INDX block at VCN {} of record {}", vcn, dir.number);

            let mut data = vec![0u8; block_size as usize];
            allocation.read_exact_at(&mut self.reader, &mut data, offset)?;
            let entries = parse_index_record(data, dir.number, vcn)?;
            matched.scan(&entries, name, &mut pending);
            if matched.exact.is_some() {
                break;
            }
        }

        debug!(
            "Directory {} searched {} index blocks for {:?}",
            dir.number,
            visited.len(),
            name
        );
        Ok(matched.found())
    }

    /// Resolves a `/` separated path below `dir`.
    pub fn open(&mut self, dir: &NtfsFile, relative_path: &str) -> RawCopyResult<NtfsFile> {
        let not_found = || RawCopyError::NotFound {
            path: relative_path.to_string(),
        };

        let mut current = dir.clone();
        for segment in relative_path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_directory() {
                return Err(not_found());
            }
            let reference = self
                .find_child_reference(&current, segment)?
                .ok_or_else(not_found)?;
            let child = reference & FILE_REFERENCE_MASK;
            trace!("{:?} -> record {}", segment, child);
            let record = self.get_record(child)?;

            let sequence = (reference >> 48) as u16;
            if record.header.sequence_value != sequence {
                debug!(
                    "Stale index entry for {:?}: record {} has sequence {}, entry has {}",
                    segment, child, record.header.sequence_value, sequence
                );
                return Err(not_found());
            }
            current = record;
        }
        Ok(current)
    }
}
