// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use crate::{
    api::*,
    errors::{RawCopyError, RawCopyResult},
};

/// One mapping pair of a non-resident attribute, in clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRun {
    Data { lcn: u64, clusters: u64 },
    Sparse { clusters: u64 },
}

impl DataRun {
    pub fn clusters(&self) -> u64 {
        match self {
            DataRun::Data { clusters, .. } | DataRun::Sparse { clusters } => *clusters,
        }
    }
}

pub struct NtfsAttribute<'a> {
    data: &'a [u8],
    pub header: NtfsAttributeHeader,
}

impl<'a> NtfsAttribute<'a> {
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < ATTRIBUTE_HEADER_SIZE {
            return None;
        }

        let header: NtfsAttributeHeader = parse_le(data).ok()?;
        let length = header.length as usize;
        if length < ATTRIBUTE_HEADER_SIZE || length > data.len() {
            return None;
        }

        Some(Self {
            data: &data[..length],
            header,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_type(&self, attribute_type: NtfsAttributeType) -> bool {
        self.header.type_id == attribute_type as u32
    }

    pub fn is_resident(&self) -> bool {
        self.header.is_non_resident == 0
    }

    pub fn is_compressed(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::CompressionMask as u16 != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::Encrypted as u16 != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.header.flags & NtfsAttributeFlags::Sparse as u16 != 0
    }

    /// Attribute name, empty for the unnamed (default) attribute.
    pub fn name(&self) -> String {
        if self.header.name_length == 0 {
            return String::new();
        }
        let start = self.header.name_offset as usize;
        let end = start + self.header.name_length as usize * 2;
        self.data
            .get(start..end)
            .map(utf16_le_to_string)
            .unwrap_or_default()
    }

    pub fn resident_header(&self) -> Option<NtfsResidentAttributeHeader> {
        if !self.is_resident() || self.len() < RESIDENT_HEADER_SIZE {
            return None;
        }
        parse_le(self.data).ok()
    }

    pub fn nonresident_header(&self) -> Option<NtfsNonResidentAttributeHeader> {
        if self.is_resident() || self.len() < NON_RESIDENT_HEADER_SIZE {
            return None;
        }
        parse_le(self.data).ok()
    }

    pub fn get_resident(&self) -> Option<&'a [u8]> {
        let header = self.resident_header()?;
        let start = header.value_offset as usize;
        let end = start.checked_add(header.value_length as usize)?;
        self.data.get(start..end)
    }

    pub fn as_standard_info(&self) -> Option<NtfsStandardInformation> {
        if !self.is_type(NtfsAttributeType::StandardInformation) {
            return None;
        }
        let slice = self.get_resident()?;
        if slice.len() < STANDARD_INFORMATION_SIZE {
            return None;
        }
        parse_le(slice).ok()
    }

    pub fn as_name(&self) -> Option<NtfsFileName> {
        if !self.is_type(NtfsAttributeType::FileName) {
            return None;
        }
        NtfsFileName::parse(self.get_resident()?)
    }

    /// Decodes the mapping pairs of this attribute segment.
    ///
    /// Each segment starts counting LCN deltas from zero, so segments taken
    /// from an attribute list can be decoded independently and concatenated.
    pub fn get_nonresident_data_runs(&self) -> RawCopyResult<Vec<DataRun>> {
        let header_nonres = self
            .nonresident_header()
            .ok_or(RawCopyError::InvalidDataRun {
                details: "attribute is resident",
            })?;

        let start = header_nonres.data_runs_offset as usize;
        if start > self.len() {
            return Err(RawCopyError::InvalidDataRun {
                details: "data runs offset outside attribute",
            });
        }
        let runs_data = &self.data[start..];

        const BUF_SIZE: usize = 8;

        let mut out = Vec::new();
        let mut cursor = 0usize;
        let mut prev_lcn = 0i64;
        loop {
            if cursor >= runs_data.len() {
                return Err(RawCopyError::InvalidDataRun {
                    details: "unterminated data run sequence",
                });
            }
            if runs_data[cursor] == 0 {
                break;
            }

            let descriptor = runs_data[cursor];
            let cluster_count_b = (descriptor & 0x0f) as usize;
            let cluster_offset_b = ((descriptor & 0xf0) >> 4) as usize;

            if cluster_count_b == 0 || cluster_count_b > BUF_SIZE {
                return Err(RawCopyError::InvalidDataRun {
                    details: "invalid cluster count field",
                });
            }
            if cluster_offset_b > BUF_SIZE {
                return Err(RawCopyError::InvalidDataRun {
                    details: "invalid cluster offset field",
                });
            }

            cursor += 1;

            if cursor + cluster_count_b + cluster_offset_b > runs_data.len() {
                return Err(RawCopyError::InvalidDataRun {
                    details: "unexpected end of mapping pairs",
                });
            }

            let mut count_buf = [0u8; BUF_SIZE];
            count_buf[..cluster_count_b]
                .copy_from_slice(&runs_data[cursor..cursor + cluster_count_b]);
            let clusters = u64::from_le_bytes(count_buf);
            if clusters == 0 {
                return Err(RawCopyError::InvalidDataRun {
                    details: "cluster count is zero",
                });
            }
            cursor += cluster_count_b;

            if cluster_offset_b == 0 {
                out.push(DataRun::Sparse { clusters });
                continue;
            }

            let mut offset_buf = [0u8; BUF_SIZE];
            offset_buf[..cluster_offset_b]
                .copy_from_slice(&runs_data[cursor..cursor + cluster_offset_b]);
            let raw = i64::from_le_bytes(offset_buf);
            // Sign-extend the little-endian delta.
            let empty_bits = (BUF_SIZE - cluster_offset_b) * 8;
            let delta = (raw << empty_bits) >> empty_bits;
            cursor += cluster_offset_b;

            let lcn = prev_lcn
                .checked_add(delta)
                .ok_or(RawCopyError::InvalidDataRun {
                    details: "relative offset overflow",
                })?;
            if lcn < 0 {
                return Err(RawCopyError::InvalidDataRun {
                    details: "relative offset underflow",
                });
            }
            prev_lcn = lcn;

            out.push(DataRun::Data {
                lcn: lcn as u64,
                clusters,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonresident(runs: &[u8]) -> Vec<u8> {
        let length = NON_RESIDENT_HEADER_SIZE + runs.len().div_ceil(8) * 8;
        let mut data = vec![0u8; length];
        data[..4].copy_from_slice(&(NtfsAttributeType::Data as u32).to_le_bytes());
        data[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        data[8] = 1;
        data[32..34].copy_from_slice(&(NON_RESIDENT_HEADER_SIZE as u16).to_le_bytes());
        data[NON_RESIDENT_HEADER_SIZE..NON_RESIDENT_HEADER_SIZE + runs.len()]
            .copy_from_slice(runs);
        data
    }

    #[test]
    fn decodes_relative_and_sparse_runs() {
        // 0x18 clusters at 0x5634, 0x10 sparse, 0x20 clusters at 0x5634 - 0x100
        let data = nonresident(&[
            0x21, 0x18, 0x34, 0x56, //
            0x01, 0x10, //
            0x21, 0x20, 0x00, 0xFF, //
            0x00,
        ]);
        let attr = NtfsAttribute::new(&data).unwrap();
        let runs = attr.get_nonresident_data_runs().unwrap();

        assert_eq!(
            runs,
            vec![
                DataRun::Data {
                    lcn: 0x5634,
                    clusters: 0x18
                },
                DataRun::Sparse { clusters: 0x10 },
                DataRun::Data {
                    lcn: 0x5534,
                    clusters: 0x20
                },
            ]
        );
    }

    #[test]
    fn rejects_truncated_runs() {
        // Second pair claims three offset bytes past the end of the attribute.
        let data = nonresident(&[0x31, 0x18, 0x34, 0x56, 0x00, 0x31, 0x01, 0x02]);
        let attr = NtfsAttribute::new(&data).unwrap();
        assert!(matches!(
            attr.get_nonresident_data_runs(),
            Err(RawCopyError::InvalidDataRun {
                details: "unexpected end of mapping pairs"
            })
        ));
    }

    #[test]
    fn rejects_negative_lcn() {
        let data = nonresident(&[0x11, 0x01, 0x80, 0x00]);
        let attr = NtfsAttribute::new(&data).unwrap();
        assert!(matches!(
            attr.get_nonresident_data_runs(),
            Err(RawCopyError::InvalidDataRun { .. })
        ));
    }

    #[test]
    fn resident_attribute_has_no_runs() {
        let mut data = vec![0u8; 32];
        data[..4].copy_from_slice(&(NtfsAttributeType::Data as u32).to_le_bytes());
        data[4..8].copy_from_slice(&32u32.to_le_bytes());
        data[16..20].copy_from_slice(&3u32.to_le_bytes());
        data[20..22].copy_from_slice(&24u16.to_le_bytes());
        data[24..27].copy_from_slice(b"abc");

        let attr = NtfsAttribute::new(&data).unwrap();
        assert!(attr.is_resident());
        assert_eq!(attr.get_resident(), Some(&b"abc"[..]));
        assert_eq!(attr.name(), "");
        assert!(attr.get_nonresident_data_runs().is_err());
    }
}
