// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::{self, Read, Seek};

use tracing::debug;

use crate::{
    api::*,
    attribute::DataRun,
    errors::{RawCopyError, RawCopyResult},
    file::{names_match, parse_attribute_list, NtfsFile},
    paged_reader::{PagedReader, ReadAt},
    volume::{Volume, VolumeContext},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentKind {
    /// Backed by the volume at this absolute byte position.
    Disk { position: u64 },
    /// Not allocated, reads as zeros.
    Sparse,
    /// Stored inside the file record.
    Resident,
}

/// A piece of a stream's logical content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub kind: ExtentKind,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_sparse(&self) -> bool {
        self.kind == ExtentKind::Sparse
    }
}

/// Something that can describe the on-disk layout of its content.
pub trait RangeDescribe {
    /// Extents in ascending offset order, covering `0..size()` without gaps.
    fn ranges(&self) -> &[Extent];
    fn size(&self) -> u64;
}

/// Where the bytes of one attribute live, independent of any reader.
#[derive(Clone, Debug, Default)]
pub struct StreamLayout {
    extents: Vec<Extent>,
    size: u64,
    initialized_size: u64,
    resident: Option<Vec<u8>>,
}

impl StreamLayout {
    pub fn resident(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        let extents = if size > 0 {
            vec![Extent {
                offset: 0,
                length: size,
                kind: ExtentKind::Resident,
            }]
        } else {
            Vec::new()
        };

        StreamLayout {
            extents,
            size,
            initialized_size: size,
            resident: Some(data),
        }
    }

    /// Maps decoded runs onto logical offsets, trimmed to `size`.
    pub fn from_runs(
        volume: &Volume,
        runs: &[DataRun],
        size: u64,
        initialized_size: u64,
    ) -> RawCopyResult<Self> {
        let cluster_size = volume.cluster_size;
        let mut extents = Vec::with_capacity(runs.len());
        let mut offset = 0u64;

        for run in runs {
            if offset >= size {
                break;
            }

            let length = run
                .clusters()
                .checked_mul(cluster_size)
                .ok_or(RawCopyError::InvalidDataRun {
                    details: "run length overflow",
                })?
                .min(size - offset);

            let kind = match *run {
                DataRun::Data { lcn, .. } => ExtentKind::Disk {
                    position: lcn
                        .checked_mul(cluster_size)
                        .and_then(|p| p.checked_add(volume.base_offset))
                        .ok_or(RawCopyError::InvalidDataRun {
                            details: "run position overflow",
                        })?,
                },
                DataRun::Sparse { .. } => ExtentKind::Sparse,
            };

            extents.push(Extent {
                offset,
                length,
                kind,
            });
            offset += length;
        }

        if offset < size {
            return Err(RawCopyError::InvalidDataRun {
                details: "data runs shorter than declared size",
            });
        }

        Ok(StreamLayout {
            extents,
            size,
            initialized_size: initialized_size.min(size),
            resident: None,
        })
    }

    /// Collects every segment of the attribute `attribute_type`/`name` found
    /// in `records` (base record first, then extension records) and joins
    /// them in VCN order.
    pub fn assemble(
        volume: &Volume,
        records: &[&NtfsFile],
        attribute_type: NtfsAttributeType,
        name: &str,
    ) -> RawCopyResult<Option<Self>> {
        let mut segments = Vec::new();

        for record in records {
            for attr in record.attributes() {
                if !attr.is_type(attribute_type) || !names_match(&attr.name(), name) {
                    continue;
                }

                if attr.is_compressed() || attr.is_encrypted() {
                    return Err(RawCopyError::UnsupportedAttribute {
                        record: record.number,
                        details: if attr.is_encrypted() {
                            "encrypted streams are not supported"
                        } else {
                            "compressed streams are not supported"
                        },
                    });
                }

                if attr.is_resident() {
                    let value = attr.get_resident().ok_or(RawCopyError::InvalidRecord {
                        record: record.number,
                        details: "resident value out of bounds",
                    })?;
                    return Ok(Some(StreamLayout::resident(value.to_vec())));
                }

                let header = attr
                    .nonresident_header()
                    .ok_or(RawCopyError::InvalidRecord {
                        record: record.number,
                        details: "truncated non-resident attribute",
                    })?;
                segments.push((header, attr.get_nonresident_data_runs()?));
            }
        }

        if segments.is_empty() {
            return Ok(None);
        }

        segments.sort_by_key(|(header, _)| header.lowest_vcn);
        let first = segments[0].0;
        if first.lowest_vcn != 0 {
            return Err(RawCopyError::InvalidDataRun {
                details: "first attribute segment does not start at VCN 0",
            });
        }

        let mut runs = Vec::new();
        let mut next_vcn = 0u64;
        for (header, segment_runs) in segments {
            if header.lowest_vcn != next_vcn {
                return Err(RawCopyError::InvalidDataRun {
                    details: "attribute segments are not contiguous",
                });
            }
            next_vcn += segment_runs.iter().map(DataRun::clusters).sum::<u64>();
            runs.extend(segment_runs);
        }

        Self::from_runs(volume, &runs, first.data_size, first.initialized_size).map(Some)
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn initialized_size(&self) -> u64 {
        self.initialized_size
    }

    /// Reads logical bytes at `offset`, fetching non-sparse pieces from `reader`.
    ///
    /// Fills as much of `buf` as the stream has left.
    pub fn read_at<R>(&self, reader: &mut R, buf: &mut [u8], offset: u64) -> io::Result<usize>
    where
        R: ReadAt + ?Sized,
    {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let want = clamp_len(self.size - offset, buf.len());

        if let Some(data) = &self.resident {
            let start = offset as usize;
            buf[..want].copy_from_slice(&data[start..start + want]);
            return Ok(want);
        }

        let mut done = 0usize;
        while done < want {
            let position = offset + done as u64;
            let idx = self.extents.partition_point(|e| e.end() <= position);
            let extent = self.extents.get(idx).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "offset not covered by any extent",
                )
            })?;

            let mut count = clamp_len(extent.end() - position, want - done);
            let chunk_zeroed = if position >= self.initialized_size {
                true
            } else {
                count = clamp_len(self.initialized_size - position, count);
                extent.is_sparse()
            };

            let chunk = &mut buf[done..done + count];
            if chunk_zeroed {
                chunk.fill(0);
            } else {
                match extent.kind {
                    ExtentKind::Disk { position: disk } => {
                        reader.read_exact_at(chunk, disk + (position - extent.offset))?;
                    }
                    ExtentKind::Sparse => chunk.fill(0),
                    ExtentKind::Resident => {
                        return Err(io::Error::other("resident extent without resident data"))
                    }
                }
            }
            done += count;
        }

        Ok(done)
    }

    pub fn read_exact_at<R>(&self, reader: &mut R, buf: &mut [u8], offset: u64) -> io::Result<()>
    where
        R: ReadAt + ?Sized,
    {
        if self.read_at(reader, buf, offset)? < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past the end of the stream",
            ));
        }
        Ok(())
    }
}

fn clamp_len(available: u64, limit: usize) -> usize {
    usize::try_from(available).map_or(limit, |n| n.min(limit))
}

/// A data attribute opened for reading through the volume reader.
pub struct DataStream<'a, R>
where
    R: ReadAt,
{
    reader: &'a mut R,
    layout: StreamLayout,
    name: String,
}

impl<'a, R> DataStream<'a, R>
where
    R: ReadAt,
{
    pub fn new(reader: &'a mut R, layout: StreamLayout, name: &str) -> Self {
        DataStream {
            reader,
            layout,
            name: name.to_string(),
        }
    }

    /// Stream name, empty for the default stream.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R> ReadAt for DataStream<'_, R>
where
    R: ReadAt,
{
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.layout.read_at(&mut *self.reader, buf, offset)
    }
}

impl<R> RangeDescribe for DataStream<'_, R>
where
    R: ReadAt,
{
    fn ranges(&self) -> &[Extent] {
        self.layout.extents()
    }

    fn size(&self) -> u64 {
        self.layout.size()
    }
}

/// Entries of the record's `$ATTRIBUTE_LIST`, empty when it has none.
pub fn read_attribute_list<R>(
    reader: &mut R,
    volume: &Volume,
    record: &NtfsFile,
) -> RawCopyResult<Vec<NtfsAttributeListEntry>>
where
    R: ReadAt,
{
    let attr = match record.get_attribute(NtfsAttributeType::AttributeList) {
        Some(attr) => attr,
        None => return Ok(Vec::new()),
    };

    let invalid = |details| RawCopyError::InvalidRecord {
        record: record.number,
        details,
    };

    let value = if attr.is_resident() {
        attr.get_resident()
            .ok_or(invalid("attribute list out of bounds"))?
            .to_vec()
    } else {
        let header = attr
            .nonresident_header()
            .ok_or(invalid("truncated attribute list"))?;
        let runs = attr.get_nonresident_data_runs()?;
        let layout =
            StreamLayout::from_runs(volume, &runs, header.data_size, header.initialized_size)?;
        let mut value = vec![0u8; clamp_len(layout.size(), usize::MAX)];
        layout.read_exact_at(reader, &mut value, 0)?;
        value
    };

    parse_attribute_list(record.number, &value)
}

impl<R> VolumeContext<R>
where
    R: Read + Seek,
{
    /// Opens the default data stream, or the named alternate stream.
    pub fn open_stream(
        &mut self,
        record: &NtfsFile,
        name: Option<&str>,
    ) -> RawCopyResult<DataStream<'_, PagedReader<R>>> {
        let name = name.unwrap_or("");
        let layout = self
            .attribute_layout(record, NtfsAttributeType::Data, name)?
            .ok_or_else(|| RawCopyError::StreamNotFound {
                record: record.number,
                stream: name.to_string(),
            })?;

        debug!(
            "Record {} stream {:?}: {} bytes in {} extents",
            record.number,
            name,
            layout.size(),
            layout.extents().len()
        );
        Ok(DataStream::new(&mut self.reader, layout, name))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn volume() -> Volume {
        Volume::for_tests(512, 0)
    }

    fn disk() -> Cursor<Vec<u8>> {
        Cursor::new((0..8192u32).map(|i| (i % 253) as u8 + 1).collect())
    }

    struct CursorAt(Cursor<Vec<u8>>);

    impl ReadAt for CursorAt {
        fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let data = self.0.get_ref();
            let start = (offset as usize).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }
    }

    #[test]
    fn maps_runs_to_contiguous_extents() {
        let runs = [
            DataRun::Data { lcn: 4, clusters: 2 },
            DataRun::Sparse { clusters: 1 },
            DataRun::Data { lcn: 1, clusters: 2 },
        ];
        let layout = StreamLayout::from_runs(&volume(), &runs, 2000, 2000).unwrap();

        assert_eq!(
            layout.extents(),
            &[
                Extent {
                    offset: 0,
                    length: 1024,
                    kind: ExtentKind::Disk { position: 2048 }
                },
                Extent {
                    offset: 1024,
                    length: 512,
                    kind: ExtentKind::Sparse
                },
                Extent {
                    offset: 1536,
                    length: 464,
                    kind: ExtentKind::Disk { position: 512 }
                },
            ]
        );
    }

    #[test]
    fn short_runs_are_rejected() {
        let runs = [DataRun::Data { lcn: 4, clusters: 1 }];
        assert!(matches!(
            StreamLayout::from_runs(&volume(), &runs, 513, 513),
            Err(RawCopyError::InvalidDataRun { .. })
        ));
    }

    #[test]
    fn reads_across_sparse_and_fragmented_extents() {
        let runs = [
            DataRun::Data { lcn: 4, clusters: 2 },
            DataRun::Sparse { clusters: 1 },
            DataRun::Data { lcn: 1, clusters: 2 },
        ];
        let layout = StreamLayout::from_runs(&volume(), &runs, 2000, 2000).unwrap();
        let raw = disk().into_inner();
        let mut reader = CursorAt(disk());

        let mut out = vec![0xEEu8; 2000];
        assert_eq!(layout.read_at(&mut reader, &mut out, 0).unwrap(), 2000);

        assert_eq!(&out[..1024], &raw[2048..3072]);
        assert!(out[1024..1536].iter().all(|b| *b == 0));
        assert_eq!(&out[1536..], &raw[512..976]);

        let mut tail = [0u8; 100];
        assert_eq!(layout.read_at(&mut reader, &mut tail, 1990).unwrap(), 10);
        assert_eq!(layout.read_at(&mut reader, &mut tail, 2000).unwrap(), 0);
    }

    #[test]
    fn bytes_past_initialized_size_read_as_zero() {
        let runs = [DataRun::Data { lcn: 0, clusters: 2 }];
        let layout = StreamLayout::from_runs(&volume(), &runs, 1024, 600).unwrap();
        let raw = disk().into_inner();
        let mut reader = CursorAt(disk());

        let mut out = vec![0xEEu8; 1024];
        layout.read_exact_at(&mut reader, &mut out, 0).unwrap();
        assert_eq!(&out[..600], &raw[..600]);
        assert!(out[600..].iter().all(|b| *b == 0));
    }

    #[test]
    fn resident_layout_serves_record_bytes() {
        let layout = StreamLayout::resident(b"hello world".to_vec());
        let mut reader = CursorAt(disk());
        let mut out = [0u8; 5];
        layout.read_exact_at(&mut reader, &mut out, 6).unwrap();
        assert_eq!(&out, b"world");
        assert_eq!(layout.extents()[0].kind, ExtentKind::Resident);
        assert!(layout.read_exact_at(&mut reader, &mut out, 8).is_err());
    }
}
