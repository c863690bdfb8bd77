// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    errors::RawCopyResult,
    paged_reader::ReadAt,
    stream::{ExtentKind, RangeDescribe},
};

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Adapts a positional reader into a one-pass sequential `Read`.
///
/// The cursor only moves forward and is never rewound; build a new adapter
/// to read the source again.
pub struct SequentialReader<'a, S>
where
    S: ReadAt + ?Sized,
{
    inner: &'a mut S,
    offset: u64,
}

impl<'a, S> SequentialReader<'a, S>
where
    S: ReadAt + ?Sized,
{
    pub fn new(inner: &'a mut S, offset: u64) -> Self {
        SequentialReader { inner, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<S> Read for SequentialReader<'_, S>
where
    S: ReadAt + ?Sized,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Streams every logical byte of `stream` into `sink`, in offset order.
///
/// Sparse extents are written as zeros so the output length always equals
/// the stream size.
pub fn copy_stream<S, W>(stream: &mut S, sink: &mut W) -> RawCopyResult<u64>
where
    S: ReadAt + RangeDescribe,
    W: Write,
{
    for (idx, extent) in stream.ranges().iter().enumerate() {
        info!(
            "\tSplit Run {:03} : Range Start From {} - Length: {} , IsSparse {}",
            idx,
            extent.offset,
            extent.length,
            extent.is_sparse()
        );
        if let ExtentKind::Disk { position } = extent.kind {
            debug!("\t\tat volume offset {:#x}", position);
        }
    }

    let size = stream.size();
    let mut reader = SequentialReader::new(stream, 0);
    let written = match io::copy(&mut reader, sink) {
        Ok(written) => written,
        Err(e) => {
            warn!("Copy aborted after reading {} bytes: {}", reader.offset(), e);
            return Err(e.into());
        }
    };
    info!("Written {} Bytes to Destination Done.", written);

    if written != size {
        warn!("Stream declared {} bytes but {} were copied", size, written);
    }
    Ok(written)
}

/// Creates `path` and copies the stream into it.
///
/// The file is flushed and synced before it is closed, also when the copy
/// fails half way.
pub fn copy_to_file<S>(stream: &mut S, path: &Path) -> RawCopyResult<u64>
where
    S: ReadAt + RangeDescribe,
{
    info!("Copying to {}", path.display());
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

    let copied = copy_stream(stream, &mut writer);
    let synced = finish(writer);

    let written = copied?;
    synced?;
    Ok(written)
}

fn finish(writer: BufWriter<File>) -> io::Result<()> {
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::DataRun;
    use crate::stream::{Extent, StreamLayout};
    use crate::volume::Volume;

    struct MemoryStream {
        disk: Vec<u8>,
        layout: StreamLayout,
    }

    impl ReadAt for MemoryStream {
        fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            self.layout.read_at(&mut DiskAt(&self.disk), buf, offset)
        }
    }

    impl RangeDescribe for MemoryStream {
        fn ranges(&self) -> &[Extent] {
            self.layout.extents()
        }

        fn size(&self) -> u64 {
            self.layout.size()
        }
    }

    struct DiskAt<'a>(&'a [u8]);

    impl ReadAt for DiskAt<'_> {
        fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let data = self.0;
            let start = (offset as usize).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }
    }

    fn fragmented() -> MemoryStream {
        let disk: Vec<u8> = (0..16 * 512u32).map(|i| (i / 512) as u8 + 1).collect();
        let runs = [
            DataRun::Data { lcn: 9, clusters: 2 },
            DataRun::Sparse { clusters: 3 },
            DataRun::Data { lcn: 2, clusters: 1 },
        ];
        let layout =
            StreamLayout::from_runs(&Volume::for_tests(512, 0), &runs, 3000, 3000).unwrap();
        MemoryStream { disk, layout }
    }

    #[test]
    fn sequential_reader_walks_forward() {
        let mut stream = fragmented();
        let mut reader = SequentialReader::new(&mut stream, 1000);
        let mut buf = [0xEEu8; 100];
        // Reads continue across the boundary into the sparse extent.
        assert_eq!(reader.read(&mut buf).unwrap(), 100);
        assert!(buf[..24].iter().all(|b| *b == 11));
        assert!(buf[24..].iter().all(|b| *b == 0));
        assert_eq!(reader.offset(), 1100);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 3000 - 1100);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn copies_sparse_and_fragmented_stream() {
        let mut stream = fragmented();
        let mut out = Vec::new();
        assert_eq!(copy_stream(&mut stream, &mut out).unwrap(), 3000);

        assert_eq!(out.len(), 3000);
        assert!(out[..512].iter().all(|b| *b == 10));
        assert!(out[512..1024].iter().all(|b| *b == 11));
        assert!(out[1024..2560].iter().all(|b| *b == 0));
        assert!(out[2560..].iter().all(|b| *b == 3));
    }

    /// Accepts `limit` bytes, then fails every write.
    struct FailingSink {
        accepted: usize,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accepted >= self.limit {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.limit - self.accepted);
            self.accepted += n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_aborts_the_copy() {
        let mut stream = fragmented();
        let mut sink = FailingSink {
            accepted: 0,
            limit: 700,
        };

        match copy_stream(&mut stream, &mut sink) {
            Err(crate::errors::RawCopyError::IOError(e)) => {
                assert_eq!(e.to_string(), "disk full")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sink.accepted, 700);
    }

    #[test]
    fn copy_to_file_persists_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.bin");
        let mut stream = fragmented();

        assert_eq!(copy_to_file(&mut stream, &path).unwrap(), 3000);
        let written = std::fs::read(&path).unwrap();
        let mut expected = Vec::new();
        copy_stream(&mut fragmented(), &mut expected).unwrap();
        assert_eq!(written, expected);
    }

    #[test]
    fn empty_stream_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let mut stream = MemoryStream {
            disk: Vec::new(),
            layout: StreamLayout::resident(Vec::new()),
        };

        assert_eq!(copy_to_file(&mut stream, &path).unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
