// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};

use tracing::trace;

pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;
pub const DEFAULT_CACHE_PAGES: usize = 16;

/// Positional reads that do not depend on a shared cursor.
pub trait ReadAt {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns 0 at the end.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&mut self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Reads the underlying device one whole page at a time and keeps the most
/// recently used pages around.
///
/// The device is assumed immutable while the reader is alive, so a cached
/// page is never revalidated. Evicted pages are simply read again.
pub struct PagedReader<R>
where
    R: Read + Seek,
{
    inner: R,
    page_size: u64,
    cache_pages: usize,
    position: u64,

    pages: HashMap<u64, Vec<u8>>,
    recent: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

impl<R> PagedReader<R>
where
    R: Read + Seek,
{
    pub fn new(inner: R, page_size: u64, cache_pages: usize) -> io::Result<Self> {
        if !page_size.is_power_of_two() || page_size < 512 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page size {page_size} is not a power of two >= 512"),
            ));
        }

        let cache_pages = cache_pages.max(1);
        Ok(Self {
            inner,
            page_size,
            cache_pages,
            position: 0,
            pages: HashMap::with_capacity(cache_pages),
            recent: VecDeque::with_capacity(cache_pages),
            hits: 0,
            misses: 0,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns `(hits, misses)` of the page cache so far.
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn round_down(&self, n: u64) -> u64 {
        n / self.page_size * self.page_size
    }

    fn touch(&mut self, page: u64) {
        if let Some(idx) = self.recent.iter().position(|p| *p == page) {
            self.recent.remove(idx);
        }
        self.recent.push_back(page);
    }

    fn load_page(&mut self, page: u64) -> io::Result<&[u8]> {
        if self.pages.contains_key(&page) {
            self.hits += 1;
            self.touch(page);
        } else {
            self.misses += 1;
            trace!("Paging in {:#x}", page);

            let mut data = vec![0u8; self.page_size as usize];
            self.inner.seek(SeekFrom::Start(page))?;
            let mut filled = 0usize;
            while filled < data.len() {
                match self.inner.read(&mut data[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            // Short page at the end of the device.
            data.truncate(filled);

            while self.recent.len() >= self.cache_pages {
                match self.recent.pop_front() {
                    Some(old) => {
                        self.pages.remove(&old);
                    }
                    None => break,
                }
            }
            self.pages.insert(page, data);
            self.recent.push_back(page);
        }

        self.pages
            .get(&page)
            .map(Vec::as_slice)
            .ok_or_else(|| io::Error::other("page missing from cache"))
    }
}

impl<R> ReadAt for PagedReader<R>
where
    R: Read + Seek,
{
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let page_size = self.page_size as usize;
        let mut copied = 0usize;

        while copied < buf.len() {
            let position = offset.checked_add(copied as u64).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read offset overflow")
            })?;
            let page = self.round_down(position);
            let start = (position - page) as usize;

            let data = self.load_page(page)?;
            if start >= data.len() {
                break;
            }

            let count = usize::min(data.len() - start, buf.len() - copied);
            buf[copied..copied + count].copy_from_slice(&data[start..start + count]);
            copied += count;

            if data.len() < page_size && start + count == data.len() {
                break;
            }
        }

        Ok(copied)
    }
}

impl<R> Read for PagedReader<R>
where
    R: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R> Seek for PagedReader<R>
where
    R: Read + Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let raw_position = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(_) => {
                return Err(io::Error::other("unsupported"));
            }
            SeekFrom::Current(n) => {
                if n >= 0 {
                    self.position.checked_add(n as u64)
                } else {
                    self.position.checked_sub(n.wrapping_neg() as u64)
                }
            }
        };

        match raw_position {
            Some(n) => {
                self.position = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;

    use super::*;

    /// Counts how many times the device is actually read.
    struct CountingDevice {
        inner: Cursor<Vec<u8>>,
        reads: Rc<Cell<usize>>,
    }

    impl Read for CountingDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read(buf)
        }
    }

    impl Seek for CountingDevice {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn device(len: usize) -> (Vec<u8>, CountingDevice, Rc<Cell<usize>>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let reads = Rc::new(Cell::new(0));
        let dev = CountingDevice {
            inner: Cursor::new(bytes.clone()),
            reads: reads.clone(),
        };
        (bytes, dev, reads)
    }

    #[test]
    fn unaligned_read_across_page_boundary() {
        let (bytes, dev, _) = device(3 * 4096);
        let mut reader = PagedReader::new(dev, 4096, DEFAULT_CACHE_PAGES).unwrap();

        let mut buf = [0u8; 20];
        assert_eq!(reader.read_at(&mut buf, 4090).unwrap(), 20);

        let mut first = vec![0u8; 4096];
        let mut second = vec![0u8; 4096];
        reader.read_exact_at(&mut first, 0).unwrap();
        reader.read_exact_at(&mut second, 4096).unwrap();
        let mut joined = first;
        joined.extend_from_slice(&second);

        assert_eq!(&buf[..], &joined[4090..4110]);
        assert_eq!(&buf[..], &bytes[4090..4110]);
    }

    #[test]
    fn cached_pages_are_not_read_twice() {
        let (_, dev, reads) = device(4 * 4096);
        let mut reader = PagedReader::new(dev, 4096, 4).unwrap();

        let mut buf = [0u8; 100];
        reader.read_exact_at(&mut buf, 10).unwrap();
        let after_first = reads.get();
        reader.read_exact_at(&mut buf, 200).unwrap();
        reader.read_exact_at(&mut buf, 3000).unwrap();

        assert_eq!(reads.get(), after_first);
        assert_eq!(reader.cache_stats(), (2, 1));
    }

    #[test]
    fn evicted_page_is_read_again() {
        let (bytes, dev, _) = device(4 * 4096);
        let mut reader = PagedReader::new(dev, 4096, 2).unwrap();

        let mut buf = [0u8; 8];
        reader.read_exact_at(&mut buf, 0).unwrap();
        reader.read_exact_at(&mut buf, 4096).unwrap();
        reader.read_exact_at(&mut buf, 8192).unwrap();
        // Page 0 was the least recently used one.
        reader.read_exact_at(&mut buf, 16).unwrap();

        assert_eq!(&buf, &bytes[16..24]);
        assert_eq!(reader.cache_stats(), (0, 4));
    }

    #[test]
    fn short_read_at_end_of_device() {
        let (bytes, dev, _) = device(4096 + 100);
        let mut reader = PagedReader::new(dev, 4096, 4).unwrap();

        let mut buf = vec![0u8; 500];
        assert_eq!(reader.read_at(&mut buf, 4000).unwrap(), 196);
        assert_eq!(&buf[..196], &bytes[4000..]);
        assert_eq!(reader.read_at(&mut buf, 5000).unwrap(), 0);
        assert_eq!(reader.read_at(&mut buf, 9000).unwrap(), 0);
    }

    #[test]
    fn read_and_seek_follow_position() {
        let (bytes, dev, _) = device(2 * 4096);
        let mut reader = PagedReader::new(dev, 4096, 4).unwrap();

        reader.seek(SeekFrom::Start(4094)).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &bytes[4094..4098]);
        assert_eq!(reader.seek(SeekFrom::Current(-8)).unwrap(), 4090);
        assert!(reader.seek(SeekFrom::End(0)).is_err());
    }

    #[test]
    fn rejects_bad_page_size() {
        let (_, dev, _) = device(16);
        assert!(PagedReader::new(dev, 3000, 4).is_err());
    }
}
