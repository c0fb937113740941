//! Capacity-bounded I/O over raw partitions.
//!
//! Writes to UBI volume character devices and some MTD-backed block devices
//! must be multiples of the device's sector size. [`BoundedWriter`] therefore
//! buffers the unaligned tail of every write and emits only sector-aligned
//! chunks to the underlying device; the tail is flushed on [`flush`] as the
//! single possibly-unaligned emission. Both wrappers cap the total number of
//! bytes at the partition capacity and report `ENOSPC` once it is exhausted,
//! so an oversized image can never write past the end of a partition.
//!
//! [`flush`]: std::io::Write::flush

use std::io::{self, Read, Seek, SeekFrom, Write};

use nix::libc;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Writer limited to `capacity` bytes, emitting sector-aligned chunks.
pub struct BoundedWriter<W> {
    inner: W,
    capacity: u64,
    /// Bytes already emitted to `inner`.
    emitted: u64,
    block_size: usize,
    /// Unaligned tail, always shorter than `block_size`.
    buffer: Vec<u8>,
}

impl<W: Write> BoundedWriter<W> {
    /// Create a new writer capped at `capacity` bytes emitting multiples of
    /// `block_size`.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(inner: W, capacity: u64, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            inner,
            capacity,
            emitted: 0,
            block_size,
            buffer: Vec::with_capacity(block_size),
        }
    }

    /// Total number of bytes accepted so far, including the buffered tail.
    pub fn consumed(&self) -> u64 {
        self.emitted + self.buffer.len() as u64
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Discard the buffered tail and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.capacity - self.consumed();
        if available == 0 {
            return Err(errno(libc::ENOSPC));
        }
        let accepted = (buf.len() as u64).min(available) as usize;
        let buf = &buf[..accepted];

        // Complete a partially filled tail first.
        let mut taken = 0;
        if !self.buffer.is_empty() {
            taken = (self.block_size - self.buffer.len()).min(buf.len());
            self.buffer.extend_from_slice(&buf[..taken]);
            if self.buffer.len() == self.block_size {
                self.inner.write_all(&self.buffer)?;
                self.emitted += self.block_size as u64;
                self.buffer.clear();
            }
        }
        let rest = &buf[taken..];
        let aligned = rest.len() - rest.len() % self.block_size;
        if aligned > 0 {
            self.inner.write_all(&rest[..aligned])?;
            self.emitted += aligned as u64;
        }
        self.buffer.extend_from_slice(&rest[aligned..]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.inner.write_all(&self.buffer)?;
            self.emitted += self.buffer.len() as u64;
            self.buffer.clear();
        }
        self.inner.flush()
    }
}

/// Reader limited to `capacity` bytes with bounds-checked seeking.
pub struct BoundedReader<R> {
    inner: R,
    capacity: u64,
    position: u64,
}

impl<R: Read + Seek> BoundedReader<R> {
    pub fn new(inner: R, capacity: u64) -> Self {
        Self {
            inner,
            capacity,
            position: 0,
        }
    }

    /// The underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.capacity - self.position;
        if remaining == 0 {
            return Ok(0);
        }
        let limit = (buf.len() as u64).min(remaining) as usize;
        let read = self.inner.read(&mut buf[..limit])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<R: Seek> Seek for BoundedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.capacity as i128 + delta as i128,
        };
        if target < 0 {
            return Err(errno(libc::EOVERFLOW));
        }
        let target = target as u64;
        if target > self.capacity {
            match pos {
                // Relative seeks beyond the end are clamped and left for
                // subsequent reads to handle.
                SeekFrom::Current(_) => {
                    self.position = self.capacity;
                    self.inner.seek(SeekFrom::Start(self.capacity))?;
                    return Ok(self.capacity);
                }
                _ => return Err(errno(libc::ENXIO)),
            }
        }
        self.position = self.inner.seek(SeekFrom::Start(target))?;
        Ok(self.position)
    }
}
