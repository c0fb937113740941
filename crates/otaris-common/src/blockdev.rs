//! Raw partition access for installs.
//!
//! [`PartitionDevice`] wraps a rootfs partition (a block device or a UBI
//! volume character device) and opens it lazily on first use. Writes go
//! through a [`BoundedWriter`] so they are sector-aligned and capped at the
//! partition capacity; reads go through a [`BoundedReader`]. UBI volumes
//! require the `UBI_IOCVOLUP` ioctl declaring the image size before the
//! first byte is written, after which the kernel expects exactly that many
//! bytes until the descriptor is closed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use byte_calc::NumBytes;
use nix::libc::{self, c_int, c_ulonglong};
use tracing::{debug, info};

use crate::bounded::{BoundedReader, BoundedWriter};

nix::ioctl_read! {
    /// Get the size of a block device in bytes (`BLKGETSIZE64`).
    ioctl_blkgetsize64, 0x12, 114, c_ulonglong
}

nix::ioctl_read_bad! {
    /// Get the logical sector size of a block device (`BLKSSZGET`).
    ioctl_blksszget, 0x1268, c_int
}

nix::ioctl_write_ptr! {
    /// Declare a UBI volume update of the given size (`UBI_IOCVOLUP`).
    ioctl_ubi_volup, 0x4F, 0, i64
}

/// Fallback sector size when the device does not report one.
const DEFAULT_SECTOR_SIZE: usize = 512;

/// Check whether a partition path names a UBI volume.
///
/// UBI volumes are conventionally named `ubiX_Y` and the kernel `root=`
/// argument refers to them without a `/dev/` prefix.
pub fn is_ubi_volume(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("ubi"))
        .unwrap_or(false)
}

/// Normalize a partition path for opening.
///
/// Bare UBI volume names (the `root=ubi0_0` kernel convention) are given a
/// `/dev/` prefix; everything else is passed through unchanged.
pub fn normalize_partition_path(path: &Path) -> PathBuf {
    if is_ubi_volume(path) && path.parent() == Some(Path::new("")) {
        Path::new("/dev").join(path)
    } else {
        path.to_path_buf()
    }
}

fn read_sysfs_u64(path: &Path) -> io::Result<u64> {
    std::fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid sysfs attribute"))
}

/// Query capacity and write unit of a UBI volume via Sysfs.
///
/// The capacity of a volume update is the number of reserved erase blocks
/// times the usable erase block size; writes must be multiples of the
/// usable erase block size.
fn query_ubi_geometry(path: &Path) -> io::Result<(u64, usize)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid UBI volume path"))?;
    let sysfs = Path::new("/sys/class/ubi").join(name);
    let reserved_ebs = read_sysfs_u64(&sysfs.join("reserved_ebs"))?;
    let eb_size = read_sysfs_u64(&sysfs.join("usable_eb_size"))?;
    Ok((reserved_ebs * eb_size, eb_size as usize))
}

/// Query the byte capacity of an open device.
///
/// Falls back to the file length for regular files, which keeps the device
/// wrapper testable against plain files.
fn query_size(file: &File) -> io::Result<u64> {
    let mut size: c_ulonglong = 0;
    // SAFETY: The file descriptor is valid for the duration of the call and
    // the ioctl writes a single integer.
    match unsafe { ioctl_blkgetsize64(file.as_raw_fd(), &mut size) } {
        Ok(_) => Ok(size),
        Err(_) => Ok(file.metadata()?.len()),
    }
}

/// Query the logical sector size of an open device.
fn query_sector_size(file: &File) -> usize {
    let mut size: c_int = 0;
    // SAFETY: See `query_size`.
    match unsafe { ioctl_blksszget(file.as_raw_fd(), &mut size) } {
        Ok(_) if size > 0 => size as usize,
        _ => DEFAULT_SECTOR_SIZE,
    }
}

enum State {
    Closed,
    Writing(BoundedWriter<File>),
    Reading(BoundedReader<File>),
}

/// A rootfs partition opened on demand for a single install or size query.
///
/// Once opened for reading, writes fail until the device is closed again,
/// and vice versa. [`PartitionDevice::close`] flushes, syncs, and releases
/// the descriptor; dropping the device without closing it discards any
/// buffered tail, leaving the partition contents untouched beyond what was
/// already emitted.
pub struct PartitionDevice {
    path: PathBuf,
    is_ubi: bool,
    image_size: u64,
    state: State,
}

impl PartitionDevice {
    /// Create a device wrapper for the partition at `path` receiving an
    /// image of `image_size` bytes.
    pub fn new(path: &Path, image_size: u64) -> Self {
        let is_ubi = is_ubi_volume(path);
        Self {
            path: normalize_partition_path(path),
            is_ubi,
            image_size,
            state: State::Closed,
        }
    }

    /// Path of the underlying device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the partition is a UBI volume.
    pub fn is_ubi(&self) -> bool {
        self.is_ubi
    }

    /// Query the capacity of the partition in bytes.
    ///
    /// Opens a transient read-only descriptor and can be used independently
    /// of the write or read state.
    pub fn size(&self) -> io::Result<u64> {
        if self.is_ubi {
            return query_ubi_geometry(&self.path).map(|(capacity, _)| capacity);
        }
        let file = File::open(&self.path)?;
        query_size(&file)
    }

    /// Query the logical sector size of the partition.
    pub fn sector_size(&self) -> io::Result<usize> {
        if self.is_ubi {
            return query_ubi_geometry(&self.path).map(|(_, eb_size)| eb_size);
        }
        let file = File::open(&self.path)?;
        Ok(query_sector_size(&file))
    }

    fn open_for_write(&mut self) -> io::Result<()> {
        info!("opening device {:?} for writing", self.path);
        let file = OpenOptions::new().write(true).open(&self.path)?;
        let (capacity, sector_size) = if self.is_ubi {
            // The volume update must be declared before any bytes are
            // written; afterwards the kernel expects exactly `image_size`
            // bytes until close.
            let size = i64::try_from(self.image_size)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "image size overflow"))?;
            // SAFETY: The descriptor refers to a UBI volume character
            // device and the pointee outlives the call.
            unsafe { ioctl_ubi_volup(file.as_raw_fd(), &size) }?;
            query_ubi_geometry(&self.path)?
        } else {
            (query_size(&file)?, query_sector_size(&file))
        };
        info!(
            "partition {:?} size: {}, sector size: {}",
            self.path,
            NumBytes::new(capacity),
            sector_size
        );
        self.state = State::Writing(BoundedWriter::new(file, capacity, sector_size));
        Ok(())
    }

    fn open_for_read(&mut self) -> io::Result<()> {
        info!("opening device {:?} for reading", self.path);
        let file = File::open(&self.path)?;
        let capacity = if self.is_ubi {
            query_ubi_geometry(&self.path)?.0
        } else {
            query_size(&file)?
        };
        debug!("partition {:?} size: {}", self.path, NumBytes::new(capacity));
        self.state = State::Reading(BoundedReader::new(file, capacity));
        Ok(())
    }

    /// Flush buffered data, sync, and release the descriptor.
    ///
    /// Closing is idempotent; a closed device can be reopened in either
    /// mode by the next read or write.
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Writing(mut writer) => {
                writer.flush()?;
                writer.get_ref().sync_all()?;
                Ok(())
            }
            State::Reading(_) | State::Closed => Ok(()),
        }
    }
}

impl Write for PartitionDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let State::Reading(_) = self.state {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let State::Closed = self.state {
            self.open_for_write()?;
        }
        match &mut self.state {
            State::Writing(writer) => writer.write(buf),
            _ => unreachable!(),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            State::Writing(writer) => writer.flush(),
            _ => Ok(()),
        }
    }
}

impl Read for PartitionDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let State::Writing(_) = self.state {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let State::Closed = self.state {
            self.open_for_read()?;
        }
        match &mut self.state {
            State::Reading(reader) => reader.read(buf),
            _ => unreachable!(),
        }
    }
}

impl Seek for PartitionDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if let State::Writing(_) = self.state {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let State::Closed = self.state {
            self.open_for_read()?;
        }
        match &mut self.state {
            State::Reading(reader) => reader.seek(pos),
            _ => unreachable!(),
        }
    }
}
