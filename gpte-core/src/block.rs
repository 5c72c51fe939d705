//! Logical-block-addressed I/O over an opened device.
//!
//! The engine talks to devices only through [`BlockDevice`], so tests can
//! substitute a temp-file-backed handle for a real block device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{GptError, Result};

/// A handle to an opened device, addressed in logical blocks of
/// `block_size()` bytes.
pub trait BlockDevice {
    fn block_size(&self) -> u32;

    fn read_block(&mut self, lba: u64) -> Result<Vec<u8>> {
        self.seek_and_read(lba * self.block_size() as u64, self.block_size() as usize)
    }

    fn write_block(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        self.seek_and_write(lba * self.block_size() as u64, data)
    }

    fn seek_and_read(&mut self, byte_offset: u64, len: usize) -> Result<Vec<u8>>;
    fn seek_and_write(&mut self, byte_offset: u64, data: &[u8]) -> Result<()>;

    /// Total logical-block count, or 0 if unknown (e.g. a regular file).
    fn block_count(&self) -> u64;

    /// Flush any buffered writes to stable storage. A no-op for backends
    /// that don't buffer.
    fn sync(&mut self) -> Result<()>;
}

/// A [`BlockDevice`] backed by an opened `File` -- either a real block
/// device or, in tests, a regular file standing in for one.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    lbsize: u32,
    dlen: u64,
}

pub const DEFAULT_LBSIZE: u32 = 512;

impl FileBlockDevice {
    /// Open `path` read-write and determine its logical block size and
    /// total block count. Regular files report a block count of 0, per the
    /// block I/O contract; this lets the opener relax geometry checks that
    /// only make sense for real devices.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let lbsize = DEFAULT_LBSIZE;
        let dlen = block_count_of(&file)?;
        Ok(FileBlockDevice {
            file,
            lbsize,
            dlen,
        })
    }

    /// Wrap an already-opened file, for callers (tests) that created or
    /// sized the backing file themselves.
    pub fn from_file(file: File, lbsize: u32) -> Result<Self> {
        let dlen = block_count_of(&file)?;
        Ok(FileBlockDevice { file, lbsize, dlen })
    }

    /// Wrap an already-opened file with an explicit block count, bypassing
    /// the block-device probe. A regular file always reports 0 through
    /// [`FileBlockDevice::from_file`]; this lets tests exercise the
    /// known-`block_count` paths of the opener without an actual block
    /// device.
    pub fn from_file_with_block_count(file: File, lbsize: u32, dlen: u64) -> Self {
        FileBlockDevice { file, lbsize, dlen }
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u32 {
        self.lbsize
    }

    fn seek_and_read(&mut self, byte_offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(byte_offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(|e| {
            GptError::Io(std::io::Error::new(
                e.kind(),
                format!("short read at offset {byte_offset}: {e}"),
            ))
        })?;
        Ok(buf)
    }

    fn seek_and_write(&mut self, byte_offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(byte_offset))?;
        self.file.write_all(data).map_err(|e| {
            GptError::Io(std::io::Error::new(
                e.kind(),
                format!("short write at offset {byte_offset}: {e}"),
            ))
        })
    }

    fn block_count(&self) -> u64 {
        self.dlen
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn block_count_of(file: &File) -> Result<u64> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::io::AsRawFd;

    let meta = file.metadata()?;
    if !meta.file_type().is_block_device() {
        // Regular files (including test fixtures) report 0, per the block
        // I/O contract -- the opener relaxes geometry checks accordingly.
        return Ok(0);
    }
    match unsafe { linux_ioctl::blkgetsize64(file.as_raw_fd()) } {
        Ok(bytes) => Ok(bytes / DEFAULT_LBSIZE as u64),
        Err(e) => {
            log::warn!("BLKGETSIZE64 ioctl failed: {e}; treating device as zero-length");
            Ok(0)
        }
    }
}

#[cfg(target_os = "linux")]
mod linux_ioctl {
    use nix::{ioctl_read, Result};
    use std::os::unix::io::RawFd;

    ioctl_read!(blkgetsize64_raw, 0x12, 114, u64);

    pub unsafe fn blkgetsize64(fd: RawFd) -> Result<u64> {
        let mut size: u64 = 0;
        blkgetsize64_raw(fd, &mut size as *mut u64)?;
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
fn block_count_of(file: &File) -> Result<u64> {
    // Non-Linux targets have no portable block-count ioctl wired up here;
    // only regular files (block count 0) are supported.
    let _ = file.metadata()?;
    Ok(0)
}
