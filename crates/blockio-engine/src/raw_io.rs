//! Raw file access for the engine's three devices
//!
//! The engine owns exactly three file handles: data, metadata and journal.
//! They are opened once at startup, optionally with direct I/O (O_DIRECT
//! on Linux, F_NOCACHE on macOS), and closed at shutdown. All positioned
//! reads and writes go through [`DirectFile`].

use blockio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const DIRECT_ALIGNMENT: usize = 4096;

/// File handle with optional direct I/O
pub struct DirectFile {
    file: File,
    path: String,
    size: u64,
    direct: bool,
    read_only: bool,
}

impl DirectFile {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, direct: bool, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Configuration(format!("failed to open {}: {}", path_str, e)))?;

        #[cfg(target_os = "macos")]
        if direct {
            Self::set_nocache(&file, &path_str)?;
        }

        let size = Self::probe_size(&file, &path_str)?;

        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
            read_only,
        })
    }

    /// Create (or truncate) a regular file of the given size
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Configuration(format!("failed to create {}: {}", path_str, e)))?;
        file.set_len(size)
            .map_err(|e| Error::Configuration(format!("failed to size {}: {}", path_str, e)))?;

        #[cfg(target_os = "macos")]
        if direct {
            Self::set_nocache(&file, &path_str)?;
        }

        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
            read_only: false,
        })
    }

    #[cfg(target_os = "macos")]
    fn set_nocache(file: &File, path: &str) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if rc == -1 {
            return Err(Error::Configuration(format!(
                "failed to set F_NOCACHE on {}: {}",
                path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Determine the usable size: block device capacity or file length
    fn probe_size(file: &File, path: &str) -> Result<u64> {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::FileTypeExt;
            use std::os::unix::io::AsRawFd;
            let meta = file
                .metadata()
                .map_err(|e| Error::Configuration(format!("failed to stat {}: {}", path, e)))?;
            if meta.file_type().is_block_device() {
                const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
                let mut size: u64 = 0;
                let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
                if rc == -1 {
                    return Err(Error::Configuration(format!(
                        "failed to get device size for {}: {}",
                        path,
                        std::io::Error::last_os_error()
                    )));
                }
                return Ok(size);
            }
            Ok(meta.len())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let meta = file
                .metadata()
                .map_err(|e| Error::Configuration(format!("failed to stat {}: {}", path, e)))?;
            Ok(meta.len())
        }
    }

    /// Usable size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path this file was opened from
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.check_alignment(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Flush data and metadata to stable storage
    pub fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if self.direct
            && (offset as usize % DIRECT_ALIGNMENT != 0 || len % DIRECT_ALIGNMENT != 0)
        {
            return Err(Error::invalid_argument(format!(
                "unaligned direct I/O on {}: offset={} len={}",
                self.path, offset, len
            )));
        }
        Ok(())
    }
}

/// Heap buffer aligned for direct I/O
///
/// With O_DIRECT the kernel requires the user buffer itself to be aligned
/// to the logical block size. Regular `Vec` allocations do not guarantee
/// that, so sector staging buffers use this type.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
}

impl AlignedBuf {
    /// Allocate a zero-filled buffer of `size` bytes, rounded up to the
    /// direct I/O alignment
    #[must_use]
    pub fn new(size: usize) -> Self {
        use std::alloc::{alloc_zeroed, Layout};
        let len = size.div_ceil(DIRECT_ALIGNMENT) * DIRECT_ALIGNMENT;
        let layout = Layout::from_size_align(len, DIRECT_ALIGNMENT)
            .expect("invalid aligned buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned buffer allocation failed");
        Self { ptr, len }
    }

    /// View as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// View as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Buffer length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the whole buffer
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        use std::alloc::{dealloc, Layout};
        let layout = Layout::from_size_align(self.len, DIRECT_ALIGNMENT)
            .expect("invalid aligned buffer layout");
        unsafe { dealloc(self.ptr, layout) };
    }
}

impl AsRef<[u8]> for AlignedBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buf() {
        let mut buf = AlignedBuf::new(100);
        assert_eq!(buf.len(), DIRECT_ALIGNMENT);
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_ALIGNMENT, 0);
        buf.as_mut_slice()[0] = 0xAB;
        buf.zero();
        assert_eq!(buf.as_slice()[0], 0);
    }

    #[test]
    fn test_create_write_read() {
        let temp = NamedTempFile::new().unwrap();
        {
            let file = DirectFile::create(temp.path(), 8192, false).unwrap();
            file.write_at(4096, b"journal ring").unwrap();
            file.fsync().unwrap();
        }
        {
            let file = DirectFile::open(temp.path(), false, true).unwrap();
            assert_eq!(file.size(), 8192);
            let mut buf = [0u8; 12];
            file.read_at(4096, &mut buf).unwrap();
            assert_eq!(&buf, b"journal ring");
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp = NamedTempFile::new().unwrap();
        DirectFile::create(temp.path(), 4096, false).unwrap();
        let file = DirectFile::open(temp.path(), false, true).unwrap();
        assert!(matches!(
            file.write_at(0, &[0u8; 16]),
            Err(blockio_common::Error::ReadOnly)
        ));
    }
}
