//! Page-addressed backing stores.
//!
//! A store is the external collaborator that actually holds an image: a regular file, a block
//! device, or (for tests and tooling) a buffer in memory.  Reads are always whole pages; a
//! partial page at the end of a file reads back zero-extended.

use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    os::fd::OwnedFd,
    path::Path,
    sync::{PoisonError, RwLock},
};

use rustix::fs::{fcntl_getfl, fstat, open, seek, FileType, Mode, OFlags, SeekFrom};

use crate::{
    layout::BackingKind,
    util::{pread_exactish, pwrite_all},
    PAGE_SIZE,
};

pub trait BackingStore: Send + Sync {
    /// Size of the store in bytes.
    fn size(&self) -> Result<u64>;

    fn kind(&self) -> BackingKind;

    /// Whether the store was opened with write access.
    fn is_writable(&self) -> bool;

    /// Reads page `index` into `buf`, which must be `PAGE_SIZE` bytes long.
    fn read_page(&self, index: u64, buf: &mut [u8]) -> Result<()>;

    fn write_page(&self, _index: u64, _data: &[u8]) -> Result<()> {
        Err(ErrorKind::Unsupported.into())
    }

    /// Pages read from block devices keep buffer state in their metadata slot, so they can't
    /// be tagged as verified.
    fn metadata_in_use(&self) -> bool {
        self.kind() == BackingKind::BlockDevice
    }

    /// Number of pages, counting a trailing partial page.
    fn page_count(&self) -> Result<u64> {
        Ok(self.size()?.div_ceil(PAGE_SIZE as u64))
    }
}

fn page_offset(index: u64, size: u64) -> Result<u64> {
    match index.checked_mul(PAGE_SIZE as u64) {
        Some(offset) if offset < size => Ok(offset),
        _ => Err(Error::new(
            ErrorKind::UnexpectedEof,
            format!("page {index} is past the end of the store"),
        )),
    }
}

fn check_page_buffer(buf: &[u8]) -> Result<()> {
    if buf.len() != PAGE_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("page buffer is {} bytes, expected {PAGE_SIZE}", buf.len()),
        ));
    }
    Ok(())
}

/// A store backed by a regular file or a block device.
#[derive(Debug)]
pub struct FileStore {
    fd: OwnedFd,
    kind: BackingKind,
    writable: bool,
    size: u64,
}

impl FileStore {
    /// Opens `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let fd = open(path.as_ref(), OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
        Self::from_fd(fd)
    }

    /// Opens `path` for reading and writing.  Verified devices refuse such stores unless
    /// built with `permit-write`.
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self> {
        let fd = open(path.as_ref(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        Self::from_fd(fd)
    }

    /// Wraps an already-open file descriptor.  The kind is taken from the file type and the
    /// write access from the descriptor's access mode.
    pub fn from_fd(fd: impl Into<OwnedFd>) -> Result<Self> {
        let fd = fd.into();
        let stat = fstat(&fd)?;
        let (kind, size) = match FileType::from_raw_mode(stat.st_mode) {
            FileType::RegularFile => (BackingKind::File, stat.st_size as u64),
            // block devices report no st_size
            FileType::BlockDevice => (BackingKind::BlockDevice, seek(&fd, SeekFrom::End(0))?),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("can't back an image with a {other:?}"),
                ))
            }
        };
        let writable = fcntl_getfl(&fd)?.intersects(OFlags::WRONLY | OFlags::RDWR);

        Ok(Self {
            fd,
            kind,
            writable,
            size,
        })
    }

    /// Overrides the kind taken from the file type, to treat a dump of a block-device image
    /// as the device it came from.
    pub fn with_kind(mut self, kind: BackingKind) -> Self {
        self.kind = kind;
        self
    }
}

impl BackingStore for FileStore {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn kind(&self) -> BackingKind {
        self.kind
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_page(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_page_buffer(buf)?;
        let offset = page_offset(index, self.size)?;
        buf.fill(0);
        pread_exactish(&self.fd, buf, offset)?;
        Ok(())
    }

    fn write_page(&self, index: u64, data: &[u8]) -> Result<()> {
        check_page_buffer(data)?;
        if !self.writable {
            return Err(Error::new(ErrorKind::PermissionDenied, "store is read-only"));
        }
        let offset = page_offset(index, self.size)?;
        pwrite_all(&self.fd, data, offset)
    }
}

/// A store held entirely in memory.
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
    kind: BackingKind,
    writable: bool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &self.kind)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(data: Vec<u8>, kind: BackingKind) -> Self {
        Self {
            data: RwLock::new(data),
            kind,
            writable: false,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Flips the bits of `mask` in the byte at `offset`.
    pub fn corrupt(&self, offset: usize, mask: u8) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[offset] ^= mask;
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BackingStore for MemoryStore {
    fn size(&self) -> Result<u64> {
        Ok(self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    fn kind(&self) -> BackingKind {
        self.kind
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_page(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_page_buffer(buf)?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let start = page_offset(index, data.len() as u64)? as usize;
        let end = data.len().min(start + PAGE_SIZE);
        buf.fill(0);
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_page(&self, index: u64, page: &[u8]) -> Result<()> {
        check_page_buffer(page)?;
        if !self.writable {
            return Err(Error::new(ErrorKind::PermissionDenied, "store is read-only"));
        }
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let start = page_offset(index, data.len() as u64)? as usize;
        let end = data.len().min(start + PAGE_SIZE);
        data[start..end].copy_from_slice(&page[..end - start]);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    fn sample() -> Vec<u8> {
        let mut data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8 + 1).collect();
        data.extend_from_slice(b"tail");
        data
    }

    #[test]
    fn memory_store_pages() {
        let store = MemoryStore::new(sample(), BackingKind::File);
        assert_eq!(store.size().unwrap(), 2 * PAGE_SIZE as u64 + 4);
        assert_eq!(store.page_count().unwrap(), 3);
        assert!(!store.metadata_in_use());

        let mut buf = [0xffu8; PAGE_SIZE];
        store.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));

        store.read_page(2, &mut buf).unwrap();
        assert_eq!(buf[..4].to_vec(), b"tail".to_vec());
        assert!(buf[4..].iter().all(|&b| b == 0));

        assert_eq!(
            store.read_page(3, &mut buf).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
        assert_eq!(
            store.read_page(0, &mut buf[..10]).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn memory_store_write() {
        let store = MemoryStore::new(sample(), BackingKind::File);
        let page = [7u8; PAGE_SIZE];
        assert_eq!(
            store.write_page(0, &page).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        let store = store.writable(true);
        store.write_page(0, &page).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        store.read_page(0, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), page.to_vec());
    }

    #[test]
    fn file_store() {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        tf.write_all(&sample()).unwrap();
        tf.flush().unwrap();

        let store = FileStore::open(tf.path()).unwrap();
        assert_eq!(store.kind(), BackingKind::File);
        assert!(!store.is_writable());
        assert_eq!(store.page_count().unwrap(), 3);

        let mut buf = [0xffu8; PAGE_SIZE];
        store.read_page(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        store.read_page(2, &mut buf).unwrap();
        assert_eq!(buf[..4].to_vec(), b"tail".to_vec());
        assert!(buf[4..].iter().all(|&b| b == 0));

        assert_eq!(
            store.write_page(0, &buf).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        let rw = FileStore::open_writable(tf.path()).unwrap();
        assert!(rw.is_writable());

        let dump = FileStore::open(tf.path())
            .unwrap()
            .with_kind(BackingKind::BlockDevice);
        assert!(dump.metadata_in_use());
    }

    #[test]
    fn file_store_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            FileStore::open(dir.path()).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
