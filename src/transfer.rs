//! The transfer gate: the only way bytes leave a verified device.
//!
//! A read transfer verifies the backing page first and copies nothing if that fails.  Write
//! transfers are refused unless the crate is built with `permit-write`.

use std::{io, thread};

use log::{trace, warn};
use thiserror::Error;

use crate::{
    cache::Page,
    device::{VerifiedDevice, VerifyError, WRITE_PERMITTED},
    digest::PageDigest,
    layout::ImageLayout,
    PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("write transfers are not supported")]
    WriteNotSupported,
    #[error("range {offset}+{len} does not fit in a page")]
    RangeOutOfBounds { offset: usize, len: usize },
    #[error("loop device {0} is not attached")]
    NotAttached(u32),
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        let kind = match &err {
            TransferError::WriteNotSupported => io::ErrorKind::Unsupported,
            TransferError::RangeOutOfBounds { .. } => io::ErrorKind::InvalidInput,
            TransferError::NotAttached(..) => io::ErrorKind::NotFound,
            TransferError::Verify(VerifyError::HashMismatch { .. }) => io::ErrorKind::InvalidData,
            TransferError::Verify(VerifyError::IndexOutOfRange { .. }) => {
                io::ErrorKind::InvalidInput
            }
            TransferError::Verify(VerifyError::Io(e)) | TransferError::Io(e) => e.kind(),
        };
        io::Error::new(kind, err)
    }
}

/// Page transfers on an attached device, independent of its digest algorithm.
pub trait TransferGate: Send + Sync {
    fn layout(&self) -> &ImageLayout;

    fn minor(&self) -> u32;

    /// Transfers `buffer.len()` bytes at `offset` within page `index`.
    fn transfer_page(
        &self,
        direction: Direction,
        index: u64,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), TransferError>;
}

impl<H: PageDigest> VerifiedDevice<H> {
    /// Moves bytes between `backing` and `buffer`.
    ///
    /// For a read, `backing` is verified and then `buffer.len()` bytes starting at `offset`
    /// are copied into `buffer`.  For a write (`permit-write` builds only), `buffer` is
    /// written into the store at that position and the page's cached copy and tag are
    /// dropped.
    pub fn transfer(
        &self,
        direction: Direction,
        backing: &Page,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), TransferError> {
        if direction == Direction::Write && !WRITE_PERMITTED {
            return Err(TransferError::WriteNotSupported);
        }

        let len = buffer.len();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= PAGE_SIZE)
            .ok_or(TransferError::RangeOutOfBounds { offset, len })?;
        let range = offset..end;

        match direction {
            Direction::Read => {
                self.verify_page(backing)?;
                buffer.copy_from_slice(&backing.data()[range]);
            }
            Direction::Write => {
                let index = backing.index();
                warn!("minor {}: unverified write to page {index}", self.minor());
                let mut data = backing.data().to_vec();
                data[range].copy_from_slice(buffer);
                self.cache.store().write_page(index, &data)?;
                self.cache.invalidate(index);
                self.tags.clear(index);
            }
        }

        trace!("page {}: {direction:?} {len} bytes at {offset}", backing.index());
        thread::yield_now();
        Ok(())
    }
}

impl<H: PageDigest> TransferGate for VerifiedDevice<H> {
    fn layout(&self) -> &ImageLayout {
        VerifiedDevice::layout(self)
    }

    fn minor(&self) -> u32 {
        VerifiedDevice::minor(self)
    }

    fn transfer_page(
        &self,
        direction: Direction,
        index: u64,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), TransferError> {
        if direction == Direction::Write && !WRITE_PERMITTED {
            return Err(TransferError::WriteNotSupported);
        }
        let limit = self.layout().verifiable_pages();
        if index >= limit {
            return Err(VerifyError::IndexOutOfRange { index, limit }.into());
        }
        let page = self.page(index)?;
        self.transfer(direction, &page, buffer, offset)
    }
}
