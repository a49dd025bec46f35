//! Image layout: where the data, hash, count and signature pages live.
//!
//! ```text
//! +--------------+---------------+---------------+----------+-----------+
//! | data pages   | level-0 pages | level-1 pages | count    | signature |
//! |              |               |               | (blkdev) | page      |
//! +--------------+---------------+---------------+----------+-----------+
//! ```
//!
//! The data page count is a big-endian u32 stored in the last four bytes of the count page.
//! For a file-backed image the count page is simply the last level-1 page; a block device has
//! no file size to delimit the image, so it gets a dedicated page of its own.  Either way the
//! count page is the second-to-last page of the store and the signature page is the last.

use thiserror::Error;
use zerocopy::{big_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{digest::PageDigest, PAGE_SIZE};

/// What kind of object backs an image.  This only changes where the count field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    File,
    BlockDevice,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("image has no data pages")]
    ZeroDataPages,
    #[error("store of {pages} pages is too small to hold an image")]
    TooSmall { pages: u64 },
    #[error("layout needs {expected} pages but the store has {found}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("count field overlaps the digests of the last level-1 page")]
    CountOverlapsDigests,
    #[error("digest size {0} does not fit in a page")]
    InvalidDigestSize(usize),
    #[error("level-1 table does not fit in memory")]
    Overflow,
    #[error("count page {page} is unreadable: {reason}")]
    Unreadable { page: u64, reason: String },
}

/// The trailing data page count.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CountTrailer {
    pub data_pages: U32,
}

pub const COUNT_SIZE: usize = size_of::<CountTrailer>();

impl CountTrailer {
    pub fn read(page: &[u8]) -> Option<u32> {
        let (_, trailer) = CountTrailer::read_from_suffix(page).ok()?;
        Some(trailer.data_pages.get())
    }

    pub fn write(page: &mut [u8], data_pages: u32) {
        let at = page.len() - COUNT_SIZE;
        let trailer = CountTrailer {
            data_pages: U32::new(data_pages),
        };
        page[at..].copy_from_slice(trailer.as_bytes());
    }
}

/// Where a page index falls within the verifiable part of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// A data page, by its index into the data region.
    Data(u64),
    /// A level-0 hash page, by its index into the level-0 region.
    Level0(u64),
    /// Level-1, count or signature pages, or past the end of the image.
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub digest_size: usize,
    pub digests_per_page: usize,
    pub data_page_count: u64,
    pub level0_page_count: u64,
    pub level1_page_count: u64,
    pub kind: BackingKind,
}

impl ImageLayout {
    pub fn new(
        digest_size: usize,
        data_page_count: u64,
        kind: BackingKind,
    ) -> Result<Self, LayoutError> {
        if digest_size == 0 || digest_size > PAGE_SIZE {
            return Err(LayoutError::InvalidDigestSize(digest_size));
        }
        if data_page_count == 0 {
            return Err(LayoutError::ZeroDataPages);
        }

        let digests_per_page = PAGE_SIZE / digest_size;
        let per_page = digests_per_page as u64;
        let level0_page_count = data_page_count.div_ceil(per_page);
        let level1_page_count = level0_page_count.div_ceil(per_page);

        let layout = ImageLayout {
            digest_size,
            digests_per_page,
            data_page_count,
            level0_page_count,
            level1_page_count,
            kind,
        };
        layout.level1_table_len()?;
        Ok(layout)
    }

    pub fn for_digest<H: PageDigest>(
        data_page_count: u64,
        kind: BackingKind,
    ) -> Result<Self, LayoutError> {
        Self::new(H::SIZE, data_page_count, kind)
    }

    /// The page holding the count field, for a store of `total_pages` pages.
    pub fn count_page_in(total_pages: u64) -> Result<u64, LayoutError> {
        // at minimum: one data page, one level-0 page, one level-1 page, the signature
        if total_pages < 4 {
            return Err(LayoutError::TooSmall { pages: total_pages });
        }
        Ok(total_pages - 2)
    }

    pub fn level0_start(&self) -> u64 {
        self.data_page_count
    }

    pub fn level1_start(&self) -> u64 {
        self.data_page_count + self.level0_page_count
    }

    pub fn level1_end(&self) -> u64 {
        self.level1_start() + self.level1_page_count
    }

    pub fn count_page(&self) -> u64 {
        match self.kind {
            BackingKind::File => self.level1_end() - 1,
            BackingKind::BlockDevice => self.level1_end(),
        }
    }

    pub fn signature_page(&self) -> u64 {
        self.count_page() + 1
    }

    pub fn total_pages(&self) -> u64 {
        self.signature_page() + 1
    }

    /// One past the last page index the verifier accepts.
    pub fn verifiable_pages(&self) -> u64 {
        self.level1_start()
    }

    pub fn data_len(&self) -> u64 {
        self.data_page_count * PAGE_SIZE as u64
    }

    pub fn level1_table_len(&self) -> Result<usize, LayoutError> {
        usize::try_from(self.level1_page_count)
            .ok()
            .and_then(|pages| pages.checked_mul(PAGE_SIZE))
            .ok_or(LayoutError::Overflow)
    }

    /// Checks that the layout agrees with the store it was read from.
    pub fn check_total(&self, total_pages: u64) -> Result<(), LayoutError> {
        if self.total_pages() != total_pages {
            return Err(LayoutError::SizeMismatch {
                expected: self.total_pages(),
                found: total_pages,
            });
        }
        if self.kind == BackingKind::File && self.level1_tail_used() > PAGE_SIZE - COUNT_SIZE {
            return Err(LayoutError::CountOverlapsDigests);
        }
        Ok(())
    }

    /// Bytes of the last level-1 page occupied by digests.
    pub fn level1_tail_used(&self) -> usize {
        let per_page = self.digests_per_page as u64;
        let in_last = self.level0_page_count - (self.level1_page_count - 1) * per_page;
        in_last as usize * self.digest_size
    }

    pub fn classify(&self, index: u64) -> PageClass {
        if index < self.data_page_count {
            PageClass::Data(index)
        } else if index < self.level1_start() {
            PageClass::Level0(index - self.data_page_count)
        } else {
            PageClass::OutOfRange
        }
    }

    /// The level-0 page holding the digest of data page `data_index`.
    pub fn level0_page_for(&self, data_index: u64) -> u64 {
        self.data_page_count + data_index / self.digests_per_page as u64
    }

    /// Byte offset of data page `data_index`'s digest within its level-0 page.
    pub fn level0_slot(&self, data_index: u64) -> usize {
        self.digest_size * (data_index % self.digests_per_page as u64) as usize
    }

    /// Byte offset of level-0 page `level0_index`'s digest within the level-1 table.
    pub fn level1_slot(&self, level0_index: u64) -> usize {
        let per_page = self.digests_per_page as u64;
        PAGE_SIZE * (level0_index / per_page) as usize
            + self.digest_size * (level0_index % per_page) as usize
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::digest::{Sha1Digest, Sha256Digest};

    #[test]
    fn three_page_image() {
        let layout = ImageLayout::for_digest::<Sha1Digest>(3, BackingKind::File).unwrap();
        assert_eq!(layout.digests_per_page, 204);
        assert_eq!(layout.level0_page_count, 1);
        assert_eq!(layout.level1_page_count, 1);
        assert_eq!(layout.level1_start(), 4);
        assert_eq!(layout.count_page(), 4);
        assert_eq!(layout.signature_page(), 5);
        assert_eq!(layout.total_pages(), 6);
        assert_eq!(layout.level1_tail_used(), 20);
        layout.check_total(6).unwrap();

        let blk = ImageLayout::for_digest::<Sha1Digest>(3, BackingKind::BlockDevice).unwrap();
        assert_eq!(blk.count_page(), 5);
        assert_eq!(blk.signature_page(), 6);
        assert_eq!(blk.total_pages(), 7);
    }

    #[test]
    fn exact_multiples() {
        let layout = ImageLayout::for_digest::<Sha1Digest>(204, BackingKind::File).unwrap();
        assert_eq!(layout.level0_page_count, 1);
        let layout = ImageLayout::for_digest::<Sha1Digest>(205, BackingKind::File).unwrap();
        assert_eq!(layout.level0_page_count, 2);
        let layout =
            ImageLayout::for_digest::<Sha1Digest>(204 * 204, BackingKind::File).unwrap();
        assert_eq!(layout.level0_page_count, 204);
        assert_eq!(layout.level1_page_count, 1);
        let layout =
            ImageLayout::for_digest::<Sha1Digest>(204 * 204 + 1, BackingKind::File).unwrap();
        assert_eq!(layout.level0_page_count, 205);
        assert_eq!(layout.level1_page_count, 2);
    }

    #[test]
    fn classify() {
        let layout = ImageLayout::for_digest::<Sha1Digest>(300, BackingKind::File).unwrap();
        assert_eq!(layout.classify(0), PageClass::Data(0));
        assert_eq!(layout.classify(299), PageClass::Data(299));
        assert_eq!(layout.classify(300), PageClass::Level0(0));
        assert_eq!(layout.classify(301), PageClass::Level0(1));
        assert_eq!(layout.classify(302), PageClass::OutOfRange);
        assert_eq!(layout.level0_page_for(203), 300);
        assert_eq!(layout.level0_page_for(204), 301);
        assert_eq!(layout.level0_slot(205), 20);
        assert_eq!(layout.level1_slot(1), 20);
    }

    #[test]
    fn rejects_zero_and_short() {
        assert_eq!(
            ImageLayout::for_digest::<Sha1Digest>(0, BackingKind::File),
            Err(LayoutError::ZeroDataPages)
        );
        assert_eq!(
            ImageLayout::count_page_in(3),
            Err(LayoutError::TooSmall { pages: 3 })
        );
        let layout = ImageLayout::for_digest::<Sha1Digest>(3, BackingKind::File).unwrap();
        assert_eq!(
            layout.check_total(7),
            Err(LayoutError::SizeMismatch {
                expected: 6,
                found: 7
            })
        );
    }

    #[test]
    fn sha256_count_collision() {
        // 128 level-0 pages fill the single level-1 page completely
        let layout =
            ImageLayout::for_digest::<Sha256Digest>(128 * 128, BackingKind::File).unwrap();
        assert_eq!(layout.level1_tail_used(), PAGE_SIZE);
        assert_eq!(
            layout.check_total(layout.total_pages()),
            Err(LayoutError::CountOverlapsDigests)
        );

        // ...but a block device keeps the count on its own page
        let layout =
            ImageLayout::for_digest::<Sha256Digest>(128 * 128, BackingKind::BlockDevice)
                .unwrap();
        layout.check_total(layout.total_pages()).unwrap();
    }

    #[test]
    fn count_trailer() {
        let mut page = [0u8; PAGE_SIZE];
        CountTrailer::write(&mut page, 0x01020304);
        assert_eq!(page[PAGE_SIZE - 4..].to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(CountTrailer::read(&page), Some(0x01020304));
        assert_eq!(CountTrailer::read(&page[..3]), None);
    }

    proptest! {
        #[test]
        fn ceiling_division(count in 1u64..=u32::MAX as u64) {
            let layout = ImageLayout::for_digest::<Sha1Digest>(count, BackingKind::File).unwrap();
            let per_page = layout.digests_per_page as u64;

            prop_assert!(layout.level0_page_count * per_page >= count);
            prop_assert!((layout.level0_page_count - 1) * per_page < count);
            prop_assert!(layout.level1_page_count * per_page >= layout.level0_page_count);
            prop_assert!((layout.level1_page_count - 1) * per_page < layout.level0_page_count);
        }

        #[test]
        fn every_verifiable_page_has_a_slot(count in 1u64..100_000) {
            let layout = ImageLayout::for_digest::<Sha1Digest>(count, BackingKind::File).unwrap();
            let table = layout.level1_table_len().unwrap();

            let last = count - 1;
            prop_assert!(layout.level0_page_for(last) < layout.level1_start());
            prop_assert!(layout.level0_slot(last) + layout.digest_size <= PAGE_SIZE);
            let last_l0 = layout.level0_page_count - 1;
            prop_assert!(layout.level1_slot(last_l0) + layout.digest_size <= table);
        }
    }
}
