//! Per-device verification state: attach and the hash-tree verifier.
//!
//! Attaching a store reads the data page count, loads the whole level-1 region into memory and
//! checks its digest against the signature page.  Only once that has succeeded does a
//! [`VerifiedDevice`] exist, so nothing can be read from an image whose level-1 table has not
//! been verified.
//!
//! After that, [`VerifiedDevice::verify_page()`] checks individual pages:
//!
//!  - a level-0 page against its digest in the in-memory level-1 table
//!  - a data page against its digest in its level-0 page, after verifying that page first
//!
//! Successful checks tag the page so that repeated reads of the same cached page are free.

use std::{
    io,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    cache::{Page, PageCache, TagTable},
    digest::PageDigest,
    layout::{CountTrailer, ImageLayout, LayoutError, PageClass},
    signature::{parse_signature_page, KeyIdentity, KeyRing},
    store::BackingStore,
    PAGE_SIZE,
};

/// Writable stores and write transfers are only accepted in `permit-write` builds.
pub(crate) const WRITE_PERMITTED: bool = cfg!(feature = "permit-write");

/// A failed signature check only fails the attach in builds without `permit-unsigned`.
pub(crate) const UNSIGNED_PERMITTED: bool = cfg!(feature = "permit-unsigned");

pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Attaching a store failed.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("write access is not supported")]
    WriteNotSupported,
    #[error("image layout is unreadable: {0}")]
    LayoutUnreadable(#[from] LayoutError),
    #[error("failed to allocate {0} bytes for the level-1 table")]
    AllocationFailure(usize),
    #[error("level-1 table signature is invalid")]
    SignatureInvalid,
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Verifying a page failed.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("page {index}: expected digest {expected} but found {found}")]
    HashMismatch {
        index: u64,
        expected: String,
        found: String,
    },
    #[error("page {index} is outside the verifiable range 0..{limit}")]
    IndexOutOfRange { index: u64, limit: u64 },
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    /// Minor number of the device.  Selects the acceptable signing keys.
    pub minor: u32,
    /// How many pages to keep cached.  This also bounds the number of verification tags.
    pub cache_pages: usize,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            minor: 0,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

/// Counters for how much verification work a device has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyStats {
    /// Pages whose digest was computed.
    pub hashed: u64,
    /// Verifications answered by a tag without hashing.
    pub tag_hits: u64,
    pub mismatches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hashed: AtomicU64,
    tag_hits: AtomicU64,
    mismatches: AtomicU64,
}

/// Reads and validates the layout of the image in `store`.
pub fn read_layout<H: PageDigest>(store: &dyn BackingStore) -> Result<ImageLayout, AttachError> {
    let total = store.page_count()?;
    let count_page = ImageLayout::count_page_in(total)?;

    let mut page = vec![0u8; PAGE_SIZE];
    store
        .read_page(count_page, &mut page)
        .map_err(|err| LayoutError::Unreadable {
            page: count_page,
            reason: err.to_string(),
        })?;
    let count = CountTrailer::read(&page).unwrap_or(0);

    let layout = ImageLayout::for_digest::<H>(count.into(), store.kind())?;
    layout.check_total(total)?;
    Ok(layout)
}

fn load_level1(store: &dyn BackingStore, layout: &ImageLayout) -> Result<Box<[u8]>, AttachError> {
    let len = layout.level1_table_len()?;
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| AttachError::AllocationFailure(len))?;
    table.resize(len, 0);

    for (index, chunk) in (layout.level1_start()..).zip(table.chunks_mut(PAGE_SIZE)) {
        store.read_page(index, chunk)?;
    }

    Ok(table.into_boxed_slice())
}

fn check_signature(
    store: &dyn BackingStore,
    layout: &ImageLayout,
    keys: &KeyRing,
    minor: u32,
    digest: &[u8],
) -> Result<Option<KeyIdentity>, AttachError> {
    let mut page = vec![0u8; PAGE_SIZE];
    store.read_page(layout.signature_page(), &mut page)?;

    let signer = match parse_signature_page(&page) {
        Ok(signature) => keys.verify(minor, digest, signature),
        Err(err) => {
            warn!("minor {minor}: {err}");
            None
        }
    };

    match signer {
        Some(identity) => {
            debug!("minor {minor}: level-1 table signed by {identity:?} key");
            Ok(Some(identity))
        }
        None if UNSIGNED_PERMITTED => {
            warn!("minor {minor}: level-1 signature is invalid, attaching anyway (permit-unsigned)");
            Ok(None)
        }
        None => Err(AttachError::SignatureInvalid),
    }
}

/// An attached, signature-verified image.
#[derive(Debug)]
pub struct VerifiedDevice<H: PageDigest> {
    layout: ImageLayout,
    level1: Box<[u8]>,
    minor: u32,
    signer: Option<KeyIdentity>,
    pub(crate) cache: PageCache,
    pub(crate) tags: TagTable,
    counters: Counters,
    _digest: PhantomData<H>,
}

impl<H: PageDigest> VerifiedDevice<H> {
    /// Resolves the layout of `store`, loads the level-1 table and checks its signature.
    pub fn attach(
        store: Arc<dyn BackingStore>,
        keys: &KeyRing,
        options: AttachOptions,
    ) -> Result<Self, AttachError> {
        let minor = options.minor;

        if store.is_writable() {
            if !WRITE_PERMITTED {
                return Err(AttachError::WriteNotSupported);
            }
            warn!("minor {minor}: attaching a writable store (permit-write)");
        }

        let layout = read_layout::<H>(&*store)?;
        debug!("minor {minor}: {layout:?}");

        let level1 = load_level1(&*store, &layout)?;
        let digest = H::digest(&level1);
        debug!("minor {minor}: level-1 digest {digest:?}");

        let signer = check_signature(&*store, &layout, keys, minor, digest.as_bytes())?;

        Ok(Self {
            layout,
            level1,
            minor,
            signer,
            cache: PageCache::new(store, options.cache_pages),
            tags: TagTable::new(options.cache_pages),
            counters: Counters::default(),
            _digest: PhantomData,
        })
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// The key that signed the level-1 table.  None only in `permit-unsigned` builds, when
    /// the signature did not verify.
    pub fn signer(&self) -> Option<KeyIdentity> {
        self.signer
    }

    /// Returns the cached page at `index`, reading it from the store if needed.  The page is
    /// not verified.
    pub fn page(&self, index: u64) -> io::Result<Arc<Page>> {
        self.cache.get(index)
    }

    pub fn stats(&self) -> VerifyStats {
        VerifyStats {
            hashed: self.counters.hashed.load(Ordering::Relaxed),
            tag_hits: self.counters.tag_hits.load(Ordering::Relaxed),
            mismatches: self.counters.mismatches.load(Ordering::Relaxed),
        }
    }

    fn out_of_range(&self, index: u64) -> VerifyError {
        VerifyError::IndexOutOfRange {
            index,
            limit: self.layout.verifiable_pages(),
        }
    }

    /// Makes sure the content of `page` matches its digest in the hash tree.
    ///
    /// This may read (and verify) the level-0 page holding the digest of a data page, so it
    /// can block on the store.  It is safe to call concurrently, including for the same page:
    /// at worst the digest is computed twice.
    pub fn verify_page(&self, page: &Page) -> Result<(), VerifyError> {
        let index = page.index();

        if self.tags.is_valid(page) {
            self.counters.tag_hits.fetch_add(1, Ordering::Relaxed);
            trace!("page {index}: tag hit");
            return Ok(());
        }

        let expected = match self.layout.classify(index) {
            PageClass::Data(data_index) => {
                let hash_page = self.cache.get(self.layout.level0_page_for(data_index))?;
                self.verify_page(&hash_page)?;
                hash_page
                    .data()
                    .get(self.layout.level0_slot(data_index)..)
                    .and_then(H::from_slot)
            }
            PageClass::Level0(level0_index) => self
                .level1
                .get(self.layout.level1_slot(level0_index)..)
                .and_then(H::from_slot),
            PageClass::OutOfRange => None,
        }
        .ok_or_else(|| self.out_of_range(index))?;

        let found = H::digest(page.data());
        self.counters.hashed.fetch_add(1, Ordering::Relaxed);

        if !found.matches(&expected) {
            self.counters.mismatches.fetch_add(1, Ordering::Relaxed);
            warn!("minor {}: page {index} failed verification", self.minor);
            return Err(VerifyError::HashMismatch {
                index,
                expected: expected.to_hex(),
                found: found.to_hex(),
            });
        }

        if self.tags.mark(page) {
            trace!("page {index}: verified");
        } else {
            trace!("page {index}: verified, metadata slot in use so not tagged");
        }
        Ok(())
    }
}
