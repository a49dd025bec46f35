//! Building signed images.
//!
//! This is the producer side of the format: given a data payload and a signing key, lay out
//! the data pages, both levels of digests, the count and the signature.

use ed25519_dalek::SigningKey;
use log::debug;
use thiserror::Error;

use crate::{
    digest::PageDigest,
    layout::{BackingKind, CountTrailer, ImageLayout, LayoutError},
    signature::{encode_signature_page, sign_digest, SignaturePageError},
    PAGE_SIZE,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageBuildError {
    #[error("image data is empty")]
    EmptyData,
    #[error("{0} data pages do not fit the 32-bit count field")]
    TooManyPages(u64),
    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("invalid signature: {0}")]
    Signature(#[from] SignaturePageError),
}

/// Digests each page of `pages` and packs the results into `out_pages` hash pages.  Unused
/// slots stay zero.
fn hash_pages<H: PageDigest>(pages: &[u8], out_pages: u64) -> Vec<u8> {
    let mut out = vec![0u8; out_pages as usize * PAGE_SIZE];
    for (i, page) in pages.chunks(PAGE_SIZE).enumerate() {
        let at = (i / H::DIGESTS_PER_PAGE) * PAGE_SIZE + (i % H::DIGESTS_PER_PAGE) * H::SIZE;
        out[at..at + H::SIZE].copy_from_slice(H::digest(page).as_bytes());
    }
    out
}

/// Lays out `data` as a signed image for a store of the given kind.
///
/// The data is zero-padded to a whole number of pages.  A file image ends with a partial
/// signature page (just the header and the signature); a block-device image is padded out to
/// whole pages, since a device can only be addressed in pages.
pub fn build_image<H: PageDigest>(
    data: &[u8],
    kind: BackingKind,
    key: &SigningKey,
) -> Result<Vec<u8>, ImageBuildError> {
    let data_pages = data.len().div_ceil(PAGE_SIZE) as u64;
    if data_pages == 0 {
        return Err(ImageBuildError::EmptyData);
    }
    let count = u32::try_from(data_pages).map_err(|_| ImageBuildError::TooManyPages(data_pages))?;

    let layout = ImageLayout::for_digest::<H>(data_pages, kind)?;
    layout.check_total(layout.total_pages())?;
    debug!("building {layout:?}");

    let mut image = Vec::with_capacity(layout.total_pages() as usize * PAGE_SIZE);
    image.extend_from_slice(data);
    image.resize(data_pages as usize * PAGE_SIZE, 0);

    let level0 = hash_pages::<H>(&image, layout.level0_page_count);
    let mut level1 = hash_pages::<H>(&level0, layout.level1_page_count);
    if kind == BackingKind::File {
        // the count lives in the tail of the last level-1 page, and so is covered by the
        // signature
        CountTrailer::write(&mut level1, count);
    }
    let root = H::digest(&level1);
    debug!("level-1 digest {root:?}");

    image.extend_from_slice(&level0);
    image.extend_from_slice(&level1);

    if kind == BackingKind::BlockDevice {
        let mut count_page = vec![0u8; PAGE_SIZE];
        CountTrailer::write(&mut count_page, count);
        image.extend_from_slice(&count_page);
    }

    image.extend_from_slice(&encode_signature_page(&sign_digest(key, root.as_bytes()))?);
    if kind == BackingKind::BlockDevice {
        image.resize(layout.total_pages() as usize * PAGE_SIZE, 0);
    }

    Ok(image)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::digest::{Sha1Digest, Sha256Digest};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[9; 32])
    }

    #[test]
    fn three_page_file_image() {
        let data = vec![0x5a; 3 * PAGE_SIZE - 100];
        let image = build_image::<Sha1Digest>(&data, BackingKind::File, &key()).unwrap();

        // 3 data + 1 level-0 + 1 level-1 pages, then a 68-byte signature page
        assert_eq!(image.len(), 5 * PAGE_SIZE + 4 + 64);
        assert_eq!(image[..data.len()].to_vec(), data);
        assert!(image[data.len()..3 * PAGE_SIZE].iter().all(|&b| b == 0));

        let level0 = &image[3 * PAGE_SIZE..4 * PAGE_SIZE];
        for i in 0..3 {
            let page = &image[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            assert_eq!(
                level0[i * 20..(i + 1) * 20].to_vec(),
                Sha1Digest::digest(page).as_bytes().to_vec()
            );
        }
        assert!(level0[60..].iter().all(|&b| b == 0));

        let level1 = &image[4 * PAGE_SIZE..5 * PAGE_SIZE];
        assert_eq!(
            level1[..20].to_vec(),
            Sha1Digest::digest(level0).as_bytes().to_vec()
        );
        assert_eq!(CountTrailer::read(level1), Some(3));
    }

    #[test]
    fn block_device_image() {
        let data = vec![1; PAGE_SIZE];
        let image = build_image::<Sha1Digest>(&data, BackingKind::BlockDevice, &key()).unwrap();
        assert_eq!(image.len(), 5 * PAGE_SIZE);

        let level1 = &image[2 * PAGE_SIZE..3 * PAGE_SIZE];
        assert_eq!(CountTrailer::read(level1), Some(0));
        let count_page = &image[3 * PAGE_SIZE..4 * PAGE_SIZE];
        assert_eq!(CountTrailer::read(count_page), Some(1));
    }

    #[test]
    fn rejects_empty_and_colliding() {
        assert_eq!(
            build_image::<Sha1Digest>(&[], BackingKind::File, &key()),
            Err(ImageBuildError::EmptyData)
        );

        let data = vec![0; 128 * 128 * PAGE_SIZE];
        assert_eq!(
            build_image::<Sha256Digest>(&data, BackingKind::File, &key()),
            Err(ImageBuildError::Layout(LayoutError::CountOverlapsDigests))
        );
    }
}
