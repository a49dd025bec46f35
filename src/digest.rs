//! Page digest algorithms.
//!
//! The hash tree is parametric over the digest: anything implementing [`PageDigest`] can be
//! used, and the number of digests that fit in a page follows from its size.  SHA-1 (20 bytes,
//! 204 digests per page) is the reference algorithm for the on-disk format.

use core::{fmt, hash::Hash};

use hex::FromHexError;
use sha1::Sha1;
use sha2::{digest::Output, Digest, Sha256};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::PAGE_SIZE;

pub trait PageDigest
where
    Self: Clone,
    Self: From<Output<Self::Digest>>,
    Self: FromBytes + Immutable + IntoBytes + KnownLayout + Unaligned,
    Self: Hash + Eq,
    Self: fmt::Debug,
    Self: Send + Sync + Unpin + 'static,
{
    type Digest: Digest + fmt::Debug;
    const SIZE: usize;
    const EMPTY: Self;
    const ID: &str;

    /// How many digests are packed into one hash page.
    const DIGESTS_PER_PAGE: usize = PAGE_SIZE / Self::SIZE;

    fn digest(data: &[u8]) -> Self {
        Self::Digest::digest(data).into()
    }

    /// Reads a digest out of a packed hash page slot.  Returns None if the slot is short.
    fn from_slot(slot: &[u8]) -> Option<Self> {
        Self::read_from_bytes(slot.get(..Self::SIZE)?).ok()
    }

    fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, FromHexError> {
        let mut value = Self::EMPTY;
        hex::decode_to_slice(hex.as_ref(), value.as_mut_bytes())?;
        Ok(value)
    }

    fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    fn to_id(&self) -> String {
        format!("{}:{}", Self::ID, self.to_hex())
    }

    /// Compares two digests.  This is constant-time unless the `variable-time-compare`
    /// feature is enabled.
    fn matches(&self, other: &Self) -> bool {
        digests_equal(self.as_bytes(), other.as_bytes())
    }
}

#[cfg(not(feature = "variable-time-compare"))]
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    a.ct_eq(b).into()
}

/// Plain slice comparison.  Leaks the position of the first differing byte through timing, so
/// this must only be used for debugging.
#[cfg(feature = "variable-time-compare")]
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    a == b
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha1:{}", self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

#[derive(Clone, Eq, FromBytes, Hash, Immutable, IntoBytes, KnownLayout, PartialEq, Unaligned)]
#[repr(C)]
pub struct Sha1Digest([u8; 20]);

impl From<Output<Sha1>> for Sha1Digest {
    fn from(value: Output<Sha1>) -> Self {
        Self(value.into())
    }
}

impl PageDigest for Sha1Digest {
    type Digest = Sha1;
    const SIZE: usize = 20;
    const EMPTY: Self = Self([0; 20]);
    const ID: &str = "sha1";
}

#[derive(Clone, Eq, FromBytes, Hash, Immutable, IntoBytes, KnownLayout, PartialEq, Unaligned)]
#[repr(C)]
pub struct Sha256Digest([u8; 32]);

impl From<Output<Sha256>> for Sha256Digest {
    fn from(value: Output<Sha256>) -> Self {
        Self(value.into())
    }
}

impl PageDigest for Sha256Digest {
    type Digest = Sha256;
    const SIZE: usize = 32;
    const EMPTY: Self = Self([0; 32]);
    const ID: &str = "sha256";
}
