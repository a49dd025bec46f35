//! Signature-gated, hash-tree verified read path for loop device images.
//!
//! An image is a run of data pages followed by two levels of packed page digests and a
//! signature over the digest of the topmost level.  The topmost level is checked against the
//! signature once, at attach time; after that every data page is verified against its level-0
//! digest (and every level-0 page against the in-memory level-1 table) before any of its bytes
//! are handed out.

pub mod cache;
pub mod device;
pub mod digest;
pub mod image;
pub mod layout;
pub mod loopdev;
pub mod policy;
pub mod reader;
pub mod signature;
pub mod store;
pub mod transfer;
pub mod util;

/// The size of one page: the unit of both I/O and hashing.
pub const PAGE_SIZE: usize = 4096;
