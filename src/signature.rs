//! The signature over the level-1 table and the keys it is checked against.
//!
//! The signature page holds a big-endian u32 length followed by that many bytes of Ed25519
//! signature over the digest of the entire level-1 region.  Which keys are acceptable depends
//! on the device: minor 0 (the root device) only accepts the root key, every other minor
//! accepts either the production or the development key.

use std::io;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use log::debug;
use thiserror::Error;
use zerocopy::{big_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{util::parse_hex32, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("failed to parse key: {0}")]
    Parse(#[from] io::Error),
    #[error("invalid public key: {0}")]
    Invalid(#[from] ed25519_dalek::SignatureError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignaturePageError {
    #[error("signature length {0} does not fit in a page")]
    TooLong(usize),
    #[error("signature page is truncated")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyIdentity {
    Root,
    Production,
    Development,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRing {
    root: VerifyingKey,
    production: VerifyingKey,
    development: VerifyingKey,
}

impl KeyRing {
    pub fn new(root: VerifyingKey, production: VerifyingKey, development: VerifyingKey) -> Self {
        Self {
            root,
            production,
            development,
        }
    }

    pub fn from_hex(
        root: impl AsRef<str>,
        production: impl AsRef<str>,
        development: impl AsRef<str>,
    ) -> Result<Self, KeyError> {
        let parse = |s: &str| -> Result<VerifyingKey, KeyError> {
            Ok(VerifyingKey::from_bytes(&parse_hex32(s)?)?)
        };
        Ok(Self::new(
            parse(root.as_ref())?,
            parse(production.as_ref())?,
            parse(development.as_ref())?,
        ))
    }

    pub fn key(&self, identity: KeyIdentity) -> &VerifyingKey {
        match identity {
            KeyIdentity::Root => &self.root,
            KeyIdentity::Production => &self.production,
            KeyIdentity::Development => &self.development,
        }
    }

    /// The keys acceptable for a device, in the order they are tried.
    pub fn candidates(minor: u32) -> &'static [KeyIdentity] {
        match minor {
            0 => &[KeyIdentity::Root],
            _ => &[KeyIdentity::Production, KeyIdentity::Development],
        }
    }

    /// Checks `signature` over `message` against the keys for `minor`.  Returns the key that
    /// matched, if any.
    pub fn verify(&self, minor: u32, message: &[u8], signature: &[u8]) -> Option<KeyIdentity> {
        let Ok(signature) = Signature::from_slice(signature) else {
            debug!("malformed signature of {} bytes", signature.len());
            return None;
        };

        Self::candidates(minor).iter().copied().find(|&identity| {
            let matched = self
                .key(identity)
                .verify_strict(message, &signature)
                .is_ok();
            debug!("minor {minor}: {identity:?} key matched={matched}");
            matched
        })
    }
}

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct SignatureHeader {
    len: U32,
}

const HEADER_SIZE: usize = size_of::<SignatureHeader>();

/// Extracts the signature bytes from a signature page.
pub fn parse_signature_page(page: &[u8]) -> Result<&[u8], SignaturePageError> {
    let (header, rest) =
        SignatureHeader::read_from_prefix(page).map_err(|_| SignaturePageError::Truncated)?;
    let len = header.len.get() as usize;
    if len > PAGE_SIZE - HEADER_SIZE {
        return Err(SignaturePageError::TooLong(len));
    }
    rest.get(..len).ok_or(SignaturePageError::Truncated)
}

/// Lays out a signature page: header plus signature, without padding.
pub fn encode_signature_page(signature: &[u8]) -> Result<Vec<u8>, SignaturePageError> {
    if signature.len() > PAGE_SIZE - HEADER_SIZE {
        return Err(SignaturePageError::TooLong(signature.len()));
    }
    let header = SignatureHeader {
        len: U32::new(signature.len() as u32),
    };
    let mut page = Vec::with_capacity(HEADER_SIZE + signature.len());
    page.extend_from_slice(header.as_bytes());
    page.extend_from_slice(signature);
    Ok(page)
}

/// Signs a level-1 digest.
pub fn sign_digest(key: &SigningKey, digest: &[u8]) -> Vec<u8> {
    key.sign(digest).to_bytes().to_vec()
}
