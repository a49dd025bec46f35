//! A `Read + Seek` view of the data region of an attached device.

use std::io::{self, Read, Seek, SeekFrom};

use crate::{
    device::VerifiedDevice,
    digest::PageDigest,
    transfer::{Direction, TransferGate},
    PAGE_SIZE,
};

impl<H: PageDigest> VerifiedDevice<H> {
    pub fn reader(&self) -> DeviceReader<'_> {
        DeviceReader::new(self)
    }
}

/// Reads the data region page by page through the transfer gate.  A verification failure
/// surfaces as an `io::Error` of kind `InvalidData`.
pub struct DeviceReader<'a> {
    gate: &'a dyn TransferGate,
    position: u64,
}

impl<'a> DeviceReader<'a> {
    pub fn new(gate: &'a dyn TransferGate) -> Self {
        Self { gate, position: 0 }
    }

    fn len(&self) -> u64 {
        self.gate.layout().data_len()
    }
}

impl Read for DeviceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let index = self.position / PAGE_SIZE as u64;
        let offset = (self.position % PAGE_SIZE as u64) as usize;
        let n = buf
            .len()
            .min(PAGE_SIZE - offset)
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));

        self.gate
            .transfer_page(Direction::Read, index, &mut buf[..n], offset)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for DeviceReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.len().checked_add_signed(n),
            SeekFrom::Current(n) => self.position.checked_add_signed(n),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ed25519_dalek::SigningKey;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        device::AttachOptions,
        digest::Sha256Digest,
        image::build_image,
        layout::BackingKind,
        signature::KeyRing,
        store::MemoryStore,
    };

    fn device(data: &[u8], corrupt: Option<usize>) -> VerifiedDevice<Sha256Digest> {
        let key = SigningKey::from_bytes(&[4; 32]);
        let image = build_image::<Sha256Digest>(data, BackingKind::File, &key).unwrap();
        let store = Arc::new(MemoryStore::new(image, BackingKind::File));
        if let Some(offset) = corrupt {
            store.corrupt(offset, 1);
        }
        let keys = KeyRing::new(key.verifying_key(), key.verifying_key(), key.verifying_key());
        VerifiedDevice::attach(store, &keys, AttachOptions::default()).unwrap()
    }

    #[test]
    fn read_to_end() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let device = device(&data, None);

        let mut out = vec![];
        DeviceReader::new(&device).read_to_end(&mut out).unwrap();
        // the data region is padded to whole pages
        assert_eq!(out.len(), 3 * PAGE_SIZE);
        assert_eq!(out[..data.len()].to_vec(), data);
        assert!(out[data.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn seek_and_read() {
        let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 256) as u8).collect();
        let device = device(&data, None);
        let mut reader = device.reader();

        assert_eq!(reader.seek(SeekFrom::Start(PAGE_SIZE as u64 - 2)).unwrap(), 4094);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), data[4094..4098].to_vec());

        assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 2 * 4096 - 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        assert!(reader.seek(SeekFrom::Current(-100_000)).is_err());
    }

    #[test]
    fn tampered_read_fails() {
        let data = vec![7u8; 2 * PAGE_SIZE];
        let device = device(&data, Some(PAGE_SIZE + 5));
        let mut reader = DeviceReader::new(&device);

        let mut out = vec![];
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // only the good first page made it out
        assert_eq!(out.len(), PAGE_SIZE);
    }
}
