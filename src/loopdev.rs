//! A registry of loop devices, each bound either to a plain store or to a verified image.
//!
//! This stands in for the host's device-attach configuration: it owns the per-device state
//! from attach to detach, and it answers "not attached" for every minor that has none.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    device::{AttachError, AttachOptions, VerifiedDevice, DEFAULT_CACHE_PAGES},
    digest::PageDigest,
    signature::KeyRing,
    store::BackingStore,
    transfer::{Direction, TransferError, TransferGate},
};

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("loop device {0} is already attached")]
    Busy(u32),
    #[error("loop device {0} is not attached")]
    NotAttached(u32),
    #[error("failed to attach loop device {minor}: {source}")]
    Attach {
        minor: u32,
        #[source]
        source: AttachError,
    },
}

/// What a loop device transfers through.
#[derive(Clone)]
pub enum Binding {
    /// Raw pages from a store, unverified.
    Plain(Arc<dyn BackingStore>),
    /// The hash-tree verified transfer gate.
    Verified(Arc<dyn TransferGate>),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Plain(..) => f.write_str("Plain"),
            Binding::Verified(gate) => write!(f, "Verified({:?})", gate.layout()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopDevice {
    pub minor: u32,
    pub binding: Binding,
}

/// A block device as seen by mount policy.
#[derive(Debug, Clone)]
pub enum BlockDevice {
    Loop(LoopDevice),
    Other { major: u32, minor: u32 },
}

pub struct LoopControl {
    keys: KeyRing,
    cache_pages: usize,
    devices: RwLock<HashMap<u32, LoopDevice>>,
}

impl fmt::Debug for LoopControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopControl")
            .field("devices", &*self.devices())
            .finish_non_exhaustive()
    }
}

impl LoopControl {
    pub fn new(keys: KeyRing) -> Self {
        Self::with_cache_pages(keys, DEFAULT_CACHE_PAGES)
    }

    pub fn with_cache_pages(keys: KeyRing, cache_pages: usize) -> Self {
        Self {
            keys,
            cache_pages,
            devices: RwLock::default(),
        }
    }

    fn devices(&self) -> RwLockReadGuard<'_, HashMap<u32, LoopDevice>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn devices_mut(&self) -> RwLockWriteGuard<'_, HashMap<u32, LoopDevice>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, minor: u32, binding: Binding) -> Result<(), LoopError> {
        let mut devices = self.devices_mut();
        if devices.contains_key(&minor) {
            return Err(LoopError::Busy(minor));
        }
        devices.insert(minor, LoopDevice { minor, binding });
        Ok(())
    }

    /// Attaches a signed image to `minor`.  The device only appears once the level-1 table
    /// has been verified; on failure nothing is registered.
    pub fn attach_verified<H: PageDigest>(
        &self,
        minor: u32,
        store: Arc<dyn BackingStore>,
    ) -> Result<(), LoopError> {
        if self.devices().contains_key(&minor) {
            return Err(LoopError::Busy(minor));
        }

        let options = AttachOptions {
            minor,
            cache_pages: self.cache_pages,
        };
        let device = VerifiedDevice::<H>::attach(store, &self.keys, options)
            .map_err(|source| LoopError::Attach { minor, source })?;
        info!(
            "loop{minor}: attached verified image with {} data pages",
            device.layout().data_page_count
        );

        self.insert(minor, Binding::Verified(Arc::new(device)))
    }

    /// Attaches a store to `minor` with no verification at all.
    pub fn attach_plain(&self, minor: u32, store: Arc<dyn BackingStore>) -> Result<(), LoopError> {
        self.insert(minor, Binding::Plain(store))?;
        info!("loop{minor}: attached plain store");
        Ok(())
    }

    /// Detaches `minor`, releasing its verification state once in-flight users are done.
    pub fn detach(&self, minor: u32) -> Result<(), LoopError> {
        self.devices_mut()
            .remove(&minor)
            .ok_or(LoopError::NotAttached(minor))?;
        debug!("loop{minor}: detached");
        Ok(())
    }

    pub fn device(&self, minor: u32) -> Option<LoopDevice> {
        self.devices().get(&minor).cloned()
    }

    /// The block device handle for `minor`, as handed to mount policy.
    pub fn block_device(&self, minor: u32) -> Option<BlockDevice> {
        self.device(minor).map(BlockDevice::Loop)
    }

    /// Reads page `index` of `minor` into `buf`, which must be one page long.
    pub fn read(&self, minor: u32, index: u64, buf: &mut [u8]) -> Result<(), TransferError> {
        let device = self.device(minor).ok_or(TransferError::NotAttached(minor))?;
        match device.binding {
            Binding::Plain(store) => Ok(store.read_page(index, buf)?),
            Binding::Verified(gate) => gate.transfer_page(Direction::Read, index, buf, 0),
        }
    }
}
