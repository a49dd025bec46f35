//! Mount policy for block devices.
//!
//! Only filesystems on a verified loop device may keep executables, setuid binaries and device
//! nodes.  Anything else is mounted `noexec,nosuid`, and devices that aren't loop devices at
//! all also get `nodev`.  Hooking this into a mount path is left to the host.

use log::debug;
use rustix::mount::MountFlags;

use crate::loopdev::{Binding, BlockDevice, LoopDevice};

/// Whether `device` transfers through the verified gate.
pub fn is_verified_device(device: &BlockDevice) -> bool {
    matches!(
        device,
        BlockDevice::Loop(LoopDevice {
            binding: Binding::Verified(..),
            ..
        })
    )
}

/// The flags a mount of `device` must use, given the flags it asked for.
pub fn restrict_mount_flags(device: &BlockDevice, flags: MountFlags) -> MountFlags {
    let forced = match device {
        device if is_verified_device(device) => MountFlags::empty(),
        BlockDevice::Loop(..) => MountFlags::NOEXEC | MountFlags::NOSUID,
        BlockDevice::Other { .. } => MountFlags::NOEXEC | MountFlags::NOSUID | MountFlags::NODEV,
    };
    if !forced.is_empty() {
        debug!("{device:?}: forcing {forced:?}");
    }
    flags | forced
}
