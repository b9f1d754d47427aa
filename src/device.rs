// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Device model and the driver-backend boundary.
//!
//! The engine treats everything below descriptor submission as an
//! external collaborator: PCI probing, IOMMU attach, PASID acquisition
//! and portal mapping live in a driver backend, and the engine consumes
//! only the [`DeviceOps`] handle plus a few sizing attributes. The
//! module-scoped driver registry selects between the registered
//! backends ("user" or "kernel") exactly once per process.

use crate::descriptor::{CompletionRecord, HwDesc};
use crate::error::{Error, Result};
use crate::submit;
use std::sync::{Arc, Mutex};

/// Name the userspace driver backend registers under.
pub const USERSPACE_DRIVER_NAME: &str = "user";

/// Name the kernel driver backend registers under.
pub const KERNEL_DRIVER_NAME: &str = "kernel";

/// Byte distance between adjacent doorbell addresses in the portal.
pub const PORTAL_STRIDE: usize = 64;

/// Size of the portal page; doorbell offsets wrap within it.
pub const PORTAL_SIZE: usize = 4096;

const PORTAL_MASK: usize = PORTAL_SIZE - 1;

/// Size of the per-device Analytics Engine Configuration State block
/// referenced by compress descriptors via source 2.
pub const IAA_AECS_SIZE: u32 = 1568;

/// Accelerator device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Data Streaming Accelerator: memory ops, CRC, DIF; has batching.
    Dsa,
    /// In-Memory Analytics Accelerator: compress/decompress.
    Iaa,
}

impl DeviceKind {
    /// Completion-record footprint the device writes.
    #[inline]
    pub fn completion_record_size(self) -> usize {
        match self {
            Self::Dsa => CompletionRecord::DSA_SIZE,
            Self::Iaa => CompletionRecord::IAA_SIZE,
        }
    }

    /// Only DSA-class devices execute batch descriptors.
    #[inline]
    pub fn has_batch_pool(self) -> bool {
        matches!(self, Self::Dsa)
    }
}

/// Static attributes of one accelerator device instance, supplied by
/// the driver backend at attach time.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device class.
    pub kind: DeviceKind,
    /// Total number of work-queue entries across the device.
    pub total_wq_size: u32,
    /// Maximum descriptors in one batch.
    pub batch_size: u16,
    /// Device walks host page tables itself; submit virtual addresses.
    pub pasid_enabled: bool,
    /// Device address of the AECS block (IAA compress source 2).
    pub aecs_addr: u64,
}

/// The outbound collaborator contract a driver backend implements per
/// device.
pub trait DeviceOps: Send + Sync {
    /// MMIO-like base of the submission portal region.
    fn portal_base(&self) -> *mut u8;

    /// Translate a virtual address, returning the device-visible
    /// address and the length of the physically contiguous run starting
    /// there.
    fn translate(&self, buf: *const u8, size: u64) -> Result<(u64, u64)>;

    /// Side-effecting diagnostic hook: dump the device's software error
    /// register after a failed completion.
    fn dump_sw_error(&self, portal: *mut u8);

    /// Deliver one 64-byte descriptor to a doorbell address.
    ///
    /// The default implementation performs the platform 64-byte store
    /// ([`submit::portal_write`]); backends only override it when the
    /// portal is not plain MMIO.
    ///
    /// # Safety
    ///
    /// `portal` must be valid for a 64-byte write and the completion
    /// record referenced by `desc` must stay valid until completion.
    unsafe fn doorbell(&self, portal: *mut u8, desc: &HwDesc) {
        unsafe { submit::portal_write(portal, desc) }
    }
}

/// One accelerator device.
///
/// Shared by all of its channels; the only mutable state is the
/// channel-slot bitmap, guarded by a mutex and touched exclusively on
/// channel acquire/release.
pub struct Device {
    config: DeviceConfig,
    chan_per_device: u32,
    wq_slots: Mutex<u32>,
    ops: Arc<dyn DeviceOps>,
}

impl Device {
    /// Bring up the engine's view of a device.
    pub fn new(config: DeviceConfig, ops: Arc<dyn DeviceOps>) -> Arc<Self> {
        // Spread the channels we allow per device based on the total
        // number of WQ entries to achieve optimal sharing for common
        // configurations.
        let chan_per_device = if config.total_wq_size >= 128 { 8 } else { 4 };
        Arc::new(Self {
            config,
            chan_per_device,
            wq_slots: Mutex::new(0),
            ops,
        })
    }

    /// Device attributes.
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of channels this device accepts concurrently.
    #[inline]
    pub fn chan_per_device(&self) -> u32 {
        self.chan_per_device
    }

    /// Descriptors each channel preallocates.
    #[inline]
    pub(crate) fn descriptors_per_channel(&self) -> usize {
        (self.config.total_wq_size / self.chan_per_device) as usize
    }

    /// Driver backend handle.
    #[inline]
    pub(crate) fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.ops
    }

    /// Reserve a channel slot, returning its number.
    pub(crate) fn reserve_channel_slot(&self) -> Result<u32> {
        let mut slots = self.wq_slots.lock().unwrap();
        for num in 0..self.chan_per_device {
            if *slots & (1 << num) == 0 {
                *slots |= 1 << num;
                return Ok(num);
            }
        }
        log::error!("too many channels sharing this device");
        Err(Error::PoolExhausted)
    }

    /// Return a channel slot to the device.
    pub(crate) fn release_channel_slot(&self, num: u32) {
        let mut slots = self.wq_slots.lock().unwrap();
        debug_assert!(*slots & (1 << num) != 0);
        *slots &= !(1 << num);
    }

    /// Initial portal offset for a channel slot.
    #[inline]
    pub(crate) fn portal_offset_for_slot(&self, num: u32) -> usize {
        (num as usize * PORTAL_STRIDE) & PORTAL_MASK
    }

    /// Advance a channel's portal offset by one rotation step.
    ///
    /// Each channel steps by `chan_per_device` strides and wraps within
    /// the portal page, so concurrent channels keep cycling through
    /// disjoint doorbell addresses.
    #[inline]
    pub(crate) fn next_portal_offset(&self, offset: usize) -> usize {
        (offset + self.chan_per_device as usize * PORTAL_STRIDE) & PORTAL_MASK
    }
}

/// A registered driver backend.
///
/// The engine only routes selection through the registry; probing and
/// device construction stay inside the backend.
pub trait DriverImpl: Sync {
    /// Registry name ("user" or "kernel").
    fn name(&self) -> &'static str;
}

struct Registry {
    impls: Vec<&'static dyn DriverImpl>,
    selected: Option<&'static dyn DriverImpl>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    impls: Vec::new(),
    selected: None,
});

/// Register a driver backend. Registering the same name twice keeps the
/// first registration.
pub fn register_driver(driver: &'static dyn DriverImpl) {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.impls.iter().any(|d| d.name() == driver.name()) {
        return;
    }
    registry.impls.push(driver);
}

/// Select the driver backend by mode.
///
/// Devices are only brought up through the selected backend, so the
/// selection must not change once made: switching to a different
/// backend fails with [`Error::AlreadyInitialized`]. Re-selecting the
/// same backend is a no-op.
pub fn set_config(kernel_mode: bool) -> Result<()> {
    let name = if kernel_mode {
        KERNEL_DRIVER_NAME
    } else {
        USERSPACE_DRIVER_NAME
    };

    let mut registry = REGISTRY.lock().unwrap();
    let found = registry.impls.iter().copied().find(|d| d.name() == name);

    if let Some(selected) = registry.selected {
        if selected.name() != name {
            log::error!("cannot change driver backend after devices are initialized");
            return Err(Error::AlreadyInitialized);
        }
        return Ok(());
    }

    match found {
        Some(driver) => {
            registry.selected = Some(driver);
            Ok(())
        }
        None => {
            log::error!("no driver backend registered under {name:?}");
            Err(Error::InvalidArgument(format!(
                "no driver backend registered under {name:?}"
            )))
        }
    }
}

/// Name of the currently selected driver backend, if any.
pub fn selected_driver() -> Option<&'static str> {
    REGISTRY.lock().unwrap().selected.map(|d| d.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDevice;

    fn dsa_config(total_wq_size: u32) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Dsa,
            total_wq_size,
            batch_size: 32,
            pasid_enabled: true,
            aecs_addr: 0,
        }
    }

    #[test]
    fn test_chan_per_device_scaling() {
        let ops: Arc<dyn DeviceOps> = Arc::new(MockDevice::new_pasid());
        let big = Device::new(dsa_config(128), ops.clone());
        assert_eq!(big.chan_per_device(), 8);
        assert_eq!(big.descriptors_per_channel(), 16);

        let small = Device::new(dsa_config(64), ops);
        assert_eq!(small.chan_per_device(), 4);
        assert_eq!(small.descriptors_per_channel(), 16);
    }

    #[test]
    fn test_channel_slot_bitmap() {
        let ops: Arc<dyn DeviceOps> = Arc::new(MockDevice::new_pasid());
        let dev = Device::new(dsa_config(64), ops);

        let a = dev.reserve_channel_slot().unwrap();
        let b = dev.reserve_channel_slot().unwrap();
        assert_ne!(a, b);

        let c = dev.reserve_channel_slot().unwrap();
        let d = dev.reserve_channel_slot().unwrap();
        assert!(matches!(
            dev.reserve_channel_slot(),
            Err(Error::PoolExhausted)
        ));

        dev.release_channel_slot(b);
        assert_eq!(dev.reserve_channel_slot().unwrap(), b);

        dev.release_channel_slot(a);
        dev.release_channel_slot(b);
        dev.release_channel_slot(c);
        dev.release_channel_slot(d);
    }

    #[test]
    fn test_portal_offset_rotation() {
        let ops: Arc<dyn DeviceOps> = Arc::new(MockDevice::new_pasid());
        let dev = Device::new(dsa_config(128), ops);

        let start = dev.portal_offset_for_slot(3);
        assert_eq!(start, 3 * PORTAL_STRIDE);

        // One full cycle returns to the starting offset without ever
        // colliding with another slot's offsets.
        let mut offset = start;
        let mut seen = Vec::new();
        loop {
            seen.push(offset);
            offset = dev.next_portal_offset(offset);
            if offset == start {
                break;
            }
        }
        assert_eq!(seen.len(), PORTAL_SIZE / (8 * PORTAL_STRIDE));
        for off in seen {
            assert_eq!(off % (8 * PORTAL_STRIDE), 3 * PORTAL_STRIDE);
        }
    }

    struct TestDriver(&'static str);
    impl DriverImpl for TestDriver {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    static USER_DRIVER: TestDriver = TestDriver(USERSPACE_DRIVER_NAME);
    static KERNEL_DRIVER: TestDriver = TestDriver(KERNEL_DRIVER_NAME);

    #[test]
    fn test_driver_selection_is_once() {
        register_driver(&USER_DRIVER);
        register_driver(&KERNEL_DRIVER);
        // Duplicate registration keeps the first entry.
        register_driver(&USER_DRIVER);

        set_config(false).unwrap();
        assert_eq!(selected_driver(), Some(USERSPACE_DRIVER_NAME));

        // Re-selecting the same backend is fine.
        set_config(false).unwrap();

        // Changing the backend is not.
        assert!(matches!(set_config(true), Err(Error::AlreadyInitialized)));
        assert_eq!(selected_driver(), Some(USERSPACE_DRIVER_NAME));
    }
}
