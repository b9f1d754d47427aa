// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! # DSA/IAA Submission & Completion Engine
//!
//! A userspace submission/completion engine for Intel's Data Streaming
//! Accelerator (DSA) and In-Memory Analytics Accelerator (IAA),
//! available on Intel Xeon Scalable processors (4th Gen "Sapphire
//! Rapids" and later).
//!
//! The engine accepts memory-oriented offload requests - block copies,
//! dual-cast copies, fills, compares, CRC32C generation, copy with
//! CRC32C, compress/decompress, and protection-information (PI/DIF)
//! check/insert/strip - builds hardware descriptors for them, submits
//! those descriptors to a work queue through a memory-mapped doorbell,
//! and reaps completions by polling the per-descriptor status bytes the
//! device writes back.
//!
//! Device discovery, PCI/IOMMU attach and PASID acquisition are the
//! driver backend's job: the engine consumes an abstract device handle
//! ([`DeviceOps`]) plus sizing attributes ([`DeviceConfig`]).
//!
//! ## Channels
//!
//! All submission state is per-channel. A channel binds one work-queue
//! slot of a device, preallocates its descriptors, operations and
//! batches up front, and is owned by exactly one thread: submissions
//! and polls never block, and backpressure surfaces as
//! [`Error::PoolExhausted`]. Channels of one device run in parallel on
//! separate threads, each submitting at its own portal offsets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dsa_engine::{Device, DeviceConfig, DeviceKind, DeviceOps, IoVec, OpStatus};
//! use std::sync::Arc;
//!
//! fn copy_callback(_cb_arg: u64, status: OpStatus) {
//!     assert!(status.is_success());
//! }
//!
//! fn offload_copy(ops: Arc<dyn DeviceOps>) -> Result<(), dsa_engine::Error> {
//!     let device = Device::new(
//!         DeviceConfig {
//!             kind: DeviceKind::Dsa,
//!             total_wq_size: 128,
//!             batch_size: 32,
//!             pasid_enabled: true,
//!             aecs_addr: 0,
//!         },
//!         ops,
//!     );
//!     let mut chan = device.acquire_channel()?;
//!
//!     let src = vec![0xA5u8; 8192];
//!     let mut dst = vec![0u8; 8192];
//!     // SAFETY: both buffers outlive the completion callback.
//!     unsafe {
//!         chan.submit_copy(
//!             &[IoVec::from_mut_slice(&mut dst)],
//!             &[IoVec::from_slice(&src)],
//!             dsa_engine::DescriptorFlags::empty(),
//!             Some(copy_callback),
//!             0,
//!         )?;
//!     }
//!     while chan.process_completions() == 0 {
//!         std::hint::spin_loop();
//!     }
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod channel;
pub mod descriptor;
pub mod device;
pub mod dif;
pub mod error;
pub mod iter;
pub mod opcode;
pub mod submit;

mod requests;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenient access
pub use channel::{Channel, ReqCallback, MAX_COMPLETIONS_PER_POLL};
pub use descriptor::{
    CompatHwDesc, CompatStatus, CompletionRecord, CompletionStatus, CompressionFlags,
    DecompressionFlags, DescriptorFlags, HwDesc,
};
pub use device::{
    register_driver, selected_driver, set_config, Device, DeviceConfig, DeviceKind, DeviceOps,
    DriverImpl, KERNEL_DRIVER_NAME, USERSPACE_DRIVER_NAME,
};
pub use dif::{DifCheckFlags, DifCtx, DifType, PiFormat, SourceDifFlags};
pub use error::{Error, OpStatus, Result};
pub use iter::IoVec;
pub use opcode::Opcode;
