// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Low-level doorbell submission: the pre-doorbell store fence and the
//! 64-byte portal write (MOVDIR64B).
//!
//! # Safety
//!
//! These functions are unsafe because:
//! - The portal address must be valid and properly mapped
//! - The descriptor must remain valid during submission
//! - The completion record referenced by the descriptor must remain
//!   valid until the operation completes

use crate::descriptor::HwDesc;

/// Publish all descriptor and completion-record writes before the
/// doorbell write becomes visible to the device.
///
/// The doorbell is a posted store; without this fence the device could
/// observe the doorbell before the descriptor memory it points at.
#[inline]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
}

/// Submit a descriptor to a work-queue portal using MOVDIR64B.
///
/// # Safety
///
/// - `portal` must be a valid memory-mapped portal address (64-byte aligned)
/// - `desc` must be a valid, properly initialized 64-byte descriptor
/// - The completion record referenced by `desc` must remain valid
/// - The CPU must support MOVDIR64B
///
/// # Notes
///
/// MOVDIR64B is a posted write - it does not wait for the device to
/// accept the descriptor. The caller must ensure not to exceed the work
/// queue depth.
///
/// # Instruction Details
///
/// `MOVDIR64B r64, m512` reads 64 bytes from the source memory operand and
/// performs a 64-byte direct-store to the destination address in the register.
/// - Register operand (r64): Contains destination address (portal)
/// - Memory operand (m512): Source of 64 bytes (descriptor)
#[inline]
#[cfg(target_arch = "x86_64")]
pub unsafe fn movdir64b(portal: *mut u8, desc: &HwDesc) {
    // MOVDIR64B instruction encoding:
    // 66 0F 38 F8 /r - MOVDIR64B r64, m512
    //
    // ModR/M byte 0x02:
    //   mod = 00 (memory, no displacement)
    //   reg = 000 (RAX - contains destination address)
    //   r/m = 010 (RDX - memory base for source)
    //
    // This matches Linux kernel's implementation in arch/x86/include/asm/special_insns.h
    core::arch::asm!(
        ".byte 0x66, 0x0f, 0x38, 0xf8, 0x02",
        in("rax") portal,
        in("rdx") desc as *const HwDesc,
        options(nostack, preserves_flags)
    );
}

// `std::arch::is_x86_feature_detected!("movdir64b")` is not recognized by
// this toolchain's feature table, so detect support directly via CPUID
// leaf 7, sub-leaf 0, ECX bit 28 (Intel SDM Vol. 2A).
#[cfg(target_arch = "x86_64")]
fn movdir64b_supported() -> bool {
    use std::sync::OnceLock;
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let result = core::arch::x86_64::__cpuid_count(7, 0);
        (result.ecx & (1 << 28)) != 0
    })
}

/// Write a 64-byte descriptor to a portal address.
///
/// Uses MOVDIR64B when the CPU supports it, which the hardware
/// guarantees to arrive as a single 64-byte transaction. Otherwise the
/// descriptor is emitted as eight 8-byte volatile stores; platforms
/// taking this path must guarantee the portal write remains intact as a
/// single posted transaction (e.g. via write-combining mappings plus a
/// trailing flush), which is outside this crate's control and is the
/// documented fallback contract.
///
/// # Safety
///
/// - `portal` must be valid for 64 bytes of writes and 64-byte aligned
/// - The completion record referenced by `desc` must remain valid
#[inline]
pub unsafe fn portal_write(portal: *mut u8, desc: &HwDesc) {
    #[cfg(target_arch = "x86_64")]
    {
        if movdir64b_supported() {
            movdir64b(portal, desc);
            return;
        }
    }

    let src = desc as *const HwDesc as *const u64;
    let dst = portal as *mut u64;
    for i in 0..8 {
        std::ptr::write_volatile(dst.add(i), std::ptr::read(src.add(i)));
    }
}
