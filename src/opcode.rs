// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Accelerator operation codes.
//!
//! DSA opcodes match the Intel DSA Architecture Specification and the
//! Linux kernel's `include/uapi/linux/idxd.h`; the compress/decompress
//! codes are the IAA (In-Memory Analytics Accelerator) assignments.

/// Operation codes placed in bits \[31:24\] of the descriptor's
/// flags/opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// No operation - used for testing/synchronization.
    Noop = 0x00,

    /// Batch operation - execute N descriptors from a list address.
    Batch = 0x01,

    /// Drain - wait for all previous operations to complete.
    Drain = 0x03,

    /// Memory move (copy) operation.
    MemMove = 0x04,

    /// Memory fill operation.
    MemFill = 0x05,

    /// Memory compare operation.
    Compare = 0x06,

    /// Dual-cast memory copy (copy to two destinations).
    Dualcast = 0x0A,

    /// CRC32C generation.
    CrcGen = 0x10,

    /// Copy with CRC32C generation.
    CopyCrc = 0x12,

    /// DIF (Data Integrity Field) check.
    DifCheck = 0x13,

    /// DIF insert.
    DifInsert = 0x14,

    /// DIF strip.
    DifStrip = 0x15,

    /// Cache flush.
    CacheFlush = 0x20,

    /// Decompress (IAA).
    Decompress = 0x42,

    /// Compress (IAA).
    Compress = 0x43,
}

impl Opcode {
    /// Returns the opcode as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable name for the opcode.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::Batch => "BATCH",
            Self::Drain => "DRAIN",
            Self::MemMove => "MEMMOVE",
            Self::MemFill => "MEMFILL",
            Self::Compare => "COMPARE",
            Self::Dualcast => "DUALCAST",
            Self::CrcGen => "CRC_GEN",
            Self::CopyCrc => "COPY_CRC",
            Self::DifCheck => "DIF_CHECK",
            Self::DifInsert => "DIF_INSERT",
            Self::DifStrip => "DIF_STRIP",
            Self::CacheFlush => "CACHE_FLUSH",
            Self::Decompress => "DECOMPRESS",
            Self::Compress => "COMPRESS",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}
