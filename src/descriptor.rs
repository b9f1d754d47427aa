// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Hardware descriptor and completion record structures.
//!
//! These structures match the hardware layout defined in the Intel DSA
//! Architecture Specification. All multi-byte fields are little-endian
//! and every offset is ABI with the device; none of them may move.

use crate::opcode::Opcode;
use bitflags::bitflags;

bitflags! {
    /// Descriptor flags (bits 0-23 of the flags/opcode field).
    ///
    /// The bit assignments are ABI with the hardware and must not be
    /// renumbered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        /// Request completion record.
        const REQUEST_COMPLETION = 1 << 0;
        /// Request completion interrupt.
        const COMPLETION_INTERRUPT = 1 << 1;
        /// Fence - wait for previous descriptors in the batch/queue.
        const FENCE = 1 << 2;
        /// Block on fault - don't return partial completion on page fault.
        const BLOCK_ON_FAULT = 1 << 3;
        /// Read source 2 as the AECS block (IAA compress).
        const SRC2_AECS = 1 << 4;
        /// Destination is steering tag.
        const DEST_STEERING_TAG = 1 << 5;
        /// Completion record address is valid.
        const CR_ADDR_VALID = 1 << 6;
        /// Request status writeback.
        const STATUS_WRITEBACK = 1 << 7;
        /// Destination readback.
        const DEST_READBACK = 1 << 8;
        /// Cache control - write destination back into cache.
        const CACHE_CTRL = 1 << 9;
        /// CRC descriptors: read the seed from the address in the
        /// crc32c field instead of using the inline seed value.
        const CRC_READ_CRC_SEED = 1 << 16;
    }
}

bitflags! {
    /// IAA compress flag word (aliases the interrupt handle field).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompressionFlags: u16 {
        /// Flush remaining output bits at end of input.
        const FLUSH_OUTPUT = 1 << 1;
        /// Append an end-of-block code to the output stream.
        const APPEND_EOB = 1 << 2;
    }
}

bitflags! {
    /// IAA decompress flag word (aliases the interrupt handle field).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DecompressionFlags: u16 {
        /// Enable the decompressor.
        const ENABLE = 1 << 0;
        /// Flush remaining output bits at end of input.
        const FLUSH_OUTPUT = 1 << 1;
        /// Verify the stream ends with an end-of-block code.
        const CHECK_FOR_EOB = 1 << 2;
        /// Stop consuming input at the first end-of-block code.
        const STOP_ON_EOB = 1 << 3;
    }
}

/// 64-byte hardware descriptor.
///
/// Submitted to the device with a single 64-byte store (MOVDIR64B).
/// Must be 64-byte aligned.
///
/// # Layout
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0  | 4  | PASID / privilege |
/// | 4  | 4  | flags (bits 23:0), opcode (bits 31:24) |
/// | 8  | 8  | completion record address |
/// | 16 | 8  | source 1 (aliases: fill pattern, batch descriptor list) |
/// | 24 | 8  | destination 1 (alias: compare source 2) |
/// | 32 | 4  | transfer size (alias: batch descriptor count) |
/// | 36 | 2  | interrupt handle (alias: IAA compress/decompress flags) |
/// | 38 | 2  | reserved |
/// | 40 | 24 | op-specific (dest2, crc32c, DIF, IAA fields) |
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct HwDesc {
    /// PASID (Process Address Space ID) and privilege level.
    pub pasid: u32,

    /// Flags (bits [23:0]) and opcode (bits [31:24]).
    pub flags_opcode: u32,

    /// Address of completion record (must be 32-byte aligned).
    ///
    /// Latched once at pool initialization and preserved across every
    /// reuse of the descriptor.
    pub completion_addr: u64,

    /// Source address. For MemFill this holds the 64-bit pattern; for
    /// Batch it holds the physical descriptor-list address.
    pub src_addr: u64,

    /// Destination address. For Compare this holds the second source.
    pub dst_addr: u64,

    /// Transfer size in bytes. For Batch this holds the descriptor count.
    pub xfer_size: u32,

    /// Interrupt handle; IAA descriptors alias their compress or
    /// decompress flag word here.
    pub int_handle: u16,

    reserved1: u16,

    /// Operation-specific fields (bytes 40-63), accessed through the
    /// typed setters below.
    op_specific: [u8; 24],
}

impl HwDesc {
    /// Create a new zeroed descriptor.
    #[inline]
    pub const fn new() -> Self {
        Self {
            pasid: 0,
            flags_opcode: 0,
            completion_addr: 0,
            src_addr: 0,
            dst_addr: 0,
            xfer_size: 0,
            int_handle: 0,
            reserved1: 0,
            op_specific: [0; 24],
        }
    }

    /// Zero every field except the completion record address.
    ///
    /// Pool reuse path: the completion address is established once at
    /// channel creation and must survive for the descriptor's lifetime.
    #[inline]
    pub fn reset_preserving_completion(&mut self) {
        let comp_addr = self.completion_addr;
        *self = Self::new();
        self.completion_addr = comp_addr;
    }

    /// Set the opcode for this descriptor.
    #[inline]
    pub fn set_opcode(&mut self, opcode: Opcode) {
        // Opcode is in bits [31:24]
        self.flags_opcode = (self.flags_opcode & 0x00FF_FFFF) | ((opcode.as_u8() as u32) << 24);
    }

    /// Get the opcode from this descriptor.
    #[inline]
    pub fn opcode(&self) -> u8 {
        (self.flags_opcode >> 24) as u8
    }

    /// Set descriptor flags, replacing any previous flags.
    #[inline]
    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        // Flags are in bits [23:0]
        self.flags_opcode = (self.flags_opcode & 0xFF00_0000) | (flags.bits() & 0x00FF_FFFF);
    }

    /// Add descriptor flags (OR with existing).
    #[inline]
    pub fn add_flags(&mut self, flags: DescriptorFlags) {
        self.flags_opcode |= flags.bits() & 0x00FF_FFFF;
    }

    /// Toggle descriptor flags (XOR with existing).
    ///
    /// Writing opcodes toggle [`DescriptorFlags::CACHE_CTRL`] through
    /// this, so a caller-supplied CACHE_CTRL inverts the default.
    #[inline]
    pub fn toggle_flags(&mut self, flags: DescriptorFlags) {
        self.flags_opcode ^= flags.bits() & 0x00FF_FFFF;
    }

    /// Get the current flags.
    #[inline]
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.flags_opcode & 0x00FF_FFFF)
    }

    #[inline]
    fn put_u16(&mut self, off: usize, v: u16) {
        self.op_specific[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_u32(&mut self, off: usize, v: u32) {
        self.op_specific[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, off: usize, v: u64) {
        self.op_specific[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.op_specific[off], self.op_specific[off + 1]])
    }

    #[inline]
    fn get_u32(&self, off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.op_specific[off..off + 4]);
        u32::from_le_bytes(bytes)
    }

    #[inline]
    fn get_u64(&self, off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.op_specific[off..off + 8]);
        u64::from_le_bytes(bytes)
    }

    // Dual-cast: second destination at bytes 40-47.

    /// Set the second destination address (dual-cast).
    #[inline]
    pub fn set_dest2(&mut self, addr: u64) {
        self.put_u64(0, addr);
    }

    /// Get the second destination address (dual-cast).
    #[inline]
    pub fn dest2(&self) -> u64 {
        self.get_u64(0)
    }

    // CRC32C: seed value or seed address at bytes 40-47. The address
    // form is selected by DescriptorFlags::CRC_READ_CRC_SEED.

    /// Set the inline CRC seed (first descriptor of a chain).
    #[inline]
    pub fn set_crc_seed(&mut self, seed: u32) {
        self.put_u64(0, seed as u64);
    }

    /// Get the inline CRC seed.
    #[inline]
    pub fn crc_seed(&self) -> u32 {
        self.get_u64(0) as u32
    }

    /// Set the address the device reads the CRC seed from
    /// (chained descriptors; pairs with CRC_READ_CRC_SEED).
    #[inline]
    pub fn set_crc_addr(&mut self, addr: u64) {
        self.put_u64(0, addr);
    }

    /// Get the CRC seed address.
    #[inline]
    pub fn crc_addr(&self) -> u64 {
        self.get_u64(0)
    }

    // DIF check/insert/strip: source flags at byte 40, block-size flags
    // at byte 42, reference tag seed at bytes 48-51, application tag
    // mask at 52-53, application tag seed at 54-55.

    /// Set the source-DIF flag byte (check and strip only).
    #[inline]
    pub fn set_dif_src_flags(&mut self, flags: u8) {
        self.op_specific[0] = flags;
    }

    /// Get the source-DIF flag byte.
    #[inline]
    pub fn dif_src_flags(&self) -> u8 {
        self.op_specific[0]
    }

    /// Set the DIF flag byte (block-size class).
    #[inline]
    pub fn set_dif_flags(&mut self, flags: u8) {
        self.op_specific[2] = flags;
    }

    /// Get the DIF flag byte.
    #[inline]
    pub fn dif_flags(&self) -> u8 {
        self.op_specific[2]
    }

    /// Set the reference tag seed.
    #[inline]
    pub fn set_dif_ref_tag_seed(&mut self, seed: u32) {
        self.put_u32(8, seed);
    }

    /// Get the reference tag seed.
    #[inline]
    pub fn dif_ref_tag_seed(&self) -> u32 {
        self.get_u32(8)
    }

    /// Set the application tag mask.
    #[inline]
    pub fn set_dif_app_tag_mask(&mut self, mask: u16) {
        self.put_u16(12, mask);
    }

    /// Get the application tag mask.
    #[inline]
    pub fn dif_app_tag_mask(&self) -> u16 {
        self.get_u16(12)
    }

    /// Set the application tag seed.
    #[inline]
    pub fn set_dif_app_tag_seed(&mut self, seed: u16) {
        self.put_u16(14, seed);
    }

    /// Get the application tag seed.
    #[inline]
    pub fn dif_app_tag_seed(&self) -> u16 {
        self.get_u16(14)
    }

    // IAA: maximum destination size at bytes 40-43, source-2 size at
    // 44-47, source-2 address at 56-63.

    /// Set the maximum destination size (IAA bound check).
    #[inline]
    pub fn set_iaa_max_dst_size(&mut self, size: u32) {
        self.put_u32(0, size);
    }

    /// Get the maximum destination size.
    #[inline]
    pub fn iaa_max_dst_size(&self) -> u32 {
        self.get_u32(0)
    }

    /// Set the source-2 size (AECS block size for compress).
    #[inline]
    pub fn set_iaa_src2_size(&mut self, size: u32) {
        self.put_u32(4, size);
    }

    /// Set the source-2 address (AECS block for compress).
    #[inline]
    pub fn set_iaa_src2_addr(&mut self, addr: u64) {
        self.put_u64(16, addr);
    }

    /// Get the source-2 address.
    #[inline]
    pub fn iaa_src2_addr(&self) -> u64 {
        self.get_u64(16)
    }

    /// Set the IAA compress flag word.
    #[inline]
    pub fn set_compression_flags(&mut self, flags: CompressionFlags) {
        self.int_handle = flags.bits();
    }

    /// Set the IAA decompress flag word.
    #[inline]
    pub fn set_decompression_flags(&mut self, flags: DecompressionFlags) {
        self.int_handle = flags.bits();
    }
}

impl Default for HwDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// 64-byte completion record, written by the device.
///
/// Must be 32-byte aligned; the `status` field is the last byte the
/// device writes and must be read with volatile semantics. DSA devices
/// write the first 32 bytes; IAA devices use the full 64 (notably the
/// output size). The layout is a superset serving both.
///
/// # Layout
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0  | 1 | status |
/// | 1  | 1 | result (compare outcome, DIF detail) |
/// | 2  | 2 | reserved |
/// | 4  | 4 | bytes_completed |
/// | 8  | 8 | fault_addr |
/// | 16 | 4 | crc32c_val |
/// | 20 | 4 | reserved |
/// | 24 | 4 | output_size (IAA) |
/// | 28 | 36 | reserved / operation-specific |
#[derive(Debug, Clone, Copy)]
#[repr(C, align(32))]
pub struct CompletionRecord {
    /// Completion status (non-zero when complete).
    /// Use volatile read via `raw_status()`.
    pub status: u8,

    /// Result code (operation-specific).
    /// - For Compare: 0 = equal, non-zero = not equal
    pub result: u8,

    reserved1: u16,

    /// Number of bytes completed (for partial completions on page fault).
    pub bytes_completed: u32,

    /// Fault address (if a page fault occurred).
    pub fault_addr: u64,

    /// Raw CRC32C accumulator value. The device reports the
    /// non-inverted form; the poller inverts before handing it to the
    /// caller.
    pub crc32c_val: u32,

    reserved2: u32,

    /// Compressed/decompressed output size (IAA).
    pub output_size: u32,

    reserved3: [u8; 36],
}

impl CompletionRecord {
    /// Byte offset of `crc32c_val`; chained CRC descriptors point their
    /// seed address at `completion_addr + CRC32C_OFFSET`.
    pub const CRC32C_OFFSET: u64 = 16;

    /// Completion record footprint of a DSA device.
    pub const DSA_SIZE: usize = 32;

    /// Completion record footprint of an IAA device.
    pub const IAA_SIZE: usize = 64;

    /// Create a new zeroed completion record.
    #[inline]
    pub const fn new() -> Self {
        Self {
            status: 0,
            result: 0,
            reserved1: 0,
            bytes_completed: 0,
            fault_addr: 0,
            crc32c_val: 0,
            reserved2: 0,
            output_size: 0,
            reserved3: [0; 36],
        }
    }

    /// Read the raw status byte with volatile semantics.
    #[inline]
    pub fn raw_status(&self) -> u8 {
        // The device writes this field asynchronously; a volatile read
        // keeps the compiler from caching it across poll iterations.
        unsafe { std::ptr::read_volatile(&self.status) }
    }

    /// Check if the operation has completed (volatile read).
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.raw_status() != 0
    }

    /// Get the decoded completion status (volatile read).
    #[inline]
    pub fn get_status(&self) -> CompletionStatus {
        CompletionStatus::from(self.raw_status())
    }
}

impl Default for CompletionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Operation not yet complete.
    Pending,
    /// Operation completed successfully.
    Success,
    /// Page fault occurred.
    PageFault,
    /// Protection-information check failed.
    DifError,
    /// Invalid flags in descriptor.
    InvalidFlags,
    /// Unsupported operation.
    UnsupportedOp,
    /// Invalid transfer size.
    InvalidSize,
    /// Invalid completion record address.
    InvalidCompletionAddr,
    /// Hardware error.
    HardwareError,
    /// Unknown status code.
    Unknown(u8),
}

impl CompletionStatus {
    /// Raw status byte the device writes for a DIF failure.
    pub const DIF_ERROR: u8 = 0x09;

    /// Returns true if the raw status byte indicates a failed (not
    /// pending, not successful) operation. Success is exactly 1.
    #[inline]
    pub fn is_failure_code(raw: u8) -> bool {
        raw > 1
    }
}

impl From<u8> for CompletionStatus {
    fn from(status: u8) -> Self {
        match status {
            0x00 => Self::Pending,
            0x01 => Self::Success,
            0x03 => Self::PageFault,
            0x09 => Self::DifError,
            0x10 => Self::InvalidFlags,
            0x11 => Self::UnsupportedOp,
            0x13 => Self::InvalidSize,
            0x19 => Self::InvalidCompletionAddr,
            0x1F => Self::HardwareError,
            _ => Self::Unknown(status),
        }
    }
}

/// 32-byte descriptor for compatibility-minimal DMA engines that share
/// the doorbell submission model but not the full 64-byte layout.
///
/// Eight 32-bit little-endian words:
///
/// | Word | Field |
/// |------|-------|
/// | 0 | source/destination memory type and control bits |
/// | 1 | descriptor id, error code, status |
/// | 2 | length |
/// | 3 | reserved |
/// | 4 | upper 32 bits of source pointer |
/// | 5 | lower 32 bits of source pointer |
/// | 6 | upper 32 bits of destination pointer |
/// | 7 | lower 32 bits of destination pointer |
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct CompatHwDesc {
    /// Memory types and control bits.
    pub control: u32,
    /// Descriptor id (bits 15:0), error code (23:16), status (31:24).
    pub id_error_status: u32,
    /// Transfer length in bytes.
    pub length: u32,
    reserved: u32,
    /// Upper half of the source pointer.
    pub src_hi: u32,
    /// Lower half of the source pointer.
    pub src_lo: u32,
    /// Upper half of the destination pointer.
    pub dst_hi: u32,
    /// Lower half of the destination pointer.
    pub dst_lo: u32,
}

impl CompatHwDesc {
    /// Build a copy descriptor for the compatibility subset.
    pub fn copy(dst: u64, src: u64, length: u32) -> Self {
        Self {
            control: 0,
            id_error_status: 0,
            length,
            reserved: 0,
            src_hi: (src >> 32) as u32,
            src_lo: src as u32,
            dst_hi: (dst >> 32) as u32,
            dst_lo: dst as u32,
        }
    }

    /// Source pointer reassembled from its halves.
    #[inline]
    pub fn src_addr(&self) -> u64 {
        ((self.src_hi as u64) << 32) | self.src_lo as u64
    }

    /// Destination pointer reassembled from its halves.
    #[inline]
    pub fn dst_addr(&self) -> u64 {
        ((self.dst_hi as u64) << 32) | self.dst_lo as u64
    }

    /// In-descriptor progress status (bits 31:24 of word 1).
    #[inline]
    pub fn status(&self) -> CompatStatus {
        CompatStatus::from((self.id_error_status >> 24) as u8)
    }
}

/// Progress states of a compatibility-subset descriptor; unlike the
/// primary device, this engine class reports progress inside the
/// descriptor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatStatus {
    Submitted,
    Validated,
    Processed,
    Completed,
    Error,
    Unknown(u8),
}

impl From<u8> for CompatStatus {
    fn from(status: u8) -> Self {
        match status {
            0 => Self::Submitted,
            1 => Self::Validated,
            2 => Self::Processed,
            3 => Self::Completed,
            4 => Self::Error,
            _ => Self::Unknown(status),
        }
    }
}

// Compile-time size and alignment checks per the DSA architecture spec
const _: () = assert!(std::mem::size_of::<HwDesc>() == 64);
const _: () = assert!(std::mem::align_of::<HwDesc>() == 64);
const _: () = assert!(std::mem::size_of::<CompletionRecord>() == 64);
const _: () = assert!(std::mem::align_of::<CompletionRecord>() == 32);
const _: () = assert!(std::mem::size_of::<CompatHwDesc>() == 32);
