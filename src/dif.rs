// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Protection Information (PI/DIF) context and parameter validation.
//!
//! The accelerator's DIF engine supports a strict subset of the general
//! PI parameter space: 16-bit guard format, metadata interleaved with
//! data, 8- or 16-byte metadata (16-byte only right-aligned), and
//! 512/4096-byte data blocks. Everything else is rejected before a
//! descriptor is built.

use crate::error::{Error, Result};
use crate::iter::IoVec;
use bitflags::bitflags;

const DATA_BLOCK_SIZE_512: u32 = 512;
const DATA_BLOCK_SIZE_520: u32 = 520;
const DATA_BLOCK_SIZE_4096: u32 = 4096;
const DATA_BLOCK_SIZE_4104: u32 = 4104;

const METADATA_SIZE_8: u32 = 8;
const METADATA_SIZE_16: u32 = 16;

bitflags! {
    /// Which PI fields the device verifies or generates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DifCheckFlags: u32 {
        /// Verify/generate the guard (CRC-16) field.
        const GUARD = 1 << 0;
        /// Verify/generate the application tag.
        const APP_TAG = 1 << 1;
        /// Verify/generate the reference tag.
        const REF_TAG = 1 << 2;
    }
}

bitflags! {
    /// Source-DIF flag byte of check/strip descriptors (hardware ABI).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceDifFlags: u8 {
        /// Skip reference tag verification.
        const REF_TAG_CHECK_DISABLE = 1 << 2;
        /// Skip guard verification.
        const GUARD_CHECK_DISABLE = 1 << 3;
        /// Types 1/2: all checks disabled when app tag is 0xFFFF.
        const APP_TAG_F_DETECT = 1 << 4;
        /// Type 3: all checks disabled when app tag is 0xFFFF and
        /// reference tag is 0xFFFFFFFF.
        const APP_AND_REF_TAG_F_DETECT = 1 << 5;
    }
}

/// Protection Information type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifType {
    Type1,
    Type2,
    Type3,
}

/// On-disk PI field width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiFormat {
    /// 16-bit guard, 16-bit application tag, 32-bit reference tag.
    Pi16,
    /// 32-bit guard variant.
    Pi32,
    /// 64-bit guard variant.
    Pi64,
}

/// Parameters of one DIF operation, shared by every block it covers.
#[derive(Debug, Clone)]
pub struct DifCtx {
    /// Block size including metadata.
    pub block_size: u32,
    /// Metadata size in bytes.
    pub md_size: u32,
    /// Metadata interleaved with data (as opposed to a separate buffer).
    pub md_interleave: bool,
    /// Byte interval covered by the guard computation.
    pub guard_interval: u32,
    /// PI type.
    pub dif_type: DifType,
    /// Which fields to verify/generate.
    pub dif_flags: DifCheckFlags,
    /// Initial reference tag for the first block.
    pub init_ref_tag: u32,
    /// Application tag value.
    pub app_tag: u16,
    /// Application tag bits the caller cares about.
    pub apptag_mask: u16,
    /// Byte offset of this request from the start of the whole stream.
    pub data_offset: u32,
    /// Seed for the guard computation.
    pub guard_seed: u16,
    /// PI field width.
    pub pi_format: PiFormat,
}

impl DifCtx {
    /// Build a context. `dif_loc_start` places the PI at the start of
    /// the metadata (left-aligned) instead of its tail.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_size: u32,
        md_size: u32,
        md_interleave: bool,
        dif_loc_start: bool,
        dif_type: DifType,
        dif_flags: DifCheckFlags,
        init_ref_tag: u32,
        apptag_mask: u16,
        app_tag: u16,
        data_offset: u32,
        guard_seed: u16,
        pi_format: PiFormat,
    ) -> Self {
        // Right-aligned PI occupies the last 8 bytes of the block, so
        // the guard covers everything up to it.
        let guard_interval = if dif_loc_start {
            block_size - md_size
        } else {
            block_size - 8
        };
        Self {
            block_size,
            md_size,
            md_interleave,
            guard_interval,
            dif_type,
            dif_flags,
            init_ref_tag,
            app_tag,
            apptag_mask,
            data_offset,
            guard_seed,
            pi_format,
        }
    }

    /// Block size without metadata.
    #[inline]
    pub fn data_block_size(&self) -> u32 {
        self.block_size - self.md_size
    }
}

/// Map the guard interval onto the descriptor's block-size class.
pub(crate) fn dif_flags(ctx: &DifCtx) -> Result<u8> {
    let flags = match ctx.guard_interval {
        DATA_BLOCK_SIZE_512 => 0b00,
        DATA_BLOCK_SIZE_520 => 0b01,
        DATA_BLOCK_SIZE_4096 => 0b10,
        DATA_BLOCK_SIZE_4104 => 0b11,
        other => {
            log::error!("invalid DIF guard interval {other}");
            return Err(Error::InvalidArgument(format!(
                "unsupported DIF guard interval {other}"
            )));
        }
    };
    Ok(flags)
}

/// Derive the source-DIF flag byte from the context.
pub(crate) fn source_dif_flags(ctx: &DifCtx) -> SourceDifFlags {
    let mut flags = SourceDifFlags::empty();

    if !ctx.dif_flags.contains(DifCheckFlags::GUARD) {
        flags |= SourceDifFlags::GUARD_CHECK_DISABLE;
    }
    if !ctx.dif_flags.contains(DifCheckFlags::REF_TAG) {
        flags |= SourceDifFlags::REF_TAG_CHECK_DISABLE;
    }

    match ctx.dif_type {
        // Types 1 and 2 disable all checks when the application tag
        // reads 0xFFFF.
        DifType::Type1 | DifType::Type2 => flags |= SourceDifFlags::APP_TAG_F_DETECT,
        // Type 3 additionally requires the reference tag to read
        // 0xFFFFFFFF.
        DifType::Type3 => flags |= SourceDifFlags::APP_AND_REF_TAG_F_DETECT,
    }

    flags
}

/// Derive the application tag mask written to the descriptor.
pub(crate) fn app_tag_mask(ctx: &DifCtx) -> u16 {
    if !ctx.dif_flags.contains(DifCheckFlags::APP_TAG) {
        // An all-ones mask disables application tag checking.
        0xFFFF
    } else {
        !ctx.apptag_mask
    }
}

/// Parameter subset the device supports, common to check/insert/strip.
pub(crate) fn validate_common_params(ctx: &DifCtx) -> Result<()> {
    let data_block_size = ctx.data_block_size();

    if ctx.data_offset != 0 {
        log::error!("DIF data offset must be 0");
        return Err(Error::InvalidArgument(
            "byte offset from the start of the whole data buffer must be 0".into(),
        ));
    }

    if ctx.guard_seed != 0 {
        log::error!("DIF guard seed must be 0");
        return Err(Error::InvalidArgument(
            "seed value for guard computation must be 0".into(),
        ));
    }

    if ctx.md_size != METADATA_SIZE_8 && ctx.md_size != METADATA_SIZE_16 {
        log::error!("metadata size {} is not supported", ctx.md_size);
        return Err(Error::InvalidArgument(format!(
            "metadata size {} is not supported",
            ctx.md_size
        )));
    }

    if ctx.pi_format != PiFormat::Pi16 {
        log::error!("DIF PI format {:?} is not supported", ctx.pi_format);
        return Err(Error::InvalidArgument(format!(
            "DIF PI format {:?} is not supported",
            ctx.pi_format
        )));
    }

    if !ctx.md_interleave {
        log::error!("separated metadata location is not supported");
        return Err(Error::InvalidArgument(
            "separated metadata location is not supported".into(),
        ));
    }

    if ctx.md_size == METADATA_SIZE_16
        && (ctx.guard_interval == DATA_BLOCK_SIZE_512 || ctx.guard_interval == DATA_BLOCK_SIZE_4096)
    {
        log::error!("DIF left alignment in metadata is not supported");
        return Err(Error::InvalidArgument(
            "DIF left alignment in metadata is not supported".into(),
        ));
    }

    if data_block_size != DATA_BLOCK_SIZE_512 && data_block_size != DATA_BLOCK_SIZE_4096 {
        log::error!("DIF block size {data_block_size} is not supported");
        return Err(Error::InvalidArgument(format!(
            "DIF block size {data_block_size} is not supported"
        )));
    }

    Ok(())
}

pub(crate) fn validate_check_params(ctx: &DifCtx) -> Result<()> {
    validate_common_params(ctx)
}

/// Insert generates all three PI fields, so all three check flags must
/// be requested.
pub(crate) fn validate_insert_params(ctx: &DifCtx) -> Result<()> {
    validate_common_params(ctx)?;

    if !ctx.dif_flags.contains(DifCheckFlags::GUARD) {
        log::error!("guard check flag must be set");
        return Err(Error::InvalidArgument("guard check flag must be set".into()));
    }
    if !ctx.dif_flags.contains(DifCheckFlags::APP_TAG) {
        log::error!("application tag check flag must be set");
        return Err(Error::InvalidArgument(
            "application tag check flag must be set".into(),
        ));
    }
    if !ctx.dif_flags.contains(DifCheckFlags::REF_TAG) {
        log::error!("reference tag check flag must be set");
        return Err(Error::InvalidArgument(
            "reference tag check flag must be set".into(),
        ));
    }

    Ok(())
}

/// The device processes each iovec element independently; an element
/// must hold a whole number of blocks (with metadata).
pub(crate) fn validate_check_buf_align(ctx: &DifCtx, len: u64) -> Result<()> {
    if len % ctx.block_size as u64 != 0 {
        log::error!(
            "buffer length {len} is not a multiple of block size with metadata {}",
            ctx.block_size
        );
        return Err(Error::InvalidArgument(format!(
            "buffer length {len} is not a multiple of block size with metadata {}",
            ctx.block_size
        )));
    }
    Ok(())
}

/// Insert walks the source and destination lists pairwise; the lists
/// must pair up and each destination element must add exactly the
/// metadata of the blocks its source element holds.
pub(crate) fn validate_insert_iovecs(ctx: &DifCtx, dst: &[IoVec], src: &[IoVec]) -> Result<()> {
    let data_block_size = ctx.data_block_size() as u64;

    if dst.len() != src.len() {
        log::error!(
            "invalid number of elements in src ({}) and dst ({}) iovecs",
            src.len(),
            dst.len()
        );
        return Err(Error::InvalidArgument(format!(
            "invalid number of elements in src ({}) and dst ({}) iovecs",
            src.len(),
            dst.len()
        )));
    }

    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        let num_blocks = s.len() / data_block_size;
        if s.len() + num_blocks * ctx.md_size as u64 != d.len() {
            log::error!(
                "invalid length of data in src ({}) and dst ({}) in iovecs[{i}]",
                s.len(),
                d.len()
            );
            return Err(Error::InvalidArgument(format!(
                "invalid length of data in src ({}) and dst ({}) in iovecs[{i}]",
                s.len(),
                d.len()
            )));
        }
    }

    Ok(())
}

/// Insert reads bare data blocks and writes protected blocks; both
/// sides must describe the same number of blocks.
pub(crate) fn validate_insert_buf_align(ctx: &DifCtx, src_len: u64, dst_len: u64) -> Result<()> {
    let data_block_size = ctx.data_block_size() as u64;
    let block_size = ctx.block_size as u64;

    if src_len % data_block_size != 0 {
        log::error!(
            "source length {src_len} is not a multiple of block size without metadata {data_block_size}"
        );
        return Err(Error::InvalidArgument(format!(
            "source length {src_len} is not a multiple of block size without metadata {data_block_size}"
        )));
    }
    if dst_len % block_size != 0 {
        log::error!(
            "destination length {dst_len} is not a multiple of block size with metadata {block_size}"
        );
        return Err(Error::InvalidArgument(format!(
            "destination length {dst_len} is not a multiple of block size with metadata {block_size}"
        )));
    }
    if src_len / data_block_size != dst_len / block_size {
        log::error!("source and destination must hold the same number of blocks");
        return Err(Error::InvalidArgument(format!(
            "source ({}) and destination ({}) must hold the same number of blocks",
            src_len / data_block_size,
            dst_len / block_size
        )));
    }
    Ok(())
}

/// Strip is the inverse of insert: protected source, bare destination.
pub(crate) fn validate_strip_buf_align(ctx: &DifCtx, src_len: u64, dst_len: u64) -> Result<()> {
    let data_block_size = ctx.data_block_size() as u64;
    let block_size = ctx.block_size as u64;

    if src_len % block_size != 0 {
        log::error!("source length {src_len} is not a multiple of block size {block_size}");
        return Err(Error::InvalidArgument(format!(
            "source length {src_len} is not a multiple of block size {block_size}"
        )));
    }
    if dst_len % data_block_size != 0 {
        log::error!(
            "destination length {dst_len} is not a multiple of block size without metadata {data_block_size}"
        );
        return Err(Error::InvalidArgument(format!(
            "destination length {dst_len} is not a multiple of block size without metadata {data_block_size}"
        )));
    }
    if src_len / block_size != dst_len / data_block_size {
        log::error!("source and destination must hold the same number of blocks");
        return Err(Error::InvalidArgument(format!(
            "source ({}) and destination ({}) must hold the same number of blocks",
            src_len / block_size,
            dst_len / data_block_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CHECKS: DifCheckFlags = DifCheckFlags::all();

    fn ctx(block_size: u32, md_size: u32) -> DifCtx {
        DifCtx::new(
            block_size,
            md_size,
            true,
            false,
            DifType::Type1,
            ALL_CHECKS,
            0,
            0,
            0,
            0,
            0,
            PiFormat::Pi16,
        )
    }

    #[test]
    fn test_validate_common_params_supported_geometries() {
        // All supported combinations of data block and metadata size.
        assert!(validate_common_params(&ctx(512 + 8, 8)).is_ok());
        assert!(validate_common_params(&ctx(512 + 16, 16)).is_ok());
        assert!(validate_common_params(&ctx(4096 + 8, 8)).is_ok());
        assert!(validate_common_params(&ctx(4096 + 16, 16)).is_ok());
    }

    #[test]
    fn test_validate_common_params_rejects_data_offset() {
        let mut c = ctx(512 + 8, 8);
        c.data_offset = 10;
        assert!(matches!(
            validate_common_params(&c),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_common_params_rejects_guard_seed() {
        let mut c = ctx(512 + 8, 8);
        c.guard_seed = 10;
        assert!(validate_common_params(&c).is_err());
    }

    #[test]
    fn test_validate_common_params_rejects_md_size() {
        assert!(validate_common_params(&ctx(4096 + 32, 32)).is_err());
    }

    #[test]
    fn test_validate_common_params_rejects_separate_metadata() {
        let mut c = ctx(4096 + 16, 16);
        c.md_interleave = false;
        assert!(validate_common_params(&c).is_err());
    }

    #[test]
    fn test_validate_common_params_rejects_left_alignment() {
        // Left-aligned PI with 16-byte metadata puts the guard interval
        // on the bare data block size.
        let c = DifCtx::new(
            4096 + 16,
            16,
            true,
            true,
            DifType::Type1,
            ALL_CHECKS,
            0,
            0,
            0,
            0,
            0,
            PiFormat::Pi16,
        );
        assert_eq!(c.guard_interval, 4096);
        assert!(validate_common_params(&c).is_err());
    }

    #[test]
    fn test_validate_common_params_rejects_block_size() {
        assert!(validate_common_params(&ctx(512 + 10, 8)).is_err());
    }

    #[test]
    fn test_validate_common_params_rejects_pi_format() {
        let mut c = ctx(4096 + 16, 16);
        c.pi_format = PiFormat::Pi32;
        assert!(validate_common_params(&c).is_err());
        c.pi_format = PiFormat::Pi64;
        assert!(validate_common_params(&c).is_err());
    }

    #[test]
    fn test_validate_check_params() {
        let mut c = ctx(512 + 8, 8);
        c.dif_flags = DifCheckFlags::GUARD | DifCheckFlags::REF_TAG;
        assert!(validate_check_params(&c).is_ok());
    }

    #[test]
    fn test_validate_insert_params_requires_all_checks() {
        assert!(validate_insert_params(&ctx(512 + 8, 8)).is_ok());

        for missing in [
            DifCheckFlags::GUARD,
            DifCheckFlags::APP_TAG,
            DifCheckFlags::REF_TAG,
        ] {
            let mut c = ctx(512 + 8, 8);
            c.dif_flags = ALL_CHECKS - missing;
            assert!(validate_insert_params(&c).is_err());
        }
    }

    #[test]
    fn test_validate_check_buf_align() {
        let c = ctx(512 + 8, 8);
        assert!(validate_check_buf_align(&c, 4 * (512 + 8)).is_ok());
        assert!(validate_check_buf_align(&c, 4 * (512 + 8) + 10).is_err());
    }

    #[test]
    fn test_validate_insert_buf_align() {
        let c = ctx(512 + 8, 8);
        assert!(validate_insert_buf_align(&c, 4 * 512, 4 * 520).is_ok());
        // Source not a multiple of the bare block size.
        assert!(validate_insert_buf_align(&c, 4 * 512 + 1, 4 * 520).is_err());
        // Block count mismatch.
        assert!(validate_insert_buf_align(&c, 4 * 512, 5 * 520).is_err());
    }

    #[test]
    fn test_validate_insert_iovecs() {
        let c = ctx(512 + 8, 8);
        let src = [IoVec::new(0x1000 as *mut u8, 2 * 512)];
        let dst = [IoVec::new(0x9000 as *mut u8, 2 * 520)];
        assert!(validate_insert_iovecs(&c, &dst, &src).is_ok());

        let dst_short = [IoVec::new(0x9000 as *mut u8, 2 * 512)];
        assert!(validate_insert_iovecs(&c, &dst_short, &src).is_err());

        let dst_count = [
            IoVec::new(0x9000 as *mut u8, 520),
            IoVec::new(0xA000 as *mut u8, 520),
        ];
        assert!(validate_insert_iovecs(&c, &dst_count, &src).is_err());
    }

    #[test]
    fn test_validate_strip_buf_align() {
        let c = ctx(512 + 8, 8);
        assert!(validate_strip_buf_align(&c, 4 * 520, 4 * 512).is_ok());
        assert!(validate_strip_buf_align(&c, 4 * 520 + 8, 4 * 512).is_err());
        assert!(validate_strip_buf_align(&c, 4 * 520, 3 * 512).is_err());
    }

    #[test]
    fn test_dif_flags_block_size_classes() {
        assert_eq!(dif_flags(&ctx(512 + 8, 8)).unwrap(), 0b00);
        assert_eq!(dif_flags(&ctx(512 + 16, 16)).unwrap(), 0b01);
        assert_eq!(dif_flags(&ctx(4096 + 8, 8)).unwrap(), 0b10);
        assert_eq!(dif_flags(&ctx(4096 + 16, 16)).unwrap(), 0b11);

        let mut c = ctx(512 + 8, 8);
        c.guard_interval = 100;
        assert!(dif_flags(&c).is_err());
    }

    #[test]
    fn test_source_dif_flags_derivation() {
        let c = ctx(512 + 8, 8);
        assert_eq!(source_dif_flags(&c), SourceDifFlags::APP_TAG_F_DETECT);

        let mut c = ctx(512 + 8, 8);
        c.dif_flags = DifCheckFlags::APP_TAG;
        let flags = source_dif_flags(&c);
        assert!(flags.contains(SourceDifFlags::GUARD_CHECK_DISABLE));
        assert!(flags.contains(SourceDifFlags::REF_TAG_CHECK_DISABLE));

        let mut c = ctx(512 + 8, 8);
        c.dif_type = DifType::Type3;
        assert!(source_dif_flags(&c).contains(SourceDifFlags::APP_AND_REF_TAG_F_DETECT));
    }

    #[test]
    fn test_app_tag_mask_derivation() {
        let mut c = ctx(512 + 8, 8);
        c.apptag_mask = 0x00F0;
        assert_eq!(app_tag_mask(&c), 0xFF0F);

        c.dif_flags = DifCheckFlags::GUARD | DifCheckFlags::REF_TAG;
        assert_eq!(app_tag_mask(&c), 0xFFFF);
    }
}
