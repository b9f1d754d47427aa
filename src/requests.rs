// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Per-opcode request builders.
//!
//! Every builder follows the same shape: validate, open the channel's
//! batch, split the request into device-legal contiguous segments, fill
//! one descriptor per segment with the first segment acting as the
//! fan-in parent, and flush the batch once it is large enough. A
//! failure mid-build rolls the batch index back over the children this
//! call appended, leaving the batch open and usable.
//!
//! # Safety
//!
//! Submission is asynchronous: every `submit_*` function is unsafe
//! because the caller must keep all referenced memory - sources,
//! destinations, `crc_dst`, `output_size` - valid and un-moved until
//! the completion callback for the request has run.

use crate::channel::{vtophys, Channel, ReqCallback};
use crate::descriptor::{
    CompletionRecord, CompressionFlags, DecompressionFlags, DescriptorFlags, HwDesc,
};
use crate::device::IAA_AECS_SIZE;
use crate::dif::{self, DifCtx};
use crate::error::{Error, Result};
use crate::iter::{IoVec, IovPairIter, PairedRunIter, SingleRunIter};
use crate::opcode::Opcode;

const ALIGN_4K: usize = 0x1000;

impl Channel {
    /// Vectored copy (memmove).
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_copy(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        self.setup_batch()?;
        let mut count = 0;
        match self.build_copy(dst, src, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    fn build_copy(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;

        let mut pairs = IovPairIter::new(src, dst);
        while let Some((s, d, len)) = pairs.next() {
            let mut runs = PairedRunIter::new(dev_ops.as_ref(), pasid, s as *const u8, d, len);
            while let Some(seg) = runs.next(u64::MAX)? {
                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::MemMove);
                desc.src_addr = seg.src;
                desc.dst_addr = seg.dst;
                desc.xfer_size = seg.len as u32;
                desc.toggle_flags(DescriptorFlags::CACHE_CTRL);
            }
        }
        Ok(())
    }

    /// Copy one source into two destinations simultaneously. The
    /// device requires both destinations 4 KiB aligned.
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_dualcast(
        &mut self,
        dst1: *mut u8,
        dst2: *mut u8,
        src: *const u8,
        nbytes: u64,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        if (dst1 as usize) & (ALIGN_4K - 1) != 0 || (dst2 as usize) & (ALIGN_4K - 1) != 0 {
            log::error!("dualcast requires 4K alignment on dst addresses");
            return Err(Error::InvalidArgument(
                "dualcast requires 4 KiB aligned destination addresses".into(),
            ));
        }

        self.setup_batch()?;
        let mut count = 0;
        match self.build_dualcast(dst1, dst2, src, nbytes, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dualcast(
        &mut self,
        dst1: *mut u8,
        dst2: *mut u8,
        src: *const u8,
        nbytes: u64,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;

        // The outer iterator walks (src, dst1); the inner walks
        // (src, dst2) clipped to the outer segment, so each descriptor
        // expresses one contiguous (src, dst1, dst2) triple.
        let mut outer = PairedRunIter::new(dev_ops.as_ref(), pasid, src, dst1, nbytes);
        let mut inner = PairedRunIter::new(dev_ops.as_ref(), pasid, src, dst2, nbytes);

        while let Some(outer_seg) = outer.next(u64::MAX)? {
            let mut dst1_addr = outer_seg.dst;
            let mut remaining = outer_seg.len;

            while remaining > 0 {
                let Some(inner_seg) = inner.next(remaining)? else {
                    break;
                };

                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::Dualcast);
                desc.src_addr = inner_seg.src;
                desc.dst_addr = dst1_addr;
                desc.set_dest2(inner_seg.dst);
                desc.xfer_size = inner_seg.len as u32;
                desc.toggle_flags(DescriptorFlags::CACHE_CTRL);

                dst1_addr += inner_seg.len;
                remaining -= inner_seg.len;
            }
        }
        Ok(())
    }

    /// Vectored compare of two sources. Read-only; the result reaches
    /// the callback as [`crate::OpStatus::Mismatch`] when the buffers
    /// differ.
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_compare(
        &mut self,
        src1: &[IoVec],
        src2: &[IoVec],
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        self.setup_batch()?;
        let mut count = 0;
        match self.build_compare(src1, src2, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    fn build_compare(
        &mut self,
        src1: &[IoVec],
        src2: &[IoVec],
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;

        let mut pairs = IovPairIter::new(src1, src2);
        while let Some((a, b_ptr, len)) = pairs.next() {
            let mut runs =
                PairedRunIter::new(dev_ops.as_ref(), pasid, a as *const u8, b_ptr, len);
            while let Some(seg) = runs.next(u64::MAX)? {
                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::Compare);
                desc.src_addr = seg.src;
                desc.dst_addr = seg.dst;
                desc.xfer_size = seg.len as u32;
            }
        }
        Ok(())
    }

    /// Fill the destination with a repeating 64-bit pattern.
    ///
    /// # Safety
    ///
    /// The destination must stay valid until the completion callback
    /// runs.
    pub unsafe fn submit_fill(
        &mut self,
        dst: &[IoVec],
        pattern: u64,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        self.setup_batch()?;
        let mut count = 0;
        match self.build_fill(dst, pattern, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    fn build_fill(
        &mut self,
        dst: &[IoVec],
        pattern: u64,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;

        for iov in dst {
            let mut runs = SingleRunIter::new(dev_ops.as_ref(), pasid, iov.base(), iov.len());
            while let Some(seg) = runs.next(u64::MAX)? {
                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::MemFill);
                desc.src_addr = pattern;
                desc.dst_addr = seg.addr;
                desc.xfer_size = seg.len as u32;
                desc.toggle_flags(DescriptorFlags::CACHE_CTRL);
            }
        }
        Ok(())
    }

    /// Vectored CRC32C generation.
    ///
    /// The stream may split into several descriptors; each one past the
    /// first fences on its predecessor and reads its seed from the
    /// predecessor's completion record, so the final value equals the
    /// CRC over the whole stream. Only the last descriptor stores to
    /// `crc_dst`, in the inverted (public) form.
    ///
    /// # Safety
    ///
    /// The sources and `crc_dst` must stay valid until the completion
    /// callback runs.
    pub unsafe fn submit_crc32c(
        &mut self,
        src: &[IoVec],
        seed: u32,
        crc_dst: *mut u32,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        self.setup_batch()?;
        let mut count = 0;
        match self.build_crc32c(src, seed, crc_dst, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_crc32c(
        &mut self,
        src: &[IoVec],
        seed: u32,
        crc_dst: *mut u32,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;
        let mut last = None;
        let mut prev_crc: u64 = 0;

        for iov in src {
            let mut runs = SingleRunIter::new(dev_ops.as_ref(), pasid, iov.base(), iov.len());
            while let Some(seg) = runs.next(u64::MAX)? {
                let is_first = first.is_none();
                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::CrcGen);
                desc.src_addr = seg.addr;
                if is_first {
                    desc.set_crc_seed(seed);
                } else {
                    desc.add_flags(
                        DescriptorFlags::FENCE | DescriptorFlags::CRC_READ_CRC_SEED,
                    );
                    desc.set_crc_addr(prev_crc);
                }
                desc.xfer_size = seg.len as u32;
                prev_crc = desc.completion_addr + CompletionRecord::CRC32C_OFFSET;
                last = Some((b, slot));
            }
        }

        // Only the last descriptor stores the CRC to the destination.
        if let Some((b, slot)) = last {
            self.batch_op_mut(b, slot).crc_dst = crc_dst;
        }
        Ok(())
    }

    /// Vectored copy that also generates the CRC32C of the stream.
    /// Chaining and final-store rules match [`Channel::submit_crc32c`].
    ///
    /// # Safety
    ///
    /// All buffers and `crc_dst` must stay valid until the completion
    /// callback runs.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn submit_copy_crc32c(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        seed: u32,
        crc_dst: *mut u32,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        self.setup_batch()?;
        let mut count = 0;
        match self.build_copy_crc32c(dst, src, seed, crc_dst, flags, cb_fn, cb_arg, &mut count) {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_copy_crc32c(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        seed: u32,
        crc_dst: *mut u32,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let dev_ops = self.device_ops();
        let pasid = self.pasid_enabled();
        let mut first = None;
        let mut last = None;
        let mut prev_crc: u64 = 0;

        let mut pairs = IovPairIter::new(src, dst);
        while let Some((s, d, len)) = pairs.next() {
            let mut runs = PairedRunIter::new(dev_ops.as_ref(), pasid, s as *const u8, d, len);
            while let Some(seg) = runs.next(u64::MAX)? {
                let is_first = first.is_none();
                let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
                let desc = self.batch_desc_mut(b, slot);
                desc.set_opcode(Opcode::CopyCrc);
                desc.src_addr = seg.src;
                desc.dst_addr = seg.dst;
                desc.toggle_flags(DescriptorFlags::CACHE_CTRL);
                if is_first {
                    desc.set_crc_seed(seed);
                } else {
                    desc.add_flags(
                        DescriptorFlags::FENCE | DescriptorFlags::CRC_READ_CRC_SEED,
                    );
                    desc.set_crc_addr(prev_crc);
                }
                desc.xfer_size = seg.len as u32;
                prev_crc = desc.completion_addr + CompletionRecord::CRC32C_OFFSET;
                last = Some((b, slot));
            }
        }

        if let Some((b, slot)) = last {
            self.batch_op_mut(b, slot).crc_dst = crc_dst;
        }
        Ok(())
    }

    /// IAA compression of a single contiguous source.
    ///
    /// The reported output size lands in `*output_size` on completion.
    /// Vectored input is not supported.
    ///
    /// # Safety
    ///
    /// All buffers and `output_size` must stay valid until the
    /// completion callback runs.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn submit_compress(
        &mut self,
        dst: *mut u8,
        dst_len: u64,
        src: &[IoVec],
        output_size: *mut u32,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        if src.len() != 1 {
            return Err(Error::InvalidArgument(
                "vectored compress is not supported".into(),
            ));
        }
        if dst_len < src[0].len() {
            return Err(Error::InvalidArgument(
                "compress destination smaller than source".into(),
            ));
        }

        let idx = self.prepare_single(cb_fn, cb_arg, flags)?;

        let addrs = (|| -> Result<(u64, u64)> {
            let src_addr = vtophys(self.device(), src[0].base(), src[0].len())?;
            let dst_addr = vtophys(self.device(), dst, dst_len)?;
            Ok((src_addr, dst_addr))
        })();
        let (src_addr, dst_addr) = match addrs {
            Ok(a) => a,
            Err(e) => {
                self.return_to_pool(idx);
                return Err(e);
            }
        };

        let aecs_addr = self.device().config().aecs_addr;
        let src_len = src[0].len();
        let desc = self.desc_mut(idx);
        desc.set_opcode(Opcode::Compress);
        desc.src_addr = src_addr;
        desc.dst_addr = dst_addr;
        desc.xfer_size = src_len as u32;
        desc.set_iaa_max_dst_size(dst_len as u32);
        desc.set_iaa_src2_size(IAA_AECS_SIZE);
        desc.set_iaa_src2_addr(aecs_addr);
        desc.add_flags(DescriptorFlags::SRC2_AECS);
        desc.set_compression_flags(CompressionFlags::FLUSH_OUTPUT | CompressionFlags::APPEND_EOB);
        self.op_mut(idx).output_size = output_size;

        self.submit_to_hw(idx);
        Ok(())
    }

    /// IAA decompression of a single contiguous source into a single
    /// destination at least as large.
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_decompress(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        if dst.len() != 1 || src.len() != 1 {
            return Err(Error::InvalidArgument(
                "vectored decompress is not supported".into(),
            ));
        }
        if dst[0].len() < src[0].len() {
            return Err(Error::InvalidArgument(
                "decompress destination smaller than source".into(),
            ));
        }

        let idx = self.prepare_single(cb_fn, cb_arg, flags)?;

        let addrs = (|| -> Result<(u64, u64)> {
            let src_addr = vtophys(self.device(), src[0].base(), src[0].len())?;
            let dst_addr = vtophys(self.device(), dst[0].base(), dst[0].len())?;
            Ok((src_addr, dst_addr))
        })();
        let (src_addr, dst_addr) = match addrs {
            Ok(a) => a,
            Err(e) => {
                self.return_to_pool(idx);
                return Err(e);
            }
        };

        let (src_len, dst_len) = (src[0].len(), dst[0].len());
        let desc = self.desc_mut(idx);
        desc.set_opcode(Opcode::Decompress);
        desc.src_addr = src_addr;
        desc.dst_addr = dst_addr;
        desc.xfer_size = src_len as u32;
        desc.set_iaa_max_dst_size(dst_len as u32);
        desc.set_decompression_flags(
            DecompressionFlags::ENABLE
                | DecompressionFlags::FLUSH_OUTPUT
                | DecompressionFlags::CHECK_FOR_EOB
                | DecompressionFlags::STOP_ON_EOB,
        );

        self.submit_to_hw(idx);
        Ok(())
    }

    /// Verify the protection information of source blocks. Read-only;
    /// a device-reported DIF failure reaches the callback as
    /// [`crate::OpStatus::Integrity`].
    ///
    /// # Safety
    ///
    /// The sources must stay valid until the completion callback runs.
    pub unsafe fn submit_dif_check(
        &mut self,
        src: &[IoVec],
        ctx: &DifCtx,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        dif::validate_check_params(ctx)?;
        let dif_flags = dif::dif_flags(ctx)?;
        let src_flags = dif::source_dif_flags(ctx);
        let app_tag_mask = dif::app_tag_mask(ctx);

        self.setup_batch()?;
        let mut count = 0;
        let rc = self.build_dif_check(
            src,
            ctx,
            dif_flags,
            src_flags.bits(),
            app_tag_mask,
            flags,
            cb_fn,
            cb_arg,
            &mut count,
        );
        match rc {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dif_check(
        &mut self,
        src: &[IoVec],
        ctx: &DifCtx,
        dif_flags: u8,
        src_flags: u8,
        app_tag_mask: u16,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let mut first = None;
        let mut blocks_done: u32 = 0;

        for iov in src {
            // The device processes each element independently; it must
            // hold a whole number of protected blocks.
            dif::validate_check_buf_align(ctx, iov.len())?;

            let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
            let desc = self.batch_desc_mut(b, slot);
            desc.set_opcode(Opcode::DifCheck);
            desc.src_addr = iov.base() as u64;
            desc.xfer_size = iov.len() as u32;
            desc.set_dif_flags(dif_flags);
            desc.set_dif_src_flags(src_flags);
            desc.set_dif_app_tag_seed(ctx.app_tag);
            desc.set_dif_app_tag_mask(app_tag_mask);
            desc.set_dif_ref_tag_seed(ctx.init_ref_tag.wrapping_add(blocks_done));

            blocks_done += (iov.len() / ctx.block_size as u64) as u32;
        }
        Ok(())
    }

    /// Generate protection information: read bare data blocks from the
    /// sources and write protected blocks to the destinations.
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_dif_insert(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        ctx: &DifCtx,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        dif::validate_insert_params(ctx)?;
        dif::validate_insert_iovecs(ctx, dst, src)?;
        let dif_flags = dif::dif_flags(ctx)?;

        self.setup_batch()?;
        let mut count = 0;
        let rc = self.build_dif_insert(dst, src, ctx, dif_flags, flags, cb_fn, cb_arg, &mut count);
        match rc {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dif_insert(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        ctx: &DifCtx,
        dif_flags: u8,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let data_block_size = ctx.data_block_size() as u64;
        let mut first = None;
        let mut blocks_done: u32 = 0;

        for (s, d) in src.iter().zip(dst.iter()) {
            dif::validate_insert_buf_align(ctx, s.len(), d.len())?;

            let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
            let desc = self.batch_desc_mut(b, slot);
            desc.set_opcode(Opcode::DifInsert);
            desc.src_addr = s.base() as u64;
            desc.dst_addr = d.base() as u64;
            desc.xfer_size = s.len() as u32;
            desc.set_dif_flags(dif_flags);
            desc.set_dif_app_tag_seed(ctx.app_tag);
            desc.set_dif_app_tag_mask(!ctx.apptag_mask);
            desc.set_dif_ref_tag_seed(ctx.init_ref_tag.wrapping_add(blocks_done));

            blocks_done += (s.len() / data_block_size) as u32;
        }
        Ok(())
    }

    /// Strip protection information: read protected blocks from the
    /// sources and write bare data blocks to the destinations.
    ///
    /// Unlike check and insert, the reference tag seed is not advanced
    /// across elements; every descriptor validates against the initial
    /// reference tag. Whether strip should advance is an open point.
    ///
    /// # Safety
    ///
    /// All buffers must stay valid until the completion callback runs.
    pub unsafe fn submit_dif_strip(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        ctx: &DifCtx,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        dif::validate_common_params(ctx)?;
        let dif_flags = dif::dif_flags(ctx)?;
        let src_flags = dif::source_dif_flags(ctx);
        let app_tag_mask = dif::app_tag_mask(ctx);

        self.setup_batch()?;

        if dst.len() != src.len() {
            log::error!("mismatched iovcnts: src={}, dst={}", src.len(), dst.len());
            return Err(Error::InvalidArgument(format!(
                "mismatched iovcnts: src={}, dst={}",
                src.len(),
                dst.len()
            )));
        }

        let mut count = 0;
        let rc = self.build_dif_strip(
            dst,
            src,
            ctx,
            dif_flags,
            src_flags.bits(),
            app_tag_mask,
            flags,
            cb_fn,
            cb_arg,
            &mut count,
        );
        match rc {
            Ok(()) => self.flush_batch(),
            Err(e) => {
                self.rollback_open_batch(count);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dif_strip(
        &mut self,
        dst: &[IoVec],
        src: &[IoVec],
        ctx: &DifCtx,
        dif_flags: u8,
        src_flags: u8,
        app_tag_mask: u16,
        flags: DescriptorFlags,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        count: &mut u16,
    ) -> Result<()> {
        let mut first = None;

        for (s, d) in src.iter().zip(dst.iter()) {
            dif::validate_strip_buf_align(ctx, s.len(), d.len())?;

            let (b, slot) = self.prepare_chained(&mut first, count, cb_fn, cb_arg, flags)?;
            let desc = self.batch_desc_mut(b, slot);
            desc.set_opcode(Opcode::DifStrip);
            desc.src_addr = s.base() as u64;
            desc.dst_addr = d.base() as u64;
            desc.xfer_size = s.len() as u32;
            desc.set_dif_flags(dif_flags);
            desc.set_dif_src_flags(src_flags);
            desc.set_dif_app_tag_seed(ctx.app_tag);
            desc.set_dif_app_tag_mask(app_tag_mask);
            desc.set_dif_ref_tag_seed(ctx.init_ref_tag);
        }
        Ok(())
    }

    /// Submit a fully-formed descriptor supplied by the caller.
    ///
    /// Escape hatch for opcodes not modeled above; no parent/child
    /// aggregation occurs. The pool-preserved completion address and
    /// the prepare-path flags are merged into the caller's descriptor.
    ///
    /// # Safety
    ///
    /// Every address the descriptor references must stay valid until
    /// the completion callback runs.
    pub unsafe fn submit_raw(
        &mut self,
        user_desc: &HwDesc,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        let idx = self.prepare_single(cb_fn, cb_arg, DescriptorFlags::empty())?;

        let desc = self.desc_mut(idx);
        let prep_flags = desc.flags();
        let completion_addr = desc.completion_addr;
        *desc = *user_desc;
        desc.add_flags(prep_flags);
        desc.completion_addr = completion_addr;

        self.submit_to_hw(idx);
        Ok(())
    }
}
