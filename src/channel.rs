// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Per-channel submission pipeline: operation and batch pools, the
//! doorbell submission gate, and the completion poller.
//!
//! A channel is single-owner: exactly one thread issues submissions and
//! polls completions against it, so there is no lock inside. All
//! operations, descriptors and batches are allocated at channel
//! creation; the free stack and outstanding FIFO are preallocated and
//! never grow on the hot path. Backpressure surfaces as
//! [`Error::PoolExhausted`], never as blocking.

use crate::descriptor::{CompletionRecord, CompletionStatus, DescriptorFlags, HwDesc};
use crate::device::{Device, DeviceOps};
use crate::error::{Error, OpStatus, Result};
use crate::opcode::Opcode;
use crate::submit;
use std::collections::VecDeque;
use std::sync::Arc;

/// The max number of completions processed per poll.
pub const MAX_COMPLETIONS_PER_POLL: usize = 128;

/// The minimum number of entries in a batch per flush.
pub(crate) const MIN_BATCH_FLUSH: u16 = 32;

/// Sentinel batch index marking a submitted batch; no further appends.
const BATCH_SUBMITTED: u16 = u16::MAX;

/// Completion callback: plain fn pointer so the submission and
/// completion hot paths never allocate. `cb_arg` is returned verbatim.
pub type ReqCallback = fn(cb_arg: u64, status: OpStatus);

/// Host-side state of one operation, permanently paired with the
/// descriptor at the same arena index. The completion record sits
/// first so the whole slot stays cache-line friendly for the device
/// write-back.
#[repr(C, align(64))]
pub(crate) struct OpSlot {
    /// Device-written completion record.
    pub comp: CompletionRecord,
    pub cb_fn: Option<ReqCallback>,
    pub cb_arg: u64,
    /// Fan-in parent: slot index of the first operation of the same
    /// request, within the same batch.
    pub parent: Option<u16>,
    /// Children still outstanding (>= 1 while in flight).
    pub count: u16,
    /// Owning batch, if this operation is a batch child or carries a
    /// reference to one.
    pub batch: Option<u16>,
    /// Where to store the final (inverted) CRC value.
    pub crc_dst: *mut u32,
    /// Where to store the IAA output size.
    pub output_size: *mut u32,
}

impl OpSlot {
    fn new() -> Self {
        Self {
            comp: CompletionRecord::new(),
            cb_fn: None,
            cb_arg: 0,
            parent: None,
            count: 0,
            batch: None,
            crc_dst: std::ptr::null_mut(),
            output_size: std::ptr::null_mut(),
        }
    }
}

/// Typed handle to an operation: either a channel pool slot or a slot
/// inside a batch arena. The arenas stay the sole owners; no node
/// pointers escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpRef {
    Pool(u16),
    Batch { batch: u16, slot: u16 },
}

/// One preallocated batch: a descriptor array the device can execute
/// with a single batch descriptor, plus the paired operation slots.
pub(crate) struct Batch {
    ops: Box<[OpSlot]>,
    descs: Box<[HwDesc]>,
    /// Device-visible address of `descs`.
    desc_list_addr: u64,
    /// Number of children appended; `BATCH_SUBMITTED` once submitted.
    index: u16,
    /// Children still outstanding on the device plus the request
    /// parent's reference.
    refcnt: u16,
}

/// A submission channel bound to one work-queue slot of a device.
pub struct Channel {
    device: Arc<Device>,
    portal: *mut u8,
    portal_offset: usize,
    channel_slot: u32,
    pasid_enabled: bool,

    ops: Box<[OpSlot]>,
    descs: Box<[HwDesc]>,
    /// Free stack of pool slots.
    free: Vec<u16>,
    /// Outstanding FIFO, oldest submission at the head.
    outstanding: VecDeque<OpRef>,

    batches: Box<[Batch]>,
    batch_free: Vec<u16>,
    /// The currently open (accepting appends) batch, at most one.
    open_batch: Option<u16>,
}

// SAFETY: a channel may migrate between threads; the raw portal and
// result pointers it holds are only dereferenced by its single owner
// (and by the device, which is indifferent to host threads).
unsafe impl Send for Channel {}

impl Device {
    /// Reserve a work-queue slot and build a channel on it.
    ///
    /// Preallocates `total_wq_size / chan_per_device` operations with
    /// their descriptors, and (DSA-class devices) the batch pool.
    pub fn acquire_channel(self: &Arc<Self>) -> Result<Channel> {
        Channel::new(Arc::clone(self))
    }
}

/// Contiguous translation for pool-initialization and single-segment
/// paths: the whole range must land in one physical run.
pub(crate) fn vtophys(device: &Device, buf: *const u8, size: u64) -> Result<u64> {
    if device.config().pasid_enabled {
        // We can just use virtual addresses.
        return Ok(buf as u64);
    }

    let (addr, run) = device.ops().translate(buf, size).map_err(|e| {
        log::error!("error translating address {buf:p}");
        e
    })?;
    if run < size {
        log::error!("error translating size {size:#x}, contiguous run {run:#x}");
        return Err(Error::Translation);
    }
    Ok(addr)
}

impl Channel {
    fn new(device: Arc<Device>) -> Result<Self> {
        let slot = device.reserve_channel_slot()?;
        // Give the slot back if any allocation below fails.
        let slot_guard = scopeguard::guard(slot, |s| device.release_channel_slot(s));

        let num_descriptors = device.descriptors_per_channel();
        let comp_rec_size = device.config().kind.completion_record_size() as u64;

        let mut ops: Box<[OpSlot]> = (0..num_descriptors).map(|_| OpSlot::new()).collect();
        let mut descs: Box<[HwDesc]> = vec![HwDesc::new(); num_descriptors].into();
        for (op, desc) in ops.iter_mut().zip(descs.iter_mut()) {
            desc.completion_addr =
                vtophys(&device, &op.comp as *const _ as *const u8, comp_rec_size)?;
        }

        let batch_count = if device.config().kind.has_batch_pool() {
            num_descriptors
        } else {
            0
        };
        let mut batches = Vec::with_capacity(batch_count);
        for _ in 0..batch_count {
            batches.push(Batch::alloc(&device, comp_rec_size)?);
        }

        let batch_size = device.config().batch_size as usize;
        let portal = device.ops().portal_base();
        let portal_offset = device.portal_offset_for_slot(slot);
        let pasid_enabled = device.config().pasid_enabled;

        let slot = scopeguard::ScopeGuard::into_inner(slot_guard);
        Ok(Self {
            portal,
            portal_offset,
            channel_slot: slot,
            pasid_enabled,
            free: (0..num_descriptors as u16).rev().collect(),
            outstanding: VecDeque::with_capacity(num_descriptors * (1 + batch_size)),
            ops,
            descs,
            batches: batches.into(),
            batch_free: (0..batch_count as u16).rev().collect(),
            open_batch: None,
            device,
        })
    }

    /// The device this channel submits to.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether the device walks page tables itself for this channel.
    #[inline]
    pub(crate) fn pasid_enabled(&self) -> bool {
        self.pasid_enabled
    }

    /// Driver backend handle, cloned so builders can iterate while the
    /// channel is mutably borrowed.
    #[inline]
    pub(crate) fn device_ops(&self) -> Arc<dyn DeviceOps> {
        Arc::clone(self.device.ops())
    }

    #[inline]
    pub(crate) fn desc_mut(&mut self, idx: u16) -> &mut HwDesc {
        &mut self.descs[idx as usize]
    }

    #[inline]
    pub(crate) fn op_mut(&mut self, idx: u16) -> &mut OpSlot {
        &mut self.ops[idx as usize]
    }

    #[inline]
    pub(crate) fn batch_desc_mut(&mut self, batch: u16, slot: u16) -> &mut HwDesc {
        &mut self.batches[batch as usize].descs[slot as usize]
    }

    #[inline]
    pub(crate) fn batch_op_mut(&mut self, batch: u16, slot: u16) -> &mut OpSlot {
        &mut self.batches[batch as usize].ops[slot as usize]
    }

    fn slot(&self, r: OpRef) -> &OpSlot {
        match r {
            OpRef::Pool(i) => &self.ops[i as usize],
            OpRef::Batch { batch, slot } => &self.batches[batch as usize].ops[slot as usize],
        }
    }

    fn slot_mut(&mut self, r: OpRef) -> &mut OpSlot {
        match r {
            OpRef::Pool(i) => &mut self.ops[i as usize],
            OpRef::Batch { batch, slot } => &mut self.batches[batch as usize].ops[slot as usize],
        }
    }

    fn opcode_of(&self, r: OpRef) -> u8 {
        match r {
            OpRef::Pool(i) => self.descs[i as usize].opcode(),
            OpRef::Batch { batch, slot } => {
                self.batches[batch as usize].descs[slot as usize].opcode()
            }
        }
    }

    /// Pop a pool slot and ready its descriptor for a new command.
    ///
    /// The completion address established at pool initialization is
    /// preserved; everything else is zeroed. Fails with
    /// [`Error::PoolExhausted`] when the free stack is empty - the
    /// caller treats that as flow-control backpressure.
    pub(crate) fn prepare_single(
        &mut self,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        flags: DescriptorFlags,
    ) -> Result<u16> {
        let idx = self.free.pop().ok_or(Error::PoolExhausted)?;

        let desc = &mut self.descs[idx as usize];
        desc.reset_preserving_completion();
        desc.set_flags(
            flags | DescriptorFlags::CR_ADDR_VALID | DescriptorFlags::REQUEST_COMPLETION,
        );

        let op = &mut self.ops[idx as usize];
        op.cb_fn = cb_fn;
        op.cb_arg = cb_arg;
        op.batch = None;
        op.parent = None;
        op.count = 1;
        op.crc_dst = std::ptr::null_mut();
        op.output_size = std::ptr::null_mut();

        Ok(idx)
    }

    /// Return an unsubmitted pool slot (builder error path).
    pub(crate) fn return_to_pool(&mut self, idx: u16) {
        self.free.push(idx);
    }

    /// Open a batch if none is open.
    pub(crate) fn setup_batch(&mut self) -> Result<()> {
        if self.open_batch.is_none() {
            let b = self.batch_free.pop().ok_or(Error::PoolExhausted)?;
            self.batches[b as usize].index = 0;
            self.open_batch = Some(b);
        }
        Ok(())
    }

    /// Take the next slot of the open batch and ready its descriptor.
    /// Returns the batch id and the slot within it.
    ///
    /// Fails with [`Error::PoolExhausted`] when the batch is full.
    pub(crate) fn prepare_batched(
        &mut self,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        flags: DescriptorFlags,
    ) -> Result<(u16, u16)> {
        let b = self.open_batch.ok_or(Error::PoolExhausted)?;
        let batch = &mut self.batches[b as usize];

        if batch.index as usize == batch.descs.len() {
            return Err(Error::PoolExhausted);
        }

        let slot = batch.index;
        batch.index += 1;
        log::debug!("prep batch {b} index {slot}");

        let desc = &mut batch.descs[slot as usize];
        desc.reset_preserving_completion();
        desc.set_flags(
            flags | DescriptorFlags::CR_ADDR_VALID | DescriptorFlags::REQUEST_COMPLETION,
        );

        let op = &mut batch.ops[slot as usize];
        op.cb_fn = cb_fn;
        op.cb_arg = cb_arg;
        op.batch = Some(b);
        op.parent = None;
        op.count = 1;
        op.crc_dst = std::ptr::null_mut();
        op.output_size = std::ptr::null_mut();

        Ok((b, slot))
    }

    /// Append one child of a multi-descriptor request.
    ///
    /// The first child carries the user callback and becomes the fan-in
    /// parent; each later child bumps the parent's count and
    /// back-references it. `count` tracks how many children this call
    /// appended, for rollback.
    pub(crate) fn prepare_chained(
        &mut self,
        first: &mut Option<u16>,
        count: &mut u16,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
        flags: DescriptorFlags,
    ) -> Result<(u16, u16)> {
        let (b, slot) = match *first {
            None => {
                let (b, slot) = self.prepare_batched(cb_fn, cb_arg, flags)?;
                *first = Some(slot);
                (b, slot)
            }
            Some(first_slot) => {
                let (b, slot) = self.prepare_batched(None, 0, flags)?;
                let batch = &mut self.batches[b as usize];
                batch.ops[first_slot as usize].count += 1;
                batch.ops[slot as usize].parent = Some(first_slot);
                (b, slot)
            }
        };
        *count += 1;
        Ok((b, slot))
    }

    /// Roll the open batch back by the children a failed builder call
    /// appended. The batch stays open and usable.
    pub(crate) fn rollback_open_batch(&mut self, count: u16) {
        if let Some(b) = self.open_batch {
            let batch = &mut self.batches[b as usize];
            debug_assert!(batch.index >= count && batch.index != BATCH_SUBMITTED);
            batch.index -= count;
        }
    }

    fn batch_put(&mut self, b: u16) {
        log::debug!("free batch {b}");
        let batch = &mut self.batches[b as usize];
        debug_assert_eq!(batch.refcnt, 0);
        batch.index = 0;
        self.batch_free.push(b);
    }

    fn batch_unref(&mut self, b: u16) {
        let batch = &mut self.batches[b as usize];
        debug_assert!(batch.refcnt > 0);
        batch.refcnt -= 1;
        if batch.refcnt == 0 {
            self.batch_put(b);
        }
    }

    /// Tear down the open batch, completing each pending child with
    /// `status`. Refuses to run once the batch has been submitted.
    pub(crate) fn batch_cancel(&mut self, status: OpStatus) -> Result<()> {
        let b = self
            .open_batch
            .ok_or_else(|| Error::InvalidArgument("no open batch to cancel".into()))?;

        if self.batches[b as usize].index == BATCH_SUBMITTED {
            log::error!("cannot cancel batch, already submitted to HW");
            return Err(Error::InvalidArgument(
                "batch already submitted to hardware".into(),
            ));
        }

        self.open_batch = None;

        let pending = self.batches[b as usize].index;
        for i in 0..pending {
            let op = &self.batches[b as usize].ops[i as usize];
            let (cb_fn, cb_arg) = (op.cb_fn, op.cb_arg);
            if let Some(f) = cb_fn {
                f(cb_arg, status);
            }
        }

        self.batch_put(b);
        Ok(())
    }

    /// Close and submit the open batch.
    ///
    /// Zero children routes through cancellation; exactly one child
    /// collapses into a plain single submission; otherwise a batch
    /// descriptor pointing at the batch's descriptor array is built and
    /// every child joins the outstanding FIFO.
    pub(crate) fn batch_submit(
        &mut self,
        cb_fn: Option<ReqCallback>,
        cb_arg: u64,
    ) -> Result<()> {
        let b = self
            .open_batch
            .ok_or_else(|| Error::InvalidArgument("no open batch to submit".into()))?;

        if self.batches[b as usize].index == 0 {
            return self.batch_cancel(OpStatus::Success);
        }

        // Common prep; may fail with PoolExhausted, leaving the batch
        // open for a later retry.
        let parent = self.prepare_single(cb_fn, cb_arg, DescriptorFlags::empty())?;

        if self.batches[b as usize].index == 1 {
            // If there's only one command, convert it away from a batch.
            let child_desc = self.batches[b as usize].descs[0];
            let desc = &mut self.descs[parent as usize];
            let completion_addr = desc.completion_addr;
            *desc = child_desc;
            desc.completion_addr = completion_addr;

            let child = &self.batches[b as usize].ops[0];
            let (cb_fn, cb_arg, crc_dst) = (child.cb_fn, child.cb_arg, child.crc_dst);
            let op = &mut self.ops[parent as usize];
            op.cb_fn = cb_fn;
            op.cb_arg = cb_arg;
            op.crc_dst = crc_dst;

            self.open_batch = None;
            self.batch_put(b);
        } else {
            let count = self.batches[b as usize].index;
            let desc = &mut self.descs[parent as usize];
            desc.set_opcode(Opcode::Batch);
            desc.src_addr = self.batches[b as usize].desc_list_addr;
            desc.xfer_size = count as u32;

            // Put every child on the outstanding FIFO to be polled;
            // each holds one reference on the batch.
            for slot in 0..count {
                self.batches[b as usize].refcnt += 1;
                self.outstanding.push_back(OpRef::Batch { batch: b, slot });
            }
            self.batches[b as usize].index = BATCH_SUBMITTED;
            self.open_batch = None;
        }

        self.submit_to_hw(parent);
        log::debug!("submitted batch {b}");
        Ok(())
    }

    /// Submit the open batch once it has grown past the flush
    /// threshold. A transient `PoolExhausted` is swallowed; the poller
    /// retries on its trailing edge.
    pub(crate) fn flush_batch(&mut self) -> Result<()> {
        let Some(b) = self.open_batch else {
            return Ok(());
        };
        if self.batches[b as usize].index >= MIN_BATCH_FLUSH {
            match self.batch_submit(None, 0) {
                Err(Error::PoolExhausted) => Ok(()),
                other => other,
            }
        } else {
            Ok(())
        }
    }

    /// The submission gate: enqueue on the outstanding FIFO, fence, and
    /// ring the doorbell.
    pub(crate) fn submit_to_hw(&mut self, idx: u16) {
        self.outstanding.push_back(OpRef::Pool(idx));

        // We must barrier before writing the descriptor to ensure that
        // descriptor and completion memory are globally visible before
        // DMA operations begin.
        submit::store_fence();

        let desc = &self.descs[idx as usize];
        let doorbell = self.portal.wrapping_add(self.portal_offset);
        unsafe { self.device.ops().doorbell(doorbell, desc) };

        self.portal_offset = self.device.next_portal_offset(self.portal_offset);
    }

    fn dump_sw_error(&self) {
        self.device.ops().dump_sw_error(self.portal);
    }

    /// Poll for completions, invoking callbacks, and return how many
    /// operations were drained.
    ///
    /// Walks the outstanding FIFO from the head and stops at the first
    /// still-pending entry: the head is the oldest submission, so
    /// nothing behind a pending head is reaped even if the device
    /// finished it out of order. Work per poll is bounded to keep the
    /// rest of the host responsive.
    pub fn process_completions(&mut self) -> usize {
        let mut drained = 0;

        while drained < MAX_COMPLETIONS_PER_POLL {
            let Some(&head) = self.outstanding.front() else {
                break;
            };

            let raw = self.slot(head).comp.raw_status();
            if raw == 0 {
                // Oldest locations are at the head of the list, so if
                // we've polled a location that hasn't completed, bail
                // now as there are unlikely to be any more completions.
                break;
            }

            self.outstanding.pop_front();
            drained += 1;

            // Status is in the same location for both DSA and IAA
            // completion records.
            let mut status = OpStatus::Success;
            if CompletionStatus::is_failure_code(raw) {
                log::error!("completion status {raw:#04x}");
                status = OpStatus::DeviceError(raw);
                self.dump_sw_error();
            }

            let opcode = self.opcode_of(head);
            match opcode {
                x if x == Opcode::Batch.as_u8() => {
                    log::debug!("batch descriptor complete");
                }
                x if x == Opcode::CrcGen.as_u8() || x == Opcode::CopyCrc.as_u8() => {
                    let crc_dst = self.slot(head).crc_dst;
                    if status.is_success() && !crc_dst.is_null() {
                        // The device reports the raw accumulator; the
                        // public contract is the inverted form.
                        let val = self.slot(head).comp.crc32c_val;
                        unsafe { *crc_dst = !val };
                    }
                }
                x if x == Opcode::Compare.as_u8() => {
                    if status.is_success() && self.slot(head).comp.result != 0 {
                        status = OpStatus::Mismatch;
                    }
                }
                x if x == Opcode::Compress.as_u8() => {
                    let output_size = self.slot(head).output_size;
                    if status.is_success() && !output_size.is_null() {
                        let val = self.slot(head).comp.output_size;
                        unsafe { *output_size = val };
                    }
                }
                x if x == Opcode::DifCheck.as_u8() || x == Opcode::DifStrip.as_u8() => {
                    if raw == CompletionStatus::DIF_ERROR {
                        status = OpStatus::Integrity;
                    }
                }
                _ => {}
            }

            // Rearm the status byte for the operation's next reuse.
            self.slot_mut(head).comp.status = 0;

            let (own_zero, parent, own_batch, cb_fn, cb_arg) = {
                let op = self.slot_mut(head);
                debug_assert!(op.count > 0);
                op.count -= 1;
                (op.count == 0, op.parent, op.batch, op.cb_fn, op.cb_arg)
            };

            // Fan-in: notify the request parent, which completes once
            // every child (itself included) has been reaped.
            if let (Some(parent_slot), Some(b)) = (parent, own_batch) {
                let (parent_zero, p_cb_fn, p_cb_arg) = {
                    let p = &mut self.batches[b as usize].ops[parent_slot as usize];
                    debug_assert!(p.count > 0);
                    p.count -= 1;
                    (p.count == 0, p.cb_fn, p.cb_arg)
                };
                if parent_zero {
                    // The parent's reference to its batch drops now;
                    // the head's own reference is handled below.
                    self.batch_unref(b);
                    if let Some(f) = p_cb_fn {
                        f(p_cb_arg, status);
                    }
                }
            }

            if own_zero {
                match head {
                    OpRef::Batch { batch, .. } => self.batch_unref(batch),
                    OpRef::Pool(idx) => self.free.push(idx),
                }
                if let Some(f) = cb_fn {
                    f(cb_arg, status);
                }
            }
        }

        // Submit any built-up batch.
        if self.open_batch.is_some() {
            if let Err(e) = self.batch_submit(None, 0) {
                debug_assert!(matches!(e, Error::PoolExhausted));
            }
        }

        drained
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.open_batch.is_some() {
            let _ = self.batch_cancel(OpStatus::Cancelled);
        }
        self.device.release_channel_slot(self.channel_slot);
    }
}

impl Batch {
    fn alloc(device: &Arc<Device>, comp_rec_size: u64) -> Result<Self> {
        let size = device.config().batch_size as usize;

        let mut ops: Box<[OpSlot]> = (0..size).map(|_| OpSlot::new()).collect();
        let mut descs: Box<[HwDesc]> = vec![HwDesc::new(); size].into();

        let desc_list_addr = vtophys(
            device,
            descs.as_ptr() as *const u8,
            (size * std::mem::size_of::<HwDesc>()) as u64,
        )?;

        for (op, desc) in ops.iter_mut().zip(descs.iter_mut()) {
            desc.completion_addr =
                vtophys(device, &op.comp as *const _ as *const u8, comp_rec_size)?;
        }

        Ok(Self {
            ops,
            descs,
            desc_list_addr,
            index: 0,
            refcnt: 0,
        })
    }
}

#[cfg(test)]
impl Channel {
    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub(crate) fn outstanding_pool_len(&self) -> usize {
        self.outstanding
            .iter()
            .filter(|r| matches!(r, OpRef::Pool(_)))
            .count()
    }

    pub(crate) fn batch_free_len(&self) -> usize {
        self.batch_free.len()
    }

    pub(crate) fn open_batch_index(&self) -> Option<u16> {
        self.open_batch.map(|b| self.batches[b as usize].index)
    }

    pub(crate) fn open_batch_refcnt(&self) -> Option<u16> {
        self.open_batch.map(|b| self.batches[b as usize].refcnt)
    }

    pub(crate) fn total_ops(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn total_batches(&self) -> usize {
        self.batches.len()
    }

    /// Pool-conservation invariant: every pool operation is either on
    /// the free stack or on the outstanding FIFO, and every batch is
    /// either free, open, or fully accounted by outstanding children.
    pub(crate) fn assert_pool_conservation(&self) {
        assert_eq!(
            self.free.len() + self.outstanding_pool_len(),
            self.ops.len(),
            "pool operations leaked"
        );
        let open = usize::from(self.open_batch.is_some());
        let submitted = self
            .batches
            .iter()
            .filter(|b| b.index == BATCH_SUBMITTED)
            .count();
        assert_eq!(
            self.batch_free.len() + open + submitted,
            self.batches.len(),
            "batches leaked"
        );
    }

    pub(crate) fn completion_addr_of_pool_slot(&self, idx: u16) -> u64 {
        self.descs[idx as usize].completion_addr
    }
}
