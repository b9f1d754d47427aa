// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Test support: a mock driver backend that captures doorbell writes
//! and executes descriptors in software.
//!
//! Translation is identity (host address = device address) with
//! configurable physical-run boundaries, so the run iterators can be
//! exercised against arbitrary fragmentation without real hardware.
//! The executor follows the device conventions the poller relies on:
//! the CRC accumulator is reported raw (non-inverted) and chained CRC
//! descriptors fetch their seed through the completion record of their
//! predecessor.

use crate::descriptor::{CompletionRecord, DescriptorFlags, HwDesc};
use crate::device::{DeviceOps, PORTAL_SIZE};
use crate::error::{Error, OpStatus, Result};
use crate::opcode::Opcode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy)]
#[repr(align(4096))]
struct Page([u8; 4096]);

/// Page-aligned test buffer. Dual-cast destinations and run-boundary
/// tests need page alignment that `Vec<u8>` does not guarantee.
pub(crate) struct AlignedBuf {
    pages: Vec<Page>,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn new(len: usize) -> Self {
        let pages = vec![Page([0; 4096]); len.div_ceil(4096).max(1)];
        Self { pages, len }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.pages.as_ptr() as *const u8
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.pages.as_mut_ptr() as *mut u8
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}

/// Raw CRC32C step matching the device: the seed is the raw
/// accumulator state and the result is reported non-inverted.
pub(crate) fn raw_crc32c(seed: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, data)
}

/// Mock driver backend implementing [`DeviceOps`].
pub(crate) struct MockDevice {
    portal: AlignedBuf,
    captured: Mutex<Vec<(usize, HwDesc)>>,
    executed: AtomicUsize,
    run_size: Option<u64>,
    boundaries: Mutex<Vec<u64>>,
    translation_fails: AtomicBool,
    injected: Mutex<VecDeque<u8>>,
    dumps: AtomicUsize,
}

impl MockDevice {
    /// Backend for PASID-enabled devices: translation is never
    /// consulted and addresses pass through as-is.
    pub(crate) fn new_pasid() -> Self {
        Self::build(None)
    }

    /// Identity translation with unbounded runs (refine with
    /// [`MockDevice::add_boundary`]); for non-PASID devices.
    pub(crate) fn identity() -> Self {
        Self::build(None)
    }

    /// Backend with identity translation and physical runs that end at
    /// every `run_size` boundary of the address space.
    pub(crate) fn with_run_size(run_size: u64) -> Self {
        Self::build(Some(run_size))
    }

    fn build(run_size: Option<u64>) -> Self {
        Self {
            portal: AlignedBuf::new(PORTAL_SIZE),
            captured: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            run_size,
            boundaries: Mutex::new(Vec::new()),
            translation_fails: AtomicBool::new(false),
            injected: Mutex::new(VecDeque::new()),
            dumps: AtomicUsize::new(0),
        }
    }

    /// Allocate a page-aligned, zeroed buffer.
    pub(crate) fn aligned_buf(len: usize) -> AlignedBuf {
        AlignedBuf::new(len)
    }

    /// Make every subsequent translation fail.
    pub(crate) fn fail_translation(&self) {
        self.translation_fails.store(true, Ordering::Relaxed);
    }

    /// End the physical run of any translation that crosses `addr`.
    pub(crate) fn add_boundary(&self, addr: *const u8) {
        self.boundaries.lock().unwrap().push(addr as u64);
    }

    /// Queue a completion status for the next executed descriptor
    /// (in submission order) instead of the default success.
    pub(crate) fn inject_status(&self, status: u8) {
        self.injected.lock().unwrap().push_back(status);
    }

    /// Number of doorbell writes captured so far.
    pub(crate) fn captured_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    /// Portal offsets of every doorbell write, in order.
    pub(crate) fn captured_offsets(&self) -> Vec<usize> {
        self.captured.lock().unwrap().iter().map(|(o, _)| *o).collect()
    }

    /// Copies of every submitted descriptor, in order.
    pub(crate) fn captured_descs(&self) -> Vec<HwDesc> {
        self.captured.lock().unwrap().iter().map(|(_, d)| *d).collect()
    }

    /// Times the software error register was dumped.
    pub(crate) fn sw_error_dumps(&self) -> usize {
        self.dumps.load(Ordering::Relaxed)
    }

    /// Execute every descriptor submitted since the last call,
    /// returning how many ran (batch children count separately).
    pub(crate) fn execute_pending(&self) -> usize {
        let pending: Vec<HwDesc> = {
            let captured = self.captured.lock().unwrap();
            let from = self.executed.swap(captured.len(), Ordering::Relaxed);
            captured[from..].iter().map(|(_, d)| *d).collect()
        };
        let mut ran = 0;
        for desc in &pending {
            ran += unsafe { self.execute_desc(desc) };
        }
        ran
    }

    fn next_injected(&self) -> u8 {
        self.injected.lock().unwrap().pop_front().unwrap_or(0x01)
    }

    /// Execute one descriptor against host memory and write its
    /// completion record. Returns how many descriptors ran (batches
    /// recurse).
    unsafe fn execute_desc(&self, desc: &HwDesc) -> usize {
        let opcode = desc.opcode();

        if opcode == Opcode::Batch.as_u8() {
            let count = desc.xfer_size as usize;
            let list = desc.src_addr as *const HwDesc;
            let mut ran = 0;
            for i in 0..count {
                let child = std::ptr::read(list.add(i));
                ran += self.execute_desc(&child);
            }
            self.complete(desc, 0x01, 0, 0, 0);
            return ran + 1;
        }

        let status = self.next_injected();
        let xfer = desc.xfer_size as usize;
        let mut result = 0u8;
        let mut crc = 0u32;
        let mut output = 0u32;

        match opcode {
            x if x == Opcode::MemMove.as_u8() => {
                std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, xfer);
            }
            x if x == Opcode::MemFill.as_u8() => {
                let pattern = desc.src_addr.to_le_bytes();
                let dst = std::slice::from_raw_parts_mut(desc.dst_addr as *mut u8, xfer);
                for (i, byte) in dst.iter_mut().enumerate() {
                    *byte = pattern[i % 8];
                }
            }
            x if x == Opcode::Compare.as_u8() => {
                let a = std::slice::from_raw_parts(desc.src_addr as *const u8, xfer);
                let b = std::slice::from_raw_parts(desc.dst_addr as *const u8, xfer);
                result = u8::from(a != b);
            }
            x if x == Opcode::Dualcast.as_u8() => {
                std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, xfer);
                std::ptr::copy(desc.src_addr as *const u8, desc.dest2() as *mut u8, xfer);
            }
            x if x == Opcode::CrcGen.as_u8() || x == Opcode::CopyCrc.as_u8() => {
                if x == Opcode::CopyCrc.as_u8() {
                    std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, xfer);
                }
                let seed = if desc.flags().contains(DescriptorFlags::CRC_READ_CRC_SEED) {
                    std::ptr::read_volatile(desc.crc_addr() as *const u32)
                } else {
                    desc.crc_seed()
                };
                let data = std::slice::from_raw_parts(desc.src_addr as *const u8, xfer);
                crc = raw_crc32c(seed, data);
            }
            x if x == Opcode::Compress.as_u8() => {
                let n = xfer.min(desc.iaa_max_dst_size() as usize);
                std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, n);
                output = n as u32;
            }
            x if x == Opcode::Decompress.as_u8() => {
                std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, xfer);
                output = xfer as u32;
            }
            // DIF ops, noop, drain, cache flush: status only.
            _ => {}
        }

        self.complete(desc, status, result, crc, output);
        1
    }

    unsafe fn complete(&self, desc: &HwDesc, status: u8, result: u8, crc: u32, output: u32) {
        let comp = desc.completion_addr as *mut CompletionRecord;
        (*comp).result = result;
        (*comp).crc32c_val = crc;
        (*comp).output_size = output;
        (*comp).bytes_completed = desc.xfer_size;
        // Status is written last; completion ordering hangs off it.
        std::ptr::write_volatile(&mut (*comp).status, status);
    }
}

impl DeviceOps for MockDevice {
    fn portal_base(&self) -> *mut u8 {
        self.portal.as_ptr() as *mut u8
    }

    fn translate(&self, buf: *const u8, size: u64) -> Result<(u64, u64)> {
        if self.translation_fails.load(Ordering::Relaxed) {
            return Err(Error::Translation);
        }
        let addr = buf as u64;
        let mut run = match self.run_size {
            Some(run_size) => run_size - (addr % run_size),
            None => size,
        };
        for &boundary in self.boundaries.lock().unwrap().iter() {
            if boundary > addr {
                run = run.min(boundary - addr);
            }
        }
        Ok((addr, run))
    }

    fn dump_sw_error(&self, _portal: *mut u8) {
        self.dumps.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn doorbell(&self, portal: *mut u8, desc: &HwDesc) {
        let offset = portal as usize - self.portal.as_ptr() as usize;
        debug_assert!(offset + 64 <= PORTAL_SIZE);
        self.captured.lock().unwrap().push((offset, *desc));
    }
}

/// Records callback invocations through the fn-pointer callback ABI.
/// The inner allocation is boxed so `arg()` stays stable if the log
/// itself moves.
pub(crate) struct CallbackLog(Box<Mutex<Vec<OpStatus>>>);

impl CallbackLog {
    pub(crate) fn new() -> Self {
        Self(Box::new(Mutex::new(Vec::new())))
    }

    /// The `cb_arg` to pass alongside [`CallbackLog::record`].
    pub(crate) fn arg(&self) -> u64 {
        &*self.0 as *const Mutex<Vec<OpStatus>> as u64
    }

    /// A [`crate::channel::ReqCallback`] that appends to the log.
    pub(crate) fn record(arg: u64, status: OpStatus) {
        let log = unsafe { &*(arg as *const Mutex<Vec<OpStatus>>) };
        log.lock().unwrap().push(status);
    }

    pub(crate) fn statuses(&self) -> Vec<OpStatus> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_crc32c_composes() {
        let data = b"hello accelerator world";
        let (a, b) = data.split_at(7);
        let whole = raw_crc32c(0xFFFF_FFFF, data);
        let chained = raw_crc32c(raw_crc32c(0xFFFF_FFFF, a), b);
        assert_eq!(whole, chained);
        // Inverted raw form with an all-ones seed is the standard CRC32C.
        assert_eq!(!whole, crc32c::crc32c(data));
    }

    #[test]
    fn test_translation_run_boundaries() {
        let dev = MockDevice::with_run_size(4096);
        let (addr, run) = dev.translate(0x1100 as *const u8, 8192).unwrap();
        assert_eq!(addr, 0x1100);
        assert_eq!(run, 4096 - 0x100);
    }

    #[test]
    fn test_executor_memmove_and_completion() {
        let dev = MockDevice::new_pasid();
        let src = [7u8; 64];
        let mut dst = [0u8; 64];
        let mut comp = CompletionRecord::new();

        let mut desc = HwDesc::new();
        desc.set_opcode(Opcode::MemMove);
        desc.src_addr = src.as_ptr() as u64;
        desc.dst_addr = dst.as_mut_ptr() as u64;
        desc.xfer_size = 64;
        desc.completion_addr = &mut comp as *mut _ as u64;

        unsafe { dev.execute_desc(&desc) };
        assert_eq!(dst, [7u8; 64]);
        assert_eq!(comp.raw_status(), 0x01);
        assert_eq!(comp.bytes_completed, 64);
    }
}
