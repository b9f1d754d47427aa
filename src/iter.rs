// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Buffer iteration: iovec lockstep walking and virtual-to-physical
//! run splitting.
//!
//! The device requires each descriptor's source and destination to be
//! physically contiguous. Splitting a request across physical
//! discontinuities is the sole job of the run iterators here; when the
//! device walks page tables itself (PASID), they collapse into identity
//! and emit the whole remaining range in one step.

use crate::device::DeviceOps;
use crate::error::Result;

/// A raw scatter/gather element.
///
/// Carries no lifetime: submission is asynchronous and the engine only
/// ever turns the base pointer into a device address. The caller keeps
/// the memory alive until the completion callback runs.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IoVec {
    base: *mut u8,
    len: u64,
}

impl IoVec {
    /// Create an element from a raw pointer and length.
    #[inline]
    pub fn new(base: *mut u8, len: u64) -> Self {
        Self { base, len }
    }

    /// Create an element covering a read-only buffer.
    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            base: buf.as_ptr() as *mut u8,
            len: buf.len() as u64,
        }
    }

    /// Create an element covering a writable buffer.
    #[inline]
    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            len: buf.len() as u64,
        }
    }

    /// Base pointer.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for a zero-length element.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Lockstep walk over two iovec lists.
///
/// Each step yields the current position in both lists and the number
/// of bytes until the shorter of the two current elements runs out.
pub(crate) struct IovPairIter<'a> {
    a: &'a [IoVec],
    b: &'a [IoVec],
    a_idx: usize,
    b_idx: usize,
    a_off: u64,
    b_off: u64,
}

impl<'a> IovPairIter<'a> {
    pub(crate) fn new(a: &'a [IoVec], b: &'a [IoVec]) -> Self {
        Self {
            a,
            b,
            a_idx: 0,
            b_idx: 0,
            a_off: 0,
            b_off: 0,
        }
    }

    /// Advance to the next aligned pair, or `None` when either list is
    /// exhausted.
    pub(crate) fn next(&mut self) -> Option<(*mut u8, *mut u8, u64)> {
        // Skip exhausted or zero-length elements.
        while self.a_idx < self.a.len() && self.a_off == self.a[self.a_idx].len() {
            self.a_idx += 1;
            self.a_off = 0;
        }
        while self.b_idx < self.b.len() && self.b_off == self.b[self.b_idx].len() {
            self.b_idx += 1;
            self.b_off = 0;
        }
        if self.a_idx >= self.a.len() || self.b_idx >= self.b.len() {
            return None;
        }

        let a_elem = &self.a[self.a_idx];
        let b_elem = &self.b[self.b_idx];
        let len = (a_elem.len() - self.a_off).min(b_elem.len() - self.b_off);
        let a_ptr = a_elem.base().wrapping_add(self.a_off as usize);
        let b_ptr = b_elem.base().wrapping_add(self.b_off as usize);

        self.a_off += len;
        self.b_off += len;

        Some((a_ptr, b_ptr, len))
    }
}

/// One contiguous device-addressable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunSeg {
    pub addr: u64,
    pub len: u64,
}

/// One contiguous source/destination pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairedSeg {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

fn translate_run(ops: &dyn DeviceOps, buf: *const u8, remaining: u64) -> Result<RunSeg> {
    let (addr, run) = ops.translate(buf, remaining).map_err(|e| {
        log::error!("error translating address {:p}", buf);
        e
    })?;
    Ok(RunSeg {
        addr,
        len: run.min(remaining),
    })
}

/// Iterator over the physically contiguous runs of a single buffer.
///
/// Single-pass and finite; terminates once `len` bytes were emitted.
pub(crate) struct SingleRunIter<'a> {
    ops: &'a dyn DeviceOps,
    buf: *const u8,
    len: u64,
    offset: u64,
    pasid_enabled: bool,
}

impl<'a> SingleRunIter<'a> {
    pub(crate) fn new(ops: &'a dyn DeviceOps, pasid_enabled: bool, buf: *const u8, len: u64) -> Self {
        Self {
            ops,
            buf,
            len,
            offset: 0,
            pasid_enabled,
        }
    }

    /// Emit the next contiguous run, at most `max` bytes long.
    pub(crate) fn next(&mut self, max: u64) -> Result<Option<RunSeg>> {
        if self.offset == self.len {
            return Ok(None);
        }
        let remaining = self.len - self.offset;
        let buf = self.buf.wrapping_add(self.offset as usize);

        let seg = if self.pasid_enabled {
            // The device walks the page tables itself.
            RunSeg {
                addr: buf as u64,
                len: remaining,
            }
        } else {
            translate_run(self.ops, buf, remaining)?
        };

        let len = seg.len.min(max);
        self.offset += len;
        Ok(Some(RunSeg { addr: seg.addr, len }))
    }
}

/// Iterator over the physically contiguous runs of a (source,
/// destination) pair advanced in lockstep.
///
/// Each step emits `min(src_run, dst_run, remaining, max)` bytes and
/// advances by exactly the emitted length, so a caller clipping with
/// `max` (the dual-cast inner walk) resumes mid-run on the next step.
pub(crate) struct PairedRunIter<'a> {
    ops: &'a dyn DeviceOps,
    src: *const u8,
    dst: *mut u8,
    len: u64,
    offset: u64,
    pasid_enabled: bool,
}

impl<'a> PairedRunIter<'a> {
    pub(crate) fn new(
        ops: &'a dyn DeviceOps,
        pasid_enabled: bool,
        src: *const u8,
        dst: *mut u8,
        len: u64,
    ) -> Self {
        Self {
            ops,
            src,
            dst,
            len,
            offset: 0,
            pasid_enabled,
        }
    }

    /// Emit the next contiguous pair, at most `max` bytes long.
    pub(crate) fn next(&mut self, max: u64) -> Result<Option<PairedSeg>> {
        if self.offset == self.len {
            return Ok(None);
        }
        let remaining = self.len - self.offset;
        let src = self.src.wrapping_add(self.offset as usize);
        let dst = self.dst.wrapping_add(self.offset as usize);

        if self.pasid_enabled {
            let len = remaining.min(max);
            self.offset += len;
            return Ok(Some(PairedSeg {
                src: src as u64,
                dst: dst as u64,
                len,
            }));
        }

        let src_seg = translate_run(self.ops, src, remaining)?;
        let dst_seg = translate_run(self.ops, dst, remaining)?;

        let len = src_seg.len.min(dst_seg.len).min(max);
        self.offset += len;
        Ok(Some(PairedSeg {
            src: src_seg.addr,
            dst: dst_seg.addr,
            len,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testutil::MockDevice;

    #[test]
    fn test_iov_pair_lockstep() {
        let a = [IoVec::new(0x1000 as *mut u8, 100), IoVec::new(0x2000 as *mut u8, 50)];
        let b = [IoVec::new(0x9000 as *mut u8, 60), IoVec::new(0xA000 as *mut u8, 90)];
        let mut iter = IovPairIter::new(&a, &b);

        let (pa, pb, len) = iter.next().unwrap();
        assert_eq!((pa as usize, pb as usize, len), (0x1000, 0x9000, 60));

        let (pa, pb, len) = iter.next().unwrap();
        assert_eq!((pa as usize, pb as usize, len), (0x1000 + 60, 0xA000, 40));

        let (pa, pb, len) = iter.next().unwrap();
        assert_eq!((pa as usize, pb as usize, len), (0x2000, 0xA000 + 40, 50));

        assert!(iter.next().is_none());
    }

    #[test]
    fn test_iov_pair_skips_empty_elements() {
        let a = [
            IoVec::new(0x1000 as *mut u8, 0),
            IoVec::new(0x2000 as *mut u8, 10),
        ];
        let b = [IoVec::new(0x9000 as *mut u8, 10)];
        let mut iter = IovPairIter::new(&a, &b);

        let (pa, _, len) = iter.next().unwrap();
        assert_eq!((pa as usize, len), (0x2000, 10));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_pasid_identity_single_step() {
        let dev = MockDevice::new_pasid();
        let src = vec![0u8; 8192];
        let mut dst = vec![0u8; 8192];

        let mut iter =
            PairedRunIter::new(&dev, true, src.as_ptr(), dst.as_mut_ptr(), 8192);
        let seg = iter.next(u64::MAX).unwrap().unwrap();
        assert_eq!(seg.src, src.as_ptr() as u64);
        assert_eq!(seg.dst, dst.as_mut_ptr() as u64);
        assert_eq!(seg.len, 8192);
        assert!(iter.next(u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_paired_splits_at_run_boundary() {
        // Identity translation with 4 KiB physical runs: a 12 KiB
        // transfer starting mid-run must split 4096/4096/4096 when both
        // sides share boundaries.
        let dev = MockDevice::with_run_size(4096);
        let src = MockDevice::aligned_buf(12288);
        let mut dst = MockDevice::aligned_buf(12288);

        let mut iter =
            PairedRunIter::new(&dev, false, src.as_ptr(), dst.as_mut_ptr(), 12288);
        let mut lens = Vec::new();
        while let Some(seg) = iter.next(u64::MAX).unwrap() {
            lens.push(seg.len);
        }
        assert_eq!(lens, vec![4096, 4096, 4096]);
    }

    #[test]
    fn test_clipped_advance_resumes_mid_run() {
        let dev = MockDevice::with_run_size(4096);
        let src = MockDevice::aligned_buf(4096);
        let mut dst = MockDevice::aligned_buf(4096);

        let mut iter =
            PairedRunIter::new(&dev, false, src.as_ptr(), dst.as_mut_ptr(), 4096);
        let first = iter.next(1000).unwrap().unwrap();
        assert_eq!(first.len, 1000);
        let second = iter.next(u64::MAX).unwrap().unwrap();
        assert_eq!(second.len, 3096);
        assert_eq!(second.src, first.src + 1000);
        assert!(iter.next(u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_translation_failure_propagates() {
        let dev = MockDevice::with_run_size(4096);
        dev.fail_translation();
        let buf = MockDevice::aligned_buf(64);

        let mut iter = SingleRunIter::new(&dev, false, buf.as_ptr(), 64);
        assert!(matches!(iter.next(u64::MAX), Err(Error::Translation)));
    }
}
