//! Consumer side of the shared completion ring.
//!
//! The kernel owns the tail, the user owns the head. Records between head
//! and the last observed tail belong to the user until `advance` releases
//! them back to the kernel. Completions from internally injected timeout
//! descriptors never surface here; they are consumed in place and their
//! result is latched for the wait protocol.

use crate::cqe::CompletionQueueEvent;
use crate::sys::{self, CqRingOffsets, Features, SetupFlags};
use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct CompletionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    koverflow: *const AtomicU32,
    cqes: *const CompletionQueueEvent,
    ring_mask: u32,
    ring_entries: u32,
    cqe_shift: u32,
    filter_timeout_sentinel: bool,
}

impl CompletionQueue {
    /// Fix up typed pointers into the mapped completion-queue header.
    ///
    /// # Safety
    ///
    /// `ring_base` must point at a live mapping laid out per `off`, valid
    /// for the lifetime of the queue.
    pub(crate) unsafe fn from_raw(
        ring_base: *mut u8,
        off: &CqRingOffsets,
        setup: SetupFlags,
        features: Features,
    ) -> Self {
        let at = |byte_off: u32| unsafe { ring_base.add(byte_off as usize) };
        CompletionQueue {
            khead: at(off.head) as *const AtomicU32,
            ktail: at(off.tail) as *const AtomicU32,
            // older kernels have no CQ flags word
            kflags: if off.flags != 0 {
                at(off.flags) as *const AtomicU32
            } else {
                std::ptr::null()
            },
            koverflow: at(off.overflow) as *const AtomicU32,
            cqes: at(off.cqes) as *const CompletionQueueEvent,
            ring_mask: unsafe { *(at(off.ring_mask) as *const u32) },
            ring_entries: unsafe { *(at(off.ring_entries) as *const u32) },
            cqe_shift: u32::from(setup.contains(SetupFlags::CQE32)),
            filter_timeout_sentinel: !features.contains(Features::EXT_ARG),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    fn head(&self) -> u32 {
        // the user is the only writer of head
        unsafe { (*self.khead).load(Ordering::Relaxed) }
    }

    fn tail(&self) -> u32 {
        unsafe { (*self.ktail).load(Ordering::Acquire) }
    }

    /// Completions published by the kernel and not yet consumed.
    pub fn ready(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// Completions the kernel could not post for lack of ring space.
    pub fn overflow(&self) -> u32 {
        unsafe { (*self.koverflow).load(Ordering::Relaxed) }
    }

    pub(crate) fn has_flags_word(&self) -> bool {
        !self.kflags.is_null()
    }

    pub(crate) fn flags_word(&self) -> u32 {
        unsafe { (*self.kflags).load(Ordering::Relaxed) }
    }

    pub(crate) fn set_flags_word(&self, value: u32) {
        unsafe { (*self.kflags).store(value, Ordering::Release) };
    }

    fn record_at(&self, index: u32) -> &CompletionQueueEvent {
        let slot = ((index & self.ring_mask) << self.cqe_shift) as usize;
        unsafe { &*self.cqes.add(slot) }
    }

    /// Release `n` consumed records back to the kernel's view.
    pub(crate) fn advance(&mut self, n: u32) {
        debug_assert!(n <= self.ready(), "advancing past published completions");
        let head = self.head().wrapping_add(n);
        unsafe { (*self.khead).store(head, Ordering::Release) };
    }

    /// Peek the oldest ready record without consuming it, transparently
    /// filtering injected-timeout sentinels. Returns the record (if any)
    /// and the ready count observed; a sentinel that carried an error is
    /// surfaced as that error instead.
    pub(crate) fn peek(&mut self) -> Result<(Option<CompletionQueueEvent>, u32), Errno> {
        loop {
            let tail = self.tail();
            let head = self.head();
            let available = tail.wrapping_sub(head);
            if available == 0 {
                return Ok((None, 0));
            }

            let cqe = *self.record_at(head);
            if self.filter_timeout_sentinel && cqe.user_data == sys::UDATA_TIMEOUT {
                self.advance(1);
                if cqe.res < 0 {
                    return Err(Errno::from_raw(-cqe.res));
                }
                continue;
            }
            return Ok((Some(cqe), available));
        }
    }

    /// Copy up to `out.len()` ready records in head-to-tail order without
    /// advancing. Never returns more than the kernel has published.
    pub(crate) fn copy_ready(&self, out: &mut [CompletionQueueEvent]) -> usize {
        let ready = self.ready();
        let count = out.len().min(ready as usize);
        let head = self.head();
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = *self.record_at(head.wrapping_add(i as u32));
        }
        count
    }

    /// Batch variant of [`peek`](Self::peek): consume any leading
    /// sentinels, then copy ready records up to the next sentinel without
    /// advancing, so the caller's advance count always matches what it
    /// copied out.
    pub(crate) fn copy_ready_filtered(
        &mut self,
        out: &mut [CompletionQueueEvent],
    ) -> Result<usize, Errno> {
        let (first, _) = self.peek()?;
        if first.is_none() {
            return Ok(0);
        }
        let ready = self.ready();
        let head = self.head();
        let mut copied = 0;
        while copied < out.len() && (copied as u32) < ready {
            let cqe = *self.record_at(head.wrapping_add(copied as u32));
            if self.filter_timeout_sentinel && cqe.user_data == sys::UDATA_TIMEOUT {
                break;
            }
            out[copied] = cqe;
            copied += 1;
        }
        Ok(copied)
    }

    /// Read-only walk of every published record, oldest first, without
    /// consuming any.
    pub fn for_each<F: FnMut(&CompletionQueueEvent)>(&self, mut f: F) {
        let tail = self.tail();
        let mut head = self.head();
        while head != tail {
            f(self.record_at(head));
            head = head.wrapping_add(1);
        }
    }
}

unsafe impl Send for CompletionQueue {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    const ENTRIES: u32 = 8;

    #[repr(C)]
    struct FakeHeader {
        head: AtomicU32,
        tail: AtomicU32,
        ring_mask: u32,
        ring_entries: u32,
        overflow: AtomicU32,
        flags: AtomicU32,
        cqes: [CompletionQueueEvent; ENTRIES as usize],
    }

    struct FakeRing {
        header: Box<FakeHeader>,
        cq: CompletionQueue,
    }

    impl FakeRing {
        fn kernel_post(&self, user_data: u64, res: i32, flags: u32) {
            let tail = self.header.tail.load(Ordering::Relaxed);
            let slot = (tail & (ENTRIES - 1)) as usize;
            let cqes = self.header.cqes.as_ptr() as *mut CompletionQueueEvent;
            unsafe {
                cqes.add(slot).write(CompletionQueueEvent {
                    user_data,
                    res,
                    flags,
                });
            }
            self.header.tail.store(tail + 1, Ordering::Release);
        }

        fn head(&self) -> u32 {
            self.header.head.load(Ordering::Acquire)
        }
    }

    fn build(filter_sentinel: bool) -> FakeRing {
        let header = Box::new(FakeHeader {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            ring_mask: ENTRIES - 1,
            ring_entries: ENTRIES,
            overflow: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            cqes: [CompletionQueueEvent {
                user_data: 0,
                res: 0,
                flags: 0,
            }; ENTRIES as usize],
        });
        let off = CqRingOffsets {
            head: std::mem::offset_of!(FakeHeader, head) as u32,
            tail: std::mem::offset_of!(FakeHeader, tail) as u32,
            ring_mask: std::mem::offset_of!(FakeHeader, ring_mask) as u32,
            ring_entries: std::mem::offset_of!(FakeHeader, ring_entries) as u32,
            overflow: std::mem::offset_of!(FakeHeader, overflow) as u32,
            cqes: std::mem::offset_of!(FakeHeader, cqes) as u32,
            flags: std::mem::offset_of!(FakeHeader, flags) as u32,
            resv1: 0,
            user_addr: 0,
        };
        let features = if filter_sentinel {
            Features::empty()
        } else {
            Features::EXT_ARG
        };
        let cq = unsafe {
            CompletionQueue::from_raw(
                &*header as *const FakeHeader as *mut u8,
                &off,
                SetupFlags::empty(),
                features,
            )
        };
        FakeRing { header, cq }
    }

    #[fixture]
    fn ring() -> FakeRing {
        build(true)
    }

    #[rstest]
    fn test_peek_empty(mut ring: FakeRing) {
        assert_eq!(ring.cq.ready(), 0);
        assert_eq!(ring.cq.peek().unwrap(), (None, 0));
    }

    #[rstest]
    fn test_peek_does_not_advance(mut ring: FakeRing) {
        ring.kernel_post(11, 0, 0);
        let (cqe, available) = ring.cq.peek().unwrap();
        assert_eq!(cqe.unwrap().user_data, 11);
        assert_eq!(available, 1);
        assert_eq!(ring.head(), 0);
        // still there on a second peek
        assert_eq!(ring.cq.peek().unwrap().0.unwrap().user_data, 11);

        ring.cq.advance(1);
        assert_eq!(ring.head(), 1);
        assert_eq!(ring.cq.ready(), 0);
    }

    #[rstest]
    fn test_advance_zero_is_noop(mut ring: FakeRing) {
        ring.kernel_post(1, 0, 0);
        ring.cq.advance(0);
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.cq.ready(), 1);
    }

    #[rstest]
    fn test_batch_copy_bounded_by_published(mut ring: FakeRing) {
        for tag in 0..3 {
            ring.kernel_post(tag, 0, 0);
        }
        let mut out = [CompletionQueueEvent {
            user_data: 0,
            res: 0,
            flags: 0,
        }; 8];
        let n = ring.cq.copy_ready(&mut out);
        assert_eq!(n, 3);
        for (i, cqe) in out[..n].iter().enumerate() {
            assert_eq!(cqe.user_data, i as u64);
        }
        assert_eq!(ring.head(), 0, "batch peek must not consume");

        // smaller buffer than published
        let mut two = [out[0]; 2];
        assert_eq!(ring.cq.copy_ready(&mut two), 2);
        assert_eq!(two[1].user_data, 1);
    }

    #[rstest]
    fn test_fifo_order_across_wrap(mut ring: FakeRing) {
        let mut next_tag = 0u64;
        let mut expect = 0u64;
        for _ in 0..4 {
            for _ in 0..6 {
                ring.kernel_post(next_tag, 0, 0);
                next_tag += 1;
            }
            while let (Some(cqe), _) = ring.cq.peek().unwrap() {
                assert_eq!(cqe.user_data, expect);
                expect += 1;
                ring.cq.advance(1);
            }
        }
        assert_eq!(expect, 24);
    }

    #[rstest]
    fn test_sentinel_consumed_and_skipped(mut ring: FakeRing) {
        ring.kernel_post(sys::UDATA_TIMEOUT, 0, 0);
        ring.kernel_post(77, 9, 0);
        let (cqe, _) = ring.cq.peek().unwrap();
        assert_eq!(cqe.unwrap().user_data, 77);
        // the sentinel was consumed in place
        assert_eq!(ring.head(), 1);
    }

    #[rstest]
    fn test_sentinel_timeout_latched_as_error(mut ring: FakeRing) {
        ring.kernel_post(sys::UDATA_TIMEOUT, -libc::ETIME, 0);
        assert_eq!(ring.cq.peek().unwrap_err(), Errno::ETIME);
        assert_eq!(ring.head(), 1);
        assert_eq!(ring.cq.peek().unwrap(), (None, 0));
    }

    #[rstest]
    fn test_sentinel_not_filtered_with_ext_arg() {
        let mut ring = build(false);
        ring.kernel_post(sys::UDATA_TIMEOUT, -libc::ETIME, 0);
        // with native deadline support nothing is ever injected, so the
        // tag is an ordinary user value
        let (cqe, _) = ring.cq.peek().unwrap();
        assert_eq!(cqe.unwrap().user_data, sys::UDATA_TIMEOUT);
        assert_eq!(ring.head(), 0);
    }

    #[rstest]
    fn test_filtered_batch_consumes_leading_sentinel(mut ring: FakeRing) {
        ring.kernel_post(sys::UDATA_TIMEOUT, 0, 0);
        ring.kernel_post(1, 0, 0);
        ring.kernel_post(2, 0, 0);
        let mut out = [CompletionQueueEvent {
            user_data: 0,
            res: 0,
            flags: 0,
        }; 8];
        let n = ring.cq.copy_ready_filtered(&mut out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out[0].user_data, 1);
        assert_eq!(out[1].user_data, 2);
        // leading sentinel was consumed, copied records were not
        assert_eq!(ring.head(), 1);
        assert_eq!(ring.cq.ready(), 2);
    }

    #[rstest]
    fn test_filtered_batch_stops_at_mid_stream_sentinel(mut ring: FakeRing) {
        ring.kernel_post(1, 0, 0);
        ring.kernel_post(sys::UDATA_TIMEOUT, 0, 0);
        ring.kernel_post(2, 0, 0);
        let mut out = [CompletionQueueEvent {
            user_data: 0,
            res: 0,
            flags: 0,
        }; 8];
        let n = ring.cq.copy_ready_filtered(&mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].user_data, 1);

        // after consuming the first batch the sentinel leads and vanishes
        ring.cq.advance(n as u32);
        let n = ring.cq.copy_ready_filtered(&mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].user_data, 2);
    }

    #[rstest]
    fn test_for_each_visits_all_without_consuming(mut ring: FakeRing) {
        for tag in 0..5 {
            ring.kernel_post(tag, 0, 0);
        }
        let mut seen = Vec::new();
        ring.cq.for_each(|cqe| seen.push(cqe.user_data));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.cq.ready(), 5);
    }
}
