// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Producer side of the shared submission ring.
//!
//! The queue keeps a local tail distinct from the kernel-visible tail so a
//! batch of slot acquisitions costs one release store at flush time. The
//! single-producer discipline is a caller contract; the type only enforces
//! it within one `Ring` through `&mut` access.

use crate::sqe::SubmissionQueueEntry;
use crate::sys::{EnterFlags, SetupFlags, SqFlags, SqRingOffsets};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

#[derive(Debug)]
pub struct SubmissionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    kdropped: *const AtomicU32,
    array: *mut u32,
    sqes: *mut SubmissionQueueEntry,
    ring_mask: u32,
    ring_entries: u32,
    sqe_head: u32,
    sqe_tail: u32,
    sqe_shift: u32,
    sqpoll: bool,
}

impl SubmissionQueue {
    /// Fix up typed pointers into the mapped submission-queue header and
    /// entry array.
    ///
    /// # Safety
    ///
    /// `ring_base` and `sqes` must point at live mappings laid out per
    /// `off`, valid for the lifetime of the queue.
    pub(crate) unsafe fn from_raw(
        ring_base: *mut u8,
        sqes: *mut u8,
        off: &SqRingOffsets,
        setup: SetupFlags,
    ) -> Self {
        let at = |byte_off: u32| unsafe { ring_base.add(byte_off as usize) };
        SubmissionQueue {
            khead: at(off.head) as *const AtomicU32,
            ktail: at(off.tail) as *const AtomicU32,
            kflags: at(off.flags) as *const AtomicU32,
            kdropped: at(off.dropped) as *const AtomicU32,
            array: at(off.array) as *mut u32,
            sqes: sqes as *mut SubmissionQueueEntry,
            ring_mask: unsafe { *(at(off.ring_mask) as *const u32) },
            ring_entries: unsafe { *(at(off.ring_entries) as *const u32) },
            sqe_head: 0,
            sqe_tail: 0,
            sqe_shift: u32::from(setup.contains(SetupFlags::SQE128)),
            sqpoll: setup.contains(SetupFlags::SQPOLL),
        }
    }

    /// Realized capacity (power of two).
    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    fn kernel_head_acquire(&self) -> u32 {
        unsafe { (*self.khead).load(Ordering::Acquire) }
    }

    fn kernel_head(&self) -> u32 {
        // only a concurrently polling kernel thread warrants the fence
        let ordering = if self.sqpoll {
            Ordering::Acquire
        } else {
            Ordering::Relaxed
        };
        unsafe { (*self.khead).load(ordering) }
    }

    /// Kernel-written status word (wakeup needed, CQ overflowed, task work
    /// pending).
    pub fn flags(&self) -> SqFlags {
        SqFlags::from_bits_truncate(unsafe { (*self.kflags).load(Ordering::Acquire) })
    }

    /// Submissions the kernel discarded for malformed indices.
    pub fn dropped(&self) -> u32 {
        unsafe { (*self.kdropped).load(Ordering::Relaxed) }
    }

    /// Entries acquired (flushed or not) that the kernel has not consumed.
    pub fn ready(&self) -> u32 {
        self.sqe_tail.wrapping_sub(self.kernel_head())
    }

    /// Free slots before the producer runs into the kernel's head.
    pub fn space_left(&self) -> u32 {
        self.ring_entries - self.ready()
    }

    /// Acquire the next free descriptor slot, advancing the local tail
    /// only. Returns `None` when the ring is full; the caller must submit
    /// to make room.
    pub(crate) fn get_sqe(&mut self) -> Option<&mut SubmissionQueueEntry> {
        let head = self.kernel_head_acquire();
        let next = self.sqe_tail.wrapping_add(1);
        if next.wrapping_sub(head) > self.ring_entries {
            trace!(
                sqe_tail = self.sqe_tail,
                kernel_head = head,
                entries = self.ring_entries,
                "submission ring full"
            );
            return None;
        }
        let index = ((self.sqe_tail & self.ring_mask) << self.sqe_shift) as usize;
        self.sqe_tail = next;
        Some(unsafe { &mut *self.sqes.add(index) })
    }

    /// Publish locally acquired slots to the kernel with one release store.
    /// Returns how many published entries the kernel has yet to consume.
    pub(crate) fn flush(&mut self) -> u32 {
        let tail = self.sqe_tail;
        if self.sqe_head != tail {
            self.sqe_head = tail;
            unsafe { (*self.ktail).store(tail, Ordering::Release) };
        }
        tail.wrapping_sub(self.kernel_head_acquire())
    }

    /// Fill the index array with the identity mapping once after setup, so
    /// slot i always publishes entry i.
    pub(crate) fn init_array_identity(&mut self) {
        for i in 0..self.ring_entries {
            unsafe { self.array.add(i as usize).write(i) };
        }
    }
}

// Raw pointers into the mapping; the mapping moves with the owning Ring.
unsafe impl Send for SubmissionQueue {}

/// Whether publishing `to_submit` entries requires an enter call, and with
/// which extra flags. `None` means the kernel-side poller is awake and will
/// consume the queue on its own.
pub fn sq_needs_enter(setup: SetupFlags, sq_flags: SqFlags, to_submit: u32) -> Option<EnterFlags> {
    if to_submit == 0 {
        return None;
    }
    if !setup.contains(SetupFlags::SQPOLL) {
        return Some(EnterFlags::empty());
    }
    if sq_flags.contains(SqFlags::NEED_WAKEUP) {
        return Some(EnterFlags::SQ_WAKEUP);
    }
    None
}

/// Completions are stuck kernel-side (overflow or deferred task work) and
/// need an enter call to flush.
pub fn cq_needs_flush(sq_flags: SqFlags) -> bool {
    sq_flags.intersects(SqFlags::CQ_OVERFLOW | SqFlags::TASKRUN)
}

/// Reaping completions requires an enter call: always under IOPOLL,
/// otherwise only when a flush is pending.
pub fn cq_needs_enter(setup: SetupFlags, sq_flags: SqFlags) -> bool {
    setup.contains(SetupFlags::IOPOLL) || cq_needs_flush(sq_flags)
}

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
        flags: AtomicU32,
        dropped: AtomicU32,
        array: [u32; ENTRIES as usize],
    }

    struct FakeRing {
        header: Box<FakeHeader>,
        sqes: Box<[SubmissionQueueEntry; ENTRIES as usize]>,
        sq: SubmissionQueue,
    }

    impl FakeRing {
        fn kernel_consume(&self, n: u32) {
            let head = self.header.head.load(Ordering::Relaxed);
            self.header.head.store(head + n, Ordering::Release);
        }

        fn published_tail(&self) -> u32 {
            self.header.tail.load(Ordering::Acquire)
        }
    }

    #[fixture]
    fn ring() -> FakeRing {
        let header = Box::new(FakeHeader {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            ring_mask: ENTRIES - 1,
            ring_entries: ENTRIES,
            flags: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            array: [0; ENTRIES as usize],
        });
        let mut sqes = Box::new([SubmissionQueueEntry::zeroed(); ENTRIES as usize]);
        let sqes_base = sqes.as_mut_ptr() as *mut u8;
        let off = SqRingOffsets {
            head: std::mem::offset_of!(FakeHeader, head) as u32,
            tail: std::mem::offset_of!(FakeHeader, tail) as u32,
            ring_mask: std::mem::offset_of!(FakeHeader, ring_mask) as u32,
            ring_entries: std::mem::offset_of!(FakeHeader, ring_entries) as u32,
            flags: std::mem::offset_of!(FakeHeader, flags) as u32,
            dropped: std::mem::offset_of!(FakeHeader, dropped) as u32,
            array: std::mem::offset_of!(FakeHeader, array) as u32,
            resv1: 0,
            user_addr: 0,
        };
        let sq = unsafe {
            SubmissionQueue::from_raw(
                &*header as *const FakeHeader as *mut u8,
                sqes_base,
                &off,
                SetupFlags::empty(),
            )
        };
        FakeRing { header, sqes, sq }
    }

    #[rstest]
    fn test_capacity_invariant_through_acquire_and_flush(mut ring: FakeRing) {
        assert_eq!(ring.sq.capacity(), ENTRIES);
        for acquired in 1..=5 {
            assert!(ring.sq.get_sqe().is_some());
            assert_eq!(ring.sq.ready(), acquired);
            assert_eq!(ring.sq.space_left() + ring.sq.ready(), ENTRIES);
        }
        ring.sq.flush();
        assert_eq!(ring.sq.space_left() + ring.sq.ready(), ENTRIES);
        ring.kernel_consume(5);
        assert_eq!(ring.sq.ready(), 0);
        assert_eq!(ring.sq.space_left(), ENTRIES);
    }

    #[rstest]
    fn test_acquire_fails_exactly_at_capacity(mut ring: FakeRing) {
        for _ in 0..ENTRIES {
            assert!(ring.sq.get_sqe().is_some());
        }
        assert_eq!(ring.sq.ready(), ENTRIES);
        assert!(ring.sq.get_sqe().is_none());

        // flushing alone frees nothing; the kernel must consume
        ring.sq.flush();
        assert!(ring.sq.get_sqe().is_none());
        ring.kernel_consume(1);
        assert!(ring.sq.get_sqe().is_some());
    }

    #[rstest]
    fn test_flush_publishes_local_tail_once(mut ring: FakeRing) {
        assert_eq!(ring.published_tail(), 0);
        ring.sq.get_sqe().unwrap();
        ring.sq.get_sqe().unwrap();
        ring.sq.get_sqe().unwrap();
        assert_eq!(ring.published_tail(), 0, "nothing published before flush");

        assert_eq!(ring.sq.flush(), 3);
        assert_eq!(ring.published_tail(), 3);

        // no new acquisitions: flush reports pending but publishes nothing new
        assert_eq!(ring.sq.flush(), 3);
        ring.kernel_consume(3);
        assert_eq!(ring.sq.flush(), 0);
    }

    #[rstest]
    fn test_slot_index_wraps_with_mask(mut ring: FakeRing) {
        for round in 0u64..3 {
            for i in 0..ENTRIES {
                let sqe = ring.sq.get_sqe().unwrap();
                sqe.prepare_nop();
                sqe.set_data64(round * 100 + i as u64);
            }
            ring.sq.flush();
            ring.kernel_consume(ENTRIES);
        }
        // last round's tags live in slots 0..ENTRIES in order
        for (i, sqe) in ring.sqes.iter().enumerate() {
            assert_eq!(sqe.user_data, 200 + i as u64);
        }
    }

    #[rstest]
    #[case::no_submit(SetupFlags::empty(), SqFlags::empty(), 0, None)]
    #[case::plain_submit(SetupFlags::empty(), SqFlags::empty(), 1, Some(EnterFlags::empty()))]
    #[case::sqpoll_awake(SetupFlags::SQPOLL, SqFlags::empty(), 4, None)]
    #[case::sqpoll_asleep(
        SetupFlags::SQPOLL,
        SqFlags::NEED_WAKEUP,
        4,
        Some(EnterFlags::SQ_WAKEUP)
    )]
    #[case::sqpoll_nothing_to_do(SetupFlags::SQPOLL, SqFlags::NEED_WAKEUP, 0, None)]
    fn test_sq_needs_enter_decision(
        #[case] setup: SetupFlags,
        #[case] sq_flags: SqFlags,
        #[case] to_submit: u32,
        #[case] expected: Option<EnterFlags>,
    ) {
        assert_eq!(sq_needs_enter(setup, sq_flags, to_submit), expected);
    }

    #[rstest]
    #[case(SqFlags::empty(), false)]
    #[case(SqFlags::NEED_WAKEUP, false)]
    #[case(SqFlags::CQ_OVERFLOW, true)]
    #[case(SqFlags::TASKRUN, true)]
    fn test_cq_needs_flush_decision(#[case] sq_flags: SqFlags, #[case] expected: bool) {
        assert_eq!(cq_needs_flush(sq_flags), expected);
    }

    #[rstest]
    fn test_cq_needs_enter_under_iopoll() {
        assert!(cq_needs_enter(SetupFlags::IOPOLL, SqFlags::empty()));
        assert!(cq_needs_enter(SetupFlags::empty(), SqFlags::CQ_OVERFLOW));
        assert!(!cq_needs_enter(SetupFlags::empty(), SqFlags::empty()));
    }
}
