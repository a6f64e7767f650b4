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

//! Ring lifecycle and the submit/wait synchronization protocol.
//!
//! A [`Ring`] owns the mapped regions, the producer and consumer queue
//! state, and the descriptor used for the enter call. The wait protocol is
//! an explicit state machine (peek, decide, enter, at most one retry) so
//! the syscall-avoidance rules stay auditable: a ready completion is always
//! returned without entering the kernel, and a second miss after a syscall
//! is authoritative.

use crate::cqe::CompletionQueueEvent;
use crate::cqueue::CompletionQueue;
use crate::error::{Result, RingError};
use crate::memory::{self, RingMapping};
use crate::register::increase_rlimit_nofile;
use crate::sqe::SubmissionQueueEntry;
use crate::squeue::{self, SubmissionQueue};
use crate::sys::{self, EnterFlags, Features, Params, SetupFlags, SqFlags};
use bitflags::bitflags;
use libc::c_void;
use nix::errno::Errno;
use nix::sys::mman::{madvise, MmapAdvise};
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct IntFlags: u8 {
        /// The enter descriptor is a registered index, not a real fd.
        const REG_RING = 1 << 0;
        /// The kernel accepts registered-ring semantics on register calls.
        const REG_REG_RING = 1 << 1;
        /// Ring memory belongs to the caller; never unmapped here.
        const APP_MEM = 1 << 2;
    }
}

/// A live kernel ring: valid from creation until drop, at which point all
/// regions are unmapped and the descriptor closed exactly once.
#[derive(Debug)]
pub struct Ring {
    pub(crate) sq: SubmissionQueue,
    pub(crate) cq: CompletionQueue,
    mapping: RingMapping,
    pub(crate) flags: SetupFlags,
    pub(crate) features: Features,
    pub(crate) ring_fd: RawFd,
    pub(crate) enter_fd: RawFd,
    pub(crate) int_flags: IntFlags,
}

impl Ring {
    /// Create a ring with `entries` submission slots and default flags.
    pub fn new(entries: u32) -> Result<Ring> {
        Ring::with_params(entries, &mut Params::default())
    }

    pub fn with_flags(entries: u32, flags: SetupFlags) -> Result<Ring> {
        Ring::with_params(entries, &mut Params::new(flags))
    }

    /// Create a ring, negotiating through `p`; on return `p` carries the
    /// kernel's feature bits.
    pub fn with_params(entries: u32, p: &mut Params) -> Result<Ring> {
        Ring::init(entries, p, None)
    }

    /// Create a ring whose memory lives in `buf` instead of kernel-exported
    /// mappings. The buffer must outlive the ring and is never unmapped or
    /// freed here.
    pub fn with_buffer(entries: u32, p: &mut Params, buf: &mut [u8]) -> Result<Ring> {
        p.flags |= SetupFlags::NO_MMAP;
        Ring::init(entries, p, Some((buf.as_mut_ptr(), buf.len())))
    }

    fn init(entries: u32, p: &mut Params, buf: Option<(*mut u8, usize)>) -> Result<Ring> {
        if p.flags.contains(SetupFlags::REGISTERED_FD_ONLY)
            && !p.flags.contains(SetupFlags::NO_MMAP)
        {
            return Err(RingError::IncompatibleFlags(
                "REGISTERED_FD_ONLY requires NO_MMAP",
            ));
        }
        // range errors fail here, before any syscall
        memory::negotiate_entries(entries, p)?;

        let mut int_flags = IntFlags::empty();
        let premapped = if p.flags.contains(SetupFlags::NO_MMAP) {
            if buf.is_some() {
                int_flags |= IntFlags::APP_MEM;
            }
            Some(RingMapping::alloc(entries, p, buf)?)
        } else {
            None
        };

        // premapped regions unwind via drop if setup fails
        let fd = setup_with_fd_retry(entries, p)?;

        let mapping = match premapped {
            Some(m) => m,
            None => match RingMapping::map(fd, p) {
                Ok(m) => m,
                Err(err) => {
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
            },
        };

        let mut sq = unsafe {
            SubmissionQueue::from_raw(
                mapping.sq_ring.as_ptr() as *mut u8,
                mapping.sqes.as_ptr() as *mut u8,
                &p.sq_off,
                p.flags,
            )
        };
        let cq = unsafe {
            CompletionQueue::from_raw(
                mapping.cq_ring.as_ptr() as *mut u8,
                &p.cq_off,
                p.flags,
                p.features,
            )
        };
        sq.init_array_identity();

        let (ring_fd, enter_fd) = if p.flags.contains(SetupFlags::REGISTERED_FD_ONLY) {
            int_flags |= IntFlags::REG_RING | IntFlags::REG_REG_RING;
            (-1, fd)
        } else {
            (fd, fd)
        };

        debug!(
            sq_entries = p.sq_entries,
            cq_entries = p.cq_entries,
            features = p.features.bits(),
            fd = ring_fd,
            "ring created"
        );

        Ok(Ring {
            sq,
            cq,
            mapping,
            flags: p.flags,
            features: p.features,
            ring_fd,
            enter_fd,
            int_flags,
        })
    }

    /// Flags the ring was created with.
    pub fn setup_flags(&self) -> SetupFlags {
        self.flags
    }

    /// Feature bits the kernel reported at creation.
    pub fn features(&self) -> Features {
        self.features
    }

    /// The ring descriptor, or -1 when only a registered index exists.
    pub fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }

    pub fn sq_entries(&self) -> u32 {
        self.sq.capacity()
    }

    pub fn cq_entries(&self) -> u32 {
        self.cq.capacity()
    }

    /// Acquired submissions the kernel has not consumed yet.
    pub fn sq_ready(&self) -> u32 {
        self.sq.ready()
    }

    pub fn sq_space_left(&self) -> u32 {
        self.sq.space_left()
    }

    /// Submissions the kernel rejected for malformed indices.
    pub fn sq_dropped(&self) -> u32 {
        self.sq.dropped()
    }

    pub fn cq_ready(&self) -> u32 {
        self.cq.ready()
    }

    /// Completions dropped kernel-side for lack of completion-ring space.
    pub fn cq_overflow(&self) -> u32 {
        self.cq.overflow()
    }

    pub fn cq_has_overflow(&self) -> bool {
        self.sq.flags().contains(SqFlags::CQ_OVERFLOW)
    }

    /// Acquire the next free descriptor slot. `None` means the ring is
    /// full; submit first to make room.
    pub fn get_sqe(&mut self) -> Option<&mut SubmissionQueueEntry> {
        self.sq.get_sqe()
    }

    /// Read-only walk of all published completions, oldest first.
    pub fn for_each_cqe<F: FnMut(&CompletionQueueEvent)>(&self, f: F) {
        self.cq.for_each(f)
    }

    /// Release `n` consumed completions back to the kernel.
    pub fn cq_advance(&mut self, n: u32) {
        self.cq.advance(n)
    }

    /// Mark one completion consumed.
    pub fn cqe_seen(&mut self, _cqe: &CompletionQueueEvent) {
        self.cq_advance(1)
    }

    fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        mut flags: EnterFlags,
        arg: *const c_void,
        arg_size: usize,
    ) -> std::result::Result<u32, Errno> {
        if self.int_flags.contains(IntFlags::REG_RING) {
            flags |= EnterFlags::REGISTERED_RING;
        }
        trace!(
            to_submit,
            min_complete,
            flags = flags.bits(),
            "enter syscall"
        );
        sys::enter(
            self.enter_fd,
            to_submit,
            min_complete,
            flags.bits(),
            arg,
            arg_size,
        )
    }

    /// Publish pending submissions, entering the kernel only when the
    /// decision helpers say it cannot be avoided. Returns the number of
    /// submissions consumed.
    pub fn submit(&mut self) -> Result<u32> {
        let flushed = self.sq.flush();
        self.submit_inner(flushed, 0, false)
    }

    /// Publish pending submissions and block until `wait_nr` completions
    /// are available.
    pub fn submit_and_wait(&mut self, wait_nr: u32) -> Result<u32> {
        let flushed = self.sq.flush();
        self.submit_inner(flushed, wait_nr, false)
    }

    /// Publish pending submissions and flush any kernel-side completion
    /// backlog even if no wait is requested.
    pub fn submit_and_get_events(&mut self) -> Result<u32> {
        let flushed = self.sq.flush();
        self.submit_inner(flushed, 0, true)
    }

    fn submit_inner(&mut self, submitted: u32, wait_nr: u32, get_events: bool) -> Result<u32> {
        let cq_needs_enter =
            get_events || wait_nr != 0 || squeue::cq_needs_enter(self.flags, self.sq.flags());
        let sq_extra = squeue::sq_needs_enter(self.flags, self.sq.flags(), submitted);

        if sq_extra.is_none() && !cq_needs_enter {
            // kernel-side poller picks the batch up on its own
            return Ok(submitted);
        }

        let mut flags = sq_extra.unwrap_or(EnterFlags::empty());
        if cq_needs_enter {
            flags |= EnterFlags::GETEVENTS;
        }
        self.enter(
            submitted,
            wait_nr,
            flags,
            std::ptr::null(),
            sys::SIGSET_SIZE,
        )
        .map_err(RingError::from_wait_errno)
    }

    /// Force an enter that drains kernel-side completion state (overflow,
    /// deferred task work) into the completion ring.
    pub fn get_events(&mut self) -> Result<u32> {
        self.enter(
            0,
            0,
            EnterFlags::GETEVENTS,
            std::ptr::null(),
            sys::SIGSET_SIZE,
        )
        .map_err(RingError::from_wait_errno)
    }

    /// Under `SQPOLL`, block until the poller frees a submission slot.
    /// No-op otherwise or while space is available.
    pub fn sq_ring_wait(&mut self) -> Result<u32> {
        if !self.flags.contains(SetupFlags::SQPOLL) || self.sq.space_left() != 0 {
            return Ok(0);
        }
        self.enter(
            0,
            0,
            EnterFlags::SQ_WAIT,
            std::ptr::null(),
            sys::SIGSET_SIZE,
        )
        .map_err(RingError::from_wait_errno)
    }

    /// Drive the wait protocol until a completion, an authoritative miss,
    /// or an error. `to_submit` counts descriptors still unconsumed by the
    /// kernel; it shrinks as enter calls report progress.
    fn drive_wait(
        &mut self,
        mut to_submit: u32,
        wait_nr: u32,
        ext_flags: EnterFlags,
        arg: *const c_void,
        arg_size: usize,
        has_deadline: bool,
    ) -> Result<Option<CompletionQueueEvent>> {
        let mut looped = false;
        loop {
            let (cqe, available) = self.cq.peek().map_err(RingError::from_wait_errno)?;
            let step = wait_step(
                self.flags,
                self.sq.flags(),
                to_submit,
                wait_nr,
                available,
                cqe.is_some(),
                looped,
                has_deadline,
            );
            match step {
                WaitStep::Complete => return Ok(cqe),
                WaitStep::Block => return Err(RingError::WouldBlock),
                WaitStep::DeadlinePass => {
                    return cqe.map(Some).ok_or(RingError::TimedOut);
                }
                WaitStep::Enter(mut flags) => {
                    if flags.contains(EnterFlags::GETEVENTS) {
                        flags |= ext_flags;
                    }
                    let consumed = self
                        .enter(to_submit, wait_nr, flags, arg, arg_size)
                        .map_err(RingError::from_wait_errno)?;
                    to_submit = to_submit.saturating_sub(consumed);
                    if cqe.is_some() {
                        return Ok(cqe);
                    }
                    looped = true;
                }
            }
        }
    }

    fn get_cqe(
        &mut self,
        to_submit: u32,
        wait_nr: u32,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<Option<CompletionQueueEvent>> {
        let arg = sigmask.map_or(std::ptr::null(), |s| s as *const libc::sigset_t as *const c_void);
        self.drive_wait(
            to_submit,
            wait_nr,
            EnterFlags::empty(),
            arg,
            sys::SIGSET_SIZE,
            false,
        )
    }

    fn get_cqe_ext(
        &mut self,
        to_submit: u32,
        wait_nr: u32,
        ts: &libc::timespec,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<Option<CompletionQueueEvent>> {
        let arg = sys::GetEventsArg {
            sigmask: sigmask.map_or(0, |s| s as *const libc::sigset_t as u64),
            sigmask_sz: sys::SIGSET_SIZE as u32,
            pad: 0,
            ts: ts as *const libc::timespec as u64,
        };
        self.drive_wait(
            to_submit,
            wait_nr,
            EnterFlags::EXT_ARG,
            &arg as *const sys::GetEventsArg as *const c_void,
            std::mem::size_of::<sys::GetEventsArg>(),
            true,
        )
    }

    /// Inject a timeout descriptor carrying the reserved sentinel tag so a
    /// wait is bounded on kernels without the extended enter argument.
    /// Submits once to drain the ring if no slot is free.
    fn submit_timeout_descriptor(&mut self, wait_nr: u32, ts: &libc::timespec) -> Result<u32> {
        if self.sq.space_left() == 0 {
            self.submit()?;
        }
        let sqe = self.sq.get_sqe().ok_or(RingError::WouldBlock)?;
        sqe.prepare_timeout(ts, wait_nr, 0);
        sqe.set_data64(sys::UDATA_TIMEOUT);
        Ok(self.sq.flush())
    }

    /// Return the oldest ready completion without consuming it, flushing
    /// kernel-side backlog at most once. `None` when nothing is ready.
    pub fn peek_cqe(&mut self) -> Result<Option<CompletionQueueEvent>> {
        if let (Some(cqe), _) = self.cq.peek().map_err(RingError::from_wait_errno)? {
            return Ok(Some(cqe));
        }
        match self.get_cqe(0, 0, None) {
            Ok(cqe) => Ok(cqe),
            Err(RingError::WouldBlock) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Copy up to `out.len()` ready completions in arrival order without
    /// consuming them. When none are ready and the kernel signals an
    /// overflow backlog, forces a flush once before giving up.
    pub fn peek_batch_cqe(&mut self, out: &mut [CompletionQueueEvent]) -> Result<usize> {
        let n = self
            .cq
            .copy_ready_filtered(out)
            .map_err(RingError::from_wait_errno)?;
        if n > 0 {
            return Ok(n);
        }
        if squeue::cq_needs_flush(self.sq.flags()) {
            self.get_events()?;
            return self
                .cq
                .copy_ready_filtered(out)
                .map_err(RingError::from_wait_errno);
        }
        Ok(0)
    }

    /// Wait for one completion, returning immediately if one is ready.
    pub fn wait_cqe(&mut self) -> Result<CompletionQueueEvent> {
        if let (Some(cqe), _) = self.cq.peek().map_err(RingError::from_wait_errno)? {
            return Ok(cqe);
        }
        self.wait_cqe_nr(1)
    }

    /// Block until at least `wait_nr` completions are available and return
    /// the oldest.
    pub fn wait_cqe_nr(&mut self, wait_nr: u32) -> Result<CompletionQueueEvent> {
        self.get_cqe(0, wait_nr, None)?
            .ok_or(RingError::WouldBlock)
    }

    /// Block until `wait_nr` completions are available, a deadline elapses,
    /// or a signal arrives. Pending submissions are flushed first when a
    /// timeout descriptor has to be injected.
    pub fn wait_cqes(
        &mut self,
        wait_nr: u32,
        timeout: Option<Duration>,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<CompletionQueueEvent> {
        let cqe = match timeout {
            None => self.get_cqe(0, wait_nr, sigmask)?,
            Some(duration) => {
                let ts = timespec_from(duration);
                if self.features.contains(Features::EXT_ARG) {
                    self.get_cqe_ext(0, wait_nr, &ts, sigmask)?
                } else {
                    let to_submit = self.submit_timeout_descriptor(wait_nr, &ts)?;
                    self.get_cqe(to_submit, wait_nr, sigmask)?
                }
            }
        };
        cqe.ok_or(RingError::WouldBlock)
    }

    /// Wait for one completion with a deadline.
    pub fn wait_cqe_timeout(&mut self, timeout: Duration) -> Result<CompletionQueueEvent> {
        self.wait_cqes(1, Some(timeout), None)
    }

    /// Flush pending submissions and wait like [`wait_cqes`](Self::wait_cqes).
    pub fn submit_and_wait_timeout(
        &mut self,
        wait_nr: u32,
        timeout: Option<Duration>,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<CompletionQueueEvent> {
        let cqe = match timeout {
            Some(duration) => {
                let ts = timespec_from(duration);
                if self.features.contains(Features::EXT_ARG) {
                    let to_submit = self.sq.flush();
                    self.get_cqe_ext(to_submit, wait_nr, &ts, sigmask)?
                } else {
                    let to_submit = self.submit_timeout_descriptor(wait_nr, &ts)?;
                    self.get_cqe(to_submit, wait_nr, sigmask)?
                }
            }
            None => {
                let to_submit = self.sq.flush();
                self.get_cqe(to_submit, wait_nr, sigmask)?
            }
        };
        cqe.ok_or(RingError::WouldBlock)
    }

    /// Whether eventfd notifications are currently enabled on the
    /// completion ring.
    pub fn cq_eventfd_enabled(&self) -> bool {
        if !self.cq.has_flags_word() {
            return true;
        }
        self.cq.flags_word() & sys::CQ_EVENTFD_DISABLED == 0
    }

    /// Enable or suppress eventfd notifications without unregistering the
    /// eventfd.
    pub fn cq_eventfd_toggle(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.cq_eventfd_enabled() {
            return Ok(());
        }
        if !self.cq.has_flags_word() {
            return Err(RingError::Unsupported);
        }
        let mut flags = self.cq.flags_word();
        if enabled {
            flags &= !sys::CQ_EVENTFD_DISABLED;
        } else {
            flags |= sys::CQ_EVENTFD_DISABLED;
        }
        self.cq.set_flags_word(flags);
        Ok(())
    }

    /// Exclude every ring mapping from child processes after fork.
    pub fn dont_fork(&self) -> Result<()> {
        unsafe {
            madvise(
                self.mapping.sqes,
                self.mapping.sqes_size,
                MmapAdvise::MADV_DONTFORK,
            )?;
            madvise(
                self.mapping.sq_ring,
                self.mapping.sq_ring_size,
                MmapAdvise::MADV_DONTFORK,
            )?;
            if self.mapping.cq_ring != self.mapping.sq_ring {
                madvise(
                    self.mapping.cq_ring,
                    self.mapping.cq_ring_size,
                    MmapAdvise::MADV_DONTFORK,
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if self.int_flags.contains(IntFlags::REG_RING) && self.ring_fd != -1 {
            let _ = self.unregister_ring_fd();
        }
        if self.ring_fd >= 0 {
            unsafe { libc::close(self.ring_fd) };
        }
        debug!(fd = self.ring_fd, "ring torn down");
        // mapping unmaps on drop
    }
}

fn setup_with_fd_retry(entries: u32, p: &mut Params) -> Result<RawFd> {
    match sys::setup(entries, p) {
        Ok(fd) => Ok(fd),
        Err(Errno::EMFILE) => {
            // descriptor table full: raise the limit once and retry
            increase_rlimit_nofile(1)?;
            sys::setup(entries, p).map_err(RingError::from)
        }
        Err(errno) => Err(errno.into()),
    }
}

fn timespec_from(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

/// Bytes of lockable memory a ring of `entries` pins, for rlimit planning.
/// Zero on kernels whose workers are regular tasks.
pub fn mlock_size(entries: u32, flags: SetupFlags) -> Result<u64> {
    mlock_size_params(entries, &mut Params::new(flags))
}

pub fn mlock_size_params(entries: u32, p: &mut Params) -> Result<u64> {
    let probe_ring = Ring::new(2)?;
    let features = probe_ring.features();
    drop(probe_ring);

    if features.contains(Features::NATIVE_WORKERS) {
        return Ok(0);
    }

    let (sq_entries, cq_entries) = memory::negotiate_entries(entries, p)?;
    Ok(memory::rings_size(
        p.flags,
        sq_entries,
        cq_entries,
        memory::page_size() as u64,
    ))
}

/// What one pass of the wait protocol must do next, decided from explicit
/// counter and flag values only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStep {
    /// Hand the peeked state back to the caller; no syscall needed.
    Complete,
    /// Authoritative miss with nothing to do: would block.
    Block,
    /// The single post-deadline pass is exhausted.
    DeadlinePass,
    /// Enter the kernel with these flags.
    Enter(EnterFlags),
}

#[allow(clippy::too_many_arguments)]
fn wait_step(
    setup: SetupFlags,
    sq_flags: SqFlags,
    to_submit: u32,
    wait_nr: u32,
    available: u32,
    have_cqe: bool,
    looped: bool,
    has_deadline: bool,
) -> WaitStep {
    let mut flags = EnterFlags::empty();
    let mut need_enter = false;

    if !have_cqe && wait_nr == 0 && to_submit == 0 {
        // nothing to return, nothing to do -- unless completions are stuck
        // kernel-side and this is the first pass
        if looped || !squeue::cq_needs_enter(setup, sq_flags) {
            return WaitStep::Block;
        }
        need_enter = true;
    }
    if wait_nr > available || need_enter {
        flags |= EnterFlags::GETEVENTS;
        need_enter = true;
    }
    if let Some(extra) = squeue::sq_needs_enter(setup, sq_flags, to_submit) {
        flags |= extra;
        need_enter = true;
    }
    if !need_enter {
        return WaitStep::Complete;
    }
    if looped && has_deadline {
        return WaitStep::DeadlinePass;
    }
    WaitStep::Enter(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const NONE: SqFlags = SqFlags::empty();

    #[rstest]
    #[case::ready_completion_short_circuits(
        SetupFlags::empty(), NONE, 0, 1, 1, true, false, false, WaitStep::Complete
    )]
    #[case::nothing_anywhere_blocks(
        SetupFlags::empty(), NONE, 0, 0, 0, false, false, false, WaitStep::Block
    )]
    #[case::overflow_forces_flush_enter(
        SetupFlags::empty(), SqFlags::CQ_OVERFLOW, 0, 0, 0, false, false, false,
        WaitStep::Enter(EnterFlags::GETEVENTS)
    )]
    #[case::overflow_flush_only_once(
        SetupFlags::empty(), SqFlags::CQ_OVERFLOW, 0, 0, 0, false, true, false, WaitStep::Block
    )]
    #[case::short_wait_enters(
        SetupFlags::empty(), NONE, 0, 4, 1, true, false, false,
        WaitStep::Enter(EnterFlags::GETEVENTS)
    )]
    #[case::submit_only_enters_without_getevents(
        SetupFlags::empty(), NONE, 3, 0, 0, false, false, false,
        WaitStep::Enter(EnterFlags::empty())
    )]
    #[case::sqpoll_awake_submit_skips_syscall(
        SetupFlags::SQPOLL, NONE, 3, 0, 1, true, false, false, WaitStep::Complete
    )]
    #[case::sqpoll_asleep_adds_wakeup(
        SetupFlags::SQPOLL, SqFlags::NEED_WAKEUP, 3, 1, 0, false, false, false,
        WaitStep::Enter(EnterFlags::GETEVENTS.union(EnterFlags::SQ_WAKEUP))
    )]
    #[case::deadline_second_miss_is_final(
        SetupFlags::empty(), NONE, 0, 1, 0, false, true, true, WaitStep::DeadlinePass
    )]
    #[case::no_deadline_second_pass_enters_again(
        SetupFlags::empty(), NONE, 0, 1, 0, false, true, false,
        WaitStep::Enter(EnterFlags::GETEVENTS)
    )]
    #[allow(clippy::too_many_arguments)]
    fn test_wait_step_decision_table(
        #[case] setup: SetupFlags,
        #[case] sq_flags: SqFlags,
        #[case] to_submit: u32,
        #[case] wait_nr: u32,
        #[case] available: u32,
        #[case] have_cqe: bool,
        #[case] looped: bool,
        #[case] has_deadline: bool,
        #[case] expected: WaitStep,
    ) {
        assert_eq!(
            wait_step(
                setup,
                sq_flags,
                to_submit,
                wait_nr,
                available,
                have_cqe,
                looped,
                has_deadline
            ),
            expected
        );
    }

    #[test]
    fn test_deadline_pass_with_ready_cqe_completes() {
        // a completion that arrived during the enter pass wins over the
        // deadline classification
        let step = wait_step(
            SetupFlags::empty(),
            NONE,
            0,
            2,
            1,
            true,
            true,
            true,
        );
        assert_eq!(step, WaitStep::DeadlinePass);
    }

    #[test]
    fn test_timespec_conversion() {
        let ts = timespec_from(Duration::from_millis(1500));
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_incompatible_flag_combination_fails_before_syscall() {
        let err = Ring::with_flags(8, SetupFlags::REGISTERED_FD_ONLY).unwrap_err();
        assert!(matches!(err, RingError::IncompatibleFlags(_)));
    }

    #[test]
    fn test_invalid_entry_counts_fail_before_syscall() {
        assert!(matches!(
            Ring::new(0).unwrap_err(),
            RingError::InvalidEntries(0)
        ));
        assert!(matches!(
            Ring::new(100_000).unwrap_err(),
            RingError::InvalidEntries(_)
        ));
    }
}
