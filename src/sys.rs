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

//! Raw syscall gateway and kernel ABI definitions.
//!
//! Everything in this module is a bit-for-bit contract with the running
//! kernel: the three `io_uring` syscalls, the setup negotiation structure,
//! the ring-header offset tables, and the flag words exchanged through
//! shared memory. None of it is interpreted here beyond errno propagation.

use bitflags::bitflags;
use libc::c_void;
use nix::errno::Errno;
use std::os::fd::RawFd;

/// `io_uring_setup(2)`: negotiate ring parameters and obtain the ring
/// descriptor. The kernel fills the offset tables and feature bits in `p`.
pub(crate) fn setup(entries: u32, p: &mut Params) -> Result<RawFd, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_ulong,
            p as *mut Params,
        )
    };
    Errno::result(ret).map(|fd| fd as RawFd)
}

/// `io_uring_enter(2)`: publish up to `to_submit` descriptors and/or block
/// until `min_complete` completions are ready. Returns the number of
/// submissions the kernel consumed.
pub(crate) fn enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
    arg: *const c_void,
    arg_size: usize,
) -> Result<u32, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd,
            to_submit as libc::c_ulong,
            min_complete as libc::c_ulong,
            flags as libc::c_ulong,
            arg,
            arg_size,
        )
    };
    Errno::result(ret).map(|n| n as u32)
}

/// `io_uring_register(2)`: install or remove a resource table.
pub(crate) fn register(
    fd: RawFd,
    opcode: u32,
    arg: *const c_void,
    nr_args: u32,
) -> Result<u32, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd,
            opcode as libc::c_ulong,
            arg,
            nr_args as libc::c_ulong,
        )
    };
    Errno::result(ret).map(|n| n as u32)
}

/// Size of the kernel-side signal set passed through the enter call,
/// independent of the (larger) libc `sigset_t`.
pub(crate) const SIGSET_SIZE: usize = 8;

/// Reserved user tag carried by internally injected timeout descriptors.
/// Never surfaced to callers; see `CompletionQueue`.
pub(crate) const UDATA_TIMEOUT: u64 = u64::MAX;

/// Hard kernel ceiling on submission entries.
pub const KERN_MAX_ENTRIES: u32 = 32768;
/// Hard kernel ceiling on completion entries.
pub const KERN_MAX_CQ_ENTRIES: u32 = 2 * KERN_MAX_ENTRIES;

// mmap offsets selecting which ring region a map call refers to.
pub(crate) const MMAP_OFF_SQ_RING: libc::off_t = 0;
pub(crate) const MMAP_OFF_CQ_RING: libc::off_t = 0x8000000;
pub(crate) const MMAP_OFF_SQES: libc::off_t = 0x10000000;
#[allow(dead_code)]
pub(crate) const MMAP_OFF_PBUF_RING: libc::off_t = 0x80000000;

bitflags! {
    /// Flags requested at ring creation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct SetupFlags: u32 {
        const IOPOLL = 1 << 0;
        const SQPOLL = 1 << 1;
        const SQ_AFF = 1 << 2;
        const CQSIZE = 1 << 3;
        const CLAMP = 1 << 4;
        const ATTACH_WQ = 1 << 5;
        const R_DISABLED = 1 << 6;
        const SUBMIT_ALL = 1 << 7;
        const COOP_TASKRUN = 1 << 8;
        const TASKRUN_FLAG = 1 << 9;
        const SQE128 = 1 << 10;
        const CQE32 = 1 << 11;
        const SINGLE_ISSUER = 1 << 12;
        const DEFER_TASKRUN = 1 << 13;
        const NO_MMAP = 1 << 14;
        const REGISTERED_FD_ONLY = 1 << 15;
    }
}

bitflags! {
    /// Feature bits reported back by the kernel at creation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Features: u32 {
        const SINGLE_MMAP = 1 << 0;
        const NODROP = 1 << 1;
        const SUBMIT_STABLE = 1 << 2;
        const RW_CUR_POS = 1 << 3;
        const CUR_PERSONALITY = 1 << 4;
        const FAST_POLL = 1 << 5;
        const POLL_32BITS = 1 << 6;
        const SQPOLL_NONFIXED = 1 << 7;
        const EXT_ARG = 1 << 8;
        const NATIVE_WORKERS = 1 << 9;
        const RSRC_TAGS = 1 << 10;
        const CQE_SKIP = 1 << 11;
        const LINKED_FILE = 1 << 12;
        const REG_REG_RING = 1 << 13;
    }
}

bitflags! {
    /// Kernel-written status word in the submission-queue header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct SqFlags: u32 {
        const NEED_WAKEUP = 1 << 0;
        const CQ_OVERFLOW = 1 << 1;
        const TASKRUN = 1 << 2;
    }
}

bitflags! {
    /// Flags passed to the enter call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct EnterFlags: u32 {
        const GETEVENTS = 1 << 0;
        const SQ_WAKEUP = 1 << 1;
        const SQ_WAIT = 1 << 2;
        const EXT_ARG = 1 << 3;
        const REGISTERED_RING = 1 << 4;
    }
}

impl Default for SetupFlags {
    fn default() -> Self {
        SetupFlags::empty()
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::empty()
    }
}

/// Completion-queue header flag disabling eventfd notification.
pub(crate) const CQ_EVENTFD_DISABLED: u32 = 1 << 0;

/// Byte offsets of the submission-queue header fields, filled by the kernel
/// at setup. `user_addr` feeds the application-memory path back in.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SqRingOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) flags: u32,
    pub(crate) dropped: u32,
    pub(crate) array: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// Byte offsets of the completion-queue header fields.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CqRingOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) overflow: u32,
    pub(crate) cqes: u32,
    pub(crate) flags: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// Setup negotiation structure. Exchanged once at creation; only the flag
/// and feature bits remain meaningful afterwards.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Params {
    pub(crate) sq_entries: u32,
    pub(crate) cq_entries: u32,
    pub flags: SetupFlags,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub(crate) features: Features,
    pub wq_fd: u32,
    resv: [u32; 3],
    pub(crate) sq_off: SqRingOffsets,
    pub(crate) cq_off: CqRingOffsets,
}

impl Params {
    pub fn new(flags: SetupFlags) -> Self {
        Params {
            flags,
            ..Default::default()
        }
    }

    /// Request an explicit completion-queue size instead of the default
    /// 2x submission capacity.
    pub fn cq_entries(mut self, entries: u32) -> Self {
        self.cq_entries = entries;
        self.flags |= SetupFlags::CQSIZE;
        self
    }

    /// Feature bits the kernel reported back; empty before setup.
    pub fn features(&self) -> Features {
        self.features
    }
}

/// Extended argument for the enter call on kernels with `Features::EXT_ARG`:
/// carries the signal mask and an inline wait deadline.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct GetEventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub pad: u32,
    pub ts: u64,
}

/// Register opcodes for the resource-registration syscall.
pub(crate) mod regop {
    pub const REGISTER_BUFFERS: u32 = 0;
    pub const UNREGISTER_BUFFERS: u32 = 1;
    pub const REGISTER_FILES: u32 = 2;
    pub const UNREGISTER_FILES: u32 = 3;
    pub const REGISTER_EVENTFD: u32 = 4;
    pub const UNREGISTER_EVENTFD: u32 = 5;
    pub const REGISTER_FILES_UPDATE: u32 = 6;
    pub const REGISTER_EVENTFD_ASYNC: u32 = 7;
    pub const REGISTER_PROBE: u32 = 8;
    pub const REGISTER_PERSONALITY: u32 = 9;
    pub const UNREGISTER_PERSONALITY: u32 = 10;
    pub const REGISTER_RESTRICTIONS: u32 = 11;
    pub const REGISTER_ENABLE_RINGS: u32 = 12;
    pub const REGISTER_FILES2: u32 = 13;
    pub const REGISTER_FILES_UPDATE2: u32 = 14;
    pub const REGISTER_BUFFERS2: u32 = 15;
    pub const REGISTER_BUFFERS_UPDATE: u32 = 16;
    pub const REGISTER_IOWQ_AFF: u32 = 17;
    pub const UNREGISTER_IOWQ_AFF: u32 = 18;
    pub const REGISTER_IOWQ_MAX_WORKERS: u32 = 19;
    pub const REGISTER_RING_FDS: u32 = 20;
    pub const UNREGISTER_RING_FDS: u32 = 21;
    pub const REGISTER_PBUF_RING: u32 = 22;
    pub const UNREGISTER_PBUF_RING: u32 = 23;
    pub const REGISTER_SYNC_CANCEL: u32 = 24;
    pub const REGISTER_FILE_ALLOC_RANGE: u32 = 25;

    /// OR'ed into the opcode when the ring descriptor itself is registered.
    pub const USE_REGISTERED_RING: u32 = 1 << 31;
}

/// Sentinel offset requesting "any free slot" when registering the ring
/// descriptor itself.
pub(crate) const REGISTER_RING_FD_OFFSET: u32 = u32::MAX;

/// Sparse-table flag for the two-part resource registration structs.
pub(crate) const RSRC_REGISTER_SPARSE: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct FilesUpdate {
    pub offset: u32,
    pub resv: u32,
    pub fds: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct RsrcRegister {
    pub nr: u32,
    pub flags: u32,
    pub resv2: u64,
    pub data: u64,
    pub tags: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct RsrcUpdate {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct RsrcUpdate2 {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
    pub tags: u64,
    pub nr: u32,
    pub resv2: u32,
}

/// Argument for registering a provided-buffer ring.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct BufReg {
    pub ring_addr: u64,
    pub ring_entries: u32,
    pub bgid: u16,
    pub pad: u16,
    pub resv: [u64; 3],
}

/// Argument for the synchronous-cancel register op.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SyncCancelReg {
    pub addr: u64,
    pub fd: i32,
    pub flags: u32,
    pub timeout: libc::timespec,
    pub pad: [u64; 4],
}

impl Default for SyncCancelReg {
    fn default() -> Self {
        SyncCancelReg {
            addr: 0,
            fd: 0,
            flags: 0,
            timeout: libc::timespec {
                tv_sec: -1,
                tv_nsec: -1,
            },
            pad: [0; 4],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct FileIndexRange {
    pub off: u32,
    pub len: u32,
    pub resv: u64,
}

/// Operation restriction entry for `R_DISABLED` rings.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Restriction {
    pub opcode: u16,
    pub op_flags: u8,
    resv: u8,
    resv2: [u32; 3],
}

pub(crate) const RESTRICTION_REGISTER_OP: u16 = 0;
pub(crate) const RESTRICTION_SQE_OP: u16 = 1;
pub(crate) const RESTRICTION_SQE_FLAGS_ALLOWED: u16 = 2;
pub(crate) const RESTRICTION_SQE_FLAGS_REQUIRED: u16 = 3;

impl Restriction {
    pub fn register_op(op: u8) -> Self {
        Restriction {
            opcode: RESTRICTION_REGISTER_OP,
            op_flags: op,
            ..Default::default()
        }
    }

    pub fn sqe_op(op: u8) -> Self {
        Restriction {
            opcode: RESTRICTION_SQE_OP,
            op_flags: op,
            ..Default::default()
        }
    }

    pub fn sqe_flags_allowed(flags: u8) -> Self {
        Restriction {
            opcode: RESTRICTION_SQE_FLAGS_ALLOWED,
            op_flags: flags,
            ..Default::default()
        }
    }

    pub fn sqe_flags_required(flags: u8) -> Self {
        Restriction {
            opcode: RESTRICTION_SQE_FLAGS_REQUIRED,
            op_flags: flags,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_abi_struct_sizes() {
        assert_eq!(size_of::<SqRingOffsets>(), 40);
        assert_eq!(size_of::<CqRingOffsets>(), 40);
        assert_eq!(size_of::<Params>(), 120);
        assert_eq!(size_of::<GetEventsArg>(), 24);
        assert_eq!(size_of::<RsrcRegister>(), 32);
        assert_eq!(size_of::<RsrcUpdate>(), 16);
        assert_eq!(size_of::<RsrcUpdate2>(), 32);
        assert_eq!(size_of::<BufReg>(), 40);
        assert_eq!(size_of::<Restriction>(), 16);
    }

    #[test]
    fn test_flag_words_are_transparent() {
        assert_eq!(size_of::<SetupFlags>(), 4);
        assert_eq!(size_of::<Features>(), 4);
        assert_eq!(size_of::<SqFlags>(), 4);
        assert_eq!(size_of::<EnterFlags>(), 4);
    }

    #[test]
    fn test_params_cq_size_builder() {
        let p = Params::new(SetupFlags::CLAMP).cq_entries(128);
        assert!(p.flags.contains(SetupFlags::CQSIZE));
        assert!(p.flags.contains(SetupFlags::CLAMP));
        assert_eq!(p.cq_entries, 128);
    }
}
