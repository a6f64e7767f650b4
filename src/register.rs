//! Resource registration: buffer tables, file tables, eventfds, the ring
//! descriptor itself, and the other one-shot installs funneled through the
//! register syscall.
//!
//! Every call goes through one gateway that switches to the registered
//! enter descriptor (and tags the opcode accordingly) once the ring fd has
//! been registered. Descriptor-table exhaustion on file-table installs is
//! retried exactly once after raising the process limit.

use crate::error::{Result, RingError};
use crate::ring::{IntFlags, Ring};
use crate::sys::{
    self, regop, FileIndexRange, FilesUpdate, Restriction, RsrcRegister, RsrcUpdate, RsrcUpdate2,
    SyncCancelReg,
};
use libc::c_void;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::os::fd::RawFd;
use tracing::debug;

/// Raise the soft descriptor limit by `nr`, up to the hard limit.
pub(crate) fn increase_rlimit_nofile(nr: u64) -> Result<()> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < hard {
        let raised = (soft + nr).min(hard);
        debug!(soft, raised, "raising descriptor limit");
        setrlimit(Resource::RLIMIT_NOFILE, raised, hard)?;
    }
    Ok(())
}

impl Ring {
    pub(crate) fn do_register(
        &mut self,
        mut opcode: u32,
        arg: *const c_void,
        nr_args: u32,
    ) -> Result<u32> {
        let fd = if self.int_flags.contains(IntFlags::REG_RING) {
            opcode |= regop::USE_REGISTERED_RING;
            self.enter_fd
        } else {
            self.ring_fd
        };
        sys::register(fd, opcode, arg, nr_args).map_err(RingError::from)
    }

    /// Retry variant for file-table installs: a full descriptor table is
    /// retried once after raising the limit.
    fn do_register_fd_table(
        &mut self,
        opcode: u32,
        arg: *const c_void,
        nr_args: u32,
        table_len: u64,
    ) -> Result<u32> {
        let mut raised = false;
        loop {
            match self.do_register(opcode, arg, nr_args) {
                Err(RingError::Os(Errno::EMFILE)) if !raised => {
                    raised = true;
                    increase_rlimit_nofile(table_len)?;
                }
                other => return other,
            }
        }
    }

    /// Install a fixed buffer table for read/write-fixed operations.
    pub fn register_buffers(&mut self, iovecs: &[libc::iovec]) -> Result<u32> {
        self.do_register(
            regop::REGISTER_BUFFERS,
            iovecs.as_ptr() as *const c_void,
            iovecs.len() as u32,
        )
    }

    /// Install a buffer table where each slot carries a caller tag that is
    /// echoed when the slot is released.
    pub fn register_buffers_tags(&mut self, iovecs: &[libc::iovec], tags: &[u64]) -> Result<u32> {
        let reg = RsrcRegister {
            nr: tags.len() as u32,
            data: iovecs.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            ..Default::default()
        };
        self.do_register(
            regop::REGISTER_BUFFERS2,
            &reg as *const RsrcRegister as *const c_void,
            std::mem::size_of::<RsrcRegister>() as u32,
        )
    }

    /// Reserve `nr` empty buffer-table slots to be filled later.
    pub fn register_buffers_sparse(&mut self, nr: u32) -> Result<u32> {
        let reg = RsrcRegister {
            nr,
            flags: sys::RSRC_REGISTER_SPARSE,
            ..Default::default()
        };
        self.do_register(
            regop::REGISTER_BUFFERS2,
            &reg as *const RsrcRegister as *const c_void,
            std::mem::size_of::<RsrcRegister>() as u32,
        )
    }

    /// Replace buffer-table slots starting at `offset`.
    pub fn register_buffers_update_tag(
        &mut self,
        offset: u32,
        iovecs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<u32> {
        let update = RsrcUpdate2 {
            offset,
            data: iovecs.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            nr: iovecs.len() as u32,
            ..Default::default()
        };
        self.do_register(
            regop::REGISTER_BUFFERS_UPDATE,
            &update as *const RsrcUpdate2 as *const c_void,
            std::mem::size_of::<RsrcUpdate2>() as u32,
        )
    }

    pub fn unregister_buffers(&mut self) -> Result<u32> {
        self.do_register(regop::UNREGISTER_BUFFERS, std::ptr::null(), 0)
    }

    /// Install a fixed file table for `SqeFlags::FIXED_FILE` operations.
    pub fn register_files(&mut self, fds: &[RawFd]) -> Result<u32> {
        self.do_register_fd_table(
            regop::REGISTER_FILES,
            fds.as_ptr() as *const c_void,
            fds.len() as u32,
            fds.len() as u64,
        )
    }

    /// Reserve `nr` empty file-table slots for direct-open style
    /// operations.
    pub fn register_files_sparse(&mut self, nr: u32) -> Result<u32> {
        let reg = RsrcRegister {
            nr,
            flags: sys::RSRC_REGISTER_SPARSE,
            ..Default::default()
        };
        self.do_register_fd_table(
            regop::REGISTER_FILES2,
            &reg as *const RsrcRegister as *const c_void,
            std::mem::size_of::<RsrcRegister>() as u32,
            nr as u64,
        )
    }

    pub fn register_files_tags(&mut self, fds: &[RawFd], tags: &[u64]) -> Result<u32> {
        let reg = RsrcRegister {
            nr: fds.len() as u32,
            data: fds.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            ..Default::default()
        };
        self.do_register_fd_table(
            regop::REGISTER_FILES2,
            &reg as *const RsrcRegister as *const c_void,
            std::mem::size_of::<RsrcRegister>() as u32,
            fds.len() as u64,
        )
    }

    /// Replace file-table slots starting at `offset`; -1 skips a slot.
    pub fn register_files_update(&mut self, offset: u32, fds: &[RawFd]) -> Result<u32> {
        let update = FilesUpdate {
            offset,
            resv: 0,
            fds: fds.as_ptr() as u64,
        };
        self.do_register(
            regop::REGISTER_FILES_UPDATE,
            &update as *const FilesUpdate as *const c_void,
            fds.len() as u32,
        )
    }

    pub fn register_files_update_tag(
        &mut self,
        offset: u32,
        fds: &[RawFd],
        tags: &[u64],
    ) -> Result<u32> {
        let update = RsrcUpdate2 {
            offset,
            data: fds.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            nr: fds.len() as u32,
            ..Default::default()
        };
        self.do_register(
            regop::REGISTER_FILES_UPDATE2,
            &update as *const RsrcUpdate2 as *const c_void,
            std::mem::size_of::<RsrcUpdate2>() as u32,
        )
    }

    pub fn unregister_files(&mut self) -> Result<u32> {
        self.do_register(regop::UNREGISTER_FILES, std::ptr::null(), 0)
    }

    /// Signal completion arrivals through `fd`.
    pub fn register_eventfd(&mut self, fd: RawFd) -> Result<u32> {
        self.do_register(regop::REGISTER_EVENTFD, &fd as *const RawFd as *const c_void, 1)
    }

    /// Like [`register_eventfd`](Self::register_eventfd) but only for
    /// completions of operations that went async.
    pub fn register_eventfd_async(&mut self, fd: RawFd) -> Result<u32> {
        self.do_register(
            regop::REGISTER_EVENTFD_ASYNC,
            &fd as *const RawFd as *const c_void,
            1,
        )
    }

    pub fn unregister_eventfd(&mut self) -> Result<u32> {
        self.do_register(regop::UNREGISTER_EVENTFD, std::ptr::null(), 0)
    }

    /// Snapshot the caller's credentials; returns a personality id usable
    /// in submission entries.
    pub fn register_personality(&mut self) -> Result<u32> {
        self.do_register(regop::REGISTER_PERSONALITY, std::ptr::null(), 0)
    }

    pub fn unregister_personality(&mut self, id: u32) -> Result<u32> {
        self.do_register(regop::UNREGISTER_PERSONALITY, std::ptr::null(), id)
    }

    /// Restrict which opcodes and flags a disabled ring will accept once
    /// enabled.
    pub fn register_restrictions(&mut self, restrictions: &[Restriction]) -> Result<u32> {
        self.do_register(
            regop::REGISTER_RESTRICTIONS,
            restrictions.as_ptr() as *const c_void,
            restrictions.len() as u32,
        )
    }

    /// Start a ring created with `SetupFlags::R_DISABLED`.
    pub fn enable_rings(&mut self) -> Result<u32> {
        self.do_register(regop::REGISTER_ENABLE_RINGS, std::ptr::null(), 0)
    }

    /// Pin async workers for this ring to the given CPU set.
    pub fn register_iowq_aff(&mut self, mask: &libc::cpu_set_t) -> Result<u32> {
        self.do_register(
            regop::REGISTER_IOWQ_AFF,
            mask as *const libc::cpu_set_t as *const c_void,
            std::mem::size_of::<libc::cpu_set_t>() as u32,
        )
    }

    pub fn unregister_iowq_aff(&mut self) -> Result<u32> {
        self.do_register(regop::UNREGISTER_IOWQ_AFF, std::ptr::null(), 0)
    }

    /// Cap the bounded/unbounded async worker counts; `values` is
    /// `[bounded, unbounded]`, zero leaves a count unchanged, and the
    /// previous counts are written back.
    pub fn register_iowq_max_workers(&mut self, values: &mut [u32; 2]) -> Result<u32> {
        self.do_register(
            regop::REGISTER_IOWQ_MAX_WORKERS,
            values.as_mut_ptr() as *const c_void,
            2,
        )
    }

    /// Register the ring descriptor itself, switching subsequent enter and
    /// register calls to a registered index that skips fd lookup.
    pub fn register_ring_fd(&mut self) -> Result<u32> {
        if self.int_flags.contains(IntFlags::REG_RING) {
            return Err(RingError::AlreadyRegistered);
        }
        let mut update = RsrcUpdate {
            offset: sys::REGISTER_RING_FD_OFFSET,
            resv: 0,
            data: self.ring_fd as u64,
        };
        // the kernel writes the allocated index back through `offset`
        let arg = &mut update as *mut RsrcUpdate;
        let ret = self.do_register(regop::REGISTER_RING_FDS, arg as *const c_void, 1)?;
        if ret != 1 {
            return Err(RingError::Os(Errno::EINVAL));
        }
        self.enter_fd = unsafe { (*arg).offset } as RawFd;
        self.int_flags |= IntFlags::REG_RING;
        if self.features.contains(crate::sys::Features::REG_REG_RING) {
            self.int_flags |= IntFlags::REG_REG_RING;
        }
        Ok(ret)
    }

    pub fn unregister_ring_fd(&mut self) -> Result<u32> {
        if !self.int_flags.contains(IntFlags::REG_RING) {
            return Err(RingError::NotRegistered);
        }
        let update = RsrcUpdate {
            offset: self.enter_fd as u32,
            ..Default::default()
        };
        let ret = self.do_register(
            regop::UNREGISTER_RING_FDS,
            &update as *const RsrcUpdate as *const c_void,
            1,
        )?;
        if ret == 1 {
            self.enter_fd = self.ring_fd;
            self.int_flags
                .remove(IntFlags::REG_RING | IntFlags::REG_REG_RING);
        }
        Ok(ret)
    }

    /// Close the real ring fd while keeping the registered index usable.
    /// Requires a kernel that accepts register calls on the registered
    /// index.
    pub fn close_ring_fd(&mut self) -> Result<u32> {
        if !self.features.contains(crate::sys::Features::REG_REG_RING) {
            return Err(RingError::Unsupported);
        }
        if !self.int_flags.contains(IntFlags::REG_RING) {
            return Err(RingError::NotRegistered);
        }
        if self.ring_fd == -1 {
            return Err(RingError::Os(Errno::EBADF));
        }
        unsafe { libc::close(self.ring_fd) };
        self.ring_fd = -1;
        Ok(1)
    }

    pub(crate) fn register_buf_ring(&mut self, reg: &sys::BufReg) -> Result<u32> {
        self.do_register(
            regop::REGISTER_PBUF_RING,
            reg as *const sys::BufReg as *const c_void,
            1,
        )
    }

    pub(crate) fn unregister_buf_ring_id(&mut self, bgid: u16) -> Result<u32> {
        let reg = sys::BufReg {
            bgid,
            ..Default::default()
        };
        self.do_register(
            regop::UNREGISTER_PBUF_RING,
            &reg as *const sys::BufReg as *const c_void,
            1,
        )
    }

    /// Cancel matching in-flight operations synchronously, without
    /// consuming submission slots.
    pub fn register_sync_cancel(&mut self, reg: &SyncCancelReg) -> Result<u32> {
        self.do_register(
            regop::REGISTER_SYNC_CANCEL,
            reg as *const SyncCancelReg as *const c_void,
            1,
        )
    }

    /// Constrain which fixed-file slots direct-alloc operations may pick.
    pub fn register_file_alloc_range(&mut self, off: u32, len: u32) -> Result<u32> {
        let range = FileIndexRange { off, len, resv: 0 };
        self.do_register(
            regop::REGISTER_FILE_ALLOC_RANGE,
            &range as *const FileIndexRange as *const c_void,
            0,
        )
    }
}
