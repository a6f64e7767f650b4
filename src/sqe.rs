//! Submission-queue entry layout and the descriptor encoders.
//!
//! Encoders write fixed fields into a slot already acquired from the
//! submission queue; they never touch queue counters. Addresses written
//! into an entry must stay valid until the operation's completion is
//! reaped, the same contract the kernel imposes on any ring user.

use bitflags::bitflags;
use std::ffi::CStr;
use std::os::fd::RawFd;

/// Submission opcodes understood by the kernel.
#[allow(missing_docs)]
pub mod opcode {
    pub const NOP: u8 = 0;
    pub const READV: u8 = 1;
    pub const WRITEV: u8 = 2;
    pub const FSYNC: u8 = 3;
    pub const READ_FIXED: u8 = 4;
    pub const WRITE_FIXED: u8 = 5;
    pub const POLL_ADD: u8 = 6;
    pub const POLL_REMOVE: u8 = 7;
    pub const SYNC_FILE_RANGE: u8 = 8;
    pub const SENDMSG: u8 = 9;
    pub const RECVMSG: u8 = 10;
    pub const TIMEOUT: u8 = 11;
    pub const TIMEOUT_REMOVE: u8 = 12;
    pub const ACCEPT: u8 = 13;
    pub const ASYNC_CANCEL: u8 = 14;
    pub const LINK_TIMEOUT: u8 = 15;
    pub const CONNECT: u8 = 16;
    pub const FALLOCATE: u8 = 17;
    pub const OPENAT: u8 = 18;
    pub const CLOSE: u8 = 19;
    pub const FILES_UPDATE: u8 = 20;
    pub const STATX: u8 = 21;
    pub const READ: u8 = 22;
    pub const WRITE: u8 = 23;
    pub const FADVISE: u8 = 24;
    pub const MADVISE: u8 = 25;
    pub const SEND: u8 = 26;
    pub const RECV: u8 = 27;
    pub const OPENAT2: u8 = 28;
    pub const EPOLL_CTL: u8 = 29;
    pub const SPLICE: u8 = 30;
    pub const PROVIDE_BUFFERS: u8 = 31;
    pub const REMOVE_BUFFERS: u8 = 32;
    pub const TEE: u8 = 33;
    pub const SHUTDOWN: u8 = 34;
    pub const RENAMEAT: u8 = 35;
    pub const UNLINKAT: u8 = 36;
    pub const MKDIRAT: u8 = 37;
    pub const SYMLINKAT: u8 = 38;
    pub const LINKAT: u8 = 39;
    pub const MSG_RING: u8 = 40;
    pub const FSETXATTR: u8 = 41;
    pub const SETXATTR: u8 = 42;
    pub const FGETXATTR: u8 = 43;
    pub const GETXATTR: u8 = 44;
    pub const SOCKET: u8 = 45;
    pub const URING_CMD: u8 = 46;
    pub const SEND_ZC: u8 = 47;
    pub const SENDMSG_ZC: u8 = 48;
}

bitflags! {
    /// Per-entry flags in the entry's own flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct SqeFlags: u8 {
        const FIXED_FILE = 1 << 0;
        const IO_DRAIN = 1 << 1;
        const IO_LINK = 1 << 2;
        const IO_HARDLINK = 1 << 3;
        const ASYNC = 1 << 4;
        const BUFFER_SELECT = 1 << 5;
        const CQE_SKIP_SUCCESS = 1 << 6;
    }
}

/// Requests allocation of any free fixed-file slot in direct variants.
pub const FILE_INDEX_ALLOC: u32 = u32::MAX;

pub const FSYNC_DATASYNC: u32 = 1 << 0;

pub const TIMEOUT_ABS: u32 = 1 << 0;
pub const TIMEOUT_UPDATE: u32 = 1 << 1;
pub const TIMEOUT_BOOTTIME: u32 = 1 << 2;
pub const TIMEOUT_REALTIME: u32 = 1 << 3;
pub const LINK_TIMEOUT_UPDATE: u32 = 1 << 4;
pub const TIMEOUT_ETIME_SUCCESS: u32 = 1 << 5;

pub const POLL_ADD_MULTI: u32 = 1 << 0;
pub const POLL_UPDATE_EVENTS: u32 = 1 << 1;
pub const POLL_UPDATE_USER_DATA: u32 = 1 << 2;
pub const POLL_ADD_LEVEL: u32 = 1 << 3;

pub const ASYNC_CANCEL_ALL: u32 = 1 << 0;
pub const ASYNC_CANCEL_FD: u32 = 1 << 1;
pub const ASYNC_CANCEL_ANY: u32 = 1 << 2;
pub const ASYNC_CANCEL_FD_FIXED: u32 = 1 << 3;

// Send/recv modifiers carried in the ioprio field.
pub const RECVSEND_POLL_FIRST: u16 = 1 << 0;
pub const RECV_MULTISHOT: u16 = 1 << 1;
pub const RECVSEND_FIXED_BUF: u16 = 1 << 2;
pub const SEND_ZC_REPORT_USAGE: u16 = 1 << 3;

pub const ACCEPT_MULTISHOT: u16 = 1 << 0;

pub const SPLICE_F_FD_IN_FIXED: u32 = 1 << 31;

pub(crate) const MSG_DATA: u64 = 0;
pub(crate) const MSG_SEND_FD: u64 = 1;
pub const MSG_RING_CQE_SKIP: u32 = 1 << 0;
pub const MSG_RING_FLAGS_PASS: u32 = 1 << 1;

/// `openat2` argument block; layout fixed by the kernel.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct OpenHow {
    pub flags: u64,
    pub mode: u64,
    pub resolve: u64,
}

/// One descriptor slot in the submission ring. Written once per acquired
/// slot by exactly one encoder before the batch is flushed.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SubmissionQueueEntry {
    pub opcode: u8,
    pub flags: SqeFlags,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub opcode_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    _pad2: [u64; 1],
}

impl SubmissionQueueEntry {
    pub(crate) fn zeroed() -> Self {
        // all-zero is the valid "nop, nothing set" encoding
        unsafe { std::mem::zeroed() }
    }

    /// Base field writer every encoder funnels through. Clears the slot so
    /// stale fields from a previous ring generation never leak into a new
    /// operation.
    fn prep_rw(&mut self, op: u8, fd: i32, addr: u64, len: u32, off: u64) {
        self.opcode = op;
        self.flags = SqeFlags::empty();
        self.ioprio = 0;
        self.fd = fd;
        self.off = off;
        self.addr = addr;
        self.len = len;
        self.opcode_flags = 0;
        self.user_data = 0;
        self.buf_index = 0;
        self.personality = 0;
        self.splice_fd_in = 0;
        self.addr3 = 0;
        self._pad2 = [0];
    }

    fn set_target_fixed_file(&mut self, file_index: u32) {
        // stored off by one so 0 keeps meaning "no fixed file"
        self.splice_fd_in = file_index.wrapping_add(1) as i32;
    }

    /// Tag this entry; echoed verbatim in the matching completion.
    pub fn set_data64(&mut self, data: u64) {
        self.user_data = data;
    }

    pub fn set_flags(&mut self, flags: SqeFlags) {
        self.flags = flags;
    }

    /// Select a provided-buffer group for this operation.
    pub fn set_buf_group(&mut self, bgid: u16) {
        self.buf_index = bgid;
        self.flags |= SqeFlags::BUFFER_SELECT;
    }

    pub fn prepare_nop(&mut self) {
        self.prep_rw(opcode::NOP, -1, 0, 0, 0);
    }

    pub fn prepare_read(&mut self, fd: RawFd, buf: &mut [u8], offset: u64) {
        self.prep_rw(
            opcode::READ,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            offset,
        );
    }

    pub fn prepare_read_fixed(&mut self, fd: RawFd, buf: &mut [u8], offset: u64, buf_index: u16) {
        self.prep_rw(
            opcode::READ_FIXED,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            offset,
        );
        self.buf_index = buf_index;
    }

    pub fn prepare_readv(&mut self, fd: RawFd, iovecs: *const libc::iovec, nr: u32, offset: u64) {
        self.prep_rw(opcode::READV, fd, iovecs as u64, nr, offset);
    }

    pub fn prepare_readv2(
        &mut self,
        fd: RawFd,
        iovecs: *const libc::iovec,
        nr: u32,
        offset: u64,
        flags: u32,
    ) {
        self.prepare_readv(fd, iovecs, nr, offset);
        self.opcode_flags = flags;
    }

    pub fn prepare_write(&mut self, fd: RawFd, buf: &[u8], offset: u64) {
        self.prep_rw(
            opcode::WRITE,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            offset,
        );
    }

    pub fn prepare_write_fixed(&mut self, fd: RawFd, buf: &[u8], offset: u64, buf_index: u16) {
        self.prep_rw(
            opcode::WRITE_FIXED,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            offset,
        );
        self.buf_index = buf_index;
    }

    pub fn prepare_writev(&mut self, fd: RawFd, iovecs: *const libc::iovec, nr: u32, offset: u64) {
        self.prep_rw(opcode::WRITEV, fd, iovecs as u64, nr, offset);
    }

    pub fn prepare_writev2(
        &mut self,
        fd: RawFd,
        iovecs: *const libc::iovec,
        nr: u32,
        offset: u64,
        flags: u32,
    ) {
        self.prepare_writev(fd, iovecs, nr, offset);
        self.opcode_flags = flags;
    }

    pub fn prepare_fsync(&mut self, fd: RawFd, flags: u32) {
        self.prep_rw(opcode::FSYNC, fd, 0, 0, 0);
        self.opcode_flags = flags;
    }

    pub fn prepare_sync_file_range(&mut self, fd: RawFd, len: u32, offset: u64, flags: u32) {
        self.prep_rw(opcode::SYNC_FILE_RANGE, fd, 0, len, offset);
        self.opcode_flags = flags;
    }

    pub fn prepare_poll_add(&mut self, fd: RawFd, poll_mask: u32) {
        self.prep_rw(opcode::POLL_ADD, fd, 0, 0, 0);
        self.opcode_flags = poll_mask;
    }

    /// Level-triggered repeated poll; one completion per readiness edge
    /// until canceled.
    pub fn prepare_poll_multishot(&mut self, fd: RawFd, poll_mask: u32) {
        self.prepare_poll_add(fd, poll_mask);
        self.len = POLL_ADD_MULTI;
    }

    pub fn prepare_poll_remove(&mut self, user_data: u64) {
        self.prep_rw(opcode::POLL_REMOVE, -1, user_data, 0, 0);
    }

    pub fn prepare_poll_update(
        &mut self,
        old_user_data: u64,
        new_user_data: u64,
        poll_mask: u32,
        flags: u32,
    ) {
        self.prep_rw(
            opcode::POLL_REMOVE,
            -1,
            old_user_data,
            flags,
            new_user_data,
        );
        self.opcode_flags = poll_mask;
    }

    /// Standalone timeout firing after `ts`, or earlier once `count`
    /// completions have arrived.
    pub fn prepare_timeout(&mut self, ts: &libc::timespec, count: u32, flags: u32) {
        self.prep_rw(
            opcode::TIMEOUT,
            -1,
            ts as *const libc::timespec as u64,
            1,
            count as u64,
        );
        self.opcode_flags = flags;
    }

    pub fn prepare_timeout_remove(&mut self, user_data: u64, flags: u32) {
        self.prep_rw(opcode::TIMEOUT_REMOVE, -1, 0, 0, 0);
        self.addr = user_data;
        self.opcode_flags = flags;
    }

    pub fn prepare_timeout_update(&mut self, ts: &libc::timespec, user_data: u64, flags: u32) {
        self.prep_rw(
            opcode::TIMEOUT_REMOVE,
            -1,
            0,
            0,
            ts as *const libc::timespec as u64,
        );
        self.addr = user_data;
        self.opcode_flags = flags | TIMEOUT_UPDATE;
    }

    /// Timeout bounding the linked previous entry rather than the queue.
    pub fn prepare_link_timeout(&mut self, ts: &libc::timespec, flags: u32) {
        self.prep_rw(
            opcode::LINK_TIMEOUT,
            -1,
            ts as *const libc::timespec as u64,
            1,
            0,
        );
        self.opcode_flags = flags;
    }

    pub fn prepare_accept(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
    ) {
        self.prep_rw(opcode::ACCEPT, fd, addr as u64, 0, addrlen as u64);
        self.opcode_flags = flags;
    }

    pub fn prepare_accept_direct(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
        mut file_index: u32,
    ) {
        self.prepare_accept(fd, addr, addrlen, flags);
        if file_index == FILE_INDEX_ALLOC {
            file_index -= 1;
        }
        self.set_target_fixed_file(file_index);
    }

    /// One accept submission producing a completion per inbound connection.
    pub fn prepare_multishot_accept(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
    ) {
        self.prepare_accept(fd, addr, addrlen, flags);
        self.ioprio |= ACCEPT_MULTISHOT;
    }

    pub fn prepare_multishot_accept_direct(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
    ) {
        self.prepare_multishot_accept(fd, addr, addrlen, flags);
        self.set_target_fixed_file(FILE_INDEX_ALLOC - 1);
    }

    /// Cancel a prior submission by its user tag.
    pub fn prepare_cancel64(&mut self, user_data: u64, flags: u32) {
        self.prep_rw(opcode::ASYNC_CANCEL, -1, 0, 0, 0);
        self.addr = user_data;
        self.opcode_flags = flags;
    }

    /// Cancel prior submissions targeting `fd`.
    pub fn prepare_cancel_fd(&mut self, fd: RawFd, flags: u32) {
        self.prep_rw(opcode::ASYNC_CANCEL, fd, 0, 0, 0);
        self.opcode_flags = flags | ASYNC_CANCEL_FD;
    }

    pub fn prepare_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) {
        self.prep_rw(opcode::CONNECT, fd, addr as u64, 0, addrlen as u64);
    }

    pub fn prepare_close(&mut self, fd: RawFd) {
        self.prep_rw(opcode::CLOSE, fd, 0, 0, 0);
    }

    pub fn prepare_close_direct(&mut self, file_index: u32) {
        self.prepare_close(0);
        self.set_target_fixed_file(file_index);
    }

    pub fn prepare_socket(&mut self, domain: i32, socket_type: i32, protocol: i32, flags: u32) {
        self.prep_rw(opcode::SOCKET, domain, 0, protocol as u32, socket_type as u64);
        self.opcode_flags = flags;
    }

    pub fn prepare_socket_direct(
        &mut self,
        domain: i32,
        socket_type: i32,
        protocol: i32,
        mut file_index: u32,
        flags: u32,
    ) {
        self.prepare_socket(domain, socket_type, protocol, flags);
        if file_index == FILE_INDEX_ALLOC {
            file_index -= 1;
        }
        self.set_target_fixed_file(file_index);
    }

    pub fn prepare_socket_direct_alloc(
        &mut self,
        domain: i32,
        socket_type: i32,
        protocol: i32,
        flags: u32,
    ) {
        self.prepare_socket(domain, socket_type, protocol, flags);
        self.set_target_fixed_file(FILE_INDEX_ALLOC - 1);
    }

    pub fn prepare_shutdown(&mut self, fd: RawFd, how: i32) {
        self.prep_rw(opcode::SHUTDOWN, fd, 0, how as u32, 0);
    }

    pub fn prepare_send(&mut self, fd: RawFd, buf: &[u8], flags: u32) {
        self.prep_rw(
            opcode::SEND,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            0,
        );
        self.opcode_flags = flags;
    }

    /// Attach a destination address to a prepared send, turning it into a
    /// sendto.
    pub fn send_set_addr(&mut self, dest: *const libc::sockaddr, addrlen: u16) {
        self.off = dest as u64;
        self.addr3 = addrlen as u64;
    }

    pub fn prepare_sendto(
        &mut self,
        fd: RawFd,
        buf: &[u8],
        flags: u32,
        dest: *const libc::sockaddr,
        addrlen: u16,
    ) {
        self.prepare_send(fd, buf, flags);
        self.send_set_addr(dest, addrlen);
    }

    /// Zero-copy send; produces a completion when queued and a notification
    /// completion once the kernel is done with the pages.
    pub fn prepare_send_zc(&mut self, fd: RawFd, buf: &[u8], flags: u32, zc_flags: u16) {
        self.prep_rw(
            opcode::SEND_ZC,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            0,
        );
        self.opcode_flags = flags;
        self.ioprio = zc_flags;
    }

    pub fn prepare_send_zc_fixed(
        &mut self,
        fd: RawFd,
        buf: &[u8],
        flags: u32,
        zc_flags: u16,
        buf_index: u16,
    ) {
        self.prepare_send_zc(fd, buf, flags, zc_flags);
        self.ioprio |= RECVSEND_FIXED_BUF;
        self.buf_index = buf_index;
    }

    pub fn prepare_sendmsg(&mut self, fd: RawFd, msg: *const libc::msghdr, flags: u32) {
        self.prep_rw(opcode::SENDMSG, fd, msg as u64, 1, 0);
        self.opcode_flags = flags;
    }

    pub fn prepare_sendmsg_zc(&mut self, fd: RawFd, msg: *const libc::msghdr, flags: u32) {
        self.prepare_sendmsg(fd, msg, flags);
        self.opcode = opcode::SENDMSG_ZC;
    }

    pub fn prepare_recv(&mut self, fd: RawFd, buf: &mut [u8], flags: u32) {
        self.prep_rw(
            opcode::RECV,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            0,
        );
        self.opcode_flags = flags;
    }

    /// Multishot receive; pair with a provided-buffer group selected via
    /// [`set_buf_group`](Self::set_buf_group).
    pub fn prepare_recv_multishot(&mut self, fd: RawFd, flags: u32) {
        self.prep_rw(opcode::RECV, fd, 0, 0, 0);
        self.opcode_flags = flags;
        self.ioprio |= RECV_MULTISHOT;
    }

    pub fn prepare_recvmsg(&mut self, fd: RawFd, msg: *mut libc::msghdr, flags: u32) {
        self.prep_rw(opcode::RECVMSG, fd, msg as u64, 1, 0);
        self.opcode_flags = flags;
    }

    pub fn prepare_recvmsg_multishot(&mut self, fd: RawFd, msg: *mut libc::msghdr, flags: u32) {
        self.prepare_recvmsg(fd, msg, flags);
        self.ioprio |= RECV_MULTISHOT;
    }

    pub fn prepare_splice(
        &mut self,
        fd_in: RawFd,
        off_in: i64,
        fd_out: RawFd,
        off_out: i64,
        nbytes: u32,
        splice_flags: u32,
    ) {
        self.prep_rw(opcode::SPLICE, fd_out, 0, nbytes, off_out as u64);
        self.addr = off_in as u64;
        self.splice_fd_in = fd_in;
        self.opcode_flags = splice_flags;
    }

    pub fn prepare_tee(&mut self, fd_in: RawFd, fd_out: RawFd, nbytes: u32, splice_flags: u32) {
        self.prep_rw(opcode::TEE, fd_out, 0, nbytes, 0);
        self.splice_fd_in = fd_in;
        self.opcode_flags = splice_flags;
    }

    pub fn prepare_openat(&mut self, dfd: RawFd, path: &CStr, flags: i32, mode: u32) {
        self.prep_rw(opcode::OPENAT, dfd, path.as_ptr() as u64, mode, 0);
        self.opcode_flags = flags as u32;
    }

    pub fn prepare_openat_direct(
        &mut self,
        dfd: RawFd,
        path: &CStr,
        flags: i32,
        mode: u32,
        mut file_index: u32,
    ) {
        self.prepare_openat(dfd, path, flags, mode);
        if file_index == FILE_INDEX_ALLOC {
            file_index -= 1;
        }
        self.set_target_fixed_file(file_index);
    }

    pub fn prepare_openat2(&mut self, dfd: RawFd, path: &CStr, how: *const OpenHow) {
        self.prep_rw(
            opcode::OPENAT2,
            dfd,
            path.as_ptr() as u64,
            std::mem::size_of::<OpenHow>() as u32,
            how as u64,
        );
    }

    pub fn prepare_openat2_direct(
        &mut self,
        dfd: RawFd,
        path: &CStr,
        how: *const OpenHow,
        mut file_index: u32,
    ) {
        self.prepare_openat2(dfd, path, how);
        if file_index == FILE_INDEX_ALLOC {
            file_index -= 1;
        }
        self.set_target_fixed_file(file_index);
    }

    pub fn prepare_statx(
        &mut self,
        dfd: RawFd,
        path: &CStr,
        flags: i32,
        mask: u32,
        statx: *mut libc::statx,
    ) {
        self.prep_rw(opcode::STATX, dfd, path.as_ptr() as u64, mask, statx as u64);
        self.opcode_flags = flags as u32;
    }

    pub fn prepare_fadvise(&mut self, fd: RawFd, offset: u64, len: u32, advice: i32) {
        self.prep_rw(opcode::FADVISE, fd, 0, len, offset);
        self.opcode_flags = advice as u32;
    }

    pub fn prepare_madvise(&mut self, addr: *mut libc::c_void, len: u32, advice: i32) {
        self.prep_rw(opcode::MADVISE, -1, addr as u64, len, 0);
        self.opcode_flags = advice as u32;
    }

    pub fn prepare_fallocate(&mut self, fd: RawFd, mode: i32, offset: u64, len: u64) {
        self.prep_rw(opcode::FALLOCATE, fd, 0, mode as u32, offset);
        self.addr = len;
    }

    pub fn prepare_files_update(&mut self, fds: &[RawFd], offset: u32) {
        self.prep_rw(
            opcode::FILES_UPDATE,
            -1,
            fds.as_ptr() as u64,
            fds.len() as u32,
            offset as u64,
        );
    }

    /// Hand `nr` equally sized buffers starting at `addr` to the legacy
    /// provided-buffer pool of group `bgid`, ids starting at `bid`.
    pub fn prepare_provide_buffers(
        &mut self,
        addr: *mut u8,
        len: u32,
        nr: u16,
        bgid: u16,
        bid: u16,
    ) {
        self.prep_rw(
            opcode::PROVIDE_BUFFERS,
            nr as i32,
            addr as u64,
            len,
            bid as u64,
        );
        self.buf_index = bgid;
    }

    pub fn prepare_remove_buffers(&mut self, nr: u16, bgid: u16) {
        self.prep_rw(opcode::REMOVE_BUFFERS, nr as i32, 0, 0, 0);
        self.buf_index = bgid;
    }

    pub fn prepare_mkdirat(&mut self, dfd: RawFd, path: &CStr, mode: u32) {
        self.prep_rw(opcode::MKDIRAT, dfd, path.as_ptr() as u64, mode, 0);
    }

    pub fn prepare_renameat(
        &mut self,
        old_dfd: RawFd,
        old_path: &CStr,
        new_dfd: RawFd,
        new_path: &CStr,
        flags: u32,
    ) {
        self.prep_rw(
            opcode::RENAMEAT,
            old_dfd,
            old_path.as_ptr() as u64,
            new_dfd as u32,
            new_path.as_ptr() as u64,
        );
        self.opcode_flags = flags;
    }

    pub fn prepare_unlinkat(&mut self, dfd: RawFd, path: &CStr, flags: i32) {
        self.prep_rw(opcode::UNLINKAT, dfd, path.as_ptr() as u64, 0, 0);
        self.opcode_flags = flags as u32;
    }

    pub fn prepare_symlinkat(&mut self, target: &CStr, new_dfd: RawFd, linkpath: &CStr) {
        self.prep_rw(
            opcode::SYMLINKAT,
            new_dfd,
            target.as_ptr() as u64,
            0,
            linkpath.as_ptr() as u64,
        );
    }

    pub fn prepare_linkat(
        &mut self,
        old_dfd: RawFd,
        old_path: &CStr,
        new_dfd: RawFd,
        new_path: &CStr,
        flags: i32,
    ) {
        self.prep_rw(
            opcode::LINKAT,
            old_dfd,
            old_path.as_ptr() as u64,
            new_dfd as u32,
            new_path.as_ptr() as u64,
        );
        self.opcode_flags = flags as u32;
    }

    /// Post a synthetic completion carrying `data`/`len` into another ring.
    pub fn prepare_msg_ring(&mut self, ring_fd: RawFd, len: u32, data: u64, flags: u32) {
        self.prep_rw(opcode::MSG_RING, ring_fd, MSG_DATA, len, data);
        self.opcode_flags = flags;
    }

    pub fn prepare_msg_ring_cqe_flags(
        &mut self,
        ring_fd: RawFd,
        len: u32,
        data: u64,
        flags: u32,
        cqe_flags: u32,
    ) {
        self.prepare_msg_ring(ring_fd, len, data, flags | MSG_RING_FLAGS_PASS);
        self.splice_fd_in = cqe_flags as i32;
    }

    /// Pass `source_fd` into the target ring's fixed-file table.
    pub fn prepare_msg_ring_fd(
        &mut self,
        ring_fd: RawFd,
        source_fd: RawFd,
        mut target_index: u32,
        data: u64,
        flags: u32,
    ) {
        self.prep_rw(opcode::MSG_RING, ring_fd, MSG_SEND_FD, 0, data);
        self.addr3 = source_fd as u64;
        if target_index == FILE_INDEX_ALLOC {
            target_index -= 1;
        }
        self.set_target_fixed_file(target_index);
        self.opcode_flags = flags;
    }

    pub fn prepare_msg_ring_fd_alloc(
        &mut self,
        ring_fd: RawFd,
        source_fd: RawFd,
        data: u64,
        flags: u32,
    ) {
        self.prepare_msg_ring_fd(ring_fd, source_fd, FILE_INDEX_ALLOC, data, flags);
    }

    pub fn prepare_fsetxattr(&mut self, fd: RawFd, name: &CStr, value: &[u8], flags: i32) {
        self.prep_rw(
            opcode::FSETXATTR,
            fd,
            name.as_ptr() as u64,
            value.len() as u32,
            value.as_ptr() as u64,
        );
        self.opcode_flags = flags as u32;
    }

    pub fn prepare_fgetxattr(&mut self, fd: RawFd, name: &CStr, value: &mut [u8]) {
        self.prep_rw(
            opcode::FGETXATTR,
            fd,
            name.as_ptr() as u64,
            value.len() as u32,
            value.as_mut_ptr() as u64,
        );
    }

    pub fn prepare_setxattr(
        &mut self,
        name: &CStr,
        value: &[u8],
        path: &CStr,
        flags: i32,
    ) {
        self.prep_rw(
            opcode::SETXATTR,
            0,
            name.as_ptr() as u64,
            value.len() as u32,
            value.as_ptr() as u64,
        );
        self.addr3 = path.as_ptr() as u64;
        self.opcode_flags = flags as u32;
    }

    pub fn prepare_getxattr(&mut self, name: &CStr, value: &mut [u8], path: &CStr) {
        self.prep_rw(
            opcode::GETXATTR,
            0,
            name.as_ptr() as u64,
            value.len() as u32,
            value.as_mut_ptr() as u64,
        );
        self.addr3 = path.as_ptr() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_entry_layout() {
        assert_eq!(size_of::<SubmissionQueueEntry>(), 64);
        assert_eq!(align_of::<SubmissionQueueEntry>(), 8);
    }

    fn entry() -> SubmissionQueueEntry {
        let mut e = SubmissionQueueEntry::zeroed();
        // dirty every field so tests catch encoders that fail to clear
        e.opcode = 0xff;
        e.flags = SqeFlags::all();
        e.ioprio = 0xffff;
        e.fd = -2;
        e.off = u64::MAX;
        e.addr = u64::MAX;
        e.len = u32::MAX;
        e.opcode_flags = u32::MAX;
        e.user_data = u64::MAX;
        e.buf_index = 0xffff;
        e.personality = 0xffff;
        e.splice_fd_in = -2;
        e.addr3 = u64::MAX;
        e
    }

    #[test]
    fn test_nop_clears_previous_encoding() {
        let mut e = entry();
        e.prepare_nop();
        assert_eq!(e.opcode, opcode::NOP);
        assert_eq!(e.fd, -1);
        assert_eq!(e.addr, 0);
        assert_eq!(e.len, 0);
        assert_eq!(e.off, 0);
        assert_eq!(e.user_data, 0);
        assert_eq!(e.ioprio, 0);
        assert_eq!(e.buf_index, 0);
        assert_eq!(e.splice_fd_in, 0);
    }

    #[test]
    fn test_read_write_fields() {
        let mut buf = [0u8; 128];
        let mut e = entry();
        e.prepare_read(7, &mut buf, 4096);
        assert_eq!(e.opcode, opcode::READ);
        assert_eq!(e.fd, 7);
        assert_eq!(e.addr, buf.as_ptr() as u64);
        assert_eq!(e.len, 128);
        assert_eq!(e.off, 4096);

        let mut e = entry();
        e.prepare_write(8, &buf, 512);
        assert_eq!(e.opcode, opcode::WRITE);
        assert_eq!(e.fd, 8);
        assert_eq!(e.len, 128);
        assert_eq!(e.off, 512);
    }

    #[test]
    fn test_timeout_encoding() {
        let ts = libc::timespec {
            tv_sec: 1,
            tv_nsec: 500,
        };
        let mut e = entry();
        e.prepare_timeout(&ts, 3, TIMEOUT_ABS);
        assert_eq!(e.opcode, opcode::TIMEOUT);
        assert_eq!(e.fd, -1);
        assert_eq!(e.addr, &ts as *const _ as u64);
        assert_eq!(e.len, 1);
        assert_eq!(e.off, 3);
        assert_eq!(e.opcode_flags, TIMEOUT_ABS);
    }

    #[test]
    fn test_cancel_encodings() {
        let mut e = entry();
        e.prepare_cancel64(0xdead_beef, 0);
        assert_eq!(e.opcode, opcode::ASYNC_CANCEL);
        assert_eq!(e.addr, 0xdead_beef);
        assert_eq!(e.fd, -1);

        let mut e = entry();
        e.prepare_cancel_fd(5, ASYNC_CANCEL_ALL);
        assert_eq!(e.fd, 5);
        assert_eq!(e.opcode_flags, ASYNC_CANCEL_ALL | ASYNC_CANCEL_FD);
    }

    #[test]
    fn test_multishot_recv_with_buffer_group() {
        let mut e = entry();
        e.prepare_recv_multishot(9, 0);
        e.set_buf_group(42);
        assert_eq!(e.opcode, opcode::RECV);
        assert_eq!(e.ioprio & RECV_MULTISHOT, RECV_MULTISHOT);
        assert_eq!(e.buf_index, 42);
        assert!(e.flags.contains(SqeFlags::BUFFER_SELECT));
        assert_eq!(e.addr, 0);
        assert_eq!(e.len, 0);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(41, 42)]
    #[case(FILE_INDEX_ALLOC, u32::MAX)]
    fn test_fixed_file_target_offset_by_one(#[case] index: u32, #[case] stored: u32) {
        let mut e = entry();
        e.prepare_accept_direct(3, std::ptr::null_mut(), std::ptr::null_mut(), 0, index);
        assert_eq!(e.splice_fd_in as u32, stored);
    }

    #[test]
    fn test_provide_buffers_encoding() {
        let mut backing = vec![0u8; 16 * 64];
        let mut e = entry();
        e.prepare_provide_buffers(backing.as_mut_ptr(), 64, 16, 7, 100);
        assert_eq!(e.opcode, opcode::PROVIDE_BUFFERS);
        assert_eq!(e.fd, 16);
        assert_eq!(e.len, 64);
        assert_eq!(e.off, 100);
        assert_eq!(e.buf_index, 7);
    }

    #[test]
    fn test_splice_encoding() {
        let mut e = entry();
        e.prepare_splice(3, -1, 4, 100, 4096, 0);
        assert_eq!(e.opcode, opcode::SPLICE);
        assert_eq!(e.fd, 4);
        assert_eq!(e.splice_fd_in, 3);
        assert_eq!(e.addr, u64::MAX);
        assert_eq!(e.off, 100);
        assert_eq!(e.len, 4096);
    }

    #[test]
    fn test_user_tag_roundtrip_field() {
        let mut e = entry();
        e.prepare_nop();
        e.set_data64(0x0123_4567_89ab_cdef);
        assert_eq!(e.user_data, 0x0123_4567_89ab_cdef);
    }
}
