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

//! Ring-region negotiation, sizing, and mapping.
//!
//! Three regions back a ring: the submission-queue header, the
//! completion-queue header (possibly the same mapping when the kernel
//! reports `SINGLE_MMAP`), and the descriptor-entry array. Either the
//! kernel exports them through the ring descriptor, or — in the
//! application-memory mode — the library or the caller supplies anonymous
//! memory whose addresses are handed to the kernel at setup.

use crate::error::{Result, RingError};
use crate::sys::{self, Params, SetupFlags};
use libc::c_void;
use nix::errno::Errno;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::ptr::NonNull;

pub(crate) const CQ_ENTRIES_MULTIPLIER: u32 = 2;
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;
/// Space the kernel reserves for the shared ring headers.
const KERNEL_RING_HEADER: u64 = 320;

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub(crate) fn sqe_size(flags: SetupFlags) -> usize {
    if flags.contains(SetupFlags::SQE128) {
        128
    } else {
        64
    }
}

pub(crate) fn cqe_size(flags: SetupFlags) -> usize {
    if flags.contains(SetupFlags::CQE32) {
        32
    } else {
        16
    }
}

/// Negotiate submission and completion capacities from the requested entry
/// count: round up to a power of two, clamp to the kernel ceilings when
/// allowed, derive the completion capacity unless one was requested
/// explicitly. Fails before any syscall on out-of-range requests.
pub(crate) fn negotiate_entries(mut entries: u32, p: &Params) -> Result<(u32, u32)> {
    if entries == 0 {
        return Err(RingError::InvalidEntries(0));
    }
    if entries > sys::KERN_MAX_ENTRIES {
        if !p.flags.contains(SetupFlags::CLAMP) {
            return Err(RingError::InvalidEntries(entries));
        }
        entries = sys::KERN_MAX_ENTRIES;
    }
    entries = entries.next_power_of_two();

    let cq_entries = if p.flags.contains(SetupFlags::CQSIZE) {
        let mut cq = p.cq_entries;
        if cq == 0 {
            return Err(RingError::InvalidEntries(0));
        }
        if cq > sys::KERN_MAX_CQ_ENTRIES {
            if !p.flags.contains(SetupFlags::CLAMP) {
                return Err(RingError::InvalidEntries(cq));
            }
            cq = sys::KERN_MAX_CQ_ENTRIES;
        }
        cq = cq.next_power_of_two();
        if cq < entries {
            return Err(RingError::InvalidEntries(cq));
        }
        cq
    } else {
        CQ_ENTRIES_MULTIPLIER * entries
    };

    Ok((entries, cq_entries))
}

#[derive(Debug)]
pub(crate) enum MapMode {
    /// Regions exported by the kernel through the ring descriptor.
    Kernel,
    /// Anonymous regions allocated here for the no-mmap setup path.
    Owned(Vec<(NonNull<c_void>, usize)>),
    /// Caller-supplied buffer; never unmapped by us.
    Caller,
}

/// The mapped regions of one ring, released exactly once on drop.
#[derive(Debug)]
pub(crate) struct RingMapping {
    pub sq_ring: NonNull<c_void>,
    pub sq_ring_size: usize,
    pub cq_ring: NonNull<c_void>,
    pub cq_ring_size: usize,
    pub sqes: NonNull<c_void>,
    pub sqes_size: usize,
    mode: MapMode,
}

unsafe impl Send for RingMapping {}

fn map_region(fd: RawFd, len: usize, offset: libc::off_t) -> std::result::Result<NonNull<c_void>, Errno> {
    let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
            BorrowedFd::borrow_raw(fd),
            offset,
        )
    }
}

fn map_anonymous(len: usize, huge: bool) -> std::result::Result<NonNull<c_void>, Errno> {
    let mut flags = MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS;
    if huge {
        flags |= MapFlags::MAP_HUGETLB;
    }
    let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    unsafe {
        mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
        )
    }
}

impl RingMapping {
    /// Map the three kernel-exported regions of an already created ring.
    /// Unwinds prior mappings on partial failure.
    pub(crate) fn map(fd: RawFd, p: &Params) -> Result<RingMapping> {
        let mut sq_ring_size =
            p.sq_off.array as usize + p.sq_entries as usize * std::mem::size_of::<u32>();
        let mut cq_ring_size = p.cq_off.cqes as usize + p.cq_entries as usize * cqe_size(p.flags);

        let single = p.features.contains(sys::Features::SINGLE_MMAP);
        if single {
            sq_ring_size = sq_ring_size.max(cq_ring_size);
            cq_ring_size = sq_ring_size;
        }

        let sq_ring = map_region(fd, sq_ring_size, sys::MMAP_OFF_SQ_RING)?;
        let cq_ring = if single {
            sq_ring
        } else {
            match map_region(fd, cq_ring_size, sys::MMAP_OFF_CQ_RING) {
                Ok(ptr) => ptr,
                Err(errno) => {
                    unsafe { let _ = munmap(sq_ring, sq_ring_size); }
                    return Err(errno.into());
                }
            }
        };

        let sqes_size = sqe_size(p.flags) * p.sq_entries as usize;
        let sqes = match map_region(fd, sqes_size, sys::MMAP_OFF_SQES) {
            Ok(ptr) => ptr,
            Err(errno) => {
                unsafe {
                    let _ = munmap(sq_ring, sq_ring_size);
                    if cq_ring != sq_ring {
                        let _ = munmap(cq_ring, cq_ring_size);
                    }
                }
                return Err(errno.into());
            }
        };

        Ok(RingMapping {
            sq_ring,
            sq_ring_size,
            cq_ring,
            cq_ring_size,
            sqes,
            sqes_size,
            mode: MapMode::Kernel,
        })
    }

    /// Allocate ring memory up front for the no-mmap setup path, either in
    /// anonymous (possibly huge-page) mappings or inside a caller-supplied
    /// buffer. Writes the region addresses into `p` for the kernel to adopt.
    pub(crate) fn alloc(
        entries: u32,
        p: &mut Params,
        buf: Option<(*mut u8, usize)>,
    ) -> Result<RingMapping> {
        let (sq_entries, cq_entries) = negotiate_entries(entries, p)?;
        let page = page_size();

        let mut sqes_mem = sq_entries as usize * sqe_size(p.flags);
        sqes_mem = (sqes_mem + page - 1) & !(page - 1);
        let ring_mem = cq_entries as usize * cqe_size(p.flags)
            + sq_entries as usize * std::mem::size_of::<u32>();
        let mut mem_used = sqes_mem + ring_mem;
        mem_used = (mem_used + page - 1) & !(page - 1);

        let (sqes, ring, mode) = match buf {
            Some((base, len)) => {
                if mem_used > len {
                    return Err(RingError::ProvidedBufferTooSmall);
                }
                let sqes = NonNull::new(base as *mut c_void).ok_or(Errno::EINVAL)?;
                let ring =
                    unsafe { NonNull::new_unchecked(base.add(sqes_mem) as *mut c_void) };
                (sqes, ring, MapMode::Caller)
            }
            None => {
                if sqes_mem > HUGE_PAGE_SIZE || ring_mem > HUGE_PAGE_SIZE {
                    return Err(RingError::RingMemoryTooLarge);
                }
                let mut owned = Vec::with_capacity(2);
                let first_size = if sqes_mem <= page { page } else { HUGE_PAGE_SIZE };
                let first = map_anonymous(first_size, first_size == HUGE_PAGE_SIZE)?;
                owned.push((first, first_size));

                if mem_used <= first_size {
                    let ring = unsafe {
                        NonNull::new_unchecked((first.as_ptr() as *mut u8).add(sqes_mem) as *mut c_void)
                    };
                    (first, ring, MapMode::Owned(owned))
                } else {
                    let second_size = if ring_mem <= page { page } else { HUGE_PAGE_SIZE };
                    let second = match map_anonymous(second_size, second_size == HUGE_PAGE_SIZE) {
                        Ok(ptr) => ptr,
                        Err(errno) => {
                            unsafe { let _ = munmap(first, first_size); }
                            return Err(errno.into());
                        }
                    };
                    owned.push((second, second_size));
                    (first, second, MapMode::Owned(owned))
                }
            }
        };

        p.sq_off.user_addr = sqes.as_ptr() as u64;
        p.cq_off.user_addr = ring.as_ptr() as u64;

        Ok(RingMapping {
            sq_ring: ring,
            sq_ring_size: ring_mem,
            cq_ring: ring,
            cq_ring_size: ring_mem,
            sqes,
            sqes_size: sqes_mem,
            mode,
        })
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        match &self.mode {
            MapMode::Kernel => unsafe {
                let _ = munmap(self.sqes, self.sqes_size);
                let _ = munmap(self.sq_ring, self.sq_ring_size);
                if self.cq_ring != self.sq_ring {
                    let _ = munmap(self.cq_ring, self.cq_ring_size);
                }
            },
            MapMode::Owned(regions) => unsafe {
                for (ptr, len) in regions {
                    let _ = munmap(*ptr, *len);
                }
            },
            MapMode::Caller => {}
        }
    }
}

fn npages(size: u64, page_size: u64) -> u32 {
    let pages = (size - 1) / page_size;
    64 - pages.leading_zeros()
}

/// Bytes of lockable memory a ring with the given negotiated capacities
/// pins, for rlimit planning on kernels without native workers.
pub(crate) fn rings_size(flags: SetupFlags, entries: u32, cq_entries: u32, page_size: u64) -> u64 {
    let mut cq_size = cqe_size(flags) as u64 * cq_entries as u64;
    cq_size += KERNEL_RING_HEADER;
    cq_size = (cq_size + 63) & !63;
    let mut pages = 1u64 << npages(cq_size, page_size);

    let sq_size = sqe_size(flags) as u64 * entries as u64;
    pages += 1u64 << npages(sq_size, page_size);

    pages * page_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1, 2)]
    #[case(2, 2, 4)]
    #[case(3, 4, 8)]
    #[case(100, 128, 256)]
    #[case(32768, 32768, 65536)]
    fn test_negotiation_rounds_to_power_of_two(
        #[case] requested: u32,
        #[case] sq: u32,
        #[case] cq: u32,
    ) {
        let p = Params::default();
        assert_eq!(negotiate_entries(requested, &p).unwrap(), (sq, cq));
    }

    #[test]
    fn test_negotiation_rejects_zero() {
        let p = Params::default();
        assert!(matches!(
            negotiate_entries(0, &p),
            Err(RingError::InvalidEntries(0))
        ));
    }

    #[test]
    fn test_negotiation_over_max_needs_clamp() {
        let p = Params::default();
        assert!(negotiate_entries(40_000, &p).is_err());

        let p = Params::new(SetupFlags::CLAMP);
        assert_eq!(
            negotiate_entries(40_000, &p).unwrap(),
            (sys::KERN_MAX_ENTRIES, 2 * sys::KERN_MAX_ENTRIES)
        );
    }

    #[test]
    fn test_negotiation_explicit_cq_size() {
        let p = Params::new(SetupFlags::empty()).cq_entries(100);
        assert_eq!(negotiate_entries(16, &p).unwrap(), (16, 128));

        // explicit zero completion size is a configuration error
        let p = Params::new(SetupFlags::empty()).cq_entries(0);
        assert!(negotiate_entries(16, &p).is_err());

        // completion capacity below submission capacity is rejected
        let p = Params::new(SetupFlags::empty()).cq_entries(8);
        assert!(negotiate_entries(64, &p).is_err());
    }

    #[test]
    fn test_entry_sizes_double_in_large_modes() {
        assert_eq!(sqe_size(SetupFlags::empty()), 64);
        assert_eq!(sqe_size(SetupFlags::SQE128), 128);
        assert_eq!(cqe_size(SetupFlags::empty()), 16);
        assert_eq!(cqe_size(SetupFlags::CQE32), 32);
    }

    #[test]
    fn test_rings_size_monotonic_in_entries() {
        let page = 4096;
        let small = rings_size(SetupFlags::empty(), 16, 32, page);
        let large = rings_size(SetupFlags::empty(), 4096, 8192, page);
        assert!(small >= 2 * page as u64);
        assert!(large > small);
        assert_eq!(small % page as u64, 0);
    }
}
