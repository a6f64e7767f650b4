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

//! # kring - user-space engine for Linux `io_uring`
//!
//! Sets up the kernel's submission/completion rings, maps their shared
//! memory, and drives the lock-free protocol over them: descriptors are
//! staged into the submission ring, published with one release store, and
//! results are reaped from the completion ring, entering the kernel only
//! when the rings cannot make progress on their own.
//!
//! ## Submitting work
//!
//! ```no_run
//! use kring::Ring;
//!
//! let mut ring = Ring::new(16)?;
//!
//! let sqe = ring.get_sqe().expect("ring just created");
//! sqe.prepare_nop();
//! sqe.set_data64(0x42);
//!
//! ring.submit_and_wait(1)?;
//! let cqe = ring.wait_cqe()?;
//! assert_eq!(cqe.data64(), 0x42);
//! ring.cqe_seen(&cqe);
//! # Ok::<(), kring::RingError>(())
//! ```
//!
//! ## Bounded waits
//!
//! ```no_run
//! use kring::Ring;
//! use std::time::Duration;
//!
//! let mut ring = Ring::new(8)?;
//! match ring.wait_cqe_timeout(Duration::from_millis(200)) {
//!     Ok(_cqe) => { /* completion arrived */ }
//!     Err(kring::RingError::TimedOut) => { /* deadline elapsed */ }
//!     Err(err) => return Err(err),
//! }
//! # Ok::<(), kring::RingError>(())
//! ```
//!
//! On kernels with the extended enter argument the deadline rides along
//! the syscall; older kernels get a timeout descriptor injected under a
//! reserved tag, and its completion never reaches the caller.
//!
//! ## Zero-copy receives
//!
//! ```no_run
//! use kring::Ring;
//!
//! let mut ring = Ring::new(8)?;
//! let mut buffers = vec![0u8; 8 * 4096];
//! let mut br = ring.setup_buf_ring(8, 7)?;
//!
//! let mask = br.mask();
//! for (id, chunk) in buffers.chunks_mut(4096).enumerate() {
//!     br.add(chunk.as_mut_ptr() as u64, 4096, id as u16, mask, id as u16);
//! }
//! br.advance(8);
//!
//! // a multishot receive on group 7 now fills kernel-selected buffers;
//! // each completion names its buffer id, which goes back via add+advance
//! # Ok::<(), kring::RingError>(())
//! ```
//!
//! A `Ring` is a single-producer, single-consumer structure; share one
//! across threads only behind external synchronization. Every
//! ring-manipulation call is non-blocking except the enter syscall paths
//! (`submit_and_wait`, `wait_cqe*`), which block the calling thread.

pub use bufring::{BufRing, BufRingEntry};
pub use cqe::{CompletionQueueEvent, CqeFlags};
pub use error::{Result, RingError};
pub use nix::errno::Errno;
pub use probe::{probe, Probe, ProbeOp};
pub use ring::{mlock_size, mlock_size_params, Ring};
pub use sqe::{opcode, OpenHow, SqeFlags, SubmissionQueueEntry};
pub use squeue::{cq_needs_enter, cq_needs_flush, sq_needs_enter};
pub use sys::{
    EnterFlags, Features, Params, Restriction, SetupFlags, SqFlags, SyncCancelReg,
    KERN_MAX_CQ_ENTRIES, KERN_MAX_ENTRIES,
};
pub use version::{check_kernel_version, KernelVersion};

pub mod bufring;
pub mod cqe;
pub mod error;
pub mod probe;
pub mod ring;
pub mod sqe;
pub mod version;

pub(crate) mod cqueue;
pub(crate) mod memory;
pub(crate) mod register;
pub(crate) mod squeue;
pub(crate) mod sys;
