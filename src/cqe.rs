//! Completion-queue event layout.

use bitflags::bitflags;
use nix::errno::Errno;

bitflags! {
    /// Flags the kernel attaches to a completion record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct CqeFlags: u32 {
        /// Upper 16 bits carry the id of the provided buffer used.
        const BUFFER = 1 << 0;
        /// More completions will follow from the same multishot submission.
        const MORE = 1 << 1;
        /// Socket still holds unread data after this receive.
        const SOCK_NONEMPTY = 1 << 2;
        /// Zero-copy notification rather than the operation's own result.
        const NOTIF = 1 << 3;
    }
}

const BUFFER_ID_SHIFT: u32 = 16;

/// One result record in the completion ring. Immutable once produced by the
/// kernel; consumed exactly once when the consumer head passes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CompletionQueueEvent {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

impl CompletionQueueEvent {
    /// The user tag echoed from the matching submission entry.
    pub fn data64(&self) -> u64 {
        self.user_data
    }

    pub fn cqe_flags(&self) -> CqeFlags {
        CqeFlags::from_bits_truncate(self.flags)
    }

    /// Result as the kernel convention encodes it: non-negative count on
    /// success, negated errno on failure.
    pub fn result(&self) -> Result<u32, Errno> {
        if self.res < 0 {
            Err(Errno::from_raw(-self.res))
        } else {
            Ok(self.res as u32)
        }
    }

    /// Id of the provided buffer this completion consumed, if any.
    pub fn buffer_id(&self) -> Option<u16> {
        if self.cqe_flags().contains(CqeFlags::BUFFER) {
            Some((self.flags >> BUFFER_ID_SHIFT) as u16)
        } else {
            None
        }
    }

    /// True while a multishot submission keeps producing completions.
    pub fn has_more(&self) -> bool {
        self.cqe_flags().contains(CqeFlags::MORE)
    }

    pub fn sock_nonempty(&self) -> bool {
        self.cqe_flags().contains(CqeFlags::SOCK_NONEMPTY)
    }

    pub fn is_notification(&self) -> bool {
        self.cqe_flags().contains(CqeFlags::NOTIF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_event_layout() {
        assert_eq!(size_of::<CompletionQueueEvent>(), 16);
    }

    #[test]
    fn test_result_sign_convention() {
        let ok = CompletionQueueEvent {
            user_data: 1,
            res: 42,
            flags: 0,
        };
        assert_eq!(ok.result().unwrap(), 42);

        let err = CompletionQueueEvent {
            user_data: 1,
            res: -libc::ECANCELED,
            flags: 0,
        };
        assert_eq!(err.result().unwrap_err(), Errno::ECANCELED);
    }

    #[test]
    fn test_buffer_id_extraction() {
        let cqe = CompletionQueueEvent {
            user_data: 0,
            res: 128,
            flags: (7 << BUFFER_ID_SHIFT) | CqeFlags::BUFFER.bits() | CqeFlags::MORE.bits(),
        };
        assert_eq!(cqe.buffer_id(), Some(7));
        assert!(cqe.has_more());

        let plain = CompletionQueueEvent {
            user_data: 0,
            res: 128,
            flags: 7 << BUFFER_ID_SHIFT,
        };
        assert_eq!(plain.buffer_id(), None);
    }
}
