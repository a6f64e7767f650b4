use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("invalid ring entry count: {0}")]
    InvalidEntries(u32),

    #[error("incompatible setup flags: {0}")]
    IncompatibleFlags(&'static str),

    #[error("no completion ready")]
    WouldBlock,

    #[error("interrupted by signal")]
    Interrupted,

    #[error("wait deadline elapsed")]
    TimedOut,

    #[error("operation canceled")]
    Canceled,

    #[error("ring memory exceeds a huge page")]
    RingMemoryTooLarge,

    #[error("provided buffer too small for ring memory")]
    ProvidedBufferTooSmall,

    #[error("ring descriptor already registered")]
    AlreadyRegistered,

    #[error("ring descriptor not registered")]
    NotRegistered,

    #[error("operation not supported by this kernel")]
    Unsupported,

    #[error("system error: {0}")]
    Os(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, RingError>;

impl RingError {
    /// Classify an errno coming back from the enter call or from the result
    /// slot of an internally consumed timeout completion.
    pub(crate) fn from_wait_errno(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN => RingError::WouldBlock,
            Errno::EINTR => RingError::Interrupted,
            Errno::ETIME => RingError::TimedOut,
            Errno::ECANCELED => RingError::Canceled,
            other => RingError::Os(other),
        }
    }

    /// True for the transient no-data conditions the caller is expected to
    /// retry: would-block and signal interruption.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RingError::WouldBlock | RingError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_errno_classification() {
        assert!(matches!(
            RingError::from_wait_errno(Errno::EAGAIN),
            RingError::WouldBlock
        ));
        assert!(matches!(
            RingError::from_wait_errno(Errno::EINTR),
            RingError::Interrupted
        ));
        assert!(matches!(
            RingError::from_wait_errno(Errno::ETIME),
            RingError::TimedOut
        ));
        assert!(matches!(
            RingError::from_wait_errno(Errno::ECANCELED),
            RingError::Canceled
        ));
        assert!(matches!(
            RingError::from_wait_errno(Errno::ENOSYS),
            RingError::Os(Errno::ENOSYS)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(RingError::WouldBlock.is_retryable());
        assert!(RingError::Interrupted.is_retryable());
        assert!(!RingError::TimedOut.is_retryable());
        assert!(!RingError::Os(Errno::EINVAL).is_retryable());
    }
}
