//! Kernel release probing, for gating features on the running kernel.

use crate::error::{Result, RingError};
use nix::errno::Errno;
use nix::sys::utsname::uname;
use std::cmp::Ordering;

/// Parsed `uname` release triple plus whatever trails it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub kernel: u32,
    pub major: u32,
    pub minor: u32,
    pub flavor: String,
}

impl KernelVersion {
    /// Release of the running kernel.
    pub fn current() -> Result<KernelVersion> {
        let uts = uname()?;
        let release = uts.release().to_str().ok_or(RingError::Os(Errno::EINVAL))?;
        KernelVersion::parse(release).ok_or(RingError::Os(Errno::EINVAL))
    }

    /// Parse a release string like `6.5.0-14-generic`. The minor component
    /// and flavor are optional; at least `kernel.major` must be present.
    pub fn parse(release: &str) -> Option<KernelVersion> {
        let mut rest = release;
        let kernel = take_number(&mut rest)?;
        if !rest.starts_with('.') {
            return None;
        }
        rest = &rest[1..];
        let major = take_number(&mut rest)?;

        let minor = if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
            take_number(&mut rest).unwrap_or(0)
        } else {
            0
        };

        Some(KernelVersion {
            kernel,
            major,
            minor,
            flavor: rest.to_string(),
        })
    }

    fn triple(&self) -> (u32, u32, u32) {
        (self.kernel, self.major, self.minor)
    }

    pub fn compare(&self, other: &KernelVersion) -> Ordering {
        self.triple().cmp(&other.triple())
    }

    pub fn at_least(&self, kernel: u32, major: u32, minor: u32) -> bool {
        self.triple() >= (kernel, major, minor)
    }
}

/// Whether the running kernel release is at least `kernel.major.minor`.
pub fn check_kernel_version(kernel: u32, major: u32, minor: u32) -> Result<bool> {
    Ok(KernelVersion::current()?.at_least(kernel, major, minor))
}

fn take_number(s: &mut &str) -> Option<u32> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    *s = &s[end..];
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("5.15.0-91-generic", 5, 15, 0, "-91-generic")]
    #[case("6.1", 6, 1, 0, "")]
    #[case("4.4.0", 4, 4, 0, "")]
    #[case("6.5.7-arch1-1", 6, 5, 7, "-arch1-1")]
    #[case("5.10.0-8-amd64", 5, 10, 0, "-8-amd64")]
    fn test_parse_release_strings(
        #[case] release: &str,
        #[case] kernel: u32,
        #[case] major: u32,
        #[case] minor: u32,
        #[case] flavor: &str,
    ) {
        let v = KernelVersion::parse(release).unwrap();
        assert_eq!((v.kernel, v.major, v.minor), (kernel, major, minor));
        assert_eq!(v.flavor, flavor);
    }

    #[rstest]
    #[case("")]
    #[case("6")]
    #[case("abc")]
    #[case(".5.1")]
    fn test_parse_rejects_partial_releases(#[case] release: &str) {
        assert!(KernelVersion::parse(release).is_none());
    }

    #[test]
    fn test_version_comparison() {
        let a = KernelVersion::parse("5.10.3").unwrap();
        let b = KernelVersion::parse("5.9.99-generic").unwrap();
        assert_eq!(a.compare(&b), Ordering::Greater);
        assert!(a.at_least(5, 10, 3));
        assert!(!a.at_least(5, 10, 4));
        assert!(a.at_least(4, 20, 0));
    }

    #[test]
    fn test_current_kernel_parses() {
        let v = KernelVersion::current().unwrap();
        assert!(v.kernel >= 2);
    }
}
