//! Opcode probe: ask the kernel which submission opcodes it supports.

use crate::error::Result;
use crate::ring::Ring;
use crate::sys::regop;
use libc::c_void;

pub(crate) const PROBE_OPS: usize = 256;
const OP_SUPPORTED: u16 = 1 << 0;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProbeOp {
    pub op: u8,
    resv: u8,
    pub flags: u16,
    resv2: u32,
}

/// Kernel-filled table of supported opcodes. Heap-boxed; the trailing op
/// table alone is 2 KiB.
#[repr(C)]
pub struct Probe {
    last_op: u8,
    ops_len: u8,
    resv: u16,
    resv2: [u32; 3],
    ops: [ProbeOp; PROBE_OPS],
}

impl Probe {
    pub fn new() -> Box<Probe> {
        // zero is the kernel's "nothing reported" encoding for every field
        unsafe { Box::new(std::mem::zeroed()) }
    }

    /// Highest opcode the running kernel knows about.
    pub fn last_op(&self) -> u8 {
        self.last_op
    }

    /// Whether the kernel executes `op`, per the probe results.
    pub fn is_supported(&self, op: u8) -> bool {
        self.ops[..self.ops_len as usize]
            .iter()
            .any(|probe_op| probe_op.op == op && probe_op.flags & OP_SUPPORTED != 0)
    }
}

impl Ring {
    /// Fill `probe` with this ring's supported-opcode table.
    pub fn register_probe(&mut self, probe: &mut Probe) -> Result<u32> {
        let arg = probe as *mut Probe as *const c_void;
        self.do_register(regop::REGISTER_PROBE, arg, PROBE_OPS as u32)
    }

    /// Probe through this ring.
    pub fn probe(&mut self) -> Result<Box<Probe>> {
        let mut probe = Probe::new();
        self.register_probe(&mut probe)?;
        Ok(probe)
    }
}

/// One-shot probe through a transient two-entry ring.
pub fn probe() -> Result<Box<Probe>> {
    let mut ring = Ring::new(2)?;
    ring.probe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_layout() {
        assert_eq!(std::mem::size_of::<ProbeOp>(), 8);
        assert_eq!(
            std::mem::size_of::<Probe>(),
            16 + PROBE_OPS * std::mem::size_of::<ProbeOp>()
        );
    }

    #[test]
    fn test_empty_probe_supports_nothing() {
        let probe = Probe::new();
        assert_eq!(probe.last_op(), 0);
        assert!(!probe.is_supported(crate::sqe::opcode::NOP));
    }

    #[test]
    fn test_is_supported_checks_flag_bit() {
        let mut probe = Probe::new();
        probe.ops_len = 2;
        probe.ops[0] = ProbeOp {
            op: crate::sqe::opcode::NOP,
            resv: 0,
            flags: OP_SUPPORTED,
            resv2: 0,
        };
        probe.ops[1] = ProbeOp {
            op: crate::sqe::opcode::SEND_ZC,
            resv: 0,
            flags: 0,
            resv2: 0,
        };
        assert!(probe.is_supported(crate::sqe::opcode::NOP));
        assert!(!probe.is_supported(crate::sqe::opcode::SEND_ZC));
        assert!(!probe.is_supported(crate::sqe::opcode::READ));
    }
}
