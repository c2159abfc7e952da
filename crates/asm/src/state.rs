//! Architectural register state of the g64 target.

use crate::regs::{Gpr, NUM_FPR, NUM_GPR, REG_SP};

/// General purpose register state, including the program counter and the
/// flags word. `r15` doubles as the stack pointer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GprState {
    pub regs: [u64; NUM_GPR],
    pub pc: u64,
    pub flags: u64,
}

impl GprState {
    pub fn reg(&self, r: Gpr) -> u64 {
        self.regs[usize::from(r.enc())]
    }

    pub fn set_reg(&mut self, r: Gpr, value: u64) {
        self.regs[usize::from(r.enc())] = value;
    }

    pub fn sp(&self) -> u64 {
        self.regs[usize::from(REG_SP)]
    }

    pub fn set_sp(&mut self, value: u64) {
        self.regs[usize::from(REG_SP)] = value;
    }
}

/// Floating-point register state.
#[derive(Clone, Debug, PartialEq)]
pub struct FprState {
    pub regs: [f64; NUM_FPR],
    /// Control word; the reset value mirrors the usual hardware default.
    pub fcw: u16,
    pub status: u16,
}

impl Default for FprState {
    fn default() -> Self {
        Self {
            regs: [0.0; NUM_FPR],
            fcw: 0x37F,
            status: 0,
        }
    }
}
