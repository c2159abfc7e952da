//! Register definitions for the g64 architecture.

use core::fmt;

/// Number of general purpose registers.
pub const NUM_GPR: usize = 16;

/// Number of floating-point registers.
pub const NUM_FPR: usize = 8;

/// Hardware encoding of the stack pointer (`r15`).
pub const REG_SP: u8 = 15;

/// A g64 general purpose register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Gpr(u8);

impl Gpr {
    /// Create a register from its hardware encoding.
    ///
    /// Panics if `enc` is out of range; decoders should use [`Gpr::try_new`].
    pub fn new(enc: u8) -> Self {
        assert!((enc as usize) < NUM_GPR, "invalid GPR encoding {enc}");
        Self(enc)
    }

    /// Create a register from an untrusted hardware encoding.
    pub fn try_new(enc: u8) -> Option<Self> {
        if (enc as usize) < NUM_GPR {
            Some(Self(enc))
        } else {
            None
        }
    }

    /// The stack pointer register.
    pub fn sp() -> Self {
        Self(REG_SP)
    }

    /// Return the register's hardware encoding.
    pub fn enc(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == REG_SP {
            write!(f, "sp")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// A g64 floating-point register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fpr(u8);

impl Fpr {
    pub fn new(enc: u8) -> Self {
        assert!((enc as usize) < NUM_FPR, "invalid FPR encoding {enc}");
        Self(enc)
    }

    pub fn try_new(enc: u8) -> Option<Self> {
        if (enc as usize) < NUM_FPR {
            Some(Self(enc))
        } else {
            None
        }
    }

    pub fn enc(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Fpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}
