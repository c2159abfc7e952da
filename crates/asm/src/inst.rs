//! The g64 instruction set: decoding and encoding.
//!
//! g64 is a 64-bit little-endian register machine with a variable-length
//! encoding (one opcode byte followed by operands). The instruction set is
//! split in two halves: *guest* instructions, which may appear in programs
//! handed to the engine, and *host* pseudo-operations (opcodes `0xE0` and
//! up), which only translated code uses to talk to the engine context.

use crate::regs::{Fpr, Gpr};
use crate::sink::CodeSink;
use smallvec::SmallVec;
use thiserror::Error;

/// Condition codes evaluated against the flags word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    /// Zero flag set.
    Eq,
    /// Zero flag clear.
    Ne,
    /// Signed less-than flag set.
    Lt,
    /// Signed less-than flag clear.
    Ge,
}

/// Flags-word bit for "equal" after `Cmp`.
pub const FLAG_ZERO: u64 = 1 << 0;
/// Flags-word bit for "signed less-than" after `Cmp`.
pub const FLAG_LESS: u64 = 1 << 1;

impl Cond {
    pub fn from_enc(enc: u8) -> Option<Self> {
        match enc {
            0 => Some(Self::Eq),
            1 => Some(Self::Ne),
            2 => Some(Self::Lt),
            3 => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn enc(self) -> u8 {
        match self {
            Self::Eq => 0,
            Self::Ne => 1,
            Self::Lt => 2,
            Self::Ge => 3,
        }
    }

    /// Evaluate the condition against a flags word.
    pub fn eval(self, flags: u64) -> bool {
        match self {
            Self::Eq => flags & FLAG_ZERO != 0,
            Self::Ne => flags & FLAG_ZERO == 0,
            Self::Lt => flags & FLAG_LESS != 0,
            Self::Ge => flags & FLAG_LESS == 0,
        }
    }
}

/// A decoded g64 instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    Nop,
    /// `rd = sext(imm)`, or `(ext << 32) | imm` under an `Ext` prefix.
    MovImm { rd: Gpr, imm: i32 },
    MovReg { rd: Gpr, rs: Gpr },
    Add { rd: Gpr, rs: Gpr },
    Sub { rd: Gpr, rs: Gpr },
    AddImm { rd: Gpr, imm: i32 },
    /// Compare and set the flags word.
    Cmp { ra: Gpr, rb: Gpr },
    /// `rd = mem64[base + offset]`
    Load { rd: Gpr, base: Gpr, offset: i16 },
    /// `mem64[base + offset] = src`
    Store { base: Gpr, src: Gpr, offset: i16 },
    Push { rs: Gpr },
    Pop { rd: Gpr },
    /// `rd = next_pc + offset`: the PC-relative address computation.
    Lea { rd: Gpr, offset: i32 },
    FMovImm { fd: Fpr, imm: i32 },
    FAdd { fd: Fpr, fs: Fpr },
    /// Relative jump: `pc = next_pc + offset`.
    Jmp { offset: i32 },
    JmpReg { rs: Gpr },
    Jcc { cond: Cond, offset: i32 },
    /// Push `next_pc`, then `pc = next_pc + offset`.
    Call { offset: i32 },
    CallReg { rs: Gpr },
    Ret,
    /// Breakpoint trap.
    Brk,
    /// Immediate-widening prefix: supplies the upper 32 bits of the next
    /// instruction's immediate. Incomplete on its own.
    Ext { imm: u32 },

    // Host pseudo-operations. Translated code only.
    /// Write an immediate guest PC into the context.
    CtxSetPcImm { pc: u64 },
    /// Write a register value into the context guest PC.
    CtxSetPcReg { rs: Gpr },
    /// Conditionally select the next guest PC from the flags word.
    CtxSelectPc { cond: Cond, taken: u64, fallthrough: u64 },
    /// Push an immediate on the guest stack (return-address materialization).
    CtxPushImm { value: u64 },
    /// Pop the guest stack into the context guest PC.
    CtxPopPc,
    /// Suspend execution and hand control to instrumentation callback `index`.
    Yield { index: u16 },
    /// Host-stream-relative jump; the epilogue relocation target.
    JmpHost { offset: i32 },
    /// Epilogue body: return to the trampoline.
    Stop,
    /// Load a full 64-bit constant; used to materialize patched PC-relative
    /// address computations.
    MovAbs { rd: Gpr, value: u64 },
}

/// An instruction decoded at a guest address.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedInst {
    pub inst: Inst,
    pub address: u64,
    pub size: u8,
}

impl DecodedInst {
    /// Address of the instruction following this one.
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(u64::from(self.size))
    }
}

/// Failure to decode one instruction.
///
/// Inside an instrumented range these are contract violations, not runtime
/// errors; callers decide how loudly to fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {opcode:#04x} at address {address:#x}")]
    UnknownOpcode { opcode: u8, address: u64 },
    #[error("truncated instruction at address {address:#x}")]
    Truncated { address: u64 },
    #[error("invalid register encoding at address {address:#x}")]
    InvalidRegister { address: u64 },
    #[error("invalid condition encoding at address {address:#x}")]
    InvalidCondition { address: u64 },
}

fn rd16(code: &[u8], at: usize, address: u64) -> Result<u16, DecodeError> {
    let bytes = code
        .get(at..at + 2)
        .ok_or(DecodeError::Truncated { address })?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn rd32(code: &[u8], at: usize, address: u64) -> Result<u32, DecodeError> {
    let bytes = code
        .get(at..at + 4)
        .ok_or(DecodeError::Truncated { address })?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn rd64(code: &[u8], at: usize, address: u64) -> Result<u64, DecodeError> {
    let bytes = code
        .get(at..at + 8)
        .ok_or(DecodeError::Truncated { address })?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn gpr(code: &[u8], at: usize, address: u64) -> Result<Gpr, DecodeError> {
    let enc = *code.get(at).ok_or(DecodeError::Truncated { address })?;
    Gpr::try_new(enc).ok_or(DecodeError::InvalidRegister { address })
}

fn fpr(code: &[u8], at: usize, address: u64) -> Result<Fpr, DecodeError> {
    let enc = *code.get(at).ok_or(DecodeError::Truncated { address })?;
    Fpr::try_new(enc).ok_or(DecodeError::InvalidRegister { address })
}

fn cond(code: &[u8], at: usize, address: u64) -> Result<Cond, DecodeError> {
    let enc = *code.get(at).ok_or(DecodeError::Truncated { address })?;
    Cond::from_enc(enc).ok_or(DecodeError::InvalidCondition { address })
}

/// Decode one instruction from the start of `code`, assumed to live at
/// `address` in guest memory.
pub fn decode(code: &[u8], address: u64) -> Result<DecodedInst, DecodeError> {
    let op = *code.first().ok_or(DecodeError::Truncated { address })?;
    let inst = match op {
        0x00 => Inst::Nop,
        0x01 => Inst::MovImm {
            rd: gpr(code, 1, address)?,
            imm: rd32(code, 2, address)? as i32,
        },
        0x02 => Inst::MovReg {
            rd: gpr(code, 1, address)?,
            rs: gpr(code, 2, address)?,
        },
        0x03 => Inst::Add {
            rd: gpr(code, 1, address)?,
            rs: gpr(code, 2, address)?,
        },
        0x04 => Inst::Sub {
            rd: gpr(code, 1, address)?,
            rs: gpr(code, 2, address)?,
        },
        0x05 => Inst::AddImm {
            rd: gpr(code, 1, address)?,
            imm: rd32(code, 2, address)? as i32,
        },
        0x06 => Inst::Cmp {
            ra: gpr(code, 1, address)?,
            rb: gpr(code, 2, address)?,
        },
        0x07 => Inst::Load {
            rd: gpr(code, 1, address)?,
            base: gpr(code, 2, address)?,
            offset: rd16(code, 3, address)? as i16,
        },
        0x08 => Inst::Store {
            base: gpr(code, 1, address)?,
            src: gpr(code, 2, address)?,
            offset: rd16(code, 3, address)? as i16,
        },
        0x09 => Inst::Push {
            rs: gpr(code, 1, address)?,
        },
        0x0A => Inst::Pop {
            rd: gpr(code, 1, address)?,
        },
        0x0B => Inst::Lea {
            rd: gpr(code, 1, address)?,
            offset: rd32(code, 2, address)? as i32,
        },
        0x0C => Inst::FMovImm {
            fd: fpr(code, 1, address)?,
            imm: rd32(code, 2, address)? as i32,
        },
        0x0D => Inst::FAdd {
            fd: fpr(code, 1, address)?,
            fs: fpr(code, 2, address)?,
        },
        0x10 => Inst::Jmp {
            offset: rd32(code, 1, address)? as i32,
        },
        0x11 => Inst::JmpReg {
            rs: gpr(code, 1, address)?,
        },
        0x12 => Inst::Jcc {
            cond: cond(code, 1, address)?,
            offset: rd32(code, 2, address)? as i32,
        },
        0x13 => Inst::Call {
            offset: rd32(code, 1, address)? as i32,
        },
        0x14 => Inst::CallReg {
            rs: gpr(code, 1, address)?,
        },
        0x15 => Inst::Ret,
        0x16 => Inst::Brk,
        0x18 => Inst::Ext {
            imm: rd32(code, 1, address)?,
        },
        0xE0 => Inst::CtxSetPcImm {
            pc: rd64(code, 1, address)?,
        },
        0xE1 => Inst::CtxSetPcReg {
            rs: gpr(code, 1, address)?,
        },
        0xE2 => Inst::CtxSelectPc {
            cond: cond(code, 1, address)?,
            taken: rd64(code, 2, address)?,
            fallthrough: rd64(code, 10, address)?,
        },
        0xE3 => Inst::CtxPushImm {
            value: rd64(code, 1, address)?,
        },
        0xE4 => Inst::CtxPopPc,
        0xE5 => Inst::Yield {
            index: rd16(code, 1, address)?,
        },
        0xE6 => Inst::JmpHost {
            offset: rd32(code, 1, address)? as i32,
        },
        0xE7 => Inst::Stop,
        0xE8 => Inst::MovAbs {
            rd: gpr(code, 1, address)?,
            value: rd64(code, 2, address)?,
        },
        opcode => return Err(DecodeError::UnknownOpcode { opcode, address }),
    };
    let size = inst.encoded_len();
    if code.len() < usize::from(size) {
        return Err(DecodeError::Truncated { address });
    }
    Ok(DecodedInst {
        inst,
        address,
        size,
    })
}

impl Inst {
    /// Length of the encoded form, in bytes.
    pub fn encoded_len(&self) -> u8 {
        match self {
            Inst::Nop | Inst::Ret | Inst::Brk | Inst::CtxPopPc | Inst::Stop => 1,
            Inst::Push { .. }
            | Inst::Pop { .. }
            | Inst::JmpReg { .. }
            | Inst::CallReg { .. }
            | Inst::CtxSetPcReg { .. } => 2,
            Inst::MovReg { .. }
            | Inst::Add { .. }
            | Inst::Sub { .. }
            | Inst::Cmp { .. }
            | Inst::FAdd { .. }
            | Inst::Yield { .. } => 3,
            Inst::Load { .. } | Inst::Store { .. } => 5,
            Inst::Jmp { .. } | Inst::Call { .. } | Inst::Ext { .. } | Inst::JmpHost { .. } => 5,
            Inst::MovImm { .. }
            | Inst::AddImm { .. }
            | Inst::Lea { .. }
            | Inst::FMovImm { .. }
            | Inst::Jcc { .. } => 6,
            Inst::CtxSetPcImm { .. } | Inst::CtxPushImm { .. } => 9,
            Inst::MovAbs { .. } => 10,
            Inst::CtxSelectPc { .. } => 18,
        }
    }

    /// Emit the encoded form into a sink.
    pub fn encode(&self, sink: &mut dyn CodeSink) {
        match *self {
            Inst::Nop => sink.put1(0x00),
            Inst::MovImm { rd, imm } => {
                sink.put1(0x01);
                sink.put1(rd.enc());
                sink.put4(imm as u32);
            }
            Inst::MovReg { rd, rs } => {
                sink.put1(0x02);
                sink.put1(rd.enc());
                sink.put1(rs.enc());
            }
            Inst::Add { rd, rs } => {
                sink.put1(0x03);
                sink.put1(rd.enc());
                sink.put1(rs.enc());
            }
            Inst::Sub { rd, rs } => {
                sink.put1(0x04);
                sink.put1(rd.enc());
                sink.put1(rs.enc());
            }
            Inst::AddImm { rd, imm } => {
                sink.put1(0x05);
                sink.put1(rd.enc());
                sink.put4(imm as u32);
            }
            Inst::Cmp { ra, rb } => {
                sink.put1(0x06);
                sink.put1(ra.enc());
                sink.put1(rb.enc());
            }
            Inst::Load { rd, base, offset } => {
                sink.put1(0x07);
                sink.put1(rd.enc());
                sink.put1(base.enc());
                sink.put2(offset as u16);
            }
            Inst::Store { base, src, offset } => {
                sink.put1(0x08);
                sink.put1(base.enc());
                sink.put1(src.enc());
                sink.put2(offset as u16);
            }
            Inst::Push { rs } => {
                sink.put1(0x09);
                sink.put1(rs.enc());
            }
            Inst::Pop { rd } => {
                sink.put1(0x0A);
                sink.put1(rd.enc());
            }
            Inst::Lea { rd, offset } => {
                sink.put1(0x0B);
                sink.put1(rd.enc());
                sink.put4(offset as u32);
            }
            Inst::FMovImm { fd, imm } => {
                sink.put1(0x0C);
                sink.put1(fd.enc());
                sink.put4(imm as u32);
            }
            Inst::FAdd { fd, fs } => {
                sink.put1(0x0D);
                sink.put1(fd.enc());
                sink.put1(fs.enc());
            }
            Inst::Jmp { offset } => {
                sink.put1(0x10);
                sink.put4(offset as u32);
            }
            Inst::JmpReg { rs } => {
                sink.put1(0x11);
                sink.put1(rs.enc());
            }
            Inst::Jcc { cond, offset } => {
                sink.put1(0x12);
                sink.put1(cond.enc());
                sink.put4(offset as u32);
            }
            Inst::Call { offset } => {
                sink.put1(0x13);
                sink.put4(offset as u32);
            }
            Inst::CallReg { rs } => {
                sink.put1(0x14);
                sink.put1(rs.enc());
            }
            Inst::Ret => sink.put1(0x15),
            Inst::Brk => sink.put1(0x16),
            Inst::Ext { imm } => {
                sink.put1(0x18);
                sink.put4(imm);
            }
            Inst::CtxSetPcImm { pc } => {
                sink.put1(0xE0);
                sink.put8(pc);
            }
            Inst::CtxSetPcReg { rs } => {
                sink.put1(0xE1);
                sink.put1(rs.enc());
            }
            Inst::CtxSelectPc {
                cond,
                taken,
                fallthrough,
            } => {
                sink.put1(0xE2);
                sink.put1(cond.enc());
                sink.put8(taken);
                sink.put8(fallthrough);
            }
            Inst::CtxPushImm { value } => {
                sink.put1(0xE3);
                sink.put8(value);
            }
            Inst::CtxPopPc => sink.put1(0xE4),
            Inst::Yield { index } => {
                sink.put1(0xE5);
                sink.put2(index);
            }
            Inst::JmpHost { offset } => {
                sink.put1(0xE6);
                sink.put4(offset as u32);
            }
            Inst::Stop => sink.put1(0xE7),
            Inst::MovAbs { rd, value } => {
                sink.put1(0xE8);
                sink.put1(rd.enc());
                sink.put8(value);
            }
        }
    }

    /// Mnemonic, as the disassembler prints it.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Inst::Nop => "nop",
            Inst::MovImm { .. } => "mov",
            Inst::MovReg { .. } => "mov",
            Inst::Add { .. } => "add",
            Inst::Sub { .. } => "sub",
            Inst::AddImm { .. } => "add",
            Inst::Cmp { .. } => "cmp",
            Inst::Load { .. } => "ld",
            Inst::Store { .. } => "st",
            Inst::Push { .. } => "push",
            Inst::Pop { .. } => "pop",
            Inst::Lea { .. } => "lea",
            Inst::FMovImm { .. } => "fmov",
            Inst::FAdd { .. } => "fadd",
            Inst::Jmp { .. } => "jmp",
            Inst::JmpReg { .. } => "jmp",
            Inst::Jcc { .. } => "jcc",
            Inst::Call { .. } => "call",
            Inst::CallReg { .. } => "call",
            Inst::Ret => "ret",
            Inst::Brk => "brk",
            Inst::Ext { .. } => "ext",
            Inst::CtxSetPcImm { .. } => "ctx.setpc",
            Inst::CtxSetPcReg { .. } => "ctx.setpc",
            Inst::CtxSelectPc { .. } => "ctx.selpc",
            Inst::CtxPushImm { .. } => "ctx.push",
            Inst::CtxPopPc => "ctx.poppc",
            Inst::Yield { .. } => "yield",
            Inst::JmpHost { .. } => "jmp.host",
            Inst::Stop => "stop",
            Inst::MovAbs { .. } => "mov.abs",
        }
    }

    /// Whether the instruction modifies the program counter non-trivially:
    /// the basic-block terminator predicate.
    pub fn modifies_pc(&self) -> bool {
        matches!(
            self,
            Inst::Jmp { .. }
                | Inst::JmpReg { .. }
                | Inst::Jcc { .. }
                | Inst::Call { .. }
                | Inst::CallReg { .. }
                | Inst::Ret
        )
    }

    /// Whether the instruction's semantics depend on its own address.
    pub fn pc_dependent(&self) -> bool {
        matches!(
            self,
            Inst::Lea { .. }
                | Inst::Jmp { .. }
                | Inst::Jcc { .. }
                | Inst::Call { .. }
        )
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Inst::Jmp { .. } | Inst::JmpReg { .. } | Inst::Jcc { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Inst::Call { .. } | Inst::CallReg { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Inst::Ret)
    }

    pub fn may_load(&self) -> bool {
        matches!(self, Inst::Load { .. } | Inst::Pop { .. } | Inst::Ret | Inst::CtxPopPc)
    }

    pub fn may_store(&self) -> bool {
        matches!(
            self,
            Inst::Store { .. }
                | Inst::Push { .. }
                | Inst::Call { .. }
                | Inst::CallReg { .. }
                | Inst::CtxPushImm { .. }
        )
    }

    /// Whether the instruction reads or writes floating-point state.
    pub fn uses_fpr(&self) -> bool {
        matches!(self, Inst::FMovImm { .. } | Inst::FAdd { .. })
    }

    /// Whether this is a host pseudo-operation that must never appear in
    /// guest code handed to the patcher.
    pub fn host_only(&self) -> bool {
        matches!(
            self,
            Inst::CtxSetPcImm { .. }
                | Inst::CtxSetPcReg { .. }
                | Inst::CtxSelectPc { .. }
                | Inst::CtxPushImm { .. }
                | Inst::CtxPopPc
                | Inst::Yield { .. }
                | Inst::JmpHost { .. }
                | Inst::Stop
                | Inst::MovAbs { .. }
        )
    }

    /// General-purpose registers read by the instruction, implicit stack
    /// pointer included.
    pub fn reg_reads(&self) -> SmallVec<[Gpr; 3]> {
        let mut regs = SmallVec::new();
        match *self {
            Inst::MovReg { rs, .. } => regs.push(rs),
            Inst::Add { rd, rs } | Inst::Sub { rd, rs } => {
                regs.push(rd);
                regs.push(rs);
            }
            Inst::AddImm { rd, .. } => regs.push(rd),
            Inst::Cmp { ra, rb } => {
                regs.push(ra);
                regs.push(rb);
            }
            Inst::Load { base, .. } => regs.push(base),
            Inst::Store { base, src, .. } => {
                regs.push(base);
                regs.push(src);
            }
            Inst::Push { rs } => {
                regs.push(rs);
                regs.push(Gpr::sp());
            }
            Inst::Pop { .. } | Inst::Ret | Inst::CtxPopPc => regs.push(Gpr::sp()),
            Inst::JmpReg { rs } | Inst::CtxSetPcReg { rs } => regs.push(rs),
            Inst::CallReg { rs } => {
                regs.push(rs);
                regs.push(Gpr::sp());
            }
            Inst::Call { .. } | Inst::CtxPushImm { .. } => regs.push(Gpr::sp()),
            _ => {}
        }
        regs
    }

    /// General-purpose registers written by the instruction.
    pub fn reg_writes(&self) -> SmallVec<[Gpr; 2]> {
        let mut regs = SmallVec::new();
        match *self {
            Inst::MovImm { rd, .. }
            | Inst::MovReg { rd, .. }
            | Inst::Add { rd, .. }
            | Inst::Sub { rd, .. }
            | Inst::AddImm { rd, .. }
            | Inst::Load { rd, .. }
            | Inst::Lea { rd, .. }
            | Inst::MovAbs { rd, .. } => regs.push(rd),
            Inst::Pop { rd } => {
                regs.push(rd);
                regs.push(Gpr::sp());
            }
            Inst::Push { .. }
            | Inst::Call { .. }
            | Inst::CallReg { .. }
            | Inst::Ret
            | Inst::CtxPushImm { .. }
            | Inst::CtxPopPc => regs.push(Gpr::sp()),
            _ => {}
        }
        regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(inst: Inst) {
        let mut buf: Vec<u8> = Vec::new();
        inst.encode(&mut buf);
        assert_eq!(buf.len(), usize::from(inst.encoded_len()));
        let decoded = decode(&buf, 0x1000).unwrap();
        assert_eq!(decoded.inst, inst);
        assert_eq!(decoded.size, inst.encoded_len());
    }

    #[test]
    fn decode_matches_encode() {
        roundtrip(Inst::MovImm {
            rd: Gpr::new(0),
            imm: -42,
        });
        roundtrip(Inst::Load {
            rd: Gpr::new(1),
            base: Gpr::sp(),
            offset: -8,
        });
        roundtrip(Inst::Jcc {
            cond: Cond::Lt,
            offset: -16,
        });
        roundtrip(Inst::CtxSelectPc {
            cond: Cond::Ne,
            taken: 0x1234_5678_9abc_def0,
            fallthrough: 0x2000,
        });
        roundtrip(Inst::Ext { imm: 0xdead_beef });
    }

    #[test]
    fn unknown_opcode_is_reported_with_address() {
        let err = decode(&[0xFF], 0x4000).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownOpcode {
                opcode: 0xFF,
                address: 0x4000
            }
        );
    }

    #[test]
    fn truncated_operand() {
        // `mov rd, imm32` cut short after the register byte.
        let err = decode(&[0x01, 0x00, 0x11], 0x4000).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { address: 0x4000 });
    }

    #[test]
    fn terminator_classification() {
        assert!(Inst::Ret.modifies_pc());
        assert!(Inst::Jmp { offset: 4 }.modifies_pc());
        assert!(!Inst::Nop.modifies_pc());
        assert!(!Inst::Ext { imm: 0 }.modifies_pc());
        assert!(Inst::Lea {
            rd: Gpr::new(2),
            offset: 8
        }
        .pc_dependent());
    }

    #[test]
    fn implicit_stack_operands() {
        let push = Inst::Push { rs: Gpr::new(4) };
        assert!(push.reg_reads().contains(&Gpr::sp()));
        assert!(push.reg_writes().contains(&Gpr::sp()));
        let pop = Inst::Pop { rd: Gpr::new(4) };
        assert!(pop.may_load());
        assert!(pop.reg_writes().contains(&Gpr::new(4)));
    }
}
