//! The reference execution backend.
//!
//! Two entry points mirror the two ways the engine runs code: [`run_block`]
//! executes translated host code from a code-cache buffer until it reaches a
//! sequence epilogue, an instrumentation yield point, or a fault;
//! [`run_native`] executes raw guest code with full architectural semantics,
//! used when execution is brokered out of instrumentation and by bootstrap
//! code waiting for a trap.

use crate::inst::{decode, DecodeError, Inst};
use crate::memory::{Memory, MemoryError};
use crate::sink::CodeOffset;
use crate::state::{FprState, GprState};
use thiserror::Error;

/// Longest encoded guest instruction, in bytes. Code reads for decoding use
/// this as their window size.
pub const MAX_GUEST_INST_LEN: usize = 6;

/// An execution fault. Faults are not engine errors; they surface the same
/// way a hardware fault in the original code would.
#[derive(Debug, Error)]
pub enum Fault {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("host-only instruction in guest code at {address:#x}")]
    HostOnly { address: u64 },
    #[error("unpatched control-flow instruction in translated code at host offset {offset:#x}")]
    Unpatched { offset: u32 },
    #[error("breakpoint in translated code at host offset {offset:#x}")]
    Breakpoint { offset: u32 },
}

/// Why [`run_block`] returned.
#[derive(Debug)]
pub enum BlockExit {
    /// The sequence epilogue ran; the next guest PC is in the context.
    SequenceEnd,
    /// A `Yield` suspended execution for instrumentation callback `index`;
    /// execution resumes at host offset `resume`.
    Event { index: u16, resume: CodeOffset },
    Fault(Fault),
}

/// Why [`run_native`] returned.
#[derive(Debug)]
pub enum NativeExit {
    /// Control reached the stop address.
    Reached,
    /// A breakpoint trap fired at `address`; the PC still names the trap.
    Breakpoint { address: u64 },
    Fault { address: u64, fault: Fault },
}

fn push(gpr: &mut GprState, mem: &mut dyn Memory, value: u64) -> Result<(), MemoryError> {
    let sp = gpr.sp().wrapping_sub(8);
    mem.write_u64(sp, value)?;
    gpr.set_sp(sp);
    Ok(())
}

fn pop(gpr: &mut GprState, mem: &mut dyn Memory) -> Result<u64, MemoryError> {
    let sp = gpr.sp();
    let value = mem.read_u64(sp)?;
    gpr.set_sp(sp.wrapping_add(8));
    Ok(value)
}

/// Resolve an immediate against a pending `Ext` prefix.
fn imm_value(imm: i32, ext: &mut Option<u32>) -> u64 {
    match ext.take() {
        Some(hi) => (u64::from(hi) << 32) | u64::from(imm as u32),
        None => imm as i64 as u64,
    }
}

fn compare(a: u64, b: u64) -> u64 {
    let mut flags = 0;
    if a == b {
        flags |= crate::inst::FLAG_ZERO;
    }
    if (a as i64) < (b as i64) {
        flags |= crate::inst::FLAG_LESS;
    }
    flags
}

/// Execute one data-flow instruction. Control flow is handled by the two
/// drivers, which disagree about what it means.
fn exec_data(
    inst: &Inst,
    ext: &mut Option<u32>,
    gpr: &mut GprState,
    fpr: &mut FprState,
    mem: &mut dyn Memory,
) -> Result<(), MemoryError> {
    match *inst {
        Inst::Nop => {}
        Inst::MovImm { rd, imm } => gpr.set_reg(rd, imm_value(imm, ext)),
        Inst::MovReg { rd, rs } => gpr.set_reg(rd, gpr.reg(rs)),
        Inst::Add { rd, rs } => gpr.set_reg(rd, gpr.reg(rd).wrapping_add(gpr.reg(rs))),
        Inst::Sub { rd, rs } => gpr.set_reg(rd, gpr.reg(rd).wrapping_sub(gpr.reg(rs))),
        Inst::AddImm { rd, imm } => {
            let v = imm_value(imm, ext);
            gpr.set_reg(rd, gpr.reg(rd).wrapping_add(v));
        }
        Inst::Cmp { ra, rb } => gpr.flags = compare(gpr.reg(ra), gpr.reg(rb)),
        Inst::Load { rd, base, offset } => {
            let address = gpr.reg(base).wrapping_add(offset as i64 as u64);
            gpr.set_reg(rd, mem.read_u64(address)?);
        }
        Inst::Store { base, src, offset } => {
            let address = gpr.reg(base).wrapping_add(offset as i64 as u64);
            mem.write_u64(address, gpr.reg(src))?;
        }
        Inst::Push { rs } => push(gpr, mem, gpr.reg(rs))?,
        Inst::Pop { rd } => {
            let value = pop(gpr, mem)?;
            gpr.set_reg(rd, value);
        }
        Inst::FMovImm { fd, imm } => fpr.regs[usize::from(fd.enc())] = f64::from(imm),
        Inst::FAdd { fd, fs } => {
            fpr.regs[usize::from(fd.enc())] += fpr.regs[usize::from(fs.enc())];
        }
        Inst::Ext { imm } => {
            *ext = Some(imm);
            return Ok(());
        }
        _ => unreachable!("exec_data called on control-flow instruction"),
    }
    // Any non-prefix instruction consumes or discards a pending prefix.
    *ext = None;
    Ok(())
}

/// Execute translated host code starting at `entry` in `code`.
pub fn run_block(
    gpr: &mut GprState,
    fpr: &mut FprState,
    mem: &mut dyn Memory,
    code: &[u8],
    entry: CodeOffset,
) -> BlockExit {
    let mut off = entry as usize;
    let mut ext: Option<u32> = None;
    loop {
        let di = match decode(&code[off.min(code.len())..], off as u64) {
            Ok(di) => di,
            Err(e) => return BlockExit::Fault(e.into()),
        };
        let next = off + usize::from(di.size);
        match di.inst {
            Inst::Stop => return BlockExit::SequenceEnd,
            Inst::Yield { index } => {
                return BlockExit::Event {
                    index,
                    resume: next as CodeOffset,
                }
            }
            Inst::JmpHost { offset } => {
                off = (next as i64 + i64::from(offset)) as usize;
                continue;
            }
            Inst::CtxSetPcImm { pc } => gpr.pc = pc,
            Inst::CtxSetPcReg { rs } => gpr.pc = gpr.reg(rs),
            Inst::CtxSelectPc {
                cond,
                taken,
                fallthrough,
            } => gpr.pc = if cond.eval(gpr.flags) { taken } else { fallthrough },
            Inst::CtxPushImm { value } => {
                if let Err(e) = push(gpr, mem, value) {
                    return BlockExit::Fault(e.into());
                }
            }
            Inst::CtxPopPc => match pop(gpr, mem) {
                Ok(value) => gpr.pc = value,
                Err(e) => return BlockExit::Fault(e.into()),
            },
            Inst::MovAbs { rd, value } => gpr.set_reg(rd, value),
            Inst::Brk => {
                return BlockExit::Fault(Fault::Breakpoint {
                    offset: off as u32,
                })
            }
            ref inst if inst.modifies_pc() || inst.pc_dependent() => {
                return BlockExit::Fault(Fault::Unpatched {
                    offset: off as u32,
                })
            }
            ref inst => {
                if let Err(e) = exec_data(inst, &mut ext, gpr, fpr, mem) {
                    return BlockExit::Fault(e.into());
                }
            }
        }
        off = next;
    }
}

/// Execute raw guest code from the current PC until it reaches `stop` or
/// traps.
pub fn run_native(
    gpr: &mut GprState,
    fpr: &mut FprState,
    mem: &mut dyn Memory,
    stop: u64,
) -> NativeExit {
    let mut ext: Option<u32> = None;
    loop {
        let pc = gpr.pc;
        if pc == stop {
            return NativeExit::Reached;
        }
        let window = match mem.read_code(pc, MAX_GUEST_INST_LEN) {
            Ok(w) => w,
            Err(e) => {
                return NativeExit::Fault {
                    address: pc,
                    fault: e.into(),
                }
            }
        };
        let di = match decode(&window, pc) {
            Ok(di) => di,
            Err(e) => {
                return NativeExit::Fault {
                    address: pc,
                    fault: e.into(),
                }
            }
        };
        if di.inst.host_only() {
            return NativeExit::Fault {
                address: pc,
                fault: Fault::HostOnly { address: pc },
            };
        }
        let next = di.next_address();
        let step = match di.inst {
            Inst::Brk => return NativeExit::Breakpoint { address: pc },
            Inst::Jmp { offset } => Some(next.wrapping_add(offset as i64 as u64)),
            Inst::JmpReg { rs } => Some(gpr.reg(rs)),
            Inst::Jcc { cond, offset } => Some(if cond.eval(gpr.flags) {
                next.wrapping_add(offset as i64 as u64)
            } else {
                next
            }),
            Inst::Call { offset } => {
                if let Err(e) = push(gpr, mem, next) {
                    return NativeExit::Fault {
                        address: pc,
                        fault: e.into(),
                    };
                }
                Some(next.wrapping_add(offset as i64 as u64))
            }
            Inst::CallReg { rs } => {
                let target = gpr.reg(rs);
                if let Err(e) = push(gpr, mem, next) {
                    return NativeExit::Fault {
                        address: pc,
                        fault: e.into(),
                    };
                }
                Some(target)
            }
            Inst::Ret => match pop(gpr, mem) {
                Ok(value) => Some(value),
                Err(e) => {
                    return NativeExit::Fault {
                        address: pc,
                        fault: e.into(),
                    }
                }
            },
            Inst::Lea { rd, offset } => {
                gpr.set_reg(rd, next.wrapping_add(offset as i64 as u64));
                None
            }
            ref inst => {
                if let Err(e) = exec_data(inst, &mut ext, gpr, fpr, mem) {
                    return NativeExit::Fault {
                        address: pc,
                        fault: e.into(),
                    };
                }
                None
            }
        };
        gpr.pc = step.unwrap_or(next);
    }
}
