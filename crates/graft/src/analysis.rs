//! Instruction analysis for embedders.

use bitflags::bitflags;
use graft_asm::{Cpu, DecodedInst, Gpr};

bitflags! {
    /// What [`InstAnalysis`] should be filled with.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AnalysisType: u32 {
        /// Address, size and control-flow classification.
        const INSTRUCTION = 1 << 0;
        /// Textual disassembly.
        const DISASSEMBLY = 1 << 1;
        /// Register operands with their access kinds.
        const OPERANDS = 1 << 2;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RegisterAccessType: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandAnalysis {
    pub reg: Gpr,
    pub access: RegisterAccessType,
}

/// Analysis of one cached instruction.
#[derive(Clone, Debug)]
pub struct InstAnalysis {
    pub address: u64,
    /// Guest bytes covered, merged prefixes included.
    pub inst_size: u16,
    pub mnemonic: &'static str,
    pub affect_control_flow: bool,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub may_load: bool,
    pub may_store: bool,
    /// Present when [`AnalysisType::DISASSEMBLY`] was requested.
    pub disassembly: Option<String>,
    /// Present when [`AnalysisType::OPERANDS`] was requested.
    pub operands: Vec<OperandAnalysis>,
}

pub(crate) fn analyze(
    decoded: &DecodedInst,
    inst_size: u16,
    ty: AnalysisType,
    cpu: &dyn Cpu,
) -> InstAnalysis {
    let inst = &decoded.inst;
    let disassembly = ty
        .contains(AnalysisType::DISASSEMBLY)
        .then(|| cpu.disassemble(decoded));
    let operands = if ty.contains(AnalysisType::OPERANDS) {
        let mut operands: Vec<OperandAnalysis> = Vec::new();
        for reg in inst.reg_reads() {
            operands.push(OperandAnalysis {
                reg,
                access: RegisterAccessType::READ,
            });
        }
        for reg in inst.reg_writes() {
            match operands.iter_mut().find(|o| o.reg == reg) {
                Some(op) => op.access |= RegisterAccessType::WRITE,
                None => operands.push(OperandAnalysis {
                    reg,
                    access: RegisterAccessType::WRITE,
                }),
            }
        }
        operands
    } else {
        Vec::new()
    };
    InstAnalysis {
        address: decoded.address,
        inst_size,
        mnemonic: inst.mnemonic(),
        affect_control_flow: inst.modifies_pc(),
        is_branch: inst.is_branch(),
        is_call: inst.is_call(),
        is_return: inst.is_return(),
        may_load: inst.may_load(),
        may_store: inst.may_store(),
        disassembly,
        operands,
    }
}
