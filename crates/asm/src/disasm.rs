//! Pretty-printing of decoded instructions.

use crate::inst::{DecodedInst, Inst};

/// Render one decoded instruction, resolving PC-relative operands against
/// the instruction's own address.
pub fn disassemble(di: &DecodedInst) -> String {
    let next = di.next_address();
    let rel = |offset: i32| next.wrapping_add(offset as i64 as u64);
    match di.inst {
        Inst::Nop => "nop".to_string(),
        Inst::MovImm { rd, imm } => format!("mov {rd}, {imm:#x}"),
        Inst::MovReg { rd, rs } => format!("mov {rd}, {rs}"),
        Inst::Add { rd, rs } => format!("add {rd}, {rs}"),
        Inst::Sub { rd, rs } => format!("sub {rd}, {rs}"),
        Inst::AddImm { rd, imm } => format!("add {rd}, {imm:#x}"),
        Inst::Cmp { ra, rb } => format!("cmp {ra}, {rb}"),
        Inst::Load { rd, base, offset } => format!("ld {rd}, [{base}{offset:+#x}]"),
        Inst::Store { base, src, offset } => format!("st [{base}{offset:+#x}], {src}"),
        Inst::Push { rs } => format!("push {rs}"),
        Inst::Pop { rd } => format!("pop {rd}"),
        Inst::Lea { rd, offset } => format!("lea {rd}, {:#x}", rel(offset)),
        Inst::FMovImm { fd, imm } => format!("fmov {fd}, {imm}"),
        Inst::FAdd { fd, fs } => format!("fadd {fd}, {fs}"),
        Inst::Jmp { offset } => format!("jmp {:#x}", rel(offset)),
        Inst::JmpReg { rs } => format!("jmp {rs}"),
        Inst::Jcc { cond, offset } => format!("j{:?} {:#x}", cond, rel(offset)).to_lowercase(),
        Inst::Call { offset } => format!("call {:#x}", rel(offset)),
        Inst::CallReg { rs } => format!("call {rs}"),
        Inst::Ret => "ret".to_string(),
        Inst::Brk => "brk".to_string(),
        Inst::Ext { imm } => format!("ext {imm:#x}"),
        Inst::CtxSetPcImm { pc } => format!("ctx.setpc {pc:#x}"),
        Inst::CtxSetPcReg { rs } => format!("ctx.setpc {rs}"),
        Inst::CtxSelectPc {
            cond,
            taken,
            fallthrough,
        } => format!("ctx.selpc.{cond:?} {taken:#x}, {fallthrough:#x}").to_lowercase(),
        Inst::CtxPushImm { value } => format!("ctx.push {value:#x}"),
        Inst::CtxPopPc => "ctx.poppc".to_string(),
        Inst::Yield { index } => format!("yield {index}"),
        Inst::JmpHost { offset } => format!("jmp.host {offset:+}"),
        Inst::Stop => "stop".to_string(),
        Inst::MovAbs { rd, value } => format!("mov.abs {rd}, {value:#x}"),
    }
}
