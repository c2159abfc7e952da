//! Patch rules: how each guest instruction is rewritten for the cache.
//!
//! Rules are scanned in order and the first match wins; ordering is the
//! mechanism by which special cases override the verbatim fallback. Every
//! rule's `generate` accepts the pending predecessor patch so prefix merges
//! fuse no matter which rule completes them.

use super::{Patch, RelocatableInst};
use graft_asm::{DecodedInst, Inst};

pub trait PatchRule {
    /// Whether this rule rewrites `di`.
    fn can_be_applied(&self, di: &DecodedInst) -> bool;

    /// Produce the patch for `di`, fusing with `prev` when the previous
    /// patch was left pending with `merge`.
    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch;
}

fn complete(di: &DecodedInst, insts: Vec<RelocatableInst>, modify_pc: bool, merge: bool, prev: Option<Patch>) -> Patch {
    let patch = Patch::new(di.clone(), insts, modify_pc, merge);
    match prev {
        Some(prev) => Patch::fuse(prev, patch),
        None => patch,
    }
}

/// `Ext` immediate prefixes are not complete instructions; their patch stays
/// pending until the next unit fuses with it.
struct ExtPrefix;

impl PatchRule for ExtPrefix {
    fn can_be_applied(&self, di: &DecodedInst) -> bool {
        matches!(di.inst, Inst::Ext { .. })
    }

    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch {
        complete(
            di,
            vec![RelocatableInst::Inst(di.inst.clone())],
            false,
            true,
            prev,
        )
    }
}

/// Direct branches: the target is an immediate, so the rewrite materializes
/// the next guest PC into the context and lets the epilogue take over.
struct DirectBranch;

impl PatchRule for DirectBranch {
    fn can_be_applied(&self, di: &DecodedInst) -> bool {
        matches!(
            di.inst,
            Inst::Jmp { .. } | Inst::Jcc { .. } | Inst::Call { .. }
        )
    }

    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch {
        let next = di.next_address();
        let insts = match di.inst {
            Inst::Jmp { offset } => vec![RelocatableInst::Inst(Inst::CtxSetPcImm {
                pc: next.wrapping_add(offset as i64 as u64),
            })],
            Inst::Jcc { cond, offset } => vec![RelocatableInst::Inst(Inst::CtxSelectPc {
                cond,
                taken: next.wrapping_add(offset as i64 as u64),
                fallthrough: next,
            })],
            Inst::Call { offset } => vec![
                RelocatableInst::Inst(Inst::CtxPushImm { value: next }),
                RelocatableInst::Inst(Inst::CtxSetPcImm {
                    pc: next.wrapping_add(offset as i64 as u64),
                }),
            ],
            _ => unreachable!(),
        };
        complete(di, insts, true, false, prev)
    }
}

/// Indirect branches and returns: the target comes from a register or the
/// guest stack.
struct IndirectBranch;

impl PatchRule for IndirectBranch {
    fn can_be_applied(&self, di: &DecodedInst) -> bool {
        matches!(
            di.inst,
            Inst::JmpReg { .. } | Inst::CallReg { .. } | Inst::Ret
        )
    }

    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch {
        let next = di.next_address();
        let insts = match di.inst {
            Inst::JmpReg { rs } => vec![RelocatableInst::Inst(Inst::CtxSetPcReg { rs })],
            Inst::CallReg { rs } => vec![
                // The push must come second on the off chance that `rs` is
                // the stack pointer itself.
                RelocatableInst::Inst(Inst::CtxSetPcReg { rs }),
                RelocatableInst::Inst(Inst::CtxPushImm { value: next }),
            ],
            Inst::Ret => vec![RelocatableInst::Inst(Inst::CtxPopPc)],
            _ => unreachable!(),
        };
        complete(di, insts, true, false, prev)
    }
}

/// PC reads that don't branch: recompute the address the original would
/// have produced, since the translated copy runs elsewhere.
struct PcRead;

impl PatchRule for PcRead {
    fn can_be_applied(&self, di: &DecodedInst) -> bool {
        matches!(di.inst, Inst::Lea { .. })
    }

    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch {
        let next = di.next_address();
        let insts = match di.inst {
            Inst::Lea { rd, offset } => vec![RelocatableInst::Inst(Inst::MovAbs {
                rd,
                value: next.wrapping_add(offset as i64 as u64),
            })],
            _ => unreachable!(),
        };
        complete(di, insts, false, false, prev)
    }
}

/// Position-independent instructions are copied verbatim.
struct Verbatim;

impl PatchRule for Verbatim {
    fn can_be_applied(&self, di: &DecodedInst) -> bool {
        !di.inst.modifies_pc() && !di.inst.pc_dependent()
    }

    fn generate(&self, di: &DecodedInst, prev: Option<Patch>) -> Patch {
        complete(
            di,
            vec![RelocatableInst::Inst(di.inst.clone())],
            false,
            false,
            prev,
        )
    }
}

/// The rule set for the reference architecture, most specific first.
pub fn default_patch_rules() -> Vec<Box<dyn PatchRule>> {
    vec![
        Box::new(ExtPrefix),
        Box::new(DirectBranch),
        Box::new(IndirectBranch),
        Box::new(PcRead),
        Box::new(Verbatim),
    ]
}
