//! The host-code replacement for one guest instruction.

pub mod instr;
pub mod reloc;
pub mod rules;

use graft_asm::DecodedInst;
use smallvec::SmallVec;

pub use instr::{InstrRule, InstrRuleUser, PRIORITY_DEFAULT};
pub use reloc::RelocatableInst;
pub use rules::{default_patch_rules, PatchRule};

/// Metadata describing the guest instruction a patch replaces.
#[derive(Clone, Debug)]
pub struct InstMetadata {
    /// Guest address of the (possibly prefix-merged) instruction.
    pub address: u64,
    /// Guest bytes covered, prefixes included.
    pub inst_size: u16,
    /// The decoded instruction; for merged patches, the final unit.
    pub decoded: DecodedInst,
    /// Host bytes the patch currently emits.
    pub patch_size: u32,
    /// The patch ends its basic block.
    pub modify_pc: bool,
    /// The patch is incomplete until fused with the next one.
    pub merge: bool,
    /// The patch touches floating-point state.
    pub uses_fpr: bool,
}

/// One guest instruction's worth of host instructions, plus metadata.
///
/// Produced by a patch rule, optionally extended by instrumentation rules,
/// consumed by `ExecBlock::write_patch`, then discarded.
#[derive(Clone)]
pub struct Patch {
    pub metadata: InstMetadata,
    pub insts: SmallVec<[RelocatableInst; 8]>,
}

impl Patch {
    pub fn new(
        decoded: DecodedInst,
        insts: impl IntoIterator<Item = RelocatableInst>,
        modify_pc: bool,
        merge: bool,
    ) -> Self {
        let uses_fpr = decoded.inst.uses_fpr();
        let mut patch = Patch {
            metadata: InstMetadata {
                address: decoded.address,
                inst_size: u16::from(decoded.size),
                decoded,
                patch_size: 0,
                modify_pc,
                merge,
                uses_fpr,
            },
            insts: SmallVec::new(),
        };
        patch.append(insts);
        patch
    }

    /// Fuse a pending `merge` patch with the patch generated for the next
    /// decoded unit: the previous host instructions come first and the
    /// merged patch covers both guest ranges.
    pub fn fuse(prev: Patch, mut next: Patch) -> Self {
        debug_assert!(prev.metadata.merge, "fusing a completed patch");
        let mut insts = prev.insts;
        insts.extend(next.insts.drain(..));
        Patch {
            metadata: InstMetadata {
                address: prev.metadata.address,
                inst_size: prev.metadata.inst_size + next.metadata.inst_size,
                decoded: next.metadata.decoded,
                patch_size: prev.metadata.patch_size + next.metadata.patch_size,
                modify_pc: next.metadata.modify_pc,
                merge: next.metadata.merge,
                uses_fpr: prev.metadata.uses_fpr || next.metadata.uses_fpr,
            },
            insts,
        }
    }

    /// Guest address just past the instruction.
    pub fn end_address(&self) -> u64 {
        self.metadata.address + u64::from(self.metadata.inst_size)
    }

    /// Insert host instructions ahead of everything already in the patch.
    pub fn prepend(&mut self, insts: impl IntoIterator<Item = RelocatableInst>) {
        let mut new: SmallVec<[RelocatableInst; 8]> = insts.into_iter().collect();
        for inst in &new {
            self.metadata.patch_size += inst.encoded_len();
        }
        new.extend(self.insts.drain(..));
        self.insts = new;
    }

    /// Add host instructions after everything already in the patch.
    pub fn append(&mut self, insts: impl IntoIterator<Item = RelocatableInst>) {
        for inst in insts {
            self.metadata.patch_size += inst.encoded_len();
            self.insts.push(inst);
        }
    }

    /// Wrap the current content in boundary markers. Called once by the
    /// patcher when the patch is complete; instrumentation inserted later
    /// lands outside the markers, so the tag registry always delimits the
    /// untouched translation of the guest instruction.
    pub fn finalize(&mut self) {
        let begin = RelocatableInst::PatchBegin {
            address: self.metadata.address,
        };
        let end = RelocatableInst::PatchEnd {
            address: self.end_address(),
        };
        self.prepend([begin]);
        self.append([end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_asm::{Gpr, Inst};

    fn decoded(inst: Inst, address: u64) -> DecodedInst {
        let size = inst.encoded_len();
        DecodedInst {
            inst,
            address,
            size,
        }
    }

    #[test]
    fn patch_size_tracks_edits() {
        let di = decoded(Inst::Nop, 0x1000);
        let mut patch = Patch::new(di.clone(), [RelocatableInst::Inst(di.inst)], false, false);
        assert_eq!(patch.metadata.patch_size, 1);
        patch.prepend([RelocatableInst::Inst(Inst::CtxSetPcImm { pc: 0x1000 })]);
        assert_eq!(patch.metadata.patch_size, 10);
        patch.finalize();
        // Markers emit no bytes.
        assert_eq!(patch.metadata.patch_size, 10);
    }

    #[test]
    fn fuse_accumulates_guest_range() {
        let ext = decoded(Inst::Ext { imm: 0x1 }, 0x1000);
        let mov = decoded(
            Inst::MovImm {
                rd: Gpr::new(0),
                imm: 2,
            },
            0x1005,
        );
        let prev = Patch::new(ext.clone(), [RelocatableInst::Inst(ext.inst)], false, true);
        let next = Patch::new(mov.clone(), [RelocatableInst::Inst(mov.inst)], false, false);
        let fused = Patch::fuse(prev, next);
        assert_eq!(fused.metadata.address, 0x1000);
        assert_eq!(fused.metadata.inst_size, 11);
        assert_eq!(fused.end_address(), 0x100B);
        assert!(!fused.metadata.merge);
        assert_eq!(fused.insts.len(), 2);
    }
}
