//! Instrumentation rules.
//!
//! Rules are stored sorted by ascending priority and offered every patch of
//! every translated sequence; each may extend the patch with extra host
//! instructions and yield points.

use super::{Patch, RelocatableInst};
use crate::events::{InstCallback, InstPosition};
use crate::rangeset::{Range, RangeSet};
use crate::state::VmInstanceRef;
use graft_asm::Inst;

/// Priority of rules with no stated ordering preference.
pub const PRIORITY_DEFAULT: i32 = 0;

pub trait InstrRule {
    /// Sort key: lower priorities instrument first, so their host code runs
    /// closest to the original instruction.
    fn priority(&self) -> i32 {
        PRIORITY_DEFAULT
    }

    /// Guest addresses whose cached translations this rule affects;
    /// registration and removal invalidate the cache over it.
    fn affected_range(&self) -> RangeSet;

    /// Inspect `patch` and optionally extend it. Returns whether anything
    /// was added.
    fn try_instrument(&self, patch: &mut Patch) -> bool;

    /// Clone for engine copy-configuration.
    fn clone_rule(&self) -> Box<dyn InstrRule>;

    /// Propagation hook for [`VmInstanceRef`] changes; rules that embed the
    /// handle override this.
    fn change_vm_instance_ref(&mut self, _new: VmInstanceRef) {}
}

/// The standard embedder rule: call back on every instruction inside an
/// address range, before or after it executes.
#[derive(Clone)]
pub struct InstrRuleUser {
    range: Range,
    position: InstPosition,
    priority: i32,
    callback: InstCallback,
}

impl InstrRuleUser {
    pub fn new(range: Range, position: InstPosition, callback: InstCallback) -> Self {
        Self {
            range,
            position,
            priority: PRIORITY_DEFAULT,
            callback,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl InstrRule for InstrRuleUser {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn affected_range(&self) -> RangeSet {
        let mut set = RangeSet::new();
        set.add(self.range);
        set
    }

    fn try_instrument(&self, patch: &mut Patch) -> bool {
        if !self.range.contains(patch.metadata.address) {
            return false;
        }
        let call = RelocatableInst::EventCall {
            callback: self.callback.clone(),
            position: self.position,
        };
        match self.position {
            // The pre-instruction convention is PC == instruction address.
            InstPosition::PreInst => patch.prepend([
                RelocatableInst::Inst(Inst::CtxSetPcImm {
                    pc: patch.metadata.address,
                }),
                call,
            ]),
            InstPosition::PostInst => {
                if patch.metadata.modify_pc {
                    // The patch body already wrote the next PC.
                    patch.append([call]);
                } else {
                    let next = patch.end_address();
                    patch.append([
                        RelocatableInst::Inst(Inst::CtxSetPcImm { pc: next }),
                        call,
                    ]);
                }
            }
        }
        true
    }

    fn clone_rule(&self) -> Box<dyn InstrRule> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VmAction;
    use graft_asm::DecodedInst;
    use std::rc::Rc;

    fn nop_patch(address: u64) -> Patch {
        let inst = Inst::Nop;
        let size = inst.encoded_len();
        Patch::new(
            DecodedInst {
                inst: inst.clone(),
                address,
                size,
            },
            [RelocatableInst::Inst(inst)],
            false,
            false,
        )
    }

    fn rule(range: Range, position: InstPosition) -> InstrRuleUser {
        InstrRuleUser::new(range, position, Rc::new(|_vm| VmAction::Continue))
    }

    #[test]
    fn out_of_range_patch_is_untouched() {
        let r = rule(Range::new(0x2000, 0x3000), InstPosition::PreInst);
        let mut patch = nop_patch(0x1000);
        assert!(!r.try_instrument(&mut patch));
        assert_eq!(patch.insts.len(), 1);
    }

    #[test]
    fn preinst_sets_pc_to_instruction_address() {
        let r = rule(Range::new(0x1000, 0x2000), InstPosition::PreInst);
        let mut patch = nop_patch(0x1000);
        assert!(r.try_instrument(&mut patch));
        match &patch.insts[0] {
            RelocatableInst::Inst(Inst::CtxSetPcImm { pc }) => assert_eq!(*pc, 0x1000),
            other => panic!("unexpected inst {other:?}"),
        }
        assert!(matches!(
            patch.insts[1],
            RelocatableInst::EventCall {
                position: InstPosition::PreInst,
                ..
            }
        ));
    }

    #[test]
    fn postinst_sets_pc_past_instruction() {
        let r = rule(Range::new(0x1000, 0x2000), InstPosition::PostInst);
        let mut patch = nop_patch(0x1000);
        assert!(r.try_instrument(&mut patch));
        match &patch.insts[1] {
            RelocatableInst::Inst(Inst::CtxSetPcImm { pc }) => assert_eq!(*pc, 0x1001),
            other => panic!("unexpected inst {other:?}"),
        }
    }
}
