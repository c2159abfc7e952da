//! Execution context embedded in every ExecBlock.

use bitflags::bitflags;
use graft_asm::{CodeOffset, FprState, GprState};

bitflags! {
    /// Per-sequence execution flags, stored in the sequence registry and
    /// loaded into the host state before the trampoline dispatches.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ExecuteFlags: u64 {
        /// The sequence touches floating-point state; the trampoline must
        /// synchronize FPR state around it.
        const NEEDS_FPR = 1 << 0;
    }
}

/// Host-side dispatch state: where the trampoline enters the code block and
/// under which flags.
#[derive(Clone, Debug, Default)]
pub struct HostState {
    /// Host code offset the trampoline jumps to; maintained by
    /// `ExecBlock::select_seq` and updated at every yield point.
    pub selector: CodeOffset,
    pub execute_flags: ExecuteFlags,
}

/// The register context a translated sequence runs against. While a block
/// executes, its context is the authoritative guest state; the engine syncs
/// it with its shadow copies at run-loop boundaries.
#[derive(Clone, Debug, Default)]
pub struct Context {
    pub gpr: GprState,
    pub fpr: FprState,
    pub host: HostState,
}

/// Opaque embedder handle propagated to every component that outlives a
/// `Vm` reconfiguration. The engine never dereferences it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VmInstanceRef(pub u64);
