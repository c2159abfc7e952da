//! Relocatable host instructions.
//!
//! A patch is an ordered sequence of these. Most entries are plain host
//! instructions; the rest either resolve against the owning ExecBlock when
//! written (`EpilogueJump`), carry an instrumentation callback into the
//! block's callback table (`EventCall`), or emit no bytes at all and only
//! leave an entry in the block's tag registry (the markers).

use crate::events::{InstCallback, InstPosition};
use graft_asm::Inst;

/// Tag registry value for a `PatchBegin` marker.
pub const TAG_PATCH_BEGIN: u16 = 0x1;
/// Tag registry value for a `PatchEnd` marker.
pub const TAG_PATCH_END: u16 = 0x2;

#[derive(Clone)]
pub enum RelocatableInst {
    /// A host instruction emitted as-is.
    Inst(Inst),
    /// A host-relative jump to the block epilogue; the offset is only known
    /// once the owning block is.
    EpilogueJump,
    /// A yield point: registers the callback in the owning block and emits
    /// the `yield` carrying its table index.
    EventCall {
        callback: InstCallback,
        position: InstPosition,
    },
    /// Marker: start of the untouched translation of a guest instruction.
    PatchBegin { address: u64 },
    /// Marker: end of the untouched translation of a guest instruction.
    PatchEnd { address: u64 },
}

impl RelocatableInst {
    /// Whether the entry emits no bytes and only feeds the tag registry.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::PatchBegin { .. } | Self::PatchEnd { .. })
    }

    /// Tag registry value for marker entries.
    pub fn tag(&self) -> Option<u16> {
        match self {
            Self::PatchBegin { .. } => Some(TAG_PATCH_BEGIN),
            Self::PatchEnd { .. } => Some(TAG_PATCH_END),
            _ => None,
        }
    }

    /// Host bytes the entry will emit.
    pub fn encoded_len(&self) -> u32 {
        match self {
            Self::Inst(inst) => u32::from(inst.encoded_len()),
            Self::EpilogueJump => u32::from(Inst::JmpHost { offset: 0 }.encoded_len()),
            Self::EventCall { .. } => u32::from(Inst::Yield { index: 0 }.encoded_len()),
            Self::PatchBegin { .. } | Self::PatchEnd { .. } => 0,
        }
    }
}

impl std::fmt::Debug for RelocatableInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inst(inst) => write!(f, "Inst({inst:?})"),
            Self::EpilogueJump => write!(f, "EpilogueJump"),
            Self::EventCall { position, .. } => write!(f, "EventCall({position:?})"),
            Self::PatchBegin { address } => write!(f, "PatchBegin({address:#x})"),
            Self::PatchEnd { address } => write!(f, "PatchEnd({address:#x})"),
        }
    }
}
