//! Machine-code support for the graft instrumentation engine.
//!
//! This crate is the engine's view of an architecture: it decodes guest
//! instructions, encodes host instructions into code streams, pretty-prints,
//! and executes both translated host code sitting in a code cache and raw
//! guest code when execution is brokered out of instrumentation.
//!
//! The bundled reference backend implements **g64**, a 64-bit little-endian
//! register machine with a variable-length encoding. Its host instruction
//! set is the guest set plus a handful of pseudo-operations translated code
//! uses to talk to the engine context (`ctx.setpc`, `yield`, `stop`, …).

pub mod asm;
pub mod cpu;
pub mod disasm;
pub mod inst;
pub mod interp;
pub mod memory;
pub mod regs;
pub mod sink;
pub mod state;

pub use cpu::{host_cpu_name, lookup, Cpu};
pub use inst::{Cond, DecodedInst, DecodeError, Inst};
pub use interp::{BlockExit, Fault, NativeExit, MAX_GUEST_INST_LEN};
pub use memory::{FlatMemory, Memory, MemoryError, MemoryMap, Permission};
pub use regs::{Fpr, Gpr, NUM_FPR, NUM_GPR, REG_SP};
pub use sink::{CodeOffset, CodeSink};
pub use state::{FprState, GprState};
