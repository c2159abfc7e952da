//! graft: a dynamic binary instrumentation engine.
//!
//! graft executes a guest program one basic block at a time. Instead of
//! letting the CPU run the original instructions, it translates each block
//! into an instrumented copy inside a private code cache and runs that,
//! delivering events at sequence, basic-block and execution-transfer
//! boundaries. User callbacks can read and mutate guest registers, register
//! further instrumentation mid-run and decide whether execution continues,
//! re-enters the dispatcher or stops.
//!
//! The instruction-level mechanics (decoding, host-code emission and the
//! reference CPU backend) live in the companion [`graft_asm`] crate.
//!
//! # Example
//!
//! ```no_run
//! use graft::{Config, Vm, VmAction, VmEvent};
//! use graft_asm::{asm::Assembler, FlatMemory, Gpr, Memory, Permission};
//! use std::rc::Rc;
//!
//! let mut a = Assembler::new(0x1000);
//! a.mov_imm(Gpr::new(0), 42);
//! a.ret();
//!
//! let mut memory = FlatMemory::new();
//! memory.map_image("app", 0x1000, &a.finish(), Permission::READ | Permission::EXEC);
//! memory.map_region("[stack]", 0x7000, 0x1000, Permission::READ | Permission::WRITE);
//!
//! let mut vm = Vm::new(&Config::new(), Box::new(memory));
//! vm.add_instrumented_range(0x1000, 0x1010);
//! vm.add_vm_event_cb(
//!     VmEvent::BASIC_BLOCK_ENTRY,
//!     Rc::new(|vm, state| {
//!         println!("entering block {:#x}", state.basic_block_start);
//!         let _ = vm;
//!         VmAction::Continue
//!     }),
//! )
//! .unwrap();
//!
//! let mut gpr = vm.gpr_state().clone();
//! gpr.set_sp(0x7800);
//! vm.memory_mut().write_u64(0x7800, 0xDEAD).unwrap();
//! vm.set_gpr_state(&gpr);
//! assert!(vm.run(0x1000, 0xDEAD));
//! ```

pub mod analysis;
pub mod config;
pub mod errors;
pub mod events;
pub mod execblock;
pub mod execbroker;
pub mod patch;
pub mod rangeset;
pub mod state;
pub mod vm;

pub use analysis::{AnalysisType, InstAnalysis, OperandAnalysis, RegisterAccessType};
pub use config::Config;
pub use errors::VmError;
pub use events::{
    CallbackRegistration, InstCallback, InstPosition, VmAction, VmCallback, VmEvent, VmState,
    EVENTID_VM_MASK,
};
pub use execblock::manager::SeqLoc;
pub use patch::{InstrRule, InstrRuleUser, Patch, PatchRule, RelocatableInst};
pub use rangeset::{Range, RangeSet};
pub use state::{Context, ExecuteFlags, HostState, VmInstanceRef};
pub use vm::Vm;
