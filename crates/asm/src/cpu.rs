//! The CPU backend seam.
//!
//! Everything the engine asks of an architecture goes through [`Cpu`]:
//! decoding one guest instruction, emitting one host instruction into a code
//! stream, pretty-printing, and the two execution entry points (translated
//! host code and raw guest code). Backends register in a process-wide table
//! initialized once, on first lookup.

use crate::disasm;
use crate::inst::{self, DecodedInst, DecodeError, Inst};
use crate::interp::{self, BlockExit, NativeExit, MAX_GUEST_INST_LEN};
use crate::memory::Memory;
use crate::sink::{CodeOffset, CodeSink};
use crate::state::{FprState, GprState};
use std::sync::{Arc, OnceLock};

pub trait Cpu: Send + Sync {
    /// Name of the backend, e.g. `"g64"`.
    fn name(&self) -> &'static str;

    /// Longest encoded guest instruction; the window size for code reads.
    fn max_inst_len(&self) -> usize;

    /// Decode one guest instruction at the start of `code`.
    fn decode(&self, code: &[u8], address: u64) -> Result<DecodedInst, DecodeError>;

    /// Emit one host instruction into a code stream.
    fn write_instruction(&self, inst: &Inst, sink: &mut dyn CodeSink);

    /// Pretty-print a decoded instruction.
    fn disassemble(&self, di: &DecodedInst) -> String;

    /// Run translated host code from `entry` until an epilogue, a yield
    /// point or a fault.
    fn run_block(
        &self,
        gpr: &mut GprState,
        fpr: &mut FprState,
        memory: &mut dyn Memory,
        code: &[u8],
        entry: CodeOffset,
    ) -> BlockExit;

    /// Run raw guest code from the current PC until it reaches `stop` or
    /// traps.
    fn run_native(
        &self,
        gpr: &mut GprState,
        fpr: &mut FprState,
        memory: &mut dyn Memory,
        stop: u64,
    ) -> NativeExit;
}

/// The reference g64 backend.
#[derive(Debug, Default)]
pub struct G64Cpu;

impl Cpu for G64Cpu {
    fn name(&self) -> &'static str {
        "g64"
    }

    fn max_inst_len(&self) -> usize {
        MAX_GUEST_INST_LEN
    }

    fn decode(&self, code: &[u8], address: u64) -> Result<DecodedInst, DecodeError> {
        inst::decode(code, address)
    }

    fn write_instruction(&self, inst: &Inst, sink: &mut dyn CodeSink) {
        inst.encode(sink);
    }

    fn disassemble(&self, di: &DecodedInst) -> String {
        disasm::disassemble(di)
    }

    fn run_block(
        &self,
        gpr: &mut GprState,
        fpr: &mut FprState,
        memory: &mut dyn Memory,
        code: &[u8],
        entry: CodeOffset,
    ) -> BlockExit {
        interp::run_block(gpr, fpr, memory, code, entry)
    }

    fn run_native(
        &self,
        gpr: &mut GprState,
        fpr: &mut FprState,
        memory: &mut dyn Memory,
        stop: u64,
    ) -> NativeExit {
        interp::run_native(gpr, fpr, memory, stop)
    }
}

fn registry() -> &'static Vec<(&'static str, Arc<dyn Cpu>)> {
    static REGISTRY: OnceLock<Vec<(&'static str, Arc<dyn Cpu>)>> = OnceLock::new();
    REGISTRY.get_or_init(|| vec![("g64", Arc::new(G64Cpu) as Arc<dyn Cpu>)])
}

/// Name of the host CPU, used when a configuration leaves the CPU empty.
pub fn host_cpu_name() -> String {
    target_lexicon::HOST.architecture.to_string()
}

/// Look up a backend by name. Unknown names resolve to the reference
/// backend so that host-discovered names stay usable.
pub fn lookup(name: &str) -> Arc<dyn Cpu> {
    let reg = registry();
    if let Some((_, cpu)) = reg.iter().find(|(n, _)| *n == name) {
        return cpu.clone();
    }
    log::debug!("no backend registered for cpu {name:?}, using {}", reg[0].0);
    reg[0].1.clone()
}
