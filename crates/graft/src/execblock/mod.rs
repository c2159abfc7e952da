//! ExecBlock: one executable region of the code cache.
//!
//! A block holds the translated host code of one or more sequences together
//! with the context they run against and the registries mapping guest
//! instructions to host offsets. The epilogue sits at the end of the buffer;
//! every sequence ends with a host-relative jump to it.

pub mod manager;
mod memory;

use crate::events::{InstCallback, InstPosition};
use crate::patch::{Patch, RelocatableInst};
use crate::state::{Context, ExecuteFlags, VmInstanceRef};
use graft_asm::{BlockExit, CodeOffset, CodeSink, Cpu, Inst, Memory};
use memory::CodeBlock;

/// Space kept free ahead of the epilogue so a sequence terminator always
/// fits after the last patch that was allowed to start.
pub const MINIMAL_BLOCK_SIZE: u32 = 64;

const EPILOGUE_SIZE: u32 = 1;

/// One translated sequence inside a block.
#[derive(Clone, Copy, Debug)]
pub struct SeqEntry {
    pub start_inst_id: u16,
    pub end_inst_id: u16,
    pub execute_flags: ExecuteFlags,
}

/// One translated guest instruction inside a block.
#[derive(Clone, Debug)]
pub struct InstEntry {
    pub offset: CodeOffset,
    pub address: u64,
    /// Guest bytes covered, merged prefixes included.
    pub inst_size: u16,
    /// Decode result kept for later analysis requests.
    pub decoded: graft_asm::DecodedInst,
}

/// A byte-less marker recorded while writing a patch.
#[derive(Clone, Copy, Debug)]
pub struct TagInfo {
    pub tag: u16,
    pub offset: CodeOffset,
}

/// An instrumentation callback carried into the block by an `EventCall`.
#[derive(Clone)]
pub struct CallbackEntry {
    pub callback: InstCallback,
    pub position: InstPosition,
    pub inst_id: u16,
}

/// Result of writing a sequence into a block.
#[derive(Clone, Copy, Debug)]
pub struct SeqWrite {
    pub seq_id: u16,
    pub patches_written: usize,
}

pub struct ExecBlock {
    code: CodeBlock,
    cursor: CodeOffset,
    epilogue_offset: CodeOffset,
    context: Context,
    seq_registry: Vec<SeqEntry>,
    inst_registry: Vec<InstEntry>,
    tag_registry: Vec<TagInfo>,
    callbacks: Vec<CallbackEntry>,
    is_full: bool,
    current_seq: u16,
    current_inst: u16,
    vm_ref: VmInstanceRef,
}

/// Sink writing into the block buffer at the cursor.
struct BlockSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl CodeSink for BlockSink<'_> {
    fn current_offset(&self) -> CodeOffset {
        self.pos as CodeOffset
    }

    fn put1(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn put2(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    fn put4(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn put8(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }
}

impl ExecBlock {
    pub fn new(size: usize, vm_ref: VmInstanceRef, cpu: &dyn Cpu) -> Self {
        let mut code = CodeBlock::new(size);
        let capacity = code.len() as CodeOffset;
        assert!(capacity > MINIMAL_BLOCK_SIZE + EPILOGUE_SIZE);
        let epilogue_offset = capacity - EPILOGUE_SIZE;
        {
            let mut sink = BlockSink {
                buf: code.as_mut_slice(),
                pos: epilogue_offset as usize,
            };
            cpu.write_instruction(&Inst::Stop, &mut sink);
        }
        Self {
            code,
            cursor: 0,
            epilogue_offset,
            context: Context::default(),
            seq_registry: Vec::new(),
            inst_registry: Vec::new(),
            tag_registry: Vec::new(),
            callbacks: Vec::new(),
            is_full: false,
            current_seq: 0,
            current_inst: 0,
            vm_ref,
        }
    }

    /// Bytes left between the write cursor and the epilogue.
    pub fn epilogue_room(&self) -> u32 {
        self.epilogue_offset - self.cursor
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn vm_ref(&self) -> VmInstanceRef {
        self.vm_ref
    }

    pub fn set_vm_ref(&mut self, vm_ref: VmInstanceRef) {
        self.vm_ref = vm_ref;
    }

    fn emit(&mut self, inst: &Inst, cpu: &dyn Cpu) {
        let mut sink = BlockSink {
            buf: self.code.as_mut_slice(),
            pos: self.cursor as usize,
        };
        cpu.write_instruction(inst, &mut sink);
        self.cursor = sink.current_offset();
    }

    /// Write one patch's host instructions at the cursor.
    ///
    /// Patches are atomic: if space runs out mid-patch the stream, tag
    /// registry and callback table roll back to their pre-patch state, the
    /// block is marked full and the caller re-issues the patch elsewhere.
    pub fn write_patch(&mut self, patch: &Patch, inst_id: u16, cpu: &dyn Cpu) -> bool {
        if self.epilogue_room() <= MINIMAL_BLOCK_SIZE {
            self.is_full = true;
            return false;
        }
        let saved = (self.cursor, self.tag_registry.len(), self.callbacks.len());
        for inst in &patch.insts {
            if let Some(tag) = inst.tag() {
                self.tag_registry.push(TagInfo {
                    tag,
                    offset: self.cursor,
                });
                continue;
            }
            if self.epilogue_room() <= MINIMAL_BLOCK_SIZE {
                log::debug!("not enough space left at offset {:#x}: rollback", self.cursor);
                self.cursor = saved.0;
                self.tag_registry.truncate(saved.1);
                self.callbacks.truncate(saved.2);
                self.is_full = true;
                return false;
            }
            match inst {
                RelocatableInst::Inst(i) => self.emit(i, cpu),
                RelocatableInst::EpilogueJump => {
                    let len = u32::from(Inst::JmpHost { offset: 0 }.encoded_len());
                    let offset = (self.epilogue_offset - (self.cursor + len)) as i32;
                    self.emit(&Inst::JmpHost { offset }, cpu);
                }
                RelocatableInst::EventCall { callback, position } => {
                    let index = self.callbacks.len() as u16;
                    self.callbacks.push(CallbackEntry {
                        callback: callback.clone(),
                        position: *position,
                        inst_id,
                    });
                    self.emit(&Inst::Yield { index }, cpu);
                }
                RelocatableInst::PatchBegin { .. } | RelocatableInst::PatchEnd { .. } => {
                    unreachable!("markers are handled above")
                }
            }
        }
        true
    }

    /// Write as many leading patches as fit, then the sequence terminator.
    ///
    /// A truncated sequence (the basic block continues in another block)
    /// terminates by materializing the continuation address before jumping
    /// to the epilogue.
    pub fn write_sequence(&mut self, patches: &[Patch], cpu: &dyn Cpu) -> Option<SeqWrite> {
        if self.is_full || patches.is_empty() {
            return None;
        }
        if self.code.is_rx() {
            self.code.make_rw();
        }
        let start_inst_id = self.inst_registry.len() as u16;
        let mut written = 0;
        let mut flags = ExecuteFlags::empty();
        for patch in patches {
            let inst_id = self.inst_registry.len() as u16;
            self.inst_registry.push(InstEntry {
                offset: self.cursor,
                address: patch.metadata.address,
                inst_size: patch.metadata.inst_size,
                decoded: patch.metadata.decoded.clone(),
            });
            if !self.write_patch(patch, inst_id, cpu) {
                self.inst_registry.pop();
                break;
            }
            if patch.metadata.uses_fpr {
                flags |= ExecuteFlags::NEEDS_FPR;
            }
            written += 1;
        }
        if written == 0 {
            return None;
        }
        let terminator_room = u32::from(Inst::CtxSetPcImm { pc: 0 }.encoded_len())
            + u32::from(Inst::JmpHost { offset: 0 }.encoded_len());
        assert!(
            self.epilogue_room() >= terminator_room,
            "no room left for the sequence terminator"
        );
        // A sequence cut short of its basic-block terminator (by rollback
        // or by the caller's prefix) must hand the continuation address to
        // the dispatcher itself.
        if !patches[written - 1].metadata.modify_pc {
            let continuation = patches[written - 1].end_address();
            self.emit(&Inst::CtxSetPcImm { pc: continuation }, cpu);
        }
        let len = u32::from(Inst::JmpHost { offset: 0 }.encoded_len());
        let offset = (self.epilogue_offset - (self.cursor + len)) as i32;
        self.emit(&Inst::JmpHost { offset }, cpu);

        let seq_id = self.seq_registry.len() as u16;
        self.seq_registry.push(SeqEntry {
            start_inst_id,
            end_inst_id: (self.inst_registry.len() - 1) as u16,
            execute_flags: flags,
        });
        Some(SeqWrite {
            seq_id,
            patches_written: written,
        })
    }

    /// Register a sequence over already-written code, starting mid-way
    /// through an existing one. Cheap: no bytes move.
    pub fn derive_sequence(&mut self, from_seq: u16, inst_id: u16) -> u16 {
        let base = self.seq_registry[usize::from(from_seq)];
        debug_assert!(base.start_inst_id < inst_id && inst_id <= base.end_inst_id);
        let seq_id = self.seq_registry.len() as u16;
        self.seq_registry.push(SeqEntry {
            start_inst_id: inst_id,
            end_inst_id: base.end_inst_id,
            execute_flags: base.execute_flags,
        });
        seq_id
    }

    /// Program the block so the next [`ExecBlock::run`] starts at `seq_id`.
    pub fn select_seq(&mut self, seq_id: u16) {
        assert!(usize::from(seq_id) < self.seq_registry.len());
        let seq = self.seq_registry[usize::from(seq_id)];
        self.current_seq = seq_id;
        self.current_inst = seq.start_inst_id;
        self.context.host.selector = self.inst_registry[usize::from(seq.start_inst_id)].offset;
        self.context.host.execute_flags = seq.execute_flags;
    }

    /// Run from the selector until the epilogue, a yield point or a fault.
    /// Yield points advance the selector and the current instruction so the
    /// engine can resume after dispatching the callback.
    pub fn run(&mut self, cpu: &dyn Cpu, memory: &mut dyn Memory) -> BlockExit {
        if !self.code.is_rx() {
            self.code.make_rx();
        }
        self.code.invalidate_icache();
        let entry = self.context.host.selector;
        let exit = cpu.run_block(
            &mut self.context.gpr,
            &mut self.context.fpr,
            memory,
            self.code.as_slice(),
            entry,
        );
        if let BlockExit::Event { index, resume } = &exit {
            self.context.host.selector = *resume;
            self.current_inst = self.callbacks[usize::from(*index)].inst_id;
        }
        exit
    }

    pub fn callback(&self, index: u16) -> CallbackEntry {
        self.callbacks[usize::from(index)].clone()
    }

    pub fn seq_count(&self) -> usize {
        self.seq_registry.len()
    }

    pub fn seq_entry(&self, seq_id: u16) -> SeqEntry {
        self.seq_registry[usize::from(seq_id)]
    }

    pub fn current_seq(&self) -> u16 {
        self.current_seq
    }

    pub fn current_inst(&self) -> u16 {
        self.current_inst
    }

    /// Translated-instruction id of a guest address, if this block holds it.
    pub fn inst_id(&self, address: u64) -> Option<u16> {
        self.inst_registry
            .iter()
            .position(|e| e.address == address)
            .map(|i| i as u16)
    }

    pub fn inst_address(&self, inst_id: u16) -> u64 {
        self.inst_registry[usize::from(inst_id)].address
    }

    pub fn inst_offset(&self, inst_id: u16) -> CodeOffset {
        self.inst_registry[usize::from(inst_id)].offset
    }

    pub fn inst_entry(&self, inst_id: u16) -> &InstEntry {
        &self.inst_registry[usize::from(inst_id)]
    }

    /// Map a host code offset back to the guest instruction whose
    /// translation covers it; how embedders translate a faulting host PC.
    pub fn guest_address_for_host_offset(&self, offset: CodeOffset) -> Option<u64> {
        self.inst_registry
            .iter()
            .take_while(|e| e.offset <= offset)
            .last()
            .map(|e| e.address)
    }

    pub fn tag_registry(&self) -> &[TagInfo] {
        &self.tag_registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::reloc::{TAG_PATCH_BEGIN, TAG_PATCH_END};
    use graft_asm::{lookup, DecodedInst, FlatMemory};

    fn cpu() -> std::sync::Arc<dyn Cpu> {
        lookup("g64")
    }

    fn simple_patch(inst: Inst, address: u64, modify_pc: bool) -> Patch {
        let size = inst.encoded_len();
        let mut p = Patch::new(
            DecodedInst {
                inst: inst.clone(),
                address,
                size,
            },
            [RelocatableInst::Inst(inst)],
            modify_pc,
            false,
        );
        p.finalize();
        p
    }

    #[test]
    fn patches_are_atomic_on_exhaustion() {
        let cpu = cpu();
        let mut block = ExecBlock::new(4096, VmInstanceRef::default(), &*cpu);
        let patch = simple_patch(Inst::Nop, 0x1000, false);
        let mut last_ok = true;
        let mut writes = 0;
        while last_ok {
            let before = block.cursor;
            last_ok = block.write_patch(&patch, 0, &*cpu);
            if last_ok {
                writes += 1;
            } else {
                // Rollback restored the cursor exactly.
                assert_eq!(block.cursor, before);
            }
        }
        assert!(block.is_full());
        assert!(writes > 0);
        // The epilogue reserve was honored throughout.
        assert!(block.epilogue_room() > 0);
    }

    #[test]
    fn markers_feed_the_tag_registry_without_bytes() {
        let cpu = cpu();
        let mut block = ExecBlock::new(4096, VmInstanceRef::default(), &*cpu);
        let patch = simple_patch(Inst::Nop, 0x1000, false);
        let before = block.cursor;
        assert!(block.write_patch(&patch, 0, &*cpu));
        let tags = block.tag_registry();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag, TAG_PATCH_BEGIN);
        assert_eq!(tags[0].offset, before);
        assert_eq!(tags[1].tag, TAG_PATCH_END);
        assert_eq!(block.cursor - before, 1);
    }

    #[test]
    fn sequence_runs_to_epilogue() {
        let cpu = cpu();
        let mut mem = FlatMemory::new();
        let mut block = ExecBlock::new(4096, VmInstanceRef::default(), &*cpu);
        let patches = vec![
            simple_patch(
                Inst::MovImm {
                    rd: graft_asm::Gpr::new(0),
                    imm: 42,
                },
                0x1000,
                false,
            ),
            simple_patch(Inst::CtxSetPcImm { pc: 0x2000 }, 0x1006, true),
        ];
        let write = block.write_sequence(&patches, &*cpu).unwrap();
        assert_eq!(write.patches_written, 2);
        block.select_seq(write.seq_id);
        match block.run(&*cpu, &mut mem) {
            BlockExit::SequenceEnd => {}
            other => panic!("unexpected exit {other:?}"),
        }
        assert_eq!(block.context().gpr.pc, 0x2000);
        assert_eq!(block.context().gpr.regs[0], 42);
    }

    #[test]
    fn host_offset_maps_back_to_guest_address() {
        let cpu = cpu();
        let mut block = ExecBlock::new(4096, VmInstanceRef::default(), &*cpu);
        let patches = vec![
            simple_patch(Inst::Nop, 0x1000, false),
            simple_patch(Inst::Nop, 0x1001, false),
        ];
        block.write_sequence(&patches, &*cpu).unwrap();
        let second = block.inst_offset(1);
        assert_eq!(block.guest_address_for_host_offset(second), Some(0x1001));
        assert_eq!(block.guest_address_for_host_offset(0), Some(0x1000));
    }
}
