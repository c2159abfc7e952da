//! The code cache: guest PC to translated code.
//!
//! Blocks are appended as translation demands and evicted in two phases:
//! `clear_cache*` makes every translation in the affected blocks unreachable
//! through lookup immediately, while the backing memory survives on a flush
//! list until [`ExecBlockManager::flush_commit`] runs at a safe point.

use super::{ExecBlock, SeqWrite};
use crate::patch::Patch;
use crate::rangeset::{Range, RangeSet};
use crate::state::VmInstanceRef;
use crate::execblock::MINIMAL_BLOCK_SIZE;
use graft_asm::{Cpu, Inst};
use std::collections::HashMap;
use std::sync::Arc;

/// Guest address range of a cached sequence and of the basic block whose
/// translation contains it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqLoc {
    pub bb_start: u64,
    pub bb_end: u64,
    pub seq_start: u64,
    pub seq_end: u64,
}

/// Cache index value: where one guest instruction's translation lives.
#[derive(Copy, Clone, Debug)]
struct CacheLoc {
    block: usize,
    seq: u16,
    inst: u16,
}

struct BlockSlot {
    block: ExecBlock,
    seq_locs: Vec<SeqLoc>,
    footprint: RangeSet,
}

pub struct ExecBlockManager {
    cpu: Arc<dyn Cpu>,
    blocks: Vec<Option<BlockSlot>>,
    index: HashMap<u64, CacheLoc>,
    open_block: Option<usize>,
    flush_list: Vec<(usize, BlockSlot)>,
    block_size: usize,
    vm_ref: VmInstanceRef,
}

fn sequence_overhead() -> u32 {
    u32::from(Inst::CtxSetPcImm { pc: 0 }.encoded_len())
        + u32::from(Inst::JmpHost { offset: 0 }.encoded_len())
}

impl ExecBlockManager {
    pub fn new(cpu: Arc<dyn Cpu>, block_size: usize, vm_ref: VmInstanceRef) -> Self {
        Self {
            cpu,
            blocks: Vec::new(),
            index: HashMap::new(),
            open_block: None,
            flush_list: Vec::new(),
            block_size,
            vm_ref,
        }
    }

    fn alloc_block(&mut self) -> usize {
        let slot = BlockSlot {
            block: ExecBlock::new(self.block_size, self.vm_ref, &*self.cpu),
            seq_locs: Vec::new(),
            footprint: RangeSet::new(),
        };
        // A slot stays reserved while its old block sits on the flush list,
        // so an id never names two blocks at once.
        let free = self
            .blocks
            .iter()
            .enumerate()
            .position(|(id, s)| s.is_none() && !self.flush_list.iter().any(|(fid, _)| *fid == id));
        let id = match free {
            Some(free) => {
                self.blocks[free] = Some(slot);
                free
            }
            None => {
                self.blocks.push(Some(slot));
                self.blocks.len() - 1
            }
        };
        log::debug!("allocated exec block {id}");
        self.open_block = Some(id);
        id
    }

    fn ensure_open_block(&mut self) -> usize {
        match self.open_block {
            Some(id)
                if self.blocks[id]
                    .as_ref()
                    .is_some_and(|s| !s.block.is_full()) =>
            {
                id
            }
            _ => self.alloc_block(),
        }
    }

    /// How many leading patches the currently-open block takes without
    /// rolling back mid-sequence; the instrumenter only processes that
    /// prefix. Opens a fresh block when the open one cannot take even the
    /// first patch.
    pub fn pre_write_basic_block(&mut self, patches: &[Patch]) -> usize {
        let fit_in = |room: u32, patches: &[Patch]| -> usize {
            let reserve = MINIMAL_BLOCK_SIZE + sequence_overhead() + 1;
            let mut avail = room.saturating_sub(reserve);
            let mut count = 0;
            for patch in patches {
                if u64::from(avail) < u64::from(patch.metadata.patch_size) {
                    break;
                }
                avail -= patch.metadata.patch_size;
                count += 1;
            }
            count
        };

        let id = self.ensure_open_block();
        let room = self.blocks[id].as_ref().unwrap().block.epilogue_room();
        let mut count = fit_in(room, patches);
        if count == 0 {
            let id = self.alloc_block();
            let room = self.blocks[id].as_ref().unwrap().block.epilogue_room();
            count = fit_in(room, patches);
            assert!(
                count > 0,
                "patch at {:#x} cannot fit an empty code block",
                patches[0].metadata.address
            );
        }
        count
    }

    /// Commit patches `[0, patch_end)` into the cache, registering the
    /// resulting sequences and index entries. Re-issues rolled-back patches
    /// into a fresh block, so a basic block may span blocks.
    pub fn write_basic_block(&mut self, patches: &[Patch], patch_end: usize) {
        debug_assert!(patch_end <= patches.len());
        let bb_start = patches[0].metadata.address;
        let bb_end = patches.last().unwrap().end_address();
        let mut i = 0;
        while i < patch_end {
            let id = self.ensure_open_block();
            let slot = self.blocks[id].as_mut().unwrap();
            let cpu = self.cpu.clone();
            match slot.block.write_sequence(&patches[i..patch_end], &*cpu) {
                Some(SeqWrite {
                    seq_id,
                    patches_written,
                }) => {
                    let written = &patches[i..i + patches_written];
                    let seq_start = written[0].metadata.address;
                    let seq_end = written[written.len() - 1].end_address();
                    debug_assert_eq!(usize::from(seq_id), slot.seq_locs.len());
                    slot.seq_locs.push(SeqLoc {
                        bb_start,
                        bb_end,
                        seq_start,
                        seq_end,
                    });
                    slot.footprint.add(Range::new(seq_start, seq_end));
                    let start_inst = slot.block.seq_entry(seq_id).start_inst_id;
                    for (k, patch) in written.iter().enumerate() {
                        self.index.insert(
                            patch.metadata.address,
                            CacheLoc {
                                block: id,
                                seq: seq_id,
                                inst: start_inst + k as u16,
                            },
                        );
                    }
                    log::debug!(
                        "wrote sequence [{seq_start:#x}, {seq_end:#x}) of basic block \
                         [{bb_start:#x}, {bb_end:#x}) into block {id}"
                    );
                    i += patches_written;
                }
                None => {
                    // The open block could not take a single patch; force a
                    // fresh one next iteration.
                    assert!(
                        self.open_block == Some(id),
                        "write failed into a non-open block"
                    );
                    self.open_block = None;
                }
            }
        }
    }

    /// Pure lookup.
    pub fn get_exec_block(&self, pc: u64) -> Option<&ExecBlock> {
        let loc = self.index.get(&pc)?;
        Some(&self.blocks[loc.block].as_ref().unwrap().block)
    }

    /// Lookup-and-select: program the owning block so its next run starts
    /// at `pc`, deriving a sequence when `pc` falls mid-way through one.
    pub fn get_programmed_exec_block(&mut self, pc: u64) -> Option<(usize, SeqLoc)> {
        let loc = *self.index.get(&pc)?;
        let slot = self.blocks[loc.block].as_mut().unwrap();
        let seq = slot.block.seq_entry(loc.seq);
        let seq_id = if seq.start_inst_id == loc.inst {
            loc.seq
        } else {
            let derived = slot.block.derive_sequence(loc.seq, loc.inst);
            let base = slot.seq_locs[usize::from(loc.seq)];
            slot.seq_locs.push(SeqLoc {
                seq_start: pc,
                ..base
            });
            self.index.insert(
                pc,
                CacheLoc {
                    block: loc.block,
                    seq: derived,
                    inst: loc.inst,
                },
            );
            derived
        };
        slot.block.select_seq(seq_id);
        Some((loc.block, slot.seq_locs[usize::from(seq_id)]))
    }

    /// Access a block by id, looking through the flush list so an evicted
    /// block stays reachable (and its context valid) until commit.
    pub fn block(&self, id: usize) -> &ExecBlock {
        match &self.blocks[id] {
            Some(slot) => &slot.block,
            None => {
                &self
                    .flush_list
                    .iter()
                    .find(|(fid, _)| *fid == id)
                    .expect("stale exec block id")
                    .1
                    .block
            }
        }
    }

    pub fn block_mut(&mut self, id: usize) -> &mut ExecBlock {
        match &mut self.blocks[id] {
            Some(slot) => &mut slot.block,
            None => {
                &mut self
                    .flush_list
                    .iter_mut()
                    .find(|(fid, _)| *fid == id)
                    .expect("stale exec block id")
                    .1
                    .block
            }
        }
    }

    fn clear_where(&mut self, affected: impl Fn(&RangeSet) -> bool) {
        let ids: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref()
                    .filter(|s| affected(&s.footprint))
                    .map(|_| id)
            })
            .collect();
        if ids.is_empty() {
            return;
        }
        for &id in &ids {
            let slot = self.blocks[id].take().unwrap();
            log::debug!("queueing exec block {id} for flush");
            self.flush_list.push((id, slot));
            if self.open_block == Some(id) {
                self.open_block = None;
            }
        }
        self.index.retain(|_, loc| !ids.contains(&loc.block));
    }

    /// Make every cached translation intersecting `range` unreachable.
    pub fn clear_cache_range(&mut self, range: Range) {
        self.clear_where(|fp| fp.overlaps(&range));
    }

    pub fn clear_cache_set(&mut self, set: &RangeSet) {
        self.clear_where(|fp| set.ranges().iter().any(|r| fp.overlaps(r)));
    }

    pub fn clear_all(&mut self) {
        self.clear_where(|_| true);
    }

    pub fn is_flush_pending(&self) -> bool {
        !self.flush_list.is_empty()
    }

    /// Release the memory of every evicted block. `current_block` is the
    /// block the engine would be executing, which must never be part of the
    /// flush set.
    pub fn flush_commit(&mut self, current_block: Option<usize>) {
        for (id, _) in &self.flush_list {
            assert!(
                Some(*id) != current_block,
                "flush commit while the engine occupies block {id}"
            );
        }
        log::debug!("flushing {} exec blocks", self.flush_list.len());
        self.flush_list.clear();
    }

    pub fn change_vm_instance_ref(&mut self, vm_ref: VmInstanceRef) {
        self.vm_ref = vm_ref;
        for slot in self.blocks.iter_mut().flatten() {
            slot.block.set_vm_ref(vm_ref);
        }
        for (_, slot) in &mut self.flush_list {
            slot.block.set_vm_ref(vm_ref);
        }
    }
}
