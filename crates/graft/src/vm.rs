//! The engine orchestrator and embedder API.
//!
//! `Vm` threads a single authoritative register state through either native
//! execution (via the exec broker) or cached execution (via ExecBlocks),
//! raising events at transfer, sequence and basic-block boundaries. The
//! shadow copies it owns are authoritative whenever no block is current;
//! while a block runs, its embedded context is, and the two are reconciled
//! at the loop boundaries.

use crate::analysis::{analyze, AnalysisType, InstAnalysis};
use crate::config::Config;
use crate::errors::VmError;
use crate::events::{
    CallbackRegistration, InstCallback, InstPosition, VmAction, VmCallback, VmEvent, VmState,
    EVENTID_VM_MASK,
};
use crate::execblock::manager::{ExecBlockManager, SeqLoc};
use crate::execbroker::ExecBroker;
use crate::patch::{default_patch_rules, InstrRule, InstrRuleUser, Patch, PatchRule};
use crate::rangeset::{Range, RangeSet};
use crate::state::VmInstanceRef;
use graft_asm::{lookup, BlockExit, Cpu, FprState, GprState, Memory};
use std::sync::Arc;

pub struct Vm {
    config: Config,
    cpu: Arc<dyn Cpu>,
    memory: Box<dyn Memory>,
    block_manager: ExecBlockManager,
    exec_broker: ExecBroker,
    patch_rules: Vec<Box<dyn PatchRule>>,
    instr_rules: Vec<(u32, Box<dyn InstrRule>)>,
    vm_callbacks: Vec<(u32, CallbackRegistration)>,
    instr_rules_counter: u32,
    vm_callbacks_counter: u32,
    event_mask: VmEvent,
    gpr_shadow: GprState,
    fpr_shadow: FprState,
    /// The block whose context currently holds the authoritative register
    /// state; `None` means the shadow copies do.
    cur_block: Option<usize>,
    instance_ref: VmInstanceRef,
    running: bool,
}

impl Vm {
    pub fn new(config: &Config, memory: Box<dyn Memory>) -> Self {
        let cpu = lookup(&config.resolved_cpu());
        log::debug!(
            "initialized engine with cpu {} (requested {:?}, features {:?})",
            cpu.name(),
            config.cpu_name(),
            config.feature_list()
        );
        let instance_ref = VmInstanceRef::default();
        Self {
            cpu: cpu.clone(),
            memory,
            block_manager: ExecBlockManager::new(cpu, config.block_size(), instance_ref),
            exec_broker: ExecBroker::new(instance_ref),
            patch_rules: default_patch_rules(),
            instr_rules: Vec::new(),
            vm_callbacks: Vec::new(),
            instr_rules_counter: 0,
            vm_callbacks_counter: 0,
            event_mask: VmEvent::empty(),
            gpr_shadow: GprState::default(),
            fpr_shadow: FprState::default(),
            cur_block: None,
            instance_ref,
            config: config.clone(),
            running: false,
        }
    }

    /// Drop every rule, callback and cached translation and rebuild the
    /// engine around a new configuration.
    pub fn reinit(&mut self, config: &Config) {
        assert!(!self.running, "cannot reinitialize a running engine");
        self.instr_rules.clear();
        self.vm_callbacks.clear();
        self.instr_rules_counter = 0;
        self.vm_callbacks_counter = 0;
        self.event_mask = VmEvent::empty();
        self.gpr_shadow = GprState::default();
        self.fpr_shadow = FprState::default();
        self.cur_block = None;

        self.cpu = lookup(&config.resolved_cpu());
        self.block_manager =
            ExecBlockManager::new(self.cpu.clone(), config.block_size(), self.instance_ref);
        self.exec_broker = ExecBroker::new(self.instance_ref);
        self.patch_rules = default_patch_rules();
        self.config = config.clone();
    }

    /// Copy another engine's configuration (rules, callbacks, instrumented
    /// ranges, register state) without its cache contents.
    pub fn copy_configuration_from(&mut self, other: &Vm) {
        assert!(!self.running, "cannot reconfigure a running engine");
        assert!(!other.running, "cannot copy from a running engine");
        self.clear_all_cache();
        if self.config != other.config {
            self.reinit(&other.config);
        }
        self.instr_rules = other
            .instr_rules
            .iter()
            .map(|(id, rule)| (*id, rule.clone_rule()))
            .collect();
        self.vm_callbacks = other.vm_callbacks.clone();
        self.instr_rules_counter = other.instr_rules_counter;
        self.vm_callbacks_counter = other.vm_callbacks_counter;
        self.event_mask = other.event_mask;
        self.exec_broker
            .set_instrumented_range(other.exec_broker.instrumented_range());
        self.set_gpr_state(other.gpr_state());
        self.set_fpr_state(other.fpr_state());
    }

    /// Swap the opaque embedder handle and propagate it down the owning
    /// tree (blocks, broker, rules).
    pub fn change_vm_instance_ref(&mut self, instance_ref: VmInstanceRef) {
        assert!(
            !self.running,
            "cannot change the instance handle of a running engine"
        );
        self.instance_ref = instance_ref;
        self.block_manager.change_vm_instance_ref(instance_ref);
        self.exec_broker.change_vm_instance_ref(instance_ref);
        for (_, rule) in &mut self.instr_rules {
            rule.change_vm_instance_ref(instance_ref);
        }
    }

    pub fn instance_ref(&self) -> VmInstanceRef {
        self.instance_ref
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn memory(&self) -> &dyn Memory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn Memory {
        self.memory.as_mut()
    }

    // ------------------------------------------------------------------
    // Register state: one authoritative copy, named by `cur_block`.

    pub fn gpr_state(&self) -> &GprState {
        match self.cur_block {
            None => &self.gpr_shadow,
            Some(id) => &self.block_manager.block(id).context().gpr,
        }
    }

    pub fn fpr_state(&self) -> &FprState {
        match self.cur_block {
            None => &self.fpr_shadow,
            Some(id) => &self.block_manager.block(id).context().fpr,
        }
    }

    pub fn gpr_state_mut(&mut self) -> &mut GprState {
        match self.cur_block {
            None => &mut self.gpr_shadow,
            Some(id) => &mut self.block_manager.block_mut(id).context_mut().gpr,
        }
    }

    pub fn fpr_state_mut(&mut self) -> &mut FprState {
        match self.cur_block {
            None => &mut self.fpr_shadow,
            Some(id) => &mut self.block_manager.block_mut(id).context_mut().fpr,
        }
    }

    pub fn set_gpr_state(&mut self, state: &GprState) {
        *self.gpr_state_mut() = state.clone();
    }

    pub fn set_fpr_state(&mut self, state: &FprState) {
        *self.fpr_state_mut() = state.clone();
    }

    /// Whether the engine is stopped at a pre-instruction callback: by
    /// convention the guest PC then equals the current instruction address.
    pub fn is_pre_inst(&self) -> bool {
        let Some(id) = self.cur_block else {
            return false;
        };
        let block = self.block_manager.block(id);
        block.inst_address(block.current_inst()) == self.gpr_state().pc
    }

    /// Copy the live block context back into the shadows and make them
    /// authoritative again.
    fn sync_to_shadow(&mut self) {
        if let Some(id) = self.cur_block.take() {
            let context = self.block_manager.block(id).context();
            self.gpr_shadow = context.gpr.clone();
            self.fpr_shadow = context.fpr.clone();
        }
    }

    // ------------------------------------------------------------------
    // Instrumented ranges.

    pub fn add_instrumented_range(&mut self, start: u64, end: u64) {
        self.exec_broker.add_instrumented_range(Range::new(start, end));
    }

    pub fn remove_instrumented_range(&mut self, start: u64, end: u64) {
        self.exec_broker
            .remove_instrumented_range(Range::new(start, end));
    }

    pub fn add_instrumented_module(&mut self, name: &str) -> bool {
        let maps = self.memory.maps();
        self.exec_broker.add_instrumented_module(name, &maps)
    }

    pub fn remove_instrumented_module(&mut self, name: &str) -> bool {
        let maps = self.memory.maps();
        self.exec_broker.remove_instrumented_module(name, &maps)
    }

    pub fn add_instrumented_module_from_addr(&mut self, addr: u64) -> bool {
        let maps = self.memory.maps();
        self.exec_broker.add_instrumented_module_from_addr(addr, &maps)
    }

    pub fn remove_instrumented_module_from_addr(&mut self, addr: u64) -> bool {
        let maps = self.memory.maps();
        self.exec_broker
            .remove_instrumented_module_from_addr(addr, &maps)
    }

    pub fn instrument_all_executable_maps(&mut self) -> bool {
        let maps = self.memory.maps();
        self.exec_broker.instrument_all_executable_maps(&maps)
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.exec_broker.remove_all_instrumented_ranges();
    }

    // ------------------------------------------------------------------
    // Instrumentation registries.

    /// Register an instrumentation rule. Rules are kept sorted by ascending
    /// priority, stably, and the cache is invalidated over the rule's
    /// affected range so already-translated code picks it up.
    pub fn add_instr_rule(&mut self, rule: Box<dyn InstrRule>) -> Result<u32, VmError> {
        let id = self.instr_rules_counter;
        if id >= EVENTID_VM_MASK {
            return Err(VmError::InvalidEventId);
        }
        self.instr_rules_counter += 1;
        self.clear_cache_over(&rule.affected_range());
        let pos = self
            .instr_rules
            .partition_point(|(_, r)| r.priority() <= rule.priority());
        self.instr_rules.insert(pos, (id, rule));
        Ok(id)
    }

    /// Register a per-instruction callback over a guest address range.
    pub fn add_code_range_cb(
        &mut self,
        start: u64,
        end: u64,
        position: InstPosition,
        callback: InstCallback,
    ) -> Result<u32, VmError> {
        self.add_instr_rule(Box::new(InstrRuleUser::new(
            Range::new(start, end),
            position,
            callback,
        )))
    }

    /// Register a VM event callback. The returned id carries the VM-event
    /// bit so both id spaces share one deletion entry point.
    pub fn add_vm_event_cb(&mut self, mask: VmEvent, callback: VmCallback) -> Result<u32, VmError> {
        let id = self.vm_callbacks_counter;
        if id >= EVENTID_VM_MASK {
            return Err(VmError::InvalidEventId);
        }
        self.vm_callbacks_counter += 1;
        self.vm_callbacks
            .push((id, CallbackRegistration { mask, callback }));
        self.event_mask |= mask;
        Ok(id | EVENTID_VM_MASK)
    }

    /// Remove one registration; the id's high bit selects the registry.
    pub fn delete_instrumentation(&mut self, id: u32) -> bool {
        if id & EVENTID_VM_MASK != 0 {
            let raw = id & !EVENTID_VM_MASK;
            match self.vm_callbacks.iter().position(|(i, _)| *i == raw) {
                Some(pos) => {
                    self.vm_callbacks.remove(pos);
                    self.recompute_event_mask();
                    true
                }
                None => false,
            }
        } else {
            match self.instr_rules.iter().position(|(i, _)| *i == id) {
                Some(pos) => {
                    let range = self.instr_rules[pos].1.affected_range();
                    self.clear_cache_over(&range);
                    self.instr_rules.remove(pos);
                    true
                }
                None => false,
            }
        }
    }

    pub fn delete_all_instrumentations(&mut self) {
        let mut affected = RangeSet::new();
        for (_, rule) in &self.instr_rules {
            affected.add_set(&rule.affected_range());
        }
        self.clear_cache_over(&affected);
        self.instr_rules.clear();
        self.vm_callbacks.clear();
        self.instr_rules_counter = 0;
        self.vm_callbacks_counter = 0;
        self.event_mask = VmEvent::empty();
    }

    fn recompute_event_mask(&mut self) {
        self.event_mask = self
            .vm_callbacks
            .iter()
            .fold(VmEvent::empty(), |mask, (_, r)| mask | r.mask);
    }

    #[doc(hidden)]
    pub fn set_id_counters(&mut self, instr_rules: u32, vm_callbacks: u32) {
        self.instr_rules_counter = instr_rules;
        self.vm_callbacks_counter = vm_callbacks;
    }

    #[doc(hidden)]
    pub fn event_mask(&self) -> VmEvent {
        self.event_mask
    }

    // ------------------------------------------------------------------
    // Cache control.

    fn clear_cache_over(&mut self, set: &RangeSet) {
        self.block_manager.clear_cache_set(set);
        if !self.running && self.block_manager.is_flush_pending() {
            self.block_manager.flush_commit(self.cur_block);
        }
    }

    pub fn clear_cache(&mut self, start: u64, end: u64) {
        self.block_manager.clear_cache_range(Range::new(start, end));
        if !self.running && self.block_manager.is_flush_pending() {
            self.block_manager.flush_commit(self.cur_block);
        }
    }

    pub fn clear_cache_set(&mut self, set: &RangeSet) {
        self.clear_cache_over(set);
    }

    pub fn clear_all_cache(&mut self) {
        self.block_manager.clear_all();
        if !self.running && self.block_manager.is_flush_pending() {
            self.block_manager.flush_commit(self.cur_block);
        }
    }

    // ------------------------------------------------------------------
    // Translation.

    /// Decode and patch the basic block at `start`: one merged patch per
    /// guest instruction, ending at the first patch that modifies the PC.
    fn patch(&self, start: u64) -> Vec<Patch> {
        log::debug!("patching basic block at address {start:#x}");
        let mut basic_block = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut pending: Option<Patch> = None;
            let mut patch = loop {
                let address = start + offset;
                let window = self
                    .memory
                    .read_code(address, self.cpu.max_inst_len())
                    .unwrap_or_else(|e| panic!("cannot read instrumented code at {address:#x}: {e}"));
                let di = self.cpu.decode(&window, address).unwrap_or_else(|e| {
                    panic!("decoding failure inside instrumented code: {e}")
                });
                log::trace!("patching {address:#x} {}", self.cpu.disassemble(&di));
                let rule = self
                    .patch_rules
                    .iter()
                    .find(|r| r.can_be_applied(&di))
                    .unwrap_or_else(|| panic!("no patch rule for {}", self.cpu.disassemble(&di)));
                offset += u64::from(di.size);
                let patch = rule.generate(&di, pending.take());
                if patch.metadata.merge {
                    pending = Some(patch);
                } else {
                    break patch;
                }
            };
            patch.finalize();
            let ends_block = patch.metadata.modify_pc;
            basic_block.push(patch);
            if ends_block {
                log::debug!(
                    "basic block [{start:#x}, {:#x}) patched, {} instructions",
                    start + offset,
                    basic_block.len()
                );
                return basic_block;
            }
        }
    }

    /// Offer every patch of the sequence prefix to the instrumentation
    /// rules, in priority order.
    fn instrument(&self, basic_block: &mut [Patch], patch_end: usize) {
        for patch in &mut basic_block[..patch_end] {
            for (id, rule) in &self.instr_rules {
                if rule.try_instrument(patch) {
                    log::debug!(
                        "instrumentation rule {id} applied at {:#x}",
                        patch.metadata.address
                    );
                }
            }
        }
    }

    fn handle_new_basic_block(&mut self, pc: u64) {
        let mut basic_block = self.patch(pc);
        let patch_end = self.block_manager.pre_write_basic_block(&basic_block);
        self.instrument(&mut basic_block, patch_end);
        self.block_manager.write_basic_block(&basic_block, patch_end);
    }

    /// Translate and cache the basic block at `pc` outside of a run.
    /// Returns false when it is already cached.
    pub fn precache_basic_block(&mut self, pc: u64) -> bool {
        assert!(
            !self.running,
            "cannot precache a basic block on a running engine"
        );
        if self.block_manager.is_flush_pending() {
            self.block_manager.flush_commit(self.cur_block);
        }
        if self.block_manager.get_exec_block(pc).is_some() {
            return false;
        }
        self.running = true;
        self.handle_new_basic_block(pc);
        self.running = false;
        true
    }

    /// Analysis of a cached instruction; `None` when `address` has no
    /// cached translation.
    pub fn get_inst_analysis(&self, address: u64, ty: AnalysisType) -> Option<InstAnalysis> {
        let block = self.block_manager.get_exec_block(address)?;
        let inst_id = block.inst_id(address)?;
        let entry = block.inst_entry(inst_id);
        Some(analyze(&entry.decoded, entry.inst_size, ty, &*self.cpu))
    }

    // ------------------------------------------------------------------
    // Event dispatch.

    /// Raise `event` against every VM callback whose mask intersects it and
    /// reduce their actions to the strongest.
    fn signal_event(
        &mut self,
        event: VmEvent,
        current_pc: u64,
        seq_loc: Option<&SeqLoc>,
        bb_begin: u64,
    ) -> VmAction {
        if (event & self.event_mask).is_empty() {
            return VmAction::Continue;
        }
        let mut state = VmState {
            event,
            current_pc,
            ..VmState::default()
        };
        if let Some(loc) = seq_loc {
            state.basic_block_start = bb_begin;
            state.basic_block_end = loc.bb_end;
            state.sequence_start = loc.seq_start;
            state.sequence_end = loc.seq_end;
        }
        // Snapshot the matching callbacks: a callback may mutate the
        // registry while we dispatch.
        let callbacks: Vec<VmCallback> = self
            .vm_callbacks
            .iter()
            .filter(|(_, r)| !(r.mask & event).is_empty())
            .map(|(_, r)| r.callback.clone())
            .collect();
        let mut action = VmAction::Continue;
        for callback in callbacks {
            action = action.max(callback(self, &state));
        }
        action
    }

    // ------------------------------------------------------------------
    // Execution.

    fn can_transfer(&self, pc: u64) -> bool {
        !self.exec_broker.is_instrumented(pc)
            && self
                .exec_broker
                .can_transfer_execution(self.gpr_state(), self.memory.as_ref())
    }

    fn transfer_execution(&mut self, pc: u64) {
        debug_assert!(self.cur_block.is_none());
        let cpu = self.cpu.clone();
        let Vm {
            exec_broker,
            gpr_shadow,
            fpr_shadow,
            memory,
            ..
        } = self;
        exec_broker.transfer_execution(pc, gpr_shadow, fpr_shadow, memory.as_mut(), &*cpu);
    }

    /// Run the selected sequence of `block_id` to completion, dispatching
    /// instrumentation callbacks at every yield point.
    fn execute_block(&mut self, block_id: usize) -> VmAction {
        let cpu = self.cpu.clone();
        loop {
            let exit = {
                let Vm {
                    block_manager,
                    memory,
                    ..
                } = self;
                block_manager.block_mut(block_id).run(&*cpu, memory.as_mut())
            };
            match exit {
                BlockExit::SequenceEnd => return VmAction::Continue,
                BlockExit::Event { index, .. } => {
                    let entry = self.block_manager.block(block_id).callback(index);
                    let action = (entry.callback)(self);
                    if action != VmAction::Continue {
                        return action;
                    }
                }
                BlockExit::Fault(fault) => {
                    let block = self.block_manager.block(block_id);
                    let guest = block
                        .guest_address_for_host_offset(block.context().host.selector)
                        .unwrap_or(0);
                    panic!(
                        "execution fault in translated code near guest address \
                         {guest:#x}: {fault}"
                    );
                }
            }
        }
    }

    /// Execute from `start` until the guest PC reaches `stop`. Returns
    /// whether any instrumented instruction ran.
    pub fn run(&mut self, start: u64, stop: u64) -> bool {
        assert!(!self.running, "cannot run an already running engine");
        debug_assert!(self.cur_block.is_none());

        // Start address out of range: no events, no execution.
        if !self.exec_broker.is_instrumented(start) {
            return false;
        }

        let mut current_pc = start;
        let mut has_ran = false;
        let mut bb_begin: u64 = 0;
        let mut bb_end: u64 = 0;
        self.running = true;

        loop {
            let mut action;

            if self.can_transfer(current_pc) {
                log::debug!("executing {current_pc:#x} through the exec broker");
                self.sync_to_shadow();
                bb_begin = 0;
                bb_end = 0;
                action = self.signal_event(VmEvent::EXEC_TRANSFER_CALL, current_pc, None, 0);
                if action == VmAction::Continue {
                    self.transfer_execution(current_pc);
                    action =
                        self.signal_event(VmEvent::EXEC_TRANSFER_RETURN, current_pc, None, 0);
                }
            } else {
                log::debug!("executing {current_pc:#x} through the DBI");
                let mut event = VmEvent::SEQUENCE_ENTRY;

                // A deferred flush commits only here, after the live state
                // went back to the shadows and no block is current.
                if self.block_manager.is_flush_pending() {
                    self.sync_to_shadow();
                    self.block_manager.flush_commit(self.cur_block);
                }

                let (block_id, seq_loc) =
                    match self.block_manager.get_programmed_exec_block(current_pc) {
                        Some(found) => found,
                        None => {
                            log::debug!(
                                "cache miss for {current_pc:#x}, patching & instrumenting \
                                 new basic block"
                            );
                            self.handle_new_basic_block(current_pc);
                            event |= VmEvent::BASIC_BLOCK_NEW;
                            self.block_manager
                                .get_programmed_exec_block(current_pc)
                                .expect("just-written basic block missing from the cache")
                        }
                    };

                if bb_end == 0 {
                    event |= VmEvent::BASIC_BLOCK_ENTRY;
                    bb_begin = current_pc;
                    bb_end = seq_loc.bb_end;
                }

                // Make the chosen block's context the authoritative state.
                if self.cur_block != Some(block_id) {
                    let gpr = self.gpr_state().clone();
                    let fpr = self.fpr_state().clone();
                    let context = self.block_manager.block_mut(block_id).context_mut();
                    context.gpr = gpr;
                    context.fpr = fpr;
                    self.cur_block = Some(block_id);
                }
                // The dispatcher owns the guest PC between sequences; pin it
                // so callbacks that bail out before execution still leave a
                // coherent state behind.
                self.block_manager
                    .block_mut(block_id)
                    .context_mut()
                    .gpr
                    .pc = current_pc;

                action = self.signal_event(event, current_pc, Some(&seq_loc), bb_begin);
                if action == VmAction::Continue {
                    has_ran = true;
                    action = self.execute_block(block_id);
                    if action == VmAction::Continue {
                        if bb_end == seq_loc.seq_end {
                            action = self.signal_event(
                                VmEvent::SEQUENCE_EXIT | VmEvent::BASIC_BLOCK_EXIT,
                                current_pc,
                                Some(&seq_loc),
                                bb_begin,
                            );
                            bb_begin = 0;
                            bb_end = 0;
                        } else {
                            action = self.signal_event(
                                VmEvent::SEQUENCE_EXIT,
                                current_pc,
                                Some(&seq_loc),
                                bb_begin,
                            );
                        }
                    }
                }
            }

            if action == VmAction::Stop {
                log::debug!("received stop action");
                break;
            }
            if action == VmAction::BreakToVm {
                bb_begin = 0;
                bb_end = 0;
            }
            current_pc = self.gpr_state().pc;
            log::debug!("next address to execute is {current_pc:#x}");
            if current_pc == stop {
                break;
            }
        }

        self.sync_to_shadow();
        self.running = false;
        has_ran
    }
}
