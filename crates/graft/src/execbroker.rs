//! The exec broker: native execution of non-instrumented code.
//!
//! The broker owns the set of instrumented ranges and, when the run loop
//! reaches a PC outside it, decides whether the native CPU can safely take
//! over. The adopted predicate: the guest stack pointer is readable and the
//! return slot it points at holds an instrumented address, so control will
//! come back through a frame the engine observes. The transfer itself swaps
//! that return slot for the broker's return trampoline, runs natively until
//! control reaches the trampoline, then restores the real return address
//! into the guest PC.

use crate::rangeset::{Range, RangeSet};
use crate::state::VmInstanceRef;
use graft_asm::{Cpu, FprState, GprState, Memory, MemoryMap, NativeExit, Permission};

/// Where brokered native calls return to. Never mapped; the reference
/// backend stops when the PC reaches it.
pub const RETURN_TRAMPOLINE: u64 = 0xFFFF_FFFF_FFFF_F000;

pub struct ExecBroker {
    instrumented: RangeSet,
    vm_ref: VmInstanceRef,
}

impl ExecBroker {
    pub fn new(vm_ref: VmInstanceRef) -> Self {
        Self {
            instrumented: RangeSet::new(),
            vm_ref,
        }
    }

    pub fn is_instrumented(&self, pc: u64) -> bool {
        self.instrumented.contains(pc)
    }

    pub fn instrumented_range(&self) -> &RangeSet {
        &self.instrumented
    }

    pub fn set_instrumented_range(&mut self, set: &RangeSet) {
        self.instrumented = set.clone();
    }

    pub fn add_instrumented_range(&mut self, range: Range) {
        log::debug!("instrumenting range {range}");
        self.instrumented.add(range);
    }

    pub fn remove_instrumented_range(&mut self, range: Range) {
        self.instrumented.remove(range);
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.instrumented.clear();
    }

    fn executable_maps_named<'a>(
        maps: &'a [MemoryMap],
        name: &'a str,
    ) -> impl Iterator<Item = &'a MemoryMap> {
        maps.iter()
            .filter(move |m| m.name == name && m.permission.contains(Permission::EXEC))
    }

    /// Instrument every executable mapping of the named module. Returns
    /// whether any mapping matched.
    pub fn add_instrumented_module(&mut self, name: &str, maps: &[MemoryMap]) -> bool {
        let mut found = false;
        for m in Self::executable_maps_named(maps, name) {
            self.add_instrumented_range(Range::new(m.range.start, m.range.end));
            found = true;
        }
        found
    }

    pub fn remove_instrumented_module(&mut self, name: &str, maps: &[MemoryMap]) -> bool {
        let mut found = false;
        for m in Self::executable_maps_named(maps, name) {
            self.remove_instrumented_range(Range::new(m.range.start, m.range.end));
            found = true;
        }
        found
    }

    fn module_name_at(maps: &[MemoryMap], addr: u64) -> Option<&str> {
        maps.iter()
            .find(|m| m.range.contains(&addr))
            .map(|m| m.name.as_str())
    }

    /// Instrument the module whose mapping contains `addr`.
    pub fn add_instrumented_module_from_addr(&mut self, addr: u64, maps: &[MemoryMap]) -> bool {
        match Self::module_name_at(maps, addr) {
            Some(name) => {
                let name = name.to_string();
                self.add_instrumented_module(&name, maps)
            }
            None => false,
        }
    }

    pub fn remove_instrumented_module_from_addr(&mut self, addr: u64, maps: &[MemoryMap]) -> bool {
        match Self::module_name_at(maps, addr) {
            Some(name) => {
                let name = name.to_string();
                self.remove_instrumented_module(&name, maps)
            }
            None => false,
        }
    }

    pub fn instrument_all_executable_maps(&mut self, maps: &[MemoryMap]) -> bool {
        let mut found = false;
        for m in maps.iter().filter(|m| m.permission.contains(Permission::EXEC)) {
            self.add_instrumented_range(Range::new(m.range.start, m.range.end));
            found = true;
        }
        found
    }

    /// Whether native execution from the current state would come back
    /// through an observable frame.
    pub fn can_transfer_execution(&self, gpr: &GprState, memory: &dyn Memory) -> bool {
        match memory.read_u64(gpr.sp()) {
            Ok(ret) => self.is_instrumented(ret),
            Err(_) => false,
        }
    }

    /// Run `pc` natively until control returns through the trampoline.
    /// Fresh register state is left in `gpr`/`fpr`.
    pub fn transfer_execution(
        &self,
        pc: u64,
        gpr: &mut GprState,
        fpr: &mut FprState,
        memory: &mut dyn Memory,
        cpu: &dyn Cpu,
    ) {
        let sp = gpr.sp();
        let ret = memory
            .read_u64(sp)
            .expect("transfer_execution without a readable return slot");
        memory
            .write_u64(sp, RETURN_TRAMPOLINE)
            .expect("transfer_execution with a non-writable return slot");
        gpr.pc = pc;
        log::debug!("transferring execution to {pc:#x}, return lands at {ret:#x}");
        match cpu.run_native(gpr, fpr, memory, RETURN_TRAMPOLINE) {
            NativeExit::Reached => gpr.pc = ret,
            NativeExit::Breakpoint { address } => {
                panic!("breakpoint at {address:#x} during brokered native execution")
            }
            NativeExit::Fault { address, fault } => {
                panic!("fault at {address:#x} during brokered native execution: {fault}")
            }
        }
    }

    pub fn change_vm_instance_ref(&mut self, vm_ref: VmInstanceRef) {
        self.vm_ref = vm_ref;
    }

    pub fn vm_ref(&self) -> VmInstanceRef {
        self.vm_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_asm::FlatMemory;

    fn maps() -> Vec<MemoryMap> {
        let mut mem = FlatMemory::new();
        mem.map_region("app", 0x1000, 0x1000, Permission::READ | Permission::EXEC);
        mem.map_region("app", 0x4000, 0x1000, Permission::READ);
        mem.map_region("libfoo", 0x5000, 0x1000, Permission::READ | Permission::EXEC);
        mem.maps()
    }

    #[test]
    fn module_by_name_takes_executable_maps_only() {
        let mut broker = ExecBroker::new(VmInstanceRef::default());
        assert!(broker.add_instrumented_module("app", &maps()));
        assert!(broker.is_instrumented(0x1000));
        assert!(!broker.is_instrumented(0x4000));
        assert!(!broker.is_instrumented(0x5000));
    }

    #[test]
    fn unknown_module_is_a_soft_failure() {
        let mut broker = ExecBroker::new(VmInstanceRef::default());
        assert!(!broker.add_instrumented_module("libbar", &maps()));
        assert!(broker.instrumented_range().is_empty());
    }

    #[test]
    fn module_from_addr_resolves_by_name() {
        let mut broker = ExecBroker::new(VmInstanceRef::default());
        assert!(broker.add_instrumented_module_from_addr(0x1234, &maps()));
        assert!(broker.is_instrumented(0x1fff));
        assert!(broker.remove_instrumented_module_from_addr(0x1234, &maps()));
        assert!(!broker.is_instrumented(0x1fff));
    }

    #[test]
    fn all_executable_maps() {
        let mut broker = ExecBroker::new(VmInstanceRef::default());
        assert!(broker.instrument_all_executable_maps(&maps()));
        assert!(broker.is_instrumented(0x1000));
        assert!(broker.is_instrumented(0x5000));
        assert!(!broker.is_instrumented(0x4000));
    }

    #[test]
    fn transfer_predicate_wants_instrumented_return_slot() {
        let mut broker = ExecBroker::new(VmInstanceRef::default());
        broker.add_instrumented_range(Range::new(0x1000, 0x2000));
        let mut mem = FlatMemory::new();
        mem.map_region("[stack]", 0x7000, 0x1000, Permission::READ | Permission::WRITE);
        let mut gpr = GprState::default();

        // Unreadable stack pointer.
        gpr.set_sp(0x100);
        assert!(!broker.can_transfer_execution(&gpr, &mem));

        // Return slot outside the instrumented set.
        gpr.set_sp(0x7800);
        mem.write_u64(0x7800, 0x9000).unwrap();
        assert!(!broker.can_transfer_execution(&gpr, &mem));

        mem.write_u64(0x7800, 0x1500).unwrap();
        assert!(broker.can_transfer_execution(&gpr, &mem));
    }
}
