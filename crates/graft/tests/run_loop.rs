//! End-to-end runs through the dispatch loop: events, caching, broker
//! transfers and callback actions.

use graft::{Config, Vm, VmAction, VmCallback, VmEvent, VmState};
use graft_asm::asm::Assembler;
use graft_asm::{FlatMemory, Gpr, Permission};
use std::cell::RefCell;
use std::rc::Rc;

const STACK_BASE: u64 = 0x7000_0000;
const SP: u64 = 0x7000_8000;
const EXIT: u64 = 0xDEAD;

fn vm_with_memory(memory: FlatMemory) -> Vm {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vm = Vm::new(&Config::new(), Box::new(memory));
    let mut gpr = vm.gpr_state().clone();
    gpr.set_sp(SP);
    vm.set_gpr_state(&gpr);
    vm.memory_mut().write_u64(SP, EXIT).unwrap();
    vm
}

fn vm_with_image(image: &[u8], base: u64) -> Vm {
    let mut memory = FlatMemory::new();
    memory.map_image("app", base, image, Permission::READ | Permission::EXEC);
    memory.map_region(
        "[stack]",
        STACK_BASE,
        0x10000,
        Permission::READ | Permission::WRITE,
    );
    vm_with_memory(memory)
}

fn record_events(vm: &mut Vm) -> Rc<RefCell<Vec<VmState>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let cb: VmCallback = Rc::new(move |_vm, state| {
        sink.borrow_mut().push(state.clone());
        VmAction::Continue
    });
    vm.add_vm_event_cb(VmEvent::all(), cb).unwrap();
    log
}

fn count(log: &Rc<RefCell<Vec<VmState>>>, bit: VmEvent) -> usize {
    log.borrow()
        .iter()
        .filter(|s| s.event.contains(bit))
        .count()
}

#[test]
fn single_block_run() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 0x2A);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);
    let log = record_events(&mut vm);

    assert!(vm.run(0x1000, EXIT));

    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 0x2A);
    assert_eq!(vm.gpr_state().pc, EXIT);
    assert_eq!(count(&log, VmEvent::SEQUENCE_ENTRY), 1);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_ENTRY), 1);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_NEW), 1);
    assert_eq!(count(&log, VmEvent::SEQUENCE_EXIT), 1);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_EXIT), 1);

    // The exit snapshot names the block and sequence that just ran.
    let log = log.borrow();
    let exit = log
        .iter()
        .find(|s| s.event.contains(VmEvent::SEQUENCE_EXIT))
        .unwrap();
    assert_eq!(exit.basic_block_start, 0x1000);
    assert_eq!(exit.sequence_start, 0x1000);
    assert_eq!(exit.basic_block_end, exit.sequence_end);
}

#[test]
fn run_outside_instrumented_set_is_a_soft_failure() {
    let mut a = Assembler::new(0x1000);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    let log = record_events(&mut vm);

    assert!(!vm.run(0x1000, EXIT));
    assert!(log.borrow().is_empty());
}

#[test]
fn cache_hit_skips_basic_block_new() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 0x2A);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    assert!(vm.precache_basic_block(0x1000));
    assert!(!vm.precache_basic_block(0x1000));

    let log = record_events(&mut vm);
    assert!(vm.run(0x1000, EXIT));
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_NEW), 0);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_ENTRY), 1);
}

#[test]
fn clear_cache_forces_retranslation() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 1);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);
    let log = record_events(&mut vm);

    let reset_stack = |vm: &mut Vm| {
        let mut gpr = vm.gpr_state().clone();
        gpr.set_sp(SP);
        vm.set_gpr_state(&gpr);
        vm.memory_mut().write_u64(SP, EXIT).unwrap();
    };

    assert!(vm.run(0x1000, EXIT));
    reset_stack(&mut vm);
    assert!(vm.run(0x1000, EXIT));
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_NEW), 1);

    vm.clear_cache(0x1000, 0x1010);
    reset_stack(&mut vm);
    assert!(vm.run(0x1000, EXIT));
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_NEW), 2);
}

#[test]
fn transfer_out_to_uninstrumented_code() {
    // Instrumented caller at 0x1000 calls a library at 0x5000 that the
    // embedder did not opt in.
    let mut a = Assembler::new(0x1000);
    a.call_to(0x5000);
    a.ret();
    let mut memory = FlatMemory::new();
    memory.map_image("app", 0x1000, &a.finish(), Permission::READ | Permission::EXEC);
    let mut lib = Assembler::new(0x5000);
    lib.mov_imm(Gpr::new(1), 9);
    lib.ret();
    memory.map_image("libfoo", 0x5000, &lib.finish(), Permission::READ | Permission::EXEC);
    memory.map_region(
        "[stack]",
        STACK_BASE,
        0x10000,
        Permission::READ | Permission::WRITE,
    );
    let mut vm = vm_with_memory(memory);
    vm.add_instrumented_range(0x1000, 0x1100);
    let log = record_events(&mut vm);

    assert!(vm.run(0x1000, EXIT));

    assert_eq!(count(&log, VmEvent::EXEC_TRANSFER_CALL), 1);
    assert_eq!(count(&log, VmEvent::EXEC_TRANSFER_RETURN), 1);
    {
        let log = log.borrow();
        let call = log
            .iter()
            .find(|s| s.event.contains(VmEvent::EXEC_TRANSFER_CALL))
            .unwrap();
        assert_eq!(call.current_pc, 0x5000);
        // Transfer events never carry basic-block bits.
        for state in log.iter() {
            if state
                .event
                .intersects(VmEvent::EXEC_TRANSFER_CALL | VmEvent::EXEC_TRANSFER_RETURN)
            {
                assert!(!state.event.intersects(
                    VmEvent::BASIC_BLOCK_ENTRY
                        | VmEvent::BASIC_BLOCK_EXIT
                        | VmEvent::BASIC_BLOCK_NEW
                ));
            }
        }
    }
    // The native call's effects landed in the shadow state, with the
    // call/return stack traffic fully balanced.
    assert_eq!(vm.gpr_state().reg(Gpr::new(1)), 9);
    assert_eq!(vm.gpr_state().sp(), SP + 8);
    assert_eq!(vm.gpr_state().pc, EXIT);
}

#[test]
fn stop_from_a_transfer_call_skips_the_native_run() {
    let mut a = Assembler::new(0x1000);
    a.call_to(0x5000);
    a.ret();
    let mut memory = FlatMemory::new();
    memory.map_image("app", 0x1000, &a.finish(), Permission::READ | Permission::EXEC);
    let mut lib = Assembler::new(0x5000);
    lib.mov_imm(Gpr::new(1), 9);
    lib.ret();
    memory.map_image("libfoo", 0x5000, &lib.finish(), Permission::READ | Permission::EXEC);
    memory.map_region(
        "[stack]",
        STACK_BASE,
        0x10000,
        Permission::READ | Permission::WRITE,
    );
    let mut vm = vm_with_memory(memory);
    vm.add_instrumented_range(0x1000, 0x1100);

    let returns = Rc::new(RefCell::new(0));
    let seen = returns.clone();
    vm.add_vm_event_cb(
        VmEvent::EXEC_TRANSFER_RETURN,
        Rc::new(move |_, _| {
            *seen.borrow_mut() += 1;
            VmAction::Continue
        }),
    )
    .unwrap();
    vm.add_vm_event_cb(
        VmEvent::EXEC_TRANSFER_CALL,
        Rc::new(|_, _| VmAction::Stop),
    )
    .unwrap();

    assert!(vm.run(0x1000, EXIT));
    // The call was never transferred, so no return event fired and the
    // library never ran.
    assert_eq!(*returns.borrow(), 0);
    assert_eq!(vm.gpr_state().reg(Gpr::new(1)), 0);
}

#[test]
fn stop_wins_over_continue() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 0x2A);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    let calls = Rc::new(RefCell::new((0, 0)));
    let first = calls.clone();
    vm.add_vm_event_cb(
        VmEvent::SEQUENCE_ENTRY,
        Rc::new(move |_, _| {
            first.borrow_mut().0 += 1;
            VmAction::Continue
        }),
    )
    .unwrap();
    let second = calls.clone();
    vm.add_vm_event_cb(
        VmEvent::SEQUENCE_ENTRY,
        Rc::new(move |_, _| {
            second.borrow_mut().1 += 1;
            VmAction::Stop
        }),
    )
    .unwrap();

    // The dispatch reduced to STOP before anything executed.
    assert!(!vm.run(0x1000, EXIT));
    assert_eq!(*calls.borrow(), (1, 1));
    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 0);
}

#[test]
fn break_to_vm_reenters_dispatch_without_execution() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 0x2A);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);
    let log = record_events(&mut vm);

    let broke = Rc::new(RefCell::new(false));
    let flag = broke.clone();
    vm.add_vm_event_cb(
        VmEvent::SEQUENCE_ENTRY,
        Rc::new(move |_, _| {
            if *flag.borrow() {
                VmAction::Continue
            } else {
                *flag.borrow_mut() = true;
                VmAction::BreakToVm
            }
        }),
    )
    .unwrap();

    assert!(vm.run(0x1000, EXIT));
    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 0x2A);

    let log = log.borrow();
    let entries: Vec<&VmState> = log
        .iter()
        .filter(|s| s.event.contains(VmEvent::SEQUENCE_ENTRY))
        .collect();
    assert_eq!(entries.len(), 2);
    // First dispatch translated the block; the re-entry found it cached
    // but re-opens basic-block tracking.
    assert!(entries[0].event.contains(VmEvent::BASIC_BLOCK_NEW));
    assert!(entries[0].event.contains(VmEvent::BASIC_BLOCK_ENTRY));
    assert!(!entries[1].event.contains(VmEvent::BASIC_BLOCK_NEW));
    assert!(entries[1].event.contains(VmEvent::BASIC_BLOCK_ENTRY));
}

#[test]
fn oversized_basic_block_spans_sequences() {
    const BODY: usize = 300;
    let mut a = Assembler::new(0x1000);
    for _ in 0..BODY {
        a.add_imm(Gpr::new(0), 1);
    }
    a.ret();
    let image = a.finish();

    let mut memory = FlatMemory::new();
    memory.map_image("app", 0x1000, &image, Permission::READ | Permission::EXEC);
    memory.map_region(
        "[stack]",
        STACK_BASE,
        0x10000,
        Permission::READ | Permission::WRITE,
    );
    let _ = env_logger::builder().is_test(true).try_init();
    // Blocks far smaller than the basic block force sequence splits.
    let mut config = Config::new();
    config.code_block_size(512);
    let mut vm = Vm::new(&config, Box::new(memory));
    let mut gpr = vm.gpr_state().clone();
    gpr.set_sp(SP);
    vm.set_gpr_state(&gpr);
    vm.memory_mut().write_u64(SP, EXIT).unwrap();
    vm.add_instrumented_range(0x1000, 0x2000);
    let log = record_events(&mut vm);

    assert!(vm.run(0x1000, EXIT));

    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), BODY as u64);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_ENTRY), 1);
    assert_eq!(count(&log, VmEvent::BASIC_BLOCK_EXIT), 1);
    assert!(count(&log, VmEvent::SEQUENCE_ENTRY) >= 2);
    assert_eq!(
        count(&log, VmEvent::SEQUENCE_ENTRY),
        count(&log, VmEvent::SEQUENCE_EXIT)
    );
    // Every sequence of the walk reports the same basic-block end.
    let log = log.borrow();
    let ends: Vec<u64> = log
        .iter()
        .filter(|s| s.event.contains(VmEvent::SEQUENCE_EXIT))
        .map(|s| s.basic_block_end)
        .collect();
    assert!(ends.windows(2).all(|w| w[0] == w[1]));
}
