//! Instrumentation rules observed through whole runs: per-instruction
//! callbacks, mid-run registration and configuration copies.

use graft::{Config, InstPosition, Vm, VmAction, VmEvent};
use graft_asm::asm::Assembler;
use graft_asm::{FlatMemory, Gpr, Permission};
use std::cell::RefCell;
use std::rc::Rc;

const STACK_BASE: u64 = 0x7000_0000;
const SP: u64 = 0x7000_8000;
const EXIT: u64 = 0xDEAD;

fn vm_with_image(image: &[u8], base: u64) -> Vm {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut memory = FlatMemory::new();
    memory.map_image("app", base, image, Permission::READ | Permission::EXEC);
    memory.map_region(
        "[stack]",
        STACK_BASE,
        0x10000,
        Permission::READ | Permission::WRITE,
    );
    let mut vm = Vm::new(&Config::new(), Box::new(memory));
    let mut gpr = vm.gpr_state().clone();
    gpr.set_sp(SP);
    vm.set_gpr_state(&gpr);
    vm.memory_mut().write_u64(SP, EXIT).unwrap();
    vm
}

#[test]
fn pre_and_post_instruction_callbacks() {
    // r0 = r1, where r1 only gets its value from the pre-inst callback.
    let mut a = Assembler::new(0x1000);
    a.mov_reg(Gpr::new(0), Gpr::new(1));
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    let pre = Rc::new(RefCell::new(Vec::new()));
    let pre_log = pre.clone();
    vm.add_code_range_cb(
        0x1000,
        0x1003,
        InstPosition::PreInst,
        Rc::new(move |vm: &mut Vm| {
            pre_log
                .borrow_mut()
                .push((vm.gpr_state().pc, vm.is_pre_inst()));
            vm.gpr_state_mut().set_reg(Gpr::new(1), 5);
            VmAction::Continue
        }),
    )
    .unwrap();

    let post = Rc::new(RefCell::new(Vec::new()));
    let post_log = post.clone();
    vm.add_code_range_cb(
        0x1000,
        0x1003,
        InstPosition::PostInst,
        Rc::new(move |vm: &mut Vm| {
            post_log.borrow_mut().push((
                vm.gpr_state().pc,
                vm.is_pre_inst(),
                vm.gpr_state().reg(Gpr::new(0)),
            ));
            VmAction::Continue
        }),
    )
    .unwrap();

    assert!(vm.run(0x1000, EXIT));
    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 5);
    // Pre-inst: PC names the instruction itself.
    assert_eq!(pre.borrow().as_slice(), &[(0x1000, true)]);
    // Post-inst: PC is past the instruction, and the write is visible.
    assert_eq!(post.borrow().as_slice(), &[(0x1003, false, 5)]);
    assert!(!vm.is_pre_inst());
}

#[test]
fn mid_run_rule_addition_evicts_and_retranslates() {
    let mut a = Assembler::new(0x1000);
    a.add_imm(Gpr::new(0), 1);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    // The block returns to itself once, then exits: two executions.
    vm.memory_mut().write_u64(SP, 0x1000).unwrap();
    vm.memory_mut().write_u64(SP + 8, EXIT).unwrap();

    let news = Rc::new(RefCell::new(0));
    let news_seen = news.clone();
    vm.add_vm_event_cb(
        VmEvent::BASIC_BLOCK_NEW,
        Rc::new(move |_, _| {
            *news_seen.borrow_mut() += 1;
            VmAction::Continue
        }),
    )
    .unwrap();

    let inst_hits = Rc::new(RefCell::new(Vec::new()));
    let armed = Rc::new(RefCell::new(false));
    let armed_flag = armed.clone();
    let hits = inst_hits.clone();
    vm.add_vm_event_cb(
        VmEvent::SEQUENCE_ENTRY,
        Rc::new(move |vm, _state| {
            if !*armed_flag.borrow() {
                *armed_flag.borrow_mut() = true;
                let hits = hits.clone();
                // Covers the currently-executing block: the eviction is
                // deferred, the current execution finishes untouched.
                vm.add_code_range_cb(
                    0x1000,
                    0x1001,
                    InstPosition::PreInst,
                    Rc::new(move |vm: &mut Vm| {
                        hits.borrow_mut().push((
                            vm.gpr_state().pc,
                            vm.is_pre_inst(),
                            vm.gpr_state().reg(Gpr::new(0)),
                        ));
                        VmAction::Continue
                    }),
                )
                .unwrap();
            }
            VmAction::Continue
        }),
    )
    .unwrap();

    assert!(vm.run(0x1000, EXIT));

    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 2);
    // Translated once without the rule, then retranslated with it.
    assert_eq!(*news.borrow(), 2);
    // The callback only saw the second execution, before its instruction.
    assert_eq!(inst_hits.borrow().as_slice(), &[(0x1000, true, 1)]);
}

#[test]
fn break_to_vm_from_a_pre_inst_callback_resumes_mid_block() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 1);
    a.add_imm(Gpr::new(0), 10);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    let calls = Rc::new(RefCell::new(0));
    let seen = calls.clone();
    vm.add_code_range_cb(
        0x1006,
        0x1007,
        InstPosition::PreInst,
        Rc::new(move |_vm: &mut Vm| {
            *seen.borrow_mut() += 1;
            if *seen.borrow() == 1 {
                VmAction::BreakToVm
            } else {
                VmAction::Continue
            }
        }),
    )
    .unwrap();

    assert!(vm.run(0x1000, EXIT));
    // The interrupted instruction re-entered through a derived sequence
    // and ran exactly once.
    assert_eq!(vm.gpr_state().reg(Gpr::new(0)), 11);
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn deleting_a_rule_invalidates_its_range() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 1);
    a.ret();
    let mut vm = vm_with_image(&a.finish(), 0x1000);
    vm.add_instrumented_range(0x1000, 0x1010);

    let hits = Rc::new(RefCell::new(0));
    let seen = hits.clone();
    let id = vm
        .add_code_range_cb(
            0x1000,
            0x1010,
            InstPosition::PreInst,
            Rc::new(move |_vm: &mut Vm| {
                *seen.borrow_mut() += 1;
                VmAction::Continue
            }),
        )
        .unwrap();

    let reset_stack = |vm: &mut Vm| {
        let mut gpr = vm.gpr_state().clone();
        gpr.set_sp(SP);
        vm.set_gpr_state(&gpr);
        vm.memory_mut().write_u64(SP, EXIT).unwrap();
    };

    assert!(vm.run(0x1000, EXIT));
    assert_eq!(*hits.borrow(), 2);

    assert!(vm.delete_instrumentation(id));
    assert!(!vm.delete_instrumentation(id));

    reset_stack(&mut vm);
    assert!(vm.run(0x1000, EXIT));
    // The rule is gone and its cached injections with it.
    assert_eq!(*hits.borrow(), 2);
}

#[test]
fn copied_configuration_behaves_like_the_original() {
    let mut a = Assembler::new(0x1000);
    a.mov_imm(Gpr::new(0), 0x2A);
    a.ret();
    let image = a.finish();

    let mut vm1 = vm_with_image(&image, 0x1000);
    vm1.add_instrumented_range(0x1000, 0x1010);
    let entries = Rc::new(RefCell::new(0));
    let seen = entries.clone();
    vm1.add_vm_event_cb(
        VmEvent::BASIC_BLOCK_ENTRY,
        Rc::new(move |_, _| {
            *seen.borrow_mut() += 1;
            VmAction::Continue
        }),
    )
    .unwrap();

    let mut vm2 = vm_with_image(&image, 0x1000);
    vm2.copy_configuration_from(&vm1);
    assert_eq!(vm2.event_mask(), vm1.event_mask());

    // The copy carried states too; only the stack slot needs refreshing.
    vm2.memory_mut().write_u64(SP, EXIT).unwrap();
    assert!(vm2.run(0x1000, EXIT));
    assert_eq!(vm2.gpr_state().reg(Gpr::new(0)), 0x2A);
    assert_eq!(*entries.borrow(), 1);
}
