//! Bootstrap layer: from a guest image to an instrumented run.
//!
//! The preload plants a breakpoint trap over the program entry point, lets
//! startup code run natively until the trap fires, captures the CPU state
//! there, and hands an engine configured with that state to the embedder.
//! At every stage a user callback may take over; returning
//! [`PreloadStatus::NotHandled`] selects the default behavior, so an empty
//! [`PreloadCallbacks`] implementation reproduces the stock launch exactly.

use anyhow::{bail, Context as _, Result};
use graft::{Config, Vm};
use graft_asm::{lookup, FlatMemory, FprState, GprState, Gpr, Inst, Memory, NativeExit, Permission};

/// Size of the private stack reserved for the engine itself.
pub const SHADOW_STACK_SIZE: u64 = 0x80_0000;

/// Guest base address of the shadow-stack reservation.
pub const SHADOW_STACK_BASE: u64 = 0x7F00_0000_0000;

/// What a preload callback decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreloadStatus {
    /// Run the default behavior for this stage.
    NotHandled,
    /// The callback handled everything from this stage on; finish the
    /// launch with this exit status.
    Handled(i32),
}

/// User hooks around the launch stages. Every method defaults to
/// [`PreloadStatus::NotHandled`].
pub trait PreloadCallbacks {
    /// The entry point was resolved; the trap is not planted yet.
    fn on_start(&mut self, _entry: u64) -> PreloadStatus {
        PreloadStatus::NotHandled
    }

    /// The trap fired; the captured register state may be edited before the
    /// engine sees it.
    fn on_premain(&mut self, _gpr: &mut GprState, _fpr: &mut FprState) -> PreloadStatus {
        PreloadStatus::NotHandled
    }

    /// The program arguments, before the engine is built.
    fn on_main(&mut self, _argc: i32, _argv: &[String]) -> PreloadStatus {
        PreloadStatus::NotHandled
    }

    /// The engine is configured and loaded; the default runs it from
    /// `start` until `stop`.
    fn on_run(&mut self, _vm: &mut Vm, _start: u64, _stop: u64) -> PreloadStatus {
        PreloadStatus::NotHandled
    }

    /// The run finished with `status`.
    fn on_exit(&mut self, _status: i32) -> PreloadStatus {
        PreloadStatus::NotHandled
    }
}

/// Everything needed to launch a guest image.
pub struct LaunchSpec {
    pub memory: FlatMemory,
    /// Where startup code begins executing natively.
    pub start: u64,
    /// The entry point the trap guards (what startup code eventually calls).
    pub entry: u64,
    pub gpr: GprState,
    pub fpr: FprState,
    pub args: Vec<String>,
}

/// Run a guest image under instrumentation, walking the callback chain.
/// Returns the exit status.
pub fn launch(spec: LaunchSpec, callbacks: &mut dyn PreloadCallbacks) -> Result<i32> {
    let LaunchSpec {
        mut memory,
        start,
        entry,
        mut gpr,
        mut fpr,
        args,
    } = spec;
    let cpu = lookup("g64");

    if let PreloadStatus::Handled(status) = callbacks.on_start(entry) {
        return Ok(status);
    }

    // Plant the trap over the entry point, keeping the original byte.
    let saved = memory
        .read_u8(entry)
        .with_context(|| format!("entry point {entry:#x} is not mapped"))?;
    let mut trap = Vec::new();
    Inst::Brk.encode(&mut trap);
    memory.write_ignoring_permissions(entry, &trap);
    log::debug!("planted trap at entry point {entry:#x}");

    // Let startup code run natively until the trap fires.
    gpr.pc = start;
    match cpu.run_native(&mut gpr, &mut fpr, &mut memory, u64::MAX) {
        NativeExit::Breakpoint { address } if address == entry => {}
        NativeExit::Breakpoint { address } => {
            bail!("unexpected breakpoint at {address:#x} before the entry point")
        }
        other => bail!("startup code never reached the entry point: {other:?}"),
    }

    // Restore the original byte and capture the state at the trap.
    memory.write_ignoring_permissions(entry, &[saved]);
    log::debug!("entry point reached, captured CPU state at {:#x}", gpr.pc);

    if let PreloadStatus::Handled(status) = callbacks.on_premain(&mut gpr, &mut fpr) {
        return Ok(status);
    }

    // First instruction to run instrumented is the entry point; the last is
    // the return address startup code left on the guest stack.
    let first = gpr.pc;
    let last = memory
        .read_u64(gpr.sp())
        .context("no return address on the guest stack")?;

    // Reserve the engine's private stack away from the guest's. The
    // reference backend runs the engine on the host stack, so the
    // reservation only keeps the guest from mapping the region.
    memory.map_region(
        "[shadow-stack]",
        SHADOW_STACK_BASE,
        SHADOW_STACK_SIZE,
        Permission::READ | Permission::WRITE,
    );

    if let PreloadStatus::Handled(status) = callbacks.on_main(args.len() as i32, &args) {
        return Ok(status);
    }

    let mut vm = Vm::new(&Config::new(), Box::new(memory));
    if !vm.add_instrumented_module_from_addr(first) {
        bail!("entry point {first:#x} belongs to no executable mapping");
    }
    vm.set_gpr_state(&gpr);
    vm.set_fpr_state(&fpr);

    let status = match callbacks.on_run(&mut vm, first, last) {
        PreloadStatus::Handled(status) => status,
        PreloadStatus::NotHandled => {
            log::debug!("running [{first:#x}, {last:#x}] under instrumentation");
            vm.run(first, last);
            vm.gpr_state().reg(Gpr::new(0)) as i32
        }
    };

    match callbacks.on_exit(status) {
        PreloadStatus::Handled(overridden) => Ok(overridden),
        PreloadStatus::NotHandled => Ok(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        stages: Vec<&'static str>,
    }

    impl PreloadCallbacks for Recorder {
        fn on_start(&mut self, _entry: u64) -> PreloadStatus {
            self.stages.push("start");
            PreloadStatus::NotHandled
        }
        fn on_premain(&mut self, _gpr: &mut GprState, _fpr: &mut FprState) -> PreloadStatus {
            self.stages.push("premain");
            PreloadStatus::NotHandled
        }
        fn on_main(&mut self, _argc: i32, _argv: &[String]) -> PreloadStatus {
            self.stages.push("main");
            PreloadStatus::NotHandled
        }
        fn on_run(&mut self, _vm: &mut Vm, _start: u64, _stop: u64) -> PreloadStatus {
            self.stages.push("run");
            PreloadStatus::NotHandled
        }
        fn on_exit(&mut self, _status: i32) -> PreloadStatus {
            self.stages.push("exit");
            PreloadStatus::NotHandled
        }
    }

    fn spec() -> LaunchSpec {
        use graft_asm::asm::Assembler;
        let _ = env_logger::builder().is_test(true).try_init();
        let mut memory = FlatMemory::new();
        // _start: call main; brk
        let mut a = Assembler::new(0x1000);
        a.call_to(0x1100);
        a.brk();
        memory.map_image("app", 0x1000, &a.finish(), Permission::READ | Permission::EXEC);
        // main: mov r0, 7; ret
        let mut m = Assembler::new(0x1100);
        m.mov_imm(Gpr::new(0), 7);
        m.ret();
        memory.map_image("app-main", 0x1100, &m.finish(), Permission::READ | Permission::EXEC);
        memory.map_region(
            "[stack]",
            0x7000_0000,
            0x10000,
            Permission::READ | Permission::WRITE,
        );
        let mut gpr = GprState::default();
        gpr.set_sp(0x7000_8000);
        LaunchSpec {
            memory,
            start: 0x1000,
            entry: 0x1100,
            gpr,
            fpr: FprState::default(),
            args: Vec::new(),
        }
    }

    #[test]
    fn full_chain_runs_the_program_instrumented() {
        let mut recorder = Recorder { stages: Vec::new() };
        let status = launch(spec(), &mut recorder).unwrap();
        assert_eq!(status, 7);
        assert_eq!(recorder.stages, ["start", "premain", "main", "run", "exit"]);
    }

    #[test]
    fn handled_start_short_circuits() {
        struct Abort;
        impl PreloadCallbacks for Abort {
            fn on_start(&mut self, _entry: u64) -> PreloadStatus {
                PreloadStatus::Handled(3)
            }
        }
        assert_eq!(launch(spec(), &mut Abort).unwrap(), 3);
    }

    #[test]
    fn exit_status_can_be_overridden() {
        struct Override;
        impl PreloadCallbacks for Override {
            fn on_exit(&mut self, status: i32) -> PreloadStatus {
                PreloadStatus::Handled(status + 10)
            }
        }
        assert_eq!(launch(spec(), &mut Override).unwrap(), 17);
    }
}
