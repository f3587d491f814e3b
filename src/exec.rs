//! Execution: the run-mode state machine driving fetch/decode/execute.
//!
//! This module consists of:
//! - [`ExecutionEngine`]: The struct that drives microinstruction execution.
//! - [`control`]: The module handling the control-unit cursor.
//! - [`backup`]: The module handling the reversible undo log.
//! - [`observer`]: The module handling module-change watchers.
//!
//! # Usage
//!
//! An engine wraps a fully-formed [`Machine`] and executes it at
//! microinstruction granularity:
//!
//! ```
//! use ucodesim::hardware::MachineInitStrategy;
//! use ucodesim::machine::Machine;
//! use ucodesim::micro::{MemDirection, Micro};
//! use ucodesim::exec::{EngineState, ExecutionEngine, RunMode};
//!
//! let mut m = Machine::new("demo", MachineInitStrategy::default());
//! let pc = m.add_register("pc", 16);
//! let mar = m.add_register("mar", 16);
//! let mdr = m.add_register("mdr", 16);
//! let ir = m.add_register("ir", 16);
//! let acc = m.add_register("acc", 16);
//! let main = m.add_ram("main", 16, 64);
//! let halt = m.add_condition_bit("halt", true);
//!
//! let f0 = m.add_micro(Micro::Transfer { src: pc, dest: mar });
//! let f1 = m.add_micro(Micro::MemAccess { direction: MemDirection::Read, ram: main, data: mdr, address: mar });
//! let f2 = m.add_micro(Micro::Transfer { src: mdr, dest: ir });
//! let f3 = m.add_micro(Micro::Increment { dest: pc, delta: 1 });
//! let f4 = m.add_micro(Micro::Decode { ir });
//! m.set_fetch_sequence(vec![f0, f1, f2, f3, f4]);
//!
//! let inc = m.add_micro(Micro::Increment { dest: acc, delta: 1 });
//! let stop = m.add_micro(Micro::SetCondBit { bit: halt, value: true });
//! let end = m.end();
//! m.add_instruction("INC", 1, vec![inc, end]);
//! m.add_instruction("HALT", 0, vec![stop, end]);
//! m.load_program(main, 0, &[1, 1, 0]);
//!
//! let mut engine = ExecutionEngine::new(m);
//! let events = engine.subscribe();
//!
//! let handle = engine.execute(RunMode::Run);
//! let engine = handle.join();
//!
//! assert_eq!(engine.machine.register_value(acc), 2);
//! let last = events.try_iter().last().unwrap();
//! assert_eq!(last, EngineState::ExecutionHalted { halted_normally: true });
//! ```
//!
//! # Run modes
//!
//! The caller picks a [`RunMode`] when starting a run and can write `Stop` or
//! `Abort` into the engine's [`ModeCell`] at any point; the loop polls the
//! cell between microinstruction steps (cooperative cancellation, nothing is
//! preempted). A misbehaving `execute` that never returns cannot be
//! interrupted.
//!
//! `CommandLine` is the exception to the background-thread rule: it runs the
//! same loop synchronously on the caller's thread with no state publication,
//! via [`ExecutionEngine::run_command_line`].
//!
//! # Observing a run
//!
//! [`ExecutionEngine::subscribe`] hands back a channel receiver carrying
//! every [`EngineState`] transition in loop order. Delivery happens
//! synchronously from the execution thread, so a subscriber must not block
//! for long and must treat messages as coming from a foreign thread. To
//! unsubscribe, drop the receiver; the engine prunes dead subscriptions on
//! the next publication.
//!
//! Watchers (see [`observer`]) are the other observation surface: they see
//! every hardware mutation, while subscribers see execution transitions.
//!
//! # Stepping backwards
//!
//! With recording enabled (`engine.backup.set_recording(true)`), every step
//! logs enough to run in reverse; see [`backup`]. Undo entry points live on
//! the engine and are only reachable while no run is active, because a run
//! consumes the engine until joined.
//!
//! [`Machine`]: crate::machine::Machine

pub mod backup;
pub mod control;
pub mod observer;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cbc;

use crate::hardware::RamId;
use crate::machine::{InstrId, Machine};
use crate::micro::{ExecCtx, ExecError, Fault};

use self::control::{ControlUnit, Cursor};
use self::backup::BackupManager;
use self::observer::ModuleWatcher;

/// The caller-controlled execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunMode {
    /// Run continuously until a stopping condition.
    Run = 0,
    /// Execute one microinstruction, then stop.
    StepByMicro = 1,
    /// Execute up to and including the next `End`, then stop.
    StepByInstruction = 2,
    /// Run continuously, publishing a transition at every machine cycle
    /// (for observers that animate per-cycle).
    RunAndFireCycles = 3,
    /// Finish the current step, then end the run.
    Stop = 4,
    /// Finish the current step, then end the run; reported distinctly.
    Abort = 5,
    /// Run synchronously on the caller's thread with no state publication.
    CommandLine = 6,
}

/// The engine's run mode, shared between the execution thread (which polls
/// it every iteration) and the controlling caller (which writes it).
#[derive(Debug, Clone)]
pub struct ModeCell(Arc<AtomicU8>);

impl ModeCell {
    fn new(mode: RunMode) -> Self {
        Self(Arc::new(AtomicU8::new(mode as u8)))
    }

    /// Reads the current run mode.
    pub fn load(&self) -> RunMode {
        match self.0.load(Ordering::Relaxed) {
            0 => RunMode::Run,
            1 => RunMode::StepByMicro,
            2 => RunMode::StepByInstruction,
            3 => RunMode::RunAndFireCycles,
            4 => RunMode::Stop,
            5 => RunMode::Abort,
            _ => RunMode::CommandLine,
        }
    }

    /// Writes a new run mode. `Stop` and `Abort` are the sanctioned ways to
    /// end a run early.
    pub fn store(&self, mode: RunMode) {
        self.0.store(mode as u8, Ordering::Relaxed);
    }
}

/// One state of the execution state machine.
///
/// Exactly one state is current at any time; transitions are published to
/// subscribers in the order the loop produces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// No execution has started yet.
    NeverRun,
    /// A run just started; `continuous` is true for [`RunMode::Run`].
    StartOfExecuteThread {
        /// Whether the run is a continuous one.
        continuous: bool,
    },
    /// The loop is at the start of a machine cycle (fetch sequence, index 0).
    /// Not published while in continuous [`RunMode::Run`].
    StartOfMachineCycle,
    /// A microinstruction is about to execute. Only published while the undo
    /// log is recording.
    StartOfMicroinstruction {
        /// The cursor position of the step about to run.
        cursor: Cursor,
    },
    /// A memory access touched a breakpointed address; the run paused.
    Break {
        /// The RAM holding the breakpoint.
        ram: RamId,
        /// The breakpointed address.
        addr: u64,
    },
    /// An execution error or a definition fault ended the run.
    ExceptionThrown {
        /// A rendered diagnostic for the presentation layer.
        message: String,
    },
    /// The run ended because the caller requested an abort.
    ExecutionAborted {
        /// Whether a halt condition bit was set when the run ended.
        halted_normally: bool,
    },
    /// The run ended (stop request, halt bit, or end of stepping).
    ExecutionHalted {
        /// Whether a halt condition bit was set when the run ended.
        halted_normally: bool,
    },
    /// A single-micro step finished.
    HaltedStepByMicro {
        /// Whether a halt condition bit was set when the step ended.
        halted_normally: bool,
    },
}

/// A handle to a run executing on its background thread.
///
/// The engine (and with it the machine) has moved into the thread; joining
/// hands it back. This is what enforces the single-writer rule: while a run
/// is active, nothing else can reach the machine's mutable state.
#[derive(Debug)]
pub struct ExecutionHandle {
    thread: JoinHandle<ExecutionEngine>,
    mode: ModeCell,
}

impl ExecutionHandle {
    /// The shared run-mode cell for this run.
    pub fn mode_cell(&self) -> ModeCell {
        self.mode.clone()
    }

    /// Requests that the run stop after the current step.
    pub fn stop(&self) {
        self.mode.store(RunMode::Stop);
    }

    /// Requests that the run abort after the current step.
    pub fn abort(&self) {
        self.mode.store(RunMode::Abort);
    }

    /// Blocks until the run ends and returns the engine.
    pub fn join(self) -> ExecutionEngine {
        match self.thread.join() {
            Ok(engine) => engine,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Executes a machine definition at microinstruction granularity.
pub struct ExecutionEngine {
    // ------------------ SIMULATION STATE ------------------

    /// The machine being executed.
    pub machine: Machine,

    /// The control-unit cursor.
    pub control: ControlUnit,

    /// The undo log.
    pub backup: BackupManager,

    // ------------------ CONTROL & OBSERVATION ------------------

    /// Shared run mode, polled every loop iteration.
    mode: ModeCell,

    /// The current engine state; the last published transition.
    state: EngineState,

    /// Hardware-change watchers, invoked on every module mutation.
    watchers: Vec<Box<dyn ModuleWatcher>>,

    /// State-transition subscribers.
    subscribers: Vec<cbc::Sender<EngineState>>,

    /// The number of microinstructions executed since the engine was created.
    micros_run: u64,

    /// Sum of the declared cycle costs of executed microinstructions.
    cycles_elapsed: u64,
}

impl ExecutionEngine where ExecutionEngine: Send {} // engines move into run threads

impl ExecutionEngine {
    /// Creates an engine around a machine, with the cursor at the start of
    /// the fetch sequence and recording disabled.
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            control: ControlUnit::new(),
            backup: BackupManager::new(),
            mode: ModeCell::new(RunMode::Stop),
            state: EngineState::NeverRun,
            watchers: Vec::new(),
            subscribers: Vec::new(),
            micros_run: 0,
            cycles_elapsed: 0,
        }
    }

    /// The current engine state (the last published transition).
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// The shared run-mode cell. Clones of it keep working across runs.
    pub fn mode_cell(&self) -> ModeCell {
        self.mode.clone()
    }

    /// The number of microinstructions executed so far.
    pub fn micros_run(&self) -> u64 {
        self.micros_run
    }

    /// The summed declared cycle cost of the microinstructions executed
    /// so far. Reporting metadata only.
    pub fn cycles_elapsed(&self) -> u64 {
        self.cycles_elapsed
    }

    /// Registers a hardware-change watcher.
    pub fn add_watcher(&mut self, watcher: impl ModuleWatcher) {
        self.watchers.push(Box::new(watcher));
    }

    /// Subscribes to engine-state transitions.
    ///
    /// Transitions arrive in loop order, delivered synchronously from the
    /// execution thread. Drop the receiver to unsubscribe.
    pub fn subscribe(&mut self) -> cbc::Receiver<EngineState> {
        let (tx, rx) = cbc::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, state: EngineState) {
        self.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
        self.state = state;
    }

    /// Starts a run on a dedicated background thread.
    ///
    /// The engine moves into the thread; use the returned handle to request
    /// a stop or abort and to join the run and get the engine back. For
    /// [`RunMode::CommandLine`], use [`ExecutionEngine::run_command_line`]
    /// instead (passing it here runs the loop on the background thread
    /// without publications).
    pub fn execute(mut self, mode: RunMode) -> ExecutionHandle {
        self.mode.store(mode);
        let mode_cell = self.mode.clone();
        let thread = std::thread::spawn(move || {
            let _ = self.run_loop(mode != RunMode::CommandLine);
            self
        });
        ExecutionHandle { thread, mode: mode_cell }
    }

    /// Runs the loop synchronously on the caller's thread, publishing no
    /// state transitions.
    ///
    /// An execution error is returned directly instead of being published,
    /// so a command-line caller can terminate its flow on it.
    pub fn run_command_line(&mut self) -> Result<(), ExecError> {
        self.mode.store(RunMode::CommandLine);
        self.run_loop(false)
    }

    /// The fetch/execute loop.
    ///
    /// With `events` set, transitions are published and failures are
    /// reported through them (the returned result is always `Ok`). Without
    /// it, nothing is published, the undo log is not engaged, and execution
    /// errors are returned to the caller.
    fn run_loop(&mut self, events: bool) -> Result<(), ExecError> {
        let initial_mode = self.mode.load();
        if events {
            self.publish(EngineState::StartOfExecuteThread {
                continuous: initial_mode == RunMode::Run,
            });
        }

        loop {
            let mode = self.mode.load();
            if matches!(mode, RunMode::Stop | RunMode::Abort) {
                break;
            }
            if self.machine.halt_bit_set() {
                break;
            }

            let instr = self.control.current_instruction();
            let index = self.control.micro_index();
            let micro_count = self.machine.instruction(instr).micros().len();

            // Definition fault: the cursor left the instruction's range
            // without reaching an End. Never silently ignored.
            if index >= micro_count {
                let err = ExecError::MicroIndexOutOfRange {
                    instruction: self.machine.instruction(instr).name().to_string(),
                    index,
                    len: micro_count,
                };
                if !events {
                    return Err(err);
                }
                self.publish(EngineState::ExceptionThrown { message: err.to_string() });
                break;
            }

            if events && mode != RunMode::Run && index == 0 && instr == InstrId::Fetch {
                self.publish(EngineState::StartOfMachineCycle);
                self.backup.start_instruction_frame();
            }
            if events && self.backup.is_recording() {
                let cursor = self.control.snapshot();
                self.publish(EngineState::StartOfMicroinstruction { cursor });
                self.backup.start_micro_record(cursor);
            }

            let before = self.control.snapshot();
            self.control.advance(1);

            let micro_id = self.machine.instruction(instr).micros()[index];
            let micro = self.machine.micro(micro_id).clone();

            let mut ctx = ExecCtx {
                machine: &mut self.machine,
                control: &mut self.control,
                backup: &mut self.backup,
                watchers: &mut self.watchers,
            };
            match micro.execute(&mut ctx) {
                Ok(()) => {}
                Err(Fault::Error(err)) => {
                    if !events {
                        self.control.restore(before);
                        return Err(err);
                    }
                    self.publish(EngineState::ExceptionThrown { message: err.to_string() });
                    self.control.restore(before);
                    return Ok(());
                }
                Err(Fault::Break { ram, addr }) => {
                    if events {
                        self.publish(EngineState::Break { ram, addr });
                    }
                    self.mode.store(RunMode::Stop);
                }
            }

            self.micros_run += 1;
            self.cycles_elapsed += micro.cycles();

            match mode {
                RunMode::StepByMicro => self.mode.store(RunMode::Stop),
                RunMode::StepByInstruction if micro.is_end() => self.mode.store(RunMode::Stop),
                _ => {}
            }
        }

        if events {
            let halted_normally = self.machine.halt_bit_set();
            if self.mode.load() == RunMode::Abort {
                self.publish(EngineState::ExecutionAborted { halted_normally });
            } else if initial_mode == RunMode::StepByMicro {
                self.publish(EngineState::HaltedStepByMicro { halted_normally });
            } else if !matches!(self.state, EngineState::Break { .. }) {
                self.publish(EngineState::ExecutionHalted { halted_normally });
            }
        }
        Ok(())
    }

    // ------------------ UNDO ------------------
    // Reachable only while no run is active (a run consumes the engine).

    /// Steps execution backwards by one microinstruction.
    pub fn undo_one_micro(&mut self) {
        self.backup.undo_one_micro(&mut self.machine, &mut self.control, &mut self.watchers);
    }

    /// Steps execution backwards to the start of the current machine
    /// instruction.
    pub fn undo_one_instruction(&mut self) {
        self.backup.undo_one_instruction(&mut self.machine, &mut self.control, &mut self.watchers);
    }

    /// Steps execution backwards until the undo log is exhausted.
    pub fn undo_all(&mut self) {
        self.backup.undo_all(&mut self.machine, &mut self.control, &mut self.watchers);
    }

    /// Undoes everything and clears the undo log. Required after the
    /// hardware topology changes, since logged module handles go stale.
    pub fn flush_backups(&mut self) {
        self.backup.flush(&mut self.machine, &mut self.control, &mut self.watchers);
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("machine", &self.machine.name())
            .field("state", &self.state)
            .field("micros_run", &self.micros_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{BitId, MachineInitStrategy, RamId, RegId};
    use crate::micro::{ArithOp, IoDirection, MemDirection, Micro};

    /// A small accumulator machine.
    ///
    /// Fetch: mar <- pc; mdr <- main[mar]; ir <- mdr; pc += 1; decode ir.
    /// Opcodes: 0 HALT, 1 INC (acc += 1), 2 JZ (pc <- 0), 3 DIVZ (acc / zero),
    /// 4 IN (acc <- console), 5 BAD (no End, runs off the micro list).
    struct Fixture {
        machine: Machine,
        pc: RegId,
        mar: RegId,
        mdr: RegId,
        ir: RegId,
        acc: RegId,
        zero: RegId,
        main: RamId,
        halt: BitId,
    }

    fn fixture(program: &[u64]) -> Fixture {
        let mut m = Machine::new("fixture", MachineInitStrategy::default());
        let pc = m.add_register("pc", 16);
        let mar = m.add_register("mar", 16);
        let mdr = m.add_register("mdr", 16);
        let ir = m.add_register("ir", 16);
        let acc = m.add_register("acc", 16);
        let zero = m.add_register("zero", 16);
        let main = m.add_ram("main", 16, 64);
        let halt = m.add_condition_bit("halt", true);

        let f0 = m.add_micro(Micro::Transfer { src: pc, dest: mar });
        let f1 = m.add_micro(Micro::MemAccess {
            direction: MemDirection::Read,
            ram: main,
            data: mdr,
            address: mar,
        });
        let f2 = m.add_micro(Micro::Transfer { src: mdr, dest: ir });
        let f3 = m.add_micro(Micro::Increment { dest: pc, delta: 1 });
        let f4 = m.add_micro(Micro::Decode { ir });
        m.set_fetch_sequence(vec![f0, f1, f2, f3, f4]);

        let end = m.end();
        let set_halt = m.add_micro(Micro::SetCondBit { bit: halt, value: true });
        let inc = m.add_micro(Micro::Increment { dest: acc, delta: 1 });
        let jz = m.add_micro(Micro::Set { dest: pc, value: 0 });
        let divz = m.add_micro(Micro::Arithmetic { op: ArithOp::Div, lhs: acc, rhs: zero, dest: acc });
        let input = m.add_micro(Micro::Io { direction: IoDirection::Input, reg: acc });

        let _ = m.add_instruction("HALT", 0, vec![set_halt, end]);
        let _ = m.add_instruction("INC", 1, vec![inc, end]);
        let _ = m.add_instruction("JZ", 2, vec![jz, end]);
        let _ = m.add_instruction("DIVZ", 3, vec![divz, end]);
        let _ = m.add_instruction("IN", 4, vec![input, end]);
        let _ = m.add_instruction("BAD", 5, vec![inc]);

        m.set_program_counter(pc);
        m.set_code_store(main);
        m.load_program(main, 0, program);

        Fixture { machine: m, pc, mar, mdr, ir, acc, zero, main, halt }
    }

    fn run_to_completion(fx: Fixture, mode: RunMode) -> (ExecutionEngine, Vec<EngineState>) {
        let mut engine = ExecutionEngine::new(fx.machine);
        let events = engine.subscribe();
        let engine = engine.execute(mode).join();
        (engine, events.try_iter().collect())
    }

    #[test]
    fn test_run_to_halt() {
        let fx = fixture(&[1, 1, 1, 0]);
        let acc = fx.acc;
        let (engine, events) = run_to_completion(fx, RunMode::Run);

        assert_eq!(engine.machine.register_value(acc), 3);
        assert_eq!(events.first(), Some(&EngineState::StartOfExecuteThread { continuous: true }));
        assert_eq!(events.last(), Some(&EngineState::ExecutionHalted { halted_normally: true }));
        // Continuous runs publish no per-cycle transitions.
        assert!(!events.contains(&EngineState::StartOfMachineCycle));
    }

    #[test]
    fn test_run_and_fire_cycles_publishes_each_cycle() {
        let fx = fixture(&[1, 0]);
        let (engine, events) = run_to_completion(fx, RunMode::RunAndFireCycles);

        let cycles = events.iter().filter(|e| **e == EngineState::StartOfMachineCycle).count();
        assert_eq!(cycles, 2); // one per fetched instruction
        assert_eq!(engine.state(), &EngineState::ExecutionHalted { halted_normally: true });
    }

    #[test]
    fn test_step_by_micro_executes_exactly_one() {
        let fx = fixture(&[1, 0]);
        let pc = fx.pc;
        let mar = fx.mar;

        let mut engine = ExecutionEngine::new(fx.machine);
        engine.backup.set_recording(true);

        let engine = engine.execute(RunMode::StepByMicro).join();
        assert_eq!(engine.micros_run(), 1);
        assert_eq!(engine.mode_cell().load(), RunMode::Stop);
        assert_eq!(engine.state(), &EngineState::HaltedStepByMicro { halted_normally: false });
        // Only the first fetch micro ran.
        assert_eq!(engine.machine.register_value(mar), 0);
        assert_eq!(engine.machine.register_value(pc), 0);
        assert_eq!(engine.control.micro_index(), 1);

        // Stepping again executes exactly one more, regardless of prior state.
        let engine = engine.execute(RunMode::StepByMicro).join();
        assert_eq!(engine.micros_run(), 2);
        assert_eq!(engine.state(), &EngineState::HaltedStepByMicro { halted_normally: false });
    }

    #[test]
    fn test_step_by_instruction_stops_after_end() {
        let fx = fixture(&[1, 1, 0]);
        let acc = fx.acc;

        let engine = ExecutionEngine::new(fx.machine);
        let engine = engine.execute(RunMode::StepByInstruction).join();

        // Five fetch micros plus INC and End.
        assert_eq!(engine.micros_run(), 7);
        assert_eq!(engine.machine.register_value(acc), 1);
        assert_eq!(engine.control.snapshot(), Cursor { instr: InstrId::Fetch, index: 0 });
        assert_eq!(engine.state(), &EngineState::ExecutionHalted { halted_normally: false });
    }

    #[test]
    fn test_abort_is_reported_distinctly() {
        // INC then JZ back to 0: runs forever until aborted.
        let fx = fixture(&[1, 2]);
        let engine = ExecutionEngine::new(fx.machine);

        let handle = engine.execute(RunMode::Run);
        handle.abort();
        let engine = handle.join();

        assert_eq!(engine.state(), &EngineState::ExecutionAborted { halted_normally: false });
    }

    #[test]
    fn test_stop_requested_externally() {
        let fx = fixture(&[1, 2]);
        let engine = ExecutionEngine::new(fx.machine);

        let handle = engine.execute(RunMode::Run);
        handle.stop();
        let engine = handle.join();

        assert_eq!(engine.state(), &EngineState::ExecutionHalted { halted_normally: false });
    }

    #[test]
    fn test_breakpoint_pauses_then_resumes() {
        let fx = fixture(&[1, 1, 1, 0]);
        let acc = fx.acc;
        let main = fx.main;

        let mut engine = ExecutionEngine::new(fx.machine);
        engine.machine.ram_mut(main).set_breakpoint(2);
        let events = engine.subscribe();

        let engine = engine.execute(RunMode::Run).join();
        assert_eq!(engine.state(), &EngineState::Break { ram: main, addr: 2 });
        assert_eq!(engine.mode_cell().load(), RunMode::Stop);
        let collected: Vec<_> = events.try_iter().collect();
        // Break is terminal for this run; no halt transition follows it.
        assert_eq!(collected.last(), Some(&EngineState::Break { ram: main, addr: 2 }));

        // Resuming completes the program with nothing lost.
        let engine = engine.execute(RunMode::Run).join();
        assert_eq!(engine.state(), &EngineState::ExecutionHalted { halted_normally: true });
        assert_eq!(engine.machine.register_value(acc), 3);
    }

    #[test]
    fn test_micro_index_out_of_range_is_fatal() {
        // Opcode 5 has no End; its cursor runs off the micro list.
        let fx = fixture(&[5]);
        let (engine, events) = run_to_completion(fx, RunMode::Run);

        let message = events.iter().find_map(|e| match e {
            EngineState::ExceptionThrown { message } => Some(message.clone()),
            _ => None,
        });
        let message = message.expect("definition fault should be reported");
        assert!(message.contains("out of range"), "unexpected diagnostic: {message}");

        // The cursor is left where the fault was detected.
        assert_eq!(engine.control.current_instruction(), InstrId::Op(5));
        assert_eq!(engine.control.micro_index(), 1);
    }

    #[test]
    fn test_execution_error_restores_cursor() {
        let fx = fixture(&[3]);
        let (engine, events) = run_to_completion(fx, RunMode::Run);

        assert_eq!(
            events.last(),
            Some(&EngineState::ExceptionThrown {
                message: "microinstruction divided by zero".to_string()
            })
        );
        // Restored to the faulting step so a resume or undo stays consistent.
        assert_eq!(engine.control.snapshot(), Cursor { instr: InstrId::Op(3), index: 0 });
    }

    #[test]
    fn test_undo_round_trip_restores_everything() {
        let fx = fixture(&[1, 1, 0]);
        let regs = [fx.pc, fx.mar, fx.mdr, fx.ir, fx.acc, fx.zero];

        let mut engine = ExecutionEngine::new(fx.machine);
        engine.backup.set_recording(true);

        // Two full instructions, then unwind them both.
        let engine = engine.execute(RunMode::StepByInstruction).join();
        let mut engine = engine.execute(RunMode::StepByInstruction).join();
        assert_eq!(engine.machine.register_value(fx.acc), 2);
        assert_eq!(engine.backup.frame_count(), 2);

        engine.undo_all();

        for reg in regs {
            assert_eq!(engine.machine.register_value(reg), 0, "register {reg:?} not restored");
        }
        assert!(!engine.machine.bit_value(fx.halt));
        assert_eq!(engine.control.snapshot(), Cursor { instr: InstrId::Fetch, index: 0 });
        assert_eq!(engine.backup.frame_count(), 0);
    }

    #[test]
    fn test_undo_one_micro_steps_backwards() {
        let fx = fixture(&[1, 0]);
        let pc = fx.pc;

        let mut engine = ExecutionEngine::new(fx.machine);
        engine.backup.set_recording(true);

        // Step through mar <- pc, the fetch read, ir <- mdr, and pc += 1.
        for _ in 0..4 {
            engine = engine.execute(RunMode::StepByMicro).join();
        }
        assert_eq!(engine.machine.register_value(pc), 1);
        assert_eq!(engine.control.micro_index(), 4);

        engine.undo_one_micro();
        assert_eq!(engine.machine.register_value(pc), 0);
        assert_eq!(engine.control.micro_index(), 3);

        engine.undo_one_micro();
        assert_eq!(engine.control.micro_index(), 2);
    }

    #[test]
    fn test_undo_reverses_console_input() {
        let fx = fixture(&[4, 0]);
        let acc = fx.acc;

        let mut engine = ExecutionEngine::new(fx.machine);
        engine.machine.console.queue_input([55]);
        engine.backup.set_recording(true);

        let mut engine = engine.execute(RunMode::StepByInstruction).join();
        assert_eq!(engine.machine.register_value(acc), 55);
        assert_eq!(engine.machine.console.pending_input(), 0);

        engine.undo_one_instruction();
        assert_eq!(engine.machine.register_value(acc), 0);
        assert_eq!(engine.machine.console.pending_input(), 1);
        assert_eq!(engine.control.snapshot(), Cursor { instr: InstrId::Fetch, index: 0 });

        // Replaying forward consumes the restored input again.
        let engine = engine.execute(RunMode::StepByInstruction).join();
        assert_eq!(engine.machine.register_value(acc), 55);
    }

    #[test]
    fn test_command_line_matches_interactive_run() {
        let program = &[1, 1, 1, 0];

        let fx = fixture(program);
        let regs = [fx.pc, fx.mar, fx.mdr, fx.ir, fx.acc, fx.zero];
        let mut cli_engine = ExecutionEngine::new(fx.machine);
        cli_engine.run_command_line().unwrap();

        let fx = fixture(program);
        let mut engine = ExecutionEngine::new(fx.machine);
        let _discard = engine.subscribe();
        let engine = engine.execute(RunMode::Run).join();

        for reg in regs {
            assert_eq!(
                cli_engine.machine.register_value(reg),
                engine.machine.register_value(reg),
                "register {reg:?} diverged between modes"
            );
        }
        for addr in 0..engine.machine.ram(fx.main).size() {
            assert_eq!(
                cli_engine.machine.ram_value(fx.main, addr),
                engine.machine.ram_value(fx.main, addr),
            );
        }
        // Command-line mode publishes nothing; its state never leaves NeverRun.
        assert_eq!(cli_engine.state(), &EngineState::NeverRun);
    }

    #[test]
    fn test_command_line_returns_errors_directly() {
        let fx = fixture(&[3]);
        let mut engine = ExecutionEngine::new(fx.machine);

        let err = engine.run_command_line().unwrap_err();
        assert_eq!(err, ExecError::DivideByZero);
    }

    #[test]
    fn test_watchers_observe_run_and_undo() {
        use crate::exec::observer::ChangeLog;

        let fx = fixture(&[1, 0]);
        let acc = fx.acc;

        let log = ChangeLog::new();
        let mut engine = ExecutionEngine::new(fx.machine);
        engine.add_watcher(log.clone());
        engine.backup.set_recording(true);

        let mut engine = engine.execute(RunMode::StepByInstruction).join();
        assert!(log.touched_registers().contains(&acc));

        log.clear();
        engine.undo_one_instruction();
        // Undo replays values through the same notification surface.
        assert!(log.touched_registers().contains(&acc));
    }

    #[test]
    fn test_recording_only_logs_with_a_frame() {
        let fx = fixture(&[1, 0]);

        let engine = ExecutionEngine::new(fx.machine);
        // Recording off: stepping logs nothing.
        let mut engine = engine.execute(RunMode::StepByMicro).join();
        assert_eq!(engine.backup.frame_count(), 0);

        // Turning recording on mid-instruction: no frame opens until the
        // next machine-cycle boundary, so nothing is logged yet.
        engine.backup.set_recording(true);
        let engine = engine.execute(RunMode::StepByMicro).join();
        assert_eq!(engine.backup.frame_count(), 0);
    }
}
