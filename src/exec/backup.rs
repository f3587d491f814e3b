//! The backup manager: a bounded, nested change-log for reverse stepping.
//!
//! While recording is enabled, the execution engine opens a new *instruction
//! frame* at every machine-cycle boundary and a new *micro record* before
//! every microinstruction. The execution context then reports the pre-change
//! value of every module a microinstruction touches, and the record keeps the
//! **first** value reported per module. Replaying a record therefore restores
//! each module to its value as of the start of that micro-step, even when a
//! step wrote the same module more than once.
//!
//! The log is a stack of frames; each frame is a stack of records; each
//! record maps touched modules to their prior values and carries the
//! control-unit [`Cursor`] captured just before its microinstruction ran.
//! Undoing a record replays the prior values and restores the cursor in
//! lock-step, so [`undo_one_micro`], [`undo_one_instruction`], and
//! [`undo_all`] walk execution backwards at the granularity their names say.
//!
//! # Bounded growth
//!
//! A runaway program would otherwise grow the log without limit, so the
//! manager suspends recording once it holds [`MAX_LOG_DEPTH`] frames or the
//! current frame holds that many records. Suspension is observable through
//! [`is_suspended`] and lifts on its own once the offending frame shrinks;
//! it bounds memory, it does not promise that every step stays undoable.
//!
//! Undo operations must only be invoked while no execution task is active.
//! The engine enforces this by construction: running consumes the engine, so
//! the log is unreachable until the run ends.
//!
//! [`undo_one_micro`]: BackupManager::undo_one_micro
//! [`undo_one_instruction`]: BackupManager::undo_one_instruction
//! [`undo_all`]: BackupManager::undo_all
//! [`is_suspended`]: BackupManager::is_suspended

use std::collections::HashMap;

use crate::exec::control::{ControlUnit, Cursor};
use crate::exec::observer::ModuleWatcher;
use crate::hardware::{BitId, RamId, RegId};
use crate::machine::Machine;
use crate::micro::{IoDirection, Micro};

/// Maximum number of instruction frames, and maximum number of micro records
/// per frame, before recording suspends.
pub const MAX_LOG_DEPTH: usize = 10_000;

/// The pre-change values captured for one microinstruction step, plus the
/// cursor position the step ran at.
#[derive(Debug, Clone)]
pub struct MicroRecord {
    cursor: Cursor,
    registers: HashMap<RegId, u64>,
    bits: HashMap<BitId, bool>,
    cells: HashMap<(RamId, u64), u64>,
}

impl MicroRecord {
    fn new(cursor: Cursor) -> Self {
        Self {
            cursor,
            registers: HashMap::new(),
            bits: HashMap::new(),
            cells: HashMap::new(),
        }
    }

    /// The cursor captured just before this record's microinstruction ran.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Whether the step touched no modules.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.bits.is_empty() && self.cells.is_empty()
    }

    /// The register's value as of the start of the step, if it was touched.
    pub fn prior_register(&self, id: RegId) -> Option<u64> {
        self.registers.get(&id).copied()
    }
    /// The bit's value as of the start of the step, if it was touched.
    pub fn prior_bit(&self, id: BitId) -> Option<bool> {
        self.bits.get(&id).copied()
    }
    /// The cell's value as of the start of the step, if it was touched.
    pub fn prior_cell(&self, ram: RamId, addr: u64) -> Option<u64> {
        self.cells.get(&(ram, addr)).copied()
    }
}

type InstrFrame = Vec<MicroRecord>;

/// Records per-step state deltas and replays them in reverse.
///
/// See the module docs for the log's structure and lifecycle.
#[derive(Debug, Default)]
pub struct BackupManager {
    frames: Vec<InstrFrame>,
    recording: bool,
    // True while the newest micro record is accepting first-write entries.
    // Cleared on frame/record boundaries, pops, and suspension.
    open_record: bool,
    // True when the last frame request was refused at the frame cap.
    // New records are not logged until a frame can be opened again.
    frames_full: bool,
}

impl BackupManager {
    /// Creates an empty log with recording disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables recording. While disabled, every recording hook
    /// is a no-op. Callers enable this for interactive debugging modes only.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
        self.open_record = false;
    }

    /// Whether recording is enabled.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether recording is currently suspended by the growth bound.
    pub fn is_suspended(&self) -> bool {
        self.frames_full
            || self.frames.len() >= MAX_LOG_DEPTH
            || self.frames.last().is_some_and(|f| f.len() >= MAX_LOG_DEPTH)
    }

    /// The number of instruction frames in the log.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The number of micro records in the current frame.
    pub fn record_count(&self) -> usize {
        self.frames.last().map_or(0, Vec::len)
    }

    /// Read-only peek at the most recent (possibly empty) micro record.
    pub fn latest_record(&self) -> Option<&MicroRecord> {
        self.frames.last()?.last()
    }

    // ------------------ RECORDING ------------------

    /// Opens a new instruction frame. Called at every transition to the
    /// start-of-machine-cycle state.
    pub fn start_instruction_frame(&mut self) {
        if !self.recording {
            return;
        }
        self.open_record = false;
        if self.frames.len() < MAX_LOG_DEPTH {
            self.frames.push(Vec::new());
            self.frames_full = false;
        } else {
            self.frames_full = true;
        }
    }

    /// Opens a new micro record tagged with `cursor`. Called at every
    /// transition to the start-of-microinstruction state; a no-op unless at
    /// least one frame exists.
    pub fn start_micro_record(&mut self, cursor: Cursor) {
        if !self.recording || self.frames_full {
            return;
        }
        self.open_record = false;
        let Some(frame) = self.frames.last_mut() else { return };
        if frame.len() < MAX_LOG_DEPTH {
            frame.push(MicroRecord::new(cursor));
            self.open_record = true;
        }
    }

    fn current(&mut self) -> Option<&mut MicroRecord> {
        if !self.recording || !self.open_record {
            return None;
        }
        self.frames.last_mut()?.last_mut()
    }

    /// Records a register's pre-change value; first write wins.
    pub fn record_register(&mut self, id: RegId, old: u64) {
        if let Some(record) = self.current() {
            let _ = record.registers.entry(id).or_insert(old);
        }
    }

    /// Records a bit's pre-change value; first write wins.
    pub fn record_bit(&mut self, id: BitId, old: bool) {
        if let Some(record) = self.current() {
            let _ = record.bits.entry(id).or_insert(old);
        }
    }

    /// Records a RAM cell's pre-change value; first write wins.
    pub fn record_ram_cell(&mut self, ram: RamId, addr: u64, old: u64) {
        if let Some(record) = self.current() {
            let _ = record.cells.entry((ram, addr)).or_insert(old);
        }
    }

    // ------------------ UNDO ------------------

    /// Steps execution backwards by one microinstruction.
    ///
    /// Pops the current record, replays its prior values into the machine
    /// (watchers are notified; re-recording is disabled for the duration),
    /// restores the control unit to the record's cursor, and runs the I/O
    /// inverse if the undone microinstruction was an I/O operation.
    ///
    /// Empty frames on top of the log are discarded along the way; with an
    /// empty log this is a no-op.
    pub fn undo_one_micro(
        &mut self,
        machine: &mut Machine,
        control: &mut ControlUnit,
        watchers: &mut [Box<dyn ModuleWatcher>],
    ) {
        self.open_record = false;
        loop {
            let Some(frame) = self.frames.last_mut() else { return };
            match frame.pop() {
                Some(record) => {
                    self.replay(record, machine, control, watchers);
                    return;
                }
                None => {
                    let _ = self.frames.pop();
                }
            }
        }
    }

    /// Steps execution backwards to the start of the current machine
    /// instruction, then discards its frame.
    pub fn undo_one_instruction(
        &mut self,
        machine: &mut Machine,
        control: &mut ControlUnit,
        watchers: &mut [Box<dyn ModuleWatcher>],
    ) {
        while self.frames.last().is_some_and(|f| !f.is_empty()) {
            self.undo_one_micro(machine, control, watchers);
        }
        let _ = self.frames.pop();
        self.open_record = false;
    }

    /// Steps execution backwards until the log is exhausted.
    pub fn undo_all(
        &mut self,
        machine: &mut Machine,
        control: &mut ControlUnit,
        watchers: &mut [Box<dyn ModuleWatcher>],
    ) {
        while !self.frames.is_empty() {
            self.undo_one_instruction(machine, control, watchers);
        }
    }

    /// Undoes everything, then clears the log entirely.
    ///
    /// Use this when the hardware topology itself changes (modules added or
    /// removed), since the log's module handles would otherwise go stale.
    pub fn flush(
        &mut self,
        machine: &mut Machine,
        control: &mut ControlUnit,
        watchers: &mut [Box<dyn ModuleWatcher>],
    ) {
        self.undo_all(machine, control, watchers);
        self.frames.clear();
        self.frames_full = false;
        self.open_record = false;
    }

    fn replay(
        &mut self,
        record: MicroRecord,
        machine: &mut Machine,
        control: &mut ControlUnit,
        watchers: &mut [Box<dyn ModuleWatcher>],
    ) {
        let was_recording = std::mem::replace(&mut self.recording, false);

        // I/O inverse first: the value an input step consumed is still in its
        // destination register at this point, so it can be pushed back before
        // the register itself is restored.
        let undone = machine
            .instruction(record.cursor.instr)
            .micros()
            .get(record.cursor.index)
            .copied();
        if let Some(micro_id) = undone {
            if let Micro::Io { direction, reg } = *machine.micro(micro_id) {
                match direction {
                    IoDirection::Input => {
                        let consumed = machine.register_value(reg);
                        machine.console.unread(consumed);
                    }
                    IoDirection::Output => machine.console.unwrite(),
                }
            }
        }

        for (&id, &old) in &record.registers {
            let current = machine.register_value(id);
            for w in watchers.iter_mut() {
                w.register_changed(id, current, old);
            }
            machine.set_register_value(id, old);
        }
        for (&id, &old) in &record.bits {
            let current = machine.bit_value(id);
            for w in watchers.iter_mut() {
                w.bit_changed(id, current, old);
            }
            machine.set_bit_value(id, old);
        }
        for (&(ram, addr), &old) in &record.cells {
            let current = machine.ram_value(ram, addr);
            for w in watchers.iter_mut() {
                w.ram_changed(ram, addr, current, old);
            }
            machine.set_ram_value(ram, addr, old);
        }

        control.restore(record.cursor);
        self.recording = was_recording;
    }
}
