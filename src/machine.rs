//! The machine definition: modules, microinstructions, and instructions.
//!
//! A [`Machine`] bundles everything the execution engine needs:
//! - the hardware module tables (registers, register arrays, RAMs, condition bits),
//! - the microinstruction table (with the built-in [`End`] and [`Comment`] entries),
//! - the machine instruction list and the fetch sequence,
//! - the [`Console`] used by I/O microinstructions.
//!
//! Machine definitions are produced by external tooling (editors, loaders);
//! the execution engine only ever reads and writes module *values*. The
//! `add_*` methods here are that external surface.
//!
//! ```
//! use ucodesim::hardware::MachineInitStrategy;
//! use ucodesim::machine::Machine;
//! use ucodesim::micro::Micro;
//!
//! let mut m = Machine::new("counter", MachineInitStrategy::default());
//! let acc = m.add_register("acc", 16);
//! let inc = m.add_micro(Micro::Increment { dest: acc, delta: 1 });
//! let end = m.end();
//! m.add_instruction("INC", 1, vec![inc, end]);
//!
//! assert_eq!(m.register(acc).width(), 16);
//! assert!(m.micro(end).is_end());
//! ```
//!
//! # Mutating values
//!
//! The `set_*_value` methods on `Machine` write *directly*, without invoking
//! the change-notification hook. They are meant for definition-time setup and
//! for the undo log's replay. During execution, all writes go through
//! [`ExecCtx`], which records and notifies before applying.
//!
//! [`End`]: crate::micro::Micro::End
//! [`Comment`]: crate::micro::Micro::Comment
//! [`ExecCtx`]: crate::micro::ExecCtx

use std::collections::VecDeque;

use crate::hardware::{
    ArrayId, BitId, CellFiller, ConditionBit, MachineInitStrategy, Ram, RamId, RegId, Register,
    RegisterArray,
};
use crate::micro::Micro;

/// Handle to a microinstruction in the machine's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MicroId(pub(crate) usize);

/// Handle to a machine instruction.
///
/// The fetch sequence has its own variant: it is the implicit first
/// instruction of every machine cycle and is never user-selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrId {
    /// The fetch sequence.
    Fetch,
    /// The `n`-th user-defined machine instruction.
    Op(usize),
}

/// A named, opcoded sequence of microinstruction references.
#[derive(Debug, Clone)]
pub struct MachineInstruction {
    name: String,
    opcode: u64,
    micros: Vec<MicroId>,
}

impl MachineInstruction {
    /// The instruction's name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The instruction's opcode.
    pub fn opcode(&self) -> u64 {
        self.opcode
    }
    /// The ordered microinstruction references making up this instruction.
    pub fn micros(&self) -> &[MicroId] {
        &self.micros
    }
}

/// Buffered console used by I/O microinstructions.
///
/// Input is a queue of values consumed front-to-back; output is an append-only
/// list. Both directions can be undone exactly (see the undo log), which is
/// why the inverse operations `unread` and `unwrite` exist.
#[derive(Debug, Default)]
pub struct Console {
    input: VecDeque<u64>,
    output: Vec<u64>,
}

impl Console {
    /// Appends values to the input queue.
    pub fn queue_input(&mut self, values: impl IntoIterator<Item = u64>) {
        self.input.extend(values);
    }

    /// The number of input values not yet consumed.
    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Everything written to the output so far.
    pub fn output(&self) -> &[u64] {
        &self.output
    }

    /// Drains the output buffer.
    pub fn take_output(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn read(&mut self) -> Option<u64> {
        self.input.pop_front()
    }
    pub(crate) fn write(&mut self, value: u64) {
        self.output.push(value);
    }

    /// Pushes a consumed value back to the front of the input queue.
    pub(crate) fn unread(&mut self, value: u64) {
        self.input.push_front(value);
    }
    /// Removes the most recently written output value.
    pub(crate) fn unwrite(&mut self) {
        let _ = self.output.pop();
    }
}

/// A fully-formed machine definition.
#[derive(Debug)]
pub struct Machine {
    name: String,
    filler: CellFiller,

    // Module tables. Register-array elements live in `registers`,
    // so one RegId type addresses both.
    registers: Vec<Register>,
    arrays: Vec<RegisterArray>,
    rams: Vec<Ram>,
    bits: Vec<ConditionBit>,

    micros: Vec<Micro>,
    instructions: Vec<MachineInstruction>,
    fetch: MachineInstruction,

    program_counter: Option<RegId>,
    code_store: Option<RamId>,

    /// The console used by I/O microinstructions.
    pub console: Console,
}

impl Machine {
    /// Creates an empty machine definition.
    ///
    /// The microinstruction table starts with the two built-in entries,
    /// [`Machine::end`] and [`Machine::comment`]. The `init` strategy decides
    /// the initial contents of every register and RAM cell added later.
    pub fn new(name: impl Into<String>, init: MachineInitStrategy) -> Self {
        Self {
            name: name.into(),
            filler: init.filler(),
            registers: Vec::new(),
            arrays: Vec::new(),
            rams: Vec::new(),
            bits: Vec::new(),
            micros: vec![Micro::End, Micro::Comment { text: String::new() }],
            instructions: Vec::new(),
            fetch: MachineInstruction {
                name: "fetch".to_string(),
                opcode: 0,
                micros: Vec::new(),
            },
            program_counter: None,
            code_store: None,
            console: Console::default(),
        }
    }

    /// The machine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------ DEFINITION SURFACE ------------------

    /// Adds a register of the given width (1 to 64 bits).
    pub fn add_register(&mut self, name: impl Into<String>, width: u32) -> RegId {
        let value = self.filler.fill(width);
        self.registers.push(Register::new(name.into(), width, value));
        RegId(self.registers.len() - 1)
    }

    /// Adds a register array; its elements are ordinary registers named
    /// `name[0]` through `name[len - 1]`.
    pub fn add_register_array(&mut self, name: impl Into<String>, width: u32, len: usize) -> ArrayId {
        let name = name.into();
        let first = self.registers.len();
        for i in 0..len {
            let value = self.filler.fill(width);
            self.registers.push(Register::new(format!("{name}[{i}]"), width, value));
        }
        self.arrays.push(RegisterArray::new(name, width, first, len));
        ArrayId(self.arrays.len() - 1)
    }

    /// Adds a RAM with `size` cells of the given width.
    pub fn add_ram(&mut self, name: impl Into<String>, cell_width: u32, size: u64) -> RamId {
        let cells = (0..size).map(|_| self.filler.fill(cell_width)).collect();
        self.rams.push(Ram::new(name.into(), cell_width, cells));
        RamId(self.rams.len() - 1)
    }

    /// Adds a condition bit; `halt` designates it as a halt condition bit.
    pub fn add_condition_bit(&mut self, name: impl Into<String>, halt: bool) -> BitId {
        self.bits.push(ConditionBit::new(name.into(), halt));
        BitId(self.bits.len() - 1)
    }

    /// Adds a microinstruction to the machine's table.
    pub fn add_micro(&mut self, micro: Micro) -> MicroId {
        self.micros.push(micro);
        MicroId(self.micros.len() - 1)
    }

    /// Adds a machine instruction built from references into the
    /// microinstruction table.
    pub fn add_instruction(&mut self, name: impl Into<String>, opcode: u64, micros: Vec<MicroId>) -> InstrId {
        self.instructions.push(MachineInstruction { name: name.into(), opcode, micros });
        InstrId::Op(self.instructions.len() - 1)
    }

    /// Replaces the fetch sequence's microinstruction references.
    pub fn set_fetch_sequence(&mut self, micros: Vec<MicroId>) {
        self.fetch.micros = micros;
    }

    /// Designates the program counter register (used by external loaders).
    pub fn set_program_counter(&mut self, reg: RegId) {
        self.program_counter = Some(reg);
    }
    /// Designates the code store RAM (used by external loaders).
    pub fn set_code_store(&mut self, ram: RamId) {
        self.code_store = Some(ram);
    }
    /// The designated program counter, if any.
    pub fn program_counter(&self) -> Option<RegId> {
        self.program_counter
    }
    /// The designated code store, if any.
    pub fn code_store(&self) -> Option<RamId> {
        self.code_store
    }

    /// The built-in `End` microinstruction.
    pub fn end(&self) -> MicroId {
        MicroId(0)
    }
    /// The built-in (blank) `Comment` microinstruction.
    pub fn comment(&self) -> MicroId {
        MicroId(1)
    }

    /// Copies a program image into a RAM, starting at `start`.
    ///
    /// Values are masked to the RAM's cell width.
    ///
    /// # Panics
    /// Panics if the image runs past the end of the RAM.
    pub fn load_program(&mut self, ram: RamId, start: u64, words: &[u64]) {
        for (i, &word) in words.iter().enumerate() {
            self.rams[ram.0].set(start + i as u64, word);
        }
    }

    // ------------------ LOOKUP ------------------

    /// The register behind `id`.
    pub fn register(&self, id: RegId) -> &Register {
        &self.registers[id.0]
    }
    /// The register array behind `id`.
    pub fn register_array(&self, id: ArrayId) -> &RegisterArray {
        &self.arrays[id.0]
    }
    /// The RAM behind `id`.
    pub fn ram(&self, id: RamId) -> &Ram {
        &self.rams[id.0]
    }
    /// Mutable access to the RAM behind `id` (breakpoints, definition edits).
    pub fn ram_mut(&mut self, id: RamId) -> &mut Ram {
        &mut self.rams[id.0]
    }
    /// The condition bit behind `id`.
    pub fn condition_bit(&self, id: BitId) -> &ConditionBit {
        &self.bits[id.0]
    }

    /// The microinstruction behind `id`.
    pub fn micro(&self, id: MicroId) -> &Micro {
        &self.micros[id.0]
    }

    /// The machine instruction behind `id`.
    pub fn instruction(&self, id: InstrId) -> &MachineInstruction {
        match id {
            InstrId::Fetch => &self.fetch,
            InstrId::Op(n) => &self.instructions[n],
        }
    }

    /// All user-defined machine instructions, in definition order.
    pub fn instructions(&self) -> &[MachineInstruction] {
        &self.instructions
    }

    /// Finds the instruction whose opcode equals `opcode`.
    pub fn instruction_with_opcode(&self, opcode: u64) -> Option<InstrId> {
        self.instructions
            .iter()
            .position(|i| i.opcode == opcode)
            .map(InstrId::Op)
    }

    // ------------------ VALUES ------------------

    /// The current value of a register.
    pub fn register_value(&self, id: RegId) -> u64 {
        self.registers[id.0].value()
    }
    /// The current value of a RAM cell.
    ///
    /// # Panics
    /// Panics if `addr` is out of range.
    pub fn ram_value(&self, id: RamId, addr: u64) -> u64 {
        self.rams[id.0].get(addr).unwrap_or_else(|| {
            panic!("address {addr} out of range for RAM {}", self.rams[id.0].name())
        })
    }
    /// The current value of a condition bit.
    pub fn bit_value(&self, id: BitId) -> bool {
        self.bits[id.0].value()
    }

    /// Writes a register directly, without notification (definition-time
    /// setup and undo replay only; masked to the register's width).
    pub fn set_register_value(&mut self, id: RegId, value: u64) {
        self.registers[id.0].set_value(value);
    }
    /// Writes a RAM cell directly, without notification.
    ///
    /// # Panics
    /// Panics if `addr` is out of range.
    pub fn set_ram_value(&mut self, id: RamId, addr: u64, value: u64) {
        self.rams[id.0].set(addr, value);
    }
    /// Writes a condition bit directly, without notification.
    pub fn set_bit_value(&mut self, id: BitId, value: bool) {
        self.bits[id.0].set_value(value);
    }

    /// Marks a register as rejecting writes from microinstructions.
    pub fn set_register_read_only(&mut self, id: RegId, read_only: bool) {
        self.registers[id.0].set_read_only(read_only);
    }

    /// Whether any halt-designated condition bit is currently set.
    pub fn halt_bit_set(&self) -> bool {
        self.bits.iter().any(|b| b.halts() && b.value())
    }
}
