//! Microinstructions: the primitive units of work a control unit executes.
//!
//! A [`Micro`] is one tagged variant per microinstruction kind, with a shared
//! [`execute`](Micro::execute) contract. Two built-in instances always exist
//! in every machine's table: [`End`](Micro::End), which terminates the
//! current machine instruction by pointing the cursor back at the fetch
//! sequence, and [`Comment`](Micro::Comment), a no-op that carries
//! documentation text.
//!
//! Execution happens against an [`ExecCtx`], which bundles mutable access to
//! the machine, the control unit, the undo log, and the registered watchers.
//! Every write helper on the context records the pre-change value and
//! notifies watchers *before* applying the new value, which is the contract
//! the undo log depends on.
//!
//! Failures surface as a [`Fault`]:
//! - [`Fault::Error`] wraps an [`ExecError`] (divide by zero, illegal opcode,
//!   and so on); the engine reports it and ends the run.
//! - [`Fault::Break`] reports that a memory access touched a breakpointed
//!   address; the engine pauses and the run can be resumed. The access itself
//!   completes before the break surfaces, so resuming continues the program
//!   with nothing lost.

use crate::exec::backup::BackupManager;
use crate::exec::control::{ControlUnit, Cursor};
use crate::exec::observer::ModuleWatcher;
use crate::hardware::{sign_extend, width_mask, BitId, ModuleId, RamId, RegId};
use crate::machine::{InstrId, Machine};

/// Errors raised by a microinstruction during execution.
///
/// All of these end the run; the engine reports them through its state
/// channel (or returns them directly in command-line mode) and restores the
/// cursor to the faulting step so a later resume or undo stays consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// An arithmetic microinstruction divided by zero.
    DivideByZero,
    /// Decode found no instruction with the given opcode.
    IllegalOpcode(u64),
    /// The micro index left the current instruction's range without reaching
    /// an `End`. This indicates a malformed machine instruction.
    MicroIndexOutOfRange {
        /// Name of the instruction whose range was left.
        instruction: String,
        /// The out-of-range index.
        index: usize,
        /// The instruction's microinstruction count.
        len: usize,
    },
    /// A microinstruction wrote to a read-only register.
    ReadOnlyRegister(String),
    /// A memory access used an address outside the RAM.
    AddressOutOfRange {
        /// Name of the RAM.
        ram: String,
        /// The out-of-range address.
        addr: u64,
        /// The RAM's cell count.
        size: u64,
    },
    /// An input microinstruction ran with an empty input queue.
    InputExhausted,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::DivideByZero => f.write_str("microinstruction divided by zero"),
            ExecError::IllegalOpcode(op) => write!(f, "no instruction with opcode {op:#X}"),
            ExecError::MicroIndexOutOfRange { instruction, index, len } => {
                write!(f, "microinstruction index {index} out of range for instruction {instruction} ({len} micros)")
            }
            ExecError::ReadOnlyRegister(name) => write!(f, "register {name} is read-only"),
            ExecError::AddressOutOfRange { ram, addr, size } => {
                write!(f, "address {addr:#X} out of range for RAM {ram} ({size} cells)")
            }
            ExecError::InputExhausted => f.write_str("input requested but the input queue is empty"),
        }
    }
}
impl std::error::Error for ExecError {}

/// Anything that can cut a microinstruction's execution short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// An execution error; ends the run.
    Error(ExecError),
    /// A memory access touched a breakpointed address; pauses the run.
    Break {
        /// The RAM holding the breakpoint.
        ram: RamId,
        /// The breakpointed address.
        addr: u64,
    },
}

impl From<ExecError> for Fault {
    fn from(value: ExecError) -> Self {
        Self::Error(value)
    }
}

/// Arithmetic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
    /// Unsigned division; divide by zero faults.
    Div,
}

/// Bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Bitwise NOT of the left operand; the right operand is ignored.
    Not,
}

/// Shift operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    /// Shift left, filling with zeros.
    LogicalLeft,
    /// Shift right, filling with zeros.
    LogicalRight,
    /// Shift right, filling with the sign bit of the source's width.
    ArithmeticRight,
}

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemDirection {
    /// RAM cell into register.
    Read,
    /// Register into RAM cell.
    Write,
}

/// Direction of a console transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Console input queue into register.
    Input,
    /// Register onto the console output.
    Output,
}

/// Comparison predicate used by [`Micro::Test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Never passes.
    Never,
    /// Passes if the register value is less than the operand.
    Lt,
    /// Passes if the register value equals the operand.
    Eq,
    /// Passes if the register value is at most the operand.
    Le,
    /// Passes if the register value is greater than the operand.
    Gt,
    /// Passes if the register value differs from the operand.
    Ne,
    /// Passes if the register value is at least the operand.
    Ge,
    /// Always passes.
    Always,
}

impl Comparator {
    /// Checks the predicate against `(lhs, rhs)`, unsigned.
    pub fn check(&self, lhs: u64, rhs: u64) -> bool {
        match self {
            Comparator::Never => false,
            Comparator::Lt => lhs < rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ne => lhs != rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Always => true,
        }
    }
}

/// One microinstruction.
///
/// Values flowing between registers are masked to the destination's width on
/// every write; arithmetic is wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Micro {
    /// Terminates the machine instruction: points the cursor back at the
    /// start of the fetch sequence.
    End,
    /// Does nothing; carries documentation text.
    Comment {
        /// The documentation text.
        text: String,
    },
    /// Loads a constant into a register.
    Set {
        /// Destination register.
        dest: RegId,
        /// The constant (masked to the destination's width).
        value: u64,
    },
    /// Adds a signed constant to a register.
    Increment {
        /// Destination register.
        dest: RegId,
        /// The signed amount to add.
        delta: i64,
    },
    /// Combines two registers arithmetically into a third.
    Arithmetic {
        /// The operation.
        op: ArithOp,
        /// Left operand register.
        lhs: RegId,
        /// Right operand register.
        rhs: RegId,
        /// Destination register.
        dest: RegId,
    },
    /// Combines two registers bitwise into a third.
    Logical {
        /// The operation.
        op: LogicOp,
        /// Left operand register.
        lhs: RegId,
        /// Right operand register (ignored by [`LogicOp::Not`]).
        rhs: RegId,
        /// Destination register.
        dest: RegId,
    },
    /// Shifts a register into another.
    Shift {
        /// The operation.
        op: ShiftOp,
        /// Source register.
        src: RegId,
        /// Destination register.
        dest: RegId,
        /// Shift distance in bits.
        distance: u32,
    },
    /// Copies one register into another.
    Transfer {
        /// Source register.
        src: RegId,
        /// Destination register.
        dest: RegId,
    },
    /// Conditionally moves the micro cursor by a relative amount.
    Test {
        /// Register to test.
        reg: RegId,
        /// The predicate.
        cmp: Comparator,
        /// The operand compared against.
        value: u64,
        /// Relative cursor move applied when the predicate passes.
        skip: isize,
    },
    /// Unconditionally moves the micro cursor by a relative amount.
    Branch {
        /// Relative cursor move.
        amount: isize,
    },
    /// Matches the instruction register against the machine's opcodes and
    /// points the cursor at the matching instruction's first micro.
    Decode {
        /// The instruction register.
        ir: RegId,
    },
    /// Moves a value between a register and a RAM cell. The cell address is
    /// taken from the address register. Touching a breakpointed address
    /// completes the access, then surfaces [`Fault::Break`].
    MemAccess {
        /// Direction of the transfer.
        direction: MemDirection,
        /// The RAM.
        ram: RamId,
        /// The data register.
        data: RegId,
        /// The register holding the cell address.
        address: RegId,
    },
    /// Sets a condition bit.
    SetCondBit {
        /// The bit.
        bit: BitId,
        /// The value to set.
        value: bool,
    },
    /// Transfers a value between the console and a register.
    Io {
        /// Direction of the transfer.
        direction: IoDirection,
        /// The register read from or written to.
        reg: RegId,
    },
}

impl Micro {
    /// Whether this is the terminal `End` microinstruction.
    pub fn is_end(&self) -> bool {
        matches!(self, Micro::End)
    }

    /// The declared cycle cost of this microinstruction.
    ///
    /// Scheduling metadata for reporting; not used for timing correctness.
    pub fn cycles(&self) -> u64 {
        match self {
            Micro::Comment { .. } => 0,
            Micro::MemAccess { .. } | Micro::Io { .. } => 2,
            _ => 1,
        }
    }

    /// Whether this microinstruction references the given module.
    ///
    /// A static relationship query for definition editors (answering "what
    /// breaks if this module is deleted"); the engine itself only dispatches.
    pub fn uses_module(&self, id: ModuleId) -> bool {
        let uses_reg = |r: RegId| id == ModuleId::Register(r);
        match *self {
            Micro::End | Micro::Comment { .. } | Micro::Branch { .. } => false,
            Micro::Set { dest, .. } | Micro::Increment { dest, .. } => uses_reg(dest),
            Micro::Arithmetic { lhs, rhs, dest, .. } | Micro::Logical { lhs, rhs, dest, .. } => {
                uses_reg(lhs) || uses_reg(rhs) || uses_reg(dest)
            }
            Micro::Shift { src, dest, .. } | Micro::Transfer { src, dest } => {
                uses_reg(src) || uses_reg(dest)
            }
            Micro::Test { reg, .. } | Micro::Decode { ir: reg } | Micro::Io { reg, .. } => uses_reg(reg),
            Micro::MemAccess { ram, data, address, .. } => {
                id == ModuleId::Ram(ram) || uses_reg(data) || uses_reg(address)
            }
            Micro::SetCondBit { bit, .. } => id == ModuleId::ConditionBit(bit),
        }
    }

    /// Executes this microinstruction against the given context.
    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> Result<(), Fault> {
        match *self {
            Micro::End => {
                ctx.control.restore(Cursor { instr: InstrId::Fetch, index: 0 });
                Ok(())
            }
            Micro::Comment { .. } => Ok(()),
            Micro::Set { dest, value } => ctx.write_register(dest, value),
            Micro::Increment { dest, delta } => {
                let value = ctx.read_register(dest).wrapping_add_signed(delta);
                ctx.write_register(dest, value)
            }
            Micro::Arithmetic { op, lhs, rhs, dest } => {
                let l = ctx.read_register(lhs);
                let r = ctx.read_register(rhs);
                let result = match op {
                    ArithOp::Add => l.wrapping_add(r),
                    ArithOp::Sub => l.wrapping_sub(r),
                    ArithOp::Mul => l.wrapping_mul(r),
                    ArithOp::Div => {
                        if r == 0 {
                            return Err(ExecError::DivideByZero.into());
                        }
                        l / r
                    }
                };
                ctx.write_register(dest, result)
            }
            Micro::Logical { op, lhs, rhs, dest } => {
                let l = ctx.read_register(lhs);
                let r = ctx.read_register(rhs);
                let result = match op {
                    LogicOp::And => l & r,
                    LogicOp::Or => l | r,
                    LogicOp::Xor => l ^ r,
                    LogicOp::Not => !l,
                };
                ctx.write_register(dest, result)
            }
            Micro::Shift { op, src, dest, distance } => {
                let value = ctx.read_register(src);
                let width = ctx.machine.register(src).width();
                let result = match op {
                    ShiftOp::LogicalLeft => value.checked_shl(distance).unwrap_or(0),
                    ShiftOp::LogicalRight => value.checked_shr(distance).unwrap_or(0),
                    ShiftOp::ArithmeticRight => {
                        let signed = sign_extend(value, width);
                        (signed >> distance.min(63)) as u64
                    }
                };
                ctx.write_register(dest, result)
            }
            Micro::Transfer { src, dest } => {
                let value = ctx.read_register(src);
                ctx.write_register(dest, value)
            }
            Micro::Test { reg, cmp, value, skip } => {
                if cmp.check(ctx.read_register(reg), value) {
                    ctx.control.advance(skip);
                }
                Ok(())
            }
            Micro::Branch { amount } => {
                ctx.control.advance(amount);
                Ok(())
            }
            Micro::Decode { ir } => {
                let opcode = ctx.read_register(ir);
                let instr = ctx
                    .machine
                    .instruction_with_opcode(opcode)
                    .ok_or(ExecError::IllegalOpcode(opcode))?;
                ctx.control.restore(Cursor { instr, index: 0 });
                Ok(())
            }
            Micro::MemAccess { direction, ram, data, address } => {
                let addr = ctx.read_register(address);
                match direction {
                    MemDirection::Read => {
                        let value = ctx.read_ram(ram, addr)?;
                        ctx.write_register(data, value)?;
                    }
                    MemDirection::Write => {
                        let value = ctx.read_register(data);
                        ctx.write_ram(ram, addr, value)?;
                    }
                }
                if ctx.machine.ram(ram).is_breakpoint(addr) {
                    return Err(Fault::Break { ram, addr });
                }
                Ok(())
            }
            Micro::SetCondBit { bit, value } => {
                ctx.write_bit(bit, value);
                Ok(())
            }
            Micro::Io { direction, reg } => match direction {
                IoDirection::Input => {
                    let value = ctx.machine.console.read().ok_or(ExecError::InputExhausted)?;
                    ctx.write_register(reg, value)
                }
                IoDirection::Output => {
                    let value = ctx.read_register(reg);
                    ctx.machine.console.write(value);
                    Ok(())
                }
            },
        }
    }
}

/// The execution context handed to [`Micro::execute`].
///
/// Bundles the mutable state a microinstruction may touch. The write helpers
/// implement the change-notification contract: record the pre-change value
/// in the undo log, notify every watcher, then apply.
pub struct ExecCtx<'a> {
    /// The machine being executed.
    pub machine: &'a mut Machine,
    /// The control-unit cursor.
    pub control: &'a mut ControlUnit,
    /// The undo log.
    pub backup: &'a mut BackupManager,
    /// The registered change watchers.
    pub watchers: &'a mut [Box<dyn ModuleWatcher>],
}

impl ExecCtx<'_> {
    /// Reads a register's current value.
    pub fn read_register(&self, id: RegId) -> u64 {
        self.machine.register_value(id)
    }

    /// Writes a register through the notification hook.
    ///
    /// The value is masked to the register's width. Read-only registers
    /// reject the write with an error.
    pub fn write_register(&mut self, id: RegId, value: u64) -> Result<(), Fault> {
        let reg = self.machine.register(id);
        if reg.read_only() {
            return Err(ExecError::ReadOnlyRegister(reg.name().to_string()).into());
        }
        let old = reg.value();
        let new = value & width_mask(reg.width());

        self.backup.record_register(id, old);
        for w in self.watchers.iter_mut() {
            w.register_changed(id, old, new);
        }
        self.machine.set_register_value(id, new);
        Ok(())
    }

    /// Reads a RAM cell, faulting on an out-of-range address.
    pub fn read_ram(&self, id: RamId, addr: u64) -> Result<u64, Fault> {
        let ram = self.machine.ram(id);
        ram.get(addr).ok_or_else(|| {
            ExecError::AddressOutOfRange {
                ram: ram.name().to_string(),
                addr,
                size: ram.size(),
            }
            .into()
        })
    }

    /// Writes a RAM cell through the notification hook, faulting on an
    /// out-of-range address.
    pub fn write_ram(&mut self, id: RamId, addr: u64, value: u64) -> Result<(), Fault> {
        let old = self.read_ram(id, addr)?;
        let new = value & width_mask(self.machine.ram(id).cell_width());

        self.backup.record_ram_cell(id, addr, old);
        for w in self.watchers.iter_mut() {
            w.ram_changed(id, addr, old, new);
        }
        self.machine.set_ram_value(id, addr, new);
        Ok(())
    }

    /// Writes a condition bit through the notification hook.
    pub fn write_bit(&mut self, id: BitId, value: bool) {
        let old = self.machine.bit_value(id);

        self.backup.record_bit(id, old);
        for w in self.watchers.iter_mut() {
            w.bit_changed(id, old, value);
        }
        self.machine.set_bit_value(id, value);
    }
}
