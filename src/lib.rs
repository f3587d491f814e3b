//! A microcode-level machine simulator with reversible, single-stepping execution.
//!
//! A machine is described as a set of hardware modules (registers, register
//! arrays, RAM, condition bits) plus a catalog of microinstructions, and
//! machine instructions are sequences of microinstructions. The execution
//! engine runs microinstructions against that hardware one step at a time:
//! pausable, cancellable, observable, and undoable in reverse.
//!
//! # Usage
//!
//! A machine definition is built up module by module, then handed to an
//! [`ExecutionEngine`]:
//!
//! ```
//! use ucodesim::hardware::MachineInitStrategy;
//! use ucodesim::machine::Machine;
//! use ucodesim::micro::{MemDirection, Micro};
//! use ucodesim::exec::ExecutionEngine;
//!
//! let mut m = Machine::new("counter", MachineInitStrategy::default());
//!
//! // Hardware: a program counter, fetch plumbing, an accumulator,
//! // a code store, and a halt bit.
//! let pc = m.add_register("pc", 16);
//! let mar = m.add_register("mar", 16);
//! let mdr = m.add_register("mdr", 16);
//! let ir = m.add_register("ir", 16);
//! let acc = m.add_register("acc", 16);
//! let main = m.add_ram("main", 16, 64);
//! let halt = m.add_condition_bit("halt", true);
//!
//! // The fetch sequence: load the cell at pc into ir, then decode.
//! let f0 = m.add_micro(Micro::Transfer { src: pc, dest: mar });
//! let f1 = m.add_micro(Micro::MemAccess { direction: MemDirection::Read, ram: main, data: mdr, address: mar });
//! let f2 = m.add_micro(Micro::Transfer { src: mdr, dest: ir });
//! let f3 = m.add_micro(Micro::Increment { dest: pc, delta: 1 });
//! let f4 = m.add_micro(Micro::Decode { ir });
//! m.set_fetch_sequence(vec![f0, f1, f2, f3, f4]);
//!
//! // Two machine instructions, sharing the built-in End.
//! let end = m.end();
//! let inc = m.add_micro(Micro::Increment { dest: acc, delta: 1 });
//! let stop = m.add_micro(Micro::SetCondBit { bit: halt, value: true });
//! m.add_instruction("INC", 1, vec![inc, end]);
//! m.add_instruction("HALT", 0, vec![stop, end]);
//!
//! // A program: three INCs, then HALT.
//! m.load_program(main, 0, &[1, 1, 1, 0]);
//!
//! let mut engine = ExecutionEngine::new(m);
//! engine.run_command_line().unwrap(); // <-- Result can be handled accordingly
//! assert_eq!(engine.machine.register_value(acc), 3);
//! ```
//!
//! Interactive execution (background thread, state transitions, breakpoints,
//! and reverse stepping) lives in the [`exec`] module; see its docs for the
//! full surface.
//!
//! [`ExecutionEngine`]: exec::ExecutionEngine
#![warn(missing_docs)]

pub mod hardware;
pub mod machine;
pub mod micro;
pub mod exec;
