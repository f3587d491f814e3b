//! The control-unit cursor: which instruction and which micro-step is current.

use crate::machine::InstrId;

/// An immutable snapshot of the control unit's position.
///
/// Snapshots anchor the undo log's records, so that stepping backwards can
/// restore the cursor in lock-step with module values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// The machine instruction being executed.
    pub instr: InstrId,
    /// The index of the next microinstruction to run within it.
    pub index: usize,
}

/// Tracks the currently executing machine instruction and the index of the
/// next microinstruction to run.
///
/// The cursor performs no bounds validation of its own; the execution engine
/// validates the index against the instruction's micro count before every
/// dispatch, so a cursor pushed out of range by a bad definition surfaces as
/// a fatal diagnostic rather than a panic.
#[derive(Debug, Clone)]
pub struct ControlUnit {
    instr: InstrId,
    index: usize,
}

impl ControlUnit {
    /// Creates a control unit pointing at the start of the fetch sequence.
    pub fn new() -> Self {
        Self { instr: InstrId::Fetch, index: 0 }
    }

    /// The machine instruction being executed.
    pub fn current_instruction(&self) -> InstrId {
        self.instr
    }
    /// The index of the next microinstruction to run.
    pub fn micro_index(&self) -> usize {
        self.index
    }

    /// Moves the index by `by` micro-steps (negative moves backwards).
    ///
    /// Bounds are not validated here; see the type-level docs.
    pub fn advance(&mut self, by: isize) {
        self.index = self.index.wrapping_add_signed(by);
    }

    /// Captures the current position.
    pub fn snapshot(&self) -> Cursor {
        Cursor { instr: self.instr, index: self.index }
    }

    /// Replaces both fields with a previously captured position.
    ///
    /// Hardware values are untouched; this only moves the cursor.
    pub fn restore(&mut self, cursor: Cursor) {
        self.instr = cursor.instr;
        self.index = cursor.index;
    }
}

impl Default for ControlUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut cu = ControlUnit::new();
        cu.restore(Cursor { instr: InstrId::Op(3), index: 5 });
        let snap = cu.snapshot();

        cu.advance(2);
        cu.restore(Cursor { instr: InstrId::Fetch, index: 0 });
        assert_eq!(cu.current_instruction(), InstrId::Fetch);

        cu.restore(snap);
        assert_eq!(cu.current_instruction(), InstrId::Op(3));
        assert_eq!(cu.micro_index(), 5);
    }

    #[test]
    fn test_advance_is_unchecked() {
        let mut cu = ControlUnit::new();
        cu.advance(-1);
        // Underflow wraps; the engine's bounds check is what reports it.
        assert_eq!(cu.micro_index(), usize::MAX);
    }
}
