//! Module-change watchers: callbacks fired on every hardware mutation.
//!
//! The execution context invokes every registered [`ModuleWatcher`] before a
//! new value is applied, carrying the module handle and the old and new
//! values. The undo log is wired in separately by the same write path, so a
//! watcher and the log observe every change independently of each other.
//!
//! Watchers run synchronously on the execution thread. They must not block
//! for long, and they have no way to mutate the machine from inside a
//! callback (they only receive handles and values), which keeps the
//! single-writer rule intact.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::hardware::{BitId, RamId, RegId};

/// Callback interface for observing hardware mutations.
///
/// All methods default to no-ops, so a watcher only implements the
/// notifications it cares about.
pub trait ModuleWatcher: Send + 'static {
    /// A register is about to change from `old` to `new`.
    fn register_changed(&mut self, id: RegId, old: u64, new: u64) {
        let _ = (id, old, new);
    }

    /// A RAM cell is about to change from `old` to `new`.
    fn ram_changed(&mut self, id: RamId, addr: u64, old: u64, new: u64) {
        let _ = (id, addr, old, new);
    }

    /// A condition bit is about to change from `old` to `new`.
    fn bit_changed(&mut self, id: BitId, old: bool, new: bool) {
        let _ = (id, old, new);
    }
}

#[derive(Default)]
struct ChangeLogInner {
    registers: BTreeSet<RegId>,
    bits: BTreeSet<BitId>,
    cells: BTreeSet<(RamId, u64)>,
}

/// A ready-made watcher that collects which modules have been touched since
/// the last [`clear`](ChangeLog::clear).
///
/// The log is cheaply cloneable and shares its storage, so a caller can keep
/// one handle while the engine owns another:
///
/// ```
/// use ucodesim::exec::observer::ChangeLog;
///
/// let log = ChangeLog::new();
/// let _for_engine = log.clone();
/// // ... register the clone as a watcher, run, then inspect `log` ...
/// assert!(log.touched_registers().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct ChangeLog {
    inner: Arc<Mutex<ChangeLogInner>>,
}

impl ChangeLog {
    /// Creates an empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChangeLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forgets all recorded changes.
    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = ChangeLogInner::default();
    }

    /// The registers touched since the last clear, in handle order.
    pub fn touched_registers(&self) -> Vec<RegId> {
        self.lock().registers.iter().copied().collect()
    }

    /// The condition bits touched since the last clear, in handle order.
    pub fn touched_bits(&self) -> Vec<BitId> {
        self.lock().bits.iter().copied().collect()
    }

    /// The RAM cells touched since the last clear, in (RAM, address) order.
    pub fn touched_cells(&self) -> Vec<(RamId, u64)> {
        self.lock().cells.iter().copied().collect()
    }
}

impl ModuleWatcher for ChangeLog {
    fn register_changed(&mut self, id: RegId, _old: u64, _new: u64) {
        let _ = self.lock().registers.insert(id);
    }

    fn ram_changed(&mut self, id: RamId, addr: u64, _old: u64, _new: u64) {
        let _ = self.lock().cells.insert((id, addr));
    }

    fn bit_changed(&mut self, id: BitId, _old: bool, _new: bool) {
        let _ = self.lock().bits.insert(id);
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ChangeLog")
            .field("registers", &inner.registers.len())
            .field("bits", &inner.bits.len())
            .field("cells", &inner.cells.len())
            .finish()
    }
}
