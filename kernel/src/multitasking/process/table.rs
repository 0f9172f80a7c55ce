// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The process table: a kernel-global map from [`Pid`] to [`Process`],
//! mirroring how [`filesystem::file_table`] keys its entries by an
//! opaque monotonically-increasing integer, guarded the same way (a
//! `spin::Mutex` plus [`without_interrupts`] around every operation,
//! per spec.md §5's "operations on the process table... are serialised
//! by disabling interrupts around their critical sections").

use crate::{Pid, Process};
use alloc::collections::BTreeMap;
use interrupts::without_interrupts;
use spin::Mutex;

/// The kernel-wide process table.
///
pub struct Table {
    processes: BTreeMap<Pid, Process>,
    next_pid: Pid,
}

impl Table {
    const fn new() -> Self {
        Table { processes: BTreeMap::new(), next_pid: 1 }
    }

    /// Inserts `process`, allocating it a fresh PID, and returns that
    /// PID.
    ///
    pub fn insert(&mut self, process: Process) -> Pid {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1).max(1);
        self.processes.insert(pid, process);
        pid
    }

    /// Removes and returns the process at `pid`, if any.
    ///
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Runs `f` with mutable access to the process at `pid`.
    ///
    pub fn with<R>(&mut self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        self.processes.get_mut(&pid).map(f)
    }

    /// Returns every live PID, in allocation order.
    ///
    pub fn pids(&self) -> alloc::vec::Vec<Pid> {
        self.processes.keys().copied().collect()
    }
}

/// The kernel-wide process table singleton.
///
pub static PROCESSES: Mutex<Table> = Mutex::new(Table::new());

/// Runs `f` against [`PROCESSES`] with interrupts disabled, per
/// spec.md §5's ordering rule for the process table.
///
pub fn with_table<R>(f: impl FnOnce(&mut Table) -> R) -> R {
    without_interrupts(|| f(&mut PROCESSES.lock()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_allocates_increasing_pids() {
        let mut table = Table::new();
        let a = table.insert(Process::default());
        let b = table.insert(Process::default());
        assert!(b > a);
        assert!(a >= 1);
    }

    #[test]
    fn remove_returns_the_process() {
        let mut table = Table::new();
        let pid = table.insert(Process::default());
        assert!(table.remove(pid).is_some());
        assert!(table.remove(pid).is_none());
    }
}
