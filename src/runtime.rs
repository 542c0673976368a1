//! Shared-heap runtime: machines as parallel tasks over one mutex-guarded
//! heap.
//!
//! Allocation is the single synchronization point. A worker holds the heap
//! lock for one bounded quantum of instructions and publishes its registers
//! into the heap's root table before releasing, so a collection triggered by
//! any machine's allocation sees a consistent root set across all of them.
//! There is no cancellation: a machine runs until it halts or faults.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::heap::gc::invariant_violation;
use crate::heap::Heap;
use crate::messages::MessageTable;
use crate::vm::natives::NativeRegistry;
use crate::vm::{Machine, MachineState};

/// Instructions per lock hold. Small enough to interleave machines, large
/// enough that lock traffic does not dominate.
const QUANTUM: usize = 2048;

pub struct Runtime {
    heap: Mutex<Heap>,
    natives: Arc<NativeRegistry>,
    messages: Arc<MessageTable>,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime::with_messages(MessageTable::standard())
    }

    pub fn with_messages(messages: MessageTable) -> Runtime {
        Runtime {
            heap: Mutex::new(Heap::new()),
            natives: Arc::new(NativeRegistry::standard()),
            messages: Arc::new(messages),
        }
    }

    /// Lock the heap. A poisoned lock means a panic while the heap was held,
    /// after which its contents cannot be trusted.
    pub fn heap(&self) -> MutexGuard<'_, Heap> {
        match self.heap.lock() {
            Ok(guard) => guard,
            Err(_) => invariant_violation("heap lock poisoned"),
        }
    }

    pub fn natives(&self) -> &Arc<NativeRegistry> {
        &self.natives
    }

    pub fn messages(&self) -> &Arc<MessageTable> {
        &self.messages
    }

    /// A machine registered against this runtime's heap. Point it at code
    /// with [`Machine::start`] while holding the heap.
    pub fn machine(&self) -> Machine {
        let mut heap = self.heap();
        Machine::new(&mut heap, Arc::clone(&self.natives), Arc::clone(&self.messages))
    }

    /// Run every machine to completion, one worker thread each, interleaved
    /// over the shared heap a quantum at a time. Results come back in the
    /// order the machines were passed in.
    pub fn run_parallel(&self, machines: Vec<Machine>) -> Vec<MachineState> {
        thread::scope(|scope| {
            let handles: Vec<_> = machines
                .into_iter()
                .map(|mut m| {
                    scope.spawn(move || loop {
                        let state = {
                            let mut heap = self.heap();
                            m.run_quantum(&mut heap, QUANTUM)
                        };
                        if !state.is_running() {
                            return state;
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(state) => state,
                    Err(_) => invariant_violation("machine worker panicked"),
                })
                .collect()
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
