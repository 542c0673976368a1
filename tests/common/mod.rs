//! Shared fixtures for the integration suites.

use squill::code::CodeBuilder;
use squill::heap::object::ObjBody;
use squill::heap::Heap;
use squill::value::Value;
use squill::vm::frame::Registers;
use squill::vm::natives::global_env;
use squill::{MachineState, Runtime};

/// Slot of a built-in inside the global environment rib.
pub fn slot_of(rt: &Runtime, name: &str) -> usize {
    rt.natives()
        .names()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("no built-in {name}"))
}

/// Run assembled code under an environment of `locals` nil slots chained
/// over the built-ins: locals at depth 0, built-ins at depth 1 (one deeper
/// inside each closure body).
pub fn run_with_locals(rt: &Runtime, locals: usize, b: CodeBuilder) -> MachineState {
    let mut m = rt.machine();
    {
        let mut heap = rt.heap();
        let mut regs = Registers::new();
        regs.gr1 = global_env(&mut heap, &mut regs, rt.natives());
        regs.gr2 = heap.alloc(
            ObjBody::ArgFrame {
                slots: vec![Value::NIL; locals],
                parent: regs.gr1,
            },
            &mut regs,
        );
        let code = b.install(&mut heap, &mut regs);
        m.start(&mut heap, code, regs.gr2);
    }
    rt.run_parallel(vec![m]).remove(0)
}

pub fn halted(state: MachineState) -> Value {
    match state {
        MachineState::Halted(v) => v,
        other => panic!("expected a halt, got {other:?}"),
    }
}

pub fn faulted(state: MachineState) -> Value {
    match state {
        MachineState::Faulted(c) => c,
        other => panic!("expected a fault, got {other:?}"),
    }
}

/// Read a proper list of fixnums out of the heap.
pub fn list_fixnums(heap: &Heap, v: Value) -> Vec<i64> {
    heap.list_to_vec(v)
        .expect("proper list")
        .iter()
        .map(|x| {
            assert!(x.is_fixnum(), "non-fixnum in list: {x:?}");
            x.as_fixnum()
        })
        .collect()
}
