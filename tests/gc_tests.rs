//! Collection under execution: machines keep running correctly while the
//! arena is repeatedly collected out from under them.

use std::sync::Arc;

use squill::code::{CodeBuilder, Opcode};
use squill::heap::object::ObjBody;
use squill::heap::Heap;
use squill::messages::MessageTable;
use squill::value::Value;
use squill::vm::frame::Registers;
use squill::vm::natives::{global_env, NativeRegistry};
use squill::{Machine, MachineState};

fn registry_slot(registry: &NativeRegistry, name: &str) -> usize {
    registry
        .names()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("no built-in {name}"))
}

/// Build a list of `count` fixnums with a bytecode loop: cons, increment,
/// test, jump. Locals: 0 = n, 1 = accumulated list.
fn list_builder(registry: &NativeRegistry, count: i64) -> CodeBuilder {
    let cons = registry_slot(registry, "cons");
    let plus = registry_slot(registry, "+");
    let lt = registry_slot(registry, "<");
    let mut b = CodeBuilder::new();
    b.constant(Value::fixnum(0));
    b.assign(0, 0);
    let top = b.here();
    let r1 = b.forward(Opcode::Frame);
    b.refer(0, 0);
    b.emit(Opcode::Argument);
    b.refer(0, 1);
    b.emit(Opcode::Argument);
    b.refer(1, cons);
    b.emit(Opcode::Apply);
    b.patch(r1, b.here());
    b.assign(0, 1);
    let r2 = b.forward(Opcode::Frame);
    b.refer(0, 0);
    b.emit(Opcode::Argument);
    b.constant(Value::fixnum(1));
    b.emit(Opcode::Argument);
    b.refer(1, plus);
    b.emit(Opcode::Apply);
    b.patch(r2, b.here());
    b.assign(0, 0);
    let r3 = b.forward(Opcode::Frame);
    b.refer(0, 0);
    b.emit(Opcode::Argument);
    b.constant(Value::fixnum(count));
    b.emit(Opcode::Argument);
    b.refer(1, lt);
    b.emit(Opcode::Apply);
    b.patch(r3, b.here());
    let exit = b.forward(Opcode::Test);
    let back = b.forward(Opcode::Jump);
    b.patch(back, top);
    b.patch(exit, b.here());
    b.refer(0, 1);
    b.emit(Opcode::Halt);
    b
}

fn start_with_locals(heap: &mut Heap, m: &mut Machine, registry: &NativeRegistry, locals: usize, b: CodeBuilder) {
    let mut regs = Registers::new();
    regs.gr1 = global_env(heap, &mut regs, registry);
    regs.gr2 = heap.alloc(
        ObjBody::ArgFrame {
            slots: vec![Value::NIL; locals],
            parent: regs.gr1,
        },
        &mut regs,
    );
    let code = b.install(heap, &mut regs);
    m.start(heap, code, regs.gr2);
}

#[test]
fn a_looping_program_survives_repeated_collections() {
    // A tiny threshold forces a collection every few dozen allocations while
    // the loop is mid-flight; the finished list must still be intact.
    let mut heap = Heap::with_limits(64, 1 << 20);
    let registry = Arc::new(NativeRegistry::standard());
    let mut m = Machine::new(
        &mut heap,
        Arc::clone(&registry),
        Arc::new(MessageTable::standard()),
    );
    start_with_locals(&mut heap, &mut m, &registry, 2, list_builder(&registry, 200));
    let list = match m.run(&mut heap) {
        MachineState::Halted(v) => v,
        other => panic!("unexpected state: {other:?}"),
    };
    let got = heap.list_to_vec(list).expect("proper list");
    assert_eq!(got.len(), 200);
    for (i, v) in got.iter().enumerate() {
        assert_eq!(*v, Value::fixnum(199 - i as i64));
    }
    assert!(heap.stats.collections >= 1, "loop never triggered a collection");
}

#[test]
fn one_machines_roots_survive_anothers_allocations() {
    // Machine A publishes its registers and goes quiet; machine B's
    // allocation storm triggers collections that must still trace A's roots
    // through the heap's root table.
    let mut heap = Heap::with_limits(16, 1 << 20);
    let a = heap.register_machine();
    let mut ra = heap.regs(a);
    let items: Vec<Value> = (1..=3).map(Value::fixnum).collect();
    ra.acc = heap.list(&items, &mut ra);
    heap.set_regs(a, ra);

    let b = heap.register_machine();
    let mut rb = heap.regs(b);
    for i in 0..200 {
        rb.gr1 = heap.alloc(ObjBody::Str(format!("churn-{i}")), &mut rb);
    }
    assert!(heap.stats.collections >= 1);

    let ra = heap.regs(a);
    let got = heap.list_to_vec(ra.acc).expect("proper list");
    assert_eq!(got, items);
}

#[test]
fn shared_structure_stays_shared_after_collections() {
    // A pair whose car and cdr are the same object must come out of a
    // collection still referencing one object.
    let mut heap = Heap::with_limits(16, 1 << 20);
    let id = heap.register_machine();
    let mut regs = heap.regs(id);
    let v = heap.alloc(ObjBody::Str("shared".into()), &mut regs);
    regs.acc = heap.cons(v, v, &mut regs);
    heap.set_regs(id, regs);
    for i in 0..100 {
        let mut scratch = heap.regs(id);
        let _ = heap.alloc(ObjBody::Str(format!("junk-{i}")), &mut scratch);
        heap.set_regs(id, scratch);
    }
    let regs = heap.regs(id);
    let car = heap.car(regs.acc).expect("pair");
    let cdr = heap.cdr(regs.acc).expect("pair");
    assert_eq!(car, cdr);
    assert!(matches!(heap.body(car), ObjBody::Str(s) if s == "shared"));
}

#[test]
fn the_machine_still_runs_after_heavy_collection_history() {
    // Stubs and interned symbols live on the shared list; after many
    // collections dynamic control flow through the canned stubs must still
    // work. Reuses the loop program on the already-churned heap.
    let mut heap = Heap::with_limits(16, 1 << 20);
    let registry = Arc::new(NativeRegistry::standard());
    let mut m = Machine::new(
        &mut heap,
        Arc::clone(&registry),
        Arc::new(MessageTable::standard()),
    );
    start_with_locals(&mut heap, &mut m, &registry, 2, list_builder(&registry, 50));
    match m.run(&mut heap) {
        MachineState::Halted(v) => {
            assert_eq!(heap.list_to_vec(v).map(|l| l.len()), Some(50));
        }
        other => panic!("unexpected state: {other:?}"),
    }
    let before = heap.stats.collections;
    let mut m2 = Machine::new(
        &mut heap,
        Arc::clone(&registry),
        Arc::new(MessageTable::standard()),
    );
    start_with_locals(&mut heap, &mut m2, &registry, 2, list_builder(&registry, 50));
    match m2.run(&mut heap) {
        MachineState::Halted(v) => {
            assert_eq!(heap.list_to_vec(v).map(|l| l.len()), Some(50));
        }
        other => panic!("unexpected state: {other:?}"),
    }
    assert!(heap.stats.collections >= before);
}
