//! The register machine.
//!
//! One machine executes one instruction stream against the shared heap. The
//! active frame lives by value in the machine's register set; frames become
//! heap objects only when saved for a pending call, and are immutable from
//! then on. That discipline is what makes captured continuations multi-shot:
//! nothing a capture can reach is ever written again (environment slots
//! excepted — `set!` is supposed to be visible everywhere).
//!
//! The canonical register set lives in the heap's root table; a machine
//! checks it out for a bounded quantum of steps and publishes it back before
//! releasing the heap. `run` is just quanta in a loop.

pub mod control;
pub mod frame;
pub mod natives;
pub mod stubs;

use std::sync::Arc;

use crate::code::Opcode;
use crate::heap::object::{ObjBody, ObjTag};
use crate::heap::Heap;
use crate::messages::MessageTable;
use crate::value::Value;

use frame::Registers;
use natives::{NativeFlow, NativeRegistry};

/// What a machine is doing. A halted machine's result (and a faulted one's
/// condition) is also left in its accumulator, which the root table keeps
/// alive across collections.
#[derive(Clone, Debug)]
pub enum MachineState {
    Running,
    Halted(Value),
    /// A condition was raised with no handler in scope.
    Faulted(Value),
}

impl MachineState {
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running)
    }
}

pub struct Machine {
    pub id: usize,
    natives: Arc<NativeRegistry>,
    messages: Arc<MessageTable>,
    state: MachineState,
}

impl Machine {
    pub fn new(heap: &mut Heap, natives: Arc<NativeRegistry>, messages: Arc<MessageTable>) -> Machine {
        Machine {
            id: heap.register_machine(),
            natives,
            messages,
            state: MachineState::Halted(Value::UNSPECIFIED),
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    /// Point the machine at a code object's entry and mark it runnable. The
    /// frame below is the bottom sentinel, so a plain `return` from the top
    /// level halts with the accumulator as result.
    pub fn start(&mut self, heap: &mut Heap, code: Value, env: Value) {
        let mut regs = Registers::new();
        regs.frame.code = code;
        regs.frame.env = env;
        heap.set_regs(self.id, regs);
        self.state = MachineState::Running;
    }

    /// Run to completion. Single-machine convenience over `run_quantum`.
    pub fn run(&mut self, heap: &mut Heap) -> MachineState {
        while self.state.is_running() {
            self.run_quantum(heap, 4096);
        }
        self.state.clone()
    }

    /// Execute at most `budget` instructions, then publish the registers back
    /// to the heap's root table. Callers interleaving machines over a shared
    /// heap hold the heap lock exactly one quantum at a time.
    pub fn run_quantum(&mut self, heap: &mut Heap, budget: usize) -> MachineState {
        let mut regs = heap.regs(self.id);
        for _ in 0..budget {
            if !self.state.is_running() {
                break;
            }
            self.step(heap, &mut regs);
        }
        heap.set_regs(self.id, regs);
        self.state.clone()
    }

    // -----------------------------------------------------------------------
    // Instruction dispatch
    // -----------------------------------------------------------------------

    fn step(&mut self, heap: &mut Heap, regs: &mut Registers) {
        let Some(word) = heap.code_word(regs.frame.code, regs.frame.pc) else {
            self.raise_keyed(heap, regs, "err.code", vec![]);
            return;
        };
        let Some(op) = Opcode::from_word(word) else {
            self.raise_keyed(heap, regs, "err.code", vec![word]);
            return;
        };
        let mut operands = [Value::NIL; 2];
        for (i, slot) in operands.iter_mut().take(op.operand_count()).enumerate() {
            match heap.code_word(regs.frame.code, regs.frame.pc + 1 + i) {
                Some(w) => *slot = w,
                None => {
                    self.raise_keyed(heap, regs, "err.code", vec![word]);
                    return;
                }
            }
        }
        let next_pc = regs.frame.pc + 1 + op.operand_count();

        match op {
            Opcode::Const => {
                regs.acc = operands[0];
                regs.frame.pc = next_pc;
            }
            Opcode::Refer => {
                let (depth, index) = match slot_operands(operands) {
                    Some(di) => di,
                    None => {
                        self.raise_keyed(heap, regs, "err.code", vec![word]);
                        return;
                    }
                };
                match heap.env_slot(regs.frame.env, depth, index) {
                    Some(v) => {
                        regs.acc = v;
                        regs.frame.pc = next_pc;
                    }
                    None => self.raise_keyed(heap, regs, "err.scope", vec![operands[0], operands[1]]),
                }
            }
            Opcode::Assign => {
                let (depth, index) = match slot_operands(operands) {
                    Some(di) => di,
                    None => {
                        self.raise_keyed(heap, regs, "err.code", vec![word]);
                        return;
                    }
                };
                if heap.env_set(regs.frame.env, depth, index, regs.acc) {
                    regs.acc = Value::UNSPECIFIED;
                    regs.frame.pc = next_pc;
                } else {
                    self.raise_keyed(heap, regs, "err.scope", vec![operands[0], operands[1]]);
                }
            }
            Opcode::Close => {
                let (entry, arity) = match slot_operands(operands) {
                    Some(ea) => ea,
                    None => {
                        self.raise_keyed(heap, regs, "err.code", vec![word]);
                        return;
                    }
                };
                regs.acc = heap.alloc(
                    ObjBody::Lambda {
                        code: regs.frame.code,
                        entry,
                        arity,
                        env: regs.frame.env,
                    },
                    regs,
                );
                regs.frame.pc = next_pc;
            }
            Opcode::Test => {
                regs.frame.pc = if regs.acc.is_truthy() {
                    next_pc
                } else {
                    match pc_operand(operands[0]) {
                        Some(t) => t,
                        None => {
                            self.raise_keyed(heap, regs, "err.code", vec![word]);
                            return;
                        }
                    }
                };
            }
            Opcode::Jump => match pc_operand(operands[0]) {
                Some(t) => regs.frame.pc = t,
                None => self.raise_keyed(heap, regs, "err.code", vec![word]),
            },
            Opcode::Frame => {
                let ret = match pc_operand(operands[0]) {
                    Some(t) => t,
                    None => {
                        self.raise_keyed(heap, regs, "err.code", vec![word]);
                        return;
                    }
                };
                let mut saved = regs.frame;
                saved.pc = ret;
                let obj = heap.alloc(ObjBody::Frame(saved), regs);
                regs.frame.sfp = obj;
                regs.frame.rib = Value::NIL;
                regs.frame.pc = next_pc;
            }
            Opcode::Argument => {
                regs.frame.rib = heap.cons(regs.acc, regs.frame.rib, regs);
                regs.frame.pc = next_pc;
            }
            Opcode::Rib => {
                regs.frame.rib = Value::NIL;
                regs.frame.pc = next_pc;
            }
            Opcode::Apply => self.apply(heap, regs),
            Opcode::Return => self.do_return(heap, regs),
            Opcode::Halt => self.state = MachineState::Halted(regs.acc),
            Opcode::PushWind => {
                let before = heap.env_slot(regs.frame.env, 0, 0);
                let after = heap.env_slot(regs.frame.env, 0, 2);
                let (Some(before), Some(after)) = (before, after) else {
                    self.raise_keyed(heap, regs, "err.scope", vec![]);
                    return;
                };
                let marker = heap.alloc(
                    ObjBody::Wind {
                        before,
                        after,
                        prev: regs.frame.wind,
                    },
                    regs,
                );
                regs.frame.wind = marker;
                regs.frame.pc = next_pc;
            }
            Opcode::PopWind => {
                if !regs.frame.wind.is_object() {
                    self.raise_keyed(heap, regs, "err.code", vec![word]);
                    return;
                }
                match heap.body(regs.frame.wind) {
                    ObjBody::Wind { prev, .. } => regs.frame.wind = *prev,
                    _ => {
                        self.raise_keyed(heap, regs, "err.code", vec![word]);
                        return;
                    }
                }
                regs.frame.pc = next_pc;
            }
            Opcode::Resume => {
                let k = heap.env_slot(regs.frame.env, 0, 0);
                let v = heap.env_slot(regs.frame.env, 0, 1);
                let (Some(k), Some(v)) = (k, v) else {
                    self.raise_keyed(heap, regs, "err.scope", vec![]);
                    return;
                };
                if !k.is_object() {
                    self.raise_keyed(heap, regs, "err.type", vec![k]);
                    return;
                }
                match heap.body(k) {
                    ObjBody::Continuation(f) => {
                        regs.frame = *f;
                        regs.acc = v;
                    }
                    _ => self.raise_keyed(heap, regs, "err.type", vec![k]),
                }
            }
        }
    }

    /// Apply the procedure in the accumulator to the argument rib. A native
    /// may redirect into another application (`call/cc` handing the
    /// continuation to its receiver, `apply` spreading a list); that loops
    /// here rather than recursing.
    fn apply(&mut self, heap: &mut Heap, regs: &mut Registers) {
        loop {
            if !regs.acc.is_object() {
                self.raise_keyed(heap, regs, "err.not-a-procedure", vec![regs.acc]);
                return;
            }
            match heap.tag(regs.acc) {
                ObjTag::Lambda => {
                    let (entry, arity) = match heap.body(regs.acc) {
                        ObjBody::Lambda { entry, arity, .. } => (*entry, *arity),
                        _ => unreachable!(),
                    };
                    let Some(slots) = heap.rib_to_vec(regs.frame.rib) else {
                        self.raise_keyed(heap, regs, "err.code", vec![]);
                        return;
                    };
                    if slots.len() != arity {
                        let got = Value::fixnum(slots.len() as i64);
                        let want = Value::fixnum(arity as i64);
                        self.raise_keyed(heap, regs, "err.arity", vec![regs.acc, want, got]);
                        return;
                    }
                    // acc (the closure) and the rib are roots; the lambda's
                    // env is re-read after the allocation below.
                    let env = heap.alloc(
                        ObjBody::ArgFrame {
                            slots,
                            parent: match heap.body(regs.acc) {
                                ObjBody::Lambda { env, .. } => *env,
                                _ => unreachable!(),
                            },
                        },
                        regs,
                    );
                    match heap.body(regs.acc) {
                        ObjBody::Lambda { code, .. } => regs.frame.code = *code,
                        _ => unreachable!(),
                    }
                    regs.frame.pc = entry;
                    regs.frame.env = env;
                    regs.frame.rib = Value::NIL;
                    return;
                }
                ObjTag::Continuation => {
                    let Some(args) = heap.rib_to_vec(regs.frame.rib) else {
                        self.raise_keyed(heap, regs, "err.code", vec![]);
                        return;
                    };
                    if args.len() != 1 {
                        let got = Value::fixnum(args.len() as i64);
                        self.raise_keyed(
                            heap,
                            regs,
                            "err.arity",
                            vec![regs.acc, Value::fixnum(1), got],
                        );
                        return;
                    }
                    control::invoke_continuation(heap, regs, regs.acc, args[0]);
                    return;
                }
                ObjTag::Cps => {
                    let (native, name) = match heap.body(regs.acc) {
                        ObjBody::Cps { native, name } => (*native, *name),
                        _ => unreachable!(),
                    };
                    let Some(entry) = self.natives.get(native) else {
                        self.raise_keyed(heap, regs, "err.not-a-procedure", vec![name]);
                        return;
                    };
                    let Some(slots) = heap.rib_to_vec(regs.frame.rib) else {
                        self.raise_keyed(heap, regs, "err.code", vec![]);
                        return;
                    };
                    if let Some(want) = entry.arity {
                        if slots.len() != want as usize {
                            let got = Value::fixnum(slots.len() as i64);
                            let want = Value::fixnum(want as i64);
                            self.raise_keyed(heap, regs, "err.arity", vec![regs.acc, want, got]);
                            return;
                        }
                    }
                    // Arguments ride in gr2 so the native can re-read them
                    // across its own allocations.
                    regs.gr2 = heap.alloc(
                        ObjBody::ArgFrame {
                            slots,
                            parent: Value::NIL,
                        },
                        regs,
                    );
                    match (entry.func)(heap, regs) {
                        NativeFlow::Return(v) => {
                            regs.acc = v;
                            self.do_return(heap, regs);
                            return;
                        }
                        NativeFlow::Tail => return,
                        NativeFlow::Apply => continue,
                        NativeFlow::Raise(cond) => {
                            self.deliver(heap, regs, cond);
                            return;
                        }
                        NativeFlow::Cond { kind, irritants } => {
                            self.raise_keyed(heap, regs, kind, irritants);
                            return;
                        }
                    }
                }
                _ => {
                    self.raise_keyed(heap, regs, "err.not-a-procedure", vec![regs.acc]);
                    return;
                }
            }
        }
    }

    /// Return the accumulator to the saved parent frame; past the bottom
    /// sentinel the machine halts with it.
    fn do_return(&mut self, heap: &mut Heap, regs: &mut Registers) {
        let sfp = regs.frame.sfp;
        if sfp.is_bottom() {
            self.state = MachineState::Halted(regs.acc);
            return;
        }
        match heap.body(sfp) {
            ObjBody::Frame(f) => regs.frame = *f,
            _ => self.raise_keyed(heap, regs, "err.code", vec![]),
        }
    }

    /// Build a keyed condition and raise it. No handler in scope faults the
    /// machine, leaving the condition in the accumulator.
    fn raise_keyed(
        &mut self,
        heap: &mut Heap,
        regs: &mut Registers,
        kind: &str,
        mut irritants: Vec<Value>,
    ) {
        let text = self.messages.get(kind).to_string();
        let cond = heap.make_condition(kind, &text, &mut irritants, regs);
        self.deliver(heap, regs, cond);
    }

    /// Raise an already-built condition value.
    fn deliver(&mut self, heap: &mut Heap, regs: &mut Registers, cond: Value) {
        match control::raise(heap, regs, cond) {
            Ok(()) => {}
            Err(cond) => {
                log::debug!(
                    "machine {} faulted: {}",
                    self.id,
                    heap.render(cond)
                );
                regs.acc = cond;
                self.state = MachineState::Faulted(cond);
            }
        }
    }
}

fn slot_operands(operands: [Value; 2]) -> Option<(usize, usize)> {
    let a = operands[0];
    let b = operands[1];
    if !a.is_fixnum() || !b.is_fixnum() {
        return None;
    }
    let (a, b) = (a.as_fixnum(), b.as_fixnum());
    if a < 0 || b < 0 {
        return None;
    }
    Some((a as usize, b as usize))
}

fn pc_operand(v: Value) -> Option<usize> {
    if v.is_fixnum() && v.as_fixnum() >= 0 {
        Some(v.as_fixnum() as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeBuilder;

    fn machine(heap: &mut Heap) -> Machine {
        Machine::new(
            heap,
            Arc::new(NativeRegistry::standard()),
            Arc::new(MessageTable::standard()),
        )
    }

    #[test]
    fn halt_reports_the_accumulator() {
        let mut heap = Heap::new();
        let mut m = machine(&mut heap);
        let mut b = CodeBuilder::new();
        b.constant(Value::fixnum(41));
        b.emit(Opcode::Halt);
        let code = b.install_pending(&mut heap);
        m.start(&mut heap, code, Value::NIL);
        match m.run(&mut heap) {
            MachineState::Halted(v) => assert_eq!(v, Value::fixnum(41)),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_branches_on_false_only() {
        let mut heap = Heap::new();
        let mut m = machine(&mut heap);
        let mut b = CodeBuilder::new();
        b.constant(Value::FALSE);
        let hole = b.forward(Opcode::Test);
        b.constant(Value::fixnum(1));
        b.emit(Opcode::Halt);
        let target = b.here();
        b.patch(hole, target);
        b.constant(Value::fixnum(2));
        b.emit(Opcode::Halt);
        let code = b.install_pending(&mut heap);
        m.start(&mut heap, code, Value::NIL);
        match m.run(&mut heap) {
            MachineState::Halted(v) => assert_eq!(v, Value::fixnum(2)),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn close_and_apply_round_trip() {
        // ((lambda (x) x) 7) via explicit frame/argument/apply; the lambda
        // body is laid out past the halt.
        let mut heap = Heap::new();
        let mut m = machine(&mut heap);
        let mut b = CodeBuilder::new();
        let ret = b.forward(Opcode::Frame);
        b.constant(Value::fixnum(7));
        b.emit(Opcode::Argument);
        let close_at = b.close(0, 1); // entry patched once the body exists
        b.emit(Opcode::Apply);
        b.patch(ret, b.here());
        b.emit(Opcode::Halt);
        let body_entry = b.here();
        b.refer(0, 0);
        b.emit(Opcode::Return);
        b.patch(close_at + 1, body_entry);
        let code = b.install_pending(&mut heap);
        m.start(&mut heap, code, Value::NIL);
        match m.run(&mut heap) {
            MachineState::Halted(v) => assert_eq!(v, Value::fixnum(7)),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn lambda_arity_mismatch_raises() {
        let mut heap = Heap::new();
        let mut m = machine(&mut heap);
        let mut b = CodeBuilder::new();
        let ret = b.forward(Opcode::Frame);
        let close_at = b.close(0, 2); // wants two arguments, gets none
        b.emit(Opcode::Apply);
        b.patch(ret, b.here());
        b.emit(Opcode::Halt);
        let body_entry = b.here();
        b.constant(Value::fixnum(0));
        b.emit(Opcode::Return);
        b.patch(close_at + 1, body_entry);
        let code = b.install_pending(&mut heap);
        m.start(&mut heap, code, Value::NIL);
        match m.run(&mut heap) {
            MachineState::Faulted(c) => {
                let rendered = heap.render(c);
                assert!(rendered.contains("err.arity"), "{rendered}");
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn applying_a_fixnum_faults_without_a_handler() {
        let mut heap = Heap::new();
        let mut m = machine(&mut heap);
        let mut b = CodeBuilder::new();
        let ret = b.forward(Opcode::Frame);
        b.constant(Value::fixnum(3));
        b.emit(Opcode::Apply);
        b.patch(ret, b.here());
        b.emit(Opcode::Halt);
        let code = b.install_pending(&mut heap);
        m.start(&mut heap, code, Value::NIL);
        match m.run(&mut heap) {
            MachineState::Faulted(c) => {
                assert!(heap.is_a(c, ObjTag::Condition));
                let rendered = heap.render(c);
                assert!(rendered.contains("err.not-a-procedure"), "{rendered}");
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }
}
