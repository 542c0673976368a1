//! Copying garbage collection.
//!
//! Two arenas of object slots. A heap reference is an arena index, so the
//! forwarding protocol mutates no pointers: copying an object leaves
//! `Slot::Forwarded(new_index)` at its old slot, and later references to the
//! same old index resolve to the same destination object — identity is
//! preserved across a collection.
//!
//! Collection is Cheney's algorithm: roots are forwarded first, then the
//! destination arena is scanned linearly as it grows (allocation order is the
//! scan queue; no separate worklist). Each scanned object's children are
//! rewritten through its tag's `relocate` row in the ops table.

use crate::heap::object::{ObjBody, OBJ_OPS};
use crate::value::Value;
use crate::vm::frame::{Registers, StackFrame};

use std::mem;

/// One arena slot. `Forwarded` is the forwarding marker left in the source
/// arena during a collection; `Busy` only exists transiently while a slot's
/// body is being scanned.
#[derive(Debug)]
pub(crate) enum Slot {
    Obj(ObjBody),
    Forwarded(usize),
    Busy,
}

/// A GC invariant violation is a programming error: abort immediately rather
/// than continue with a possibly corrupt heap.
pub fn invariant_violation(msg: &str) -> ! {
    eprintln!("squill: heap invariant violated: {msg}");
    std::process::abort();
}

/// In-flight state of one collection: the old arena (source of copies) and
/// the new arena being filled.
pub struct Collector {
    from: Vec<Slot>,
    to: Vec<Slot>,
    copied: u64,
}

impl Collector {
    pub(crate) fn new(from: Vec<Slot>) -> Collector {
        let cap = from.len();
        Collector {
            from,
            to: Vec::with_capacity(cap),
            copied: 0,
        }
    }

    /// Forward one value: non-references (immediates, fixnums, transient
    /// stream indices) pass through untouched; a reference is replaced by its
    /// image in the destination arena, copying the object on first contact.
    pub fn forward(&mut self, v: Value) -> Value {
        if !v.is_object() {
            return v;
        }
        let idx = v.object_index();
        if idx >= self.from.len() {
            invariant_violation("reference outside the source arena");
        }
        match &self.from[idx] {
            Slot::Forwarded(new) => Value::object(*new),
            Slot::Obj(_) => {
                let new = self.to.len();
                let slot = mem::replace(&mut self.from[idx], Slot::Forwarded(new));
                let Slot::Obj(body) = slot else { unreachable!() };
                self.to.push(Slot::Obj(body));
                self.copied += 1;
                Value::object(new)
            }
            Slot::Busy => invariant_violation("forward hit a busy slot"),
        }
    }

    pub fn forward_frame(&mut self, frame: &mut StackFrame) {
        frame.code = self.forward(frame.code);
        frame.env = self.forward(frame.env);
        frame.rib = self.forward(frame.rib);
        frame.sfp = self.forward(frame.sfp);
        frame.wind = self.forward(frame.wind);
        frame.handler = self.forward(frame.handler);
    }

    pub fn forward_registers(&mut self, regs: &mut Registers) {
        regs.acc = self.forward(regs.acc);
        regs.gr1 = self.forward(regs.gr1);
        regs.gr2 = self.forward(regs.gr2);
        self.forward_frame(&mut regs.frame);
    }

    /// Fixing-references phase: linear scan of the destination arena,
    /// relocating each object's children through the ops table. New copies
    /// appended during the scan are themselves scanned before it ends.
    pub(crate) fn scan(&mut self) {
        let mut at = 0;
        while at < self.to.len() {
            let mut body = match mem::replace(&mut self.to[at], Slot::Busy) {
                Slot::Obj(body) => body,
                _ => invariant_violation("scan hit a non-object slot"),
            };
            (OBJ_OPS[body.tag() as usize].relocate)(&mut body, self);
            self.to[at] = Slot::Obj(body);
            at += 1;
        }
    }

    pub(crate) fn finish(self) -> (Vec<Slot>, u64) {
        // The old arena drops here; everything in it was garbage or has been
        // copied out.
        (self.to, self.copied)
    }
}

// ---------------------------------------------------------------------------
// Per-tag relocate rows
// ---------------------------------------------------------------------------

pub fn relocate_pair(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Pair { car, cdr } => {
            *car = c.forward(*car);
            *cdr = c.forward(*cdr);
        }
        _ => invariant_violation("relocate_pair on non-pair"),
    }
}

pub fn relocate_vector(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Vector(slots) => {
            for v in slots {
                *v = c.forward(*v);
            }
        }
        _ => invariant_violation("relocate_vector on non-vector"),
    }
}

/// Strings and symbols carry no references.
pub fn relocate_leaf(body: &mut ObjBody, _c: &mut Collector) {
    match body {
        ObjBody::Str(_) | ObjBody::Symbol(_) => {}
        _ => invariant_violation("relocate_leaf on referencing object"),
    }
}

pub fn relocate_code(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Code(words) => {
            // Instruction words are fixnums and pass through forward()
            // unchanged; only inline reference operands are rewritten.
            for w in words {
                *w = c.forward(*w);
            }
        }
        _ => invariant_violation("relocate_code on non-code"),
    }
}

pub fn relocate_lambda(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Lambda { code, env, .. } => {
            *code = c.forward(*code);
            *env = c.forward(*env);
        }
        _ => invariant_violation("relocate_lambda on non-lambda"),
    }
}

pub fn relocate_cps(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Cps { name, .. } => *name = c.forward(*name),
        _ => invariant_violation("relocate_cps on non-cps"),
    }
}

pub fn relocate_argframe(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::ArgFrame { slots, parent } => {
            for v in slots {
                *v = c.forward(*v);
            }
            *parent = c.forward(*parent);
        }
        _ => invariant_violation("relocate_argframe on non-argframe"),
    }
}

pub fn relocate_frame_obj(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Frame(frame) | ObjBody::Continuation(frame) => c.forward_frame(frame),
        _ => invariant_violation("relocate_frame_obj on non-frame"),
    }
}

pub fn relocate_wind(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Wind {
            before,
            after,
            prev,
        } => {
            *before = c.forward(*before);
            *after = c.forward(*after);
            *prev = c.forward(*prev);
        }
        _ => invariant_violation("relocate_wind on non-wind"),
    }
}

pub fn relocate_condition(body: &mut ObjBody, c: &mut Collector) {
    match body {
        ObjBody::Condition {
            kind,
            message,
            irritants,
        } => {
            *kind = c.forward(*kind);
            *message = c.forward(*message);
            for v in irritants {
                *v = c.forward(*v);
            }
        }
        _ => invariant_violation("relocate_condition on non-condition"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_ignores_non_references() {
        let mut c = Collector::new(Vec::new());
        for v in [
            Value::fixnum(7),
            Value::char('q'),
            Value::TRUE,
            Value::NIL,
            Value::BOTTOM,
            Value::stream_index(3),
        ] {
            assert_eq!(c.forward(v), v);
        }
    }

    #[test]
    fn forward_copies_once_and_preserves_identity() {
        let from = vec![Slot::Obj(ObjBody::Str("x".into()))];
        let mut c = Collector::new(from);
        let a = c.forward(Value::object(0));
        let b = c.forward(Value::object(0));
        assert_eq!(a, b);
        let (to, copied) = c.finish();
        assert_eq!(to.len(), 1);
        assert_eq!(copied, 1);
    }
}
