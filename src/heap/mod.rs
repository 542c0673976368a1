//! The shared heap: arena allocation, roots, interning, and collection.
//!
//! The heap owns every object's lifetime; in-heap references are traced arena
//! indices the collector rewrites, never owning pointers. Machine register
//! sets live in the heap's root table (one entry per registered machine), so
//! a collection triggered by any machine's allocation walks every machine's
//! roots — there is no way to forget one.

pub mod gc;
pub mod object;

use crate::value::Value;
use crate::vm::frame::Registers;
use crate::vm::stubs::Stubs;

use gc::{Collector, Slot};
use object::{ObjBody, ObjTag, OBJ_OPS};

use std::collections::HashMap;
use std::mem;

/// Collections are not attempted below this many live slots.
const MIN_GC_THRESHOLD: usize = 1 << 10;

/// Default hard cap on arena slots. Exceeding it after a collection is
/// resource exhaustion: fatal, no partial-result contract.
const DEFAULT_MAX_OBJECTS: usize = 1 << 26;

/// Counters mirrored into the debug log after every collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub allocations: u64,
    pub words_allocated: u64,
    pub collections: u64,
    pub copied_objects: u64,
    pub live_objects: usize,
}

pub struct Heap {
    arena: Vec<Slot>,
    /// Objects that survive every collection: interned symbols, canned
    /// built-in code. Append-only after startup.
    shared: Vec<Value>,
    /// Root table: the canonical register set of each registered machine.
    machines: Vec<Registers>,
    /// Interned symbol name → shared-list position. Positions are stable
    /// (the shared list is append-only), so no remapping at collection time.
    symbols: HashMap<String, usize>,
    /// Canned built-in code objects, as shared-list positions.
    pub(crate) stubs: Stubs,
    next_gc: usize,
    max_objects: usize,
    pub stats: GcStats,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_limits(MIN_GC_THRESHOLD, DEFAULT_MAX_OBJECTS)
    }

    /// A heap with a custom collection threshold and hard cap. Tests use a
    /// small threshold to force collections.
    pub fn with_limits(threshold: usize, max_objects: usize) -> Heap {
        object::verify_ops_table();
        let mut heap = Heap {
            arena: Vec::new(),
            shared: Vec::new(),
            machines: Vec::new(),
            symbols: HashMap::new(),
            stubs: Stubs::unlinked(),
            next_gc: threshold.max(2),
            max_objects,
            stats: GcStats::default(),
        };
        heap.stubs = crate::vm::stubs::install(&mut heap);
        heap
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate a heap object. `regs` is the calling machine's live register
    /// copy: it is both a root and a relocation target if this allocation
    /// triggers a collection.
    pub fn alloc(&mut self, body: ObjBody, regs: &mut Registers) -> Value {
        self.alloc_with_roots(body, regs, &mut Vec::new())
    }

    /// Allocate with additional temporary roots (relocated in place).
    /// For multi-step constructions whose intermediate references live in
    /// host locals rather than registers.
    pub fn alloc_with_roots(
        &mut self,
        body: ObjBody,
        regs: &mut Registers,
        extra: &mut Vec<Value>,
    ) -> Value {
        let v = self.push(body);
        if self.arena.len() >= self.next_gc {
            extra.push(v);
            self.collect(Some(regs), extra);
            let v = extra.pop().expect("collection kept the temporary root");
            if self.arena.len() >= self.max_objects {
                self.exhausted();
            }
            return v;
        }
        v
    }

    /// Push-only allocation: never collects. Used during startup (stub
    /// installation) and by the library reader, whose objects transiently
    /// hold `Index`-tagged words that must not meet a collection.
    pub fn alloc_pending(&mut self, body: ObjBody) -> Value {
        if self.arena.len() >= self.max_objects {
            self.exhausted();
        }
        self.push(body)
    }

    fn push(&mut self, body: ObjBody) -> Value {
        self.stats.allocations += 1;
        self.stats.words_allocated += (OBJ_OPS[body.tag() as usize].size_words)(&body) as u64;
        let idx = self.arena.len();
        self.arena.push(Slot::Obj(body));
        Value::object(idx)
    }

    fn exhausted(&self) -> ! {
        eprintln!(
            "squill: heap exhausted: {} objects live after collection (cap {})",
            self.arena.len(),
            self.max_objects
        );
        std::process::abort();
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Run a collection now. `extra` values are treated as roots and
    /// rewritten in place.
    pub fn collect(&mut self, caller: Option<&mut Registers>, extra: &mut [Value]) {
        let mut c = Collector::new(mem::take(&mut self.arena));

        // Scanning-Roots: every machine's registers, the caller's in-flight
        // copy, the shared list, and any temporaries.
        for regs in &mut self.machines {
            c.forward_registers(regs);
        }
        if let Some(regs) = caller {
            c.forward_registers(regs);
        }
        for v in &mut self.shared {
            *v = c.forward(*v);
        }
        for v in extra.iter_mut() {
            *v = c.forward(*v);
        }

        // Copying + Fixing-References, then swap.
        c.scan();
        let (to, copied) = c.finish();
        self.arena = to;

        self.stats.collections += 1;
        self.stats.copied_objects += copied;
        self.stats.live_objects = self.arena.len();
        self.next_gc = (self.arena.len() * 2)
            .max(MIN_GC_THRESHOLD.min(self.next_gc))
            .min(self.max_objects);
        log::debug!(
            "gc: collection {} copied {} objects, {} live, next at {}",
            self.stats.collections,
            copied,
            self.arena.len(),
            self.next_gc
        );
    }

    pub fn live_objects(&self) -> usize {
        self.arena.len()
    }

    // -----------------------------------------------------------------------
    // Machine roots and the shared list
    // -----------------------------------------------------------------------

    /// Register a machine's root-table entry; returns its id.
    pub fn register_machine(&mut self) -> usize {
        self.machines.push(Registers::new());
        self.machines.len() - 1
    }

    pub fn regs(&self, id: usize) -> Registers {
        self.machines[id]
    }

    /// Publish a machine's registers. Every machine does this before
    /// releasing the heap, so collections always see a consistent root set.
    pub fn set_regs(&mut self, id: usize, regs: Registers) {
        self.machines[id] = regs;
    }

    /// Pin a value on the shared list; it survives every collection.
    /// Returns its stable position.
    pub fn share(&mut self, v: Value) -> usize {
        self.shared.push(v);
        self.shared.len() - 1
    }

    pub fn shared_value(&self, pos: usize) -> Value {
        self.shared[pos]
    }

    // -----------------------------------------------------------------------
    // Object access
    // -----------------------------------------------------------------------

    pub fn body(&self, v: Value) -> &ObjBody {
        if !v.is_object() {
            gc::invariant_violation("dereferencing a non-reference value");
        }
        match &self.arena[v.object_index()] {
            Slot::Obj(body) => body,
            _ => gc::invariant_violation("dereferencing a forwarded slot"),
        }
    }

    pub fn body_mut(&mut self, v: Value) -> &mut ObjBody {
        if !v.is_object() {
            gc::invariant_violation("dereferencing a non-reference value");
        }
        match &mut self.arena[v.object_index()] {
            Slot::Obj(body) => body,
            _ => gc::invariant_violation("dereferencing a forwarded slot"),
        }
    }

    pub fn tag(&self, v: Value) -> ObjTag {
        self.body(v).tag()
    }

    pub fn is_a(&self, v: Value, tag: ObjTag) -> bool {
        v.is_object() && self.tag(v) == tag
    }

    // -----------------------------------------------------------------------
    // Symbols
    // -----------------------------------------------------------------------

    /// Intern a symbol: one heap object per distinct name, pinned on the
    /// shared list.
    pub fn intern(&mut self, name: &str, regs: &mut Registers) -> Value {
        self.intern_with_roots(name, regs, &mut Vec::new())
    }

    /// Intern while keeping `roots` relocatable across the allocation.
    pub fn intern_with_roots(
        &mut self,
        name: &str,
        regs: &mut Registers,
        roots: &mut Vec<Value>,
    ) -> Value {
        if let Some(&pos) = self.symbols.get(name) {
            return self.shared[pos];
        }
        let sym = self.alloc_with_roots(ObjBody::Symbol(name.to_string()), regs, roots);
        let pos = self.share(sym);
        self.symbols.insert(name.to_string(), pos);
        self.shared[pos]
    }

    /// Interning through the push-only path (startup and library reading).
    pub fn intern_pending(&mut self, name: &str) -> Value {
        if let Some(&pos) = self.symbols.get(name) {
            return self.shared[pos];
        }
        let sym = self.alloc_pending(ObjBody::Symbol(name.to_string()));
        let pos = self.share(sym);
        self.symbols.insert(name.to_string(), pos);
        sym
    }

    pub fn symbol_name(&self, v: Value) -> Option<&str> {
        if !v.is_object() {
            return None;
        }
        match self.body(v) {
            ObjBody::Symbol(s) => Some(s),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Structure helpers
    // -----------------------------------------------------------------------

    pub fn cons(&mut self, car: Value, cdr: Value, regs: &mut Registers) -> Value {
        self.alloc(ObjBody::Pair { car, cdr }, regs)
    }

    /// Build a proper list from a slice. Intermediates are rooted across the
    /// allocations.
    pub fn list(&mut self, items: &[Value], regs: &mut Registers) -> Value {
        let mut pending = items.to_vec();
        let mut tail = Value::NIL;
        while let Some(car) = pending.pop() {
            // The not-yet-consed items stay rooted through every allocation.
            tail = self.alloc_with_roots(ObjBody::Pair { car, cdr: tail }, regs, &mut pending);
        }
        tail
    }

    pub fn car(&self, v: Value) -> Option<Value> {
        if !v.is_object() {
            return None;
        }
        match self.body(v) {
            ObjBody::Pair { car, .. } => Some(*car),
            _ => None,
        }
    }

    pub fn cdr(&self, v: Value) -> Option<Value> {
        if !v.is_object() {
            return None;
        }
        match self.body(v) {
            ObjBody::Pair { cdr, .. } => Some(*cdr),
            _ => None,
        }
    }

    /// Collect a rib (argument list, last-pushed first) into evaluation
    /// order. Returns `None` on an improper chain.
    pub fn rib_to_vec(&self, rib: Value) -> Option<Vec<Value>> {
        let mut out = self.list_to_vec(rib)?;
        out.reverse();
        Some(out)
    }

    /// Collect a proper list in list order.
    pub fn list_to_vec(&self, list: Value) -> Option<Vec<Value>> {
        let mut out = Vec::new();
        let mut cur = list;
        while !cur.is_nil() {
            if !cur.is_object() {
                return None;
            }
            match self.body(cur) {
                ObjBody::Pair { car, cdr } => {
                    out.push(*car);
                    cur = *cdr;
                }
                _ => return None,
            }
        }
        Some(out)
    }

    /// Look up an environment slot by lexical address.
    pub fn env_slot(&self, env: Value, depth: usize, index: usize) -> Option<Value> {
        let mut cur = env;
        for _ in 0..depth {
            if !cur.is_object() {
                return None;
            }
            match self.body(cur) {
                ObjBody::ArgFrame { parent, .. } => cur = *parent,
                _ => return None,
            }
        }
        if !cur.is_object() {
            return None;
        }
        match self.body(cur) {
            ObjBody::ArgFrame { slots, .. } => slots.get(index).copied(),
            _ => None,
        }
    }

    /// Assign an environment slot by lexical address. Environment mutation is
    /// language semantics (`set!`); it is visible across continuation
    /// replays, by design of the language, not an accident.
    pub fn env_set(&mut self, env: Value, depth: usize, index: usize, v: Value) -> bool {
        let mut cur = env;
        for _ in 0..depth {
            if !cur.is_object() {
                return false;
            }
            match self.body(cur) {
                ObjBody::ArgFrame { parent, .. } => cur = *parent,
                _ => return false,
            }
        }
        if !cur.is_object() {
            return false;
        }
        match self.body_mut(cur) {
            ObjBody::ArgFrame { slots, .. } => match slots.get_mut(index) {
                Some(slot) => {
                    *slot = v;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn code_word(&self, code: Value, pc: usize) -> Option<Value> {
        match self.body(code) {
            ObjBody::Code(words) => words.get(pc).copied(),
            _ => None,
        }
    }

    pub fn code_len(&self, code: Value) -> Option<usize> {
        match self.body(code) {
            ObjBody::Code(words) => Some(words.len()),
            _ => None,
        }
    }

    /// Build a condition object. `irritants` are treated as roots and
    /// relocated in place if a collection runs.
    pub fn make_condition(
        &mut self,
        kind: &str,
        text: &str,
        irritants: &mut Vec<Value>,
        regs: &mut Registers,
    ) -> Value {
        let kind = self.intern_with_roots(kind, regs, irritants);
        irritants.push(kind);
        let message = self.alloc_with_roots(ObjBody::Str(text.to_string()), regs, irritants);
        let kind = match irritants.pop() {
            Some(kind) => kind,
            None => gc::invariant_violation("condition kind root vanished"),
        };
        self.alloc(
            ObjBody::Condition {
                kind,
                message,
                irritants: irritants.clone(),
            },
            regs,
        )
    }

    // -----------------------------------------------------------------------
    // Rendering (operator-facing; the language's output port lives elsewhere)
    // -----------------------------------------------------------------------

    pub fn render(&self, v: Value) -> String {
        let mut out = String::new();
        self.render_into(v, 8, &mut out);
        out
    }

    fn render_into(&self, v: Value, depth: usize, out: &mut String) {
        use std::fmt::Write as _;
        if depth == 0 {
            out.push('…');
            return;
        }
        if !v.is_object() {
            let _ = write!(out, "{v:?}");
            return;
        }
        match self.body(v) {
            ObjBody::Pair { .. } => {
                out.push('(');
                let mut cur = v;
                let mut first = true;
                let mut remaining = 32;
                loop {
                    match self.body(cur) {
                        ObjBody::Pair { car, cdr } => {
                            if !first {
                                out.push(' ');
                            }
                            first = false;
                            self.render_into(*car, depth - 1, out);
                            if remaining == 0 {
                                out.push_str(" …");
                                break;
                            }
                            remaining -= 1;
                            if cdr.is_nil() {
                                break;
                            }
                            if !cdr.is_object() || !matches!(self.body(*cdr), ObjBody::Pair { .. })
                            {
                                out.push_str(" . ");
                                self.render_into(*cdr, depth - 1, out);
                                break;
                            }
                            cur = *cdr;
                        }
                        _ => break,
                    }
                }
                out.push(')');
            }
            ObjBody::Vector(slots) => {
                out.push_str("#(");
                for (i, s) in slots.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.render_into(*s, depth - 1, out);
                }
                out.push(')');
            }
            ObjBody::Str(s) => {
                let _ = write!(out, "{s:?}");
            }
            ObjBody::Symbol(s) => out.push_str(s),
            ObjBody::Code(words) => {
                let _ = write!(out, "#<code {} words>", words.len());
            }
            ObjBody::Lambda { entry, arity, .. } => {
                let _ = write!(out, "#<lambda/{arity} @{entry}>");
            }
            ObjBody::Cps { name, .. } => {
                let name = self.symbol_name(*name).unwrap_or("?");
                let _ = write!(out, "#<builtin {name}>");
            }
            ObjBody::ArgFrame { slots, .. } => {
                let _ = write!(out, "#<env {} slots>", slots.len());
            }
            ObjBody::Frame(_) => out.push_str("#<frame>"),
            ObjBody::Continuation(_) => out.push_str("#<continuation>"),
            ObjBody::Wind { .. } => out.push_str("#<wind>"),
            ObjBody::Condition {
                kind, message, ..
            } => {
                let kind = self.symbol_name(*kind).unwrap_or("condition");
                let msg = match self.body(*message) {
                    ObjBody::Str(s) => s.as_str(),
                    _ => "?",
                };
                let _ = write!(out, "#<condition {kind}: {msg}>");
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_read_back() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let a = heap.alloc(ObjBody::Str("hello".into()), &mut regs);
        let b = heap.alloc(ObjBody::Str("world".into()), &mut regs);
        let pair = heap.cons(a, b, &mut regs);
        assert_eq!(heap.car(pair), Some(a));
        assert_eq!(heap.cdr(pair), Some(b));
        assert!(matches!(heap.body(a), ObjBody::Str(s) if s == "hello"));
    }

    #[test]
    fn collection_reclaims_unreachable() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        for i in 0..100 {
            let _ = heap.alloc(ObjBody::Str(format!("garbage-{i}")), &mut regs);
        }
        regs.acc = heap.alloc(ObjBody::Str("keep".into()), &mut regs);
        let before = heap.live_objects();
        heap.collect(Some(&mut regs), &mut []);
        assert!(heap.live_objects() < before);
        assert!(matches!(heap.body(regs.acc), ObjBody::Str(s) if s == "keep"));
    }

    #[test]
    fn collection_preserves_identity() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let shared = heap.alloc(ObjBody::Str("shared".into()), &mut regs);
        let left = heap.cons(shared, Value::NIL, &mut regs);
        let right = heap.cons(shared, Value::NIL, &mut regs);
        regs.gr1 = left;
        regs.gr2 = right;
        heap.collect(Some(&mut regs), &mut []);
        // Both pairs must still reference one object, not two copies.
        assert_eq!(heap.car(regs.gr1), heap.car(regs.gr2));
    }

    #[test]
    fn interning_deduplicates_and_survives_gc() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let a = heap.intern("lambda", &mut regs);
        let b = heap.intern("lambda", &mut regs);
        assert_eq!(a, b);
        heap.collect(Some(&mut regs), &mut []);
        let c = heap.intern("lambda", &mut regs);
        assert_eq!(heap.symbol_name(c), Some("lambda"));
        // Identity maintained across further collections via the shared list.
        heap.collect(Some(&mut regs), &mut []);
        let d = heap.intern("lambda", &mut regs);
        assert_eq!(c, d);
    }

    #[test]
    fn deep_list_survives_collection() {
        let mut heap = Heap::with_limits(64, 1 << 20);
        let mut regs = Registers::new();
        let items: Vec<Value> = (0..50).map(Value::fixnum).collect();
        regs.acc = heap.list(&items, &mut regs);
        heap.collect(Some(&mut regs), &mut []);
        let got = heap.list_to_vec(regs.acc).expect("proper list");
        assert_eq!(got, items);
    }

    #[test]
    fn env_lookup_and_assign() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let outer = heap.alloc(
            ObjBody::ArgFrame {
                slots: vec![Value::fixnum(10), Value::fixnum(20)],
                parent: Value::NIL,
            },
            &mut regs,
        );
        let inner = heap.alloc(
            ObjBody::ArgFrame {
                slots: vec![Value::fixnum(1)],
                parent: outer,
            },
            &mut regs,
        );
        assert_eq!(heap.env_slot(inner, 0, 0), Some(Value::fixnum(1)));
        assert_eq!(heap.env_slot(inner, 1, 1), Some(Value::fixnum(20)));
        assert!(heap.env_set(inner, 1, 0, Value::fixnum(99)));
        assert_eq!(heap.env_slot(inner, 1, 0), Some(Value::fixnum(99)));
        assert_eq!(heap.env_slot(inner, 2, 0), None);
    }

    #[test]
    fn structure_helpers_reject_immediates() {
        // Fixnums, nil, and booleans are valid inputs to the query helpers;
        // they answer None/false rather than tripping the reference check.
        let heap = Heap::new();
        for junk in [Value::fixnum(5), Value::NIL, Value::TRUE] {
            assert_eq!(heap.car(junk), None);
            assert_eq!(heap.cdr(junk), None);
            assert_eq!(heap.env_slot(junk, 0, 0), None);
            assert_eq!(heap.env_slot(junk, 3, 0), None);
        }
        let mut heap = heap;
        assert!(!heap.env_set(Value::fixnum(5), 0, 0, Value::NIL));
    }

    #[test]
    fn render_is_bounded() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let items: Vec<Value> = (0..100).map(Value::fixnum).collect();
        let l = heap.list(&items, &mut regs);
        let s = heap.render(l);
        assert!(s.starts_with('('));
        assert!(s.len() < 1024);
    }
}
