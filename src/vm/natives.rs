//! Built-in procedures.
//!
//! A native is a plain function the machine calls with the heap and the
//! calling machine's registers. Arguments arrive in an environment rib parked
//! in `gr2`, so a native that allocates can re-read them afterwards instead
//! of holding values across a collection. `gr1` is scratch, rooted the same
//! way. A native says how to continue through [`NativeFlow`]; control
//! operators redirect the machine rather than calling back into it, so no
//! native ever recurses into the instruction loop.

use std::collections::HashMap;

use crate::heap::object::ObjBody;
use crate::heap::Heap;
use crate::value::{fixnum_in_range, Value};
use crate::vm::frame::{Registers, StackFrame};

/// What the machine does after a native returns.
pub enum NativeFlow {
    /// Ordinary result: goes to the accumulator, then the saved frame.
    Return(Value),
    /// The native installed the next frame itself.
    Tail,
    /// Re-enter application: the accumulator holds the procedure and the
    /// frame's rib the arguments.
    Apply,
    /// Raise a pre-built condition value.
    Raise(Value),
    /// Raise a keyed built-in condition.
    Cond {
        kind: &'static str,
        irritants: Vec<Value>,
    },
}

pub type NativeFn = fn(&mut Heap, &mut Registers) -> NativeFlow;

pub struct NativeEntry {
    pub name: &'static str,
    /// Exact argument count; `None` is variadic and checks its own minimum.
    pub arity: Option<u8>,
    pub func: NativeFn,
}

/// The catalog of built-ins. Identifiers are positions in the entry table;
/// serialized built-ins carry their name and re-link through `id_of`.
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
    by_name: HashMap<&'static str, u16>,
}

impl NativeRegistry {
    pub fn standard() -> NativeRegistry {
        let mut r = NativeRegistry {
            entries: Vec::new(),
            by_name: HashMap::new(),
        };
        r.add("+", None, native_add);
        r.add("-", None, native_sub);
        r.add("*", None, native_mul);
        r.add("<", None, native_lt);
        r.add("=", None, native_num_eq);
        r.add("cons", Some(2), native_cons);
        r.add("car", Some(1), native_car);
        r.add("cdr", Some(1), native_cdr);
        r.add("pair?", Some(1), native_is_pair);
        r.add("null?", Some(1), native_is_null);
        r.add("eq?", Some(2), native_eq);
        r.add("not", Some(1), native_not);
        r.add("list", None, native_list);
        r.add("vector", None, native_vector);
        r.add("vector-ref", Some(2), native_vector_ref);
        r.add("vector-length", Some(1), native_vector_length);
        r.add("call-with-current-continuation", Some(1), native_callcc);
        r.add("call/cc", Some(1), native_callcc);
        r.add("dynamic-wind", Some(3), native_dynamic_wind);
        r.add("raise", Some(1), native_raise);
        r.add("with-exception-handler", Some(2), native_with_handler);
        r.add("apply", None, native_apply);
        r
    }

    /// No entries at all. Useful for consumers that resolve libraries against
    /// their own catalog.
    pub fn empty() -> NativeRegistry {
        NativeRegistry {
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    fn add(&mut self, name: &'static str, arity: Option<u8>, func: NativeFn) {
        let id = self.entries.len() as u16;
        self.entries.push(NativeEntry { name, arity, func });
        self.by_name.insert(name, id);
    }

    pub fn get(&self, id: u16) -> Option<&NativeEntry> {
        self.entries.get(id as usize)
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }
}

/// Wrap a registered native as a callable heap value.
pub fn cps_value(
    heap: &mut Heap,
    regs: &mut Registers,
    registry: &NativeRegistry,
    name: &str,
) -> Option<Value> {
    let id = registry.id_of(name)?;
    let sym = heap.intern(name, regs);
    Some(heap.alloc(ObjBody::Cps { native: id, name: sym }, regs))
}

/// An environment rib holding every built-in, in registry order. The demo
/// driver and the test suites use it as the base lexical scope.
pub fn global_env(heap: &mut Heap, regs: &mut Registers, registry: &NativeRegistry) -> Value {
    regs.gr1 = Value::NIL;
    for id in (0..registry.len()).rev() {
        let name = registry.entries[id].name;
        let sym = heap.intern(name, regs);
        let cps = heap.alloc(
            ObjBody::Cps {
                native: id as u16,
                name: sym,
            },
            regs,
        );
        regs.gr1 = heap.cons(cps, regs.gr1, regs);
    }
    let slots = heap
        .list_to_vec(regs.gr1)
        .unwrap_or_default();
    regs.gr1 = Value::NIL;
    heap.alloc(
        ObjBody::ArgFrame {
            slots,
            parent: Value::NIL,
        },
        regs,
    )
}

// ---------------------------------------------------------------------------
// Argument access
// ---------------------------------------------------------------------------

fn argc(heap: &Heap, regs: &Registers) -> usize {
    match heap.body(regs.gr2) {
        ObjBody::ArgFrame { slots, .. } => slots.len(),
        _ => 0,
    }
}

/// Re-reads from the rooted rib, so it stays correct after an allocation.
fn arg(heap: &Heap, regs: &Registers, i: usize) -> Value {
    match heap.body(regs.gr2) {
        ObjBody::ArgFrame { slots, .. } => slots.get(i).copied().unwrap_or(Value::UNSPECIFIED),
        _ => Value::UNSPECIFIED,
    }
}

fn wrong_type(v: Value) -> NativeFlow {
    NativeFlow::Cond {
        kind: "err.type",
        irritants: vec![v],
    }
}

fn too_few(n: usize) -> NativeFlow {
    NativeFlow::Cond {
        kind: "err.arity",
        irritants: vec![Value::fixnum(n as i64)],
    }
}

fn fixnum_arg(heap: &Heap, regs: &Registers, i: usize) -> Result<i64, NativeFlow> {
    let v = arg(heap, regs, i);
    if v.is_fixnum() {
        Ok(v.as_fixnum())
    } else {
        Err(wrong_type(v))
    }
}

// ---------------------------------------------------------------------------
// Arithmetic and comparison
// ---------------------------------------------------------------------------

fn native_add(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let n = argc(heap, regs);
    let mut acc: i64 = 0;
    for i in 0..n {
        let x = match fixnum_arg(heap, regs, i) {
            Ok(x) => x,
            Err(flow) => return flow,
        };
        match acc.checked_add(x).filter(|s| fixnum_in_range(*s)) {
            Some(s) => acc = s,
            None => {
                return NativeFlow::Cond {
                    kind: "err.overflow",
                    irritants: vec![],
                }
            }
        }
    }
    NativeFlow::Return(Value::fixnum(acc))
}

fn native_sub(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let n = argc(heap, regs);
    if n == 0 {
        return too_few(0);
    }
    let first = match fixnum_arg(heap, regs, 0) {
        Ok(x) => x,
        Err(flow) => return flow,
    };
    if n == 1 {
        // Negating the most negative fixnum leaves the range.
        return match first.checked_neg().filter(|s| fixnum_in_range(*s)) {
            Some(s) => NativeFlow::Return(Value::fixnum(s)),
            None => NativeFlow::Cond {
                kind: "err.overflow",
                irritants: vec![],
            },
        };
    }
    let mut acc = first;
    for i in 1..n {
        let x = match fixnum_arg(heap, regs, i) {
            Ok(x) => x,
            Err(flow) => return flow,
        };
        match acc.checked_sub(x).filter(|s| fixnum_in_range(*s)) {
            Some(s) => acc = s,
            None => {
                return NativeFlow::Cond {
                    kind: "err.overflow",
                    irritants: vec![],
                }
            }
        }
    }
    NativeFlow::Return(Value::fixnum(acc))
}

fn native_mul(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let n = argc(heap, regs);
    let mut acc: i128 = 1;
    for i in 0..n {
        let x = match fixnum_arg(heap, regs, i) {
            Ok(x) => x,
            Err(flow) => return flow,
        };
        acc *= x as i128;
        if acc < -(1_i128 << 61) || acc >= (1_i128 << 61) {
            return NativeFlow::Cond {
                kind: "err.overflow",
                irritants: vec![],
            };
        }
    }
    NativeFlow::Return(Value::fixnum(acc as i64))
}

fn chain_compare(
    heap: &mut Heap,
    regs: &mut Registers,
    cmp: fn(i64, i64) -> bool,
) -> NativeFlow {
    let n = argc(heap, regs);
    if n < 2 {
        return too_few(n);
    }
    let mut prev = match fixnum_arg(heap, regs, 0) {
        Ok(x) => x,
        Err(flow) => return flow,
    };
    for i in 1..n {
        let x = match fixnum_arg(heap, regs, i) {
            Ok(x) => x,
            Err(flow) => return flow,
        };
        if !cmp(prev, x) {
            return NativeFlow::Return(Value::FALSE);
        }
        prev = x;
    }
    NativeFlow::Return(Value::TRUE)
}

fn native_lt(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    chain_compare(heap, regs, |a, b| a < b)
}

fn native_num_eq(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    chain_compare(heap, regs, |a, b| a == b)
}

// ---------------------------------------------------------------------------
// Pairs, vectors, predicates
// ---------------------------------------------------------------------------

fn native_cons(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let car = arg(heap, regs, 0);
    let cdr = arg(heap, regs, 1);
    NativeFlow::Return(heap.alloc(ObjBody::Pair { car, cdr }, regs))
}

fn native_car(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let v = arg(heap, regs, 0);
    match heap.car(v) {
        Some(car) => NativeFlow::Return(car),
        None => wrong_type(v),
    }
}

fn native_cdr(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let v = arg(heap, regs, 0);
    match heap.cdr(v) {
        Some(cdr) => NativeFlow::Return(cdr),
        None => wrong_type(v),
    }
}

fn native_is_pair(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let v = arg(heap, regs, 0);
    NativeFlow::Return(Value::bool(heap.car(v).is_some()))
}

fn native_is_null(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    NativeFlow::Return(Value::bool(arg(heap, regs, 0).is_nil()))
}

fn native_eq(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    // Identity: bit equality covers fixnums, immediates, and object handles.
    NativeFlow::Return(Value::bool(arg(heap, regs, 0) == arg(heap, regs, 1)))
}

fn native_not(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    NativeFlow::Return(Value::bool(!arg(heap, regs, 0).is_truthy()))
}

fn native_list(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let slots = match heap.body(regs.gr2) {
        ObjBody::ArgFrame { slots, .. } => slots.clone(),
        _ => Vec::new(),
    };
    NativeFlow::Return(heap.list(&slots, regs))
}

fn native_vector(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let slots = match heap.body(regs.gr2) {
        ObjBody::ArgFrame { slots, .. } => slots.clone(),
        _ => Vec::new(),
    };
    NativeFlow::Return(heap.alloc(ObjBody::Vector(slots), regs))
}

fn native_vector_ref(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let v = arg(heap, regs, 0);
    let i = match fixnum_arg(heap, regs, 1) {
        Ok(i) => i,
        Err(flow) => return flow,
    };
    if !v.is_object() {
        return wrong_type(v);
    }
    match heap.body(v) {
        ObjBody::Vector(slots) => match usize::try_from(i).ok().and_then(|i| slots.get(i)) {
            Some(x) => NativeFlow::Return(*x),
            None => NativeFlow::Cond {
                kind: "err.index",
                irritants: vec![v, Value::fixnum(i)],
            },
        },
        _ => wrong_type(v),
    }
}

fn native_vector_length(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let v = arg(heap, regs, 0);
    if !v.is_object() {
        return wrong_type(v);
    }
    match heap.body(v) {
        ObjBody::Vector(slots) => NativeFlow::Return(Value::fixnum(slots.len() as i64)),
        _ => wrong_type(v),
    }
}

// ---------------------------------------------------------------------------
// Control operators
// ---------------------------------------------------------------------------

fn native_callcc(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    // The continuation of this call is the frame the caller saved. At the
    // bottom, it is "halt with the delivered value".
    let saved = if regs.frame.sfp.is_bottom() {
        let mut f = StackFrame::bottom();
        f.code = heap.shared_value(heap.stubs.returner);
        f.wind = regs.frame.wind;
        f
    } else {
        match heap.body(regs.frame.sfp) {
            ObjBody::Frame(f) => *f,
            _ => {
                return NativeFlow::Cond {
                    kind: "err.code",
                    irritants: vec![],
                }
            }
        }
    };
    let k = heap.alloc(ObjBody::Continuation(saved), regs);
    regs.frame.rib = heap.cons(k, Value::NIL, regs);
    regs.acc = arg(heap, regs, 0);
    NativeFlow::Apply
}

fn native_dynamic_wind(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let env = heap.alloc(
        ObjBody::ArgFrame {
            // before, thunk, after, plus a slot for the thunk's value.
            slots: vec![
                arg(heap, regs, 0),
                arg(heap, regs, 1),
                arg(heap, regs, 2),
                Value::UNSPECIFIED,
            ],
            parent: Value::NIL,
        },
        regs,
    );
    regs.frame.code = heap.shared_value(heap.stubs.wind_seq);
    regs.frame.pc = 0;
    regs.frame.env = env;
    regs.frame.rib = Value::NIL;
    NativeFlow::Tail
}

fn native_raise(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    NativeFlow::Raise(arg(heap, regs, 0))
}

fn native_with_handler(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    // The handler rides on a pass-through frame spliced under the thunk: a
    // normal return steps over it (one `return` instruction), and a raise
    // anywhere in the thunk's extent finds it on the sfp walk, along with
    // the wind chain as of installation.
    let guard = StackFrame {
        code: heap.shared_value(heap.stubs.returner),
        pc: 0,
        env: Value::NIL,
        rib: Value::NIL,
        sfp: regs.frame.sfp,
        wind: regs.frame.wind,
        handler: arg(heap, regs, 0),
    };
    let obj = heap.alloc(ObjBody::Frame(guard), regs);
    regs.frame.sfp = obj;
    regs.frame.rib = Value::NIL;
    regs.acc = arg(heap, regs, 1);
    NativeFlow::Apply
}

fn native_apply(heap: &mut Heap, regs: &mut Registers) -> NativeFlow {
    let n = argc(heap, regs);
    if n < 2 {
        return too_few(n);
    }
    // Spread: direct arguments, then the trailing proper list.
    let mut items: Vec<Value> = Vec::new();
    for i in 1..n - 1 {
        items.push(arg(heap, regs, i));
    }
    let mut rest = arg(heap, regs, n - 1);
    while !rest.is_nil() {
        match heap.car(rest) {
            Some(car) => {
                items.push(car);
                rest = match heap.cdr(rest) {
                    Some(cdr) => cdr,
                    None => return wrong_type(rest),
                };
            }
            None => return wrong_type(rest),
        }
    }
    // Park the spread items on the heap so rebuilding the rib can allocate.
    regs.gr1 = heap.alloc(ObjBody::Vector(items), regs);
    regs.frame.rib = Value::NIL;
    let count = match heap.body(regs.gr1) {
        ObjBody::Vector(slots) => slots.len(),
        _ => 0,
    };
    for i in 0..count {
        let item = match heap.body(regs.gr1) {
            ObjBody::Vector(slots) => slots[i],
            _ => Value::UNSPECIFIED,
        };
        regs.frame.rib = heap.cons(item, regs.frame.rib, regs);
    }
    regs.gr1 = Value::NIL;
    regs.acc = arg(heap, regs, 0);
    NativeFlow::Apply
}
