//! Non-local control transfer: continuation invocation and condition raising.
//!
//! Both operations are the same mechanism — leave the current dynamic extent,
//! run the `dynamic-wind` thunks the crossing requires, land somewhere else.
//! Neither recurses into the host. The wind thunks to run are planned up
//! front, then expressed as a chain of stub frames (see `stubs`) that the
//! ordinary instruction loop executes; a thunk that itself captures a
//! continuation or raises mid-chain just nests.

use crate::heap::gc::invariant_violation;
use crate::heap::object::ObjBody;
use crate::heap::Heap;
use crate::value::Value;
use crate::vm::frame::{Registers, StackFrame};

/// Wind markers from `w` out to the root, innermost first.
fn wind_chain(heap: &Heap, mut w: Value) -> Vec<Value> {
    let mut out = Vec::new();
    while !w.is_nil() {
        out.push(w);
        match heap.body(w) {
            ObjBody::Wind { prev, .. } => w = *prev,
            _ => invariant_violation("wind chain holds a non-wind object"),
        }
    }
    out
}

/// Plan the crossing from the extent `cur` to the extent `target`: markers to
/// exit (innermost first, their `after` thunks run in that order) and markers
/// to enter (outermost first, their `before` thunks run in that order).
pub(crate) fn wind_diff(heap: &Heap, cur: Value, target: Value) -> (Vec<Value>, Vec<Value>) {
    let mut exits = wind_chain(heap, cur);
    let mut enters = wind_chain(heap, target);
    while let (Some(a), Some(b)) = (exits.last(), enters.last()) {
        if a != b {
            break;
        }
        exits.pop();
        enters.pop();
    }
    enters.reverse();
    (exits, enters)
}

/// Pop the top three roots [thunk, wind-marker, next-sfp] and build a frame
/// that tail-applies the thunk, returning into `next-sfp`. The frame's wind
/// is the marker's parent: an after runs with its extent already left, a
/// before with its extent not yet entered.
fn thunk_frame(heap: &mut Heap, regs: &mut Registers, roots: &mut Vec<Value>) -> StackFrame {
    let n = roots.len();
    let env = heap.alloc_with_roots(
        ObjBody::ArgFrame {
            slots: vec![roots[n - 3]],
            parent: Value::NIL,
        },
        regs,
        roots,
    );
    let marker = roots[n - 2];
    let sfp = roots[n - 1];
    roots.truncate(n - 3);
    let wind = match heap.body(marker) {
        ObjBody::Wind { prev, .. } => *prev,
        _ => invariant_violation("wind chain holds a non-wind object"),
    };
    StackFrame {
        code: heap.shared_value(heap.stubs.apply_thunk),
        pc: 0,
        env,
        rib: Value::NIL,
        sfp,
        wind,
        handler: Value::NIL,
    }
}

/// Install the crossing as the active frame. `roots` holds, from the bottom:
/// the exit markers (exit order), the enter markers (enter order), and on top
/// a heap frame for the landing site. Thunk frames are chained landing-site
/// first, so the frame left in the registers is the first thunk to run (or
/// the landing site itself when the crossing is empty).
fn install_crossing(
    heap: &mut Heap,
    regs: &mut Registers,
    roots: &mut Vec<Value>,
    exit_count: usize,
    enter_count: usize,
    base: usize,
) {
    debug_assert_eq!(roots.len(), base + exit_count + enter_count + 1);
    for i in (0..exit_count + enter_count).rev() {
        let marker = roots[base + i];
        let thunk = match heap.body(marker) {
            ObjBody::Wind { before, after, .. } => {
                if i < exit_count {
                    *after
                } else {
                    *before
                }
            }
            _ => invariant_violation("wind chain holds a non-wind object"),
        };
        let next = roots.pop().unwrap_or(Value::BOTTOM);
        roots.push(thunk);
        roots.push(marker);
        roots.push(next);
        let frame = thunk_frame(heap, regs, roots);
        if i == 0 {
            regs.frame = frame;
            roots.pop();
            return;
        }
        let obj = heap.alloc_with_roots(ObjBody::Frame(frame), regs, roots);
        roots.pop();
        roots.push(obj);
    }
    // Empty crossing: the landing site runs directly.
    let site = roots.pop().unwrap_or(Value::BOTTOM);
    match heap.body(site) {
        ObjBody::Frame(f) => regs.frame = *f,
        _ => invariant_violation("crossing landing site is not a frame"),
    }
}

/// Invoke a captured continuation with a value. Runs the wind crossing, then
/// a `resume` stub reinstates the captured frame and delivers the value.
pub(crate) fn invoke_continuation(heap: &mut Heap, regs: &mut Registers, k: Value, v: Value) {
    let target = match heap.body(k) {
        ObjBody::Continuation(f) => *f,
        _ => invariant_violation("invoking a non-continuation"),
    };
    let (exits, enters) = wind_diff(heap, regs.frame.wind, target.wind);
    if exits.is_empty() && enters.is_empty() {
        regs.frame = target;
        regs.acc = v;
        return;
    }

    let mut roots: Vec<Value> = Vec::with_capacity(exits.len() + enters.len() + 3);
    let exit_count = exits.len();
    let enter_count = enters.len();
    roots.extend(exits);
    roots.extend(enters);
    roots.push(k);
    roots.push(v);
    let n = roots.len();
    let env = heap.alloc_with_roots(
        ObjBody::ArgFrame {
            slots: vec![roots[n - 2], roots[n - 1]],
            parent: Value::NIL,
        },
        regs,
        &mut roots,
    );
    let target_wind = match heap.body(roots[n - 2]) {
        ObjBody::Continuation(f) => f.wind,
        _ => invariant_violation("invoking a non-continuation"),
    };
    roots.truncate(n - 2);
    let landing = StackFrame {
        code: heap.shared_value(heap.stubs.resume),
        pc: 0,
        env,
        rib: Value::NIL,
        // Never returned through; resume replaces the whole frame.
        sfp: Value::BOTTOM,
        wind: target_wind,
        handler: Value::NIL,
    };
    let site = heap.alloc_with_roots(ObjBody::Frame(landing), regs, &mut roots);
    roots.push(site);
    install_crossing(heap, regs, &mut roots, exit_count, enter_count, 0);
}

/// Raise a condition: find the nearest enclosing frame with a handler, run
/// the afters of every extent being left, then tail-apply the handler to the
/// condition. The handler runs in its installer's dynamic extent with the
/// handler slot cleared, so a raise inside it reaches the next handler out.
/// With no handler anywhere the condition comes back as `Err` and the machine
/// faults.
pub(crate) fn raise(heap: &mut Heap, regs: &mut Registers, cond: Value) -> Result<(), Value> {
    let found = find_handler(heap, &regs.frame);
    let Some((handler, hsfp, hwind)) = found else {
        return Err(cond);
    };

    let (exits, enters) = wind_diff(heap, regs.frame.wind, hwind);
    debug_assert!(enters.is_empty(), "handler extent encloses the raise point");

    let mut roots: Vec<Value> = Vec::with_capacity(exits.len() + 4);
    let exit_count = exits.len();
    roots.extend(exits);
    roots.push(handler);
    roots.push(cond);
    roots.push(hsfp);
    roots.push(hwind);
    let n = roots.len();
    let env = heap.alloc_with_roots(
        ObjBody::ArgFrame {
            slots: vec![roots[n - 4], roots[n - 3]],
            parent: Value::NIL,
        },
        regs,
        &mut roots,
    );
    let hwind = roots[n - 1];
    let hsfp = roots[n - 2];
    roots.truncate(n - 4);
    let landing = StackFrame {
        code: heap.shared_value(heap.stubs.handle),
        pc: 0,
        env,
        rib: Value::NIL,
        sfp: hsfp,
        wind: hwind,
        handler: Value::NIL,
    };
    if exit_count == 0 {
        regs.frame = landing;
        return Ok(());
    }
    let site = heap.alloc_with_roots(ObjBody::Frame(landing), regs, &mut roots);
    roots.push(site);
    install_crossing(heap, regs, &mut roots, exit_count, 0, 0);
    Ok(())
}

/// Nearest frame (the active one included) with a handler installed. Returns
/// the handler plus the sfp and wind the handler should run under.
fn find_handler(heap: &Heap, frame: &StackFrame) -> Option<(Value, Value, Value)> {
    if !frame.handler.is_nil() {
        return Some((frame.handler, frame.sfp, frame.wind));
    }
    let mut cur = frame.sfp;
    while !cur.is_bottom() {
        match heap.body(cur) {
            ObjBody::Frame(f) => {
                if !f.handler.is_nil() {
                    return Some((f.handler, f.sfp, f.wind));
                }
                cur = f.sfp;
            }
            _ => invariant_violation("frame chain holds a non-frame object"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(heap: &mut Heap, regs: &mut Registers, prev: Value) -> Value {
        heap.alloc(
            ObjBody::Wind {
                before: Value::NIL,
                after: Value::NIL,
                prev,
            },
            regs,
        )
    }

    #[test]
    fn diff_strips_the_common_suffix() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let shared = mark(&mut heap, &mut regs, Value::NIL);
        regs.gr1 = shared;
        let prev = regs.gr1;
        let a = mark(&mut heap, &mut regs, prev);
        regs.gr2 = a;
        let prev = regs.gr1;
        let b = mark(&mut heap, &mut regs, prev);
        regs.acc = b;

        let (exits, enters) = wind_diff(&heap, regs.gr2, regs.acc);
        assert_eq!(exits, vec![regs.gr2]);
        assert_eq!(enters, vec![regs.acc]);
    }

    #[test]
    fn diff_to_an_enclosing_extent_only_exits() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let outer = mark(&mut heap, &mut regs, Value::NIL);
        regs.gr1 = outer;
        let prev = regs.gr1;
        let inner = mark(&mut heap, &mut regs, prev);
        regs.gr2 = inner;

        let (exits, enters) = wind_diff(&heap, regs.gr2, regs.gr1);
        assert_eq!(exits, vec![regs.gr2]);
        assert!(enters.is_empty());

        let (exits, enters) = wind_diff(&heap, regs.gr2, Value::NIL);
        assert_eq!(exits, vec![regs.gr2, regs.gr1]);
        assert!(enters.is_empty());
    }

    #[test]
    fn no_handler_reports_the_condition() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let mut irritants = Vec::new();
        let cond = heap.make_condition("err.raise", "boom", &mut irritants, &mut regs);
        assert_eq!(raise(&mut heap, &mut regs, cond), Err(cond));
    }
}
