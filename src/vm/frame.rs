//! Call frames and the machine register set.
//!
//! The active frame is held *by value* in the register set; pushing a call
//! saves a copy of it into the heap (`ObjBody::Frame`) and links the new
//! active frame to that copy through `sfp`. Saved frames are never mutated,
//! which is what makes continuation capture a single struct copy: the chain
//! below the capture point is shared, immutable, and heap-resident.

use crate::value::Value;

/// One call frame. `Copy` on purpose: saving, restoring, and capturing a
/// frame are all plain struct copies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StackFrame {
    /// Code object being executed (`NIL` before the machine is primed).
    pub code: Value,
    /// Program counter: index into the code object's word array.
    pub pc: usize,
    /// Environment rib chain (`ArgFrame` ref or `NIL`).
    pub env: Value,
    /// Argument accumulation list for the call being built (Pair chain,
    /// last-pushed first, or `NIL`). Fresh per call site — never mutated in
    /// place, so sharing it with captured continuations is sound.
    pub rib: Value,
    /// Parent saved frame (`Frame` ref), or the bottom-of-stack sentinel.
    pub sfp: Value,
    /// Innermost active `dynamic-wind` extent (`Wind` ref or `NIL`).
    pub wind: Value,
    /// Exception handler installed on this frame (`NIL` when none).
    pub handler: Value,
}

impl StackFrame {
    /// A frame with nothing above the bottom sentinel.
    pub fn bottom() -> StackFrame {
        StackFrame {
            code: Value::NIL,
            pc: 0,
            env: Value::NIL,
            rib: Value::NIL,
            sfp: Value::BOTTOM,
            wind: Value::NIL,
            handler: Value::NIL,
        }
    }

    pub fn each_child(&self, f: &mut dyn FnMut(Value)) {
        f(self.code);
        f(self.env);
        f(self.rib);
        f(self.sfp);
        f(self.wind);
        f(self.handler);
    }
}

/// The register set of one machine. Register sets live in the heap's root
/// table so that every collection, no matter which machine triggered it,
/// walks every machine's roots.
#[derive(Clone, Copy, Debug)]
pub struct Registers {
    /// Primary value register: operands land here, returns deliver here.
    pub acc: Value,
    /// General registers used to shuttle values across dispatch steps.
    pub gr1: Value,
    pub gr2: Value,
    /// The active frame, by value.
    pub frame: StackFrame,
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            acc: Value::UNSPECIFIED,
            gr1: Value::UNSPECIFIED,
            gr2: Value::UNSPECIFIED,
            frame: StackFrame::bottom(),
        }
    }

    pub fn each_child(&self, f: &mut dyn FnMut(Value)) {
        f(self.acc);
        f(self.gr1);
        f(self.gr2);
        self.frame.each_child(f);
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}
